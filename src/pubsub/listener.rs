use super::Notification;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::network::{Backend, Interrupt};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Ends a [`Listener`] from any thread
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    interrupter: Arc<dyn Interrupt>,
}

impl StopHandle {
    fn new(interrupter: Arc<dyn Interrupt>) -> Self {
        Self {
            stopped: Arc::new(AtomicBool::new(false)),
            interrupter,
        }
    }

    /// Ask the listener to finish; its next item is `None`
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.interrupter.interrupt() {
            debug!("Failed to interrupt listener: {}", e);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Blocking sequence of notifications for the subscribed channels
///
/// Notifications are filtered against the subscription set when they are
/// handed out, so a channel unsubscribed from another thread stops
/// producing items immediately even if some were already received.
/// After an error the sequence is finished.
pub struct Listener<B: Backend> {
    client: Client<B>,
    queue: VecDeque<Notification>,
    stop: StopHandle,
    done: bool,
}

impl<B: Backend> Listener<B> {
    pub(crate) fn new(client: Client<B>) -> Result<Self> {
        if client
            .shared
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyListening);
        }

        let stop = StopHandle::new(Arc::clone(&client.shared.interrupter));
        Ok(Self {
            client,
            queue: VecDeque::new(),
            stop,
            done: false,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Wait for and drain notifications from the backend.
    ///
    /// The lock is held for at most one poll interval and released fairly,
    /// so a control thread that interrupted the wait gets it next.
    fn fill(&mut self) -> Result<()> {
        let shared = &*self.client.shared;
        let mut session = shared.session.lock();

        if !session.backend.has_pending_notifications()
            && shared.contenders.load(Ordering::Acquire) == 0
            && !self.stop.is_stopped()
        {
            session.backend.wait_for_activity(shared.poll_interval)?;
        }
        let batch = session.backend.drain_notifications()?;
        MutexGuard::unlock_fair(session);

        if batch.is_empty() {
            trace!("Spurious wake");
            if shared.contenders.load(Ordering::Acquire) > 0 {
                thread::yield_now();
            }
        } else {
            trace!("Drained {} notifications", batch.len());
            self.queue.extend(batch);
        }
        Ok(())
    }

    fn is_subscribed(&self, channel: &str) -> bool {
        self.client.shared.session.lock().channels.contains(channel)
    }
}

impl<B: Backend> Iterator for Listener<B> {
    type Item = Result<Notification>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.stop.is_stopped() {
                return None;
            }

            if let Some(notification) = self.queue.pop_front() {
                if self.is_subscribed(notification.channel()) {
                    return Some(Ok(notification));
                }
                debug!(
                    "Discarding notification for unsubscribed channel {:?}",
                    notification.channel()
                );
                continue;
            }

            if let Err(e) = self.fill() {
                self.done = true;
                self.queue.clear();
                if e.is_connection_error() {
                    warn!("Listener stopped: {}", e);
                }
                return Some(Err(e));
            }
        }
    }
}

impl<B: Backend> std::iter::FusedIterator for Listener<B> {}

impl<B: Backend> Drop for Listener<B> {
    fn drop(&mut self) {
        self.client.shared.listening.store(false, Ordering::Release);
    }
}

/// A [`Listener`] running on its own thread
///
/// Items arrive on [`receiver`](Self::receiver). Dropping the handle stops
/// the thread and waits for it.
pub struct BackgroundListener {
    receiver: Receiver<Result<Notification>>,
    stop: StopHandle,
    handle: Option<JoinHandle<()>>,
    poll_interval: Duration,
}

impl BackgroundListener {
    pub(crate) fn spawn<B>(listener: Listener<B>, capacity: usize) -> Result<Self>
    where
        B: Backend + 'static,
    {
        let (sender, receiver) = bounded(capacity);
        let stop = listener.stop_handle();
        let poll_interval = listener.client.shared.poll_interval;

        let handle = thread::Builder::new()
            .name("pg-pubsub-listener".to_string())
            .spawn(move || {
                for item in listener {
                    if sender.send(item).is_err() {
                        debug!("Receiver dropped, stopping background listener");
                        break;
                    }
                }
            })?;

        Ok(Self {
            receiver,
            stop,
            handle: Some(handle),
            poll_interval,
        })
    }

    pub fn receiver(&self) -> &Receiver<Result<Notification>> {
        &self.receiver
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Stop the thread and wait for it to exit
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            // Discard items so a send blocked on a full channel returns;
            // the sender is dropped when the thread exits.
            loop {
                match self.receiver.recv_timeout(self.poll_interval) {
                    Ok(_) => {}
                    Err(RecvTimeoutError::Timeout) => {
                        trace!("Background listener still running");
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            if handle.join().is_err() {
                warn!("Background listener thread panicked");
            }
        }
    }
}

impl Drop for BackgroundListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
