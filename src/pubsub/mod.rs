//! LISTEN/NOTIFY subscriptions over one session.
//!
//! Subscription state lives in the session itself, so every [`PubSub`]
//! obtained from the same [`Client`] sees and mutates one channel set.
//! Mutations are safe while a [`Listener`] is blocked on the socket: the
//! caller interrupts the wait before taking the session lock.

mod listener;
mod manager;
mod message;

pub use listener::{BackgroundListener, Listener, StopHandle};
pub use message::Notification;

use crate::client::Client;
use crate::error::Result;
use crate::network::{Backend, Connection};
use manager::validated;

/// Subscription handle; cheap to clone and shareable across threads
pub struct PubSub<B: Backend = Connection> {
    client: Client<B>,
}

impl<B: Backend> Clone for PubSub<B> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<B: Backend> PubSub<B> {
    pub(crate) fn new(client: Client<B>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client<B> {
        &self.client
    }

    /// Subscribe to every channel in `channels`.
    ///
    /// Already subscribed names are skipped. Nothing is sent if any name is
    /// invalid.
    pub fn subscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels = validated(channels)?;
        if channels.is_empty() {
            return Ok(());
        }
        self.client.lock().listen(channels)?;
        Ok(())
    }

    pub fn subscribe_one(&self, channel: &str) -> Result<()> {
        self.subscribe([channel])
    }

    /// Unsubscribe from every channel in `channels`; names not subscribed
    /// are ignored.
    pub fn unsubscribe<I, S>(&self, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels = validated(channels)?;
        if channels.is_empty() {
            return Ok(());
        }
        self.client.lock().unlisten(channels)?;
        Ok(())
    }

    pub fn unsubscribe_one(&self, channel: &str) -> Result<()> {
        self.unsubscribe([channel])
    }

    /// Drop every subscription with a single `UNLISTEN *`
    pub fn unsubscribe_all(&self) -> Result<()> {
        self.client.lock().unlisten_all()?;
        Ok(())
    }

    /// Sorted snapshot of the subscribed channels
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.client.lock().channels.iter().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.client.lock().channels.contains(channel)
    }

    /// Start reading notifications on the calling thread.
    ///
    /// Only one listener may exist per session; a second call fails with
    /// `AlreadyListening` until the first is dropped.
    pub fn listen(&self) -> Result<Listener<B>> {
        Listener::new(self.client.clone())
    }
}

impl<B: Backend + 'static> PubSub<B> {
    /// Run a listener on a dedicated thread, forwarding items over a
    /// channel bounded to `capacity`.
    pub fn listen_in_background(&self, capacity: usize) -> Result<BackgroundListener> {
        BackgroundListener::spawn(self.listen()?, capacity)
    }
}
