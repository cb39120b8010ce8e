mod connection;
mod row;

pub use connection::Connection;
pub use row::{QueryResult, Row};

use crate::error::Result;
use crate::protocol::ServerError;
use crate::pubsub::Notification;
use std::sync::Arc;
use std::time::Duration;

/// Wakes a thread blocked in [`Backend::wait_for_activity`].
///
/// Called without holding the backend's lock.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self) -> std::io::Result<()>;
}

impl Interrupt for mio::Waker {
    fn interrupt(&self) -> std::io::Result<()> {
        self.wake()
    }
}

/// A database session as seen by the client and the listener loop.
///
/// Implementations are not required to be thread-safe; `Client` serializes
/// every call behind one lock.
pub trait Backend: Send {
    /// Run a command with the simple query protocol and materialize its rows.
    fn execute(&mut self, command: &str) -> Result<QueryResult>;

    /// Block until data arrives, the timeout elapses or the wait is
    /// interrupted. Returns whether socket data is ready. Timeouts are not
    /// errors; a lost connection is.
    fn wait_for_activity(&mut self, timeout: Duration) -> Result<bool>;

    /// Return every notification received so far, in arrival order,
    /// without blocking.
    fn drain_notifications(&mut self) -> Result<Vec<Notification>>;

    /// Whether notifications are already buffered, so a wait can be skipped.
    fn has_pending_notifications(&self) -> bool;

    fn interrupter(&self) -> Arc<dyn Interrupt>;

    /// Notices (NoticeResponse) collected since the last call.
    fn take_notices(&mut self) -> Vec<ServerError>;

    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
