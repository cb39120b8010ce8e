//! pg-pubsub: PostgreSQL LISTEN/NOTIFY client
//!
//! This crate speaks the PostgreSQL frontend/backend protocol directly and
//! exposes a small query API plus a publish/subscribe layer built on
//! `LISTEN`, `NOTIFY` and `UNLISTEN`.
//!
//! # Architecture
//!
//! - One non-blocking socket per session, driven by a mio `Poll`
//! - A single lock serializes commands; the listener waits under it in
//!   bounded slices and control threads wake it with a `Waker`
//! - Notifications are filtered against the live subscription set when
//!   they are handed out
//!
//! ```no_run
//! use pg_pubsub::Client;
//!
//! # fn main() -> pg_pubsub::Result<()> {
//! let client = Client::from_url("postgres://postgres@localhost/postgres")?;
//! let pubsub = client.pubsub();
//! pubsub.subscribe(["example", "other"])?;
//!
//! for notification in pubsub.listen()? {
//!     let notification = notification?;
//!     println!("{}: {}", notification.channel(), notification.payload());
//! }
//! # Ok(())
//! # }
//! ```

/// Session handle and query API
pub mod client;

/// Configuration management for connections
pub mod config;

/// Error types and result aliases
pub mod error;

/// Socket handling and the backend abstraction
pub mod network;

/// PostgreSQL wire protocol
pub mod protocol;

/// Channel subscriptions and notification listeners
pub mod pubsub;

pub use client::Client;
pub use config::{Config, SslMode};
pub use error::{Error, Result};
pub use network::{Backend, Connection, Interrupt, QueryResult, Row};
pub use protocol::ServerError;
pub use pubsub::{BackgroundListener, Listener, Notification, PubSub, StopHandle};
