use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{Backend, Connection, Interrupt, QueryResult, Row};
use crate::protocol::{quote_literal, validate_channel, ServerError};
use crate::pubsub::PubSub;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Everything guarded by the client lock
pub(crate) struct Session<B> {
    pub(crate) backend: B,
    /// Channels with a successful LISTEN and no UNLISTEN since
    pub(crate) channels: HashSet<String>,
}

pub(crate) struct Shared<B> {
    pub(crate) session: Mutex<Session<B>>,
    pub(crate) interrupter: Arc<dyn Interrupt>,
    /// Set while a `Listener` owns the read side
    pub(crate) listening: AtomicBool,
    /// Control threads interrupting the listener to get the lock
    pub(crate) contenders: AtomicUsize,
    pub(crate) poll_interval: Duration,
}

/// Thread-safe handle to one database session
///
/// Cloning is cheap and every clone shares the same session. The session
/// closes when [`Client::close`] is called or the last clone is dropped.
pub struct Client<B: Backend = Connection> {
    pub(crate) shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for Client<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Client<Connection> {
    /// Connect using `config`
    pub fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let conn = Connection::connect(config)?;
        Ok(Self::with_poll_interval(conn, config.poll_interval()))
    }

    /// Connect using a `postgres://` URL
    pub fn from_url(url: &str) -> Result<Self> {
        Self::connect(&Config::from_url(url)?)
    }

    /// Connect using `DATABASE_URL` or the `PG*` variables
    pub fn from_env() -> Result<Self> {
        Self::connect(&Config::from_env()?)
    }
}

impl<B: Backend> Client<B> {
    pub fn new(backend: B) -> Self {
        Self::with_poll_interval(backend, Config::default().poll_interval())
    }

    pub fn with_poll_interval(backend: B, poll_interval: Duration) -> Self {
        let interrupter = backend.interrupter();
        Self {
            shared: Arc::new(Shared {
                session: Mutex::new(Session {
                    backend,
                    channels: HashSet::new(),
                }),
                interrupter,
                listening: AtomicBool::new(false),
                contenders: AtomicUsize::new(0),
                poll_interval,
            }),
        }
    }

    /// Take the session lock from a control thread.
    ///
    /// A listener may be holding the lock while it waits on the socket, so
    /// wake it first; it releases the lock fairly once it returns.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Session<B>> {
        let shared = &*self.shared;
        if let Some(session) = shared.session.try_lock() {
            return session;
        }

        shared.contenders.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = shared.interrupter.interrupt() {
            debug!("Failed to interrupt listener: {}", e);
        }
        let session = shared.session.lock();
        shared.contenders.fetch_sub(1, Ordering::AcqRel);
        trace!("Control lock acquired");
        session
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    /// Run a command and return the number of affected rows
    pub fn execute(&self, sql: &str) -> Result<u64> {
        Ok(self.run(sql)?.rows_affected)
    }

    /// Run a query and return all rows
    pub fn query(&self, sql: &str) -> Result<Vec<Row>> {
        Ok(self.run(sql)?.rows)
    }

    /// Run a query expected to return at most one row
    pub fn get(&self, sql: &str) -> Result<Option<Row>> {
        let mut rows = self.query(sql)?;
        match rows.len() {
            0 | 1 => Ok(rows.pop()),
            n => Err(Error::MultipleRows(n)),
        }
    }

    /// Run a command and return the full result
    pub fn run(&self, sql: &str) -> Result<QueryResult> {
        self.lock().backend.execute(sql)
    }

    /// Send a notification on `channel`
    pub fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        validate_channel(channel)?;
        let sql = format!(
            "SELECT pg_notify({}, {})",
            quote_literal(channel)?,
            quote_literal(payload)?
        );
        self.run(&sql)?;
        debug!("Notified {:?} ({} byte payload)", channel, payload.len());
        Ok(())
    }

    /// Notices received since the last call
    pub fn notices(&self) -> Vec<ServerError> {
        self.lock().backend.take_notices()
    }

    pub fn pubsub(&self) -> PubSub<B> {
        PubSub::new(self.clone())
    }

    /// Terminate the session. A blocked listener wakes up and ends with
    /// `ConnectionClosed`.
    pub fn close(&self) -> Result<()> {
        let mut session = self.lock();
        session.channels.clear();
        session.backend.close()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().backend.is_closed()
    }
}
