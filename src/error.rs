use crate::protocol::ServerError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(ServerError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuth(String),

    #[error("Password is required by the server")]
    PasswordRequired,

    #[error("Invalid channel name {name:?}: {reason}")]
    InvalidChannelName { name: String, reason: &'static str },

    #[error("Invalid literal: {0}")]
    InvalidLiteral(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Multiple rows returned ({0}) where at most one was expected")]
    MultipleRows(usize),

    #[error("Another listener is already reading this connection")]
    AlreadyListening,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error means the session is unusable.
    ///
    /// Server errors leave the session intact; I/O and protocol failures
    /// do not.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_)
        )
    }

    /// SQLSTATE of a server error, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Server(e) => e.code.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}

impl From<ServerError> for Error {
    fn from(value: ServerError) -> Self {
        Error::Server(value)
    }
}
