use std::{fmt, io};

use quinn_proto::{ConnectError, ConnectionError};
use thiserror::Error;

/// Coarse classification of every failure a role can hit. All three are
/// fatal for the process that observes them; nothing in the protocol
/// retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection, send or receive failure.
    Transport,
    /// The peer sent something the protocol does not allow.
    Protocol,
    /// A locally supplied value is unusable, such as a zero worker count.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Config => write!(f, "config"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not start connecting: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),

    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("endpoint closed")]
    EndpointClosed,

    #[error("failed to spawn cohort: {0}")]
    Spawn(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Config(_) => ErrorKind::Config,
            Error::Connect(_)
            | Error::Connection(_)
            | Error::Io(_)
            | Error::Tls(_)
            | Error::Certificate(_)
            | Error::EndpointClosed
            | Error::Spawn(_) => ErrorKind::Transport,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
