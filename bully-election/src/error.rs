use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failure to turn bytes into a [`crate::message::Message`] or back.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty frame")]
    Empty,
    #[error("frame longer than {0} bytes")]
    TooLong(usize),
}

/// Everything that can go wrong on a single peer connection.
///
/// None of these are fatal to the node. The coordinator routes all of them
/// through the same failure path: the connection is dropped and, if it was
/// awaiting a reply, the peer is suspected.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] io::Error),
    #[error("send failed: {0}")]
    SendFailed(#[source] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error(transparent)]
    Malformed(#[from] CodecError),
    #[error("no progress within {0:?}")]
    TimedOut(Duration),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
}

/// Startup failures while talking to the group directory. Always fatal.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory {addr} unreachable: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("directory {addr} did not answer within {timeout:?}")]
    TimedOut { addr: String, timeout: Duration },
    #[error("directory protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid birthday '{0}', expected YYYY-MM-DD")]
    InvalidBirthday(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
