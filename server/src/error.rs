use relay_shared::ProtocolError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("malformed stats snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),
    #[error("outbound queue of {0} frames overflowed")]
    QueueFull(usize),
    #[error("connection closed")]
    ConnectionClosed,
}
