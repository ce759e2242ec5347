//! Errors that end a miner session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON encode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("socket flood: request line exceeds {0} bytes")]
    SocketFlood(usize),

    #[error("read deadline exceeded")]
    Timeout,

    #[error("client is banned")]
    Banned,

    #[error("session closed")]
    Closed,

    #[error("too many invalid shares")]
    InvalidShareLimit,
}

impl SessionError {
    /// Ordinary disconnects that only deserve a debug line.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Closed | SessionError::Timeout => true,
            SessionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
