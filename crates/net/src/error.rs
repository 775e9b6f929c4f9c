//! Errors raised by the peer protocol.

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("no handler registered for {0}")]
    NoHandler(&'static str),
    #[error("peer closed the connection")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
    #[error("handler failed: {0}")]
    Handler(String),
}
