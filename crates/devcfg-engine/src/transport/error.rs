//! Transport layer errors
//!
//! Timeouts and the framing statuses (`NotEnoughData`, `WrongRecipient`,
//! `NoData`) are soft: they describe stream state, not failure. Everything
//! else is hard and tears down the affected connection only.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("socket setup failed: {0}")]
    SocketSetup(String),

    #[error("connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("not enough data queued yet")]
    NotEnoughData,

    #[error("frame was for a different recipient and has been buffered")]
    WrongRecipient,

    #[error("no buffered data for this address pair")]
    NoData,

    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    #[error("handle {0} is not open")]
    InvalidHandle(usize),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("no usable network interface")]
    NoInterfaces,
}
