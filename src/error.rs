use std::io;

use thiserror::Error;

/// Errors produced by the DCC tester library.
#[derive(Debug, Error)]
pub enum Error {
    /// A packet field or RPC argument is outside its legal range.
    /// Raised before anything touches the transport.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The command station sent nothing back within the read timeout.
    #[error("no response from command station")]
    NoResponse,

    /// The response line could not be parsed as JSON.
    #[error("malformed response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    /// Underlying serial/IO failure.
    #[error("serial port error: {0}")]
    Io(#[from] io::Error),

    /// The firmware answered with `status != "ok"`. The full response
    /// body is kept for diagnostics; only `status` is machine-checked.
    #[error("command station returned error: {0}")]
    Remote(serde_json::Value),

    /// A current/voltage feedback RPC failed in the middle of an
    /// algorithm that depends on it.
    #[error("feedback read failed: {0}")]
    FeedbackRead(serde_json::Value),

    /// The CV read exhausted its retries without observing an ACK pulse.
    #[error("no ACK detected for bit {bit_index} after {attempts} attempts")]
    NoAckDetected { bit_index: u8, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;
