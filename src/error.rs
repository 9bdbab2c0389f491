//! Internal error taxonomy. Never crosses the application boundary directly —
//! see `S3tpErrorCode` in `crate::codes` for that (per `spec.md` §7).

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("crc validation failed")]
    CrcInvalid,
    #[error("length mismatch: header declared {declared}, frame had {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("config: {0}")]
    Config(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("queue full")]
    QueueFull,
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
