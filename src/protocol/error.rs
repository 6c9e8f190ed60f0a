use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for acknowledgment")]
    AckTimeout,

    #[error("Receive timed out mid-transmission")]
    ReceiveTimeout,

    #[error("Invalid checksum: expected {expected}, got {actual}")]
    InvalidChecksum { expected: String, actual: String },

    #[error("Invalid frame format: {0}")]
    InvalidFrameFormat(String),

    #[error("Invalid frame sequence: {0}")]
    InvalidFrameSequence(String),

    #[error("Invalid record format: {0}")]
    InvalidRecordFormat(String),

    #[error("Retry budget exhausted after {attempts} attempts")]
    RetryExhausted { attempts: u32 },

    #[error("Line contention: peer enquired while a send was pending")]
    Contention,

    #[error("Link is not idle")]
    LinkBusy,

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
