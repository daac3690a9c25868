//! Error types for vtk-pos.
//!
//! Every failure the crate can produce is recoverable by the caller:
//! nothing here terminates the process, and each variant carries enough
//! context (argument ids, expected vs. returned values, the offending
//! state pair) to log and decide whether to retry or abort.

use std::io;

use thiserror::Error;

use crate::net::NetState;

/// Wire-level encode/decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The low 7 bits of a varint first byte were not 0, 1 or 2.
    #[error("invalid varint discriminator byte: {0:#04x}")]
    BadDiscriminator(u8),

    /// The stream ended before the field could be read.
    #[error("truncated stream while reading {0}")]
    Truncated(&'static str),

    /// The message header length would exceed the 16-bit wire limit.
    #[error("message would exceed 65535 wire bytes")]
    Oversize,
}

/// Socket setup and state machine failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The requested state change is not in the transition table.
    #[error("unsupported network state transition: {from} -> {to}")]
    UnsupportedTransition { from: NetState, to: NetState },

    /// Send or receive was attempted without an established peer.
    #[error("connection is not established")]
    NotEstablished,

    /// The address or port could not be parsed as IPv4.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// A socket syscall failed while changing state.
    #[error("{context}: {source}")]
    Socket {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Failures on an established connection.
#[derive(Debug, Error)]
pub enum IoError {
    /// A single blocking write did not take the whole frame.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("send failed: {0}")]
    Write(#[source] io::Error),

    #[error("receive failed: {0}")]
    Read(#[source] io::Error),

    /// The peer produced no data within the bounded wait.
    #[error("connection timeout")]
    Timeout,

    /// EOF was observed where the stage did not allow it.
    #[error("connection closed unexpectedly")]
    UnexpectedEof,
}

/// Response contract violations detected by the stage engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("expected message parameter not found: {id:#04x} ({desc})")]
    MissingParam { id: u16, desc: &'static str },

    /// Case-insensitive string comparison against the expected value failed.
    #[error("wrong string parameter, id {id:#04x}: returned {returned:?}, expected {expected:?}")]
    TextMismatch {
        id: u16,
        returned: String,
        expected: String,
    },

    #[error("wrong numeric parameter, id {id:#04x}: returned {returned}, expected {expected}")]
    NumMismatch {
        id: u16,
        returned: i64,
        expected: i64,
    },
}

/// Union of everything a single protocol stage can fail with.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A payment transaction failure, tagged with the stage that broke it.
#[derive(Debug, Error)]
#[error("payment transaction failed at {stage} stage: {source}")]
pub struct TransactionError {
    pub stage: &'static str,
    #[source]
    pub source: StageError,
}
