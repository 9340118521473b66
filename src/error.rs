//! Errors that the engine core may produce.
//!
//! Anything a single peer session can cope with (protocol issues, timeouts,
//! one peer going bad) closes that session only; anything that corrupts
//! shared state (storage failures, impossible invariants) is surfaced on the
//! torrent's error slot.

use std::fmt;

use crate::{BlockInfo, PieceIndex};

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer's handshake did not start with the BitTorrent protocol
    /// string.
    HandshakeMismatch,
    /// The peer advertised an info hash that no torrent in the engine serves.
    InfoHashUnknown,
    /// The peer's bitfield message payload does not have the expected
    /// `⌈piece count / 8⌉` length.
    BitfieldSizeMismatch {
        expected: usize,
        actual: usize,
    },
    /// The peer sent a frame larger than any valid message.
    OversizedFrame(u32),
    /// The peer sent a block that conflicts with one already buffered for the
    /// same slot.
    UnexpectedBlock(BlockInfo),
    /// The peer broke a protocol rule (late bitfield, abusive request size,
    /// truncated payload).
    ProtocolViolation,
    /// A piece index outside of the torrent was used.
    InvalidPieceIndex(PieceIndex),
    /// An operation referred to a torrent the engine does not manage.
    TorrentNotFound,
    /// The torrent is already managed by the engine.
    TorrentExists,
    /// A configuration value was rejected at construction time.
    Config(String),
    /// The metainfo could not be parsed or is not a valid v1 torrent.
    Metainfo(String),
    /// Bencode (de)serialization failure.
    Bencode(serde_bencode::Error),
    /// The connection or an I/O operation timed out.
    Timeout,
    /// The encrypted handshake with the peer failed.
    Encryption(String),
    /// The engine is shutting down and no longer accepts commands.
    Shutdown,
    /// Holds global IO related errors.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::HandshakeMismatch => write!(f, "peer handshake protocol string mismatch"),
            Error::InfoHashUnknown => write!(f, "info hash is not served by this engine"),
            Error::BitfieldSizeMismatch { expected, actual } => write!(
                f,
                "bitfield size mismatch: expected {} bytes, got {}",
                expected, actual
            ),
            Error::OversizedFrame(len) => write!(f, "frame of {} bytes exceeds maximum", len),
            Error::UnexpectedBlock(block) => write!(f, "unexpected block {}", block),
            Error::ProtocolViolation => write!(f, "peer violated the wire protocol"),
            Error::InvalidPieceIndex(index) => write!(f, "invalid piece index {}", index),
            Error::TorrentNotFound => write!(f, "torrent not found"),
            Error::TorrentExists => write!(f, "torrent already exists"),
            Error::Config(reason) => write!(f, "invalid configuration: {}", reason),
            Error::Metainfo(reason) => write!(f, "invalid metainfo: {}", reason),
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::Timeout => write!(f, "operation timed out"),
            Error::Encryption(reason) => write!(f, "encryption handshake failed: {}", reason),
            Error::Shutdown => write!(f, "engine is shutting down"),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bencode(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Error::Bencode(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        // the receiving task is gone, which only happens on shutdown
        Error::Shutdown
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Shutdown
    }
}
