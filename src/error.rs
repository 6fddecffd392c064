//! Address store errors.
use std::io;

use bitcoin::consensus::encode;

use thiserror::Error;

/// An error occurring while snapshotting or restoring the address store.
///
/// Mutation and selection operations are total and never fail; the only
/// fallible surface is (de)serialization. After a failed restore, the
/// in-memory store is left empty and the caller should treat the persisted
/// snapshot as absent.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error. Truncated input surfaces here as `UnexpectedEof`.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An encoding/decoding error.
    #[error("encode/decode error: {0}")]
    Encode(#[from] encode::Error),

    /// The snapshot was written by a format newer than this implementation
    /// understands, or by the rejected historical format.
    #[error("unsupported address store format: {0}")]
    UnsupportedFormat(u8),

    /// The snapshot is structurally invalid.
    #[error("corrupt address store: {0}")]
    Corrupt(&'static str),
}
