//! Address manager errors.

use std::io;

use bitcoin::consensus::encode;

use thiserror::Error;

/// An error occurring while persisting or restoring address tables.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// An encoding/decoding error.
    #[error("encode/decode error: {0}")]
    Encode(#[from] encode::Error),

    /// The file contents were rejected before decoding.
    #[error("corrupt file: {0}")]
    Corrupt(&'static str),
}
