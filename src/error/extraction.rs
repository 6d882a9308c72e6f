//! This module contains errors pertaining to the extraction of observed calls
//! from raw transaction traces and the ABI decoding of their payloads.

use thiserror::Error;

/// Errors that occur while extracting target calls from raw traces in the
/// [`crate::trace::TraceExtractor`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The contract ABI could not be parsed: {reason}")]
    InvalidAbi { reason: String },

    #[error("The raw transaction record could not be parsed: {reason}")]
    InvalidTransaction { reason: String },

    #[error("ABI payload for {signature} is truncated at offset {offset}")]
    TruncatedPayload { signature: String, offset: usize },

    #[error("Unsupported ABI type {type_name:?} in {signature}")]
    UnsupportedAbiType { signature: String, type_name: String },
}

/// The result type for methods that may have extraction errors.
pub type Result<T> = std::result::Result<T, Error>;
