//! This module contains errors pertaining to the interpretation of raw storage
//! words against a storage layout description.

use thiserror::Error;

/// Errors that occur while decoding storage state in the
/// [`crate::decoder::StateDecoder`].
///
/// Malformed slots and words are not errors at this level; the decoder
/// recovers them locally as undefined variables.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The storage layout description could not be parsed: {reason}")]
    InvalidLayout { reason: String },
}

/// The result type for methods that may have decoding errors.
pub type Result<T> = std::result::Result<T, Error>;
