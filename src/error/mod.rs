//! This module contains the primary error type for the library's interface. It
//! also re-exports the more specific error types that are subsystem-specific.

pub mod decoding;
pub mod extraction;
pub mod mining;

use thiserror::Error;

/// The interface result type for the library.
///
/// # Usage
///
/// Any function considered to be part of the public interface of the library
/// should return this result type. Subsystems should return the more-specific
/// child error types as appropriate.
///
/// Note that _all_ of the library is public in order to facilitate use-cases
/// beyond the ones designed for.
pub type Result<T> = std::result::Result<T, Error>;

/// The interface error type for the library.
///
/// All errors returned from the library interface (and hence encountered by
/// the clients of the library) should be members of this enum.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Errors that come from decoding storage state.
    #[error(transparent)]
    Decoding(#[from] decoding::Error),

    /// Errors from the trace extraction subsystem of the library.
    #[error(transparent)]
    Extraction(#[from] extraction::Error),

    /// Errors from the invariant mining subsystem of the library.
    #[error(transparent)]
    Mining(#[from] mining::Error),

    /// An unknown error, represented as a string.
    #[error("Unknown Error: {_0:?}")]
    Other(String),
}

impl Error {
    /// Constructs an unknown error with the provided `message`.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}
