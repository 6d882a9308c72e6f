//! This module contains errors pertaining to invariant mining and checking.

use thiserror::Error;

/// Errors that occur while mining or checking invariants in the
/// [`crate::mining::Miner`] and [`crate::checker`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("The mining configuration is invalid: {reason}")]
    InvalidConfig { reason: String },

    #[error("The persisted invariant set could not be parsed: {reason}")]
    InvalidInvariantSet { reason: String },

    #[error("The persisted trace list could not be parsed: {reason}")]
    InvalidTraceList { reason: String },
}

/// The result type for methods that may have mining errors.
pub type Result<T> = std::result::Result<T, Error>;
