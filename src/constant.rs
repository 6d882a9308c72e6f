//! This module contains constants that are needed throughout the codebase.

/// The width of a word on the EVM in bytes.
pub const WORD_SIZE_BYTES: usize = 32;

/// The width of an address type in bytes.
pub const ADDRESS_WIDTH_BYTES: usize = 20;

/// The width of a function selector in bytes.
pub const SELECTOR_WIDTH_BYTES: usize = 4;

/// The maximum number of elements materialised when decoding a dynamic array.
///
/// Traces occasionally carry arrays with absurd claimed lengths (usually a
/// corrupted length slot); decoding is capped rather than allowed to scan
/// millions of absent slots.
pub const MAX_DECODED_ARRAY_ELEMENTS: usize = 4096;

/// The boundary between the short and long forms of in-storage `string` and
/// `bytes` values.
///
/// Values of at most this many bytes are stored in the declaration slot
/// itself, with `2 * length` in the lowest byte.
pub const SHORT_STRING_MAX_BYTES: usize = 31;

/// The default fraction of a bucket's observations that a relation must
/// satisfy to survive mining.
pub const DEFAULT_TOLERANCE: f64 = 1.0;

/// The default minimum number of observations a bucket needs before any of its
/// invariants can become key invariants.
pub const DEFAULT_MINIMUM_OCCURRENCES: usize = 10;

/// The default goodness-of-fit threshold for accepting a fitted numeric model.
pub const DEFAULT_R_SQUARED_THRESHOLD: f64 = 0.99;

/// The smallest slope magnitude a fitted linear model may carry; anything
/// below this describes a constant, not a dependence on `x`.
pub const FIT_MIN_SLOPE: f64 = 1e-5;

/// The minimum integer magnitude for a value to count as interesting when
/// constructing byte-substring membership relations.
pub const BYTES_MEMBERSHIP_MIN_INT: i128 = 1024;

/// The minimum string length for a value to count as interesting when
/// constructing byte-substring membership relations.
pub const BYTES_MEMBERSHIP_MIN_STR_LEN: usize = 10;

/// The minimum displayed length for a variable's value to be considered as a
/// substitution source during invariant generalisation.
pub const GENERALISATION_MIN_VALUE_LEN: usize = 3;
