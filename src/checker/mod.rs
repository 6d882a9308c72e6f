//! This module contains the runtime oracle: it replays normalized trace
//! records against a mined invariant set and reports every violation.
//!
//! Checking is deliberately lenient about missing data. An invariant whose
//! variables are absent from a record is skipped rather than flagged, with
//! one exception: a missing `change` variable reads as zero, because a slot
//! the call never touched did not change.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    mining::{InvariantSet, Outcome},
    normalize::Dtrace,
    utility::Address,
};

/// One record that broke at least one invariant of its bucket.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// The offending record, as `block_position_call:level`.
    pub trace: String,

    pub bucket: String,

    pub sender: Address,

    /// The externally-owned account behind the transaction.
    pub origin: Address,

    /// Rendered forms of the violated invariants.
    pub violated: Vec<String>,
}

/// Checks one record against the invariants of its bucket.
///
/// Returns `None` when the bucket has no invariants or the record satisfies
/// all of them.
#[must_use]
pub fn check_trace(set: &InvariantSet, trace: &Dtrace) -> Option<Violation> {
    let invariants = set.buckets.get(&trace.bucket)?;

    let violated: Vec<String> = invariants
        .iter()
        .filter(|invariant| invariant.relation.evaluate(trace, true) == Outcome::Violated)
        .map(|invariant| invariant.name.clone())
        .collect();

    if violated.is_empty() {
        debug!(trace = %trace.id, bucket = %trace.bucket, "record satisfies its bucket");
        return None;
    }

    warn!(
        trace = %trace.id,
        bucket = %trace.bucket,
        count = violated.len(),
        "invariant violation"
    );
    Some(Violation {
        trace: format!("{}:{}", trace.id, trace.level),
        bucket: trace.bucket.clone(),
        sender: trace.sender,
        origin: trace.origin,
        violated,
    })
}

/// Checks a batch of records, in order.
#[must_use]
pub fn check(set: &InvariantSet, traces: &[Dtrace]) -> Vec<Violation> {
    traces
        .iter()
        .filter_map(|trace| check_trace(set, trace))
        .collect()
}
