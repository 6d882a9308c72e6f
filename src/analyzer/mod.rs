//! This module contains the analysis driver that wires extraction,
//! normalization, mining and checking together for one watched contract.
//!
//! An [`Analysis`] is fed raw replayed transactions in corpus order. Each
//! observation is extracted against the contract's ABI, decoded against its
//! storage layout and appended to the trace list. Mining runs over the
//! accumulated list; checking replays further transactions against a mined
//! invariant set without disturbing the accumulated decoding state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    checker::{self, Violation},
    constant::{DEFAULT_MINIMUM_OCCURRENCES, DEFAULT_R_SQUARED_THRESHOLD, DEFAULT_TOLERANCE},
    decoder::DecodeCache,
    error::mining::{Error, Result},
    layout::StorageLayout,
    mining::{InvariantSet, Miner, MinerOptions},
    normalize::{Dtrace, Level, Normalizer, TraceId},
    trace::{ContractAbi, RawTransaction, TraceExtractor},
    utility::Address,
};

/// The configuration of one analysis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The fraction of a bucket's observations a relation must satisfy.
    pub tolerance: f64,

    /// The minimum number of observations a bucket needs before it can
    /// report key invariants.
    pub minimum_occurrences: usize,

    /// The goodness-of-fit threshold for accepting a fitted numeric model.
    pub r_squared_threshold: f64,

    /// Carry decoded storage forward between calls, so slots a later call
    /// does not touch keep their last observed value.
    pub use_cached_storage: bool,

    /// Drop a whole transaction when any call within it failed, instead of
    /// only skipping the failed calls.
    pub exclude_partial_err: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            minimum_occurrences: DEFAULT_MINIMUM_OCCURRENCES,
            r_squared_threshold: DEFAULT_R_SQUARED_THRESHOLD,
            use_cached_storage: true,
            exclude_partial_err: false,
        }
    }
}

impl Config {
    /// The mining parameters this configuration implies.
    #[must_use]
    pub fn miner_options(&self) -> MinerOptions {
        MinerOptions {
            tolerance: self.tolerance,
            minimum_occurrences: self.minimum_occurrences,
            r_squared_threshold: self.r_squared_threshold,
        }
    }
}

/// A deduplicated, persistable list of normalized records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TraceList {
    traces: Vec<Dtrace>,

    #[serde(skip)]
    seen: HashSet<(TraceId, Level)>,
}

impl TraceList {
    /// Parses a persisted trace list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTraceList`] if the payload is malformed.
    pub fn from_json(payload: &str) -> Result<Self> {
        let mut list: Self = serde_json::from_str(payload).map_err(|e| Error::InvalidTraceList {
            reason: e.to_string(),
        })?;
        list.reindex();
        Ok(list)
    }

    /// Renders the list for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTraceList`] if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidTraceList {
            reason: e.to_string(),
        })
    }

    /// Appends one record, unless the same call at the same level is already
    /// present.
    pub fn insert(&mut self, trace: Dtrace) -> bool {
        if !self.seen.insert((trace.id, trace.level)) {
            return false;
        }
        self.traces.push(trace);
        true
    }

    /// Merges another list into this one, keeping first occurrences.
    pub fn merge(&mut self, other: TraceList) {
        for trace in other.traces {
            self.insert(trace);
        }
    }

    #[must_use]
    pub fn traces(&self) -> &[Dtrace] {
        &self.traces
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Rebuilds the dedup index after deserialisation, dropping duplicate
    /// records from the payload itself.
    fn reindex(&mut self) {
        let mut seen = HashSet::new();
        self.traces.retain(|trace| seen.insert((trace.id, trace.level)));
        self.seen = seen;
    }
}

/// The analysis driver for one watched contract.
#[derive(Debug)]
pub struct Analysis {
    layout: StorageLayout,
    extractor: TraceExtractor,
    config: Config,

    /// The decoding state accumulated across observed transactions.
    cache: DecodeCache,

    traces: TraceList,
}

impl Analysis {
    /// Creates an analysis of `target` from its storage layout and ABI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is out of range.
    pub fn new(
        layout: StorageLayout,
        abi: ContractAbi,
        target: Address,
        config: Config,
    ) -> Result<Self> {
        config.miner_options().validate()?;
        Ok(Self {
            layout,
            extractor: TraceExtractor::new(abi, target, config.exclude_partial_err),
            cache: DecodeCache::new(config.use_cached_storage),
            config,
            traces: TraceList::default(),
        })
    }

    /// Observes one raw transaction, appending its normalized records.
    ///
    /// Returns the number of records added. Transactions must be fed in
    /// corpus order; witnesses and cached storage accumulate across calls.
    pub fn observe(&mut self, raw: &RawTransaction) -> usize {
        let Some(tx) = self.extractor.extract(raw) else {
            return 0;
        };

        let normalizer = Normalizer::new(&self.layout);
        let mut added = 0;
        for call in &tx.calls {
            for record in normalizer.normalize(&tx, call, &mut self.cache) {
                if self.traces.insert(record) {
                    added += 1;
                }
            }
        }
        debug!(
            block = tx.block_number,
            position = tx.position,
            added,
            total = self.traces.len(),
            "observed transaction"
        );
        added
    }

    /// Mines the key invariants of the accumulated trace list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is out of range.
    pub fn mine(&self) -> Result<InvariantSet> {
        let mut miner = Miner::new(self.config.miner_options())?;
        miner.mine(self.traces.traces());
        let set = miner.key_invariants();
        info!(
            traces = self.traces.len(),
            invariants = set.len(),
            "mining complete"
        );
        Ok(set)
    }

    /// Checks one raw transaction against a mined invariant set.
    ///
    /// Checking normalizes against a copy of the accumulated decoding state,
    /// so it neither grows the witness set nor advances cached storage.
    #[must_use]
    pub fn check(&self, invariants: &InvariantSet, raw: &RawTransaction) -> Vec<Violation> {
        let Some(tx) = self.extractor.extract(raw) else {
            return Vec::new();
        };

        let normalizer = Normalizer::new(&self.layout);
        let mut cache = self.cache.clone();
        let mut violations = Vec::new();
        for call in &tx.calls {
            for record in normalizer.normalize(&tx, call, &mut cache) {
                violations.extend(checker::check_trace(invariants, &record));
            }
        }
        violations
    }

    /// The accumulated trace list.
    #[must_use]
    pub fn traces(&self) -> &TraceList {
        &self.traces
    }

    /// Merges a previously persisted trace list into the analysis.
    pub fn import(&mut self, list: TraceList) {
        self.traces.merge(list);
    }
}

/// Creates a new analysis of the contract at `target`.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the configuration is out of range.
pub fn new(
    layout: StorageLayout,
    abi: ContractAbi,
    target: Address,
    config: Config,
) -> Result<Analysis> {
    Analysis::new(layout, abi, target, config)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        decoder::ScalarValue,
        normalize::{Point, TraceVal, TraceValue, VariableName},
    };

    fn record(block: u64, level: Level) -> Dtrace {
        Dtrace {
            id: TraceId {
                block_number: block,
                position: 0,
                call_index: 0,
            },
            bucket: "b".into(),
            level,
            points: vec![Point::Pre, Point::Post],
            sender: Address::default(),
            origin: Address::default(),
            variables: BTreeMap::new(),
        }
    }

    #[test]
    fn trace_lists_deduplicate_on_insert() {
        let mut list = TraceList::default();
        assert!(list.insert(record(1, Level::Contract)));
        assert!(list.insert(record(1, Level::Function)));
        assert!(!list.insert(record(1, Level::Contract)));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn trace_lists_round_trip_and_reindex() {
        let mut list = TraceList::default();
        let mut with_variable = record(3, Level::Function);
        with_variable.variables.insert(
            "method.amount".into(),
            TraceValue {
                name: VariableName::Method {
                    path: crate::normalize::Path::root().field("amount"),
                },
                value: TraceVal::Scalar(ScalarValue::Int(ethnum::I256::new(4))),
                type_label: "uint256".into(),
            },
        );
        list.insert(with_variable);
        list.insert(record(4, Level::Contract));

        let payload = list.to_json().unwrap();
        let restored = TraceList::from_json(&payload).unwrap();
        assert_eq!(restored.len(), 2);

        // The rebuilt index keeps deduplicating.
        let mut restored = restored;
        assert!(!restored.insert(record(4, Level::Contract)));
    }

    #[test]
    fn merging_keeps_first_occurrences() {
        let mut a = TraceList::default();
        a.insert(record(1, Level::Contract));

        let mut b = TraceList::default();
        b.insert(record(1, Level::Contract));
        b.insert(record(2, Level::Contract));

        a.merge(b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn invalid_configurations_are_rejected_up_front() {
        let layout = StorageLayout::from_json(r#"{"storage": [], "types": {}}"#).unwrap();
        let config = Config {
            tolerance: 2.0,
            ..Config::default()
        };
        assert!(Analysis::new(layout, ContractAbi::default(), Address::default(), config).is_err());
    }
}
