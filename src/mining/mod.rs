//! This module contains the invariant miner.
//!
//! The miner consumes normalized trace records bucket by bucket. Within a
//! bucket it explores an initial prefix of the observations, proposing
//! candidate relations over the variable pairs the comparability filter
//! admits, and then confirms the candidates over the remainder. A candidate
//! survives as long as its violations stay within the bucket's tolerance
//! budget; the survivors with enough support become the bucket's key
//! invariants, after numeric fitting over the recorded integer series and a
//! redundancy sweep.

pub mod comparability;
pub mod fit;
pub mod relation;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use ethnum::I256;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use self::relation::{Outcome, Relation};
use crate::{
    constant::{
        BYTES_MEMBERSHIP_MIN_INT, BYTES_MEMBERSHIP_MIN_STR_LEN, DEFAULT_MINIMUM_OCCURRENCES,
        DEFAULT_R_SQUARED_THRESHOLD, DEFAULT_TOLERANCE, GENERALISATION_MIN_VALUE_LEN,
    },
    decoder::ScalarValue,
    error::mining::{Error, Result},
    mining::{
        comparability::comparable,
        fit::{constant_product, linear_fit, nearly_equal},
    },
    normalize::{Dtrace, TraceVal, VariableName},
    utility::i256_to_f64,
};

/// The tunable parameters of a mining run.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinerOptions {
    /// The fraction of a bucket's observations a relation must satisfy.
    pub tolerance: f64,

    /// The minimum number of observations a bucket needs before it can
    /// report key invariants.
    pub minimum_occurrences: usize,

    /// The goodness-of-fit threshold for accepting a fitted numeric model.
    pub r_squared_threshold: f64,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            minimum_occurrences: DEFAULT_MINIMUM_OCCURRENCES,
            r_squared_threshold: DEFAULT_R_SQUARED_THRESHOLD,
        }
    }
}

impl MinerOptions {
    /// Checks the options for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0 && self.tolerance <= 1.0) {
            return Err(Error::InvalidConfig {
                reason: format!("tolerance must be in (0, 1], got {}", self.tolerance),
            });
        }
        if self.minimum_occurrences == 0 {
            return Err(Error::InvalidConfig {
                reason: "minimum_occurrences must be at least 1".into(),
            });
        }
        if !(self.r_squared_threshold > 0.0 && self.r_squared_threshold <= 1.0) {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "r_squared_threshold must be in (0, 1], got {}",
                    self.r_squared_threshold
                ),
            });
        }
        Ok(())
    }
}

/// A candidate relation together with its confirmation count.
#[derive(Clone, Debug)]
struct RelationState {
    relation: Relation,
    satisfied: usize,
}

/// The integer observations of one variable across a bucket, aligned by
/// trace position.
#[derive(Clone, Debug)]
struct Series {
    name: VariableName,
    values: Vec<Option<I256>>,
}

/// The mining state of one bucket.
#[derive(Clone, Debug, Default)]
struct Bucket {
    /// The number of observations announced for this bucket.
    total: usize,

    /// The number of observations processed so far.
    processed: usize,

    relations: Vec<RelationState>,

    /// Rendered forms of relations that fell out of budget; they are never
    /// re-proposed.
    dropped: BTreeSet<String>,

    /// The traces seen during exploration, kept so late-born candidates can
    /// be back-filled.
    seen: Vec<Dtrace>,

    /// Aligned integer series for numeric fitting, keyed by rendered name.
    series: BTreeMap<String, Series>,

    /// Every variable name observed in the bucket.
    seen_names: BTreeSet<String>,

    /// The names that carried a non-zero value at least once.
    ever_nonzero: BTreeSet<String>,
}

impl Bucket {
    /// The number of violations a relation may accumulate before dropping.
    fn budget(&self, tolerance: f64) -> usize {
        (self.total as f64 * (1.0 - tolerance)).floor() as usize
    }

    /// The confirmation count a relation needs to become a key invariant.
    fn support(&self, tolerance: f64) -> usize {
        (self.total as f64 * tolerance).ceil() as usize
    }
}

/// One reported invariant: a relation and its rendered form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinedInvariant {
    pub name: String,
    pub relation: Relation,
}

/// The key invariants of every bucket, as persisted between runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InvariantSet {
    pub buckets: BTreeMap<String, Vec<MinedInvariant>>,
}

impl InvariantSet {
    /// Parses a persisted invariant set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInvariantSet`] if the payload is malformed.
    pub fn from_json(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| Error::InvalidInvariantSet {
            reason: e.to_string(),
        })
    }

    /// Renders the set for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInvariantSet`] if serialisation fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidInvariantSet {
            reason: e.to_string(),
        })
    }

    /// The total number of invariants across all buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(Vec::is_empty)
    }
}

/// The invariant miner.
#[derive(Clone, Debug)]
pub struct Miner {
    options: MinerOptions,
    buckets: BTreeMap<String, Bucket>,
}

impl Miner {
    /// Creates a miner with the provided options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the options are out of range.
    pub fn new(options: MinerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            buckets: BTreeMap::new(),
        })
    }

    /// Announces `additional` upcoming observations for a bucket.
    ///
    /// The exploration boundary and the violation budget both depend on the
    /// bucket's total, so totals must be announced before the corresponding
    /// records are processed.
    pub fn expect(&mut self, bucket: &str, additional: usize) {
        self.buckets.entry(bucket.to_owned()).or_default().total += additional;
    }

    /// Mines a batch of records: announces every bucket total, then
    /// processes the records in order.
    pub fn mine(&mut self, traces: &[Dtrace]) {
        for trace in traces {
            self.expect(&trace.bucket, 1);
        }
        for trace in traces {
            self.process(trace);
        }
    }

    /// Processes one record against its bucket.
    pub fn process(&mut self, trace: &Dtrace) {
        let bucket = self.buckets.entry(trace.bucket.clone()).or_default();
        if bucket.processed >= bucket.total {
            // Unannounced observation; widen the total so budgets stay sane.
            bucket.total = bucket.processed + 1;
        }
        bucket.processed += 1;
        let position = bucket.processed;

        for variable in trace.variables.values() {
            let rendered = variable.name.to_string();
            if !variable.value.is_zero() {
                bucket.ever_nonzero.insert(rendered.clone());
            }
            bucket.seen_names.insert(rendered.clone());

            if let Some(int) = variable.value.as_int() {
                let series = bucket.series.entry(rendered).or_insert_with(|| Series {
                    name: variable.name.clone(),
                    values: vec![None; position - 1],
                });
                series.values.push(Some(int));
            }
        }
        // Keep every series aligned with the bucket position.
        for series in bucket.series.values_mut() {
            if series.values.len() < position {
                series.values.push(None);
            }
        }

        let budget = bucket.budget(self.options.tolerance);

        for state in &mut bucket.relations {
            if state.relation.evaluate(trace, false) == Outcome::Satisfied {
                state.satisfied += 1;
            }
        }
        let processed = bucket.processed;
        let dropped = &mut bucket.dropped;
        bucket.relations.retain(|state| {
            let keep = processed - state.satisfied <= budget;
            if !keep {
                dropped.insert(state.relation.to_string());
            }
            keep
        });

        // The first observation always proposes, even when the budget is
        // zero; afterwards exploration runs while positions stay within it.
        let exploring = position == 1 || position <= budget;
        if exploring {
            bucket.seen.push(trace.clone());

            let mut known: HashSet<String> = bucket
                .relations
                .iter()
                .map(|state| state.relation.to_string())
                .collect();
            known.extend(bucket.dropped.iter().cloned());

            let candidates = propose(trace);
            let mut born = 0usize;
            for candidate in candidates {
                let rendered = candidate.to_string();
                if !known.insert(rendered.clone()) {
                    continue;
                }
                // Back-fill over the exploration prefix so late-born
                // candidates compete on equal footing.
                let satisfied = bucket
                    .seen
                    .iter()
                    .filter(|past| candidate.evaluate(past, false) == Outcome::Satisfied)
                    .count();
                if processed - satisfied <= budget {
                    bucket.relations.push(RelationState {
                        relation: candidate,
                        satisfied,
                    });
                    born += 1;
                } else {
                    bucket.dropped.insert(rendered);
                }
            }
            debug!(
                bucket = %trace.bucket,
                position,
                born,
                alive = bucket.relations.len(),
                "explored trace"
            );
        } else {
            debug!(
                bucket = %trace.bucket,
                position,
                alive = bucket.relations.len(),
                "confirmed trace"
            );
        }
    }

    /// Reports the key invariants of every bucket with enough observations.
    #[must_use]
    pub fn key_invariants(&self) -> InvariantSet {
        let mut set = InvariantSet::default();

        for (name, bucket) in &self.buckets {
            if bucket.processed < self.options.minimum_occurrences {
                debug!(
                    bucket = %name,
                    processed = bucket.processed,
                    required = self.options.minimum_occurrences,
                    "bucket below the occurrence floor"
                );
                continue;
            }

            let support = bucket.support(self.options.tolerance);
            let mut kept: Vec<Relation> = bucket
                .relations
                .iter()
                .filter(|state| state.satisfied >= support)
                .filter(|state| !self.all_zero(bucket, &state.relation))
                .map(|state| state.relation.clone())
                .collect();

            kept.extend(self.fitted_relations(bucket, &kept));
            let kept = remove_redundant(kept);

            info!(bucket = %name, invariants = kept.len(), "key invariants");
            set.buckets.insert(
                name.clone(),
                kept.into_iter()
                    .map(|relation| MinedInvariant {
                        name: relation.to_string(),
                        relation,
                    })
                    .collect(),
            );
        }
        set
    }

    /// Checks whether every variable the relation touches was observed but
    /// never carried a non-zero value.
    ///
    /// Deltas are exempt: a `change` variable that stays zero is exactly a
    /// conservation claim, not an untouched slot.
    fn all_zero(&self, bucket: &Bucket, relation: &Relation) -> bool {
        let referenced = relation.referenced();
        !referenced.is_empty()
            && referenced.iter().all(|name| {
                if matches!(name, VariableName::Change { .. }) {
                    return false;
                }
                let rendered = name.to_string();
                bucket.seen_names.contains(&rendered) && !bucket.ever_nonzero.contains(&rendered)
            })
    }

    /// Fits linear and constant-product models over the bucket's integer
    /// series.
    fn fitted_relations(&self, bucket: &Bucket, kept: &[Relation]) -> Vec<Relation> {
        let threshold = bucket.total as f64 * self.options.tolerance;
        let kept_displays: HashSet<String> = kept.iter().map(Relation::to_string).collect();
        let mut fitted = Vec::new();

        for (a, b) in bucket.series.values().tuple_combinations() {
            if !comparable(&a.name, &b.name) {
                continue;
            }
            if !bucket.ever_nonzero.contains(&a.name.to_string())
                || !bucket.ever_nonzero.contains(&b.name.to_string())
            {
                continue;
            }
            // An exact equality or opposite already covers the pair.
            let covered = kept_displays
                .contains(&Relation::equal(a.name.clone(), b.name.clone()).to_string())
                || kept_displays
                    .contains(&Relation::opposite(a.name.clone(), b.name.clone()).to_string());
            if covered {
                continue;
            }

            let joint: Vec<(f64, f64)> = a
                .values
                .iter()
                .zip(&b.values)
                .filter_map(|(x, y)| Some((i256_to_f64((*x)?), i256_to_f64((*y)?))))
                .collect();
            // Strict: a fitted model needs more joint observations than the
            // confirmation threshold itself.
            if joint.len() as f64 <= threshold {
                continue;
            }
            let xs: Vec<f64> = joint.iter().map(|(x, _)| *x).collect();
            let ys: Vec<f64> = joint.iter().map(|(_, y)| *y).collect();

            if let Some(fit) = linear_fit(&xs, &ys) {
                // The identity line restates the equality kind.
                let identity = nearly_equal(fit.slope, 1.0) && nearly_equal(fit.intercept, 0.0);
                let exact = xs
                    .iter()
                    .zip(&ys)
                    .all(|(x, y)| nearly_equal(*y, fit.slope * x + fit.intercept));
                if !identity && fit.r_squared >= self.options.r_squared_threshold && exact {
                    fitted.push(Relation::Linear {
                        x: a.name.clone(),
                        y: b.name.clone(),
                        slope: fit.slope,
                        intercept: fit.intercept,
                    });
                    continue;
                }
            }
            if let Some(product) = constant_product(&xs, &ys) {
                fitted.push(Relation::InverseProduct {
                    x: a.name.clone(),
                    y: b.name.clone(),
                    product,
                });
            }
        }
        fitted
    }
}

/// Proposes every candidate relation one trace supports.
fn propose(trace: &Dtrace) -> Vec<Relation> {
    let variables: Vec<_> = trace.variables.values().collect();
    let mut candidates = Vec::new();

    for variable in &variables {
        candidates.push(Relation::Constant {
            var: variable.name.clone(),
            value: variable.value.clone(),
        });
    }

    for (a, b) in variables.iter().tuple_combinations() {
        if comparable(&a.name, &b.name) {
            if a.value == b.value {
                candidates.push(Relation::equal(a.name.clone(), b.name.clone()));
            }
            if let (Some(ia), Some(ib)) = (a.value.as_int(), b.value.as_int()) {
                if ia == ib.wrapping_neg() && ia != I256::ZERO {
                    candidates.push(Relation::opposite(a.name.clone(), b.name.clone()));
                }
            }
        }
    }

    // Ordered pairs for the asymmetric membership kinds.
    for element in &variables {
        for aggregate in &variables {
            if element.name == aggregate.name || !comparable(&element.name, &aggregate.name) {
                continue;
            }
            if let (TraceVal::Scalar(scalar), TraceVal::List(values)) =
                (&element.value, &aggregate.value)
            {
                if values.contains(scalar) {
                    candidates.push(Relation::Membership {
                        element: element.name.clone(),
                        aggregate: aggregate.name.clone(),
                    });
                }
            }
            if interesting_for_bytes(&element.value) {
                let needle = relation::hex_content(&element.value);
                let haystack = relation::hex_content(&aggregate.value);
                if haystack.len() > needle.len() && haystack.contains(&needle) {
                    candidates.push(Relation::BytesMembership {
                        element: element.name.clone(),
                        aggregate: aggregate.name.clone(),
                    });
                }
            }
        }
    }

    generalise(trace, &mut candidates);
    candidates
}

/// Checks whether a value is distinctive enough for byte-substring
/// membership; tiny integers and short strings match everywhere.
fn interesting_for_bytes(value: &TraceVal) -> bool {
    match value {
        TraceVal::Scalar(ScalarValue::Int(int)) => {
            let magnitude = int.unsigned_abs();
            magnitude >= ethnum::U256::from(BYTES_MEMBERSHIP_MIN_INT.unsigned_abs())
        }
        TraceVal::Scalar(ScalarValue::Str(text)) => text.len() >= BYTES_MEMBERSHIP_MIN_STR_LEN,
        TraceVal::Scalar(ScalarValue::Address(_)) => true,
        TraceVal::Scalar(ScalarValue::Bytes(bytes)) => {
            bytes.len() * 2 >= BYTES_MEMBERSHIP_MIN_STR_LEN
        }
        TraceVal::Scalar(ScalarValue::Bool(_)) | TraceVal::List(_) => false,
    }
}

/// Extends the candidate pool with inference relations: every literal key a
/// candidate mentions is substituted with each variable currently carrying
/// that value, to a fixed point.
fn generalise(trace: &Dtrace, candidates: &mut Vec<Relation>) {
    // Value rendering to the variables currently carrying it.
    let mut carriers: HashMap<String, Vec<(ScalarValue, VariableName)>> = HashMap::new();
    for variable in trace.variables.values() {
        let Some(scalar) = variable.value.as_scalar() else {
            continue;
        };
        let rendered = scalar.to_string();
        if rendered.len() < GENERALISATION_MIN_VALUE_LEN || variable.name.is_generalised() {
            continue;
        }
        carriers
            .entry(rendered)
            .or_default()
            .push((scalar.clone(), variable.name.clone()));
    }

    let mut known: HashSet<String> = candidates.iter().map(Relation::to_string).collect();
    let mut worklist: Vec<Relation> = candidates.clone();

    while let Some(relation) = worklist.pop() {
        for name in relation.referenced() {
            for key in name.literal_keys() {
                let Some(sources) = carriers.get(&key.to_string()) else {
                    continue;
                };
                for (value, replacement) in sources {
                    // A carrier that itself mentions the key would resolve
                    // in circles.
                    if replacement.contains_value(value) {
                        continue;
                    }
                    let inferred = Relation::Inference {
                        base: Box::new(relation.clone()),
                        value: value.clone(),
                        replacement: replacement.clone(),
                    };
                    let rendered = inferred.to_string();
                    if known.insert(rendered) {
                        candidates.push(inferred.clone());
                        worklist.push(inferred);
                    }
                }
            }
        }
    }
}

/// Removes invariants that become textually identical to another after
/// rewriting through the kept equalities.
fn remove_redundant(kept: Vec<Relation>) -> Vec<Relation> {
    let substitutions: Vec<(String, String)> = kept
        .iter()
        .filter_map(|relation| match relation {
            Relation::Equal { x, y } => Some((y.to_string(), x.to_string())),
            _ => None,
        })
        .collect();

    let displays: HashSet<String> = kept.iter().map(Relation::to_string).collect();

    kept.into_iter()
        .filter(|relation| {
            if matches!(relation, Relation::Equal { .. }) {
                return true;
            }
            let original = relation.to_string();
            for (from, to) in &substitutions {
                if !original.contains(from.as_str()) {
                    continue;
                }
                let mut rewritten = String::with_capacity(original.len());
                let mut rest = original.as_str();
                while let Some(at) = rest.find(from.as_str()) {
                    rewritten.push_str(&rest[..at]);
                    rewritten.push_str(to);
                    rest = &rest[at + from.len()..];
                }
                rewritten.push_str(rest);
                if rewritten != original && displays.contains(&rewritten) {
                    return false;
                }
            }
            true
        })
        .collect()
}
