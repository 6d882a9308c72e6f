//! This module contains the trace normalizer, which turns one observed call
//! into the flat, named variable records that mining and checking consume.
//!
//! Each call yields up to three records, one per granularity level. The
//! contract level sees only state across `pre` and `post`; the function level
//! adds the environment, decoded arguments and events; the branch level adds
//! the sub-call observation points. Structured state flattens into dotted
//! names, scalar arrays stay whole as ordered lists, mappings contribute
//! their discovered entries plus a `SUM` aggregate, and every integer
//! variable present both at `pre` and at a later point contributes a `change`
//! delta.

pub mod name;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{Display, Formatter},
};

use ethnum::I256;
use serde::{Deserialize, Serialize};

pub use self::name::{EnvVar, KeyAtom, Path, PathSegment, Point, Role, VariableName};
use crate::{
    decoder::{DecodeCache, ScalarValue, SemanticVariable, StateDecoder},
    layout::StorageLayout,
    trace::{ObservedCall, ObservedTransaction, TokenBalances},
    utility::Address,
};

/// The identity of one observed call across the corpus.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct TraceId {
    pub block_number: u64,
    pub position: u64,
    pub call_index: usize,
}

impl Display for TraceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.block_number, self.position, self.call_index)
    }
}

/// The granularity at which one record groups observations.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Contract,
    Function,
    Branch,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contract => write!(f, "contract"),
            Self::Function => write!(f, "function"),
            Self::Branch => write!(f, "branch"),
        }
    }
}

/// The value of one trace variable: a scalar, or the whole ordered content of
/// a scalar array.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceVal {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

impl TraceVal {
    /// Returns the integer content, if this is an integer scalar.
    #[must_use]
    pub fn as_int(&self) -> Option<I256> {
        match self {
            Self::Scalar(value) => value.as_int(),
            Self::List(_) => None,
        }
    }

    /// Returns the address content, if this is an address scalar.
    #[must_use]
    pub fn as_address(&self) -> Option<Address> {
        match self {
            Self::Scalar(value) => value.as_address(),
            Self::List(_) => None,
        }
    }

    /// Returns the scalar content, if this is a scalar.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            Self::Scalar(value) => Some(value),
            Self::List(_) => None,
        }
    }

    /// Checks whether the value is zero in its kind (lists: empty or all
    /// zero).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Scalar(value) => value.is_zero(),
            Self::List(values) => values.iter().all(ScalarValue::is_zero),
        }
    }
}

impl Display for TraceVal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(value) => write!(f, "{value}"),
            Self::List(values) => {
                write!(f, "[")?;
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{value}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One variable within a normalized record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TraceValue {
    pub name: VariableName,

    pub value: TraceVal,

    /// The declared type of the variable, e.g. `uint256`.
    #[serde(rename = "type")]
    pub type_label: String,
}

/// One normalized record: the flat variables of one call at one level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dtrace {
    pub id: TraceId,

    /// The mining bucket this record belongs to.
    pub bucket: String,

    pub level: Level,

    /// The observation points present, in chronological order.
    pub points: Vec<Point>,

    /// The sender of the observed call.
    pub sender: Address,

    /// The externally-owned account that sent the enclosing transaction.
    pub origin: Address,

    /// The variables, keyed by their dotted rendering.
    pub variables: BTreeMap<String, TraceValue>,
}

impl Dtrace {
    /// Looks up a variable by its structural name.
    #[must_use]
    pub fn value_of(&self, name: &VariableName) -> Option<&TraceValue> {
        self.variables.get(&name.to_string())
    }

    fn insert(&mut self, name: VariableName, value: TraceVal, type_label: &str) {
        self.variables.insert(
            name.to_string(),
            TraceValue {
                name,
                value,
                type_label: type_label.to_owned(),
            },
        );
    }
}

/// A flattened variable before point wrapping.
type Entry = (VariableName, TraceVal, String);

/// The trace normalizer for one contract.
#[derive(Clone, Copy, Debug)]
pub struct Normalizer<'a> {
    layout: &'a StorageLayout,
}

impl<'a> Normalizer<'a> {
    /// Creates a normalizer over the provided layout.
    #[must_use]
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    /// Normalizes one observed call into its per-level records.
    ///
    /// The cache accumulates witnesses and carried-forward storage across
    /// calls, so records must be produced in corpus order.
    #[must_use]
    pub fn normalize(
        &self,
        tx: &ObservedTransaction,
        call: &ObservedCall,
        cache: &mut DecodeCache,
    ) -> Vec<Dtrace> {
        // The call's own scalars are witnesses for every point of the call.
        cache.witnesses.insert(&ScalarValue::Address(call.sender));
        cache.witnesses.insert(&ScalarValue::Address(call.callee));
        for (_, argument) in &call.arguments {
            cache.witnesses.absorb(argument);
        }
        for event in &call.events {
            for (_, argument) in &event.arguments {
                cache.witnesses.absorb(argument);
            }
        }

        let decoder = StateDecoder::new(self.layout);
        let mut state_at: Vec<(Point, Vec<Entry>)> = Vec::new();
        let mut balances_at: Vec<(Point, &TokenBalances)> = Vec::new();

        let mut decode_point = |point: Point, words, cache: &mut DecodeCache| {
            let view = cache.view(words);
            let state = decoder.decode_state(&view, &mut cache.witnesses);
            cache.absorb_storage(words);
            state_at.push((point, flatten_state(&state)));
        };

        decode_point(Point::Pre, &call.pre_storage, cache);
        balances_at.push((Point::Pre, &call.pre_token_balances));
        for sub_call in &call.sub_calls {
            decode_point(Point::SubCallPre(sub_call.location), &sub_call.pre_storage, cache);
            balances_at.push((Point::SubCallPre(sub_call.location), &sub_call.pre_token_balances));
            decode_point(
                Point::SubCallPost(sub_call.location),
                &sub_call.post_storage,
                cache,
            );
            balances_at.push((
                Point::SubCallPost(sub_call.location),
                &sub_call.post_token_balances,
            ));
        }
        decode_point(Point::Post, &call.post_storage, cache);
        balances_at.push((Point::Post, &call.post_token_balances));

        let env_entries = environment_entries(tx, call);
        let method_entries = argument_entries(call);
        let event_entries = event_entries(call);

        let pre_state = state_at
            .iter()
            .find(|(point, _)| *point == Point::Pre)
            .map(|(_, entries)| entries.as_slice())
            .unwrap_or_default();
        let token_entries = token_balance_entries(
            &balances_at,
            call,
            &method_entries,
            &event_entries,
            pre_state,
        );

        let changes = change_entries(&state_at, &token_entries);

        let all_points: Vec<Point> = state_at.iter().map(|(point, _)| *point).collect();

        let mut records = Vec::with_capacity(3);
        records.push(self.assemble(
            tx,
            call,
            Level::Contract,
            call.callee.to_string(),
            &[Point::Pre, Point::Post],
            &[],
            &state_at,
            &token_entries,
            &changes,
        ));
        records.push(self.assemble(
            tx,
            call,
            Level::Function,
            format!("{}.{}", call.callee, call.signature),
            &[Point::Pre, Point::Post],
            &[&env_entries, &method_entries, &event_entries],
            &state_at,
            &token_entries,
            &changes,
        ));
        if let Some(branch) = &call.branch {
            records.push(self.assemble(
                tx,
                call,
                Level::Branch,
                format!("{}.{}:{}", call.callee, call.signature, branch),
                &all_points,
                &[&env_entries, &method_entries, &event_entries],
                &state_at,
                &token_entries,
                &changes,
            ));
        }
        records
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        tx: &ObservedTransaction,
        call: &ObservedCall,
        level: Level,
        bucket: String,
        points: &[Point],
        unpointed: &[&[Entry]],
        state_at: &[(Point, Vec<Entry>)],
        token_entries: &[(Point, Vec<Entry>)],
        changes: &[(Point, Vec<Entry>)],
    ) -> Dtrace {
        let mut record = Dtrace {
            id: TraceId {
                block_number: tx.block_number,
                position: tx.position,
                call_index: call.index,
            },
            bucket,
            level,
            points: points.to_vec(),
            sender: call.sender,
            origin: tx.origin,
            variables: BTreeMap::new(),
        };

        for entries in unpointed {
            for (name, value, type_label) in *entries {
                record.insert(name.clone(), value.clone(), type_label);
            }
        }

        let wanted: HashSet<Point> = points.iter().copied().collect();
        for (point, entries) in state_at.iter().chain(token_entries) {
            if !wanted.contains(point) {
                continue;
            }
            for (name, value, type_label) in entries {
                record.insert(name.clone().at(*point), value.clone(), type_label);
            }
        }
        for (point, entries) in changes {
            if !wanted.contains(point) {
                continue;
            }
            for (name, value, type_label) in entries {
                record.insert(name.clone(), value.clone(), type_label);
            }
        }
        record
    }
}

/// Flattens decoded state variables into dotted leaf entries.
fn flatten_state(state: &[(String, SemanticVariable)]) -> Vec<Entry> {
    let mut entries = Vec::new();
    for (label, variable) in state {
        let root = label.clone();
        flatten_into(
            &|path| VariableName::State {
                name: root.clone(),
                path,
            },
            Path::root(),
            variable,
            &mut entries,
        );
    }
    entries
}

/// Flattens one structured variable into leaf entries under `make`.
fn flatten_into(
    make: &dyn Fn(Path) -> VariableName,
    path: Path,
    variable: &SemanticVariable,
    out: &mut Vec<Entry>,
) {
    match variable {
        SemanticVariable::Scalar(field) => {
            out.push((
                make(path),
                TraceVal::Scalar(field.value.clone()),
                field.type_label.clone(),
            ));
        }
        SemanticVariable::Struct(members) => {
            for (member, value) in members {
                flatten_into(make, path.clone().field(member.clone()), value, out);
            }
        }
        SemanticVariable::Array(elements) => {
            // Scalar arrays stay whole so aggregate membership can see them;
            // arrays of structured values flatten element-wise.
            let scalars: Option<Vec<ScalarValue>> = elements
                .iter()
                .map(|e| e.as_scalar().map(|f| f.value.clone()))
                .collect();
            match scalars {
                Some(values) => {
                    let label = elements
                        .first()
                        .and_then(SemanticVariable::as_scalar)
                        .map(|f| format!("{}[]", f.type_label))
                        .unwrap_or_else(|| "[]".to_owned());
                    out.push((make(path), TraceVal::List(values), label));
                }
                None => {
                    for (index, element) in elements.iter().enumerate() {
                        let key = ScalarValue::Int(I256::new(index as i128));
                        flatten_into(make, path.clone().key(key), element, out);
                    }
                }
            }
        }
        SemanticVariable::Mapping(mapping) => {
            let mut sum = I256::ZERO;
            for (key, value) in mapping {
                if let Some(int) = value.as_scalar().and_then(|f| f.value.as_int()) {
                    sum = sum.wrapping_add(int);
                }
                flatten_into(make, path.clone().key(key.clone()), value, out);
            }
            out.push((
                make(path.sum()),
                TraceVal::Scalar(ScalarValue::Int(sum)),
                "uint256".to_owned(),
            ));
        }
    }
}

fn environment_entries(tx: &ObservedTransaction, call: &ObservedCall) -> Vec<Entry> {
    vec![
        (
            VariableName::Env(EnvVar::Callee),
            TraceVal::Scalar(ScalarValue::Address(call.callee)),
            "address".to_owned(),
        ),
        (
            VariableName::Env(EnvVar::Sender),
            TraceVal::Scalar(ScalarValue::Address(call.sender)),
            "address".to_owned(),
        ),
        (
            VariableName::Env(EnvVar::MsgValue),
            TraceVal::Scalar(ScalarValue::Int(call.value)),
            "uint256".to_owned(),
        ),
        (
            VariableName::Env(EnvVar::Timestamp),
            TraceVal::Scalar(ScalarValue::Int(I256::new(tx.timestamp as i128))),
            "uint256".to_owned(),
        ),
        (
            VariableName::Env(EnvVar::BlockNumber),
            TraceVal::Scalar(ScalarValue::Int(I256::new(tx.block_number as i128))),
            "uint256".to_owned(),
        ),
    ]
}

fn argument_entries(call: &ObservedCall) -> Vec<Entry> {
    let mut entries = Vec::new();
    for (argument, variable) in &call.arguments {
        flatten_into(
            &|path| VariableName::Method { path },
            Path::root().field(argument.clone()),
            variable,
            &mut entries,
        );
    }
    entries
}

/// Flattens event arguments; only the first instance of each event name
/// contributes, so repeated emissions do not overwrite each other with their
/// final occurrence.
fn event_entries(call: &ObservedCall) -> Vec<Entry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for event in &call.events {
        if !seen.insert(event.name.clone()) {
            continue;
        }
        for (argument, variable) in &event.arguments {
            let event_name = event.name.clone();
            flatten_into(
                &|path| VariableName::Event {
                    name: event_name.clone(),
                    path,
                },
                Path::root().field(argument.clone()),
                variable,
                &mut entries,
            );
        }
    }
    entries
}

/// Builds the per-point token balance entries.
///
/// Holders whose balance is zero at every observed point are pruned. Each
/// surviving holder is attributed to the address-valued variables that carry
/// its address (roles); every token additionally carries an `all` aggregate
/// over its surviving holders.
fn token_balance_entries(
    balances_at: &[(Point, &TokenBalances)],
    call: &ObservedCall,
    method_entries: &[Entry],
    event_entries: &[Entry],
    pre_state: &[Entry],
) -> Vec<(Point, Vec<Entry>)> {
    // (token, holder) pairs carrying a non-zero balance somewhere.
    let mut alive: HashSet<(Address, Address)> = HashSet::new();
    for (_, balances) in balances_at {
        for (token, holders) in balances.iter() {
            for (holder, value) in holders {
                if *value != I256::ZERO {
                    alive.insert((*token, *holder));
                }
            }
        }
    }

    let mut roles: HashMap<Address, Vec<VariableName>> = HashMap::new();
    {
        let mut add_role = |holder: Address, name: &VariableName| {
            let entry = roles.entry(holder).or_default();
            if !entry.contains(name) {
                entry.push(name.clone());
            }
        };

        add_role(call.sender, &VariableName::Env(EnvVar::Sender));
        add_role(call.callee, &VariableName::Env(EnvVar::Callee));
        for (name, value, _) in method_entries.iter().chain(event_entries).chain(pre_state) {
            if let Some(address) = value.as_address() {
                add_role(address, name);
            }
        }
    }

    let mut result = Vec::new();
    for (point, balances) in balances_at {
        let mut entries = Vec::new();
        for (token, holders) in balances.iter() {
            let token_atom = KeyAtom::Value(ScalarValue::Address(*token));
            let mut total = I256::ZERO;
            let mut any = false;

            for (holder, value) in holders {
                if !alive.contains(&(*token, *holder)) {
                    continue;
                }
                total = total.wrapping_add(*value);
                any = true;

                for role in roles.get(holder).map(Vec::as_slice).unwrap_or_default() {
                    entries.push((
                        VariableName::TokenBalance {
                            token: token_atom.clone(),
                            role: Role::Var(Box::new(role.clone())),
                        },
                        TraceVal::Scalar(ScalarValue::Int(*value)),
                        "uint256".to_owned(),
                    ));
                }
            }

            if any {
                entries.push((
                    VariableName::TokenBalance {
                        token: token_atom,
                        role: Role::All,
                    },
                    TraceVal::Scalar(ScalarValue::Int(total)),
                    "uint256".to_owned(),
                ));
            }
        }
        result.push((*point, entries));
    }
    result
}

/// Builds the `change` deltas: for every integer variable present at `pre`
/// and at a later point, the difference between the two observations.
fn change_entries(
    state_at: &[(Point, Vec<Entry>)],
    token_entries: &[(Point, Vec<Entry>)],
) -> Vec<(Point, Vec<Entry>)> {
    let mut at_pre: HashMap<String, I256> = HashMap::new();
    for (point, entries) in state_at.iter().chain(token_entries) {
        if *point != Point::Pre {
            continue;
        }
        for (name, value, _) in entries {
            if let Some(int) = value.as_int() {
                at_pre.insert(name.to_string(), int);
            }
        }
    }

    let mut merged: Vec<(Point, Vec<Entry>)> = Vec::new();
    for (point, entries) in state_at.iter().chain(token_entries) {
        if *point == Point::Pre {
            continue;
        }
        let mut deltas = Vec::new();
        for (name, value, _) in entries {
            let Some(int) = value.as_int() else { continue };
            let Some(pre) = at_pre.get(&name.to_string()) else {
                continue;
            };
            deltas.push((
                name.clone().change(*point),
                TraceVal::Scalar(ScalarValue::Int(int.wrapping_sub(*pre))),
                "int256".to_owned(),
            ));
        }
        match merged.iter_mut().find(|(p, _)| *p == *point) {
            Some((_, existing)) => existing.extend(deltas),
            None => merged.push((*point, deltas)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::StorageWords,
        trace::{DecodedEvent, ObservedCall, ObservedTransaction},
        utility::{decode_word, U256W},
    };

    fn layout() -> StorageLayout {
        StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "total", "offset": 0, "slot": "0", "type": "t_uint256"}
            ],
            "types": {
                "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"}
            }
        }"#,
        )
        .unwrap()
    }

    fn words(value: u8) -> StorageWords {
        let mut words = StorageWords::new();
        words.insert(U256W::from(0u64), decode_word(&format!("0x{value:02x}")).unwrap());
        words
    }

    fn observed_call() -> (ObservedTransaction, ObservedCall) {
        let sender = Address::from_hex("0x00000000000000000000000000000000000000ee").unwrap();
        let callee = Address::from_hex("0x00000000000000000000000000000000000000cc").unwrap();

        let call = ObservedCall {
            index: 0,
            function: "mint".into(),
            signature: "mint(uint256)".into(),
            branch: Some("7-9".into()),
            sender,
            callee,
            value: I256::ZERO,
            arguments: vec![(
                "amount".into(),
                SemanticVariable::scalar(ScalarValue::Int(I256::new(5)), "uint256"),
            )],
            events: vec![
                DecodedEvent {
                    name: "Minted".into(),
                    arguments: vec![(
                        "amount".into(),
                        SemanticVariable::scalar(ScalarValue::Int(I256::new(5)), "uint256"),
                    )],
                },
                DecodedEvent {
                    name: "Minted".into(),
                    arguments: vec![(
                        "amount".into(),
                        SemanticVariable::scalar(ScalarValue::Int(I256::new(99)), "uint256"),
                    )],
                },
            ],
            pre_storage: words(10),
            post_storage: words(15),
            pre_token_balances: TokenBalances::new(),
            post_token_balances: TokenBalances::new(),
            sub_calls: vec![],
        };
        let tx = ObservedTransaction {
            block_number: 50,
            position: 2,
            timestamp: 1_700_000_000,
            origin: sender,
            calls: vec![call.clone()],
        };
        (tx, call)
    }

    #[test]
    fn produces_one_record_per_level() {
        let layout = layout();
        let normalizer = Normalizer::new(&layout);
        let (tx, call) = observed_call();
        let mut cache = DecodeCache::new(false);

        let records = normalizer.normalize(&tx, &call, &mut cache);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].level, Level::Contract);
        assert_eq!(records[1].level, Level::Function);
        assert_eq!(records[2].level, Level::Branch);

        assert_eq!(records[0].bucket, call.callee.to_string());
        assert_eq!(
            records[1].bucket,
            format!("{}.mint(uint256)", call.callee)
        );
        assert_eq!(
            records[2].bucket,
            format!("{}.mint(uint256):7-9", call.callee)
        );
    }

    #[test]
    fn computes_change_variables() {
        let layout = layout();
        let normalizer = Normalizer::new(&layout);
        let (tx, call) = observed_call();
        let mut cache = DecodeCache::new(false);

        let records = normalizer.normalize(&tx, &call, &mut cache);
        let function = &records[1];

        let change = function
            .variables
            .get("change.post(variable.total)")
            .unwrap();
        assert_eq!(change.value, TraceVal::Scalar(ScalarValue::Int(I256::new(5))));

        let pre = function.variables.get("pre(variable.total)").unwrap();
        assert_eq!(pre.value, TraceVal::Scalar(ScalarValue::Int(I256::new(10))));
    }

    #[test]
    fn contract_level_carries_no_arguments() {
        let layout = layout();
        let normalizer = Normalizer::new(&layout);
        let (tx, call) = observed_call();
        let mut cache = DecodeCache::new(false);

        let records = normalizer.normalize(&tx, &call, &mut cache);
        assert!(!records[0].variables.contains_key("method.amount"));
        assert!(records[1].variables.contains_key("method.amount"));
        assert!(records[1].variables.contains_key("msg.sender"));
    }

    #[test]
    fn only_the_first_event_instance_contributes() {
        let layout = layout();
        let normalizer = Normalizer::new(&layout);
        let (tx, call) = observed_call();
        let mut cache = DecodeCache::new(false);

        let records = normalizer.normalize(&tx, &call, &mut cache);
        let value = records[1].variables.get("event.Minted.amount").unwrap();
        assert_eq!(value.value, TraceVal::Scalar(ScalarValue::Int(I256::new(5))));
    }

    #[test]
    fn scalar_arrays_stay_whole() {
        let entries = {
            let variable = SemanticVariable::Array(vec![
                SemanticVariable::scalar(ScalarValue::Int(I256::new(1)), "uint256"),
                SemanticVariable::scalar(ScalarValue::Int(I256::new(2)), "uint256"),
            ]);
            let mut out = Vec::new();
            flatten_into(
                &|path| VariableName::State {
                    name: "history".into(),
                    path,
                },
                Path::root(),
                &variable,
                &mut out,
            );
            out
        };

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.to_string(), "variable.history");
        assert_eq!(
            entries[0].1,
            TraceVal::List(vec![
                ScalarValue::Int(I256::new(1)),
                ScalarValue::Int(I256::new(2))
            ])
        );
    }
}
