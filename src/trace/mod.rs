//! This module contains the raw transaction-trace model and the extraction
//! walk that turns each raw trace into the observed calls of one watched
//! contract.
//!
//! A raw trace is the instrumented output of transaction replay: the full
//! call tree with per-call storage snapshots, token balance snapshots, emitted
//! logs and the taken-branch path. Extraction walks the tree depth-first and
//! keeps every non-view call into the watched address, decoding its calldata
//! and self-emitted events against the contract's ABI.

pub mod abi;

use std::collections::{BTreeMap, HashMap};

use ethnum::I256;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use self::abi::{AbiEntry, AbiEvent, AbiFunction, AbiParameter, ContractAbi};
use crate::{
    constant::SELECTOR_WIDTH_BYTES,
    decoder::{ScalarValue, SemanticVariable, StorageWords},
    error::extraction,
    utility::{decode_hex, decode_word, u256_to_i256, Address, U256W},
};

/// Per-token, per-holder balances at one observation point.
pub type TokenBalances = BTreeMap<Address, BTreeMap<Address, I256>>;

/// A raw replayed transaction as produced by the tracer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(rename = "blockNumber")]
    pub block_number: u64,

    /// The transaction's position within its block.
    pub position: u64,

    /// The block timestamp, in seconds.
    #[serde(default)]
    pub timestamp: u64,

    /// The root of the call tree.
    pub call: RawCall,
}

impl RawTransaction {
    /// Parses one raw transaction from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns [`extraction::Error::InvalidTransaction`] if the JSON does not
    /// have the expected shape.
    pub fn from_json(source: &str) -> extraction::Result<Self> {
        serde_json::from_str(source).map_err(|e| extraction::Error::InvalidTransaction {
            reason: e.to_string(),
        })
    }
}

/// One node of the raw call tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawCall {
    /// The EVM call kind: `CALL`, `DELEGATECALL`, `STATICCALL`, `CREATE`...
    #[serde(rename = "type")]
    pub call_type: String,

    pub from: Address,

    /// Absent for contract-creating calls.
    #[serde(default)]
    pub to: Option<Address>,

    /// The wei sent along with the call.
    #[serde(default)]
    pub value: Option<U256W>,

    /// The hex-encoded calldata.
    #[serde(default)]
    pub input: Option<String>,

    /// The execution error, when the call reverted or otherwise failed.
    #[serde(default)]
    pub err: Option<String>,

    #[serde(default)]
    pub calls: Vec<RawCall>,

    #[serde(default)]
    pub logs: Vec<RawLog>,

    /// Storage words read or written during the call, keyed by account and
    /// then by slot, as of call entry.
    #[serde(rename = "preState", default)]
    pub pre_state: HashMap<Address, HashMap<String, String>>,

    /// Storage words as of call exit.
    #[serde(rename = "postState", default)]
    pub post_state: HashMap<Address, HashMap<String, String>>,

    /// Token balances as of call entry, keyed by token and then by holder.
    #[serde(rename = "preTokenBalance", default)]
    pub pre_token_balance: HashMap<Address, HashMap<Address, String>>,

    /// Token balances as of call exit.
    #[serde(rename = "postTokenBalance", default)]
    pub post_token_balance: HashMap<Address, HashMap<Address, String>>,

    /// The taken-branch path of the call, as `pc-dest` pairs joined with `-`.
    #[serde(default)]
    pub branch: Option<String>,

    /// The position of the call site within the enclosing call.
    #[serde(rename = "callLocation", default)]
    pub call_location: Option<u64>,
}

impl RawCall {
    /// Checks whether this call or any call beneath it failed.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.err.is_some() || self.calls.iter().any(RawCall::has_error)
    }
}

/// One emitted log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawLog {
    pub address: Address,

    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default)]
    pub data: String,
}

/// A decoded event emitted by the watched contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub name: String,

    pub arguments: Vec<(String, SemanticVariable)>,
}

/// The state observed around one nested call made by a target call.
#[derive(Clone, Debug)]
pub struct SubCallSnapshot {
    /// The call-site position used to key the snapshot's observation points.
    pub location: u64,

    pub pre_storage: StorageWords,
    pub post_storage: StorageWords,
    pub pre_token_balances: TokenBalances,
    pub post_token_balances: TokenBalances,
}

/// One extracted call into the watched contract.
#[derive(Clone, Debug)]
pub struct ObservedCall {
    /// The call's position in the extraction order within its transaction.
    pub index: usize,

    /// The function name, the selector in hex for unknown selectors, or
    /// `fallback` for selector-less calls.
    pub function: String,

    /// The canonical signature where the selector was known, otherwise the
    /// same as `function`.
    pub signature: String,

    /// The taken-branch path, when the tracer recorded one.
    pub branch: Option<String>,

    pub sender: Address,
    pub callee: Address,

    /// The wei sent along with the call, reinterpreted into the signed
    /// integer domain shared by all trace values.
    pub value: I256,

    pub arguments: Vec<(String, SemanticVariable)>,

    /// Events emitted by the watched contract itself during this call,
    /// including those emitted through `DELEGATECALL` into other code.
    pub events: Vec<DecodedEvent>,

    pub pre_storage: StorageWords,
    pub post_storage: StorageWords,
    pub pre_token_balances: TokenBalances,
    pub post_token_balances: TokenBalances,

    /// Snapshots around the direct nested calls, in call order.
    pub sub_calls: Vec<SubCallSnapshot>,
}

/// All calls into the watched contract extracted from one transaction.
#[derive(Clone, Debug)]
pub struct ObservedTransaction {
    pub block_number: u64,
    pub position: u64,
    pub timestamp: u64,

    /// The externally-owned account that sent the transaction.
    pub origin: Address,

    pub calls: Vec<ObservedCall>,
}

/// The extraction walk for one watched contract.
#[derive(Debug)]
pub struct TraceExtractor {
    abi: ContractAbi,
    target: Address,
    exclude_partial_err: bool,
}

impl TraceExtractor {
    /// Creates an extractor watching `target` with the provided ABI.
    #[must_use]
    pub fn new(abi: ContractAbi, target: Address, exclude_partial_err: bool) -> Self {
        Self {
            abi,
            target,
            exclude_partial_err,
        }
    }

    /// The watched contract address.
    #[must_use]
    pub fn target(&self) -> Address {
        self.target
    }

    /// The ABI the extractor decodes against.
    #[must_use]
    pub fn abi(&self) -> &ContractAbi {
        &self.abi
    }

    /// Extracts the watched contract's calls from one raw transaction.
    ///
    /// Returns `None` when the transaction contains no target call, or when
    /// it contains a failed call anywhere and partial errors are excluded.
    /// Individual failed calls are always skipped; a revert undoes their
    /// state.
    #[must_use]
    pub fn extract(&self, raw: &RawTransaction) -> Option<ObservedTransaction> {
        if self.exclude_partial_err && raw.call.has_error() {
            debug!(
                block = raw.block_number,
                position = raw.position,
                "transaction contains a failed call, excluded"
            );
            return None;
        }

        let mut calls = Vec::new();
        self.collect(&raw.call, &mut calls);
        if calls.is_empty() {
            return None;
        }

        Some(ObservedTransaction {
            block_number: raw.block_number,
            position: raw.position,
            timestamp: raw.timestamp,
            origin: raw.call.from,
            calls,
        })
    }

    fn collect(&self, call: &RawCall, observed: &mut Vec<ObservedCall>) {
        if call.err.is_some() {
            return;
        }

        if self.is_target_call(call) {
            let index = observed.len();
            observed.push(self.observe(call, index));
        }

        for child in &call.calls {
            self.collect(child, observed);
        }
    }

    /// Checks whether `call` is a non-view entry into the watched contract.
    ///
    /// `DELEGATECALL` and `STATICCALL` never open an observation of their
    /// own; the former is folded into its enclosing target call and the
    /// latter cannot write state.
    fn is_target_call(&self, call: &RawCall) -> bool {
        if call.to != Some(self.target) {
            return false;
        }
        if !matches!(call.call_type.as_str(), "CALL" | "CREATE" | "CREATE2") {
            return false;
        }

        if let Some(selector) = self.selector_of(call) {
            if let Some(function) = self.abi.function(selector) {
                return !function.is_view;
            }
        }
        true
    }

    fn selector_of(&self, call: &RawCall) -> Option<[u8; SELECTOR_WIDTH_BYTES]> {
        let input = decode_hex(call.input.as_deref()?)?;
        input
            .get(..SELECTOR_WIDTH_BYTES)
            .and_then(|bytes| bytes.try_into().ok())
    }

    fn observe(&self, call: &RawCall, index: usize) -> ObservedCall {
        let (function, signature, arguments) = self.decode_call_input(call);

        let mut events = Vec::new();
        self.collect_events(call, &mut events);

        let sub_calls = call
            .calls
            .iter()
            .enumerate()
            .filter(|(_, child)| child.err.is_none())
            .filter(|(_, child)| {
                child.pre_state.contains_key(&self.target)
                    || child.post_state.contains_key(&self.target)
            })
            .map(|(position, child)| SubCallSnapshot {
                location: child.call_location.unwrap_or(position as u64),
                pre_storage: self.storage_of(&child.pre_state),
                post_storage: self.storage_of(&child.post_state),
                pre_token_balances: token_balances(&child.pre_token_balance),
                post_token_balances: token_balances(&child.post_token_balance),
            })
            .collect();

        ObservedCall {
            index,
            function,
            signature,
            branch: call.branch.clone(),
            sender: call.from,
            callee: call.to.unwrap_or(self.target),
            value: u256_to_i256(call.value.map(|v| v.0).unwrap_or_default()),
            arguments,
            events,
            pre_storage: self.storage_of(&call.pre_state),
            post_storage: self.storage_of(&call.post_state),
            pre_token_balances: token_balances(&call.pre_token_balance),
            post_token_balances: token_balances(&call.post_token_balance),
            sub_calls,
        }
    }

    /// Decodes the call's input into a function name, signature and argument
    /// list, degrading to a raw payload argument when the selector is unknown
    /// or the payload does not decode.
    fn decode_call_input(
        &self,
        call: &RawCall,
    ) -> (String, String, Vec<(String, SemanticVariable)>) {
        let input = call
            .input
            .as_deref()
            .and_then(decode_hex)
            .unwrap_or_default();

        if input.len() < SELECTOR_WIDTH_BYTES {
            let arguments = if input.is_empty() {
                Vec::new()
            } else {
                vec![raw_payload(input)]
            };
            return ("fallback".to_owned(), "fallback".to_owned(), arguments);
        }

        let mut selector = [0u8; SELECTOR_WIDTH_BYTES];
        selector.copy_from_slice(&input[..SELECTOR_WIDTH_BYTES]);
        let payload = &input[SELECTOR_WIDTH_BYTES..];

        match self.abi.function(selector) {
            Some(function) => {
                let arguments = match function.decode_arguments(payload) {
                    Ok(arguments) => arguments,
                    Err(error) => {
                        warn!(
                            signature = function.signature,
                            %error,
                            "argument decoding failed, keeping the raw payload"
                        );
                        vec![raw_payload(payload.to_vec())]
                    }
                };
                (function.name.clone(), function.signature.clone(), arguments)
            }
            None => {
                let name = format!("0x{}", hex::encode(selector));
                (name.clone(), name, vec![raw_payload(payload.to_vec())])
            }
        }
    }

    /// Gathers the watched contract's own events from this call and from any
    /// `DELEGATECALL` executed in its context.
    fn collect_events(&self, call: &RawCall, events: &mut Vec<DecodedEvent>) {
        for log in &call.logs {
            if log.address != self.target {
                continue;
            }
            if let Some(event) = self.decode_log(log) {
                events.push(event);
            }
        }

        for child in &call.calls {
            if child.call_type == "DELEGATECALL" && child.err.is_none() {
                self.collect_events(child, events);
            }
        }
    }

    fn decode_log(&self, log: &RawLog) -> Option<DecodedEvent> {
        let topics: Vec<[u8; 32]> = log
            .topics
            .iter()
            .filter_map(|t| decode_word(t))
            .collect();
        if topics.len() != log.topics.len() {
            debug!("malformed log topics, dropping the event");
            return None;
        }

        let event = self.abi.event(*topics.first()?)?;
        let data = decode_hex(&log.data).unwrap_or_default();

        match event.decode_arguments(&topics, &data) {
            Ok(arguments) => Some(DecodedEvent {
                name: event.name.clone(),
                arguments,
            }),
            Err(error) => {
                debug!(signature = event.signature, %error, "event decoding failed, dropped");
                None
            }
        }
    }

    /// Converts the watched contract's portion of a raw per-account storage
    /// snapshot into slot-keyed words.
    fn storage_of(&self, state: &HashMap<Address, HashMap<String, String>>) -> StorageWords {
        let mut words = StorageWords::new();
        let Some(slots) = state.get(&self.target) else {
            return words;
        };

        for (slot, word) in slots {
            let Some(slot) = decode_word(slot).map(ethnum::U256::from_be_bytes) else {
                warn!(%slot, "malformed slot address, skipped");
                continue;
            };
            let Some(word) = decode_word(word) else {
                warn!(%word, "malformed storage word, skipped");
                continue;
            };
            words.insert(U256W::from(slot), word);
        }
        words
    }
}

fn raw_payload(payload: Vec<u8>) -> (String, SemanticVariable) {
    (
        "rawbytes".to_owned(),
        SemanticVariable::scalar(ScalarValue::Bytes(payload), "bytes"),
    )
}

/// Parses a token-balance snapshot, accepting hex and decimal quantities.
fn token_balances(raw: &HashMap<Address, HashMap<Address, String>>) -> TokenBalances {
    let mut balances = TokenBalances::new();
    for (token, holders) in raw {
        let mut parsed = BTreeMap::new();
        for (holder, quantity) in holders {
            match parse_quantity(quantity) {
                Some(value) => {
                    parsed.insert(*holder, value);
                }
                None => warn!(%token, %holder, %quantity, "malformed token balance, skipped"),
            }
        }
        balances.insert(*token, parsed);
    }
    balances
}

fn parse_quantity(quantity: &str) -> Option<I256> {
    if quantity.starts_with("0x") {
        decode_word(quantity).map(|w| u256_to_i256(ethnum::U256::from_be_bytes(w)))
    } else {
        quantity.parse::<I256>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watched() -> Address {
        Address::from_hex("0x00000000000000000000000000000000000000cc").unwrap()
    }

    fn abi() -> ContractAbi {
        ContractAbi::from_json(
            r#"[
            {
                "type": "function",
                "name": "transfer",
                "stateMutability": "nonpayable",
                "inputs": [
                    {"name": "to", "type": "address"},
                    {"name": "amount", "type": "uint256"}
                ]
            },
            {
                "type": "function",
                "name": "balanceOf",
                "stateMutability": "view",
                "inputs": [{"name": "owner", "type": "address"}]
            }
        ]"#,
        )
        .unwrap()
    }

    fn transfer_input(to_low_byte: u8, amount: u8) -> String {
        let mut input = vec![0xa9, 0x05, 0x9c, 0xbb];
        let mut to = [0u8; 32];
        to[31] = to_low_byte;
        input.extend_from_slice(&to);
        let mut value = [0u8; 32];
        value[31] = amount;
        input.extend_from_slice(&value);
        format!("0x{}", hex::encode(input))
    }

    fn raw_transfer_tx(err: Option<String>) -> RawTransaction {
        let sender = Address::from_hex("0x00000000000000000000000000000000000000ee").unwrap();
        RawTransaction {
            block_number: 100,
            position: 1,
            timestamp: 1_700_000_000,
            call: RawCall {
                call_type: "CALL".into(),
                from: sender,
                to: Some(watched()),
                value: None,
                input: Some(transfer_input(0xaa, 5)),
                err,
                calls: vec![],
                logs: vec![],
                pre_state: HashMap::from([(
                    watched(),
                    HashMap::from([("0x0".to_owned(), "0x64".to_owned())]),
                )]),
                post_state: HashMap::from([(
                    watched(),
                    HashMap::from([("0x0".to_owned(), "0x5f".to_owned())]),
                )]),
                pre_token_balance: HashMap::new(),
                post_token_balance: HashMap::new(),
                branch: Some("12-34".into()),
                call_location: None,
            },
        }
    }

    #[test]
    fn extracts_and_decodes_a_target_call() {
        let extractor = TraceExtractor::new(abi(), watched(), true);
        let observed = extractor.extract(&raw_transfer_tx(None)).unwrap();

        assert_eq!(observed.calls.len(), 1);
        let call = &observed.calls[0];
        assert_eq!(call.function, "transfer");
        assert_eq!(call.signature, "transfer(address,uint256)");
        assert_eq!(call.arguments.len(), 2);
        assert_eq!(call.branch.as_deref(), Some("12-34"));

        let amount = call.arguments[1].1.as_scalar().unwrap();
        assert_eq!(amount.value.as_int(), Some(I256::new(5)));

        let pre = call.pre_storage.get(&U256W::from(0u64)).unwrap();
        assert_eq!(pre[31], 0x64);
    }

    #[test]
    fn failed_transactions_are_excluded_when_configured() {
        let extractor = TraceExtractor::new(abi(), watched(), true);
        assert!(extractor.extract(&raw_transfer_tx(Some("revert".into()))).is_none());
    }

    #[test]
    fn view_calls_are_not_targets() {
        let extractor = TraceExtractor::new(abi(), watched(), true);
        let mut raw = raw_transfer_tx(None);
        // balanceOf(address) selector.
        raw.call.input = Some(format!("0x70a08231{}", "00".repeat(32)));
        assert!(extractor.extract(&raw).is_none());
    }

    #[test]
    fn unknown_selectors_keep_the_raw_payload() {
        let extractor = TraceExtractor::new(abi(), watched(), true);
        let mut raw = raw_transfer_tx(None);
        raw.call.input = Some(format!("0xdeadbeef{}", "11".repeat(32)));

        let observed = extractor.extract(&raw).unwrap();
        let call = &observed.calls[0];
        assert_eq!(call.function, "0xdeadbeef");
        assert_eq!(call.arguments[0].0, "rawbytes");
    }

    #[test]
    fn nested_target_calls_are_observed_in_walk_order() {
        let extractor = TraceExtractor::new(abi(), watched(), false);
        let mut outer = raw_transfer_tx(None);
        let other = Address::from_hex("0x00000000000000000000000000000000000000dd").unwrap();

        let mut inner = outer.call.clone();
        inner.from = other;
        inner.input = Some(transfer_input(0xbb, 7));

        outer.call.to = Some(other);
        outer.call.input = None;
        outer.call.calls = vec![inner];

        let observed = extractor.extract(&outer).unwrap();
        assert_eq!(observed.calls.len(), 1);
        assert_eq!(observed.calls[0].index, 0);
        assert_eq!(observed.calls[0].sender, other);
    }
}
