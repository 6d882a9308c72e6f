//! This library implements dynamic specification mining over replayed
//! [EVM](https://ethereum.org/en/developers/docs/evm/) transaction traces: it
//! observes how a watched contract's storage actually behaves across a corpus
//! of transactions, mines the behavioural invariants that hold throughout,
//! and then acts as a runtime oracle that flags transactions breaking them.
//! It is a _best effort_ analysis; the mined invariants are only as good as
//! the corpus they were mined from.
//!
//! Note that this library is not intended to be nor expected to evolve into a
//! static analyser or verifier for EVM bytecode.
//!
//! # How it Works
//!
//! From a very high level, the mining process is performed as follows:
//!
//! 1. A raw replayed transaction is ingested as a [`trace::RawTransaction`]:
//!    the full call tree with per-call storage snapshots, token balance
//!    snapshots, emitted logs and taken-branch paths.
//! 2. The [`trace::TraceExtractor`] walks the tree and keeps every non-view
//!    call into the watched contract, decoding its calldata and events
//!    against the contract's ABI.
//! 3. The [`decoder::StateDecoder`] decodes each storage snapshot against the
//!    contract's compiler-emitted [`layout::StorageLayout`], growing a
//!    witness set of observed addresses and integers to discover mapping
//!    entries.
//! 4. The [`normalize::Normalizer`] flattens each observed call into named
//!    variable records at three granularities (contract, function and
//!    branch), including per-variable deltas and mapping sums.
//! 5. The [`mining::Miner`] proposes candidate relations over the records of
//!    each bucket, confirms them over the remaining observations, and reports
//!    the survivors as an [`mining::InvariantSet`].
//! 6. The [`checker`] replays further records against a mined set and
//!    reports every [`checker::Violation`].
//!
//! # Basic Usage
//!
//! For the most basic usage of the library, it is sufficient to construct an
//! `Analysis`, feed it transactions and call `.mine()`.
//!
//! ```
//! use invariant_oracle::{
//!     analyzer::{Analysis, Config},
//!     layout::StorageLayout,
//!     trace::{ContractAbi, RawTransaction},
//!     utility::Address,
//! };
//!
//! let layout = StorageLayout::from_json(
//!     r#"{
//!     "storage": [{"label": "total", "offset": 0, "slot": "0", "type": "t_uint256"}],
//!     "types": {
//!         "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"}
//!     }
//! }"#,
//! )
//! .unwrap();
//!
//! let abi = ContractAbi::from_json(
//!     r#"[{
//!     "type": "function",
//!     "name": "mint",
//!     "stateMutability": "nonpayable",
//!     "inputs": [{"name": "amount", "type": "uint256"}]
//! }]"#,
//! )
//! .unwrap();
//!
//! let target = Address::from_hex("0x00000000000000000000000000000000000000cc").unwrap();
//! let config = Config {
//!     minimum_occurrences: 2,
//!     ..Config::default()
//! };
//! let mut analysis = Analysis::new(layout, abi, target, config).unwrap();
//!
//! // Two mints of 5, raising `total` from 20 to 25 and from 25 to 30.
//! let mint = |block: u64, timestamp: u64, pre: &str, post: &str| {
//!     RawTransaction::from_json(&format!(
//!         r#"{{
//!         "blockNumber": {block},
//!         "position": 0,
//!         "timestamp": {timestamp},
//!         "call": {{
//!             "type": "CALL",
//!             "from": "0x00000000000000000000000000000000000000ee",
//!             "to": "0x00000000000000000000000000000000000000cc",
//!             "input": "0xa0712d680000000000000000000000000000000000000000000000000000000000000005",
//!             "preState": {{"0x00000000000000000000000000000000000000cc": {{"0x0": "{pre}"}}}},
//!             "postState": {{"0x00000000000000000000000000000000000000cc": {{"0x0": "{post}"}}}}
//!         }}
//!     }}"#
//!     ))
//!     .unwrap()
//! };
//! analysis.observe(&mint(1, 1_700_000_000, "0x14", "0x19"));
//! analysis.observe(&mint(2, 1_700_000_100, "0x19", "0x1e"));
//!
//! let invariants = analysis.mine().unwrap();
//! let bucket =
//!     &invariants.buckets["0x00000000000000000000000000000000000000cc.mint(uint256)"];
//! assert!(bucket
//!     .iter()
//!     .any(|inv| inv.name == "change.post(variable.total) == method.amount"));
//! ```

#![warn(clippy::all, clippy::cargo, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)] // Allows for better API naming

pub mod analyzer;
pub mod checker;
pub mod constant;
pub mod decoder;
pub mod error;
pub mod layout;
pub mod mining;
pub mod normalize;
pub mod trace;
pub mod utility;

// Re-exports to provide the library interface.
pub use analyzer::new;
pub use layout::StorageLayout;
pub use mining::InvariantSet;
