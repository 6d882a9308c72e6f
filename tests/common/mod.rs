//! This module contains common utilities for simplifying the writing of
//! integration tests for this library.

#![cfg(test)]

use ethnum::U256;
use invariant_oracle::{
    analyzer::{Analysis, Config},
    decoder::{mapping_entry_slot, ScalarValue},
    layout::StorageLayout,
    trace::{ContractAbi, RawTransaction},
    utility::{keccak256, Address},
};

/// The storage layout of a small token: a balance mapping and a supply
/// counter.
pub const TOKEN_LAYOUT: &str = r#"{
    "storage": [
        {"label": "balances", "offset": 0, "slot": "0", "type": "t_mapping(t_address,t_uint256)"},
        {"label": "total", "offset": 0, "slot": "1", "type": "t_uint256"}
    ],
    "types": {
        "t_address": {"encoding": "inplace", "label": "address", "numberOfBytes": "20"},
        "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"},
        "t_mapping(t_address,t_uint256)": {
            "encoding": "mapping",
            "label": "mapping(address => uint256)",
            "numberOfBytes": "32",
            "key": "t_address",
            "value": "t_uint256"
        }
    }
}"#;

pub const TOKEN_ABI: &str = r#"[{
    "type": "function",
    "name": "burn",
    "stateMutability": "nonpayable",
    "inputs": [
        {"name": "from", "type": "address"},
        {"name": "amount", "type": "uint256"}
    ]
}]"#;

/// The watched token contract.
pub fn watched() -> Address {
    Address::from_hex("0x00000000000000000000000000000000000000cc").unwrap()
}

/// The externally-owned account sending every test transaction.
pub fn caller() -> Address {
    Address::from_hex("0x00000000000000000000000000000000000000ee").unwrap()
}

/// A token holder distinguished by its low byte.
pub fn holder(low: u8) -> Address {
    let mut bytes = [0u8; 20];
    bytes[19] = low;
    Address(bytes)
}

/// Constructs an analysis of the test token.
#[allow(unused)]
pub fn new_analysis(minimum_occurrences: usize) -> anyhow::Result<Analysis> {
    let config = Config {
        minimum_occurrences,
        use_cached_storage: false,
        ..Config::default()
    };
    let analysis = Analysis::new(
        StorageLayout::from_json(TOKEN_LAYOUT)?,
        ContractAbi::from_json(TOKEN_ABI)?,
        watched(),
        config,
    )?;
    Ok(analysis)
}

/// One `burn(from, amount)` observation, with explicit before and after
/// storage so tests can introduce deliberate inconsistencies.
#[allow(unused)]
pub struct Burn {
    pub block: u64,
    pub from: Address,
    pub amount: u64,
    pub pre_balance: u64,
    pub post_balance: u64,
    pub pre_total: u64,
    pub post_total: u64,
}

/// Renders one burn as the raw replayed transaction the tracer would emit.
#[allow(unused)]
pub fn burn_transaction(burn: &Burn) -> anyhow::Result<RawTransaction> {
    let selector = &keccak256(b"burn(address,uint256)")[..4];
    let input = format!(
        "0x{}{:0>64}{:064x}",
        hex::encode(selector),
        hex::encode(burn.from.0),
        burn.amount
    );

    let balance_slot = format!(
        "0x{:064x}",
        mapping_entry_slot(&ScalarValue::Address(burn.from), U256::ZERO)
    );

    let transaction = RawTransaction::from_json(&format!(
        r#"{{
        "blockNumber": {block},
        "position": 0,
        "timestamp": {timestamp},
        "call": {{
            "type": "CALL",
            "from": "{caller}",
            "to": "{watched}",
            "input": "{input}",
            "preState": {{"{watched}": {{
                "{balance_slot}": "0x{pre_balance:x}",
                "0x1": "0x{pre_total:x}"
            }}}},
            "postState": {{"{watched}": {{
                "{balance_slot}": "0x{post_balance:x}",
                "0x1": "0x{post_total:x}"
            }}}}
        }}
    }}"#,
        block = burn.block,
        timestamp = 1_700_000_000 + burn.block,
        caller = caller(),
        watched = watched(),
        pre_balance = burn.pre_balance,
        post_balance = burn.post_balance,
        pre_total = burn.pre_total,
        post_total = burn.post_total,
    ))?;
    Ok(transaction)
}

/// A well-formed burn: the holder's balance and the supply both drop by
/// `amount`.
#[allow(unused)]
pub fn consistent_burn(block: u64, holder_low: u8, amount: u64) -> anyhow::Result<RawTransaction> {
    burn_transaction(&Burn {
        block,
        from: holder(holder_low),
        amount,
        pre_balance: 100,
        post_balance: 100 - amount,
        pre_total: 1000,
        post_total: 1000 - amount,
    })
}
