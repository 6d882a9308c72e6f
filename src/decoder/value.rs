//! This module contains the semantic value model produced by the state
//! decoder and reused for ABI-decoded call arguments and event payloads.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
};

use ethnum::I256;
use serde::{Deserialize, Serialize};

use crate::utility::{i256_to_u256, Address};

/// A single decoded scalar.
///
/// Scalars are totally ordered so they can key the witness set and mapping
/// entries deterministically.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ScalarValue {
    /// An integer of any width, including enums, reinterpreted into the
    /// signed 256-bit domain.
    Int(I256),

    /// A 20-byte account address.
    Address(Address),

    /// A boolean flag.
    Bool(bool),

    /// Fixed-width `bytesN` or dynamic `bytes` content.
    #[serde(with = "hex_bytes")]
    Bytes(Vec<u8>),

    /// A UTF-8 string.
    Str(String),
}

impl ScalarValue {
    /// Returns the integer content, if this scalar is an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<I256> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the address content, if this scalar is an address.
    #[must_use]
    pub fn as_address(&self) -> Option<Address> {
        match self {
            Self::Address(value) => Some(*value),
            _ => None,
        }
    }

    /// Checks whether the scalar is the zero value of its kind.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int(value) => *value == I256::ZERO,
            Self::Address(value) => value.0 == [0u8; 20],
            Self::Bool(value) => !value,
            Self::Bytes(value) => value.iter().all(|b| *b == 0),
            Self::Str(value) => value.is_empty(),
        }
    }

    /// Converts the scalar into the 32-byte word used when deriving a mapping
    /// entry slot from this scalar as the key.
    ///
    /// Negative integer keys contribute their magnitude; mappings keyed by
    /// signed types are looked up through the values actually observed, and
    /// observation always yields the magnitude on the wire.
    #[must_use]
    pub fn to_key_word(&self) -> Vec<u8> {
        match self {
            Self::Int(value) => {
                let magnitude = if *value < I256::ZERO { -*value } else { *value };
                i256_to_u256(magnitude).to_be_bytes().to_vec()
            }
            Self::Address(value) => value.to_word().to_vec(),
            Self::Bool(value) => {
                let mut word = [0u8; 32];
                word[31] = u8::from(*value);
                word.to_vec()
            }
            // String and bytes keys are hashed unpadded.
            Self::Bytes(value) => value.clone(),
            Self::Str(value) => value.as_bytes().to_vec(),
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Address(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Bytes(value) => write!(f, "0x{}", hex::encode(value)),
            Self::Str(value) => write!(f, "{value}"),
        }
    }
}

/// A decoded state variable, call argument or event argument.
///
/// Mappings are a deliberate under-approximation: they contain exactly the
/// entries whose keys were discoverable from the witness set at decode time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SemanticVariable {
    /// A leaf value together with its declared type label.
    Scalar(ScalarField),

    /// A struct's members, in declaration order.
    Struct(Vec<(String, SemanticVariable)>),

    /// An array's elements, in index order.
    Array(Vec<SemanticVariable>),

    /// The discovered entries of a mapping.
    Mapping(#[serde(with = "crate::utility::kv_pairs")] BTreeMap<ScalarValue, SemanticVariable>),
}

/// The payload of a scalar variable: the value and its declared type label
/// (e.g. `uint256`, `address`).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ScalarField {
    pub value: ScalarValue,

    #[serde(rename = "type")]
    pub type_label: String,
}

impl SemanticVariable {
    /// Constructs a scalar variable with the provided declared type label.
    #[must_use]
    pub fn scalar(value: ScalarValue, type_label: impl Into<String>) -> Self {
        Self::Scalar(ScalarField {
            value,
            type_label: type_label.into(),
        })
    }

    /// Returns the scalar payload, if this variable is a scalar.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&ScalarField> {
        match self {
            Self::Scalar(field) => Some(field),
            _ => None,
        }
    }

    /// Appends every scalar reachable from this variable to `out`, in
    /// traversal order.
    pub fn collect_scalars<'a>(&'a self, out: &mut Vec<&'a ScalarValue>) {
        match self {
            Self::Scalar(field) => out.push(&field.value),
            Self::Struct(members) => {
                for (_, member) in members {
                    member.collect_scalars(out);
                }
            }
            Self::Array(elements) => {
                for element in elements {
                    element.collect_scalars(out);
                }
            }
            Self::Mapping(entries) => {
                for value in entries.values() {
                    value.collect_scalars(out);
                }
            }
        }
    }
}

/// Serde adaptor presenting raw byte content as `0x`-prefixed hex.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        crate::utility::decode_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifies_zero_values() {
        assert!(ScalarValue::Int(I256::ZERO).is_zero());
        assert!(ScalarValue::Address(Address::default()).is_zero());
        assert!(!ScalarValue::Int(I256::new(3)).is_zero());
        assert!(!ScalarValue::Str("x".into()).is_zero());
    }

    #[test]
    fn negative_integer_keys_use_their_magnitude() {
        let word = ScalarValue::Int(I256::new(-5)).to_key_word();
        assert_eq!(word.len(), 32);
        assert_eq!(word[31], 5);
        assert!(word[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn collects_nested_scalars() {
        let variable = SemanticVariable::Struct(vec![
            (
                "owner".into(),
                SemanticVariable::scalar(
                    ScalarValue::Address(Address::from_hex("0x0000000000000000000000000000000000000001").unwrap()),
                    "address",
                ),
            ),
            (
                "totals".into(),
                SemanticVariable::Array(vec![
                    SemanticVariable::scalar(ScalarValue::Int(I256::new(7)), "uint256"),
                ]),
            ),
        ]);

        let mut scalars = Vec::new();
        variable.collect_scalars(&mut scalars);
        assert_eq!(scalars.len(), 2);
        assert_eq!(scalars[1].as_int(), Some(I256::new(7)));
    }
}
