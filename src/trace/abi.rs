//! This module contains the contract ABI model and the value decoder for the
//! standard head/tail calldata encoding.
//!
//! Functions are indexed by their 4-byte selector and events by their 32-byte
//! topic hash, both computed over the canonical signature (tuples written out
//! recursively as parenthesised component lists).

use std::collections::HashMap;

use ethnum::U256;
use serde::{Deserialize, Serialize};

use crate::{
    constant::{SELECTOR_WIDTH_BYTES, WORD_SIZE_BYTES},
    decoder::{ScalarValue, SemanticVariable},
    error::extraction,
    utility::{keccak256, u256_to_i256, Address},
};

/// A single parameter declaration within an ABI entry.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AbiParameter {
    /// The declared parameter name; empty for unnamed parameters.
    #[serde(default)]
    pub name: String,

    /// The solidity type string (e.g. `uint256`, `address[]`, `tuple`).
    #[serde(rename = "type")]
    pub type_name: String,

    /// The component declarations for tuple types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<AbiParameter>>,

    /// Whether an event parameter is indexed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed: Option<bool>,
}

/// One entry of the contract's ABI JSON.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AbiEntry {
    #[serde(rename = "type")]
    pub entry_type: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub inputs: Vec<AbiParameter>,

    #[serde(rename = "stateMutability", default)]
    pub state_mutability: Option<String>,
}

/// A callable function, indexed by selector.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AbiFunction {
    pub name: String,

    /// The canonical signature, e.g. `transfer(address,uint256)`.
    pub signature: String,

    pub inputs: Vec<AbiParameter>,

    /// Whether the function is declared `view` or `pure`.
    pub is_view: bool,
}

/// An event, indexed by its topic hash.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AbiEvent {
    pub name: String,

    pub signature: String,

    pub inputs: Vec<AbiParameter>,
}

/// The parsed ABI of one contract.
#[derive(Clone, Debug, Default)]
pub struct ContractAbi {
    functions: HashMap<[u8; 4], AbiFunction>,
    events: HashMap<[u8; 32], AbiEvent>,
}

impl ContractAbi {
    /// Parses a contract ABI from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns [`extraction::Error::InvalidAbi`] if the JSON does not have
    /// the expected shape.
    pub fn from_json(source: &str) -> extraction::Result<Self> {
        let entries: Vec<AbiEntry> =
            serde_json::from_str(source).map_err(|e| extraction::Error::InvalidAbi {
                reason: e.to_string(),
            })?;
        Ok(Self::from_entries(entries))
    }

    /// Builds the selector-indexed ABI from its parsed entries.
    #[must_use]
    pub fn from_entries(entries: Vec<AbiEntry>) -> Self {
        let mut abi = Self::default();

        for entry in entries {
            let signature = canonical_signature(&entry.name, &entry.inputs);
            let hash = keccak256(signature.as_bytes());

            match entry.entry_type.as_str() {
                "function" => {
                    let mut selector = [0u8; SELECTOR_WIDTH_BYTES];
                    selector.copy_from_slice(&hash[..SELECTOR_WIDTH_BYTES]);
                    let is_view = matches!(
                        entry.state_mutability.as_deref(),
                        Some("view") | Some("pure")
                    );
                    abi.functions.insert(
                        selector,
                        AbiFunction {
                            name: entry.name,
                            signature,
                            inputs: entry.inputs,
                            is_view,
                        },
                    );
                }
                "event" => {
                    abi.events.insert(
                        hash,
                        AbiEvent {
                            name: entry.name,
                            signature,
                            inputs: entry.inputs,
                        },
                    );
                }
                _ => (),
            }
        }
        abi
    }

    /// Looks up the function with the provided selector.
    #[must_use]
    pub fn function(&self, selector: [u8; 4]) -> Option<&AbiFunction> {
        self.functions.get(&selector)
    }

    /// Looks up the event with the provided topic hash.
    #[must_use]
    pub fn event(&self, topic: [u8; 32]) -> Option<&AbiEvent> {
        self.events.get(&topic)
    }
}

impl AbiFunction {
    /// Decodes this function's arguments from the calldata following the
    /// selector.
    ///
    /// # Errors
    ///
    /// Returns an extraction error when the payload is truncated or a type is
    /// unsupported; callers degrade to a raw payload argument on failure.
    pub fn decode_arguments(
        &self,
        payload: &[u8],
    ) -> extraction::Result<Vec<(String, SemanticVariable)>> {
        let values = decode_block(&self.signature, &self.inputs, payload)?;
        Ok(named(&self.inputs, values))
    }
}

impl AbiEvent {
    /// Decodes this event's arguments from its topics and data section.
    ///
    /// Indexed parameters come from the topics in declaration order; indexed
    /// dynamic values are only present as their hash and are kept as opaque
    /// 32-byte words. The remaining parameters decode from the data section.
    ///
    /// # Errors
    ///
    /// Returns an extraction error when the topic count or data section does
    /// not match the declaration; callers drop the event on failure.
    pub fn decode_arguments(
        &self,
        topics: &[[u8; 32]],
        data: &[u8],
    ) -> extraction::Result<Vec<(String, SemanticVariable)>> {
        let mut topic_index = 1; // topic 0 is the event hash
        let unindexed: Vec<AbiParameter> = self
            .inputs
            .iter()
            .filter(|p| p.indexed != Some(true))
            .cloned()
            .collect();
        let mut data_values = decode_block(&self.signature, &unindexed, data)?.into_iter();

        let mut arguments = Vec::with_capacity(self.inputs.len());
        for (position, parameter) in self.inputs.iter().enumerate() {
            let value = if parameter.indexed == Some(true) {
                let topic =
                    topics
                        .get(topic_index)
                        .ok_or_else(|| extraction::Error::TruncatedPayload {
                            signature: self.signature.clone(),
                            offset: topic_index,
                        })?;
                topic_index += 1;

                if is_dynamic(parameter) {
                    SemanticVariable::scalar(ScalarValue::Bytes(topic.to_vec()), "bytes32")
                } else {
                    decode_word_value(&self.signature, parameter, topic)?
                }
            } else {
                data_values
                    .next()
                    .ok_or_else(|| extraction::Error::TruncatedPayload {
                        signature: self.signature.clone(),
                        offset: position,
                    })?
            };
            arguments.push((parameter_name(parameter, position), value));
        }
        Ok(arguments)
    }
}

/// Builds the canonical signature `name(type,type,...)` used for selector and
/// topic derivation.
#[must_use]
pub fn canonical_signature(name: &str, inputs: &[AbiParameter]) -> String {
    let types: Vec<String> = inputs.iter().map(canonical_type).collect();
    format!("{name}({})", types.join(","))
}

/// Writes one parameter's canonical type, expanding tuples recursively.
fn canonical_type(parameter: &AbiParameter) -> String {
    if let Some(suffix) = parameter.type_name.strip_prefix("tuple") {
        let components = parameter.components.as_deref().unwrap_or_default();
        let inner: Vec<String> = components.iter().map(canonical_type).collect();
        format!("({}){suffix}", inner.join(","))
    } else {
        parameter.type_name.clone()
    }
}

fn parameter_name(parameter: &AbiParameter, position: usize) -> String {
    if parameter.name.is_empty() {
        format!("arg{position}")
    } else {
        parameter.name.clone()
    }
}

fn named(
    parameters: &[AbiParameter],
    values: Vec<SemanticVariable>,
) -> Vec<(String, SemanticVariable)> {
    parameters
        .iter()
        .enumerate()
        .zip(values)
        .map(|((position, parameter), value)| (parameter_name(parameter, position), value))
        .collect()
}

/// Checks whether a parameter uses the dynamic (pointer-addressed) encoding.
fn is_dynamic(parameter: &AbiParameter) -> bool {
    let type_name = parameter.type_name.as_str();
    if type_name == "bytes" || type_name == "string" {
        return true;
    }
    if type_name.ends_with("[]") {
        return true;
    }
    if let Some((element, _)) = split_fixed_array(type_name) {
        return is_dynamic(&element_parameter(parameter, element));
    }
    if type_name.starts_with("tuple") {
        return parameter
            .components
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(is_dynamic);
    }
    false
}

/// The number of bytes a statically-encoded parameter occupies in the head.
fn static_size(parameter: &AbiParameter) -> usize {
    let type_name = parameter.type_name.as_str();
    if let Some((element, count)) = split_fixed_array(type_name) {
        return count * static_size(&element_parameter(parameter, element));
    }
    if type_name == "tuple" {
        return parameter
            .components
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(static_size)
            .sum();
    }
    WORD_SIZE_BYTES
}

/// Splits `T[k]` into its element type and count; `None` for anything else.
fn split_fixed_array(type_name: &str) -> Option<(&str, usize)> {
    if !type_name.ends_with(']') || type_name.ends_with("[]") {
        return None;
    }
    let open = type_name.rfind('[')?;
    let count = type_name[open + 1..type_name.len() - 1].parse().ok()?;
    Some((&type_name[..open], count))
}

/// Builds the parameter describing one element of an array parameter.
fn element_parameter(parameter: &AbiParameter, element_type: &str) -> AbiParameter {
    AbiParameter {
        name: String::new(),
        type_name: element_type.to_owned(),
        components: parameter.components.clone(),
        indexed: None,
    }
}

/// Decodes a head/tail block containing the provided parameters.
fn decode_block(
    signature: &str,
    parameters: &[AbiParameter],
    block: &[u8],
) -> extraction::Result<Vec<SemanticVariable>> {
    let mut values = Vec::with_capacity(parameters.len());
    let mut offset = 0;

    for parameter in parameters {
        if is_dynamic(parameter) {
            let pointer = read_offset(signature, block, offset)?;
            values.push(decode_tail(signature, parameter, block, pointer)?);
            offset += WORD_SIZE_BYTES;
        } else {
            values.push(decode_static(signature, parameter, block, offset)?);
            offset += static_size(parameter);
        }
    }
    Ok(values)
}

/// Decodes one dynamically-encoded value whose tail starts at `position`
/// within `block`.
fn decode_tail(
    signature: &str,
    parameter: &AbiParameter,
    block: &[u8],
    position: usize,
) -> extraction::Result<SemanticVariable> {
    let type_name = parameter.type_name.as_str();

    if type_name == "bytes" || type_name == "string" {
        let length = read_offset(signature, block, position)?;
        let start = position + WORD_SIZE_BYTES;
        let content = block
            .get(start..start + length)
            .ok_or_else(|| extraction::Error::TruncatedPayload {
                signature: signature.to_owned(),
                offset: start,
            })?;

        let value = if type_name == "string" {
            match String::from_utf8(content.to_vec()) {
                Ok(text) => ScalarValue::Str(text),
                Err(raw) => ScalarValue::Bytes(raw.into_bytes()),
            }
        } else {
            ScalarValue::Bytes(content.to_vec())
        };
        return Ok(SemanticVariable::scalar(value, type_name));
    }

    if let Some(element_type) = type_name.strip_suffix("[]") {
        let length = read_offset(signature, block, position)?;
        let element = element_parameter(parameter, element_type);
        let elements = vec![element; length];
        let inner =
            block
                .get(position + WORD_SIZE_BYTES..)
                .ok_or_else(|| extraction::Error::TruncatedPayload {
                    signature: signature.to_owned(),
                    offset: position,
                })?;
        return Ok(SemanticVariable::Array(decode_block(
            signature, &elements, inner,
        )?));
    }

    if let Some((element_type, count)) = split_fixed_array(type_name) {
        let element = element_parameter(parameter, element_type);
        let elements = vec![element; count];
        let inner = block
            .get(position..)
            .ok_or_else(|| extraction::Error::TruncatedPayload {
                signature: signature.to_owned(),
                offset: position,
            })?;
        return Ok(SemanticVariable::Array(decode_block(
            signature, &elements, inner,
        )?));
    }

    if type_name.starts_with("tuple") {
        let components = parameter.components.as_deref().unwrap_or_default();
        let inner = block
            .get(position..)
            .ok_or_else(|| extraction::Error::TruncatedPayload {
                signature: signature.to_owned(),
                offset: position,
            })?;
        let values = decode_block(signature, components, inner)?;
        return Ok(SemanticVariable::Struct(named(components, values)));
    }

    Err(extraction::Error::UnsupportedAbiType {
        signature: signature.to_owned(),
        type_name: type_name.to_owned(),
    })
}

/// Decodes one statically-encoded value at `offset` within `block`.
fn decode_static(
    signature: &str,
    parameter: &AbiParameter,
    block: &[u8],
    offset: usize,
) -> extraction::Result<SemanticVariable> {
    let type_name = parameter.type_name.as_str();

    if let Some((element_type, count)) = split_fixed_array(type_name) {
        let element = element_parameter(parameter, element_type);
        let size = static_size(&element);
        let mut elements = Vec::with_capacity(count);
        for index in 0..count {
            elements.push(decode_static(signature, &element, block, offset + index * size)?);
        }
        return Ok(SemanticVariable::Array(elements));
    }

    if type_name == "tuple" {
        let components = parameter.components.as_deref().unwrap_or_default();
        let mut values = Vec::with_capacity(components.len());
        let mut running = offset;
        for component in components {
            values.push(decode_static(signature, component, block, running)?);
            running += static_size(component);
        }
        return Ok(SemanticVariable::Struct(named(components, values)));
    }

    let word: &[u8; 32] = block
        .get(offset..offset + WORD_SIZE_BYTES)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| extraction::Error::TruncatedPayload {
            signature: signature.to_owned(),
            offset,
        })?;
    decode_word_value(signature, parameter, word)
}

/// Decodes a single 32-byte word as the provided static type.
fn decode_word_value(
    signature: &str,
    parameter: &AbiParameter,
    word: &[u8; 32],
) -> extraction::Result<SemanticVariable> {
    let type_name = parameter.type_name.as_str();

    let value = if type_name.starts_with("uint") || type_name.starts_with("int") {
        ScalarValue::Int(u256_to_i256(U256::from_be_bytes(*word)))
    } else if type_name == "address" {
        let mut address = [0u8; 20];
        address.copy_from_slice(&word[12..]);
        ScalarValue::Address(Address(address))
    } else if type_name == "bool" {
        ScalarValue::Bool(word[31] != 0)
    } else if let Some(width) = type_name
        .strip_prefix("bytes")
        .and_then(|n| n.parse::<usize>().ok())
    {
        if width > WORD_SIZE_BYTES {
            return Err(extraction::Error::UnsupportedAbiType {
                signature: signature.to_owned(),
                type_name: type_name.to_owned(),
            });
        }
        ScalarValue::Bytes(word[..width].to_vec())
    } else {
        return Err(extraction::Error::UnsupportedAbiType {
            signature: signature.to_owned(),
            type_name: type_name.to_owned(),
        });
    };

    Ok(SemanticVariable::scalar(value, type_name))
}

/// Reads a 32-byte word at `offset` as a length or pointer that must fit in
/// the block.
fn read_offset(signature: &str, block: &[u8], offset: usize) -> extraction::Result<usize> {
    let word: &[u8; 32] = block
        .get(offset..offset + WORD_SIZE_BYTES)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| extraction::Error::TruncatedPayload {
            signature: signature.to_owned(),
            offset,
        })?;

    let value = U256::from_be_bytes(*word);
    if value > U256::from(block.len() as u128) {
        return Err(extraction::Error::TruncatedPayload {
            signature: signature.to_owned(),
            offset,
        });
    }
    Ok(value.as_usize())
}
