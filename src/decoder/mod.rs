//! This module contains the storage-state decoder, which interprets the raw
//! slot-to-word map recorded at one observation point against a contract's
//! storage layout and produces named semantic variables.
//!
//! Decoding is a two-pass process. Variables whose types do not involve
//! mappings are decoded first and their scalar values join the witness set;
//! the mapping-involving variables are then decoded with the enriched set, so
//! a key read out of state in the same point is still discovered.
//!
//! Decoding is never fatal: an absent slot leaves the variable undefined, and
//! an unknown type is skipped with a warning.

pub mod value;
pub mod witness;

use std::collections::{BTreeMap, HashMap, HashSet};

use ethnum::U256;
use tracing::warn;

pub use self::{
    value::{ScalarField, ScalarValue, SemanticVariable},
    witness::{DecodeCache, StorageWords, WitnessSet},
};
use crate::{
    constant::{MAX_DECODED_ARRAY_ELEMENTS, SHORT_STRING_MAX_BYTES, WORD_SIZE_BYTES},
    layout::{Encoding, StorageEntry, StorageLayout, TypeDescriptor},
    utility::{keccak256, u256_to_i256, Address, U256W},
};

/// The storage-state decoder for one contract.
#[derive(Clone, Copy, Debug)]
pub struct StateDecoder<'a> {
    layout: &'a StorageLayout,
}

impl<'a> StateDecoder<'a> {
    /// Creates a decoder over the provided layout.
    #[must_use]
    pub fn new(layout: &'a StorageLayout) -> Self {
        Self { layout }
    }

    /// Decodes every state variable discoverable from `words`, returning the
    /// defined variables in declaration order.
    ///
    /// Scalars decoded in the first (non-mapping) pass are added to
    /// `witnesses` before the mapping pass runs, and every scalar decoded
    /// anywhere joins the set afterwards so later decodes in the session see
    /// it too.
    #[must_use]
    pub fn decode_state(
        &self,
        words: &StorageWords,
        witnesses: &mut WitnessSet,
    ) -> Vec<(String, SemanticVariable)> {
        let mut decoded: HashMap<String, SemanticVariable> = HashMap::new();

        for entry in &self.layout.storage {
            if self.involves_mapping(&entry.type_id) {
                continue;
            }
            if let Some(variable) = self.decode_entry(entry, words, witnesses) {
                witnesses.absorb(&variable);
                decoded.insert(entry.label.clone(), variable);
            }
        }

        for entry in &self.layout.storage {
            if !self.involves_mapping(&entry.type_id) {
                continue;
            }
            if let Some(variable) = self.decode_entry(entry, words, witnesses) {
                decoded.insert(entry.label.clone(), variable);
            }
        }

        let mut ordered = Vec::with_capacity(decoded.len());
        for entry in &self.layout.storage {
            if let Some(variable) = decoded.remove(&entry.label) {
                witnesses.absorb(&variable);
                ordered.push((entry.label.clone(), variable));
            }
        }
        ordered
    }

    /// Decodes a single top-level declaration.
    fn decode_entry(
        &self,
        entry: &StorageEntry,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        self.decode_type(&entry.type_id, entry.slot.0, entry.offset, words, witnesses)
    }

    /// Decodes one value of type `type_id` located at `slot` with the given
    /// byte `offset` from the low end of the word.
    fn decode_type(
        &self,
        type_id: &str,
        slot: U256,
        offset: usize,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        let descriptor = self.layout.descriptor(type_id);

        match descriptor.encoding {
            Encoding::Inplace => {
                if descriptor.is_struct() {
                    self.decode_struct(&descriptor, slot, words, witnesses)
                } else if descriptor.base.is_some() {
                    self.decode_static_array(&descriptor, slot, words, witnesses)
                } else {
                    self.decode_inplace_scalar(&descriptor, type_id, slot, offset, words)
                }
            }
            Encoding::Bytes => self.decode_bytes(&descriptor, slot, words),
            Encoding::DynamicArray => self.decode_dynamic_array(&descriptor, slot, words, witnesses),
            Encoding::Mapping => self.decode_mapping(&descriptor, slot, words, witnesses),
        }
    }

    fn decode_inplace_scalar(
        &self,
        descriptor: &TypeDescriptor,
        type_id: &str,
        slot: U256,
        offset: usize,
        words: &StorageWords,
    ) -> Option<SemanticVariable> {
        let word = words.get(&U256W::from(slot))?;
        let size = descriptor.number_of_bytes;
        if offset + size > WORD_SIZE_BYTES {
            warn!(type_id, offset, size, "value overflows its storage word, skipping");
            return None;
        }

        // Values pack from the low end of the word.
        let bytes = &word[WORD_SIZE_BYTES - offset - size..WORD_SIZE_BYTES - offset];
        let value = decode_scalar(&descriptor.label, bytes)?;
        Some(SemanticVariable::scalar(value, descriptor.label.clone()))
    }

    fn decode_struct(
        &self,
        descriptor: &TypeDescriptor,
        slot: U256,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        let members = descriptor.members.as_deref()?;
        let mut decoded = Vec::new();

        for member in members {
            let member_slot = slot.wrapping_add(member.slot.0);
            if let Some(variable) =
                self.decode_type(&member.type_id, member_slot, member.offset, words, witnesses)
            {
                decoded.push((member.label.clone(), variable));
            }
        }

        if decoded.is_empty() {
            return None;
        }
        Some(SemanticVariable::Struct(decoded))
    }

    fn decode_static_array(
        &self,
        descriptor: &TypeDescriptor,
        slot: U256,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        let element_type = descriptor.base.as_deref()?;
        let element = self.layout.descriptor(element_type);
        let count = static_array_length(&descriptor.label)
            .unwrap_or(descriptor.number_of_bytes / element.number_of_bytes.max(1))
            .min(MAX_DECODED_ARRAY_ELEMENTS);

        let elements =
            self.decode_elements(element_type, &element, slot, count, words, witnesses);
        if elements.is_empty() {
            return None;
        }
        Some(SemanticVariable::Array(elements))
    }

    fn decode_dynamic_array(
        &self,
        descriptor: &TypeDescriptor,
        slot: U256,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        let length_word = words.get(&U256W::from(slot))?;
        let length = U256::from_be_bytes(*length_word);
        let count = if length > U256::from(MAX_DECODED_ARRAY_ELEMENTS as u128) {
            MAX_DECODED_ARRAY_ELEMENTS
        } else {
            length.as_usize()
        };

        let element_type = descriptor.base.as_deref()?;
        let element = self.layout.descriptor(element_type);
        let data_base = U256::from_be_bytes(keccak256(&slot.to_be_bytes()));

        let elements =
            self.decode_elements(element_type, &element, data_base, count, words, witnesses);
        Some(SemanticVariable::Array(elements))
    }

    /// Decodes `count` consecutive array elements starting at `base`.
    ///
    /// Elements occupy `ceil(size / 32)` slots each and always start at the
    /// low end of a fresh slot.
    fn decode_elements(
        &self,
        element_type: &str,
        element: &TypeDescriptor,
        base: U256,
        count: usize,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Vec<SemanticVariable> {
        let stride = U256::from(element.slots_per_element() as u128);
        let mut elements = Vec::new();

        for index in 0..count {
            let slot = base.wrapping_add(stride.wrapping_mul(U256::from(index as u128)));
            match self.decode_type(element_type, slot, 0, words, witnesses) {
                Some(variable) => elements.push(variable),
                // The trace records touched slots only, so an absent element
                // ends the readable prefix.
                None => break,
            }
        }
        elements
    }

    fn decode_bytes(
        &self,
        descriptor: &TypeDescriptor,
        slot: U256,
        words: &StorageWords,
    ) -> Option<SemanticVariable> {
        let word = words.get(&U256W::from(slot))?;
        let low = word[WORD_SIZE_BYTES - 1];

        let content = if low % 2 == 0 {
            // Short form: the data shares the slot with twice its length.
            let length = (low / 2) as usize;
            if length > SHORT_STRING_MAX_BYTES {
                warn!(%slot, length, "short-form length exceeds the slot, skipping");
                return None;
            }
            word[..length].to_vec()
        } else {
            // Long form: the slot holds 2 * length + 1 and the data lives at
            // keccak256(slot) onwards.
            let encoded = U256::from_be_bytes(*word);
            let length_word = (encoded - 1) / 2;
            if length_word > U256::from((MAX_DECODED_ARRAY_ELEMENTS * WORD_SIZE_BYTES) as u128) {
                warn!(%slot, length = %length_word, "long-form length is implausible, skipping");
                return None;
            }
            let length = length_word.as_usize();

            let data_base = U256::from_be_bytes(keccak256(&slot.to_be_bytes()));
            let mut content = Vec::with_capacity(length);
            let slots = length.div_ceil(WORD_SIZE_BYTES);
            for index in 0..slots {
                let data_slot = data_base.wrapping_add(U256::from(index as u128));
                let data_word = words.get(&U256W::from(data_slot))?;
                content.extend_from_slice(data_word);
            }
            content.truncate(length);
            content
        };

        let value = if descriptor.label == "string" {
            match String::from_utf8(content) {
                Ok(text) => ScalarValue::Str(text),
                Err(raw) => ScalarValue::Bytes(raw.into_bytes()),
            }
        } else {
            ScalarValue::Bytes(content)
        };
        Some(SemanticVariable::scalar(value, descriptor.label.clone()))
    }

    fn decode_mapping(
        &self,
        descriptor: &TypeDescriptor,
        slot: U256,
        words: &StorageWords,
        witnesses: &WitnessSet,
    ) -> Option<SemanticVariable> {
        let key_type = descriptor.key.as_deref()?;
        let value_type = descriptor.value.as_deref()?;
        let key_label = self.layout.descriptor(key_type).label.clone();

        let mut entries = BTreeMap::new();
        for key in witnesses.candidates(&key_label) {
            let entry_slot = mapping_entry_slot(key, slot);
            if let Some(value) = self.decode_type(value_type, entry_slot, 0, words, witnesses) {
                entries.insert(key.clone(), value);
            }
        }

        // An empty mapping is still a defined variable; its aggregate views
        // exist with no contributing entries.
        Some(SemanticVariable::Mapping(entries))
    }

    /// Checks whether `type_id` transitively involves a mapping.
    fn involves_mapping(&self, type_id: &str) -> bool {
        fn walk(layout: &StorageLayout, type_id: &str, seen: &mut HashSet<String>) -> bool {
            if !seen.insert(type_id.to_owned()) {
                return false;
            }
            let descriptor = layout.descriptor(type_id);
            match descriptor.encoding {
                Encoding::Mapping => true,
                Encoding::Bytes => false,
                Encoding::DynamicArray => descriptor
                    .base
                    .as_deref()
                    .is_some_and(|base| walk(layout, base, seen)),
                Encoding::Inplace => {
                    if let Some(members) = &descriptor.members {
                        return members.iter().any(|m| walk(layout, &m.type_id, seen));
                    }
                    descriptor
                        .base
                        .as_deref()
                        .is_some_and(|base| walk(layout, base, seen))
                }
            }
        }

        let mut seen = HashSet::new();
        walk(self.layout, type_id, &mut seen)
    }
}

/// Computes the slot of one mapping entry: the hash of the key (left-padded
/// for value kinds, unpadded for string and bytes keys) concatenated with the
/// base slot.
#[must_use]
pub fn mapping_entry_slot(key: &ScalarValue, base_slot: U256) -> U256 {
    let mut preimage = key.to_key_word();
    preimage.extend_from_slice(&base_slot.to_be_bytes());
    U256::from_be_bytes(keccak256(&preimage))
}

/// Parses the element count out of a static array label such as `uint256[4]`.
fn static_array_length(label: &str) -> Option<usize> {
    let open = label.rfind('[')?;
    let close = label.rfind(']')?;
    label.get(open + 1..close)?.parse().ok()
}

/// Decodes one scalar from the byte slice carved out of its storage word.
fn decode_scalar(label: &str, bytes: &[u8]) -> Option<ScalarValue> {
    if label.starts_with("address") || label.starts_with("contract ") {
        if bytes.len() < 20 {
            return None;
        }
        let mut address = [0u8; 20];
        address.copy_from_slice(&bytes[bytes.len() - 20..]);
        return Some(ScalarValue::Address(Address(address)));
    }

    if label == "bool" {
        return Some(ScalarValue::Bool(bytes.last().is_some_and(|b| *b != 0)));
    }

    if label.starts_with("int") {
        // Sign-extend from the value's own width.
        let negative = bytes.first().is_some_and(|b| b & 0x80 != 0);
        let fill = if negative { 0xff } else { 0x00 };
        let mut word = [fill; 32];
        word[32 - bytes.len()..].copy_from_slice(bytes);
        return Some(ScalarValue::Int(u256_to_i256(U256::from_be_bytes(word))));
    }

    if label.starts_with("uint") || label.starts_with("enum ") || label.starts_with("enum(") {
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(bytes);
        return Some(ScalarValue::Int(u256_to_i256(U256::from_be_bytes(word))));
    }

    // Fixed bytesN, function pointers and anything unrecognised keep their
    // raw content.
    Some(ScalarValue::Bytes(bytes.to_vec()))
}

#[cfg(test)]
mod tests {
    use ethnum::I256;

    use super::*;
    use crate::layout::StorageLayout;

    fn word_from(hex_str: &str) -> [u8; 32] {
        crate::utility::decode_word(hex_str).unwrap()
    }

    fn packed_layout() -> StorageLayout {
        // One slot carrying uint32 @ 0, then a full uint256, then a bool:
        // sizes [4, 32, 1] land on slots [0, 1, 2], offsets [0, 0, 0].
        StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "small", "offset": 0, "slot": "0", "type": "t_uint32"},
                {"label": "wide", "offset": 0, "slot": "1", "type": "t_uint256"},
                {"label": "flag", "offset": 0, "slot": "2", "type": "t_bool"}
            ],
            "types": {
                "t_uint32": {"encoding": "inplace", "label": "uint32", "numberOfBytes": "4"},
                "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"},
                "t_bool": {"encoding": "inplace", "label": "bool", "numberOfBytes": "1"}
            }
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn decodes_scalars_across_slots() {
        let layout = packed_layout();
        let decoder = StateDecoder::new(&layout);

        let mut words = StorageWords::new();
        words.insert(U256W::from(0u64), word_from("0x2a"));
        words.insert(U256W::from(1u64), word_from("0x0de0b6b3a7640000"));
        words.insert(U256W::from(2u64), word_from("0x01"));

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);

        assert_eq!(state.len(), 3);
        assert_eq!(
            state[0].1.as_scalar().unwrap().value.as_int(),
            Some(I256::new(42))
        );
        assert_eq!(
            state[1].1.as_scalar().unwrap().value.as_int(),
            Some(I256::new(1_000_000_000_000_000_000))
        );
        assert_eq!(
            state[2].1.as_scalar().unwrap().value,
            ScalarValue::Bool(true)
        );
    }

    #[test]
    fn absent_slots_leave_variables_undefined() {
        let layout = packed_layout();
        let decoder = StateDecoder::new(&layout);

        let mut words = StorageWords::new();
        words.insert(U256W::from(1u64), word_from("0x07"));

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);

        assert_eq!(state.len(), 1);
        assert_eq!(state[0].0, "wide");
    }

    #[test]
    fn packed_slot_slicing_respects_offsets() {
        let layout = StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "owner", "offset": 0, "slot": "0", "type": "t_address"},
                {"label": "paused", "offset": 20, "slot": "0", "type": "t_bool"},
                {"label": "count", "offset": 21, "slot": "0", "type": "t_uint16"}
            ],
            "types": {
                "t_address": {"encoding": "inplace", "label": "address", "numberOfBytes": "20"},
                "t_bool": {"encoding": "inplace", "label": "bool", "numberOfBytes": "1"},
                "t_uint16": {"encoding": "inplace", "label": "uint16", "numberOfBytes": "2"}
            }
        }"#,
        )
        .unwrap();
        let decoder = StateDecoder::new(&layout);

        // count = 0x0102, paused = true, owner = 0x...beef.
        let mut words = StorageWords::new();
        words.insert(
            U256W::from(0u64),
            word_from("0x000000000000000000010201000000000000000000000000000000000000beef"),
        );

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);
        assert_eq!(state.len(), 3);

        let owner = state[0].1.as_scalar().unwrap();
        assert_eq!(
            owner.value.as_address().unwrap().to_string(),
            "0x000000000000000000000000000000000000beef"
        );
        assert_eq!(state[1].1.as_scalar().unwrap().value, ScalarValue::Bool(true));
        assert_eq!(
            state[2].1.as_scalar().unwrap().value.as_int(),
            Some(I256::new(0x0102))
        );
    }

    #[test]
    fn mapping_entries_are_discovered_through_witnesses() {
        let layout = StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "balances", "offset": 0, "slot": "0", "type": "t_mapping(t_address,t_uint256)"}
            ],
            "types": {
                "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"},
                "t_address": {"encoding": "inplace", "label": "address", "numberOfBytes": "20"},
                "t_mapping(t_address,t_uint256)": {
                    "encoding": "mapping",
                    "label": "mapping(address => uint256)",
                    "numberOfBytes": "32",
                    "key": "t_address",
                    "value": "t_uint256"
                }
            }
        }"#,
        )
        .unwrap();
        let decoder = StateDecoder::new(&layout);

        // keccak256(leftPad32(0) ++ leftPad32(0)): the entry for the zero
        // address in a mapping declared at slot zero.
        let zero_entry =
            word_from("0xad3228b676f7d3cd4284a5443f17f1962b36e491b30a40b2405849e597ba5fb5");
        let mut words = StorageWords::new();
        words.insert(U256W::from(U256::from_be_bytes(zero_entry)), word_from("0x64"));

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);
        assert_eq!(state.len(), 1);

        let SemanticVariable::Mapping(entries) = &state[0].1 else {
            panic!("expected a mapping");
        };
        assert_eq!(entries.len(), 1);
        let value = entries.values().next().unwrap().as_scalar().unwrap();
        assert_eq!(value.value.as_int(), Some(I256::new(100)));
    }

    #[test]
    fn growing_the_witness_set_never_loses_entries() {
        let layout = StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "balances", "offset": 0, "slot": "0", "type": "t_mapping(t_address,t_uint256)"}
            ],
            "types": {
                "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"},
                "t_address": {"encoding": "inplace", "label": "address", "numberOfBytes": "20"},
                "t_mapping(t_address,t_uint256)": {
                    "encoding": "mapping",
                    "label": "mapping(address => uint256)",
                    "numberOfBytes": "32",
                    "key": "t_address",
                    "value": "t_uint256"
                }
            }
        }"#,
        )
        .unwrap();
        let decoder = StateDecoder::new(&layout);

        let holder = Address::from_hex("0x00000000000000000000000000000000000000aa").unwrap();
        let holder_slot = mapping_entry_slot(&ScalarValue::Address(holder), U256::ZERO);

        let zero_entry =
            word_from("0xad3228b676f7d3cd4284a5443f17f1962b36e491b30a40b2405849e597ba5fb5");
        let mut words = StorageWords::new();
        words.insert(U256W::from(U256::from_be_bytes(zero_entry)), word_from("0x64"));
        words.insert(U256W::from(holder_slot), word_from("0xc8"));

        let mut narrow = WitnessSet::new();
        let before = match &decoder.decode_state(&words, &mut narrow)[0].1 {
            SemanticVariable::Mapping(entries) => entries.clone(),
            _ => panic!("expected a mapping"),
        };

        let mut wide = WitnessSet::new();
        wide.insert(&ScalarValue::Address(holder));
        let after = match &decoder.decode_state(&words, &mut wide)[0].1 {
            SemanticVariable::Mapping(entries) => entries.clone(),
            _ => panic!("expected a mapping"),
        };

        for key in before.keys() {
            assert!(after.contains_key(key));
        }
        assert_eq!(after.len(), before.len() + 1);
    }

    #[test]
    fn decodes_short_and_long_strings_at_the_boundary() {
        let layout = StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "name", "offset": 0, "slot": "0", "type": "t_string_storage"}
            ],
            "types": {
                "t_string_storage": {"encoding": "bytes", "label": "string", "numberOfBytes": "32"}
            }
        }"#,
        )
        .unwrap();
        let decoder = StateDecoder::new(&layout);

        // 31 bytes: short form, data in the slot, low byte 2 * 31 = 62.
        let short_text = "abcdefghijklmnopqrstuvwxyzabcde";
        let mut short_word = [0u8; 32];
        short_word[..31].copy_from_slice(short_text.as_bytes());
        short_word[31] = 62;
        let mut words = StorageWords::new();
        words.insert(U256W::from(0u64), short_word);

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);
        assert_eq!(
            state[0].1.as_scalar().unwrap().value,
            ScalarValue::Str(short_text.to_owned())
        );

        // 32 bytes: long form, slot holds 2 * 32 + 1 = 65, data at
        // keccak256(slot).
        let long_text = "abcdefghijklmnopqrstuvwxyzabcdef";
        let mut words = StorageWords::new();
        words.insert(U256W::from(0u64), word_from("0x41"));
        let data_slot = U256::from_be_bytes(keccak256(&U256::ZERO.to_be_bytes()));
        let mut data_word = [0u8; 32];
        data_word.copy_from_slice(long_text.as_bytes());
        words.insert(U256W::from(data_slot), data_word);

        let state = decoder.decode_state(&words, &mut witnesses);
        assert_eq!(
            state[0].1.as_scalar().unwrap().value,
            ScalarValue::Str(long_text.to_owned())
        );
    }

    #[test]
    fn decodes_dynamic_arrays_from_the_content_slot() {
        let layout = StorageLayout::from_json(
            r#"{
            "storage": [
                {"label": "history", "offset": 0, "slot": "0", "type": "t_array(t_uint256)dyn_storage"}
            ],
            "types": {
                "t_uint256": {"encoding": "inplace", "label": "uint256", "numberOfBytes": "32"},
                "t_array(t_uint256)dyn_storage": {
                    "encoding": "dynamic_array",
                    "label": "uint256[]",
                    "numberOfBytes": "32",
                    "base": "t_uint256"
                }
            }
        }"#,
        )
        .unwrap();
        let decoder = StateDecoder::new(&layout);

        // keccak256(leftPad32(0)): the content base for slot zero.
        let base = U256::from_be_bytes(word_from(
            "0x290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563",
        ));

        let mut words = StorageWords::new();
        words.insert(U256W::from(0u64), word_from("0x02"));
        words.insert(U256W::from(base), word_from("0x0a"));
        words.insert(U256W::from(base.wrapping_add(U256::ONE)), word_from("0x14"));

        let mut witnesses = WitnessSet::new();
        let state = decoder.decode_state(&words, &mut witnesses);

        let SemanticVariable::Array(elements) = &state[0].1 else {
            panic!("expected an array");
        };
        let values: Vec<_> = elements
            .iter()
            .map(|e| e.as_scalar().unwrap().value.as_int().unwrap())
            .collect();
        assert_eq!(values, vec![I256::new(10), I256::new(20)]);
    }
}
