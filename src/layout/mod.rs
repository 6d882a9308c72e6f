//! This module contains the representation of a contract's storage layout as
//! emitted by the Solidity compiler, together with the lookup logic that the
//! state decoder relies on.
//!
//! The layout is immutable once parsed. Type descriptors are resolved by
//! identifier; identifiers that the layout does not declare degrade to a
//! synthesised descriptor so that a single unknown type never aborts a decode.

use std::{borrow::Cow, collections::HashMap};

use ethnum::U256;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    constant::{ADDRESS_WIDTH_BYTES, WORD_SIZE_BYTES},
    error::decoding,
    utility::U256W,
};

/// The in-storage encoding of a Solidity type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// The value lives directly in its slot, packed from the low end.
    Inplace,

    /// A mapping; entries live at content-derived slots.
    Mapping,

    /// A dynamic array; the element count lives in the declaration slot.
    DynamicArray,

    /// A `string` or `bytes` value using the short/long split encoding.
    Bytes,
}

/// A description of a single Solidity type as it appears in the `types`
/// section of the compiler's storage layout output.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// How values of this type are laid out in storage.
    pub encoding: Encoding,

    /// The source-level name of the type (e.g. `uint256`,
    /// `mapping(address => uint256)`).
    pub label: String,

    /// The number of bytes a value of this type occupies.
    #[serde(rename = "numberOfBytes", with = "decimal_string")]
    pub number_of_bytes: usize,

    /// The element type identifier for array types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,

    /// The key type identifier for mapping types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// The value type identifier for mapping types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// The member declarations for struct types, in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<StorageEntry>>,
}

impl TypeDescriptor {
    /// Constructs an inplace descriptor of `number_of_bytes` bytes with the
    /// provided `label`.
    #[must_use]
    pub fn inplace(label: impl Into<String>, number_of_bytes: usize) -> Self {
        Self {
            encoding: Encoding::Inplace,
            label: label.into(),
            number_of_bytes,
            base: None,
            key: None,
            value: None,
            members: None,
        }
    }

    /// Checks whether this descriptor describes a struct.
    #[must_use]
    pub fn is_struct(&self) -> bool {
        self.members.is_some()
    }

    /// The number of consecutive slots occupied by one value of this type when
    /// used as an array element.
    #[must_use]
    pub fn slots_per_element(&self) -> usize {
        self.number_of_bytes.div_ceil(WORD_SIZE_BYTES).max(1)
    }
}

/// A single state variable (or struct member) declaration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// The AST node identifier of the declaration, when present.
    #[serde(rename = "astId", default, skip_serializing_if = "Option::is_none")]
    pub ast_id: Option<u64>,

    /// The fully-qualified name of the declaring contract, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,

    /// The source-level name of the variable.
    pub label: String,

    /// The byte offset of the variable from the low end of its slot.
    #[serde(default)]
    pub offset: usize,

    /// The slot at which the variable is declared, relative to the start of
    /// the enclosing layout (zero for top-level variables).
    #[serde(with = "slot_string", default)]
    pub slot: U256W,

    /// The identifier of the variable's type in the `types` table.
    #[serde(rename = "type")]
    pub type_id: String,
}

/// The storage layout of one contract.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageLayout {
    /// The top-level state variable declarations, in declaration order.
    pub storage: Vec<StorageEntry>,

    /// The type descriptors referenced (directly or transitively) by the
    /// declarations.
    #[serde(default)]
    pub types: HashMap<String, TypeDescriptor>,
}

impl StorageLayout {
    /// Parses a storage layout from the compiler's JSON output.
    ///
    /// # Errors
    ///
    /// Returns [`decoding::Error::InvalidLayout`] if the JSON does not have
    /// the expected shape.
    pub fn from_json(source: &str) -> decoding::Result<Self> {
        let mut layout: Self =
            serde_json::from_str(source).map_err(|e| decoding::Error::InvalidLayout {
                reason: e.to_string(),
            })?;
        layout.place_struct_members();
        Ok(layout)
    }

    /// Fills in struct member placements that the layout source omitted, by
    /// simulating the compiler's packing: members occupy consecutive bytes
    /// from the low end of the slot, and a member too large for the remaining
    /// bytes of the current slot starts a fresh one.
    ///
    /// Placements are only recomputed when a multi-member struct reports every
    /// member at slot zero, offset zero, which no compiler output contains.
    fn place_struct_members(&mut self) {
        let needs_placement = |members: &[StorageEntry]| {
            members.len() > 1
                && members
                    .iter()
                    .all(|m| m.slot.0 == U256::ZERO && m.offset == 0)
        };

        let mut placed: Vec<(String, Vec<(U256, usize)>)> = Vec::new();
        for (type_id, descriptor) in &self.types {
            let Some(members) = descriptor.members.as_deref() else {
                continue;
            };
            if !needs_placement(members) {
                continue;
            }

            let sizes: Vec<usize> = members.iter().map(|m| self.size_of(&m.type_id)).collect();
            placed.push((type_id.clone(), pack_members(&sizes)));
        }

        for (type_id, placements) in placed {
            let Some(members) = self
                .types
                .get_mut(&type_id)
                .and_then(|d| d.members.as_mut())
            else {
                continue;
            };
            for (member, (slot, offset)) in members.iter_mut().zip(placements) {
                member.slot = U256W::from(slot);
                member.offset = offset;
            }
        }
    }

    /// The byte size of `type_id`, falling back to one word for identifiers
    /// the table does not declare.
    fn size_of(&self, type_id: &str) -> usize {
        if let Some(descriptor) = self.types.get(type_id) {
            return descriptor.number_of_bytes;
        }
        synthesise_elementary(type_id)
            .map(|d| d.number_of_bytes)
            .unwrap_or(WORD_SIZE_BYTES)
    }

    /// Resolves the descriptor for `type_id`.
    ///
    /// Identifiers absent from the `types` table are synthesised from the
    /// identifier itself where it names a well-known elementary type, and
    /// degrade to a 32-byte opaque word otherwise. Resolution therefore never
    /// fails; the decoder relies on this to skip past unknown types instead of
    /// aborting.
    #[must_use]
    pub fn descriptor<'a>(&'a self, type_id: &str) -> Cow<'a, TypeDescriptor> {
        if let Some(descriptor) = self.types.get(type_id) {
            return Cow::Borrowed(descriptor);
        }

        if let Some(synthesised) = synthesise_elementary(type_id) {
            return Cow::Owned(synthesised);
        }

        warn!(type_id, "unknown storage type, treating as bytes32");
        Cow::Owned(TypeDescriptor::inplace("bytes32", WORD_SIZE_BYTES))
    }

    /// Looks up a top-level state variable by name.
    #[must_use]
    pub fn variable(&self, label: &str) -> Option<&StorageEntry> {
        self.storage.iter().find(|entry| entry.label == label)
    }
}

/// Simulates the packing of struct members of the given byte sizes, returning
/// each member's `(slot, offset)` relative to the struct's base slot.
///
/// Members pack from the low end of the word upward; a member that does not
/// fit in the remaining bytes of the current slot starts a fresh one, and a
/// member of one or more full words always leaves the next member on a fresh
/// slot of its own.
#[must_use]
pub fn pack_members(sizes: &[usize]) -> Vec<(U256, usize)> {
    let mut slot = U256::ZERO;
    let mut offset = 0usize;
    let mut placements = Vec::with_capacity(sizes.len());

    for size in sizes {
        if offset + size > WORD_SIZE_BYTES {
            slot += U256::ONE;
            offset = 0;
        }
        placements.push((slot, offset));

        if *size >= WORD_SIZE_BYTES {
            slot += U256::from(size.div_ceil(WORD_SIZE_BYTES) as u128);
            offset = 0;
        } else {
            offset += size;
            if offset == WORD_SIZE_BYTES {
                slot += U256::ONE;
                offset = 0;
            }
        }
    }
    placements
}

/// Builds a descriptor from a type identifier that names an elementary type,
/// such as `t_uint112` referenced from a packed struct whose member types were
/// not carried in the `types` table.
fn synthesise_elementary(type_id: &str) -> Option<TypeDescriptor> {
    let name = type_id.strip_prefix("t_").unwrap_or(type_id);

    if name == "address" || name == "address_payable" {
        return Some(TypeDescriptor::inplace("address", ADDRESS_WIDTH_BYTES));
    }
    if name == "bool" {
        return Some(TypeDescriptor::inplace("bool", 1));
    }
    if let Some(bits) = name.strip_prefix("uint").and_then(|n| n.parse::<usize>().ok()) {
        if bits % 8 == 0 && bits <= 256 {
            return Some(TypeDescriptor::inplace(format!("uint{bits}"), bits / 8));
        }
    }
    if let Some(bits) = name.strip_prefix("int").and_then(|n| n.parse::<usize>().ok()) {
        if bits % 8 == 0 && bits <= 256 {
            return Some(TypeDescriptor::inplace(format!("int{bits}"), bits / 8));
        }
    }
    if let Some(n) = name.strip_prefix("bytes").and_then(|n| n.parse::<usize>().ok()) {
        if (1..=32).contains(&n) {
            return Some(TypeDescriptor::inplace(format!("bytes{n}"), n));
        }
    }

    None
}

/// Serde adaptor for the layout's habit of writing byte counts as decimal
/// strings.
mod decimal_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &usize, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adaptor for slot numbers, which the layout writes as decimal strings
/// but which participate in 256-bit slot arithmetic here.
mod slot_string {
    use ethnum::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::utility::U256W;

    pub fn serialize<S: Serializer>(value: &U256W, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.0.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<U256W, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        U256::from_str_radix(&s, 10)
            .map(U256W::from)
            .map_err(serde::de::Error::custom)
    }
}
