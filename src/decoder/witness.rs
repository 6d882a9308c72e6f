//! This module contains the witness set used to discover mapping keys, and
//! the per-session cache that carries witnesses and storage words across
//! successive decodes of the same contract.

use std::collections::{BTreeSet, HashMap};

use ethnum::I256;

use crate::{
    decoder::value::{ScalarValue, SemanticVariable},
    utility::{Address, U256W},
};

/// The set of candidate mapping keys accumulated over a session.
///
/// Only addresses and integers are retained; other scalar kinds never key the
/// mappings this library is pointed at. The set only ever grows, so a decode
/// performed later in a session can discover strictly more mapping entries
/// than the same decode performed earlier, never fewer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WitnessSet {
    values: BTreeSet<ScalarValue>,
}

impl WitnessSet {
    /// Creates a witness set containing the zero address and the zero
    /// integer, which are always probed.
    #[must_use]
    pub fn new() -> Self {
        let mut values = BTreeSet::new();
        values.insert(ScalarValue::Address(Address::default()));
        values.insert(ScalarValue::Int(I256::ZERO));
        Self { values }
    }

    /// Adds a single scalar to the set, ignoring kinds that cannot key a
    /// mapping.
    pub fn insert(&mut self, value: &ScalarValue) {
        match value {
            ScalarValue::Int(_) | ScalarValue::Address(_) => {
                self.values.insert(value.clone());
            }
            _ => (),
        }
    }

    /// Adds every scalar reachable from `variable`.
    pub fn absorb(&mut self, variable: &SemanticVariable) {
        let mut scalars = Vec::new();
        variable.collect_scalars(&mut scalars);
        for scalar in scalars {
            self.insert(scalar);
        }
    }

    /// Iterates over the candidate keys whose kind can satisfy a mapping key
    /// type with the provided `key_label` (e.g. `address`, `uint256`).
    pub fn candidates<'a>(&'a self, key_label: &str) -> impl Iterator<Item = &'a ScalarValue> {
        let wants_address = key_label.starts_with("address") || key_label.starts_with("contract");
        self.values.iter().filter(move |value| match value {
            ScalarValue::Address(_) => wants_address,
            ScalarValue::Int(_) => !wants_address,
            _ => false,
        })
    }

    /// The number of witnesses currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Checks whether the set holds no witnesses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The storage words of one observation point, keyed by slot.
pub type StorageWords = HashMap<U256W, [u8; 32]>;

/// Session-scoped decoding state for one contract.
///
/// The cache owns the growing witness set and, when `use_cached_storage` is
/// enabled, the storage words carried forward from earlier observation points
/// so that traces recording only touched slots still decode against a full
/// picture of the contract's state.
#[derive(Clone, Debug)]
pub struct DecodeCache {
    /// The witnesses available for mapping key discovery.
    pub witnesses: WitnessSet,

    /// The most recent known word for every slot seen so far.
    storage: StorageWords,

    /// Whether carried-forward words participate in decoding.
    use_cached_storage: bool,
}

impl DecodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new(use_cached_storage: bool) -> Self {
        Self {
            witnesses: WitnessSet::new(),
            storage: StorageWords::new(),
            use_cached_storage,
        }
    }

    /// Produces the storage view for one observation point: the point's own
    /// words, backed by the carried-forward words when caching is enabled.
    ///
    /// The point's words win on conflict. The cache itself is not updated;
    /// see [`Self::absorb_storage`].
    #[must_use]
    pub fn view(&self, point_words: &StorageWords) -> StorageWords {
        if !self.use_cached_storage {
            return point_words.clone();
        }

        let mut view = self.storage.clone();
        for (slot, word) in point_words {
            view.insert(*slot, *word);
        }
        view
    }

    /// Folds one observation point's words into the carried-forward state.
    pub fn absorb_storage(&mut self, point_words: &StorageWords) {
        if !self.use_cached_storage {
            return;
        }

        for (slot, word) in point_words {
            self.storage.insert(*slot, *word);
        }
    }
}
