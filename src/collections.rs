//! Hash containers keyed with a random siphash state.
//!
//! Every container in this crate that is keyed by data a remote peer
//! can choose (network endpoints, above all) uses these aliases, so
//! that peers cannot craft inputs that degenerate the tables.
use bitcoin_hashes::siphash24;

/// A `HashMap` whose random state is drawn from a `fastrand::Rng`.
pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;

/// A `HashSet` whose random state is drawn from a `fastrand::Rng`.
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

/// Hasher using `siphash24`.
#[derive(Default)]
pub struct Hasher {
    data: Vec<u8>,
    key1: u64,
    key2: u64,
}

impl std::hash::Hasher for Hasher {
    fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes)
    }

    fn finish(&self) -> u64 {
        siphash24::Hash::hash_with_keys(self.key1, self.key2, &self.data).as_u64()
    }
}

/// Random hasher state.
#[derive(Default, Clone)]
pub struct RandomState {
    key1: u64,
    key2: u64,
}

impl std::hash::BuildHasher for RandomState {
    type Hasher = Hasher;

    fn build_hasher(&self) -> Self::Hasher {
        Hasher {
            data: vec![],
            key1: self.key1,
            key2: self.key2,
        }
    }
}

impl From<fastrand::Rng> for RandomState {
    fn from(rng: fastrand::Rng) -> Self {
        Self {
            key1: rng.u64(..),
            key2: rng.u64(..),
        }
    }
}

/// A hash map seeded from the given rng.
pub fn map<K, V>(rng: &fastrand::Rng) -> HashMap<K, V> {
    HashMap::with_hasher(rng.clone().into())
}

/// A hash set seeded from the given rng.
pub fn set<K>(rng: &fastrand::Rng) -> HashSet<K> {
    HashSet::with_hasher(rng.clone().into())
}
