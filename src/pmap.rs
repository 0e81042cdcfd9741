//! Process maps assigning tree keys to owning ranks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::constants::PMAP_LOCALITY_LEVEL;
use crate::key::Key;

/// Rank of a process within the world.
pub type Rank = usize;

/// Pure function from key to owning rank.
pub trait ProcessMap<const D: usize>: Send + Sync {
    /// Owning rank of `key`.
    fn owner(&self, key: &Key<D>) -> Rank;
}

fn hash_key<const D: usize>(key: &Key<D>) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Default map: the root lives on rank 0, shallow keys are hashed
/// individually, and keys below the locality level are mapped through their
/// ancestor at that level so that deep subtrees stay with their parents.
#[derive(Clone, Debug)]
pub struct LevelHashMap {
    nproc: usize,
    n0: u8,
}

impl LevelHashMap {
    /// Map over `nproc` ranks with the default locality level.
    pub fn new(nproc: usize) -> Self {
        Self {
            nproc,
            n0: PMAP_LOCALITY_LEVEL,
        }
    }

    /// Map with an explicit locality level.
    pub fn with_locality(nproc: usize, n0: u8) -> Self {
        Self { nproc, n0 }
    }
}

impl<const D: usize> ProcessMap<D> for LevelHashMap {
    fn owner(&self, key: &Key<D>) -> Rank {
        if key.level() == 0 {
            0
        } else if key.level() <= self.n0 {
            (hash_key(key) % self.nproc as u64) as Rank
        } else {
            (hash_key(&key.ancestor_at(self.n0)) % self.nproc as u64) as Rank
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deep_keys_stay_with_their_ancestor() {
        let pmap = LevelHashMap::with_locality(7, 2);
        let anchor = Key::<2>::new(2, [1, 3]);
        let owner = ProcessMap::<2>::owner(&pmap, &anchor);
        let mut key = anchor;
        for _ in 0..5 {
            key = key.child(3);
            assert_eq!(ProcessMap::<2>::owner(&pmap, &key), owner);
        }
        assert_eq!(ProcessMap::<2>::owner(&pmap, &Key::<2>::root()), 0);
    }

    #[test]
    fn owners_are_in_range() {
        let pmap = LevelHashMap::new(5);
        for l in 0..4 {
            let key = Key::<1>::new(2, [l]);
            assert!(ProcessMap::<1>::owner(&pmap, &key) < 5);
        }
    }
}
