//! Keys identifying the nodes of the 2^D-ary function tree.
//!
//! A key is a refinement level `n` and an integer translation vector in
//! `[0, 2^n)^D`. Keys are totally ordered by level and then by the
//! Morton-style interleave of their translation, so that siblings sort
//! together.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Level value marking the invalid sentinel key.
const INVALID_LEVEL: u8 = u8::MAX;

/// Identifier of one box of the dyadic subdivision of the unit hypercube.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Key<const D: usize> {
    level: u8,
    translation: [i64; D],
}

impl<const D: usize> Key<D> {
    /// Key of the root box.
    pub fn root() -> Self {
        Self {
            level: 0,
            translation: [0; D],
        }
    }

    /// Key with the given level and translation.
    pub fn new(level: u8, translation: [i64; D]) -> Self {
        debug_assert!(
            level == INVALID_LEVEL
                || translation
                    .iter()
                    .all(|&l| l >= 0 && l < (1i64 << level)),
            "translation out of range for level"
        );
        Self { level, translation }
    }

    /// Sentinel returned by neighbor lookups that exit the volume under
    /// zero boundary conditions.
    pub fn invalid() -> Self {
        Self {
            level: INVALID_LEVEL,
            translation: [0; D],
        }
    }

    /// False only for the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        self.level != INVALID_LEVEL
    }

    /// Refinement level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Translation vector.
    pub fn translation(&self) -> &[i64; D] {
        &self.translation
    }

    /// Key of the parent box; the root is its own parent.
    pub fn parent(&self) -> Self {
        if self.level == 0 {
            return *self;
        }
        let mut t = [0i64; D];
        for (p, l) in t.iter_mut().zip(self.translation.iter()) {
            *p = l >> 1;
        }
        Self {
            level: self.level - 1,
            translation: t,
        }
    }

    /// Ancestor at the given coarser level.
    pub fn ancestor_at(&self, level: u8) -> Self {
        assert!(level <= self.level);
        let shift = self.level - level;
        let mut t = [0i64; D];
        for (p, l) in t.iter_mut().zip(self.translation.iter()) {
            *p = l >> shift;
        }
        Self {
            level,
            translation: t,
        }
    }

    /// Number of children of any key.
    pub const fn nchildren() -> usize {
        1 << D
    }

    /// Child `i`, with bit `d` of `i` selecting the upper half along
    /// dimension `d`.
    pub fn child(&self, i: usize) -> Self {
        debug_assert!(i < Self::nchildren());
        let mut t = [0i64; D];
        for (d, (c, l)) in t.iter_mut().zip(self.translation.iter()).enumerate() {
            *c = 2 * l + ((i >> d) & 1) as i64;
        }
        Self {
            level: self.level + 1,
            translation: t,
        }
    }

    /// All 2^D children in child-index order.
    pub fn children(&self) -> impl Iterator<Item = Key<D>> + '_ {
        (0..Self::nchildren()).map(move |i| self.child(i))
    }

    /// True if `self` lies in the subtree rooted at `other`.
    pub fn is_descendant_of(&self, other: &Self) -> bool {
        other.level <= self.level && self.ancestor_at(other.level) == *other
    }

    /// Translation shifted by `step` along `axis`, without any boundary
    /// handling; the caller applies boundary conditions.
    pub fn shifted(&self, axis: usize, step: i64) -> (Self, bool) {
        let mut t = self.translation;
        t[axis] += step;
        let n = 1i64 << self.level;
        let inside = t[axis] >= 0 && t[axis] < n;
        (
            Self {
                level: self.level,
                translation: t,
            },
            inside,
        )
    }

    /// Translation shifted by a displacement vector, componentwise; the
    /// second result flags which components stayed inside `[0, 2^n)`.
    pub fn shifted_by(&self, disp: &[i64; D]) -> (Self, [bool; D]) {
        let mut t = self.translation;
        let mut inside = [true; D];
        let n = 1i64 << self.level;
        for d in 0..D {
            t[d] += disp[d];
            inside[d] = t[d] >= 0 && t[d] < n;
        }
        (
            Self {
                level: self.level,
                translation: t,
            },
            inside,
        )
    }

    /// Squared Euclidean length of the translation, used as a displacement
    /// distance by operator screening.
    pub fn distsq(&self) -> i64 {
        self.translation.iter().map(|&l| l * l).sum()
    }

    /// Translation mapped back into `[0, 2^n)` componentwise, for periodic
    /// boundary conditions.
    pub fn wrapped(&self) -> Self {
        let n = 1i64 << self.level;
        let mut t = self.translation;
        for l in t.iter_mut() {
            *l = l.rem_euclid(n);
        }
        Self {
            level: self.level,
            translation: t,
        }
    }

    /// Bit `b` of the Morton interleave, dimension-major within each bit
    /// plane, most significant plane first.
    fn interleave_cmp(&self, other: &Self) -> Ordering {
        for b in (0..self.level).rev() {
            for d in 0..D {
                let sb = (self.translation[d] >> b) & 1;
                let ob = (other.translation[d] >> b) & 1;
                match sb.cmp(&ob) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
        }
        Ordering::Equal
    }
}

impl<const D: usize> PartialOrd for Key<D> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<const D: usize> Ord for Key<D> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.level
            .cmp(&other.level)
            .then_with(|| self.interleave_cmp(other))
    }
}

impl<const D: usize> Hash for Key<D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.level.hash(state);
        self.translation.hash(state);
    }
}

impl<const D: usize> fmt::Display for Key<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "(invalid)");
        }
        write!(f, "(n={}, l=[", self.level)?;
        for (d, l) in self.translation.iter().enumerate() {
            if d > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", l)?;
        }
        write!(f, "])")
    }
}

// The translation is serialized element by element because serde does not
// derive array impls for a const-generic length.
impl<const D: usize> Serialize for Key<D> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(1 + D)?;
        t.serialize_element(&self.level)?;
        for l in &self.translation {
            t.serialize_element(l)?;
        }
        t.end()
    }
}

impl<'de, const D: usize> Deserialize<'de> for Key<D> {
    fn deserialize<De: Deserializer<'de>>(deserializer: De) -> Result<Self, De::Error> {
        struct KeyVisitor<const D: usize>;

        impl<'de, const D: usize> Visitor<'de> for KeyVisitor<D> {
            type Value = Key<D>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a level followed by {} translation components", D)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Key<D>, A::Error> {
                use serde::de::Error;
                let level: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let mut translation = [0i64; D];
                for (i, l) in translation.iter_mut().enumerate() {
                    *l = seq
                        .next_element()?
                        .ok_or_else(|| A::Error::invalid_length(i + 1, &self))?;
                }
                Ok(Key { level, translation })
            }
        }

        deserializer.deserialize_tuple(1 + D, KeyVisitor::<D>)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parent_child_round_trip() {
        let key = Key::<3>::new(2, [1, 2, 3]);
        for (i, child) in key.children().enumerate() {
            assert_eq!(child.parent(), key);
            assert_eq!(child, key.child(i));
            assert!(child.is_descendant_of(&key));
        }
        assert_eq!(Key::<3>::root().parent(), Key::<3>::root());
    }

    #[test]
    fn ordering_is_by_level_then_interleave() {
        let root = Key::<2>::root();
        let a = Key::<2>::new(1, [0, 0]);
        let b = Key::<2>::new(1, [1, 1]);
        assert!(root < a);
        assert!(a < b);
        let c = Key::<2>::new(2, [0, 3]);
        let d = Key::<2>::new(2, [2, 0]);
        // First bit plane: c = (0,1), d = (1,0); dimension 0 decides.
        assert!(c < d);
    }

    #[test]
    fn shifts_report_volume_exits() {
        let key = Key::<1>::new(2, [3]);
        let (n, inside) = key.shifted(0, 1);
        assert!(!inside);
        assert_eq!(n.translation()[0], 4);
        let (_, inside) = key.shifted(0, -1);
        assert!(inside);
    }

    #[test]
    fn serde_round_trip() {
        let key = Key::<3>::new(5, [7, 11, 13]);
        let bytes = bincode::serialize(&key).unwrap();
        let back: Key<3> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(key, back);
    }
}
