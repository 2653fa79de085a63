//! # Sparse Long Bit-Set
//!
//! [`LongBitSet`] is a set of `i64` identifiers with near-O(1) membership
//! and compact storage for clustered ids. It backs record-id candidate
//! sets during queries, where ids are dense near the low end of the range
//! but the key space is the full 64 bits.
//!
//! ## Partitioning
//!
//! The high 44 bits of an id select a partition; the low 20 bits address a
//! bit inside that partition's dense array:
//!
//! ```text
//! id: siiiiiiii...iiiii pppppppppppppppppppp
//!     └── partition key ┘└── 20-bit position ┘
//!           (id >> 20)        (id & 0xFFFFF)
//! ```
//!
//! Each partition covers 2^20 ids (~128 KiB fully populated) and is
//! allocated lazily, growing word-by-word toward the highest bit it
//! holds. The shift is arithmetic, so ids of small magnitude with either
//! sign cluster into a handful of partitions.
//!
//! ## Concurrency
//!
//! Not internally synchronized. A `LongBitSet` is confined to a single
//! logical operation (a query, a cache entry); sharing one across threads
//! requires an external lock.

use hashbrown::HashMap;

/// Bits addressed inside one partition.
const VALUE_BITS: u32 = 20;

/// Mask extracting the in-partition position from an id.
const VALUE_MASK: i64 = (1 << VALUE_BITS) - 1;

/// 64-bit words needed for a fully populated partition.
const PARTITION_WORDS: usize = 1 << (VALUE_BITS - 6);

/// A set of `i64` ids, partitioned into lazily grown dense bit arrays.
#[derive(Debug, Clone, Default)]
pub struct LongBitSet {
    partitions: HashMap<i64, Partition>,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    words: Vec<u64>,
}

impl Partition {
    fn get(&self, pos: usize) -> bool {
        let word = pos >> 6;
        word < self.words.len() && self.words[word] & (1u64 << (pos & 63)) != 0
    }

    fn set(&mut self, pos: usize) -> bool {
        let word = pos >> 6;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << (pos & 63);
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        !was_set
    }

    fn clear(&mut self, pos: usize) {
        let word = pos >> 6;
        if word < self.words.len() {
            self.words[word] &= !(1u64 << (pos & 63));
        }
    }

    fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

fn partition_key(id: i64) -> i64 {
    id >> VALUE_BITS
}

fn position(id: i64) -> usize {
    (id & VALUE_MASK) as usize
}

impl LongBitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` to the set. Returns true iff the bit transitioned 0 -> 1.
    pub fn set(&mut self, id: i64) -> bool {
        debug_assert!(position(id) < PARTITION_WORDS * 64);
        self.partitions
            .entry(partition_key(id))
            .or_default()
            .set(position(id))
    }

    /// Sets or clears the bit for `id`. Clearing a bit in an absent
    /// partition is a no-op and does not materialize the partition.
    pub fn set_value(&mut self, id: i64, value: bool) {
        if value {
            self.set(id);
        } else if let Some(partition) = self.partitions.get_mut(&partition_key(id)) {
            partition.clear(position(id));
        }
    }

    pub fn get(&self, id: i64) -> bool {
        self.partitions
            .get(&partition_key(id))
            .is_some_and(|p| p.get(position(id)))
    }

    /// Alias of [`LongBitSet::get`].
    pub fn contains(&self, id: i64) -> bool {
        self.get(id)
    }

    pub fn len(&self) -> usize {
        self.partitions.values().map(Partition::count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.values().all(Partition::is_empty)
    }

    /// Lazy ascending iterator over the set's ids, ordered across
    /// partitions and within each partition. Partition keys are sorted
    /// once up front; bits stream out per partition.
    pub fn iter(&self) -> Iter<'_> {
        let mut keys: Vec<i64> = self
            .partitions
            .iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        Iter {
            set: self,
            keys,
            key_index: 0,
            word_index: 0,
            pending: 0,
        }
    }

    /// Folds every id of `other` into this set.
    pub fn union_with(&mut self, other: &LongBitSet) {
        for (key, partition) in &other.partitions {
            let target = self.partitions.entry(*key).or_default();
            if target.words.len() < partition.words.len() {
                target.words.resize(partition.words.len(), 0);
            }
            for (word, bits) in partition.words.iter().enumerate() {
                target.words[word] |= bits;
            }
        }
    }

    /// Keeps only ids present in both sets.
    pub fn intersect_with(&mut self, other: &LongBitSet) {
        self.partitions.retain(|key, partition| {
            match other.partitions.get(key) {
                Some(theirs) => {
                    for (word, bits) in partition.words.iter_mut().enumerate() {
                        *bits &= theirs.words.get(word).copied().unwrap_or(0);
                    }
                    !partition.is_empty()
                }
                None => false,
            }
        });
    }
}

impl<'a> IntoIterator for &'a LongBitSet {
    type Item = i64;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<i64> for LongBitSet {
    fn from_iter<T: IntoIterator<Item = i64>>(iter: T) -> Self {
        let mut set = LongBitSet::new();
        for id in iter {
            set.set(id);
        }
        set
    }
}

pub struct Iter<'a> {
    set: &'a LongBitSet,
    keys: Vec<i64>,
    key_index: usize,
    word_index: usize,
    pending: u64,
}

impl Iterator for Iter<'_> {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        loop {
            if self.pending != 0 {
                let bit = self.pending.trailing_zeros() as usize;
                self.pending &= self.pending - 1;
                let key = self.keys[self.key_index];
                let pos = ((self.word_index - 1) << 6) | bit;
                return Some((key << VALUE_BITS) + pos as i64);
            }
            let key = *self.keys.get(self.key_index)?;
            // Partition cannot disappear while the borrow is held.
            let partition = &self.set.partitions[&key];
            match partition.words.get(self.word_index) {
                Some(word) => {
                    self.pending = *word;
                    self.word_index += 1;
                }
                None => {
                    self.key_index += 1;
                    self.word_index = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_the_zero_to_one_transition_exactly_once() {
        let mut set = LongBitSet::new();
        assert!(set.set(47));
        assert!(!set.set(47));
        set.set_value(47, false);
        assert!(set.set(47));
    }

    #[test]
    fn clearing_an_absent_id_does_not_materialize_a_partition() {
        let mut set = LongBitSet::new();
        set.set_value(1 << 30, false);
        assert!(set.partitions.is_empty());
    }

    #[test]
    fn membership_matches_partition_and_position() {
        let mut set = LongBitSet::new();
        for id in [0, 1, (1 << 20) - 1, 1 << 20, i64::MAX, i64::MIN] {
            set.set(id);
            assert!(set.contains(id), "id {} SHOULD be present", id);
        }
        assert!(!set.contains(2));
        assert_eq!(set.len(), 6);
    }

    #[test]
    fn negative_ids_share_the_arithmetic_shift_partitioning() {
        let mut set = LongBitSet::new();
        assert!(set.set(-1));
        assert!(set.set(-1048577));
        assert!(!set.set(-1));
        assert!(set.contains(-1));
        assert!(set.contains(-1048577));
        let ids: Vec<i64> = set.iter().collect();
        assert_eq!(ids, vec![-1048577, -1]);
    }

    #[test]
    fn iteration_is_ascending_across_partitions() {
        let ids = [-5_000_000, -1, 0, 7, 1_048_576, 99_999_999_999];
        let set: LongBitSet = ids.iter().copied().collect();
        let out: Vec<i64> = set.iter().collect();
        assert_eq!(out, ids);
    }

    #[test]
    fn union_and_intersection_fold_partitions() {
        let a: LongBitSet = [1, 2, 3, 1 << 21].iter().copied().collect();
        let b: LongBitSet = [2, 3, 4].iter().copied().collect();

        let mut union = a.clone();
        union.union_with(&b);
        assert_eq!(union.iter().collect::<Vec<_>>(), vec![1, 2, 3, 4, 1 << 21]);

        let mut intersection = a;
        intersection.intersect_with(&b);
        assert_eq!(intersection.iter().collect::<Vec<_>>(), vec![2, 3]);
    }
}
