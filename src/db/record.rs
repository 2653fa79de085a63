//! # Folded Record Views and Their Caches
//!
//! A stored record is never materialized on disk; reads reconstruct it by
//! folding revisions in version order. ADD inserts a value into the view,
//! REMOVE deletes it, so the folded state of a (key, record) pair is the
//! set of values whose ADD count exceeds their REMOVE count — with legal
//! histories strictly alternating, "present" means an odd total.
//!
//! Three fold shapes serve the three read paths:
//!
//! - value fold: (key, record) -> ordered set of values (`select`)
//! - index fold: key -> value -> record id set (`find`/`explore`)
//! - search fold: key -> token -> record occurrence counts (`search`)
//!
//! ## Caches
//!
//! The primary and secondary folds are cached for current-time reads.
//! Coherence is by append-in-place: when the database accepts a write
//! matching a cached entry, the fold step is applied to the entry under
//! the cache lock, so the cache never needs a restart to see new writes.
//! Both caches are bounded; at capacity an arbitrary entry is dropped.
//! Historical (timestamped) reads never touch the caches.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::bitset::LongBitSet;
use crate::config::RECORD_CACHE_CAPACITY;
use crate::types::{Action, Revision, Value};

/// Splits string text into search tokens: lowercased, whitespace-delimited,
/// deduplicated. One value contributes at most one occurrence per token, so
/// the add and remove of a value always move a token's count symmetrically.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = hashbrown::HashSet::new();
    text.split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| !t.is_empty() && seen.insert(t.clone()))
        .collect()
}

/// Sorts revisions into version order and drops exact duplicates. A crash
/// between a database sync acknowledgement and the buffer's cursor advance
/// replays already-transported revisions, so the same (version, value) can
/// reach a fold twice; folding it twice would corrupt occurrence counts.
fn sort_for_fold(revisions: &mut Vec<Revision>) {
    revisions.sort_by(|a, b| {
        a.version
            .cmp(&b.version)
            .then_with(|| a.value.cmp(&b.value))
    });
    revisions.dedup();
}

/// Folds one revision into an ordered value set.
pub fn fold_value(values: &mut Vec<Value>, action: Action, value: &Value) {
    match action {
        Action::Add => {
            if !values.contains(value) {
                values.push(value.clone());
            }
        }
        Action::Remove => values.retain(|v| v != value),
    }
}

/// Folds revisions (any order) into the ordered value set for one
/// (key, record) pair. Sorts by version internally.
pub fn fold_values(mut revisions: Vec<Revision>) -> Vec<Value> {
    sort_for_fold(&mut revisions);
    let mut values = Vec::new();
    for revision in &revisions {
        fold_value(&mut values, revision.action, &revision.value);
    }
    values
}

/// Folds revisions of one key into the inverted view: value -> records
/// currently holding it.
pub fn fold_index(mut revisions: Vec<Revision>) -> BTreeMap<Value, LongBitSet> {
    sort_for_fold(&mut revisions);
    let mut index: BTreeMap<Value, LongBitSet> = BTreeMap::new();
    for revision in revisions {
        let records = index.entry(revision.value).or_default();
        records.set_value(revision.record, revision.action == Action::Add);
    }
    index
}

/// Folds search-family revisions of one key into token -> record
/// occurrence counts. A record matches a token while its count is
/// positive; two present values containing the same token keep the
/// count at two, so removing one leaves the token indexed.
pub fn fold_search(mut revisions: Vec<Revision>) -> HashMap<String, HashMap<i64, i64>> {
    sort_for_fold(&mut revisions);
    let mut counts: HashMap<String, HashMap<i64, i64>> = HashMap::new();
    for revision in revisions {
        let token = match revision.value.as_text() {
            Some(token) => token.to_string(),
            None => continue,
        };
        let delta = match revision.action {
            Action::Add => 1,
            Action::Remove => -1,
        };
        *counts.entry(token).or_default().entry(revision.record).or_insert(0) += delta;
    }
    counts
}

/// Folds search revisions and intersects the record sets of every query
/// token. An empty or whitespace-only query matches nothing.
pub fn search_fold_and_match(revisions: Vec<Revision>, query: &str) -> LongBitSet {
    let tokens = tokenize(query);
    if tokens.is_empty() {
        return LongBitSet::new();
    }
    let counts = fold_search(revisions);
    let mut result: Option<LongBitSet> = None;
    for token in &tokens {
        let records = search_token_records(&counts, token);
        result = Some(match result {
            Some(mut acc) => {
                acc.intersect_with(&records);
                acc
            }
            None => records,
        });
    }
    result.unwrap_or_default()
}

/// Records whose count for `token` is positive.
pub fn search_token_records(
    counts: &HashMap<String, HashMap<i64, i64>>,
    token: &str,
) -> LongBitSet {
    let mut records = LongBitSet::new();
    if let Some(per_record) = counts.get(token) {
        for (record, count) in per_record {
            if *count > 0 {
                records.set(*record);
            }
        }
    }
    records
}

/// Cache of folded (record, key) value sets for current-time selects.
#[derive(Debug, Default)]
pub struct PrimaryCache {
    entries: HashMap<(i64, String), Vec<Value>>,
}

impl PrimaryCache {
    pub fn get(&self, record: i64, key: &str) -> Option<Vec<Value>> {
        self.entries.get(&(record, key.to_string())).cloned()
    }

    pub fn insert(&mut self, record: i64, key: &str, values: Vec<Value>) {
        if self.entries.len() >= RECORD_CACHE_CAPACITY
            && !self.entries.contains_key(&(record, key.to_string()))
        {
            self.evict_one();
        }
        self.entries.insert((record, key.to_string()), values);
    }

    /// Appends an accepted write to the matching cached view, keeping the
    /// cache coherent without invalidation.
    pub fn apply(&mut self, revision: &Revision) {
        if let Some(values) = self
            .entries
            .get_mut(&(revision.record, revision.key.clone()))
        {
            fold_value(values, revision.action, &revision.value);
        }
    }

    pub fn invalidate(&mut self, record: i64, key: &str) {
        self.entries.remove(&(record, key.to_string()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_one(&mut self) {
        if let Some(victim) = self.entries.keys().next().cloned() {
            self.entries.remove(&victim);
        }
    }
}

/// Cache of folded per-key inverted indexes for current-time finds.
#[derive(Debug, Default)]
pub struct SecondaryCache {
    entries: HashMap<String, BTreeMap<Value, LongBitSet>>,
}

impl SecondaryCache {
    pub fn get(&self, key: &str) -> Option<&BTreeMap<Value, LongBitSet>> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: &str, index: BTreeMap<Value, LongBitSet>) {
        if self.entries.len() >= RECORD_CACHE_CAPACITY && !self.entries.contains_key(key) {
            self.evict_one();
        }
        self.entries.insert(key.to_string(), index);
    }

    pub fn apply(&mut self, revision: &Revision) {
        if let Some(index) = self.entries.get_mut(&revision.key) {
            let records = index.entry(revision.value.clone()).or_default();
            records.set_value(revision.record, revision.action == Action::Add);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_one(&mut self) {
        if let Some(victim) = self.entries.keys().next().cloned() {
            self.entries.remove(&victim);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Write;

    fn rev(action: Action, key: &str, value: Value, record: i64, version: i64) -> Revision {
        let write = match action {
            Action::Add => Write::add(key, value, record),
            Action::Remove => Write::remove(key, value, record),
        };
        Revision::stamp(write, version)
    }

    #[test]
    fn value_fold_honors_version_order() {
        let revisions = vec![
            rev(Action::Remove, "k", Value::Integer(1), 1, 3),
            rev(Action::Add, "k", Value::Integer(1), 1, 1),
            rev(Action::Add, "k", Value::Integer(2), 1, 2),
        ];
        assert_eq!(fold_values(revisions), vec![Value::Integer(2)]);
    }

    #[test]
    fn index_fold_tracks_records_per_value() {
        let revisions = vec![
            rev(Action::Add, "k", Value::Integer(1), 10, 1),
            rev(Action::Add, "k", Value::Integer(1), 11, 2),
            rev(Action::Remove, "k", Value::Integer(1), 10, 3),
            rev(Action::Add, "k", Value::Integer(2), 12, 4),
        ];
        let index = fold_index(revisions);
        let ones: Vec<i64> = index[&Value::Integer(1)].iter().collect();
        assert_eq!(ones, vec![11]);
        assert!(index[&Value::Integer(2)].contains(12));
    }

    #[test]
    fn search_fold_counts_token_occurrences() {
        let hello = Value::String("hello".to_string());
        let revisions = vec![
            rev(Action::Add, "k", hello.clone(), 1, 1),
            rev(Action::Add, "k", hello.clone(), 1, 2),
            rev(Action::Remove, "k", hello, 1, 3),
        ];
        let counts = fold_search(revisions);
        let records = search_token_records(&counts, "hello");
        assert!(
            records.contains(1),
            "token SHOULD stay indexed while one occurrence remains"
        );
    }

    #[test]
    fn tokenizer_lowercases_and_splits() {
        assert_eq!(tokenize("  Hello  World "), vec!["hello", "world"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn primary_cache_applies_matching_writes() {
        let mut cache = PrimaryCache::default();
        cache.insert(42, "foo", vec![Value::Integer(1)]);
        cache.apply(&rev(Action::Add, "foo", Value::Integer(99999), 42, 10));
        cache.apply(&rev(Action::Add, "foo", Value::Integer(7), 43, 11));
        let values = cache.get(42, "foo").unwrap();
        assert!(values.contains(&Value::Integer(99999)));
        assert!(!values.contains(&Value::Integer(7)));
    }

    #[test]
    fn caches_stay_bounded() {
        let mut cache = PrimaryCache::default();
        for record in 0..(RECORD_CACHE_CAPACITY + 10) as i64 {
            cache.insert(record, "k", Vec::new());
        }
        assert!(cache.len() <= RECORD_CACHE_CAPACITY);
    }
}
