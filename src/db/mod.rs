//! # Block-Indexed Database
//!
//! The durable half of the store. Revisions transported out of the write
//! buffer are indexed three ways in parallel block families:
//!
//! ```text
//! <database dir>/
//! ├── cpb/      primary:   (record, key, version)   select / describe
//! ├── csb/      secondary: (key, value, version)    find / explore
//! └── ctb/      search:    (key, token, record)     substring search
//! ```
//!
//! Each family keeps an ordered catalog of sealed, immutable blocks plus
//! one mutable current block (an in-memory revision run). `accept`
//! appends to all three current blocks; crossing the seal threshold — or
//! an explicit `trigger_sync` — seals the current blocks of all families
//! under one shared block id, so a block id either exists in every family
//! or in none.
//!
//! ## Balance on Startup
//!
//! A crash mid-seal can leave a block id in some families only. `start`
//! intersects the three catalogs and discards every file of an
//! unbalanced id before opening anything, restoring the all-or-none
//! invariant at the cost of the torn block's data (which the buffer
//! still holds if the revisions came through transport, since transport
//! truncates only after the database acknowledges a sync).
//!
//! ## Caching
//!
//! Current-time folds are cached per (record, key) and per key. The
//! caches are kept coherent by append-in-place: `accept` applies each
//! revision to matching cached views under the same critical section
//! that makes the revision readable, so a cached read can never miss a
//! write that a direct read would have seen.
//!
//! ## Concurrency
//!
//! Families lock independently (reader/writer). Sealed blocks are
//! immutable and read lock-free through their maps; only the catalog and
//! the current block mutate, and only under a family's write latch.
//! The lock order is primary → secondary → search → caches; every path
//! that takes more than one of these acquires them in that order.

mod block;
mod bloom;
mod record;

pub use block::{Block, FamilyKind};
pub use record::{tokenize, PrimaryCache, SecondaryCache};

pub(crate) use record::{fold_value, search_fold_and_match};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{info, warn};

use crate::bitset::LongBitSet;
use crate::io;
use crate::types::{Operator, OperatorMatcher, Revision, Value};

struct Family {
    kind: FamilyKind,
    dir: PathBuf,
    state: RwLock<FamilyState>,
}

#[derive(Default)]
struct FamilyState {
    sealed: Vec<Block>,
    current: Vec<Revision>,
}

impl Family {
    fn new(kind: FamilyKind, database_dir: &Path) -> Self {
        Self {
            kind,
            dir: database_dir.join(kind.dir_name()),
            state: RwLock::new(FamilyState::default()),
        }
    }
}

/// The block-indexed durable store rooted at one directory.
pub struct Database {
    dir: PathBuf,
    primary: Family,
    secondary: Family,
    search: Family,
    next_block_id: AtomicU64,
    seal_threshold: usize,
    primary_cache: Mutex<PrimaryCache>,
    secondary_cache: Mutex<SecondaryCache>,
    running: AtomicBool,
}

impl Database {
    pub fn new<P: AsRef<Path>>(dir: P, seal_threshold: usize) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            primary: Family::new(FamilyKind::Primary, &dir),
            secondary: Family::new(FamilyKind::Secondary, &dir),
            search: Family::new(FamilyKind::Search, &dir),
            dir,
            next_block_id: AtomicU64::new(1),
            seal_threshold,
            primary_cache: Mutex::new(PrimaryCache::default()),
            secondary_cache: Mutex::new(SecondaryCache::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Replays the block catalogs, discards unbalanced block ids, and
    /// returns the newest version this database has durably persisted.
    pub fn start(&self) -> Result<i64> {
        ensure!(
            !self.running.load(Ordering::Acquire),
            "database at '{}' is already running",
            self.dir.display()
        );
        for family in self.families() {
            io::mkdirs(&family.dir)?;
        }

        let catalogs: Vec<HashSet<u64>> = self
            .families()
            .iter()
            .map(|family| {
                io::list_numbered_files(&family.dir, block::BLOCK_EXTENSION)
                    .map(|files| files.into_iter().map(|(id, _)| id).collect())
            })
            .collect::<Result<_>>()?;

        let balanced: HashSet<u64> = catalogs
            .iter()
            .skip(1)
            .fold(catalogs[0].clone(), |acc, ids| {
                acc.intersection(ids).copied().collect()
            });

        for (family, catalog) in self.families().iter().zip(&catalogs) {
            for id in catalog.difference(&balanced) {
                warn!(
                    family = family.kind.dir_name(),
                    block = id,
                    "discarding unbalanced block"
                );
                self.discard_block_files(family, *id)?;
            }
        }

        let mut max_id = 0u64;
        let mut max_version = 0i64;
        let mut ordered: Vec<u64> = balanced.into_iter().collect();
        ordered.sort_unstable();
        for family in self.families() {
            let mut opened = Vec::with_capacity(ordered.len());
            for id in &ordered {
                match Block::open(family.kind, *id, &family.dir) {
                    Ok(block) => {
                        max_version = max_version.max(block.max_version());
                        opened.push(block);
                    }
                    Err(e) => {
                        warn!(
                            family = family.kind.dir_name(),
                            block = id,
                            error = %e,
                            "discarding unreadable block"
                        );
                        self.discard_everywhere(*id)?;
                        return self.start_after_discard();
                    }
                }
            }
            let mut state = family.state.write();
            state.sealed = opened;
            state.current = Vec::new();
            max_id = max_id.max(ordered.last().copied().unwrap_or(0));
        }

        self.next_block_id.store(max_id + 1, Ordering::Release);
        self.primary_cache.lock().clear();
        self.secondary_cache.lock().clear();
        self.running.store(true, Ordering::Release);
        info!(
            dir = %self.dir.display(),
            blocks = ordered.len(),
            max_version,
            "database started"
        );
        Ok(max_version)
    }

    /// Closes the catalogs and unmaps every sealed block. Unsealed
    /// current-block revisions are dropped; their durable home is the
    /// write buffer until a sync is acknowledged.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for family in self.families() {
            let mut state = family.state.write();
            state.sealed.clear();
            state.current.clear();
        }
        self.primary_cache.lock().clear();
        self.secondary_cache.lock().clear();
        info!(dir = %self.dir.display(), "database stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Appends a revision to the current block of every family and to any
    /// matching cached views. Seals all families when one crosses the
    /// seal threshold.
    pub fn accept(&self, revision: Revision) -> Result<()> {
        self.check_running()?;
        let mut primary = self.primary.state.write();
        let mut secondary = self.secondary.state.write();
        let mut search = self.search.state.write();

        primary.current.push(revision.clone());
        secondary.current.push(revision.clone());
        if revision.value.is_search_indexable() {
            if let Some(text) = revision.value.as_text() {
                for token in tokenize(text) {
                    let mut indexed = revision.clone();
                    indexed.value = Value::String(token);
                    search.current.push(indexed);
                }
            }
        }

        let threshold = self.seal_threshold;
        if primary.current.len() >= threshold
            || secondary.current.len() >= threshold
            || search.current.len() >= threshold
        {
            self.seal_locked(&mut primary, &mut secondary, &mut search)?;
        }

        self.primary_cache.lock().apply(&revision);
        self.secondary_cache.lock().apply(&revision);
        Ok(())
    }

    /// Seals the current blocks of every family and fsyncs, even below
    /// the threshold. A no-op when nothing has been accepted since the
    /// last seal.
    pub fn trigger_sync(&self) -> Result<()> {
        self.check_running()?;
        let mut primary = self.primary.state.write();
        let mut secondary = self.secondary.state.write();
        let mut search = self.search.state.write();
        if primary.current.is_empty()
            && secondary.current.is_empty()
            && search.current.is_empty()
        {
            return Ok(());
        }
        self.seal_locked(&mut primary, &mut secondary, &mut search)
    }

    /// The number of blocks in a family's catalog, counting the mutable
    /// current block as the newest entry.
    pub fn block_count(&self, kind: FamilyKind) -> usize {
        self.family(kind).state.read().sealed.len() + 1
    }

    /// All values of (key, record), folded in version order.
    pub fn select(&self, key: &str, record: i64, ts: Option<i64>) -> Result<Vec<Value>> {
        self.check_running()?;
        if ts.is_none() {
            if let Some(hit) = self.primary_cache.lock().get(record, key) {
                return Ok(hit);
            }
        }
        let state = self.primary.state.read();
        let membership = block::primary_membership(record, key);
        let group = block::primary_group(record);
        let mut revisions = Vec::new();
        for sealed in &state.sealed {
            if !sealed.maybe_contains(&membership) {
                continue;
            }
            for revision in sealed.scan_group(&group)? {
                if revision.key == key && within(&revision, ts) {
                    revisions.push(revision);
                }
            }
        }
        for revision in &state.current {
            if revision.record == record && revision.key == key && within(revision, ts) {
                revisions.push(revision.clone());
            }
        }
        let values = record::fold_values(revisions);
        if ts.is_none() {
            // Inserted while the family read latch is held, so a racing
            // accept cannot slip a revision between the fold and the
            // cache becoming visible.
            self.primary_cache.lock().insert(record, key, values.clone());
        }
        drop(state);
        Ok(values)
    }

    /// The keys of `record` that currently hold at least one value.
    pub fn describe(&self, record: i64, ts: Option<i64>) -> Result<Vec<String>> {
        self.check_running()?;
        let state = self.primary.state.read();
        let group = block::primary_group(record);
        let mut revisions = Vec::new();
        for sealed in &state.sealed {
            for revision in sealed.scan_group(&group)? {
                if within(&revision, ts) {
                    revisions.push(revision);
                }
            }
        }
        for revision in &state.current {
            if revision.record == record && within(revision, ts) {
                revisions.push(revision.clone());
            }
        }
        drop(state);

        revisions.sort_by_key(|r| r.version);
        let mut folds: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for revision in revisions {
            let values = folds.entry(revision.key.clone()).or_default();
            record::fold_value(values, revision.action, &revision.value);
        }
        Ok(folds
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(key, _)| key)
            .collect())
    }

    /// The qualifying values of `key` and the records currently holding
    /// each, per the bound operator.
    pub fn explore(
        &self,
        key: &str,
        matcher: &OperatorMatcher,
        ts: Option<i64>,
    ) -> Result<BTreeMap<Value, LongBitSet>> {
        self.check_running()?;
        if ts.is_none() {
            if let Some(index) = self.secondary_cache.lock().get(key) {
                return Ok(filter_index(index, matcher));
            }
        }
        let state = self.secondary.state.read();
        let group = block::keyed_group(key);
        let mut revisions = Vec::new();
        for sealed in &state.sealed {
            for revision in sealed.scan_group(&group)? {
                if within(&revision, ts) {
                    revisions.push(revision);
                }
            }
        }
        for revision in &state.current {
            if revision.key == key && within(revision, ts) {
                revisions.push(revision.clone());
            }
        }
        let index = record::fold_index(revisions);
        let filtered = filter_index(&index, matcher);
        if ts.is_none() {
            self.secondary_cache.lock().insert(key, index);
        }
        drop(state);
        Ok(filtered)
    }

    /// The records where `key` satisfies the operator against `values`.
    pub fn find(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        ts: Option<i64>,
    ) -> Result<LongBitSet> {
        let matcher = operator.bind(values)?;
        let mut records = LongBitSet::new();
        for qualifying in self.explore(key, &matcher, ts)?.values() {
            records.union_with(qualifying);
        }
        Ok(records)
    }

    /// The records whose current STRING values of `key` contain every
    /// token of `query`.
    pub fn search(&self, key: &str, query: &str) -> Result<LongBitSet> {
        let revisions = self.search_revisions(key)?;
        Ok(record::search_fold_and_match(revisions, query))
    }

    /// Raw search-family revisions for `key`, sealed blocks plus the
    /// current block. The buffer overlay extends this run with its own
    /// token revisions before folding.
    pub(crate) fn search_revisions(&self, key: &str) -> Result<Vec<Revision>> {
        self.check_running()?;
        let state = self.search.state.read();
        let group = block::keyed_group(key);
        let mut revisions = Vec::new();
        for sealed in &state.sealed {
            revisions.extend(sealed.scan_group(&group)?);
        }
        for revision in &state.current {
            if revision.key == key {
                revisions.push(revision.clone());
            }
        }
        Ok(revisions)
    }

    /// True iff (key, value, record) is present under the fold.
    pub fn verify(&self, key: &str, value: &Value, record: i64, ts: Option<i64>) -> Result<bool> {
        Ok(self.select(key, record, ts)?.contains(value))
    }

    fn families(&self) -> [&Family; 3] {
        [&self.primary, &self.secondary, &self.search]
    }

    fn family(&self, kind: FamilyKind) -> &Family {
        match kind {
            FamilyKind::Primary => &self.primary,
            FamilyKind::Secondary => &self.secondary,
            FamilyKind::Search => &self.search,
        }
    }

    fn check_running(&self) -> Result<()> {
        ensure!(
            self.running.load(Ordering::Acquire),
            "database at '{}' is not running",
            self.dir.display()
        );
        Ok(())
    }

    fn seal_locked<'a>(
        &self,
        primary: &mut RwLockWriteGuard<'a, FamilyState>,
        secondary: &mut RwLockWriteGuard<'a, FamilyState>,
        search: &mut RwLockWriteGuard<'a, FamilyState>,
    ) -> Result<()> {
        let id = self.next_block_id.fetch_add(1, Ordering::AcqRel);
        for (family, state) in [
            (&self.primary, primary),
            (&self.secondary, secondary),
            (&self.search, search),
        ] {
            let revisions = std::mem::take(&mut state.current);
            let block = Block::seal(family.kind, id, &family.dir, revisions)
                .wrap_err_with(|| format!("failed to seal {} block {}", family.kind.dir_name(), id))?;
            state.sealed.push(block);
        }
        Ok(())
    }

    fn discard_block_files(&self, family: &Family, id: u64) -> Result<()> {
        io::delete_file(&family.dir.join(format!("{}.{}", id, block::BLOCK_EXTENSION)))?;
        io::delete_file(&family.dir.join(format!("{}.{}", id, block::INDEX_EXTENSION)))
    }

    fn discard_everywhere(&self, id: u64) -> Result<()> {
        for family in self.families() {
            self.discard_block_files(family, id)?;
        }
        Ok(())
    }

    fn start_after_discard(&self) -> Result<i64> {
        // A block failed to open and was discarded in every family; the
        // catalogs changed, so replay from scratch.
        for family in self.families() {
            let mut state = family.state.write();
            state.sealed.clear();
            state.current.clear();
        }
        self.start()
    }
}

impl crate::store::Store for Database {
    fn select(&self, key: &str, record: i64, ts: Option<i64>) -> Result<Vec<Value>> {
        Database::select(self, key, record, ts)
    }

    fn describe(&self, record: i64, ts: Option<i64>) -> Result<Vec<String>> {
        Database::describe(self, record, ts)
    }

    fn find(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        ts: Option<i64>,
    ) -> Result<LongBitSet> {
        Database::find(self, key, operator, values, ts)
    }

    fn search(&self, key: &str, query: &str) -> Result<LongBitSet> {
        Database::search(self, key, query)
    }

    fn verify(&self, key: &str, value: &Value, record: i64, ts: Option<i64>) -> Result<bool> {
        Database::verify(self, key, value, record, ts)
    }
}

fn within(revision: &Revision, ts: Option<i64>) -> bool {
    ts.map_or(true, |t| revision.version <= t)
}

fn filter_index(
    index: &BTreeMap<Value, LongBitSet>,
    matcher: &OperatorMatcher,
) -> BTreeMap<Value, LongBitSet> {
    index
        .iter()
        .filter(|(value, records)| matcher.matches(value) && !records.is_empty())
        .map(|(value, records)| (value.clone(), records.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Write;
    use tempfile::tempdir;

    fn database(dir: &Path) -> Database {
        let db = Database::new(dir, 64);
        db.start().unwrap();
        db
    }

    fn accept_add(db: &Database, key: &str, value: Value, record: i64, version: i64) {
        db.accept(Revision::stamp(Write::add(key, value, record), version))
            .unwrap();
    }

    #[test]
    fn select_folds_adds_and_removes() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "name", Value::String("ada".into()), 1, 1);
        accept_add(&db, "name", Value::String("grace".into()), 1, 2);
        db.accept(Revision::stamp(
            Write::remove("name", Value::String("ada".into()), 1),
            3,
        ))
        .unwrap();
        assert_eq!(
            db.select("name", 1, None).unwrap(),
            vec![Value::String("grace".into())]
        );
        assert_eq!(
            db.select("name", 1, Some(2)).unwrap(),
            vec![Value::String("ada".into()), Value::String("grace".into())]
        );
    }

    #[test]
    fn reads_span_sealed_and_current_blocks() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "count", Value::Integer(1), 9, 1);
        db.trigger_sync().unwrap();
        accept_add(&db, "count", Value::Integer(2), 9, 2);
        let values = db.select("count", 9, None).unwrap();
        assert_eq!(values, vec![Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn find_unions_qualifying_values() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "age", Value::Integer(30), 1, 1);
        accept_add(&db, "age", Value::Integer(40), 2, 2);
        accept_add(&db, "age", Value::Integer(50), 3, 3);
        let records = db
            .find("age", Operator::GreaterThan, &[Value::Integer(35)], None)
            .unwrap();
        assert_eq!(records.iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn search_matches_every_query_token() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(
            &db,
            "bio",
            Value::String("systems programming in rust".into()),
            1,
            1,
        );
        accept_add(&db, "bio", Value::String("systems design".into()), 2, 2);
        assert_eq!(
            db.search("bio", "systems").unwrap().iter().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            db.search("bio", "systems rust").unwrap().iter().collect::<Vec<_>>(),
            vec![1]
        );
        assert!(db.search("bio", "").unwrap().is_empty());
    }

    #[test]
    fn tag_values_are_not_search_indexed() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "label", Value::Tag("hidden words".into()), 1, 1);
        assert!(db.search("label", "hidden").unwrap().is_empty());
        assert!(db
            .verify("label", &Value::Tag("hidden words".into()), 1, None)
            .unwrap());
    }

    #[test]
    fn describe_lists_keys_with_present_values() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "name", Value::String("ada".into()), 5, 1);
        accept_add(&db, "age", Value::Integer(36), 5, 2);
        db.accept(Revision::stamp(
            Write::remove("age", Value::Integer(36), 5),
            3,
        ))
        .unwrap();
        assert_eq!(db.describe(5, None).unwrap(), vec!["name".to_string()]);
        assert_eq!(
            db.describe(5, Some(2)).unwrap(),
            vec!["age".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn restart_discards_unbalanced_blocks() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "k", Value::Integer(1), 1, 1);
        db.trigger_sync().unwrap();
        db.stop();

        io::delete_dir_tolerant(&dir.path().join("csb")).unwrap();
        io::mkdirs(&dir.path().join("csb")).unwrap();

        let db = database(dir.path());
        assert_eq!(db.block_count(FamilyKind::Primary), 1);
        assert_eq!(db.block_count(FamilyKind::Secondary), 1);
        assert_eq!(db.block_count(FamilyKind::Search), 1);
    }

    #[test]
    fn restart_preserves_balanced_blocks() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        accept_add(&db, "k", Value::Integer(7), 3, 11);
        db.trigger_sync().unwrap();
        db.stop();

        let db = database(dir.path());
        assert_eq!(db.select("k", 3, None).unwrap(), vec![Value::Integer(7)]);
        assert_eq!(db.block_count(FamilyKind::Primary), 2);
    }

    #[test]
    fn cached_primary_views_append_in_place() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        for i in 0..17 {
            accept_add(&db, "foo", Value::Integer(i), 42, i64::from(i) + 1);
        }
        let first = db.select("foo", 42, None).unwrap();
        assert_eq!(first.len(), 17);

        accept_add(&db, "foo", Value::Integer(99999), 42, 100);
        let second = db.select("foo", 42, None).unwrap();
        assert!(second.contains(&Value::Integer(99999)));
    }

    #[test]
    fn cached_secondary_views_append_in_place() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        let value = Value::String("shared".into());
        for record in 0..10 {
            accept_add(&db, "k", value.clone(), record, record + 1);
        }
        let before = db
            .find("k", Operator::Equals, &[value.clone()], None)
            .unwrap();
        assert_eq!(before.len(), 10);

        accept_add(&db, "k", value.clone(), 500, 100);
        let after = db.find("k", Operator::Equals, &[value], None).unwrap();
        assert!(after.contains(500));
    }

    #[test]
    fn threshold_crossing_seals_every_family_together() {
        let dir = tempdir().unwrap();
        let db = Database::new(dir.path(), 4);
        db.start().unwrap();
        for i in 0..4 {
            accept_add(&db, "k", Value::Integer(i), i64::from(i), i64::from(i) + 1);
        }
        assert_eq!(db.block_count(FamilyKind::Primary), 2);
        assert_eq!(db.block_count(FamilyKind::Secondary), 2);
        assert_eq!(db.block_count(FamilyKind::Search), 2);
    }

    #[test]
    fn operations_on_a_stopped_database_fail() {
        let dir = tempdir().unwrap();
        let db = database(dir.path());
        db.stop();
        assert!(db.select("k", 1, None).is_err());
        assert!(db
            .accept(Revision::stamp(Write::add("k", Value::Integer(1), 1), 1))
            .is_err());
    }
}
