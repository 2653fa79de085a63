//! # Write Buffer
//!
//! The append-only, durable staging area ahead of the database. Every
//! accepted write is stamped with the next version, framed, appended to
//! the current segment file, and fsynced before the append returns:
//!
//! ```text
//! <buffer dir>/
//! ├── 1.seg              framed revisions, oldest first
//! ├── 2.seg
//! ├── 3.seg              current append target
//! └── transport.cursor   (oldest segment, frames consumed) + CRC
//! ```
//!
//! ## Overlay Reads
//!
//! The buffer answers reads by composing its own revisions, newest last,
//! over an upstream view supplied by the database. For the set-shaped
//! folds (select, describe, find, verify) the upstream view is the
//! database's folded result and buffered revisions are folded on top in
//! version order. Search folds occurrence counts, which double-apply
//! badly, so the search overlay instead extends the database's raw
//! revision run and folds once.
//!
//! ## Transport
//!
//! `transport` hands an ordered prefix of the log to the database, waits
//! for the database to seal and sync, and only then truncates: the
//! in-memory prefix is dropped, the durable cursor is advanced, and
//! fully consumed segment files are deleted. The whole batch runs under
//! the log's writer latch, so readers never observe a revision in both
//! the overlay and the database's freshly sealed blocks.
//!
//! Crash windows are benign by construction: dying before the sync
//! acknowledgement replays the prefix into the buffer (the database
//! discards its unbalanced partial blocks); dying between the
//! acknowledgement and the cursor advance replays revisions the database
//! already holds, which the fold paths deduplicate by version.
//!
//! ## Concurrency
//!
//! `append` serializes through a writer mutex that owns the segment
//! file; the version counter increments inside it, so log order equals
//! version order. Readers take the log latch shared; transport takes it
//! exclusive. The writer mutex is always acquired before the log latch.

use std::collections::VecDeque;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bitset::LongBitSet;
use crate::config::MAX_SEGMENT_SIZE;
use crate::db::{self, Database};
use crate::io::{self, frames};
use crate::types::{Action, OperatorMatcher, Revision, Value, Write};

const SEGMENT_EXTENSION: &str = "seg";
const CURSOR_FILE: &str = "transport.cursor";

struct SegmentWriter {
    file: File,
    sequence: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy)]
struct SegmentMeta {
    sequence: u64,
    frames: u64,
}

#[derive(Default)]
struct BufferLog {
    /// Untransported revisions, oldest first.
    revisions: VecDeque<Revision>,
    /// Segment files backing the log, oldest first; the last entry is the
    /// current append target.
    segments: VecDeque<SegmentMeta>,
    /// Frames of the oldest segment already transported.
    consumed_in_oldest: u64,
}

/// The durable append-only log of writes awaiting transport.
pub struct Buffer {
    dir: PathBuf,
    writer: Mutex<Option<SegmentWriter>>,
    log: RwLock<BufferLog>,
    next_version: AtomicI64,
    running: AtomicBool,
}

impl Buffer {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            writer: Mutex::new(None),
            log: RwLock::new(BufferLog::default()),
            next_version: AtomicI64::new(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Replays the segment files and returns the newest version the
    /// buffer holds durably (0 when empty). Torn tails are truncated.
    pub fn start(&self) -> Result<i64> {
        ensure!(
            !self.running.load(Ordering::Acquire),
            "buffer at '{}' is already running",
            self.dir.display()
        );
        io::mkdirs(&self.dir)?;

        let mut cursor = read_cursor(&self.dir.join(CURSOR_FILE));
        let mut log = BufferLog::default();
        let mut max_version = 0i64;

        let files = io::list_numbered_files(&self.dir, SEGMENT_EXTENSION)?;
        if files.is_empty() && cursor != (0, 0) {
            // No segments means no data; a leftover cursor would make a
            // future replay skip or delete fresh segments.
            io::delete_file(&self.dir.join(CURSOR_FILE))?;
            cursor = (0, 0);
        }
        for (sequence, path) in &files {
            if *sequence < cursor.0 {
                // Fully transported before a crash interrupted cleanup.
                io::delete_file(path)?;
                continue;
            }
            let bytes = std::fs::read(path)
                .wrap_err_with(|| format!("failed to read segment '{}'", path.display()))?;
            let payloads = frames::decode_all(&bytes, false)?;
            let valid_len: usize = payloads.iter().map(|p| frames::frame_size(p.len())).sum();
            if valid_len < bytes.len() {
                warn!(
                    segment = sequence,
                    kept = valid_len,
                    torn = bytes.len() - valid_len,
                    "truncating torn tail of buffer segment"
                );
                truncate_file(path, valid_len as u64)?;
            }
            let skip = if *sequence == cursor.0 { cursor.1 } else { 0 };
            ensure!(
                skip <= payloads.len() as u64,
                "transport cursor consumed {} frames of segment {} which only holds {}",
                skip,
                sequence,
                payloads.len()
            );
            for payload in payloads.iter().skip(skip as usize) {
                let revision = Revision::decode(payload)?;
                max_version = max_version.max(revision.version);
                log.revisions.push_back(revision);
            }
            if *sequence == cursor.0 {
                log.consumed_in_oldest = skip;
            }
            log.segments.push_back(SegmentMeta {
                sequence: *sequence,
                frames: payloads.len() as u64,
            });
        }

        if log.segments.is_empty() {
            log.segments.push_back(SegmentMeta {
                sequence: 1,
                frames: 0,
            });
            log.consumed_in_oldest = 0;
        }

        let active = *log
            .segments
            .back()
            .unwrap_or_else(|| unreachable!("segment list seeded above"));
        let path = self.segment_path(active.sequence);
        let file = io::open_append(&path)?;
        io::sync_dir(&self.dir)?;
        let size = io::file_size(&path).unwrap_or(0);

        let replayed = log.revisions.len();
        *self.writer.lock() = Some(SegmentWriter {
            file,
            sequence: active.sequence,
            size,
        });
        *self.log.write() = log;
        self.next_version
            .store(max_version + 1, Ordering::Release);
        self.running.store(true, Ordering::Release);
        info!(
            dir = %self.dir.display(),
            segments = files.len().max(1),
            replayed,
            max_version,
            "buffer started"
        );
        Ok(max_version)
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.writer.lock() = None;
        *self.log.write() = BufferLog::default();
        info!(dir = %self.dir.display(), "buffer stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Moves the version clock past everything another store has already
    /// persisted. Called once at engine startup, before any append.
    pub fn align_version_clock(&self, floor: i64) {
        self.next_version.fetch_max(floor + 1, Ordering::AcqRel);
    }

    /// Stamps `write` with the next version, appends it durably, and
    /// returns the revision once it is on disk.
    pub fn append(&self, write: Write) -> Result<Revision> {
        self.check_running()?;
        let mut writer_guard = self.writer.lock();
        let writer = match writer_guard.as_mut() {
            Some(writer) => writer,
            None => bail!("buffer at '{}' has no active segment", self.dir.display()),
        };

        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let revision = Revision::stamp(write, version);
        let mut frame = Vec::new();
        frames::encode_frame(&revision.encode(), &mut frame);

        if writer.size > 0 && writer.size + frame.len() as u64 > MAX_SEGMENT_SIZE {
            let next = writer.sequence + 1;
            let path = self.segment_path(next);
            let file = io::open_append(&path)?;
            io::sync_dir(&self.dir)?;
            *writer = SegmentWriter {
                file,
                sequence: next,
                size: 0,
            };
            self.log.write().segments.push_back(SegmentMeta {
                sequence: next,
                frames: 0,
            });
            debug!(segment = next, "rotated buffer segment");
        }

        writer
            .file
            .write_all(&frame)
            .wrap_err_with(|| format!("failed to append to segment {}", writer.sequence))?;
        writer
            .file
            .sync_data()
            .wrap_err_with(|| format!("failed to sync segment {}", writer.sequence))?;
        writer.size += frame.len() as u64;

        let mut log = self.log.write();
        log.revisions.push_back(revision.clone());
        match log.segments.back_mut() {
            Some(meta) => meta.frames += 1,
            None => bail!("buffer log lost its segment list"),
        }
        drop(log);
        drop(writer_guard);
        Ok(revision)
    }

    /// Revisions waiting to be transported.
    pub fn backlog(&self) -> usize {
        self.log.read().revisions.len()
    }

    /// Hands at most `limit` oldest revisions to `database`, forces a
    /// seal + sync, and truncates the transported prefix. Returns how
    /// many revisions moved. Holds the log latch exclusively for the
    /// whole batch so overlay readers never double-observe.
    pub fn transport(&self, database: &Database, limit: usize) -> Result<usize> {
        self.check_running()?;
        let mut log = self.log.write();
        let count = limit.min(log.revisions.len());
        if count == 0 {
            return Ok(0);
        }

        for revision in log.revisions.iter().take(count) {
            database.accept(revision.clone())?;
        }
        database.trigger_sync()?;

        // The database acknowledged durability; truncate our prefix.
        log.revisions.drain(..count);
        let mut remaining = count as u64;
        let mut deletable = Vec::new();
        while remaining > 0 {
            let meta = match log.segments.front() {
                Some(meta) => *meta,
                None => bail!("transport consumed more frames than the segment list holds"),
            };
            let available = meta.frames - log.consumed_in_oldest;
            if available > remaining || log.segments.len() == 1 {
                ensure!(
                    remaining <= available,
                    "transport consumed into the active segment beyond its frames"
                );
                log.consumed_in_oldest += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                deletable.push(meta.sequence);
                log.segments.pop_front();
                log.consumed_in_oldest = 0;
            }
        }

        let front = match log.segments.front() {
            Some(meta) => *meta,
            None => bail!("buffer log lost its segment list"),
        };
        write_cursor(
            &self.dir.join(CURSOR_FILE),
            front.sequence,
            log.consumed_in_oldest,
        )?;
        for sequence in deletable {
            io::delete_file(&self.segment_path(sequence))?;
        }
        debug!(transported = count, backlog = log.revisions.len(), "transport batch");
        Ok(count)
    }

    /// All values of (key, record): the database's fold with buffered
    /// revisions folded on top in version order.
    ///
    /// The log latch is taken before the database is consulted: transport
    /// holds it exclusively while it moves revisions across, so a read
    /// can never land in the gap where a revision has left the overlay
    /// but its database fold predates the move.
    pub fn select(
        &self,
        key: &str,
        record: i64,
        ts: Option<i64>,
        database: &Database,
    ) -> Result<Vec<Value>> {
        let log = self.log.read();
        let mut values = database.select(key, record, ts)?;
        overlay_values(&log, key, record, ts, &mut values);
        Ok(values)
    }

    /// The keys of `record` holding at least one value under the overlay.
    pub fn describe(
        &self,
        record: i64,
        ts: Option<i64>,
        database: &Database,
    ) -> Result<Vec<String>> {
        let log = self.log.read();
        let mut candidates: Vec<String> = database.describe(record, ts)?;
        for revision in &log.revisions {
            if revision.record == record
                && within(revision, ts)
                && !candidates.contains(&revision.key)
            {
                candidates.push(revision.key.clone());
            }
        }
        let mut present = Vec::with_capacity(candidates.len());
        for key in candidates {
            let mut values = database.select(&key, record, ts)?;
            overlay_values(&log, &key, record, ts, &mut values);
            if !values.is_empty() {
                present.push(key);
            }
        }
        present.sort();
        Ok(present)
    }

    /// The records where `key` satisfies the bound operator, overlaying
    /// buffered revisions per qualifying value.
    pub fn explore(
        &self,
        key: &str,
        matcher: &OperatorMatcher,
        ts: Option<i64>,
        database: &Database,
    ) -> Result<std::collections::BTreeMap<Value, LongBitSet>> {
        let log = self.log.read();
        let mut index = database.explore(key, matcher, ts)?;
        for revision in &log.revisions {
            if revision.key == key && within(revision, ts) && matcher.matches(&revision.value) {
                let records = index.entry(revision.value.clone()).or_default();
                records.set_value(revision.record, revision.action == Action::Add);
            }
        }
        drop(log);
        index.retain(|_, records| !records.is_empty());
        Ok(index)
    }

    /// Union of the explore result across qualifying values.
    pub fn find(
        &self,
        key: &str,
        matcher: &OperatorMatcher,
        ts: Option<i64>,
        database: &Database,
    ) -> Result<LongBitSet> {
        let mut records = LongBitSet::new();
        for qualifying in self.explore(key, matcher, ts, database)?.values() {
            records.union_with(qualifying);
        }
        Ok(records)
    }

    /// Search over the overlay: the database's raw token revisions plus
    /// the buffer's, folded once.
    pub fn search(&self, key: &str, query: &str, database: &Database) -> Result<LongBitSet> {
        let log = self.log.read();
        let mut revisions = database.search_revisions(key)?;
        for revision in &log.revisions {
            if revision.key != key || !revision.value.is_search_indexable() {
                continue;
            }
            if let Some(text) = revision.value.as_text() {
                for token in db::tokenize(text) {
                    let mut indexed = revision.clone();
                    indexed.value = Value::String(token);
                    revisions.push(indexed);
                }
            }
        }
        drop(log);
        Ok(db::search_fold_and_match(revisions, query))
    }

    /// True iff the folded ADD/REMOVE count for the triple is odd under
    /// the overlay.
    pub fn verify(
        &self,
        key: &str,
        value: &Value,
        record: i64,
        ts: Option<i64>,
        database: &Database,
    ) -> Result<bool> {
        let log = self.log.read();
        let mut present = database.verify(key, value, record, ts)?;
        for revision in &log.revisions {
            if revision.key == key
                && revision.record == record
                && &revision.value == value
                && within(revision, ts)
            {
                present = revision.action == Action::Add;
            }
        }
        Ok(present)
    }

    fn segment_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", sequence, SEGMENT_EXTENSION))
    }

    fn check_running(&self) -> Result<()> {
        ensure!(
            self.running.load(Ordering::Acquire),
            "buffer at '{}' is not running",
            self.dir.display()
        );
        Ok(())
    }
}

fn within(revision: &Revision, ts: Option<i64>) -> bool {
    ts.map_or(true, |t| revision.version <= t)
}

/// Folds the log's revisions for (key, record) over a database-supplied
/// value set, in version order.
fn overlay_values(log: &BufferLog, key: &str, record: i64, ts: Option<i64>, values: &mut Vec<Value>) {
    for revision in &log.revisions {
        if revision.key == key && revision.record == record && within(revision, ts) {
            db::fold_value(values, revision.action, &revision.value);
        }
    }
}

fn truncate_file(path: &Path, len: u64) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}' for truncation", path.display()))?;
    file.set_len(len)
        .wrap_err_with(|| format!("failed to truncate '{}'", path.display()))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync '{}' after truncation", path.display()))
}

/// Cursor format: oldest segment sequence (8 bytes BE), frames consumed
/// in it (8 bytes BE), CRC-64 of the first 16 bytes (8 bytes BE). An
/// unreadable cursor degrades to "nothing consumed": replay then hands
/// the database revisions it may already hold, which folds deduplicate.
fn read_cursor(path: &Path) -> (u64, u64) {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return (0, 0),
    };
    if bytes.len() != 24 {
        warn!(path = %path.display(), "transport cursor has wrong size, ignoring");
        return (0, 0);
    }
    let mut checksum = [0u8; 8];
    checksum.copy_from_slice(&bytes[16..24]);
    if frames::checksum(&bytes[..16]) != u64::from_be_bytes(checksum) {
        warn!(path = %path.display(), "transport cursor failed its checksum, ignoring");
        return (0, 0);
    }
    let mut oldest = [0u8; 8];
    oldest.copy_from_slice(&bytes[..8]);
    let mut consumed = [0u8; 8];
    consumed.copy_from_slice(&bytes[8..16]);
    (u64::from_be_bytes(oldest), u64::from_be_bytes(consumed))
}

fn write_cursor(path: &Path, oldest: u64, consumed: u64) -> Result<()> {
    let mut bytes = Vec::with_capacity(24);
    bytes.extend_from_slice(&oldest.to_be_bytes());
    bytes.extend_from_slice(&consumed.to_be_bytes());
    bytes.extend_from_slice(&frames::checksum(&bytes[..16]).to_be_bytes());
    io::replace_durably(path, &bytes)
}
