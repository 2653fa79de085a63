//! # Immutable Database Blocks
//!
//! A block is a sorted, immutable on-disk run of revisions belonging to
//! one family, written once when the family's mutable block seals and
//! never modified afterwards. Each block is two files named by its id:
//!
//! ```text
//! <family dir>/<id>.blk     framed revisions in family sort order
//! <family dir>/<id>.idx     index sidecar: header + bloom + group ranges
//! ```
//!
//! ## Families
//!
//! The same revisions land in three families, each sorted for a
//! different read path:
//!
//! | Family    | Dir | Sort order                     | Group key    |
//! |-----------|-----|--------------------------------|--------------|
//! | Primary   | cpb | (record, key, version)         | record       |
//! | Secondary | csb | (key, value, version)          | key          |
//! | Search    | ctb | (key, token, record, version)  | key          |
//!
//! A group is the contiguous byte range holding one group key's
//! revisions; the sidecar records each group's offset and length so a
//! read touches only the relevant slice of the map. The bloom filter is
//! over finer membership keys — (record, key), (key, value), (key,
//! token) — and lets reads skip blocks wholesale.
//!
//! ## Seal Protocol
//!
//! 1. sort the revisions by the family's order
//! 2. write `<id>.blk` durably (frames, file sync, directory sync)
//! 3. write `<id>.idx` durably
//!
//! A crash between steps leaves a block id present in some families but
//! not others; startup detects the imbalance and discards the id
//! everywhere, which is why the sidecar is written last and per family.
//!
//! ## Reading
//!
//! Sealed blocks are read through a shared `Mmap` with no locking: the
//! file never changes, so concurrent readers need no coordination. The
//! map is dropped (unmapped) when the block is discarded or the database
//! stops.

use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use memmap2::Mmap;
use tracing::debug;
use zerocopy::big_endian::{I64, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::bloom::BloomFilter;
use crate::io::{self, frames};
use crate::types::{Revision, Value};

pub const BLOCK_EXTENSION: &str = "blk";
pub const INDEX_EXTENSION: &str = "idx";

const INDEX_MAGIC: u64 = 0x5354_5241_3149_4458; // "STRA1IDX"

/// The three parallel index families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FamilyKind {
    Primary,
    Secondary,
    Search,
}

impl FamilyKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            FamilyKind::Primary => "cpb",
            FamilyKind::Secondary => "csb",
            FamilyKind::Search => "ctb",
        }
    }

    /// Sorts `revisions` into this family's on-disk order.
    pub fn sort(&self, revisions: &mut [Revision]) {
        match self {
            FamilyKind::Primary => revisions.sort_by(|a, b| {
                a.record
                    .cmp(&b.record)
                    .then_with(|| a.key.cmp(&b.key))
                    .then_with(|| a.version.cmp(&b.version))
            }),
            FamilyKind::Secondary => revisions.sort_by(|a, b| {
                a.key
                    .cmp(&b.key)
                    .then_with(|| a.value.cmp(&b.value))
                    .then_with(|| a.version.cmp(&b.version))
            }),
            FamilyKind::Search => revisions.sort_by(|a, b| {
                a.key
                    .cmp(&b.key)
                    .then_with(|| a.value.cmp(&b.value))
                    .then_with(|| a.record.cmp(&b.record))
                    .then_with(|| a.version.cmp(&b.version))
            }),
        }
    }

    /// The coarse grouping a read path looks up by.
    pub fn group_key(&self, revision: &Revision) -> Vec<u8> {
        match self {
            FamilyKind::Primary => revision.record.to_be_bytes().to_vec(),
            FamilyKind::Secondary | FamilyKind::Search => revision.key.as_bytes().to_vec(),
        }
    }

    /// The fine-grained membership key the bloom filter indexes.
    pub fn membership_key(&self, revision: &Revision) -> Vec<u8> {
        match self {
            FamilyKind::Primary => primary_membership(revision.record, &revision.key),
            FamilyKind::Secondary | FamilyKind::Search => {
                keyed_membership(&revision.key, &revision.value)
            }
        }
    }
}

pub fn primary_group(record: i64) -> Vec<u8> {
    record.to_be_bytes().to_vec()
}

pub fn keyed_group(key: &str) -> Vec<u8> {
    key.as_bytes().to_vec()
}

pub fn primary_membership(record: i64, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&record.to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

pub fn keyed_membership(key: &str, value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 10);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.extend_from_slice(&value.encode());
    out
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct IndexHeader {
    magic: U64,
    block_id: U64,
    revision_count: U64,
    min_version: I64,
    max_version: I64,
    bloom_words: U64,
    group_count: U64,
    payload_checksum: U64,
}

const INDEX_HEADER_SIZE: usize = std::mem::size_of::<IndexHeader>();

/// A sealed, immutable block: the mapped revision run plus its in-memory
/// index and bloom filter.
pub struct Block {
    id: u64,
    kind: FamilyKind,
    path: PathBuf,
    /// None for an empty block; zero-length files cannot be mapped.
    mmap: Option<Mmap>,
    groups: HashMap<Vec<u8>, (u64, u64)>,
    bloom: BloomFilter,
    revision_count: u64,
    min_version: i64,
    max_version: i64,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("revisions", &self.revision_count)
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl Block {
    /// Seals `revisions` into block `id` under `dir`. The slice is sorted
    /// into family order in place.
    pub fn seal(kind: FamilyKind, id: u64, dir: &Path, mut revisions: Vec<Revision>) -> Result<Self> {
        kind.sort(&mut revisions);

        let mut bloom = BloomFilter::with_capacity(revisions.len());
        let mut data = Vec::new();
        let mut groups: Vec<(Vec<u8>, u64, u64)> = Vec::new();
        let mut min_version = i64::MAX;
        let mut max_version = i64::MIN;

        for revision in &revisions {
            let group = kind.group_key(revision);
            let offset = data.len() as u64;
            frames::encode_frame(&revision.encode(), &mut data);
            let length = data.len() as u64 - offset;
            match groups.last_mut() {
                Some((last, _, len)) if *last == group => *len += length,
                _ => groups.push((group, offset, length)),
            }
            bloom.insert(&kind.membership_key(revision));
            min_version = min_version.min(revision.version);
            max_version = max_version.max(revision.version);
        }
        if revisions.is_empty() {
            min_version = 0;
            max_version = 0;
        }

        let block_path = dir.join(format!("{}.{}", id, BLOCK_EXTENSION));
        let index_path = dir.join(format!("{}.{}", id, INDEX_EXTENSION));
        io::write_durably(&block_path, &data)?;
        io::write_durably(&index_path, &encode_index(id, &revisions, min_version, max_version, &bloom, &groups))?;

        debug!(
            family = kind.dir_name(),
            block = id,
            revisions = revisions.len(),
            bytes = data.len(),
            "sealed block"
        );

        let mmap = if data.is_empty() {
            None
        } else {
            Some(io::map_read(&block_path)?)
        };
        Ok(Self {
            id,
            kind,
            path: block_path,
            mmap,
            groups: groups.into_iter().map(|(k, o, l)| (k, (o, l))).collect(),
            bloom,
            revision_count: revisions.len() as u64,
            min_version,
            max_version,
        })
    }

    /// Opens a previously sealed block, rebuilding the sidecar from the
    /// block file when it is missing or fails validation.
    pub fn open(kind: FamilyKind, id: u64, dir: &Path) -> Result<Self> {
        let block_path = dir.join(format!("{}.{}", id, BLOCK_EXTENSION));
        let index_path = dir.join(format!("{}.{}", id, INDEX_EXTENSION));
        let mmap = if io::file_size(&block_path)? == 0 {
            None
        } else {
            Some(io::map_read(&block_path)?)
        };

        match load_index(id, &index_path) {
            Ok((groups, bloom, revision_count, min_version, max_version)) => Ok(Self {
                id,
                kind,
                path: block_path,
                mmap,
                groups,
                bloom,
                revision_count,
                min_version,
                max_version,
            }),
            Err(e) => {
                tracing::warn!(
                    family = kind.dir_name(),
                    block = id,
                    error = %e,
                    "index sidecar unusable, rebuilding from block"
                );
                drop(mmap);
                let revisions = read_revisions(&block_path)?;
                Self::seal(kind, id, dir, revisions)
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn revision_count(&self) -> u64 {
        self.revision_count
    }

    pub fn max_version(&self) -> i64 {
        self.max_version
    }

    pub fn min_version(&self) -> i64 {
        self.min_version
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bloom-filter gate for a fine-grained membership probe.
    pub fn maybe_contains(&self, membership_key: &[u8]) -> bool {
        self.bloom.maybe_contains(membership_key)
    }

    /// Decodes every revision in the group, in family sort order. Returns
    /// an empty vec when the block holds nothing for the group.
    pub fn scan_group(&self, group_key: &[u8]) -> Result<Vec<Revision>> {
        let mmap = match (&self.mmap, self.groups.get(group_key)) {
            (Some(mmap), Some(_)) => mmap,
            _ => return Ok(Vec::new()),
        };
        let (offset, length) = self.groups[group_key];
        let start = offset as usize;
        let end = start + length as usize;
        ensure!(
            end <= mmap.len(),
            "group range {}..{} exceeds block {} size {}",
            start,
            end,
            self.id,
            mmap.len()
        );
        decode_revisions(&mmap[start..end])
    }

    /// Decodes the whole block in family sort order.
    pub fn scan_all(&self) -> Result<Vec<Revision>> {
        match &self.mmap {
            Some(mmap) => decode_revisions(mmap),
            None => Ok(Vec::new()),
        }
    }
}

fn decode_revisions(bytes: &[u8]) -> Result<Vec<Revision>> {
    frames::decode_all(bytes, true)?
        .into_iter()
        .map(Revision::decode)
        .collect()
}

fn read_revisions(path: &Path) -> Result<Vec<Revision>> {
    if io::file_size(path)? == 0 {
        return Ok(Vec::new());
    }
    let mmap = io::map_read(path)?;
    decode_revisions(&mmap)
}

fn encode_index(
    id: u64,
    revisions: &[Revision],
    min_version: i64,
    max_version: i64,
    bloom: &BloomFilter,
    groups: &[(Vec<u8>, u64, u64)],
) -> Vec<u8> {
    let mut payload = Vec::new();
    for word in bloom.words() {
        payload.extend_from_slice(&word.to_be_bytes());
    }
    for (group, offset, length) in groups {
        payload.extend_from_slice(&(group.len() as u32).to_be_bytes());
        payload.extend_from_slice(group);
        payload.extend_from_slice(&offset.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
    }

    let header = IndexHeader {
        magic: U64::new(INDEX_MAGIC),
        block_id: U64::new(id),
        revision_count: U64::new(revisions.len() as u64),
        min_version: I64::new(min_version),
        max_version: I64::new(max_version),
        bloom_words: U64::new(bloom.words().len() as u64),
        group_count: U64::new(groups.len() as u64),
        payload_checksum: U64::new(frames::checksum(&payload)),
    };

    let mut out = Vec::with_capacity(INDEX_HEADER_SIZE + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&payload);
    out
}

type LoadedIndex = (HashMap<Vec<u8>, (u64, u64)>, BloomFilter, u64, i64, i64);

fn load_index(id: u64, path: &Path) -> Result<LoadedIndex> {
    let bytes = std::fs::read(path)
        .wrap_err_with(|| format!("failed to read index sidecar '{}'", path.display()))?;
    ensure!(
        bytes.len() >= INDEX_HEADER_SIZE,
        "index sidecar '{}' is shorter than its header",
        path.display()
    );
    let header = IndexHeader::read_from_bytes(&bytes[..INDEX_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("malformed index header in '{}': {:?}", path.display(), e))?;
    ensure!(
        header.magic.get() == INDEX_MAGIC,
        "index sidecar '{}' has wrong magic",
        path.display()
    );
    ensure!(
        header.block_id.get() == id,
        "index sidecar '{}' names block {} but was found under id {}",
        path.display(),
        header.block_id.get(),
        id
    );
    let payload = &bytes[INDEX_HEADER_SIZE..];
    ensure!(
        frames::checksum(payload) == header.payload_checksum.get(),
        "index sidecar '{}' failed its checksum",
        path.display()
    );

    let bloom_bytes = header.bloom_words.get() as usize * 8;
    ensure!(
        payload.len() >= bloom_bytes,
        "index sidecar '{}' truncated inside the bloom filter",
        path.display()
    );
    let words = payload[..bloom_bytes]
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_be_bytes(word)
        })
        .collect();
    let bloom = BloomFilter::from_words(words);

    let mut groups = HashMap::with_capacity(header.group_count.get() as usize);
    let mut rest = &payload[bloom_bytes..];
    for _ in 0..header.group_count.get() {
        ensure!(rest.len() >= 4, "index sidecar '{}' truncated", path.display());
        let group_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        ensure!(
            rest.len() >= group_len + 16,
            "index sidecar '{}' truncated inside a group entry",
            path.display()
        );
        let group = rest[..group_len].to_vec();
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&rest[group_len..group_len + 8]);
        let mut length = [0u8; 8];
        length.copy_from_slice(&rest[group_len + 8..group_len + 16]);
        groups.insert(group, (u64::from_be_bytes(offset), u64::from_be_bytes(length)));
        rest = &rest[group_len + 16..];
    }
    ensure!(
        rest.is_empty(),
        "index sidecar '{}' has {} trailing bytes",
        path.display(),
        rest.len()
    );

    Ok((
        groups,
        bloom,
        header.revision_count.get(),
        header.min_version.get(),
        header.max_version.get(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Write;
    use tempfile::tempdir;

    fn revisions() -> Vec<Revision> {
        vec![
            Revision::stamp(Write::add("name", Value::String("ada".into()), 2), 3),
            Revision::stamp(Write::add("name", Value::String("grace".into()), 1), 1),
            Revision::stamp(Write::add("age", Value::Integer(36), 1), 2),
            Revision::stamp(Write::remove("name", Value::String("grace".into()), 1), 4),
        ]
    }

    #[test]
    fn sealed_primary_block_groups_by_record() {
        let dir = tempdir().unwrap();
        let block = Block::seal(FamilyKind::Primary, 1, dir.path(), revisions()).unwrap();

        let record1 = block.scan_group(&primary_group(1)).unwrap();
        assert_eq!(record1.len(), 3);
        assert!(record1.windows(2).all(|w| (w[0].key.as_str(), w[0].version)
            <= (w[1].key.as_str(), w[1].version)));
        assert_eq!(block.scan_group(&primary_group(2)).unwrap().len(), 1);
        assert!(block.scan_group(&primary_group(99)).unwrap().is_empty());
    }

    #[test]
    fn bloom_filter_gates_membership_probes() {
        let dir = tempdir().unwrap();
        let block = Block::seal(FamilyKind::Primary, 7, dir.path(), revisions()).unwrap();
        assert!(block.maybe_contains(&primary_membership(1, "name")));
        assert!(!block.maybe_contains(&primary_membership(1, "nonexistent_key_xyz")));
    }

    #[test]
    fn reopened_block_serves_the_same_groups() {
        let dir = tempdir().unwrap();
        let sealed = Block::seal(FamilyKind::Secondary, 3, dir.path(), revisions()).unwrap();
        let expected = sealed.scan_group(&keyed_group("name")).unwrap();
        drop(sealed);

        let reopened = Block::open(FamilyKind::Secondary, 3, dir.path()).unwrap();
        assert_eq!(reopened.scan_group(&keyed_group("name")).unwrap(), expected);
        assert_eq!(reopened.revision_count(), 4);
        assert_eq!(reopened.max_version(), 4);
    }

    #[test]
    fn missing_sidecar_is_rebuilt_from_the_block() {
        let dir = tempdir().unwrap();
        let sealed = Block::seal(FamilyKind::Primary, 5, dir.path(), revisions()).unwrap();
        drop(sealed);
        std::fs::remove_file(dir.path().join("5.idx")).unwrap();

        let reopened = Block::open(FamilyKind::Primary, 5, dir.path()).unwrap();
        assert_eq!(reopened.scan_group(&primary_group(1)).unwrap().len(), 3);
        assert!(dir.path().join("5.idx").exists(), "sidecar SHOULD be rewritten");
    }

    #[test]
    fn empty_block_seals_and_reopens() {
        let dir = tempdir().unwrap();
        let block = Block::seal(FamilyKind::Search, 9, dir.path(), Vec::new()).unwrap();
        assert_eq!(block.revision_count(), 0);
        drop(block);
        let reopened = Block::open(FamilyKind::Search, 9, dir.path()).unwrap();
        assert!(reopened.scan_all().unwrap().is_empty());
    }
}
