//! # StrataDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping interdependent
//! values together and documenting their relationships. Constants that depend
//! on each other are co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! SEGMENT_FRAME_HEADER_SIZE (12 bytes)
//!       │
//!       └─> Every buffer segment frame = header + encoded revision.
//!           The replay path reads exactly this many bytes before it can
//!           trust the frame length, so the value is fixed by the on-disk
//!           format and must never change for existing data.
//!
//! MAX_SEGMENT_SIZE (8 MiB)
//!       │
//!       └─> Buffer appends rotate to a fresh segment file past this size.
//!           Transport truncation deletes whole segments, so smaller
//!           segments reclaim disk sooner at the cost of more files.
//!
//! BLOCK_SEAL_THRESHOLD (8192 revisions)
//!       │
//!       └─> A family's current block seals when it holds this many
//!           revisions. Larger blocks amortize the per-block index and
//!           bloom filter; smaller blocks bound the memory held by the
//!           mutable block.
//!
//! TRANSPORT_BATCH_SIZE (512)
//!       │
//!       └─> Must stay well below BLOCK_SEAL_THRESHOLD. Each transport
//!           batch force-seals the current blocks after the database
//!           acknowledges, so a batch larger than the threshold would
//!           never exercise the threshold path at all.
//!
//! BLOOM_BITS_PER_KEY (10) / BLOOM_HASH_COUNT (7)
//!       │
//!       └─> k = 7 is the optimum hash count for 10 bits/key (~1% false
//!           positives). Changing one without the other degrades both
//!           memory and accuracy.
//!
//! RECORD_CACHE_CAPACITY (1024)
//!       │
//!       └─> Upper bound on cached folded record views per cache. The
//!           append-in-place coherence protocol touches every cached
//!           entry that matches an accepted write, so an unbounded cache
//!           would make accept cost grow with read history.
//! ```

/// Bytes in a buffer segment frame header: u32 payload length + u64 CRC-64.
pub const SEGMENT_FRAME_HEADER_SIZE: usize = 12;

/// Buffer segment files rotate once they grow past this many bytes.
pub const MAX_SEGMENT_SIZE: u64 = 8 * 1024 * 1024;

/// Revision count at which a family's current block is sealed to disk.
pub const BLOCK_SEAL_THRESHOLD: usize = 8192;

/// Upper bound on revisions handed to the database per transport pass.
pub const TRANSPORT_BATCH_SIZE: usize = 512;

/// Transporter wakes at least this often even without an append signal.
pub const TRANSPORT_IDLE_WAIT_MS: u64 = 100;

/// Bloom filter sizing: bits per indexed key.
pub const BLOOM_BITS_PER_KEY: usize = 10;

/// Bloom filter hash count, matched to `BLOOM_BITS_PER_KEY`.
pub const BLOOM_HASH_COUNT: usize = 7;

/// Maximum folded record views retained per record cache.
pub const RECORD_CACHE_CAPACITY: usize = 1024;

/// Attempts for transient filesystem operations (directory deletes that
/// race with concurrent file creation).
pub const TRANSIENT_IO_RETRIES: usize = 5;

/// Backoff between transient filesystem retries, in milliseconds.
pub const TRANSIENT_IO_BACKOFF_MS: u64 = 10;

const _: () = assert!(TRANSPORT_BATCH_SIZE <= BLOCK_SEAL_THRESHOLD);
const _: () = assert!(BLOOM_HASH_COUNT >= 1);
const _: () = assert!(SEGMENT_FRAME_HEADER_SIZE == 4 + 8);
