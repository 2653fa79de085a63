//! # Token Locks
//!
//! Fine-grained locks over the logical regions a write can touch: a
//! (key, record) field, a whole key (range reads), and a whole record
//! (describe). A write holds all three of its tokens exclusively while
//! it lands; an atomic operation holds its read tokens shared and its
//! write tokens exclusively for the span of its commit.
//!
//! ## Deadlock Avoidance
//!
//! Requests are canonicalized (sorted by the token order, strongest
//! intent kept per token) and granted all-or-nothing: the broker either
//! marks every requested token in one critical section or marks none
//! and waits on a condition variable for the next release. No grant
//! ever holds one token while blocking on another, so lock-order cycles
//! cannot form — a read-intent that needs promotion simply re-requests
//! the full set. The wait is a real block, never a spin.

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

/// A logical region of the store. The derived order is the canonical
/// acquisition order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Token {
    /// Any write to this key, on any record. Watched by range reads.
    Key(String),
    /// Any write to this record, under any key. Watched by describe.
    Record(i64),
    /// A single (key, record) field. Watched by select and verify.
    Field(String, i64),
}

impl Token {
    /// The tokens a write against (key, record) touches.
    pub fn for_write(key: &str, record: i64) -> [Token; 3] {
        [
            Token::Key(key.to_string()),
            Token::Record(record),
            Token::Field(key.to_string(), record),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockEntry {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
pub struct LockBroker {
    table: Mutex<HashMap<Token, LockEntry>>,
    released: Condvar,
}

impl LockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every requested token can be granted at once, then
    /// returns an RAII grant releasing them on drop.
    pub fn acquire(&self, requests: Vec<(Token, Intent)>) -> LockGrant<'_> {
        let requests = canonicalize(requests);
        let mut table = self.table.lock();
        loop {
            let compatible = requests.iter().all(|(token, intent)| {
                match table.get(token) {
                    None => true,
                    Some(entry) => match intent {
                        Intent::Shared => !entry.writer,
                        Intent::Exclusive => !entry.writer && entry.readers == 0,
                    },
                }
            });
            if compatible {
                for (token, intent) in &requests {
                    let entry = table.entry(token.clone()).or_default();
                    match intent {
                        Intent::Shared => entry.readers += 1,
                        Intent::Exclusive => entry.writer = true,
                    }
                }
                return LockGrant {
                    broker: self,
                    requests,
                };
            }
            self.released.wait(&mut table);
        }
    }

    fn release(&self, requests: &[(Token, Intent)]) {
        let mut table = self.table.lock();
        for (token, intent) in requests {
            let mut vacant = false;
            if let Some(entry) = table.get_mut(token) {
                match intent {
                    Intent::Shared => entry.readers = entry.readers.saturating_sub(1),
                    Intent::Exclusive => entry.writer = false,
                }
                vacant = entry.readers == 0 && !entry.writer;
            }
            if vacant {
                table.remove(token);
            }
        }
        drop(table);
        self.released.notify_all();
    }
}

/// Sorts requests into the canonical token order and keeps the strongest
/// intent per token, so a set that reads and writes the same key cannot
/// conflict with itself.
fn canonicalize(mut requests: Vec<(Token, Intent)>) -> Vec<(Token, Intent)> {
    requests.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| (a.1 == Intent::Shared).cmp(&(b.1 == Intent::Shared)))
    });
    requests.dedup_by(|next, kept| next.0 == kept.0);
    requests
}

pub struct LockGrant<'a> {
    broker: &'a LockBroker,
    requests: Vec<(Token, Intent)>,
}

impl Drop for LockGrant<'_> {
    fn drop(&mut self) {
        self.broker.release(&self.requests);
    }
}
