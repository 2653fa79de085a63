//! # The Store Read Contract
//!
//! Every layer that can answer reads on its own — the database directly,
//! or the engine through its buffer-over-database overlay — implements
//! [`Store`]. Atomic operations expose the same read surface but take
//! `&mut self` (reads register version watches), so they sit outside the
//! trait on purpose.
//!
//! A `ts` of `None` reads the present; `Some(version)` reads the store as
//! of that version, inclusive.

use eyre::Result;

use crate::bitset::LongBitSet;
use crate::types::{Operator, Value};

pub trait Store {
    /// All values of (key, record), folded in version order.
    fn select(&self, key: &str, record: i64, ts: Option<i64>) -> Result<Vec<Value>>;

    /// The keys of `record` holding at least one value.
    fn describe(&self, record: i64, ts: Option<i64>) -> Result<Vec<String>>;

    /// The records where `key` satisfies `operator` against `values`.
    fn find(
        &self,
        key: &str,
        operator: Operator,
        values: &[Value],
        ts: Option<i64>,
    ) -> Result<LongBitSet>;

    /// The records whose STRING values of `key` contain every token of
    /// `query`.
    fn search(&self, key: &str, query: &str) -> Result<LongBitSet>;

    /// True iff (key, value, record) is present.
    fn verify(&self, key: &str, value: &Value, record: i64, ts: Option<i64>) -> Result<bool>;
}
