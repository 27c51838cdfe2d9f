//! Per-file vector clocks.
//!
//! A clock `D` is a descendant of `P` when every counter in the union of
//! their key sets satisfies `D[k] >= P[k]`, with missing keys reading as
//! zero. Descendant-and-not-equal means `D` supersedes `P`; neither being a
//! descendant of the other means the versions conflict.
//!
//! Counters are `u64` and saturate; zero-valued keys are never stored, so
//! map equality is well-defined and the JSON form omits them naturally.

use std::collections::BTreeMap;

/// A mapping from peer identifier to change counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VClock {
    clk: BTreeMap<String, u64>,
}

impl VClock {
    /// The empty clock (ancestor of every clock).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from raw counters. Zero-valued entries are dropped.
    pub fn from_map(values: BTreeMap<String, u64>) -> Self {
        Self { clk: values.into_iter().filter(|(_, v)| *v != 0).collect() }
    }

    /// Counter for `key`; absent keys read as zero.
    pub fn get(&self, key: &str) -> u64 {
        self.clk.get(key).copied().unwrap_or(0)
    }

    /// All stored counters.
    pub fn values(&self) -> &BTreeMap<String, u64> {
        &self.clk
    }

    /// Add one to the counter for `key`.
    pub fn increment(&mut self, key: &str) {
        self.increment_by(key, 1);
    }

    /// Add `n` to the counter for `key`, saturating at `u64::MAX`.
    pub fn increment_by(&mut self, key: &str, n: u64) {
        if n == 0 {
            return;
        }
        let counter = self.clk.entry(key.to_string()).or_insert(0);
        *counter = counter.saturating_add(n);
    }

    /// True when `self` descends from `other`: every counter in the union of
    /// key sets is at least as large in `self`.
    ///
    /// Reflexive: every clock descends from itself. Two clocks that descend
    /// from each other are equal.
    pub fn is_descendant(&self, other: &Self) -> bool {
        // Keys absent from `self` read as zero, so any positive counter in
        // `other` that self lacks already decides the answer.
        other.clk.iter().all(|(key, parent)| self.get(key) >= *parent)
    }

    /// True when `other` descends from `self`.
    pub fn is_ancestor(&self, other: &Self) -> bool {
        other.is_descendant(self)
    }

    /// Serialize for the database column.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.clk).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse a database column; the schema default empty string means the
    /// empty clock.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        if json.is_empty() {
            return Ok(Self::new());
        }
        let values: BTreeMap<String, u64> = serde_json::from_str(json)?;
        Ok(Self::from_map(values))
    }
}
