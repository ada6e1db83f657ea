use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::models::{Counter, UsageRecord};

/// Key to usage-record map produced by one aggregation pass.
///
/// Iteration order is unspecified. Callers that need a stable order use
/// [`UsageTable::sorted`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTable {
    records: HashMap<String, UsageRecord>,
}

impl UsageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &UsageRecord> {
        self.records.values()
    }

    /// Records ordered by key, byte-wise.
    pub fn sorted(&self) -> Vec<&UsageRecord> {
        let mut records: Vec<&UsageRecord> = self.records.values().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    /// Ensures `key` has a record, creating an all-zero one if needed.
    /// Returns `true` when the record was created.
    pub fn touch(&mut self, key: &str) -> bool {
        if self.contains(key) {
            return false;
        }
        self.records.insert(key.to_string(), UsageRecord::new(key));
        true
    }

    /// Adds `amount` to `counter` of the record for `key`, creating the
    /// record first if the key is new. Returns `true` when it was created.
    pub fn merge(&mut self, key: &str, counter: Counter, amount: i64) -> Result<bool> {
        match self.records.get_mut(key) {
            Some(slot) => {
                *slot = slot.clone().merge(counter, amount)?;
                Ok(false)
            }
            None => {
                let record = UsageRecord::new(key).merge(counter, amount)?;
                self.records.insert(key.to_string(), record);
                Ok(true)
            }
        }
    }

    /// Folds `other` into this table with the same additive rule used by the
    /// aggregator, so disjoint shards can be recombined.
    pub fn absorb(&mut self, other: UsageTable) -> Result<()> {
        for (key, record) in other.records {
            match self.records.get_mut(&key) {
                Some(existing) => *existing = existing.clone().combine(&record)?,
                None => {
                    self.records.insert(key, record);
                }
            }
        }
        Ok(())
    }

    /// Removes every record whose counters are all zero and returns how many
    /// were removed. Pruning a pruned table removes nothing.
    pub fn prune(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_zero_usage());
        let removed = before - self.records.len();
        debug!(removed, kept = self.records.len(), "pruned zero-usage records");
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }
}

#[cfg(test)]
impl UsageTable {
    pub fn get(&self, key: &str) -> Option<&UsageRecord> {
        self.records.get(key)
    }
}

impl FromIterator<UsageRecord> for UsageTable {
    fn from_iter<T: IntoIterator<Item = UsageRecord>>(iter: T) -> Self {
        Self {
            records: iter
                .into_iter()
                .map(|record| (record.key().clone(), record))
                .collect(),
        }
    }
}
