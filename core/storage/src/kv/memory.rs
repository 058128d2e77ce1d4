//! In-process optimistic-concurrency key-value engine.
//!
//! [`MemoryKvStore`] keeps data in a [`BTreeMap`] behind a
//! [`parking_lot::RwLock`] and gives transactions serializable semantics:
//!
//! - Reads see the latest committed data plus the transaction's own writes
//! - Every key and range a transaction reads is recorded
//! - Commit fails with `Conflict` if any recorded key or range was written by
//!   a transaction that committed after this one began
//!
//! Atomic add and max are applied against the committed value at commit time
//! and, like FoundationDB mutations, do not conflict on their own.
//!
//! Write versions are only needed while some open transaction could still
//! conflict on them. Open transactions register their read version, and the
//! version map is pruned below the oldest one once it has doubled in size.
//!
//! Data is not persisted; everything is lost when the store is dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{KeyValue, KvStore, KvTransaction};
use crate::minting::decode_counter;
use raidstore_common::{Error, Result};

/// Size of the version map below which it is never pruned.
const COMPACTION_FLOOR: usize = 1024;

#[derive(Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Commit version that last wrote each key, clears included.
    modified: BTreeMap<Vec<u8>, u64>,
    version: u64,
    /// Read versions of open transactions, with a count per version.
    active: BTreeMap<u64, usize>,
    /// `modified` length that triggers the next prune.
    compact_at: usize,
}

impl Inner {
    fn register(&mut self) -> u64 {
        *self.active.entry(self.version).or_insert(0) += 1;
        self.version
    }

    fn release(&mut self, read_version: u64) {
        if let Some(count) = self.active.get_mut(&read_version) {
            *count -= 1;
            if *count == 0 {
                self.active.remove(&read_version);
            }
        }
    }

    /// Drop write versions no open or future transaction can conflict on.
    fn compact(&mut self) {
        if self.modified.len() < self.compact_at.max(COMPACTION_FLOOR) {
            return;
        }
        let horizon = self
            .active
            .keys()
            .next()
            .copied()
            .unwrap_or(self.version);
        self.modified.retain(|_, v| *v > horizon);
        self.compact_at = self.modified.len() * 2;
    }
}

/// In-memory transactional store.
///
/// Cheaply cloneable; all clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn tracked_writes(&self) -> usize {
        self.inner.read().modified.len()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        let read_version = self.inner.write().register();
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            read_version,
            read_keys: BTreeSet::new(),
            read_ranges: Vec::new(),
            ops: Vec::new(),
        }))
    }
}

#[derive(Debug, Clone)]
enum Op {
    Set(Vec<u8>),
    Clear,
    Add(i64),
    Max(i64),
}

impl Op {
    /// Apply to a value as it stands.
    fn apply(&self, current: Option<Vec<u8>>) -> Option<Vec<u8>> {
        match self {
            Op::Set(v) => Some(v.clone()),
            Op::Clear => None,
            Op::Add(delta) => {
                let value = current.as_deref().map(decode_counter).unwrap_or(0);
                Some(value.wrapping_add(*delta).to_le_bytes().to_vec())
            }
            Op::Max(other) => {
                let value = current.as_deref().map(decode_counter).unwrap_or(0);
                Some(value.max(*other).to_le_bytes().to_vec())
            }
        }
    }
}

struct MemoryTransaction {
    inner: Arc<RwLock<Inner>>,
    read_version: u64,
    read_keys: BTreeSet<Vec<u8>>,
    read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    ops: Vec<(Vec<u8>, Op)>,
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.inner.write().release(self.read_version);
    }
}

impl MemoryTransaction {
    /// Overlay this transaction's pending ops for `key` on `committed`.
    fn overlay(&self, key: &[u8], committed: Option<Vec<u8>>) -> Option<Vec<u8>> {
        self.ops
            .iter()
            .filter(|(k, _)| k.as_slice() == key)
            .fold(committed, |value, (_, op)| op.apply(value))
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let committed = self.inner.read().data.get(key).cloned();
        self.read_keys.insert(key.to_vec());
        Ok(self.overlay(key, committed))
    }

    async fn get_range(&mut self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>> {
        if begin >= end {
            return Ok(Vec::new());
        }

        let mut view: BTreeMap<Vec<u8>, Vec<u8>> = {
            let inner = self.inner.read();
            inner
                .data
                .range::<[u8], _>((
                    std::ops::Bound::Included(begin),
                    std::ops::Bound::Excluded(end),
                ))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        self.read_ranges.push((begin.to_vec(), end.to_vec()));

        for (key, op) in &self.ops {
            if key.as_slice() >= begin && key.as_slice() < end {
                if let Some(value) = op.apply(view.remove(key)) {
                    view.insert(key.clone(), value);
                }
            }
        }

        Ok(view.into_iter().collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push((key.to_vec(), Op::Set(value.to_vec())));
    }

    fn clear(&mut self, key: &[u8]) {
        self.ops.push((key.to_vec(), Op::Clear));
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.ops.push((key.to_vec(), Op::Add(delta)));
    }

    fn atomic_max(&mut self, key: &[u8], value: i64) {
        self.ops.push((key.to_vec(), Op::Max(value)));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.inner.write();

        let changed = |version: Option<&u64>| version.is_some_and(|v| *v > self.read_version);

        for key in &self.read_keys {
            if changed(inner.modified.get(key)) {
                return Err(Error::Conflict(
                    "a key read by this transaction was modified".to_string(),
                ));
            }
        }
        for (begin, end) in &self.read_ranges {
            let touched = inner
                .modified
                .range::<[u8], _>((
                    std::ops::Bound::Included(begin.as_slice()),
                    std::ops::Bound::Excluded(end.as_slice()),
                ))
                .any(|(_, v)| *v > self.read_version);
            if touched {
                return Err(Error::Conflict(
                    "a range read by this transaction was modified".to_string(),
                ));
            }
        }

        if self.ops.is_empty() {
            return Ok(());
        }

        inner.version += 1;
        let version = inner.version;
        for (key, op) in &self.ops {
            let current = inner.data.remove(key);
            if let Some(value) = op.apply(current) {
                inner.data.insert(key.clone(), value);
            }
            inner.modified.insert(key.clone(), version);
        }
        inner.compact();

        Ok(())
    }
}
