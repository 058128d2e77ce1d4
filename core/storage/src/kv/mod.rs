//! Transactional ordered key-value backend.
//!
//! The repository logic in [`repository`] is written once against the
//! [`KvStore`] / [`KvTransaction`] abstraction. Two media implement it:
//! an in-process optimistic engine ([`MemoryKvStore`]) and FoundationDB
//! (`fdb` feature).

pub mod keys;
pub mod memory;
pub mod repository;

#[cfg(feature = "fdb")]
pub mod fdb;

use async_trait::async_trait;

use raidstore_common::Result;

pub use memory::MemoryKvStore;
pub use repository::KvRepository;

#[cfg(feature = "fdb")]
pub use fdb::FdbKvStore;

/// A key-value pair returned by a range read.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Serializable transactional ordered key-value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Medium name, for logging.
    fn name(&self) -> &str;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn KvTransaction>>;
}

/// One serializable transaction.
///
/// Reads observe the transaction's own pending writes. Writes are buffered
/// until [`commit`](KvTransaction::commit); dropping the transaction
/// discards them.
#[async_trait]
pub trait KvTransaction: Send {
    /// Read one key.
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read `[begin, end)` in key order.
    async fn get_range(&mut self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    /// Add `delta` to a little-endian integer. A missing key counts as 0.
    /// Does not add a read conflict.
    fn atomic_add(&mut self, key: &[u8], delta: i64);

    /// Store the larger of the current little-endian integer and `value`.
    fn atomic_max(&mut self, key: &[u8], value: i64);

    /// Commit buffered writes.
    ///
    /// # Errors
    /// - `Conflict` if anything this transaction read was changed by a
    ///   transaction that committed after this one began
    async fn commit(self: Box<Self>) -> Result<()>;
}
