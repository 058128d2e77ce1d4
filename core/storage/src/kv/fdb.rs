//! FoundationDB medium for the key-value backend.

use std::sync::OnceLock;

use async_trait::async_trait;
use foundationdb::api::FdbApiBuilder;
use foundationdb::options::MutationType;
use foundationdb::{Database, FdbError, RangeOption, Transaction};
use futures::TryStreamExt;
use tracing::info;

use super::{KeyValue, KvStore, KvTransaction};
use crate::config::KvConfig;
use raidstore_common::{Error, Result};

static NETWORK: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Select the API version and start the client network thread.
///
/// Runs once per process; later calls return the first outcome.
fn boot_network(api_version: i32) -> Result<()> {
    let outcome = NETWORK.get_or_init(|| {
        let builder = FdbApiBuilder::default()
            .set_runtime_version(api_version)
            .build()
            .map_err(|e| e.to_string())?;
        // SAFETY: called at most once per process, and the network is never stopped.
        let network = unsafe { builder.boot() }.map_err(|e| e.to_string())?;
        std::mem::forget(network);
        Ok(())
    });
    outcome
        .clone()
        .map_err(|e| Error::Storage(format!("FoundationDB network failed to start: {}", e)))
}

fn map_fdb_error(err: FdbError) -> Error {
    if err.is_retryable() {
        Error::Conflict(format!("FoundationDB error {}: {}", err.code(), err))
    } else {
        Error::Storage(format!("FoundationDB error {}: {}", err.code(), err))
    }
}

/// FoundationDB-backed store.
pub struct FdbKvStore {
    db: Database,
}

impl FdbKvStore {
    /// Connect using the configured cluster file.
    ///
    /// # Errors
    /// - Client library cannot start
    /// - Cluster file is missing or unreadable
    pub fn connect(config: &KvConfig) -> Result<Self> {
        boot_network(config.api_version)?;
        let db = Database::new(config.cluster_file.as_deref()).map_err(map_fdb_error)?;
        info!(
            cluster_file = config.cluster_file.as_deref().unwrap_or("<default>"),
            api_version = config.api_version,
            "Connected to FoundationDB"
        );
        Ok(Self { db })
    }
}

#[async_trait]
impl KvStore for FdbKvStore {
    fn name(&self) -> &str {
        "fdb"
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        let trx = self.db.create_trx().map_err(map_fdb_error)?;
        Ok(Box::new(FdbTransaction { trx }))
    }
}

struct FdbTransaction {
    trx: Transaction,
}

#[async_trait]
impl KvTransaction for FdbTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = self.trx.get(key, false).await.map_err(map_fdb_error)?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn get_range(&mut self, begin: &[u8], end: &[u8]) -> Result<Vec<KeyValue>> {
        let range = RangeOption::from((begin.to_vec(), end.to_vec()));
        self.trx
            .get_ranges_keyvalues(range, false)
            .map_ok(|kv| (kv.key().to_vec(), kv.value().to_vec()))
            .try_collect()
            .await
            .map_err(map_fdb_error)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.trx.set(key, value);
    }

    fn clear(&mut self, key: &[u8]) {
        self.trx.clear(key);
    }

    fn atomic_add(&mut self, key: &[u8], delta: i64) {
        self.trx
            .atomic_op(key, &delta.to_le_bytes(), MutationType::Add);
    }

    fn atomic_max(&mut self, key: &[u8], value: i64) {
        self.trx
            .atomic_op(key, &value.to_le_bytes(), MutationType::Max);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.trx
            .commit()
            .await
            .map(|_| ())
            .map_err(|e| map_fdb_error(FdbError::from(e)))
    }
}
