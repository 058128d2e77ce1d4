//! Repository over a transactional key-value store.
//!
//! Key layout (tuple-encoded):
//!
//! | Key                                   | Value                 |
//! |---------------------------------------|-----------------------|
//! | `("rec", ns, id, "current")`          | current version JSON  |
//! | `("rec", ns, id, "version", n)`       | version `n` JSON      |
//! | `("sp", id)`                          | issuing point JSON    |
//! | `("ctr", "record", ns)`               | LE i64 suffix counter |
//! | `("ctr", "issuing_point_id")`         | LE i64 id counter     |
//!
//! Each mutation runs as one transaction and is re-run on commit conflict.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::keys::{pack, prefix_range, unpack, Element};
use super::{KvStore, KvTransaction};
use crate::minting::{self, decode_counter, Minter};
use crate::repository::Repository;
use crate::retry::{ConflictRetry, RetryConfig};
use raidstore_common::{
    Error, IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, Result,
    ISSUING_POINT_ID_FLOOR,
};

const RECORDS: &str = "rec";
const CURRENT: &str = "current";
const VERSION: &str = "version";
const ISSUING_POINTS: &str = "sp";
const COUNTERS: &str = "ctr";
const HEALTH: &str = "health";

fn current_key(namespace: &str, local_id: &str) -> Vec<u8> {
    pack(&[RECORDS.into(), namespace.into(), local_id.into(), CURRENT.into()])
}

fn version_key(namespace: &str, local_id: &str, version: u32) -> Vec<u8> {
    pack(&[
        RECORDS.into(),
        namespace.into(),
        local_id.into(),
        VERSION.into(),
        version.into(),
    ])
}

fn versions_range(namespace: &str, local_id: &str) -> (Vec<u8>, Vec<u8>) {
    prefix_range(&[
        RECORDS.into(),
        namespace.into(),
        local_id.into(),
        VERSION.into(),
    ])
}

fn issuing_point_key(id: i64) -> Vec<u8> {
    pack(&[ISSUING_POINTS.into(), id.into()])
}

fn record_counter_key(namespace: &str) -> Vec<u8> {
    pack(&[COUNTERS.into(), "record".into(), namespace.into()])
}

fn issuing_point_counter_key() -> Vec<u8> {
    pack(&[COUNTERS.into(), "issuing_point_id".into()])
}

/// Whether a key under `("rec", ...)` is a current-version key.
fn is_current_key(key: &[u8]) -> bool {
    unpack(key)
        .map(|elements| elements.len() == 4 && elements[3] == Element::from(CURRENT))
        .unwrap_or(false)
}

fn decode_record(bytes: &[u8]) -> Result<IdentifierRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

fn record_not_found(namespace: &str, local_id: &str) -> Error {
    Error::NotFound(format!("Record {}/{}", namespace, local_id))
}

/// Repository over any [`KvStore`].
pub struct KvRepository {
    store: Arc<dyn KvStore>,
    retry: ConflictRetry,
}

impl KvRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_retry(store, RetryConfig::default())
    }

    pub fn with_retry(store: Arc<dyn KvStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry: ConflictRetry::new(retry),
        }
    }

    async fn begin(&self) -> Result<Box<dyn KvTransaction>> {
        self.store.begin().await
    }

    async fn try_create(&self, key: &RecordKey, payload: &Value) -> Result<IdentifierRecord> {
        let mut tx = self.begin().await?;

        let current = current_key(&key.namespace, &key.local_id);
        if tx.get(&current).await?.is_some() {
            return Err(Error::AlreadyExists(format!("Record {}", key)));
        }

        let record = IdentifierRecord::first_version(key.clone(), payload.clone(), Utc::now());
        let bytes = serde_json::to_vec(&record)?;
        tx.set(&current, &bytes);
        tx.set(&version_key(&key.namespace, &key.local_id, 1), &bytes);
        tx.commit().await?;
        Ok(record)
    }

    async fn try_update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: &Value,
    ) -> Result<IdentifierRecord> {
        let mut tx = self.begin().await?;

        let key = current_key(namespace, local_id);
        let current = match tx.get(&key).await? {
            Some(bytes) => decode_record(&bytes)?,
            None => return Err(record_not_found(namespace, local_id)),
        };
        if current.is_deleted {
            return Err(record_not_found(namespace, local_id));
        }

        let mut superseded = current.clone();
        superseded.is_current = false;
        tx.set(
            &version_key(namespace, local_id, current.version),
            &serde_json::to_vec(&superseded)?,
        );

        let next = current.next_version(payload.clone(), Utc::now());
        let bytes = serde_json::to_vec(&next)?;
        tx.set(&key, &bytes);
        tx.set(&version_key(namespace, local_id, next.version), &bytes);
        tx.commit().await?;
        Ok(next)
    }

    async fn try_soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        let mut tx = self.begin().await?;

        let key = current_key(namespace, local_id);
        let mut current = match tx.get(&key).await? {
            Some(bytes) => decode_record(&bytes)?,
            None => return Err(record_not_found(namespace, local_id)),
        };
        if current.is_deleted {
            return Err(record_not_found(namespace, local_id));
        }

        current.is_deleted = true;
        let bytes = serde_json::to_vec(&current)?;
        tx.set(&key, &bytes);
        tx.set(&version_key(namespace, local_id, current.version), &bytes);
        tx.commit().await
    }

    /// Current, non-deleted records in key order.
    async fn scan_current(&self) -> Result<Vec<IdentifierRecord>> {
        let mut tx = self.begin().await?;
        let (begin, end) = prefix_range(&[RECORDS.into()]);

        let mut records = Vec::new();
        for (key, value) in tx.get_range(&begin, &end).await? {
            if !is_current_key(&key) {
                continue;
            }
            let record = decode_record(&value)?;
            if !record.is_deleted {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn try_next_local_id(&self, namespace: &str) -> Result<String> {
        let mut tx = self.begin().await?;
        let key = record_counter_key(namespace);
        tx.atomic_add(&key, 1);
        let value = tx
            .get(&key)
            .await?
            .map(|bytes| decode_counter(&bytes))
            .ok_or_else(|| Error::Storage("Counter vanished after increment".to_string()))?;
        tx.commit().await?;
        Ok(value.to_string())
    }

    async fn try_create_issuing_point(&self, issuing_point: &IssuingPoint) -> Result<IssuingPoint> {
        let mut tx = self.begin().await?;
        let counter = issuing_point_counter_key();
        let mut issuing_point = issuing_point.clone();

        if issuing_point.id == IssuingPoint::UNASSIGNED {
            tx.atomic_max(&counter, ISSUING_POINT_ID_FLOOR);
            tx.atomic_add(&counter, 1);
            issuing_point.id = tx
                .get(&counter)
                .await?
                .map(|bytes| decode_counter(&bytes))
                .ok_or_else(|| Error::Storage("Counter vanished after increment".to_string()))?;
        } else {
            if tx.get(&issuing_point_key(issuing_point.id)).await?.is_some() {
                return Err(Error::AlreadyExists(format!(
                    "Issuing point {}",
                    issuing_point.id
                )));
            }
            tx.atomic_max(&counter, issuing_point.id);
        }

        tx.set(
            &issuing_point_key(issuing_point.id),
            &serde_json::to_vec(&issuing_point)?,
        );
        tx.commit().await?;
        Ok(issuing_point)
    }

    async fn try_update_issuing_point(
        &self,
        id: i64,
        issuing_point: &IssuingPoint,
    ) -> Result<IssuingPoint> {
        let mut tx = self.begin().await?;
        let key = issuing_point_key(id);
        if tx.get(&key).await?.is_none() {
            return Err(Error::NotFound(format!("Issuing point {}", id)));
        }

        let mut issuing_point = issuing_point.clone();
        issuing_point.id = id;
        tx.set(&key, &serde_json::to_vec(&issuing_point)?);
        tx.commit().await?;
        Ok(issuing_point)
    }

    async fn try_delete_issuing_point(&self, id: i64) -> Result<()> {
        let mut tx = self.begin().await?;
        let key = issuing_point_key(id);
        if tx.get(&key).await?.is_none() {
            return Err(Error::NotFound(format!("Issuing point {}", id)));
        }
        tx.clear(&key);
        tx.commit().await
    }
}

#[async_trait]
impl Minter for KvRepository {
    async fn issuing_point_prefix(&self, issuing_point: i64) -> Result<String> {
        Ok(self.get_issuing_point(issuing_point).await?.prefix)
    }

    async fn next_local_id(&self, namespace: &str) -> Result<String> {
        self.retry.run(|| self.try_next_local_id(namespace)).await
    }
}

#[async_trait]
impl Repository for KvRepository {
    fn name(&self) -> &str {
        "kv"
    }

    async fn create_record(&self, new: NewRecord) -> Result<IdentifierRecord> {
        let key = match new.key {
            Some(key) => key,
            None => minting::mint(self, new.issuing_point).await?,
        };

        let (key_ref, payload) = (&key, &new.payload);
        let record = self.retry.run(move || self.try_create(key_ref, payload)).await?;

        info!(namespace = %record.namespace, local_id = %record.local_id, medium = self.store.name(), "Created record");
        Ok(record)
    }

    async fn get_current(&self, namespace: &str, local_id: &str) -> Result<IdentifierRecord> {
        debug!(namespace, local_id, "Reading current record");
        let mut tx = self.begin().await?;
        match tx.get(&current_key(namespace, local_id)).await? {
            Some(bytes) => {
                let record = decode_record(&bytes)?;
                if record.is_deleted {
                    Err(record_not_found(namespace, local_id))
                } else {
                    Ok(record)
                }
            }
            None => Err(record_not_found(namespace, local_id)),
        }
    }

    async fn get_version(
        &self,
        namespace: &str,
        local_id: &str,
        version: u32,
    ) -> Result<IdentifierRecord> {
        debug!(namespace, local_id, version, "Reading record version");
        let mut tx = self.begin().await?;
        match tx.get(&version_key(namespace, local_id, version)).await? {
            Some(bytes) => decode_record(&bytes),
            None => Err(Error::NotFound(format!(
                "Record {}/{} version {}",
                namespace, local_id, version
            ))),
        }
    }

    async fn update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: Value,
    ) -> Result<IdentifierRecord> {
        let payload = &payload;
        let record = self
            .retry
            .run(move || self.try_update(namespace, local_id, payload))
            .await?;

        info!(namespace, local_id, version = record.version, "Updated record");
        Ok(record)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let matching = self
            .scan_current()
            .await?
            .into_iter()
            .filter(|r| filter.matches(&r.payload))
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn list_public(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let matching = self
            .scan_current()
            .await?
            .into_iter()
            .filter(|r| r.is_public() && filter.matches(&r.payload))
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn get_history(&self, namespace: &str, local_id: &str) -> Result<Vec<IdentifierRecord>> {
        let mut tx = self.begin().await?;
        let (begin, end) = versions_range(namespace, local_id);

        let mut versions = tx
            .get_range(&begin, &end)
            .await?
            .iter()
            .map(|(_, value)| decode_record(value))
            .collect::<Result<Vec<_>>>()?;

        if versions.is_empty() {
            return Err(record_not_found(namespace, local_id));
        }
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        self.retry
            .run(move || self.try_soft_delete(namespace, local_id))
            .await?;
        info!(namespace, local_id, "Soft-deleted record");
        Ok(())
    }

    async fn generate_identifier(&self, issuing_point: Option<i64>) -> Result<RecordKey> {
        minting::mint(self, issuing_point).await
    }

    async fn create_issuing_point(&self, issuing_point: IssuingPoint) -> Result<IssuingPoint> {
        let requested = &issuing_point;
        let created = self
            .retry
            .run(move || self.try_create_issuing_point(requested))
            .await?;

        info!(id = created.id, name = %created.name, "Created issuing point");
        Ok(created)
    }

    async fn get_issuing_point(&self, id: i64) -> Result<IssuingPoint> {
        let mut tx = self.begin().await?;
        match tx.get(&issuing_point_key(id)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(Error::NotFound(format!("Issuing point {}", id))),
        }
    }

    async fn update_issuing_point(
        &self,
        id: i64,
        issuing_point: IssuingPoint,
    ) -> Result<IssuingPoint> {
        let requested = &issuing_point;
        let updated = self
            .retry
            .run(move || self.try_update_issuing_point(id, requested))
            .await?;

        info!(id, "Updated issuing point");
        Ok(updated)
    }

    async fn list_issuing_points(&self) -> Result<Vec<IssuingPoint>> {
        let mut tx = self.begin().await?;
        let (begin, end) = prefix_range(&[ISSUING_POINTS.into()]);

        // Integer keys already sort by id
        tx.get_range(&begin, &end)
            .await?
            .iter()
            .map(|(_, value)| serde_json::from_slice::<IssuingPoint>(value).map_err(Error::from))
            .collect()
    }

    async fn delete_issuing_point(&self, id: i64) -> Result<()> {
        self.retry
            .run(move || self.try_delete_issuing_point(id))
            .await?;
        info!(id, "Deleted issuing point");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let probe = pack(&[HEALTH.into()]);

        let mut tx = self.begin().await?;
        tx.get(&probe).await?;
        tx.set(&probe, Utc::now().to_rfc3339().as_bytes());
        tx.commit().await?;

        let mut tx = self.begin().await?;
        tx.clear(&probe);
        tx.commit().await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
