//! Repository contract every storage backend implements.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

use raidstore_common::{
    Error, IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, Result,
};

/// Persistence contract for identifier records and issuing points.
///
/// Every backend provides the same versioning, uniqueness and consistency
/// semantics. Callers depend only on this trait; the concrete backend is
/// picked once at startup through the [`BackendRegistry`](crate::BackendRegistry).
///
/// Operations are cancel-safe: dropping a returned future before it resolves
/// leaves no partially visible write behind.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Get the backend name (e.g., "file", "kv", "cockroach").
    fn name(&self) -> &str;

    /// Register a new identifier at version 1.
    ///
    /// # Preconditions
    /// - When `new.key` is `None`, an identifier is minted first
    ///
    /// # Postconditions
    /// - Version 1 is stored with `is_current = true`, `is_deleted = false`
    ///
    /// # Errors
    /// - `AlreadyExists` if a current version exists for the key, deleted or not
    async fn create_record(&self, new: NewRecord) -> Result<IdentifierRecord>;

    /// Get the current, non-deleted version.
    ///
    /// # Errors
    /// - `NotFound` if the pair has no live current version
    async fn get_current(&self, namespace: &str, local_id: &str) -> Result<IdentifierRecord>;

    /// Get an exact version, current or historical.
    ///
    /// # Errors
    /// - `NotFound` if that version was never written
    async fn get_version(
        &self,
        namespace: &str,
        local_id: &str,
        version: u32,
    ) -> Result<IdentifierRecord>;

    /// Supersede the current version with a new payload.
    ///
    /// # Postconditions
    /// - Previous version is retained with `is_current = false`
    /// - New version is `previous + 1`, `created_at` carried forward
    /// - Concurrent updates never produce the same version number
    ///
    /// # Errors
    /// - `NotFound` if the pair has no live current version
    async fn update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: Value,
    ) -> Result<IdentifierRecord>;

    /// List current, non-deleted records matching the filter.
    ///
    /// Results are ordered by `(namespace, local_id)`; offset and limit apply
    /// after filtering.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>>;

    /// As [`list`](Repository::list), restricted to open-access records.
    async fn list_public(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>>;

    /// All versions of a pair, newest first.
    ///
    /// # Errors
    /// - `NotFound` if the pair never existed
    async fn get_history(&self, namespace: &str, local_id: &str) -> Result<Vec<IdentifierRecord>>;

    /// Mark the current version deleted without touching history.
    ///
    /// # Errors
    /// - `NotFound` if the pair has no live current version
    async fn soft_delete(&self, namespace: &str, local_id: &str) -> Result<()>;

    /// Mint a fresh identifier under the issuing point's namespace.
    async fn generate_identifier(&self, issuing_point: Option<i64>) -> Result<RecordKey>;

    /// Create an issuing point, assigning an id when `id` is unassigned.
    ///
    /// # Errors
    /// - `AlreadyExists` if the supplied id is taken
    async fn create_issuing_point(&self, issuing_point: IssuingPoint) -> Result<IssuingPoint>;

    /// Get an issuing point by id.
    async fn get_issuing_point(&self, id: i64) -> Result<IssuingPoint>;

    /// Replace an issuing point. The stored id is always `id`.
    async fn update_issuing_point(&self, id: i64, issuing_point: IssuingPoint)
        -> Result<IssuingPoint>;

    /// List all issuing points ordered by id.
    async fn list_issuing_points(&self) -> Result<Vec<IssuingPoint>>;

    /// Delete an issuing point. Records minted under it are unaffected.
    async fn delete_issuing_point(&self, id: i64) -> Result<()>;

    /// Cheap round trip against the medium.
    async fn health_check(&self) -> Result<()>;

    /// Release held connections and handles. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Run a storage operation under a deadline.
///
/// On expiry the operation future is dropped, which aborts it without a
/// partially visible write, and `Error::Timeout` is returned.
pub async fn with_deadline<T, F>(limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "operation exceeded deadline of {:?}",
            limit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expires() {
        let result: Result<()> = with_deadline(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_deadline_passes_result_through() {
        let result = with_deadline(Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);

        let result: Result<()> = with_deadline(Duration::from_secs(1), async {
            Err(Error::NotFound("x".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
