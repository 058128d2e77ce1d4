//! Identifier minting protocol.
//!
//! Minting is two-phase: resolve the namespace and draw the next value from
//! a namespace-scoped counter, then let `create_record` check-then-insert.
//! A crash between the phases wastes a counter value. Suffixes are unique
//! and increasing, not dense.

use async_trait::async_trait;
use tracing::debug;

use raidstore_common::{Error, RecordKey, Result, DEFAULT_NAMESPACE};

/// Backend primitives the minting protocol is built on.
#[async_trait]
pub trait Minter: Send + Sync {
    /// The namespace prefix configured on an issuing point.
    async fn issuing_point_prefix(&self, issuing_point: i64) -> Result<String>;

    /// Atomically advance the counter scoped to `namespace` and render it.
    async fn next_local_id(&self, namespace: &str) -> Result<String>;
}

/// Mint a fresh `(namespace, local_id)` pair.
pub async fn mint<M>(minter: &M, issuing_point: Option<i64>) -> Result<RecordKey>
where
    M: Minter + ?Sized,
{
    let namespace = resolve_namespace(minter, issuing_point).await?;
    let local_id = minter.next_local_id(&namespace).await?;
    debug!(namespace = %namespace, local_id = %local_id, "Minted identifier");
    RecordKey::new(namespace, local_id)
}

/// Pick the namespace for a new identifier.
///
/// Falls back to the default namespace when no issuing point is given, when
/// it does not exist, or when it has no prefix configured.
pub async fn resolve_namespace<M>(minter: &M, issuing_point: Option<i64>) -> Result<String>
where
    M: Minter + ?Sized,
{
    let id = match issuing_point {
        Some(id) if id > 0 => id,
        _ => return Ok(DEFAULT_NAMESPACE.to_string()),
    };

    match minter.issuing_point_prefix(id).await {
        Ok(prefix) if !prefix.is_empty() => Ok(prefix),
        Ok(_) => Ok(DEFAULT_NAMESPACE.to_string()),
        Err(Error::NotFound(_)) => {
            debug!(issuing_point = id, "Unknown issuing point, using default namespace");
            Ok(DEFAULT_NAMESPACE.to_string())
        }
        Err(e) => Err(e),
    }
}

/// Decode a little-endian counter value as written by atomic add.
pub fn decode_counter(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    i64::from_le_bytes(buf)
}

/// Counter name scoping record suffixes to one namespace.
pub fn record_counter_name(namespace: &str) -> String {
    format!("record:{}", namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeMinter {
        prefixes: HashMap<i64, String>,
        counter: AtomicI64,
    }

    #[async_trait]
    impl Minter for FakeMinter {
        async fn issuing_point_prefix(&self, id: i64) -> Result<String> {
            if id == 13 {
                return Err(Error::Storage("backend down".into()));
            }
            self.prefixes
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("issuing point {}", id)))
        }

        async fn next_local_id(&self, _namespace: &str) -> Result<String> {
            Ok((self.counter.fetch_add(1, Ordering::SeqCst) + 1).to_string())
        }
    }

    fn minter() -> FakeMinter {
        let mut prefixes = HashMap::new();
        prefixes.insert(1001, "10.25.1.1".to_string());
        prefixes.insert(1002, "10.99.2".to_string());
        prefixes.insert(1003, String::new());
        FakeMinter {
            prefixes,
            counter: AtomicI64::new(0),
        }
    }

    #[tokio::test]
    async fn test_uses_issuing_point_prefix() {
        let key = mint(&minter(), Some(1002)).await.unwrap();
        assert_eq!(key.namespace, "10.99.2");
        assert_eq!(key.local_id, "1");
    }

    #[tokio::test]
    async fn test_falls_back_to_default() {
        let m = minter();
        assert_eq!(resolve_namespace(&m, None).await.unwrap(), DEFAULT_NAMESPACE);
        assert_eq!(resolve_namespace(&m, Some(0)).await.unwrap(), DEFAULT_NAMESPACE);
        assert_eq!(resolve_namespace(&m, Some(1003)).await.unwrap(), DEFAULT_NAMESPACE);
        assert_eq!(resolve_namespace(&m, Some(4242)).await.unwrap(), DEFAULT_NAMESPACE);
    }

    #[tokio::test]
    async fn test_lookup_failure_propagates() {
        assert!(matches!(
            resolve_namespace(&minter(), Some(13)).await,
            Err(Error::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_sequential_mints_are_distinct() {
        let m = minter();
        let a = mint(&m, Some(1001)).await.unwrap();
        let b = mint(&m, Some(1001)).await.unwrap();
        assert_eq!(a.namespace, "10.25.1.1");
        assert_ne!(a.local_id, b.local_id);
    }

    #[test]
    fn test_decode_counter() {
        assert_eq!(decode_counter(&[1, 0, 0, 0, 0, 0, 0, 0]), 1);
        assert_eq!(decode_counter(&[0, 1]), 256);
        assert_eq!(decode_counter(&[]), 0);
    }
}
