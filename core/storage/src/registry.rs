//! Backend registry for resolving a repository by name.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{parse_config, FileConfig, GitConfig, KvConfig, KvMedium, SqlConfig};
use crate::git::GitRepository;
use crate::kv::{KvRepository, KvStore, MemoryKvStore};
use crate::local::LocalRepository;
use crate::repository::Repository;
use crate::retry::RetryConfig;
use crate::sql::SqlRepository;
use raidstore_common::{Error, Result};

/// Factory function type for creating backends.
///
/// Construction may touch the network or the filesystem, so factories are
/// asynchronous.
pub type BackendFactory =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Arc<dyn Repository>>> + Send + Sync>;

/// Registry of backend factories.
///
/// Built once at startup and consulted to open the configured backend.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Open a backend by name with its JSON configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid
    /// - Backend failed to initialize
    pub async fn open(&self, name: &str, config: Value) -> Result<Arc<dyn Repository>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::InvalidInput(format!("Unknown storage backend '{}'", name))
        })?;
        factory(config).await
    }

    /// Get sorted list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends:
/// `file`, `file-git`, `kv`, and `cockroach`.
///
/// # Errors
/// - A built-in name registered twice
pub fn create_default_registry() -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();

    registry.register(
        "file",
        Box::new(|config| {
            async move {
                let config: FileConfig = parse_config("file", config)?;
                let repo: Arc<dyn Repository> = Arc::new(LocalRepository::new(&config.data_dir)?);
                Ok::<_, Error>(repo)
            }
            .boxed()
        }),
    )?;

    registry.register(
        "file-git",
        Box::new(|config| {
            async move {
                let config: GitConfig = parse_config("file-git", config)?;
                let repo: Arc<dyn Repository> = Arc::new(GitRepository::new(config).await?);
                Ok::<_, Error>(repo)
            }
            .boxed()
        }),
    )?;

    registry.register(
        "kv",
        Box::new(|config| {
            async move {
                let config: KvConfig = parse_config("kv", config)?;
                let store = open_kv_store(&config)?;
                let repo: Arc<dyn Repository> = Arc::new(KvRepository::with_retry(
                    store,
                    RetryConfig::new(config.max_retries),
                ));
                Ok::<_, Error>(repo)
            }
            .boxed()
        }),
    )?;

    registry.register(
        "cockroach",
        Box::new(|config| {
            async move {
                let config: SqlConfig = parse_config("cockroach", config)?;
                let repo: Arc<dyn Repository> = Arc::new(SqlRepository::connect(config).await?);
                Ok::<_, Error>(repo)
            }
            .boxed()
        }),
    )?;

    Ok(registry)
}

fn open_kv_store(config: &KvConfig) -> Result<Arc<dyn KvStore>> {
    match config.medium {
        KvMedium::Memory => Ok(Arc::new(MemoryKvStore::new())),
        #[cfg(feature = "fdb")]
        KvMedium::Fdb => Ok(Arc::new(crate::kv::FdbKvStore::connect(config)?)),
        #[cfg(not(feature = "fdb"))]
        KvMedium::Fdb => Err(Error::InvalidInput(
            "FoundationDB support is not compiled in (enable the `fdb` feature)".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_factory() -> BackendFactory {
        Box::new(|_| {
            async {
                let repo: Arc<dyn Repository> =
                    Arc::new(KvRepository::new(Arc::new(MemoryKvStore::new())));
                Ok::<_, Error>(repo)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_register_and_open() {
        let mut registry = BackendRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let repo = registry.open("test", Value::Null).await.unwrap();
        assert_eq!(repo.name(), "kv");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = BackendRegistry::new();
        registry.register("test", memory_factory()).unwrap();
        assert!(registry.register("test", memory_factory()).is_err());
    }

    #[tokio::test]
    async fn test_open_unknown_fails() {
        let registry = create_default_registry().unwrap();
        let result = registry.open("s3", Value::Null).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_default_backends() {
        let registry = create_default_registry().unwrap();
        assert_eq!(
            registry.backends(),
            vec!["cockroach", "file", "file-git", "kv"]
        );
    }

    #[test]
    fn test_default_names_are_reserved() {
        let mut registry = create_default_registry().unwrap();
        for name in ["file", "file-git", "kv", "cockroach"] {
            assert!(matches!(
                registry.register(name, memory_factory()),
                Err(Error::AlreadyExists(_))
            ));
        }
        registry.register("memory", memory_factory()).unwrap();
        assert!(registry.has_backend("memory"));
    }

    #[tokio::test]
    async fn test_open_file_backend() {
        let temp = tempfile::TempDir::new().unwrap();
        let registry = create_default_registry().unwrap();

        let repo = registry
            .open("file", json!({"data_dir": temp.path()}))
            .await
            .unwrap();
        assert_eq!(repo.name(), "file");
        repo.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_memory_kv_backend() {
        let registry = create_default_registry().unwrap();
        let repo = registry
            .open("kv", json!({"medium": "memory"}))
            .await
            .unwrap();
        assert_eq!(repo.name(), "kv");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = create_default_registry().unwrap();
        let result = registry.open("file", json!({"data_dir": 42})).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
