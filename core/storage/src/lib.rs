//! Storage layer for the RAiD identifier registry.
//!
//! Every backend implements [`Repository`]: a versioned record store with
//! soft deletion, identifier minting, and issuing point management.
//! A [`BackendRegistry`] resolves the configured backend by name.
//!
//! # Backends
//! - `file`: JSON documents on the local filesystem
//! - `file-git`: the file backend with a git commit per mutation
//! - `kv`: an ordered transactional key-value store (in-memory or FoundationDB)
//! - `cockroach`: CockroachDB over the PostgreSQL wire protocol
//!
//! # Design Principles
//! - Backend isolation: callers only see the [`Repository`] contract
//! - Versions are immutable once written
//! - Transaction conflicts are retried inside the backend

use std::sync::Arc;

use raidstore_common::Result;

pub mod config;
#[cfg(any(test, feature = "testutil"))]
pub mod conformance;
pub mod git;
pub mod kv;
pub mod local;
pub mod minting;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod sql;

pub use config::{FileConfig, GitConfig, KvConfig, KvMedium, SqlConfig, SslMode, StorageConfig};
pub use git::{ChangeLogEntry, GitRepository};
pub use kv::{KvRepository, KvStore, KvTransaction, MemoryKvStore};
pub use local::LocalRepository;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
pub use repository::{with_deadline, Repository};
pub use retry::{ConflictRetry, RetryConfig};
pub use sql::SqlRepository;

#[cfg(feature = "fdb")]
pub use kv::FdbKvStore;

/// Open the backend described by `config` through the default registry.
///
/// # Errors
/// - Configuration invalid for the selected backend
/// - Backend failed to initialize
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Repository>> {
    let (name, value) = config.to_backend()?;
    create_default_registry()?.open(name, value).await
}
