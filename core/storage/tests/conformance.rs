//! Conformance suite run against every backend that needs no external service.
//!
//! The in-memory key-value backend gets one test per check for fine-grained
//! failure reporting. The filesystem backends run the whole suite through
//! `run_all` against a fresh temporary directory.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use raidstore_storage::{
    conformance, GitConfig, GitRepository, KvRepository, LocalRepository, MemoryKvStore,
    Repository,
};
use tempfile::TempDir;

fn memory_kv() -> KvRepository {
    KvRepository::new(Arc::new(MemoryKvStore::new()))
}

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ============================================================================
// Records
// ============================================================================

#[tokio::test]
async fn create_then_get_current() {
    conformance::create_then_get_current(&memory_kv()).await;
}

#[tokio::test]
async fn duplicate_create_rejected() {
    conformance::duplicate_create_rejected(&memory_kv()).await;
}

#[tokio::test]
async fn sequential_updates_build_history() {
    conformance::sequential_updates_build_history(&memory_kv()).await;
}

#[tokio::test]
async fn get_version_returns_snapshot() {
    conformance::get_version_returns_snapshot(&memory_kv()).await;
}

#[tokio::test]
async fn missing_record_not_found() {
    conformance::missing_record_not_found(&memory_kv()).await;
}

// ============================================================================
// Deletion and listing
// ============================================================================

#[tokio::test]
async fn soft_delete_hides_but_keeps_history() {
    conformance::soft_delete_hides_but_keeps_history(&memory_kv()).await;
}

#[tokio::test]
async fn list_filters_and_paginates() {
    conformance::list_filters_and_paginates(&memory_kv()).await;
}

#[tokio::test]
async fn list_returns_current_versions_only() {
    conformance::list_returns_current_versions_only(&memory_kv()).await;
}

#[tokio::test]
async fn list_includes_dotted_segments() {
    conformance::list_includes_dotted_segments(&memory_kv()).await;
}

#[tokio::test]
async fn list_includes_dotted_segments_file() {
    let temp = TempDir::new().expect("tempdir");
    let repo = LocalRepository::new(temp.path()).expect("open file backend");
    conformance::list_includes_dotted_segments(&repo).await;
}

// ============================================================================
// Minting and issuing points
// ============================================================================

#[tokio::test]
async fn minting_uses_issuing_point_prefix() {
    conformance::minting_uses_issuing_point_prefix(&memory_kv()).await;
}

#[tokio::test]
async fn minting_falls_back_to_default() {
    conformance::minting_falls_back_to_default(&memory_kv()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mints_are_unique() {
    conformance::concurrent_mints_are_unique(Arc::new(memory_kv())).await;
}

#[tokio::test]
async fn issuing_point_crud() {
    conformance::issuing_point_crud(&memory_kv()).await;
}

#[tokio::test]
async fn issuing_point_delete_keeps_records() {
    conformance::issuing_point_delete_keeps_records(&memory_kv()).await;
}

// ============================================================================
// Concurrency and lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_are_serialized() {
    conformance::concurrent_updates_are_serialized(Arc::new(memory_kv())).await;
}

#[tokio::test]
async fn health_and_close() {
    conformance::health_and_close(&memory_kv()).await;
}

// ============================================================================
// Full suite per backend
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_all_memory_kv() {
    conformance::run_all(Arc::new(memory_kv())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_all_file() {
    let temp = TempDir::new().expect("tempdir");
    let repo: Arc<dyn Repository> =
        Arc::new(LocalRepository::new(temp.path()).expect("open file backend"));
    conformance::run_all(Arc::clone(&repo)).await;
    conformance::health_and_close(repo.as_ref()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_all_file_git() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let temp = TempDir::new().expect("tempdir");
    let config = GitConfig {
        data_dir: temp.path().to_path_buf(),
        ..GitConfig::default()
    };
    let repo: Arc<dyn Repository> =
        Arc::new(GitRepository::new(config).await.expect("open git backend"));
    conformance::run_all(Arc::clone(&repo)).await;
    conformance::health_and_close(repo.as_ref()).await;
}
