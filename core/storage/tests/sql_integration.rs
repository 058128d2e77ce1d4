//! Conformance suite against a live CockroachDB.
//!
//! Set `RAIDSTORE_TEST_COCKROACH_URL` (for example
//! `postgresql://root@localhost:26257/raid?sslmode=disable`) to run.
//! Each check uses its own namespace, so a shared database is fine.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use raidstore_storage::{conformance, Repository, SqlConfig, SqlRepository};

async fn connect() -> Option<Arc<dyn Repository>> {
    let Ok(url) = std::env::var("RAIDSTORE_TEST_COCKROACH_URL") else {
        eprintln!("RAIDSTORE_TEST_COCKROACH_URL not set, skipping");
        return None;
    };
    let config = SqlConfig {
        url: Some(url),
        pool_size: 8,
        ..SqlConfig::default()
    };
    let repo = SqlRepository::connect(config).await.expect("connect");
    Some(Arc::new(repo))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cockroach_conforms() {
    let Some(repo) = connect().await else {
        return;
    };
    conformance::run_all(Arc::clone(&repo)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cockroach_schema_is_idempotent() {
    let Some(first) = connect().await else {
        return;
    };
    // a second connect re-applies the schema against existing tables
    let second = connect().await.expect("second connect");
    second.health_check().await.expect("health");
    conformance::health_and_close(first.as_ref()).await;
    conformance::health_and_close(second.as_ref()).await;
}
