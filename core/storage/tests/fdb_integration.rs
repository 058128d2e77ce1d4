//! Conformance suite against a live FoundationDB cluster.
//!
//! Build with `--features fdb` and set `RAIDSTORE_TEST_FDB_CLUSTER_FILE`
//! to the cluster file path to run.

#![cfg(feature = "fdb")]
#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use raidstore_storage::{conformance, FdbKvStore, KvConfig, KvRepository, Repository};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fdb_conforms() {
    let Ok(cluster_file) = std::env::var("RAIDSTORE_TEST_FDB_CLUSTER_FILE") else {
        eprintln!("RAIDSTORE_TEST_FDB_CLUSTER_FILE not set, skipping");
        return;
    };
    let config = KvConfig {
        cluster_file: Some(cluster_file),
        ..KvConfig::default()
    };
    let store = FdbKvStore::connect(&config).expect("connect");
    let repo: Arc<dyn Repository> = Arc::new(KvRepository::new(Arc::new(store)));
    conformance::run_all(repo).await;
}
