//! Conformance suite for [`Repository`] implementations.
//!
//! Every backend runs the same checks. Each function takes a live repository
//! and works in its own freshly generated namespace, so the suite can run
//! against a shared database without cleanup between runs.
//!
//! ```ignore
//! use std::sync::Arc;
//! use raidstore_storage::{conformance, KvRepository, MemoryKvStore};
//!
//! #[tokio::test]
//! async fn memory_kv_conforms() {
//!     let repo = Arc::new(KvRepository::new(Arc::new(MemoryKvStore::new())));
//!     conformance::run_all(repo).await;
//! }
//! ```
//!
//! | Category       | Contract aspect                                        |
//! |----------------|--------------------------------------------------------|
//! | Records        | create/get/update/history/version semantics           |
//! | Deletion       | soft delete hides from listings, keeps history         |
//! | Listing        | filters, ordering, public restriction, pagination      |
//! | Minting        | namespace resolution and suffix uniqueness             |
//! | Issuing points | keyed CRUD and id assignment                           |
//! | Concurrency    | racing updates produce consecutive distinct versions   |

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::repository::Repository;
use raidstore_common::{
    Error, IssuingPoint, NewRecord, RecordFilter, RecordKey, DEFAULT_NAMESPACE, OPEN_ACCESS_TYPE,
};

/// A namespace no other check or run will use.
pub fn unique_namespace(tag: &str) -> String {
    format!("test.{}.{}", tag, Uuid::new_v4().simple())
}

fn key(namespace: &str, local_id: &str) -> RecordKey {
    RecordKey::new(namespace, local_id).expect("valid key")
}

/// Payload with nested arrays, optional fields, and non-ASCII text.
pub fn sample_payload(contributor: &str, public: bool) -> Value {
    json!({
        "title": [
            {"text": "Glacial retreat: 氷河の後退", "type": {"id": "primary"}, "startDate": "2024-01-01"},
            {"text": "Ürünler ve sonuçlar", "type": {"id": "alternative"}, "startDate": "2024-01-01", "endDate": null}
        ],
        "access": {"type": {"id": if public { OPEN_ACCESS_TYPE } else { "https://vocabulary.raid.org/access.type.schema/53" }}},
        "contributor": [{"id": contributor, "position": [{"id": "leader", "startDate": "2024-01-01"}]}],
        "organisation": [{"id": "https://ror.org/038sjwq14", "role": []}],
        "subject": [],
        "nested": {"deep": [[1, 2], [3, [4, {"x": "ÿ"}]]]}
    })
}

// ============================================================================
// Records
// ============================================================================

/// `create_record` then `get_current` returns version 1 with the same payload.
pub async fn create_then_get_current(repo: &dyn Repository) {
    let ns = unique_namespace("create");
    let payload = sample_payload("https://orcid.org/0000-0001-0001-0001", false);

    let created = repo
        .create_record(NewRecord::new(payload.clone()).with_key(key(&ns, "1")))
        .await
        .expect("create");
    assert_eq!(created.version, 1);
    assert!(created.is_current);
    assert!(!created.is_deleted);
    assert_eq!(created.created_at, created.updated_at);

    let current = repo.get_current(&ns, "1").await.expect("get_current");
    assert_eq!(current.version, 1);
    assert!(current.is_current);
    assert!(!current.is_deleted);
    assert_eq!(current.payload, payload, "payload must survive storage unchanged");
}

/// A second create of the same explicit key fails and leaves the first intact.
pub async fn duplicate_create_rejected(repo: &dyn Repository) {
    let ns = unique_namespace("dup");
    repo.create_record(NewRecord::new(json!({"n": "first"})).with_key(key(&ns, "7")))
        .await
        .expect("first create");

    let second = repo
        .create_record(NewRecord::new(json!({"n": "second"})).with_key(key(&ns, "7")))
        .await;
    assert!(
        matches!(second, Err(Error::AlreadyExists(_))),
        "expected AlreadyExists, got {second:?}"
    );

    let current = repo.get_current(&ns, "7").await.expect("get_current");
    assert_eq!(current.payload, json!({"n": "first"}));
    assert_eq!(current.version, 1);
}

/// N sequential updates give N+1 versions, newest first.
pub async fn sequential_updates_build_history(repo: &dyn Repository) {
    let ns = unique_namespace("history");
    let created = repo
        .create_record(NewRecord::new(json!({"rev": 0})).with_key(key(&ns, "h")))
        .await
        .expect("create");

    const N: u32 = 4;
    for rev in 1..=N {
        let updated = repo
            .update(&ns, "h", json!({"rev": rev}))
            .await
            .expect("update");
        assert_eq!(updated.version, rev + 1);
        assert_eq!(updated.created_at, created.created_at, "created_at carried forward");
        assert!(updated.updated_at >= created.updated_at);
    }

    let history = repo.get_history(&ns, "h").await.expect("history");
    let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
    assert_eq!(versions, (1..=N + 1).rev().collect::<Vec<_>>());
    assert_eq!(history.iter().filter(|r| r.is_current).count(), 1);
    assert!(history[0].is_current);

    let current = repo.get_current(&ns, "h").await.expect("current");
    assert_eq!(current.version, N + 1);
}

/// Old versions keep their original payload after later updates.
pub async fn get_version_returns_snapshot(repo: &dyn Repository) {
    let ns = unique_namespace("snapshot");
    let original = sample_payload("https://orcid.org/0000-0002-0002-0002", true);
    repo.create_record(NewRecord::new(original.clone()).with_key(key(&ns, "s")))
        .await
        .expect("create");
    for rev in 0..3 {
        repo.update(&ns, "s", json!({"rev": rev}))
            .await
            .expect("update");
    }

    let v1 = repo.get_version(&ns, "s", 1).await.expect("v1");
    assert_eq!(v1.payload, original);
    assert!(!v1.is_current);

    let v4 = repo.get_version(&ns, "s", 4).await.expect("v4");
    assert_eq!(v4.payload, json!({"rev": 2}));
    assert!(v4.is_current);
}

/// Reads and writes of absent records report `NotFound`.
pub async fn missing_record_not_found(repo: &dyn Repository) {
    let ns = unique_namespace("missing");

    assert!(matches!(repo.get_current(&ns, "x").await, Err(Error::NotFound(_))));
    assert!(matches!(repo.get_version(&ns, "x", 1).await, Err(Error::NotFound(_))));
    assert!(matches!(repo.get_history(&ns, "x").await, Err(Error::NotFound(_))));
    assert!(matches!(repo.update(&ns, "x", json!({})).await, Err(Error::NotFound(_))));
    assert!(matches!(repo.soft_delete(&ns, "x").await, Err(Error::NotFound(_))));

    repo.create_record(NewRecord::new(json!({})).with_key(key(&ns, "x")))
        .await
        .expect("create");
    assert!(matches!(repo.get_version(&ns, "x", 2).await, Err(Error::NotFound(_))));
}

// ============================================================================
// Deletion
// ============================================================================

/// Soft delete hides the record from reads and listings, history stays.
pub async fn soft_delete_hides_but_keeps_history(repo: &dyn Repository) {
    let ns = unique_namespace("delete");
    let contributor = format!("https://orcid.org/{}", Uuid::new_v4());
    let payload = sample_payload(&contributor, true);

    repo.create_record(NewRecord::new(payload.clone()).with_key(key(&ns, "d")))
        .await
        .expect("create");
    repo.update(&ns, "d", payload.clone()).await.expect("update");
    let before = repo.get_history(&ns, "d").await.expect("history");

    repo.soft_delete(&ns, "d").await.expect("soft_delete");

    assert!(matches!(repo.get_current(&ns, "d").await, Err(Error::NotFound(_))));
    let filter = RecordFilter {
        contributor_id: Some(contributor),
        ..Default::default()
    };
    assert!(repo.list(&filter).await.expect("list").is_empty());
    assert!(repo.list_public(&filter).await.expect("list_public").is_empty());

    let after = repo.get_history(&ns, "d").await.expect("history after delete");
    assert_eq!(after.len(), before.len());
    for (a, b) in after.iter().zip(before.iter()) {
        assert_eq!(a.version, b.version);
        assert_eq!(a.payload, b.payload);
    }
    let v1 = repo.get_version(&ns, "d", 1).await.expect("v1 after delete");
    assert_eq!(v1.payload, payload);

    assert!(matches!(repo.soft_delete(&ns, "d").await, Err(Error::NotFound(_))));
    assert!(matches!(repo.update(&ns, "d", json!({})).await, Err(Error::NotFound(_))));
    assert!(matches!(
        repo.create_record(NewRecord::new(json!({})).with_key(key(&ns, "d"))).await,
        Err(Error::AlreadyExists(_))
    ));
}

// ============================================================================
// Listing
// ============================================================================

/// Filters, ordering, public restriction and pagination.
pub async fn list_filters_and_paginates(repo: &dyn Repository) {
    let ns = unique_namespace("list");
    let contributor = format!("https://orcid.org/{}", Uuid::new_v4());
    let other = format!("https://orcid.org/{}", Uuid::new_v4());

    // ids chosen so key order differs from insertion order
    for (id, public) in [("c", true), ("a", false), ("e", true), ("b", true), ("d", false)] {
        repo.create_record(
            NewRecord::new(sample_payload(&contributor, public)).with_key(key(&ns, id)),
        )
        .await
        .expect("create");
    }
    repo.create_record(NewRecord::new(sample_payload(&other, true)).with_key(key(&ns, "z")))
        .await
        .expect("create other");

    let all = RecordFilter {
        contributor_id: Some(contributor.clone()),
        ..Default::default()
    };
    let ids = |records: Vec<raidstore_common::IdentifierRecord>| -> Vec<String> {
        records.into_iter().map(|r| r.local_id).collect()
    };

    assert_eq!(ids(repo.list(&all).await.expect("list")), ["a", "b", "c", "d", "e"]);
    assert_eq!(ids(repo.list_public(&all).await.expect("public")), ["b", "c", "e"]);

    let page = RecordFilter {
        offset: 1,
        limit: Some(2),
        ..all.clone()
    };
    assert_eq!(ids(repo.list(&page).await.expect("page")), ["b", "c"]);
    // pagination applies after the public restriction
    assert_eq!(ids(repo.list_public(&page).await.expect("public page")), ["c", "e"]);

    let past_end = RecordFilter {
        offset: 50,
        ..all.clone()
    };
    assert!(repo.list(&past_end).await.expect("past end").is_empty());

    let org_and_contributor = RecordFilter {
        organisation_id: Some("https://ror.org/038sjwq14".into()),
        ..all.clone()
    };
    assert_eq!(repo.list(&org_and_contributor).await.expect("both").len(), 5);

    let wrong_org = RecordFilter {
        organisation_id: Some("https://ror.org/nope".into()),
        ..all
    };
    assert!(repo.list(&wrong_org).await.expect("wrong org").is_empty());
}

/// Listings return only the current version of updated records.
/// Keys whose segments start with `.` are stored and listed like any other.
pub async fn list_includes_dotted_segments(repo: &dyn Repository) {
    let ns = unique_namespace("dots");
    let contributor = format!("https://orcid.org/{}", Uuid::new_v4());
    let id = Uuid::new_v4().to_string();

    let mut expected = vec![
        (ns.clone(), "plain".to_string()),
        (ns.clone(), ".5".to_string()),
        (format!(".{}", ns), "1".to_string()),
        ("..".to_string(), id.clone()),
        (".".to_string(), id.clone()),
    ];
    for (namespace, local_id) in &expected {
        repo.create_record(
            NewRecord::new(sample_payload(&contributor, true)).with_key(key(namespace, local_id)),
        )
        .await
        .expect("create");
    }
    repo.update("..", &id, sample_payload(&contributor, true))
        .await
        .expect("update");

    let filter = RecordFilter {
        contributor_id: Some(contributor),
        ..Default::default()
    };
    let mut listed: Vec<(String, String)> = repo
        .list(&filter)
        .await
        .expect("list")
        .into_iter()
        .map(|r| (r.namespace, r.local_id))
        .collect();
    listed.sort();
    expected.sort();
    assert_eq!(listed, expected);

    let current = repo.get_current("..", &id).await.expect("current");
    assert_eq!(current.version, 2);
    assert_eq!(repo.get_history("..", &id).await.expect("history").len(), 2);
    assert_eq!(repo.get_current(".", &id).await.expect("dot").version, 1);
}

pub async fn list_returns_current_versions_only(repo: &dyn Repository) {
    let ns = unique_namespace("listcur");
    let contributor = format!("https://orcid.org/{}", Uuid::new_v4());

    repo.create_record(NewRecord::new(sample_payload(&contributor, false)).with_key(key(&ns, "1")))
        .await
        .expect("create");
    let mut changed = sample_payload(&contributor, false);
    changed["marker"] = json!("v2");
    repo.update(&ns, "1", changed).await.expect("update");

    let listed = repo
        .list(&RecordFilter {
            contributor_id: Some(contributor),
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].version, 2);
    assert_eq!(listed[0].payload["marker"], "v2");
}

// ============================================================================
// Minting
// ============================================================================

/// Minting resolves the issuing point prefix and never repeats a suffix.
pub async fn minting_uses_issuing_point_prefix(repo: &dyn Repository) {
    let point = repo
        .create_issuing_point(IssuingPoint::new("Minting", DEFAULT_NAMESPACE))
        .await
        .expect("create issuing point");

    let a = repo.generate_identifier(Some(point.id)).await.expect("mint a");
    let b = repo.generate_identifier(Some(point.id)).await.expect("mint b");
    assert_eq!(a.namespace, DEFAULT_NAMESPACE);
    assert_eq!(b.namespace, DEFAULT_NAMESPACE);
    assert_ne!(a.local_id, b.local_id);

    let prefix = unique_namespace("prefix");
    let custom = repo
        .create_issuing_point(IssuingPoint::new("Custom", prefix.clone()))
        .await
        .expect("create custom");
    let minted = repo
        .create_record(NewRecord::new(json!({"minted": true})).with_issuing_point(custom.id))
        .await
        .expect("create minted");
    assert_eq!(minted.namespace, prefix);
    assert_eq!(minted.version, 1);
    assert_eq!(
        repo.get_current(&minted.namespace, &minted.local_id)
            .await
            .expect("minted readable")
            .payload,
        json!({"minted": true})
    );
}

/// Unknown or prefix-less issuing points fall back to the default namespace.
pub async fn minting_falls_back_to_default(repo: &dyn Repository) {
    let unowned = repo.generate_identifier(None).await.expect("mint");
    assert_eq!(unowned.namespace, DEFAULT_NAMESPACE);

    let missing = repo
        .generate_identifier(Some(i64::MAX - 7))
        .await
        .expect("mint unknown");
    assert_eq!(missing.namespace, DEFAULT_NAMESPACE);

    let blank = repo
        .create_issuing_point(IssuingPoint::new("Blank", ""))
        .await
        .expect("create blank");
    let minted = repo.generate_identifier(Some(blank.id)).await.expect("mint blank");
    assert_eq!(minted.namespace, DEFAULT_NAMESPACE);
}

/// Concurrent mints in one namespace never collide.
pub async fn concurrent_mints_are_unique(repo: Arc<dyn Repository>) {
    let mut handles = Vec::new();
    for _ in 0..16 {
        let repo = Arc::clone(&repo);
        handles.push(tokio::spawn(async move {
            repo.generate_identifier(None).await.expect("mint")
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let minted = handle.await.expect("task join");
        assert!(seen.insert(minted), "duplicate identifier minted");
    }
}

// ============================================================================
// Issuing points
// ============================================================================

/// Keyed CRUD with automatic and explicit ids.
pub async fn issuing_point_crud(repo: &dyn Repository) {
    let created = repo
        .create_issuing_point(IssuingPoint::new("Lab", "10.80.1"))
        .await
        .expect("create");
    assert!(created.id > raidstore_common::ISSUING_POINT_ID_FLOOR);
    assert_eq!(repo.get_issuing_point(created.id).await.expect("get"), created);

    let mut taken = IssuingPoint::new("Clash", "10.80.2");
    taken.id = created.id;
    assert!(matches!(
        repo.create_issuing_point(taken).await,
        Err(Error::AlreadyExists(_))
    ));

    let mut explicit = IssuingPoint::new("Explicit", "10.80.3");
    explicit.id = created.id + 500;
    let explicit = repo.create_issuing_point(explicit).await.expect("explicit");
    let after = repo
        .create_issuing_point(IssuingPoint::new("After", "10.80.4"))
        .await
        .expect("after explicit");
    assert!(after.id > explicit.id, "auto ids continue past explicit ids");

    let mut renamed = created.clone();
    renamed.name = "Renamed".into();
    renamed.id = 0;
    let updated = repo
        .update_issuing_point(created.id, renamed)
        .await
        .expect("update");
    assert_eq!(updated.id, created.id);
    assert_eq!(repo.get_issuing_point(created.id).await.expect("get").name, "Renamed");

    let listed: Vec<i64> = repo
        .list_issuing_points()
        .await
        .expect("list")
        .into_iter()
        .map(|sp| sp.id)
        .collect();
    let mut sorted = listed.clone();
    sorted.sort_unstable();
    assert_eq!(listed, sorted, "issuing points ordered by id");
    assert!(listed.contains(&created.id) && listed.contains(&explicit.id));

    repo.delete_issuing_point(explicit.id).await.expect("delete");
    assert!(matches!(
        repo.get_issuing_point(explicit.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        repo.delete_issuing_point(explicit.id).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        repo.update_issuing_point(explicit.id, IssuingPoint::new("Gone", "")).await,
        Err(Error::NotFound(_))
    ));
}

/// Deleting an issuing point leaves records minted under it alone.
pub async fn issuing_point_delete_keeps_records(repo: &dyn Repository) {
    let prefix = unique_namespace("owner");
    let point = repo
        .create_issuing_point(IssuingPoint::new("Owner", prefix.clone()))
        .await
        .expect("create");
    let record = repo
        .create_record(NewRecord::new(json!({"kept": true})).with_issuing_point(point.id))
        .await
        .expect("create record");

    repo.delete_issuing_point(point.id).await.expect("delete");

    let current = repo
        .get_current(&record.namespace, &record.local_id)
        .await
        .expect("record survives");
    assert_eq!(current.namespace, prefix);
}

// ============================================================================
// Concurrency
// ============================================================================

/// N racing updates yield N consecutive distinct versions.
pub async fn concurrent_updates_are_serialized(repo: Arc<dyn Repository>) {
    let ns = unique_namespace("race");
    repo.create_record(NewRecord::new(json!({"writer": -1})).with_key(key(&ns, "r")))
        .await
        .expect("create");

    const N: usize = 12;
    let mut handles = Vec::new();
    for writer in 0..N {
        let repo = Arc::clone(&repo);
        let ns = ns.clone();
        handles.push(tokio::spawn(async move {
            repo.update(&ns, "r", json!({"writer": writer}))
                .await
                .expect("concurrent update")
                .version
        }));
    }

    let mut versions = Vec::new();
    for handle in handles {
        versions.push(handle.await.expect("task join"));
    }
    versions.sort_unstable();
    let expected: Vec<u32> = (2..=(N as u32 + 1)).collect();
    assert_eq!(versions, expected, "versions must be distinct and gap-free");

    let history = repo.get_history(&ns, "r").await.expect("history");
    assert_eq!(history.len(), N + 1);
    assert_eq!(history.iter().filter(|r| r.is_current).count(), 1);
    assert_eq!(history[0].version, N as u32 + 1);
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Health check succeeds on a working backend and close is idempotent.
pub async fn health_and_close(repo: &dyn Repository) {
    repo.health_check().await.expect("health_check");
    repo.close().await.expect("close");
    repo.close().await.expect("second close");
}

/// Run every check against one repository.
///
/// `health_and_close` is not included since it closes the repository.
pub async fn run_all(repo: Arc<dyn Repository>) {
    create_then_get_current(repo.as_ref()).await;
    duplicate_create_rejected(repo.as_ref()).await;
    sequential_updates_build_history(repo.as_ref()).await;
    get_version_returns_snapshot(repo.as_ref()).await;
    missing_record_not_found(repo.as_ref()).await;
    soft_delete_hides_but_keeps_history(repo.as_ref()).await;
    list_filters_and_paginates(repo.as_ref()).await;
    list_returns_current_versions_only(repo.as_ref()).await;
    list_includes_dotted_segments(repo.as_ref()).await;
    minting_uses_issuing_point_prefix(repo.as_ref()).await;
    minting_falls_back_to_default(repo.as_ref()).await;
    concurrent_mints_are_unique(Arc::clone(&repo)).await;
    issuing_point_crud(repo.as_ref()).await;
    issuing_point_delete_keeps_records(repo.as_ref()).await;
    concurrent_updates_are_serialized(repo).await;
}
