//! Local filesystem backend.
//!
//! Records are stored as pretty-printed JSON under the data directory:
//!
//! ```text
//! raids/<ns>/<id>.json                 current version
//! raids/<ns>/<id>.json.deleted         soft-deleted current version
//! raids/<ns>/.history/<id>/v<N>.json   superseded version N
//! servicepoints/<id>.json              issuing points
//! ```

use async_trait::async_trait;
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::minting::{self, Minter};
use crate::repository::Repository;
use raidstore_common::{
    Error, IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, Result,
    ISSUING_POINT_ID_FLOOR,
};

const RAIDS_DIR: &str = "raids";
const HISTORY_DIR: &str = ".history";
const ISSUING_POINTS_DIR: &str = "servicepoints";
const HEALTHCHECK_FILE: &str = ".healthcheck";
const DELETED_SUFFIX: &str = ".deleted";

/// Mutable state guarded by the store-wide lock.
struct FileState {
    next_issuing_point_id: i64,
}

/// Local filesystem repository.
///
/// A single reader-writer lock serializes the whole store: reads share it,
/// every mutation holds it exclusively for its full read-modify-write.
/// Minted suffixes are nanosecond timestamps forced strictly increasing
/// within this process. Two processes sharing one directory are not
/// coordinated.
pub struct LocalRepository {
    data_dir: PathBuf,
    state: RwLock<FileState>,
    last_suffix: AtomicI64,
}

impl LocalRepository {
    /// Open (or create) a store rooted at `data_dir`.
    ///
    /// # Postconditions
    /// - `raids/` and `servicepoints/` exist
    /// - The issuing point id counter continues above the highest id on disk
    ///
    /// # Errors
    /// - Directory cannot be created or read
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();

        // Sync for constructor
        std::fs::create_dir_all(data_dir.join(RAIDS_DIR))?;
        std::fs::create_dir_all(data_dir.join(ISSUING_POINTS_DIR))?;

        let mut highest = ISSUING_POINT_ID_FLOOR;
        for entry in std::fs::read_dir(data_dir.join(ISSUING_POINTS_DIR))? {
            let entry = entry?;
            let id = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<i64>().ok());
            if let Some(id) = id {
                highest = highest.max(id);
            }
        }

        debug!(data_dir = %data_dir.display(), next_issuing_point_id = highest + 1, "Opened local store");

        Ok(Self {
            data_dir,
            state: RwLock::new(FileState {
                next_issuing_point_id: highest + 1,
            }),
            last_suffix: AtomicI64::new(0),
        })
    }

    /// Root directory of the store.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the current-version file of a record.
    pub fn current_path(&self, namespace: &str, local_id: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.json", sanitize(local_id)))
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.data_dir.join(RAIDS_DIR).join(sanitize(namespace))
    }

    fn deleted_path(&self, namespace: &str, local_id: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(format!("{}.json{}", sanitize(local_id), DELETED_SUFFIX))
    }

    fn history_dir(&self, namespace: &str, local_id: &str) -> PathBuf {
        self.namespace_dir(namespace)
            .join(HISTORY_DIR)
            .join(sanitize(local_id))
    }

    fn version_path(&self, namespace: &str, local_id: &str, version: u32) -> PathBuf {
        self.history_dir(namespace, local_id)
            .join(format!("v{}.json", version))
    }

    fn issuing_point_path(&self, id: i64) -> PathBuf {
        self.data_dir
            .join(ISSUING_POINTS_DIR)
            .join(format!("{}.json", id))
    }

    /// Live current version, if any.
    async fn read_current(&self, namespace: &str, local_id: &str) -> Result<Option<IdentifierRecord>> {
        read_json(&self.current_path(namespace, local_id)).await
    }

    /// Soft-deleted current version, if any.
    async fn read_deleted(&self, namespace: &str, local_id: &str) -> Result<Option<IdentifierRecord>> {
        let record: Option<IdentifierRecord> =
            read_json(&self.deleted_path(namespace, local_id)).await?;
        Ok(record.map(|mut r| {
            r.is_deleted = true;
            r
        }))
    }

    async fn read_issuing_point(&self, id: i64) -> Result<Option<IssuingPoint>> {
        read_json(&self.issuing_point_path(id)).await
    }

    /// Current, non-deleted records in key order.
    async fn scan_current(&self) -> Result<Vec<IdentifierRecord>> {
        let mut records = Vec::new();
        let raids = self.data_dir.join(RAIDS_DIR);

        for ns_dir in list_dir(&raids).await? {
            if !fs::metadata(&ns_dir).await?.is_dir() {
                continue;
            }
            for path in list_dir(&ns_dir).await? {
                let is_current_file = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".json"))
                    .unwrap_or(false);
                if !is_current_file {
                    continue;
                }
                match read_json::<IdentifierRecord>(&path).await {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable record file");
                    }
                }
            }
        }

        records.sort_by(|a, b| {
            (a.namespace.as_str(), a.local_id.as_str())
                .cmp(&(b.namespace.as_str(), b.local_id.as_str()))
        });
        Ok(records)
    }

    fn next_suffix(&self) -> i64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let step = |last: i64| now.max(last + 1);
        let previous = self
            .last_suffix
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(step(last)))
            .unwrap_or_else(|last| last);
        step(previous)
    }
}

/// Namespace lookup and suffix generation. Callers hold the store lock.
#[async_trait]
impl Minter for LocalRepository {
    async fn issuing_point_prefix(&self, issuing_point: i64) -> Result<String> {
        self.read_issuing_point(issuing_point)
            .await?
            .map(|sp| sp.prefix)
            .ok_or_else(|| Error::NotFound(format!("Issuing point {}", issuing_point)))
    }

    async fn next_local_id(&self, _namespace: &str) -> Result<String> {
        Ok(self.next_suffix().to_string())
    }
}

#[async_trait]
impl Repository for LocalRepository {
    fn name(&self) -> &str {
        "file"
    }

    async fn create_record(&self, new: NewRecord) -> Result<IdentifierRecord> {
        let _guard = self.state.write().await;

        let key = match new.key {
            Some(key) => key,
            None => minting::mint(self, new.issuing_point).await?,
        };

        let current = self.current_path(&key.namespace, &key.local_id);
        let deleted = self.deleted_path(&key.namespace, &key.local_id);
        if fs::try_exists(&current).await? || fs::try_exists(&deleted).await? {
            return Err(Error::AlreadyExists(format!("Record {}", key)));
        }

        let record = IdentifierRecord::first_version(key, new.payload, Utc::now());
        write_json_atomic(&current, &record).await?;

        info!(namespace = %record.namespace, local_id = %record.local_id, "Created record");
        Ok(record)
    }

    async fn get_current(&self, namespace: &str, local_id: &str) -> Result<IdentifierRecord> {
        let _guard = self.state.read().await;
        debug!(namespace, local_id, "Reading current record");

        self.read_current(namespace, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Record {}/{}", namespace, local_id)))
    }

    async fn get_version(
        &self,
        namespace: &str,
        local_id: &str,
        version: u32,
    ) -> Result<IdentifierRecord> {
        let _guard = self.state.read().await;
        debug!(namespace, local_id, version, "Reading record version");

        let head = match self.read_current(namespace, local_id).await? {
            Some(record) => Some(record),
            None => self.read_deleted(namespace, local_id).await?,
        };
        if let Some(head) = head {
            if head.version == version {
                return Ok(head);
            }
        }

        read_json(&self.version_path(namespace, local_id, version))
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Record {}/{} version {}", namespace, local_id, version))
            })
    }

    async fn update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: Value,
    ) -> Result<IdentifierRecord> {
        let _guard = self.state.write().await;

        let current = self
            .read_current(namespace, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Record {}/{}", namespace, local_id)))?;

        let mut superseded = current.clone();
        superseded.is_current = false;
        write_json_atomic(
            &self.version_path(namespace, local_id, current.version),
            &superseded,
        )
        .await?;

        let next = current.next_version(payload, Utc::now());
        write_json_atomic(&self.current_path(namespace, local_id), &next).await?;

        info!(namespace, local_id, version = next.version, "Updated record");
        Ok(next)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let _guard = self.state.read().await;

        let matching = self
            .scan_current()
            .await?
            .into_iter()
            .filter(|r| filter.matches(&r.payload))
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn list_public(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let _guard = self.state.read().await;

        let matching = self
            .scan_current()
            .await?
            .into_iter()
            .filter(|r| r.is_public() && filter.matches(&r.payload))
            .collect();
        Ok(filter.paginate(matching))
    }

    async fn get_history(&self, namespace: &str, local_id: &str) -> Result<Vec<IdentifierRecord>> {
        let _guard = self.state.read().await;

        let mut versions: BTreeMap<u32, IdentifierRecord> = BTreeMap::new();
        for path in list_dir(&self.history_dir(namespace, local_id)).await? {
            if let Some(record) = read_json::<IdentifierRecord>(&path).await? {
                versions.insert(record.version, record);
            }
        }

        let head = match self.read_current(namespace, local_id).await? {
            Some(record) => Some(record),
            None => self.read_deleted(namespace, local_id).await?,
        };
        if let Some(head) = head {
            versions.insert(head.version, head);
        }

        if versions.is_empty() {
            return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id)));
        }
        Ok(versions.into_values().rev().collect())
    }

    async fn soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        let _guard = self.state.write().await;

        let current = self.current_path(namespace, local_id);
        if !fs::try_exists(&current).await? {
            return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id)));
        }

        fs::rename(&current, self.deleted_path(namespace, local_id)).await?;

        info!(namespace, local_id, "Soft-deleted record");
        Ok(())
    }

    async fn generate_identifier(&self, issuing_point: Option<i64>) -> Result<RecordKey> {
        let _guard = self.state.read().await;
        minting::mint(self, issuing_point).await
    }

    async fn create_issuing_point(&self, mut issuing_point: IssuingPoint) -> Result<IssuingPoint> {
        let mut state = self.state.write().await;

        if issuing_point.id == IssuingPoint::UNASSIGNED {
            issuing_point.id = state.next_issuing_point_id;
        } else if fs::try_exists(&self.issuing_point_path(issuing_point.id)).await? {
            return Err(Error::AlreadyExists(format!(
                "Issuing point {}",
                issuing_point.id
            )));
        }

        write_json_atomic(&self.issuing_point_path(issuing_point.id), &issuing_point).await?;
        state.next_issuing_point_id = state.next_issuing_point_id.max(issuing_point.id + 1);

        info!(id = issuing_point.id, name = %issuing_point.name, "Created issuing point");
        Ok(issuing_point)
    }

    async fn get_issuing_point(&self, id: i64) -> Result<IssuingPoint> {
        let _guard = self.state.read().await;

        self.read_issuing_point(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Issuing point {}", id)))
    }

    async fn update_issuing_point(
        &self,
        id: i64,
        mut issuing_point: IssuingPoint,
    ) -> Result<IssuingPoint> {
        let _guard = self.state.write().await;

        let path = self.issuing_point_path(id);
        if !fs::try_exists(&path).await? {
            return Err(Error::NotFound(format!("Issuing point {}", id)));
        }

        issuing_point.id = id;
        write_json_atomic(&path, &issuing_point).await?;

        info!(id, "Updated issuing point");
        Ok(issuing_point)
    }

    async fn list_issuing_points(&self) -> Result<Vec<IssuingPoint>> {
        let _guard = self.state.read().await;

        let mut points = Vec::new();
        for path in list_dir(&self.data_dir.join(ISSUING_POINTS_DIR)).await? {
            match read_json::<IssuingPoint>(&path).await {
                Ok(Some(sp)) => points.push(sp),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable issuing point file");
                }
            }
        }
        points.sort_by_key(|sp| sp.id);
        Ok(points)
    }

    async fn delete_issuing_point(&self, id: i64) -> Result<()> {
        let _guard = self.state.write().await;

        match fs::remove_file(self.issuing_point_path(id)).await {
            Ok(()) => {
                info!(id, "Deleted issuing point");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Issuing point {}", id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let probe = self.data_dir.join(HEALTHCHECK_FILE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Make `segment` safe as a single path component.
///
/// Characters that are unsafe in a file name become `_`. A leading `.` is
/// written as `%2E` and `%` itself as `%25`, so a segment can neither be
/// hidden nor name `.` or `..`, and dotted ids stay distinct from their
/// escaped spelling.
pub fn sanitize(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for (i, c) in segment.chars().enumerate() {
        match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
            '%' => out.push_str("%25"),
            '.' if i == 0 => out.push_str("%2E"),
            c => out.push(c),
        }
    }
    out
}

/// Read and parse a JSON file. A missing file is `None`.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write JSON to a temporary sibling, then rename it over `path`.
///
/// Readers see either the old file or the new one, never a partial write.
/// The write and rename run as one blocking task that finishes even if the
/// caller is dropped, so cancellation never strands a temp file.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::InvalidInput(format!("No parent for {}", path.display())))?
        .to_path_buf();

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("record");
    let tmp = parent.join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
    let target = path.to_path_buf();
    let data = serde_json::to_vec_pretty(value)?;

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&parent)?;
        if let Err(e) = std::fs::write(&tmp, &data).and_then(|_| std::fs::rename(&tmp, &target)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::Storage(format!("Write task failed: {}", e)))??;
    Ok(())
}

/// Non-hidden entries of a directory. A missing directory is empty.
///
/// [`sanitize`] never yields a leading `.`, so every hidden entry belongs to
/// the store itself (history directories and in-flight temp files).
async fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let hidden = entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(true);
        if !hidden {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::with_deadline;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open() -> (TempDir, LocalRepository) {
        let temp = TempDir::new().unwrap();
        let repo = LocalRepository::new(temp.path()).unwrap();
        (temp, repo)
    }

    fn key(ns: &str, id: &str) -> RecordKey {
        RecordKey::new(ns, id).unwrap()
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("10.25.1.1"), "10.25.1.1");
        assert_eq!(sanitize("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
        assert_eq!(sanitize("."), "%2E");
        assert_eq!(sanitize(".."), "%2E.");
        assert_eq!(sanitize(".5"), "%2E5");
        assert_eq!(sanitize("%2E5"), "%252E5");
        assert_eq!(sanitize("a.b."), "a.b.");
    }

    #[tokio::test]
    async fn test_dotted_segments_stay_inside_raids() {
        let (temp, repo) = open();
        let keys = [("..", "escaped"), (".", "loose"), (".hidden", "1"), ("ns", ".5")];
        for (ns, id) in keys {
            repo.create_record(NewRecord::new(json!({})).with_key(key(ns, id)))
                .await
                .unwrap();
            repo.update(ns, id, json!({"v": 2})).await.unwrap();
        }

        assert!(!temp.path().join("escaped.json").exists());
        assert!(!temp.path().join("raids/loose.json").exists());
        let mut top: Vec<String> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        top.sort();
        assert_eq!(top, vec!["raids", "servicepoints"]);
        assert!(temp.path().join("raids/%2E./escaped.json").exists());
        assert!(temp.path().join("raids/ns/%2E5.json").exists());

        let listed = repo.list(&RecordFilter::default()).await.unwrap();
        let mut found: Vec<(String, String)> = listed
            .iter()
            .map(|r| (r.namespace.clone(), r.local_id.clone()))
            .collect();
        found.sort();
        let mut expected: Vec<(String, String)> = keys
            .iter()
            .map(|(ns, id)| (ns.to_string(), id.to_string()))
            .collect();
        expected.sort();
        assert_eq!(found, expected);
        assert!(listed.iter().all(|r| r.version == 2));

        let history = repo.get_history("..", "escaped").await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_on_disk_layout() {
        let (temp, repo) = open();
        repo.create_record(NewRecord::new(json!({"v": 1})).with_key(key("10.25.1.1", "7")))
            .await
            .unwrap();
        repo.update("10.25.1.1", "7", json!({"v": 2})).await.unwrap();

        let ns = temp.path().join("raids").join("10.25.1.1");
        assert!(ns.join("7.json").exists());
        assert!(ns.join(".history").join("7").join("v1.json").exists());

        let archived: IdentifierRecord =
            serde_json::from_slice(&std::fs::read(ns.join(".history/7/v1.json")).unwrap()).unwrap();
        assert!(!archived.is_current);
        assert_eq!(archived.payload, json!({"v": 1}));

        repo.soft_delete("10.25.1.1", "7").await.unwrap();
        assert!(!ns.join("7.json").exists());
        assert!(ns.join("7.json.deleted").exists());
    }

    #[tokio::test]
    async fn test_deleted_version_reads_as_deleted() {
        let (_temp, repo) = open();
        repo.create_record(NewRecord::new(json!({})).with_key(key("ns", "1")))
            .await
            .unwrap();
        repo.soft_delete("ns", "1").await.unwrap();

        let v1 = repo.get_version("ns", "1", 1).await.unwrap();
        assert!(v1.is_deleted);

        let history = repo.get_history("ns", "1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_deleted);
    }

    #[tokio::test]
    async fn test_issuing_point_counter_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let repo = LocalRepository::new(temp.path()).unwrap();
            let a = repo
                .create_issuing_point(IssuingPoint::new("A", "10.1"))
                .await
                .unwrap();
            assert_eq!(a.id, ISSUING_POINT_ID_FLOOR + 1);

            let mut explicit = IssuingPoint::new("B", "10.2");
            explicit.id = 2000;
            repo.create_issuing_point(explicit).await.unwrap();
        }

        let repo = LocalRepository::new(temp.path()).unwrap();
        let c = repo
            .create_issuing_point(IssuingPoint::new("C", "10.3"))
            .await
            .unwrap();
        assert_eq!(c.id, 2001);
    }

    #[tokio::test]
    async fn test_corrupted_file_skipped_in_list() {
        let (temp, repo) = open();
        repo.create_record(NewRecord::new(json!({})).with_key(key("ns", "1")))
            .await
            .unwrap();
        std::fs::write(temp.path().join("raids/ns/garbage.json"), b"{not json").unwrap();

        let listed = repo.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local_id, "1");
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (temp, repo) = open();
        for i in 0..5 {
            repo.create_record(NewRecord::new(json!({"i": i})).with_key(key("ns", "x")))
                .await
                .ok();
            repo.update("ns", "x", json!({"i": i})).await.unwrap();
        }

        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("raids/ns"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    fn temp_files_under(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| {
                        let path = e.path();
                        if path.is_dir() {
                            temp_files_under(&path)
                        } else {
                            usize::from(e.file_name().to_string_lossy().ends_with(".tmp"))
                        }
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_cancelled_update_keeps_store_consistent() {
        let (temp, repo) = open();
        repo.create_record(NewRecord::new(json!({"k": 0})).with_key(key("ns", "1")))
            .await
            .unwrap();
        repo.update("ns", "1", json!({"k": 0})).await.unwrap();

        // drop updates after a growing number of polls
        for polls in 1..=40 {
            let mut update = Box::pin(repo.update("ns", "1", json!({"k": polls})));
            for _ in 0..polls {
                if futures::poll!(&mut update).is_ready() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            drop(update);
        }
        let expired = with_deadline(Duration::ZERO, repo.update("ns", "1", json!({"k": -1}))).await;
        assert!(matches!(expired, Ok(_) | Err(Error::Timeout(_))));

        let raids = temp.path().join("raids");
        for _ in 0..500 {
            if temp_files_under(&raids) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(temp_files_under(&raids), 0);

        let current = repo.get_current("ns", "1").await.unwrap();
        assert!(current.is_current);

        let history = repo.get_history("ns", "1").await.unwrap();
        let versions: Vec<u32> = history.iter().map(|r| r.version).collect();
        let expected: Vec<u32> = (1..=current.version).rev().collect();
        assert_eq!(versions, expected);
        assert!(history[0].is_current);
        assert!(history[1..].iter().all(|r| !r.is_current));

        let next = repo.update("ns", "1", json!({"k": "after"})).await.unwrap();
        assert_eq!(next.version, current.version + 1);
    }

    #[tokio::test]
    async fn test_minted_suffixes_increase() {
        let (_temp, repo) = open();
        let a = repo.generate_identifier(None).await.unwrap();
        let b = repo.generate_identifier(None).await.unwrap();

        let a: i64 = a.local_id.parse().unwrap();
        let b: i64 = b.local_id.parse().unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_health_check_leaves_no_probe() {
        let (temp, repo) = open();
        repo.health_check().await.unwrap();
        assert!(!temp.path().join(HEALTHCHECK_FILE).exists());
    }
}
