//! Git overlay for the local filesystem backend.
//!
//! Every successful mutation is followed by `git add -A` and a commit in the
//! data directory, giving an external audit trail. A failed commit never
//! fails the storage operation; it is logged and dropped.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::GitConfig;
use crate::local::{sanitize, LocalRepository};
use crate::repository::Repository;
use raidstore_common::{
    Error, IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, Result,
};

const LOG_FORMAT: &str = "--pretty=format:%H|%an|%ae|%at|%s";

/// One commit touching a record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub hash: String,
    pub author: String,
    pub email: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl ChangeLogEntry {
    /// Parse one `hash|author|email|unix-seconds|subject` line.
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.splitn(5, '|');
        let hash = parts.next()?.to_string();
        let author = parts.next()?.to_string();
        let email = parts.next()?.to_string();
        let seconds: i64 = parts.next()?.parse().ok()?;
        let message = parts.next()?.to_string();
        Some(Self {
            hash,
            author,
            email,
            timestamp: Utc.timestamp_opt(seconds, 0).single()?,
            message,
        })
    }
}

/// File repository whose mutations are committed to a git repository.
pub struct GitRepository {
    inner: LocalRepository,
    auto_commit: bool,
    author_name: String,
    author_email: String,
    commit_lock: Mutex<()>,
}

impl GitRepository {
    /// Open the file store and prepare its git repository.
    ///
    /// # Postconditions
    /// - With `auto_commit`, the data directory is a git work tree with at
    ///   least one commit
    ///
    /// # Errors
    /// - git is not installed (only checked with `auto_commit`)
    /// - The data directory cannot be created
    pub async fn new(config: GitConfig) -> Result<Self> {
        let inner = LocalRepository::new(&config.data_dir)?;
        let repo = Self {
            inner,
            auto_commit: config.auto_commit,
            author_name: config.author_name,
            author_email: config.author_email,
            commit_lock: Mutex::new(()),
        };

        if repo.auto_commit {
            repo.init_repo().await?;
        }
        Ok(repo)
    }

    /// Commits that touched a record's current file, newest first.
    ///
    /// # Errors
    /// - Commits are disabled for this store
    /// - `git log` fails
    pub async fn change_log(&self, namespace: &str, local_id: &str) -> Result<Vec<ChangeLogEntry>> {
        if !self.auto_commit {
            return Err(Error::InvalidInput(
                "Change log requires auto_commit".to_string(),
            ));
        }

        let relative = Path::new("raids")
            .join(sanitize(namespace))
            .join(format!("{}.json", sanitize(local_id)));
        let relative = relative.to_string_lossy().into_owned();

        let output = self.git(&["log", LOG_FORMAT, "--", &relative]).await?;
        Ok(output.lines().filter_map(ChangeLogEntry::parse).collect())
    }

    async fn init_repo(&self) -> Result<()> {
        Command::new("git")
            .arg("--version")
            .output()
            .await
            .map_err(|e| Error::Storage(format!("git not found: {}", e)))?;

        if self.git(&["rev-parse", "--git-dir"]).await.is_ok() {
            debug!(data_dir = %self.inner.data_dir().display(), "Using existing git repository");
            return Ok(());
        }

        self.git(&["init"]).await?;
        self.git(&["commit", "--allow-empty", "-m", "Initial commit"])
            .await?;
        info!(data_dir = %self.inner.data_dir().display(), "Initialized git repository");
        Ok(())
    }

    /// Run git in the data directory with the configured identity.
    async fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(self.inner.data_dir())
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            return Err(Error::Storage(format!(
                "git {} failed: {}{}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim(),
                String::from_utf8_lossy(&output.stdout).trim(),
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Stage everything and commit. Failures are logged, never returned.
    async fn commit(&self, message: &str) {
        if !self.auto_commit {
            return;
        }

        let _guard = self.commit_lock.lock().await;
        if let Err(e) = self.git(&["add", "-A"]).await {
            warn!(error = %e, message, "git add failed");
            return;
        }
        match self.git(&["commit", "-m", message]).await {
            Ok(_) => debug!(message, "Committed change"),
            Err(e) if e.to_string().contains("nothing to commit") => {}
            Err(e) => warn!(error = %e, message, "git commit failed"),
        }
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn name(&self) -> &str {
        "file-git"
    }

    async fn create_record(&self, new: NewRecord) -> Result<IdentifierRecord> {
        let record = self.inner.create_record(new).await?;
        self.commit(&format!("Create RAiD {}/{}", record.namespace, record.local_id))
            .await;
        Ok(record)
    }

    async fn get_current(&self, namespace: &str, local_id: &str) -> Result<IdentifierRecord> {
        self.inner.get_current(namespace, local_id).await
    }

    async fn get_version(
        &self,
        namespace: &str,
        local_id: &str,
        version: u32,
    ) -> Result<IdentifierRecord> {
        self.inner.get_version(namespace, local_id, version).await
    }

    async fn update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: Value,
    ) -> Result<IdentifierRecord> {
        let record = self.inner.update(namespace, local_id, payload).await?;
        self.commit(&format!(
            "Update RAiD {}/{} to version {}",
            namespace, local_id, record.version
        ))
        .await;
        Ok(record)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        self.inner.list(filter).await
    }

    async fn list_public(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        self.inner.list_public(filter).await
    }

    async fn get_history(&self, namespace: &str, local_id: &str) -> Result<Vec<IdentifierRecord>> {
        self.inner.get_history(namespace, local_id).await
    }

    async fn soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        self.inner.soft_delete(namespace, local_id).await?;
        self.commit(&format!("Delete RAiD {}/{}", namespace, local_id))
            .await;
        Ok(())
    }

    async fn generate_identifier(&self, issuing_point: Option<i64>) -> Result<RecordKey> {
        self.inner.generate_identifier(issuing_point).await
    }

    async fn create_issuing_point(&self, issuing_point: IssuingPoint) -> Result<IssuingPoint> {
        let created = self.inner.create_issuing_point(issuing_point).await?;
        self.commit(&format!(
            "Create service point {} ({})",
            created.id, created.name
        ))
        .await;
        Ok(created)
    }

    async fn get_issuing_point(&self, id: i64) -> Result<IssuingPoint> {
        self.inner.get_issuing_point(id).await
    }

    async fn update_issuing_point(
        &self,
        id: i64,
        issuing_point: IssuingPoint,
    ) -> Result<IssuingPoint> {
        let updated = self.inner.update_issuing_point(id, issuing_point).await?;
        self.commit(&format!("Update service point {} ({})", id, updated.name))
            .await;
        Ok(updated)
    }

    async fn list_issuing_points(&self) -> Result<Vec<IssuingPoint>> {
        self.inner.list_issuing_points().await
    }

    async fn delete_issuing_point(&self, id: i64) -> Result<()> {
        self.inner.delete_issuing_point(id).await?;
        self.commit(&format!("Delete service point {}", id)).await;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn config(dir: &Path) -> GitConfig {
        GitConfig {
            data_dir: dir.to_path_buf(),
            ..GitConfig::default()
        }
    }

    #[test]
    fn test_parse_log_line() {
        let entry =
            ChangeLogEntry::parse("abc123|RAiD System|raid@example.org|1700000000|Delete RAiD a|b")
                .unwrap();
        assert_eq!(entry.hash, "abc123");
        assert_eq!(entry.email, "raid@example.org");
        assert_eq!(entry.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(entry.message, "Delete RAiD a|b");

        assert!(ChangeLogEntry::parse("garbage").is_none());
        assert!(ChangeLogEntry::parse("h|a|e|notanumber|m").is_none());
    }

    #[tokio::test]
    async fn test_change_log_tracks_mutations() {
        if !git_available() {
            eprintln!("git not installed, skipping");
            return;
        }
        let temp = TempDir::new().unwrap();
        let repo = GitRepository::new(config(temp.path())).await.unwrap();
        let key = RecordKey::new("10.25.1.1", "42").unwrap();

        repo.create_record(NewRecord::new(json!({"v": 1})).with_key(key.clone()))
            .await
            .unwrap();
        repo.update("10.25.1.1", "42", json!({"v": 2})).await.unwrap();

        let log = repo.change_log("10.25.1.1", "42").await.unwrap();
        let messages: Vec<_> = log.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec!["Update RAiD 10.25.1.1/42 to version 2", "Create RAiD 10.25.1.1/42"]
        );
        assert!(log.iter().all(|e| e.author == "RAiD System"));
    }

    #[tokio::test]
    async fn test_reopen_existing_repository() {
        if !git_available() {
            return;
        }
        let temp = TempDir::new().unwrap();
        {
            let repo = GitRepository::new(config(temp.path())).await.unwrap();
            repo.create_issuing_point(IssuingPoint::new("Lab", "10.9"))
                .await
                .unwrap();
        }

        let repo = GitRepository::new(config(temp.path())).await.unwrap();
        assert_eq!(repo.list_issuing_points().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_commits() {
        let temp = TempDir::new().unwrap();
        let repo = GitRepository::new(GitConfig {
            auto_commit: false,
            ..config(temp.path())
        })
        .await
        .unwrap();

        repo.create_record(NewRecord::new(json!({})))
            .await
            .unwrap();
        assert!(!temp.path().join(".git").exists());
        assert!(repo.change_log("10.25.1.1", "1").await.is_err());
    }
}
