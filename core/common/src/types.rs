//! Record model shared by every storage backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{Error, Result};

/// Namespace used when a record is minted without an owning issuing point.
pub const DEFAULT_NAMESPACE: &str = "10.25.1.1";

/// Access type id that marks a record as publicly readable.
pub const OPEN_ACCESS_TYPE: &str = "https://vocabulary.raid.org/access.type.schema/82";

/// Auto-assigned issuing point ids start strictly above this value.
pub const ISSUING_POINT_ID_FLOOR: i64 = 1000;

/// Base of the resolvable handle URL for an identifier.
pub const HANDLE_BASE: &str = "https://raid.org";

/// The `(namespace, local_id)` pair naming one identifier across all versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub namespace: String,
    pub local_id: String,
}

impl RecordKey {
    /// Create a key from its two segments.
    ///
    /// # Errors
    /// - Either segment is empty
    pub fn new(namespace: impl Into<String>, local_id: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let local_id = local_id.into();
        if namespace.is_empty() || local_id.is_empty() {
            return Err(Error::InvalidInput(
                "Namespace and local id must be non-empty".to_string(),
            ));
        }
        Ok(Self {
            namespace,
            local_id,
        })
    }

    /// Parse a handle of the form `https://raid.org/{namespace}/{local_id}`.
    pub fn from_handle(handle: &str) -> Result<Self> {
        let rest = handle
            .strip_prefix(HANDLE_BASE)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| Error::InvalidInput(format!("Invalid handle: {}", handle)))?;
        let (namespace, local_id) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidInput(format!("Invalid handle: {}", handle)))?;
        Self::new(namespace, local_id.trim_end_matches('/'))
    }

    /// Render the resolvable handle URL.
    pub fn handle(&self) -> String {
        format!("{}/{}/{}", HANDLE_BASE, self.namespace, self.local_id)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.local_id)
    }
}

/// One immutable version of an identifier record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifierRecord {
    pub namespace: String,
    pub local_id: String,
    pub version: u32,
    pub is_current: bool,
    pub is_deleted: bool,
    /// Full domain metadata. Storage reads only the access and membership fields.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdentifierRecord {
    /// Build version 1 of a new record.
    pub fn first_version(key: RecordKey, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            namespace: key.namespace,
            local_id: key.local_id,
            version: 1,
            is_current: true,
            is_deleted: false,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the version that supersedes `self`.
    ///
    /// `created_at` is carried forward; `updated_at` is `now`.
    pub fn next_version(&self, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            local_id: self.local_id.clone(),
            version: self.version + 1,
            is_current: true,
            is_deleted: false,
            payload,
            created_at: self.created_at,
            updated_at: now,
        }
    }

    /// The `(namespace, local_id)` this version belongs to.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            namespace: self.namespace.clone(),
            local_id: self.local_id.clone(),
        }
    }

    /// The `access.type.id` field of the payload, if present.
    pub fn access_type_id(&self) -> Option<&str> {
        self.payload
            .get("access")
            .and_then(|a| a.get("type"))
            .and_then(|t| t.get("id"))
            .and_then(Value::as_str)
    }

    /// Whether the payload grants open access.
    pub fn is_public(&self) -> bool {
        self.access_type_id() == Some(OPEN_ACCESS_TYPE)
    }
}

/// Request to register a new identifier.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub payload: Value,
    /// Issuing point whose namespace a minted identifier uses.
    pub issuing_point: Option<i64>,
    /// Pre-assigned identifier; minting is skipped when set.
    pub key: Option<RecordKey>,
}

impl NewRecord {
    /// A record to be minted under the default namespace.
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            issuing_point: None,
            key: None,
        }
    }

    /// Mint under the given issuing point.
    pub fn with_issuing_point(mut self, id: i64) -> Self {
        self.issuing_point = Some(id);
        self
    }

    /// Register under an explicit identifier.
    pub fn with_key(mut self, key: RecordKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// Filter and pagination options for listing current records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    /// Keep records listing this contributor id.
    pub contributor_id: Option<String>,
    /// Keep records listing this organisation id.
    pub organisation_id: Option<String>,
    /// Maximum number of results; `None` is unlimited.
    pub limit: Option<usize>,
    /// Number of matching results to skip.
    pub offset: usize,
}

impl RecordFilter {
    /// Check the membership predicates against a payload.
    pub fn matches(&self, payload: &Value) -> bool {
        if let Some(id) = &self.contributor_id {
            if !has_member(payload, "contributor", id) {
                return false;
            }
        }
        if let Some(id) = &self.organisation_id {
            if !has_member(payload, "organisation", id) {
                return false;
            }
        }
        true
    }

    /// Apply offset then limit to an already-filtered, ordered result set.
    pub fn paginate<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

fn has_member(payload: &Value, field: &str, id: &str) -> bool {
    payload
        .get(field)
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .any(|e| e.get("id").and_then(Value::as_str) == Some(id))
        })
        .unwrap_or(false)
}

/// A tenant authority that owns a namespace and mints identifiers under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuingPoint {
    /// `0` asks the backend to assign one.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub identifier_owner: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository_id: String,
    /// Namespace used for identifiers minted under this issuing point.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub search_content: String,
    #[serde(default)]
    pub tech_email: String,
    #[serde(default)]
    pub admin_email: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub app_writes_enabled: bool,
}

impl IssuingPoint {
    /// Id value meaning "assign one for me".
    pub const UNASSIGNED: i64 = 0;

    /// Create an enabled issuing point with an unassigned id.
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            id: Self::UNASSIGNED,
            name: name.into(),
            identifier_owner: String::new(),
            repository_id: String::new(),
            prefix: prefix.into(),
            group_id: String::new(),
            search_content: String::new(),
            tech_email: String::new(),
            admin_email: String::new(),
            enabled: true,
            app_writes_enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handle_roundtrip() {
        let key = RecordKey::new("10.25.1.1", "42").unwrap();
        assert_eq!(key.handle(), "https://raid.org/10.25.1.1/42");
        assert_eq!(RecordKey::from_handle(&key.handle()).unwrap(), key);
    }

    #[test]
    fn test_handle_rejects_foreign_urls() {
        assert!(RecordKey::from_handle("https://example.org/10.25.1.1/42").is_err());
        assert!(RecordKey::from_handle("https://raid.org/only-prefix").is_err());
    }

    #[test]
    fn test_empty_key_segments_rejected() {
        assert!(RecordKey::new("", "1").is_err());
        assert!(RecordKey::new("10.1", "").is_err());
    }

    #[test]
    fn test_next_version_carries_created_at() {
        let t0 = Utc::now();
        let v1 = IdentifierRecord::first_version(
            RecordKey::new("ns", "1").unwrap(),
            json!({"a": 1}),
            t0,
        );
        let t1 = t0 + chrono::Duration::seconds(5);
        let v2 = v1.next_version(json!({"a": 2}), t1);

        assert_eq!(v2.version, 2);
        assert_eq!(v2.created_at, t0);
        assert_eq!(v2.updated_at, t1);
        assert!(v2.is_current);
    }

    #[test]
    fn test_public_detection() {
        let mut record = IdentifierRecord::first_version(
            RecordKey::new("ns", "1").unwrap(),
            json!({"access": {"type": {"id": OPEN_ACCESS_TYPE}}}),
            Utc::now(),
        );
        assert!(record.is_public());

        record.payload = json!({"access": {"type": {"id": "embargoed"}}});
        assert!(!record.is_public());

        record.payload = json!({});
        assert!(!record.is_public());
    }

    #[test]
    fn test_filter_membership() {
        let payload = json!({
            "contributor": [{"id": "https://orcid.org/0000-0001"}],
            "organisation": [{"id": "https://ror.org/abc"}]
        });

        let mut filter = RecordFilter {
            contributor_id: Some("https://orcid.org/0000-0001".into()),
            ..Default::default()
        };
        assert!(filter.matches(&payload));

        filter.organisation_id = Some("https://ror.org/other".into());
        assert!(!filter.matches(&payload));

        assert!(RecordFilter::default().matches(&json!({})));
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..10).collect();
        let filter = RecordFilter {
            offset: 3,
            limit: Some(4),
            ..Default::default()
        };
        assert_eq!(filter.paginate(items.clone()), vec![3, 4, 5, 6]);

        let past_end = RecordFilter {
            offset: 20,
            ..Default::default()
        };
        assert!(past_end.paginate(items).is_empty());
    }

    #[test]
    fn test_issuing_point_serialization_skips_empty() {
        let sp = IssuingPoint::new("Test", "10.25.1.1");
        let json = serde_json::to_value(&sp).unwrap();
        assert_eq!(json["prefix"], "10.25.1.1");
        assert!(json.get("groupId").is_none());

        let back: IssuingPoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, sp);
    }
}
