//! Typed view of the RAiD metadata document stored as a record payload.
//!
//! The storage layer keeps payloads as opaque JSON. These types are for
//! callers that build or inspect payloads; converting through them is
//! lossless for every field they declare.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaidDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DocumentMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<Identifier>,
    #[serde(default)]
    pub title: Vec<Title>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub description: Vec<Description>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<Access>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_url: Vec<AlternateUrl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributor: Vec<Contributor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organisation: Vec<Organisation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject: Vec<Subject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_raid: Vec<RelatedRaid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_object: Vec<RelatedObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_identifier: Vec<AlternateIdentifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spatial_coverage: Vec<SpatialCoverage>,
    #[serde(
        default,
        rename = "traditionalKnowledgeLabel",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub traditional_knowledge: Vec<SchemaRef>,
}

impl RaidDocument {
    /// Convert into the opaque payload form.
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Read a payload back into the typed form.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
    pub id: String,
    pub schema_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_agency: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<Owner>,
    #[serde(default, rename = "raidAgencyUrl", skip_serializing_if = "Option::is_none")]
    pub raid_agency_url: Option<String>,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    pub schema_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_point: Option<i64>,
}

/// Generic identifier/schema pair used for vocabulary terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRef {
    pub id: String,
    #[serde(default)]
    pub schema_uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Title {
    pub text: String,
    #[serde(rename = "type")]
    pub title_type: SchemaRef,
    pub start_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Description {
    pub text: String,
    #[serde(rename = "type")]
    pub description_type: SchemaRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Access {
    #[serde(rename = "type")]
    pub access_type: SchemaRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<LocalizedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embargo_expiry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedText {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternateUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributor {
    pub id: String,
    pub schema_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub position: Vec<DatedRole>,
    #[serde(default)]
    pub role: Vec<SchemaRef>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub leader: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub contact: bool,
}

/// A role or position held over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatedRole {
    pub id: String,
    pub schema_uri: String,
    pub start_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organisation {
    pub id: String,
    pub schema_uri: String,
    #[serde(default)]
    pub role: Vec<DatedRole>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub schema_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyword: Vec<LocalizedText>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedRaid {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedObject {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub object_type: Option<SchemaRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category: Vec<SchemaRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternateIdentifier {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub identifier_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialCoverage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub place: Vec<LocalizedText>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OPEN_ACCESS_TYPE;
    use proptest::prelude::*;

    fn sample() -> RaidDocument {
        RaidDocument {
            title: vec![Title {
                text: "Étude des glaciers: 氷河".to_string(),
                title_type: SchemaRef {
                    id: "https://vocabulary.raid.org/title.type.schema/5".to_string(),
                    schema_uri: "https://vocabulary.raid.org/title.type.schema/376".to_string(),
                },
                start_date: "2024-01-01".to_string(),
                end_date: None,
                language: None,
            }],
            date: Some(DateRange {
                start_date: "2024-01-01".to_string(),
                end_date: Some("2026-12-31".to_string()),
            }),
            access: Some(Access {
                access_type: SchemaRef {
                    id: OPEN_ACCESS_TYPE.to_string(),
                    schema_uri: "https://vocabulary.raid.org/access.type.schema/1".to_string(),
                },
                statement: None,
                embargo_expiry: None,
            }),
            contributor: vec![Contributor {
                id: "https://orcid.org/0000-0002-1825-0097".to_string(),
                schema_uri: "https://orcid.org/".to_string(),
                status: None,
                email: None,
                position: vec![],
                role: vec![],
                leader: true,
                contact: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_absent_fields_stay_absent() {
        let payload = sample().to_payload().unwrap();
        assert!(payload.get("description").is_none());
        assert!(payload["title"][0].get("endDate").is_none());
        assert!(payload["contributor"][0].get("contact").is_none());
        assert_eq!(payload["contributor"][0]["leader"], true);
    }

    #[test]
    fn test_payload_roundtrip() {
        let doc = sample();
        let back = RaidDocument::from_payload(&doc.to_payload().unwrap()).unwrap();
        assert_eq!(back, doc);
    }

    proptest! {
        #[test]
        fn roundtrip_through_text(
            titles in proptest::collection::vec(("\\PC*", proptest::option::of("[0-9]{4}-[0-9]{2}-[0-9]{2}")), 0..4),
            orgs in proptest::collection::vec("\\PC{1,20}", 0..3),
        ) {
            let doc = RaidDocument {
                title: titles
                    .into_iter()
                    .map(|(text, end_date)| Title {
                        text,
                        title_type: SchemaRef { id: "t".into(), schema_uri: "s".into() },
                        start_date: "2020-01-01".into(),
                        end_date,
                        language: None,
                    })
                    .collect(),
                organisation: orgs
                    .into_iter()
                    .map(|id| Organisation { id, schema_uri: "https://ror.org/".into(), role: vec![] })
                    .collect(),
                ..Default::default()
            };

            let text = serde_json::to_string(&doc.to_payload().unwrap()).unwrap();
            let payload: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(RaidDocument::from_payload(&payload).unwrap(), doc);
        }
    }
}
