//! SQL text and parameter building.

use serde_json::{json, Value};
use tokio_postgres::types::ToSql;

use raidstore_common::{RecordFilter, OPEN_ACCESS_TYPE};

pub const RECORD_COLUMNS: &str =
    "namespace, local_id, version, is_current, is_deleted, data, created_at, updated_at";

/// Boxed query parameter that can cross an await point.
pub type Param = Box<dyn ToSql + Sync + Send>;

/// A listing query with its bound parameters.
pub struct ListQuery {
    pub sql: String,
    pub params: Vec<Param>,
}

impl ListQuery {
    /// Build the listing statement for `filter`.
    ///
    /// Membership filters become JSONB containment predicates and every
    /// caller-supplied value is a bound parameter.
    pub fn build(filter: &RecordFilter, public_only: bool) -> Self {
        let mut sql = format!(
            "SELECT {} FROM identifier_records WHERE is_current AND NOT is_deleted",
            RECORD_COLUMNS
        );
        let mut params: Vec<Param> = Vec::new();

        if let Some(id) = &filter.contributor_id {
            params.push(Box::new(membership(id)));
            sql.push_str(&format!(" AND data->'contributor' @> ${}::JSONB", params.len()));
        }
        if let Some(id) = &filter.organisation_id {
            params.push(Box::new(membership(id)));
            sql.push_str(&format!(" AND data->'organisation' @> ${}::JSONB", params.len()));
        }
        if public_only {
            params.push(Box::new(OPEN_ACCESS_TYPE.to_string()));
            sql.push_str(&format!(
                " AND data->'access'->'type'->>'id' = ${}",
                params.len()
            ));
        }

        sql.push_str(" ORDER BY namespace, local_id");

        if let Some(limit) = filter.limit {
            params.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ${}", params.len()));
        }
        if filter.offset > 0 {
            params.push(Box::new(i64::try_from(filter.offset).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" OFFSET ${}", params.len()));
        }

        Self { sql, params }
    }

    /// Parameters in the form the client expects.
    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

/// Containment document matching an array entry with this id.
fn membership(id: &str) -> Value {
    json!([{ "id": id }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unfiltered_listing() {
        let query = ListQuery::build(&RecordFilter::default(), false);
        assert!(query.sql.ends_with("ORDER BY namespace, local_id"));
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_placeholders_are_numbered_in_order() {
        let filter = RecordFilter {
            contributor_id: Some("https://orcid.org/0000-0001".into()),
            organisation_id: Some("https://ror.org/abc".into()),
            limit: Some(10),
            offset: 20,
        };
        let query = ListQuery::build(&filter, true);

        assert!(query.sql.contains("data->'contributor' @> $1::JSONB"));
        assert!(query.sql.contains("data->'organisation' @> $2::JSONB"));
        assert!(query.sql.contains("->>'id' = $3"));
        assert!(query.sql.contains("LIMIT $4 OFFSET $5"));
        assert_eq!(query.param_refs().len(), 5);
    }

    #[test]
    fn test_values_never_inlined() {
        let filter = RecordFilter {
            contributor_id: Some("x'); DROP TABLE identifier_records; --".into()),
            ..Default::default()
        };
        let query = ListQuery::build(&filter, false);
        assert!(!query.sql.contains("DROP"));
    }
}
