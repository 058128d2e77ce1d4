//! Table definitions, created at connect when absent.

/// Schema DDL. Safe to run repeatedly.
///
/// The unique partial index on current rows makes two racing creates of the
/// same pair collide instead of both inserting version 1.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS identifier_records (
    namespace   STRING      NOT NULL,
    local_id    STRING      NOT NULL,
    version     INT8        NOT NULL,
    is_current  BOOL        NOT NULL DEFAULT true,
    is_deleted  BOOL        NOT NULL DEFAULT false,
    data        JSONB       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (namespace, local_id, version),
    UNIQUE INDEX identifier_records_current_idx (namespace, local_id) WHERE is_current,
    INVERTED INDEX identifier_records_data_idx (data)
);

CREATE TABLE IF NOT EXISTS issuing_points (
    id          INT8        PRIMARY KEY,
    data        JSONB       NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS id_counters (
    name        STRING      PRIMARY KEY,
    value       INT8        NOT NULL
);
"#;

/// Counter row holding the last assigned issuing point id.
pub const ISSUING_POINT_COUNTER: &str = "issuing_point_id";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent_ddl() {
        let creates = SCHEMA.matches("CREATE TABLE").count();
        let guarded = SCHEMA.matches("CREATE TABLE IF NOT EXISTS").count();
        assert_eq!(creates, 3);
        assert_eq!(creates, guarded);
    }
}
