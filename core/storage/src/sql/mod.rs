//! Distributed SQL backend for CockroachDB.
//!
//! Connections come from a `deadpool-postgres` pool. Each mutation is one
//! serializable transaction; CockroachDB aborts a loser of a write race with
//! SQLSTATE 40001, which is re-run by the conflict retry runner.

pub mod query;
pub mod schema;
pub mod tls;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use crate::config::{SqlConfig, SslMode};
use crate::minting::{self, Minter};
use crate::repository::Repository;
use crate::retry::{ConflictRetry, RetryConfig};
use query::{ListQuery, RECORD_COLUMNS};
use raidstore_common::{
    Error, IdentifierRecord, IssuingPoint, NewRecord, RecordFilter, RecordKey, Result,
    ISSUING_POINT_ID_FLOOR,
};

/// Current time at the column precision of TIMESTAMPTZ.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Map a database error onto the contract taxonomy.
pub fn db_error(err: tokio_postgres::Error) -> Error {
    let message = match err.as_db_error() {
        Some(db) => db.to_string(),
        None => err.to_string(),
    };
    match err.code() {
        Some(code) if *code == SqlState::T_R_SERIALIZATION_FAILURE => Error::Conflict(message),
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => Error::AlreadyExists(message),
        _ => Error::Storage(message),
    }
}

/// Map a pool checkout error.
pub fn pool_error(err: PoolError) -> Error {
    match err {
        PoolError::Backend(e) => db_error(e),
        other => Error::Storage(format!("Connection pool: {}", other)),
    }
}

fn record_from_row(row: &Row) -> Result<IdentifierRecord> {
    let version: i64 = row.try_get("version").map_err(db_error)?;
    Ok(IdentifierRecord {
        namespace: row.try_get("namespace").map_err(db_error)?,
        local_id: row.try_get("local_id").map_err(db_error)?,
        version: u32::try_from(version)
            .map_err(|_| Error::Storage(format!("Version {} out of range", version)))?,
        is_current: row.try_get("is_current").map_err(db_error)?,
        is_deleted: row.try_get("is_deleted").map_err(db_error)?,
        payload: row.try_get("data").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn issuing_point_from_row(row: &Row) -> Result<IssuingPoint> {
    let data: Value = row.try_get("data").map_err(db_error)?;
    Ok(serde_json::from_value(data)?)
}

fn pg_config(config: &SqlConfig) -> Result<tokio_postgres::Config> {
    if let Some(url) = &config.url {
        return url
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::InvalidInput(format!("Invalid url: {}", e)));
    }

    let mut pg = tokio_postgres::Config::new();
    pg.host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.user)
        .application_name("raidstore")
        .ssl_mode(match config.sslmode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            _ => tokio_postgres::config::SslMode::Require,
        });
    if let Some(password) = &config.password {
        pg.password(password);
    }
    Ok(pg)
}

/// TLS mode the connection will actually negotiate.
///
/// A url carries its own `sslmode`, which wins over the discrete field.
/// libpq's default `prefer` only turns TLS on when a root certificate is
/// configured; without one it connects in plaintext. Any mode that enables
/// TLS is forced to `require` on `pg` so a failed handshake never falls back.
fn effective_sslmode(config: &SqlConfig, pg: &mut tokio_postgres::Config) -> SslMode {
    use tokio_postgres::config::SslMode as PgSslMode;

    let mode = if config.url.is_none() {
        config.sslmode
    } else {
        match pg.get_ssl_mode() {
            PgSslMode::Disable => SslMode::Disable,
            PgSslMode::Prefer if config.sslroot.is_none() => SslMode::Disable,
            _ if config.sslmode == SslMode::Disable => SslMode::Require,
            _ => config.sslmode,
        }
    };
    pg.ssl_mode(match mode {
        SslMode::Disable => PgSslMode::Disable,
        _ => PgSslMode::Require,
    });
    mode
}

/// CockroachDB repository.
pub struct SqlRepository {
    pool: Pool,
    retry: ConflictRetry,
}

impl SqlRepository {
    /// Connect, verify the connection, and create the schema if absent.
    ///
    /// # Errors
    /// - Invalid connection or TLS settings
    /// - Database unreachable
    pub async fn connect(config: SqlConfig) -> Result<Self> {
        let mut pg = pg_config(&config)?;
        let sslmode = effective_sslmode(&config, &mut pg);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = match tls::connector(&config, sslmode)? {
            Some(tls) => Manager::from_config(pg, tls, manager_config),
            None => Manager::from_config(pg, NoTls, manager_config),
        };
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| Error::Storage(format!("Failed to build connection pool: {}", e)))?;

        let repo = Self {
            pool,
            retry: ConflictRetry::new(RetryConfig::new(config.max_retries)),
        };

        let client = repo.client().await?;
        client.batch_execute(schema::SCHEMA).await.map_err(db_error)?;
        info!(
            host = %config.host,
            database = %config.database,
            pool_size = config.pool_size,
            sslmode = ?sslmode,
            "Connected to CockroachDB"
        );
        Ok(repo)
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(pool_error)
    }

    async fn try_create(&self, key: &RecordKey, payload: &Value) -> Result<IdentifierRecord> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;

        let exists: bool = tx
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM identifier_records \
                 WHERE namespace = $1 AND local_id = $2 AND is_current)",
                &[&key.namespace, &key.local_id],
            )
            .await
            .map_err(db_error)?
            .get(0);
        if exists {
            return Err(Error::AlreadyExists(format!("Record {}", key)));
        }

        let record = IdentifierRecord::first_version(key.clone(), payload.clone(), now());
        tx.execute(
            "INSERT INTO identifier_records \
             (namespace, local_id, version, is_current, is_deleted, data, created_at, updated_at) \
             VALUES ($1, $2, 1, true, false, $3, $4, $5)",
            &[
                &record.namespace,
                &record.local_id,
                &record.payload,
                &record.created_at,
                &record.updated_at,
            ],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(record)
    }

    async fn try_update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: &Value,
    ) -> Result<IdentifierRecord> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;

        let row = tx
            .query_opt(
                &format!(
                    "SELECT {} FROM identifier_records \
                     WHERE namespace = $1 AND local_id = $2 AND is_current FOR UPDATE",
                    RECORD_COLUMNS
                ),
                &[&namespace, &local_id],
            )
            .await
            .map_err(db_error)?;
        let current = match row {
            Some(row) => record_from_row(&row)?,
            None => return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id))),
        };
        if current.is_deleted {
            return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id)));
        }

        tx.execute(
            "UPDATE identifier_records SET is_current = false \
             WHERE namespace = $1 AND local_id = $2 AND version = $3",
            &[&namespace, &local_id, &i64::from(current.version)],
        )
        .await
        .map_err(db_error)?;

        let next = current.next_version(payload.clone(), now());
        tx.execute(
            "INSERT INTO identifier_records \
             (namespace, local_id, version, is_current, is_deleted, data, created_at, updated_at) \
             VALUES ($1, $2, $3, true, false, $4, $5, $6)",
            &[
                &namespace,
                &local_id,
                &i64::from(next.version),
                &next.payload,
                &next.created_at,
                &next.updated_at,
            ],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(next)
    }

    async fn try_soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        let client = self.client().await?;
        let affected = client
            .execute(
                "UPDATE identifier_records SET is_deleted = true \
                 WHERE namespace = $1 AND local_id = $2 AND is_current AND NOT is_deleted",
                &[&namespace, &local_id],
            )
            .await
            .map_err(db_error)?;
        if affected == 0 {
            return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id)));
        }
        Ok(())
    }

    async fn try_next_counter(&self, name: &str, initial: i64) -> Result<i64> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;

        tx.execute(
            "INSERT INTO id_counters (name, value) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
            &[&name, &initial],
        )
        .await
        .map_err(db_error)?;
        let value: i64 = tx
            .query_one(
                "UPDATE id_counters SET value = value + 1 WHERE name = $1 RETURNING value",
                &[&name],
            )
            .await
            .map_err(db_error)?
            .get(0);

        tx.commit().await.map_err(db_error)?;
        Ok(value)
    }

    async fn try_create_issuing_point(&self, issuing_point: &IssuingPoint) -> Result<IssuingPoint> {
        let mut issuing_point = issuing_point.clone();
        if issuing_point.id == IssuingPoint::UNASSIGNED {
            issuing_point.id = self
                .try_next_counter(schema::ISSUING_POINT_COUNTER, ISSUING_POINT_ID_FLOOR)
                .await?;
        }

        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;

        let exists: bool = tx
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM issuing_points WHERE id = $1)",
                &[&issuing_point.id],
            )
            .await
            .map_err(db_error)?
            .get(0);
        if exists {
            return Err(Error::AlreadyExists(format!(
                "Issuing point {}",
                issuing_point.id
            )));
        }

        let data = serde_json::to_value(&issuing_point)?;
        tx.execute(
            "INSERT INTO issuing_points (id, data) VALUES ($1, $2)",
            &[&issuing_point.id, &data],
        )
        .await
        .map_err(db_error)?;
        tx.execute(
            "INSERT INTO id_counters (name, value) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET value = GREATEST(id_counters.value, excluded.value)",
            &[&schema::ISSUING_POINT_COUNTER, &issuing_point.id],
        )
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(issuing_point)
    }
}

#[async_trait]
impl Minter for SqlRepository {
    async fn issuing_point_prefix(&self, issuing_point: i64) -> Result<String> {
        Ok(self.get_issuing_point(issuing_point).await?.prefix)
    }

    async fn next_local_id(&self, namespace: &str) -> Result<String> {
        let name = minting::record_counter_name(namespace);
        let name = name.as_str();
        let value = self.retry.run(move || self.try_next_counter(name, 0)).await?;
        Ok(value.to_string())
    }
}

#[async_trait]
impl Repository for SqlRepository {
    fn name(&self) -> &str {
        "cockroach"
    }

    async fn create_record(&self, new: NewRecord) -> Result<IdentifierRecord> {
        let key = match new.key {
            Some(key) => key,
            None => minting::mint(self, new.issuing_point).await?,
        };

        let (key_ref, payload) = (&key, &new.payload);
        let record = self.retry.run(move || self.try_create(key_ref, payload)).await?;

        info!(namespace = %record.namespace, local_id = %record.local_id, "Created record");
        Ok(record)
    }

    async fn get_current(&self, namespace: &str, local_id: &str) -> Result<IdentifierRecord> {
        debug!(namespace, local_id, "Reading current record");
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM identifier_records \
                     WHERE namespace = $1 AND local_id = $2 AND is_current AND NOT is_deleted",
                    RECORD_COLUMNS
                ),
                &[&namespace, &local_id],
            )
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(Error::NotFound(format!("Record {}/{}", namespace, local_id))),
        }
    }

    async fn get_version(
        &self,
        namespace: &str,
        local_id: &str,
        version: u32,
    ) -> Result<IdentifierRecord> {
        debug!(namespace, local_id, version, "Reading record version");
        let client = self.client().await?;
        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM identifier_records \
                     WHERE namespace = $1 AND local_id = $2 AND version = $3",
                    RECORD_COLUMNS
                ),
                &[&namespace, &local_id, &i64::from(version)],
            )
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(Error::NotFound(format!(
                "Record {}/{} version {}",
                namespace, local_id, version
            ))),
        }
    }

    async fn update(
        &self,
        namespace: &str,
        local_id: &str,
        payload: Value,
    ) -> Result<IdentifierRecord> {
        let payload = &payload;
        let record = self
            .retry
            .run(move || self.try_update(namespace, local_id, payload))
            .await?;

        info!(namespace, local_id, version = record.version, "Updated record");
        Ok(record)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let query = ListQuery::build(filter, false);
        let client = self.client().await?;
        let rows = client
            .query(&query.sql, &query.param_refs())
            .await
            .map_err(db_error)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_public(&self, filter: &RecordFilter) -> Result<Vec<IdentifierRecord>> {
        let query = ListQuery::build(filter, true);
        let client = self.client().await?;
        let rows = client
            .query(&query.sql, &query.param_refs())
            .await
            .map_err(db_error)?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get_history(&self, namespace: &str, local_id: &str) -> Result<Vec<IdentifierRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM identifier_records \
                     WHERE namespace = $1 AND local_id = $2 ORDER BY version DESC",
                    RECORD_COLUMNS
                ),
                &[&namespace, &local_id],
            )
            .await
            .map_err(db_error)?;

        if rows.is_empty() {
            return Err(Error::NotFound(format!("Record {}/{}", namespace, local_id)));
        }
        rows.iter().map(record_from_row).collect()
    }

    async fn soft_delete(&self, namespace: &str, local_id: &str) -> Result<()> {
        self.retry
            .run(move || self.try_soft_delete(namespace, local_id))
            .await?;
        info!(namespace, local_id, "Soft-deleted record");
        Ok(())
    }

    async fn generate_identifier(&self, issuing_point: Option<i64>) -> Result<RecordKey> {
        minting::mint(self, issuing_point).await
    }

    async fn create_issuing_point(&self, issuing_point: IssuingPoint) -> Result<IssuingPoint> {
        let requested = &issuing_point;
        let created = self
            .retry
            .run(move || self.try_create_issuing_point(requested))
            .await?;

        info!(id = created.id, name = %created.name, "Created issuing point");
        Ok(created)
    }

    async fn get_issuing_point(&self, id: i64) -> Result<IssuingPoint> {
        let client = self.client().await?;
        let row = client
            .query_opt("SELECT data FROM issuing_points WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => issuing_point_from_row(&row),
            None => Err(Error::NotFound(format!("Issuing point {}", id))),
        }
    }

    async fn update_issuing_point(
        &self,
        id: i64,
        mut issuing_point: IssuingPoint,
    ) -> Result<IssuingPoint> {
        issuing_point.id = id;
        let data = serde_json::to_value(&issuing_point)?;

        let client = self.client().await?;
        let affected = client
            .execute(
                "UPDATE issuing_points SET data = $1, updated_at = now() WHERE id = $2",
                &[&data, &id],
            )
            .await
            .map_err(db_error)?;
        if affected == 0 {
            return Err(Error::NotFound(format!("Issuing point {}", id)));
        }

        info!(id, "Updated issuing point");
        Ok(issuing_point)
    }

    async fn list_issuing_points(&self) -> Result<Vec<IssuingPoint>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT data FROM issuing_points ORDER BY id", &[])
            .await
            .map_err(db_error)?;
        rows.iter().map(issuing_point_from_row).collect()
    }

    async fn delete_issuing_point(&self, id: i64) -> Result<()> {
        let client = self.client().await?;
        let affected = client
            .execute("DELETE FROM issuing_points WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        if affected == 0 {
            return Err(Error::NotFound(format!("Issuing point {}", id)));
        }

        info!(id, "Deleted issuing point");
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let client = self.client().await?;
        client.query_one("SELECT 1", &[]).await.map_err(db_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_fields() {
        let config = SqlConfig {
            password: Some("secret".into()),
            ..SqlConfig::default()
        };
        let pg = pg_config(&config).unwrap();
        assert_eq!(pg.get_user(), Some("root"));
        assert_eq!(pg.get_dbname(), Some("raid"));
        assert_eq!(pg.get_ports(), &[26257]);
        assert_eq!(pg.get_password(), Some(&b"secret"[..]));
    }

    #[test]
    fn test_config_from_url() {
        let config = SqlConfig {
            url: Some("postgresql://app@db.internal:26000/registry?sslmode=disable".into()),
            ..SqlConfig::default()
        };
        let pg = pg_config(&config).unwrap();
        assert_eq!(pg.get_user(), Some("app"));
        assert_eq!(pg.get_dbname(), Some("registry"));
        assert_eq!(pg.get_ports(), &[26000]);
    }

    #[test]
    fn test_bad_url_rejected() {
        let config = SqlConfig {
            url: Some("postgresql://host:notaport/db".into()),
            ..SqlConfig::default()
        };
        assert!(matches!(pg_config(&config), Err(Error::InvalidInput(_))));
    }

    fn resolve(config: &SqlConfig) -> (SslMode, tokio_postgres::config::SslMode) {
        let mut pg = pg_config(config).unwrap();
        let mode = effective_sslmode(config, &mut pg);
        (mode, pg.get_ssl_mode())
    }

    #[test]
    fn test_url_sslmode_enables_tls() {
        let config = SqlConfig {
            url: Some("postgresql://root@localhost:26257/raid?sslmode=require".into()),
            ..SqlConfig::default()
        };
        let (mode, pg_mode) = resolve(&config);
        assert_eq!(mode, SslMode::Require);
        assert_eq!(pg_mode, tokio_postgres::config::SslMode::Require);
        // no root certificate: setup fails instead of silently using NoTls
        assert!(matches!(
            tls::connector(&config, mode),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_url_keeps_verifying_field_mode() {
        let config = SqlConfig {
            url: Some("postgresql://root@localhost:26257/raid?sslmode=require".into()),
            sslmode: SslMode::VerifyFull,
            ..SqlConfig::default()
        };
        assert_eq!(resolve(&config).0, SslMode::VerifyFull);
    }

    #[test]
    fn test_url_sslmode_disable_wins() {
        let config = SqlConfig {
            url: Some("postgresql://root@localhost:26257/raid?sslmode=disable".into()),
            sslmode: SslMode::VerifyFull,
            ..SqlConfig::default()
        };
        let (mode, pg_mode) = resolve(&config);
        assert_eq!(mode, SslMode::Disable);
        assert_eq!(pg_mode, tokio_postgres::config::SslMode::Disable);
    }

    #[test]
    fn test_url_prefer_without_root_is_plaintext() {
        let config = SqlConfig {
            url: Some("postgresql://root@localhost:26257/raid".into()),
            ..SqlConfig::default()
        };
        assert_eq!(resolve(&config).0, SslMode::Disable);

        let config = SqlConfig {
            sslroot: Some("/etc/raid/ca.crt".into()),
            ..config
        };
        let (mode, pg_mode) = resolve(&config);
        assert_eq!(mode, SslMode::Require);
        assert_eq!(pg_mode, tokio_postgres::config::SslMode::Require);
    }

    #[test]
    fn test_fields_use_configured_mode() {
        let config = SqlConfig {
            sslmode: SslMode::VerifyCa,
            ..SqlConfig::default()
        };
        assert_eq!(resolve(&config).0, SslMode::VerifyCa);
        assert_eq!(resolve(&SqlConfig::default()).0, SslMode::Disable);
    }
}
