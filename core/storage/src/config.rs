//! Backend configuration.
//!
//! Each backend deserializes its own config type from the JSON value handed
//! to the registry. [`StorageConfig::from_env`] builds one from the
//! `STORAGE_*` environment variables for process startup.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use raidstore_common::{Error, Result};

pub const DEFAULT_DATA_DIR: &str = "./data";
pub const DEFAULT_AUTHOR_NAME: &str = "RAiD System";
pub const DEFAULT_AUTHOR_EMAIL: &str = "raid@example.org";
pub const DEFAULT_FDB_API_VERSION: i32 = 710;
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Local-file backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Git overlay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_true")]
    pub auto_commit: bool,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            auto_commit: true,
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

/// Medium underneath the key-value backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvMedium {
    /// In-process engine. Data does not survive the process.
    Memory,
    /// FoundationDB cluster. Requires the `fdb` feature.
    #[default]
    Fdb,
}

/// Key-value backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvConfig {
    #[serde(default)]
    pub medium: KvMedium,
    /// Cluster file path; the client default is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_file: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: i32,
    /// Maximum re-runs of a conflicting transaction.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            medium: KvMedium::default(),
            cluster_file: None,
            api_version: DEFAULT_FDB_API_VERSION,
            max_retries: default_max_retries(),
        }
    }
}

impl KvConfig {
    /// In-memory medium, as used by tests and local experiments.
    pub fn memory() -> Self {
        Self {
            medium: KvMedium::Memory,
            ..Self::default()
        }
    }
}

/// TLS mode for the SQL connection, mirroring libpq `sslmode` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(Error::InvalidInput(format!("Unknown sslmode '{}'", other))),
        }
    }
}

/// Distributed SQL backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConfig {
    /// Full connection string. Takes precedence over the discrete fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub sslmode: SslMode,
    /// Client certificate (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslcert: Option<PathBuf>,
    /// Client private key (PEM).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslkey: Option<PathBuf>,
    /// Root CA bundle (PEM). Required unless `sslmode` is `disable`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sslroot: Option<PathBuf>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            database: default_database(),
            user: default_user(),
            password: None,
            sslmode: SslMode::Disable,
            sslcert: None,
            sslkey: None,
            sslroot: None,
            pool_size: DEFAULT_POOL_SIZE,
            max_retries: default_max_retries(),
        }
    }
}

/// Selected backend with its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StorageConfig {
    File(FileConfig),
    FileGit(GitConfig),
    Kv(KvConfig),
    Cockroach(SqlConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::File(FileConfig::default())
    }
}

impl StorageConfig {
    /// Build from the process environment.
    ///
    /// # Errors
    /// - Unknown `STORAGE_TYPE`
    /// - A numeric or boolean variable fails to parse
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let data_dir = get("STORAGE_FILE_DATADIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let storage_type = get("STORAGE_TYPE").unwrap_or_else(|| "file".to_string());
        match storage_type.as_str() {
            "file" => Ok(StorageConfig::File(FileConfig { data_dir })),
            "file-git" | "git" => Ok(StorageConfig::FileGit(GitConfig {
                data_dir,
                auto_commit: match get("STORAGE_GIT_AUTOCOMMIT") {
                    Some(v) => parse_var("STORAGE_GIT_AUTOCOMMIT", &v)?,
                    None => true,
                },
                author_name: get("STORAGE_GIT_AUTHOR_NAME").unwrap_or_else(default_author_name),
                author_email: get("STORAGE_GIT_AUTHOR_EMAIL")
                    .unwrap_or_else(default_author_email),
            })),
            "kv" | "fdb" | "kv-memory" => Ok(StorageConfig::Kv(KvConfig {
                medium: if storage_type == "kv-memory" {
                    KvMedium::Memory
                } else {
                    KvMedium::Fdb
                },
                cluster_file: get("STORAGE_FDB_CLUSTER_FILE"),
                api_version: match get("STORAGE_FDB_API_VERSION") {
                    Some(v) => parse_var("STORAGE_FDB_API_VERSION", &v)?,
                    None => DEFAULT_FDB_API_VERSION,
                },
                max_retries: default_max_retries(),
            })),
            "cockroach" | "cockroachdb" => Ok(StorageConfig::Cockroach(SqlConfig {
                url: None,
                host: get("STORAGE_COCKROACH_HOST").unwrap_or_else(default_host),
                port: match get("STORAGE_COCKROACH_PORT") {
                    Some(v) => parse_var("STORAGE_COCKROACH_PORT", &v)?,
                    None => default_port(),
                },
                database: get("STORAGE_COCKROACH_DATABASE").unwrap_or_else(default_database),
                user: get("STORAGE_COCKROACH_USER").unwrap_or_else(default_user),
                password: get("STORAGE_COCKROACH_PASSWORD"),
                sslmode: match get("STORAGE_COCKROACH_SSLMODE") {
                    Some(v) => v.parse()?,
                    None => SslMode::Disable,
                },
                sslcert: get("STORAGE_COCKROACH_SSLCERT").map(PathBuf::from),
                sslkey: get("STORAGE_COCKROACH_SSLKEY").map(PathBuf::from),
                sslroot: get("STORAGE_COCKROACH_SSLROOT").map(PathBuf::from),
                pool_size: DEFAULT_POOL_SIZE,
                max_retries: default_max_retries(),
            })),
            other => Err(Error::InvalidInput(format!(
                "Unknown STORAGE_TYPE '{}'",
                other
            ))),
        }
    }

    /// Registry name and JSON config for this backend.
    pub fn to_backend(&self) -> Result<(&'static str, Value)> {
        let (name, value) = match self {
            StorageConfig::File(c) => ("file", serde_json::to_value(c)?),
            StorageConfig::FileGit(c) => ("file-git", serde_json::to_value(c)?),
            StorageConfig::Kv(c) => ("kv", serde_json::to_value(c)?),
            StorageConfig::Cockroach(c) => ("cockroach", serde_json::to_value(c)?),
        };
        Ok((name, value))
    }
}

/// Deserialize a backend config from its registry value.
///
/// `null` yields the defaults.
pub(crate) fn parse_config<T>(backend: &str, config: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config
    };
    serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid {} config: {}", backend, e)))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::InvalidInput(format!("Invalid value for {}: '{}'", key, value)))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_true() -> bool {
    true
}

fn default_author_name() -> String {
    DEFAULT_AUTHOR_NAME.to_string()
}

fn default_author_email() -> String {
    DEFAULT_AUTHOR_EMAIL.to_string()
}

fn default_api_version() -> i32 {
    DEFAULT_FDB_API_VERSION
}

fn default_max_retries() -> u32 {
    64
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    26257
}

fn default_database() -> String {
    "raid".to_string()
}

fn default_user() -> String {
    "root".to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
