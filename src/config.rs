use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Filesystem,
    S3,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub chunk_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub allow_insecure_urls: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendKind,
    pub root: Option<PathBuf>,
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub storage: StorageConfig,
    pub signed_url_ttl: Duration,
    pub default_page_size: u64,
    pub max_page_size: u64,
    pub subscriber_queue_capacity: usize,
    pub operation_timeout: Duration,
    pub max_upload_bytes: usize,
    pub processing_api_url: Option<String>,
    pub soft_delete_retention_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            bind_addr: parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            storage: StorageConfig::from_env()?,
            signed_url_ttl: Duration::from_secs(parse_or("SIGNED_URL_TTL_SECS", 3600)?),
            default_page_size: parse_or("DEFAULT_PAGE_SIZE", 10)?,
            max_page_size: parse_or("MAX_PAGE_SIZE", 100)?,
            subscriber_queue_capacity: parse_or("SUBSCRIBER_QUEUE_CAPACITY", 256)?,
            operation_timeout: Duration::from_secs(parse_or("OPERATION_TIMEOUT_SECS", 300)?),
            max_upload_bytes: parse_or("MAX_UPLOAD_BYTES", 500 << 20)?,
            processing_api_url: optional("PROCESSING_API_URL"),
            soft_delete_retention_days: parse_or("SOFT_DELETE_RETENTION_DAYS", 30)?,
        })
    }
}

impl StorageConfig {
    /// An explicit `STORAGE_BACKEND` wins. Otherwise an existing
    /// `STORAGE_ROOT` directory selects the filesystem backend and a
    /// configured bucket selects S3.
    pub fn from_env() -> Result<Self, ConfigError> {
        let root = optional("STORAGE_ROOT").map(PathBuf::from);
        let s3 = match optional("S3_BUCKET_NAME") {
            Some(bucket_name) => Some(S3Config {
                bucket_name,
                region: optional("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
                endpoint: optional("S3_ENDPOINT"),
                access_key_id: optional("AWS_ACCESS_KEY_ID"),
                secret_access_key: optional("AWS_SECRET_ACCESS_KEY"),
                chunk_size: parse_or("UPLOAD_CHUNK_SIZE", 5 * 1024 * 1024)?,
                concurrency: parse_or("UPLOAD_CONCURRENCY", 3)?,
                max_retries: parse_or("UPLOAD_MAX_RETRIES", 3)?,
                allow_insecure_urls: parse_or("ALLOW_INSECURE_URLS", false)?,
            }),
            None => None,
        };

        let backend = match optional("STORAGE_BACKEND") {
            Some(value) => parse_backend(&value)?,
            None => detect_backend(root.as_deref(), s3.is_some())?,
        };

        Ok(Self { backend, root, s3 })
    }
}

fn parse_backend(value: &str) -> Result<StorageBackendKind, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "filesystem" | "local" | "local_file" => Ok(StorageBackendKind::Filesystem),
        "s3" | "cloud_blob" => Ok(StorageBackendKind::S3),
        other => Err(ConfigError::Invalid {
            key: "STORAGE_BACKEND",
            reason: format!("unsupported storage backend '{}'", other),
        }),
    }
}

fn detect_backend(root: Option<&Path>, has_bucket: bool) -> Result<StorageBackendKind, ConfigError> {
    if root.map(Path::is_dir).unwrap_or(false) {
        return Ok(StorageBackendKind::Filesystem);
    }
    if has_bucket {
        return Ok(StorageBackendKind::S3);
    }
    Err(ConfigError::Missing("STORAGE_ROOT or S3_BUCKET_NAME"))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names() {
        assert_eq!(parse_backend("S3").unwrap(), StorageBackendKind::S3);
        assert_eq!(parse_backend("local_file").unwrap(), StorageBackendKind::Filesystem);
        assert!(parse_backend("azure").is_err());
    }

    #[test]
    fn detection_prefers_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            detect_backend(Some(dir.path()), true).unwrap(),
            StorageBackendKind::Filesystem
        );
        assert_eq!(
            detect_backend(Some(&dir.path().join("missing")), true).unwrap(),
            StorageBackendKind::S3
        );
        assert!(detect_backend(None, false).is_err());
    }
}
