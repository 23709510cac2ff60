use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Where blobs live.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// S3-compatible object storage (Cloudflare R2, MinIO, AWS).
    S3,
    /// Directory on the local filesystem.
    Local,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the progress pub/sub transport
    pub redis_url: Option<String>,

    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackend,

    /// S3 bucket name
    pub s3_bucket: Option<String>,

    /// S3 endpoint URL
    pub s3_endpoint: Option<String>,

    /// S3 access key ID
    pub s3_access_key: Option<String>,

    /// S3 secret access key
    pub s3_secret_key: Option<String>,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default = "default_local_storage_root")]
    pub local_storage_root: PathBuf,

    /// Parent directory of per-job workspaces
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Converter executable, invoked as `<program> <args..> <input> <output_dir>`
    #[serde(default = "default_converter_program")]
    pub converter_program: String,

    /// Whitespace-separated arguments placed before the input and output paths
    #[serde(default = "default_converter_args")]
    pub converter_args: String,

    #[serde(default = "default_max_concurrent_conversions")]
    pub max_concurrent_conversions: usize,

    #[serde(default = "default_conversion_timeout_secs")]
    pub conversion_timeout_secs: u64,

    /// Upload request body limit in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Buffered events per streaming progress subscriber
    #[serde(default = "default_relay_channel_capacity")]
    pub relay_channel_capacity: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::S3
}

fn default_s3_region() -> String {
    "auto".to_string()
}

fn default_local_storage_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./data/workspaces")
}

fn default_converter_program() -> String {
    "python3".to_string()
}

fn default_converter_args() -> String {
    "integrated_pipelines.py".to_string()
}

fn default_max_concurrent_conversions() -> usize {
    2
}

fn default_conversion_timeout_secs() -> u64 {
    3600
}

fn default_max_upload_bytes() -> usize {
    200 * 1024 * 1024
}

fn default_relay_channel_capacity() -> usize {
    256
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn converter_args(&self) -> Vec<String> {
        self.converter_args.split_whitespace().map(str::to_string).collect()
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<AppConfig, envy::Error> {
        envy::from_iter(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[("DATABASE_URL", "postgres://localhost/convert")]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.storage_backend, StorageBackend::S3);
        assert_eq!(config.converter_args(), vec!["integrated_pipelines.py"]);
        assert_eq!(config.max_upload_bytes, 209_715_200);
        assert_eq!(config.conversion_timeout(), Duration::from_secs(3600));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/convert"),
            ("STORAGE_BACKEND", "local"),
            ("CONVERTER_ARGS", "  -u  pipeline.py --strict "),
            ("MAX_CONCURRENT_CONVERSIONS", "4"),
        ])
        .unwrap();
        assert_eq!(config.storage_backend, StorageBackend::Local);
        assert_eq!(config.converter_args(), vec!["-u", "pipeline.py", "--strict"]);
        assert_eq!(config.max_concurrent_conversions, 4);
    }

    #[test]
    fn test_database_url_is_required() {
        assert!(from_pairs(&[]).is_err());
    }
}
