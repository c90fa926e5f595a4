use crate::blob::{BlobStore, DirBlobStore, HttpBlobStore};
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Which backend the blob store client talks to.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobBackend {
    /// Remote HTTP object endpoint.
    Http { base_url: String },
    /// Local directory, for development and tests.
    Dir { root: String },
}

/// Service configuration, read once from the environment at startup.
///
/// * `ICMON_BIND` - listen address (default `127.0.0.1:3000`)
/// * `ICMON_NAMESPACE` - blob key namespace (default `area`)
/// * `ICMON_BLOB_URL` - base URL of the blob endpoint; when unset a local
///   directory store at `ICMON_DATA_DIR` (default `database`) is used
/// * `ICMON_ADMIN_USER` / `ICMON_ADMIN_PASSWORD` - admin panel credentials;
///   the password has no default
/// * `ICMON_HTTP_TIMEOUT_SECS` - blob request timeout (default 10)
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub namespace: String,
    pub backend: BlobBackend,
    pub admin_username: String,
    pub admin_password: String,
    pub http_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Config, String> {
        let backend = match env::var("ICMON_BLOB_URL") {
            Ok(url) if !url.trim().is_empty() => BlobBackend::Http {
                base_url: url.trim().to_string(),
            },
            _ => BlobBackend::Dir {
                root: env::var("ICMON_DATA_DIR").unwrap_or_else(|_| "database".to_string()),
            },
        };

        let admin_password = env::var("ICMON_ADMIN_PASSWORD")
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| "ICMON_ADMIN_PASSWORD must be set".to_string())?;

        let http_timeout = env::var("ICMON_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);

        Ok(Config {
            bind_addr: env::var("ICMON_BIND").unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            namespace: env::var("ICMON_NAMESPACE").unwrap_or_else(|_| "area".to_string()),
            backend,
            admin_username: env::var("ICMON_ADMIN_USER").unwrap_or_else(|_| "admin".to_string()),
            admin_password,
            http_timeout: Duration::from_secs(http_timeout),
        })
    }

    /// Build the blob store client this configuration describes.
    pub fn make_store(&self) -> Result<Arc<dyn BlobStore>, String> {
        match &self.backend {
            BlobBackend::Http { base_url } => {
                Ok(Arc::new(HttpBlobStore::new(base_url, self.http_timeout)?))
            }
            BlobBackend::Dir { root } => Ok(Arc::new(DirBlobStore::new(root.clone()))),
        }
    }
}
