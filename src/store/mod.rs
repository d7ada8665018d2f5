//! Object store interface.
//!
//! The pipeline only needs a handful of operations from a store, and the most
//! important property is that writes and copies are *conditional*: they fail
//! with [`StoreError::AlreadyExists`] instead of overwriting. Everything else
//! about idempotency is built on top of that.

use std::{error, fmt, sync::Arc};

use clap::{Args, ValueEnum};

use crate::prelude::*;

pub mod fs;
pub mod gcs;
#[cfg(test)]
pub mod memory;

/// A handle to one object in a store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    /// The bucket containing this object.
    pub bucket: String,

    /// The full object name, including any `/`-separated prefix.
    pub name: String,

    /// A hash of the object's content. Two objects with the same hash have
    /// the same bytes, regardless of where they are stored.
    pub content_hash: String,

    /// Incremented each time the object at `name` is replaced.
    pub generation: i64,
}

/// Errors returned by an [`ObjectStore`].
#[derive(Debug)]
pub enum StoreError {
    /// A conditional write or copy found an existing object.
    AlreadyExists { bucket: String, name: String },

    /// The object does not exist.
    NotFound { bucket: String, name: String },

    /// The object was replaced after we listed it.
    Changed { bucket: String, name: String },

    /// Anything else, including network and I/O failures.
    Other(anyhow::Error),
}

impl StoreError {
    /// Wrap an arbitrary error.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        StoreError::Other(err.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AlreadyExists { bucket, name } => {
                write!(f, "object {name:?} already exists in bucket {bucket:?}")
            }
            StoreError::NotFound { bucket, name } => {
                write!(f, "object {name:?} not found in bucket {bucket:?}")
            }
            StoreError::Changed { bucket, name } => {
                write!(f, "object {name:?} in bucket {bucket:?} changed since it was listed")
            }
            StoreError::Other(err) => write!(f, "store error: {err}"),
        }
    }
}

impl error::Error for StoreError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            StoreError::Other(err) => {
                let source: &(dyn error::Error + 'static) = err.as_ref();
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Other(err.into())
    }
}

/// Result type for [`ObjectStore`] operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Interface to an object store.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// List objects in `bucket`, optionally restricted to names starting with
    /// `prefix`. Results are sorted by name.
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StoreResult<Vec<BlobRef>>;

    /// Read an object's content.
    async fn read(&self, blob: &BlobRef) -> StoreResult<Vec<u8>>;

    /// Create `bucket/name`, failing with [`StoreError::AlreadyExists`] if
    /// something is already there.
    async fn upload_if_absent(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<BlobRef>;

    /// Delete an object, failing with [`StoreError::Changed`] if it has been
    /// replaced since `blob` was listed.
    async fn delete(&self, blob: &BlobRef) -> StoreResult<()>;

    /// Copy an object verbatim to `dest_bucket/dest_name`, failing with
    /// [`StoreError::AlreadyExists`] if something is already there.
    async fn copy_if_absent(
        &self,
        blob: &BlobRef,
        dest_bucket: &str,
        dest_name: &str,
    ) -> StoreResult<BlobRef>;
}

/// Extension methods for conditional store operations.
pub trait StoreResultExt<T> {
    /// Treat [`StoreError::AlreadyExists`] as success, returning `None`.
    fn or_already_exists(self) -> StoreResult<Option<T>>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn or_already_exists(self) -> StoreResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::AlreadyExists { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Compute the content hash we use for stores which don't supply their own.
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Our different store backends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum StoreType {
    /// Google Cloud Storage, or a compatible fake server.
    #[default]
    Gcs,

    /// A local directory, with one subdirectory per bucket.
    Fs,
}

/// Options for connecting to a store.
#[derive(Args, Clone, Debug)]
pub struct StoreOpts {
    /// The store backend to use.
    #[clap(long, value_enum, default_value_t = StoreType::default())]
    pub store: StoreType,

    /// Root directory for the `fs` store.
    #[clap(long, env = "STORE_ROOT", required_if_eq("store", "fs"))]
    pub store_root: Option<PathBuf>,

    /// Override the GCS endpoint, for example to talk to a local
    /// `fake-gcs-server`.
    #[clap(long, env = "FAKE_GCS_SERVER")]
    pub gcs_endpoint: Option<String>,

    /// OAuth2 access token for GCS. Requests are anonymous if this is not set.
    #[clap(long, env = "GCS_ACCESS_TOKEN", hide_env_values = true)]
    pub gcs_access_token: Option<String>,
}

impl StoreOpts {
    /// Instantiate the configured store.
    pub fn create_store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self.store {
            StoreType::Gcs => Ok(Arc::new(gcs::GcsStore::new(
                self.gcs_endpoint.as_deref(),
                self.gcs_access_token.clone(),
            )?)),
            StoreType::Fs => {
                let root = self
                    .store_root
                    .as_deref()
                    .ok_or_else(|| anyhow!("--store-root is required for the fs store"))?;
                Ok(Arc::new(fs::FsStore::new(root)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_exists_is_not_an_error() {
        let result: StoreResult<()> = Err(StoreError::AlreadyExists {
            bucket: "b".to_owned(),
            name: "a/001.json".to_owned(),
        });
        assert_eq!(result.or_already_exists().unwrap(), None);
        let written: StoreResult<u32> = Ok(5);
        assert_eq!(written.or_already_exists().unwrap(), Some(5));

        let result: StoreResult<()> = Err(StoreError::NotFound {
            bucket: "b".to_owned(),
            name: "a/001.json".to_owned(),
        });
        assert!(result.or_already_exists().is_err());
    }

    #[test]
    fn content_hash_depends_only_on_bytes() {
        assert_eq!(content_hash(b"page"), content_hash(b"page"));
        assert_ne!(content_hash(b"page"), content_hash(b"page 2"));
    }
}
