//! A store backed by a local directory.
//!
//! Each bucket is a subdirectory of the root, and object names map to relative
//! paths. Conditional creates write to a temporary file in the destination
//! directory and then hard-link it into place, which fails atomically if the
//! destination already exists. Generations are file modification times.

use std::{
    collections::HashMap,
    fs, io,
    io::Write as _,
    path::Component,
    sync::{Arc, Mutex},
    time::UNIX_EPOCH,
};

use crate::{async_utils::spawn_blocking_propagating_panics, prelude::*};

use super::{BlobRef, ObjectStore, StoreError, StoreResult, content_hash};

/// Prefix used by [`tempfile`] for files we're still writing. Listings skip
/// these.
const TEMP_PREFIX: &str = ".tmp";

/// An [`ObjectStore`] which stores objects as files.
#[derive(Clone, Debug)]
pub struct FsStore {
    /// The directory containing one subdirectory per bucket.
    root: PathBuf,

    /// Content hashes of files we've already read, so listings don't reread
    /// unchanged files.
    hashes: HashCache,
}

/// A file's content hash, valid while its size and generation are unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CachedHash {
    len: u64,
    generation: i64,
    hash: String,
}

type HashCache = Arc<Mutex<HashMap<PathBuf, CachedHash>>>;

impl FsStore {
    /// Create a store rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
            hashes: HashCache::default(),
        }
    }

    /// Map `bucket/name` to a path, refusing anything which could escape the
    /// bucket directory.
    fn object_path(&self, bucket: &str, name: &str) -> StoreResult<PathBuf> {
        let bucket_path = Path::new(bucket);
        let name_path = Path::new(name);
        let is_plain = |path: &Path| {
            path.components().count() > 0
                && path.components().all(|c| matches!(c, Component::Normal(_)))
        };
        if !is_plain(bucket_path) || bucket_path.components().count() != 1 || !is_plain(name_path)
        {
            return Err(StoreError::other(anyhow!(
                "invalid object name {name:?} in bucket {bucket:?}"
            )));
        }
        Ok(self.root.join(bucket_path).join(name_path))
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    #[instrument(level = "trace", skip(self))]
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StoreResult<Vec<BlobRef>> {
        let bucket_dir = self.root.join(bucket);
        let bucket = bucket.to_owned();
        let prefix = prefix.unwrap_or("").to_owned();
        let hashes = self.hashes.clone();
        spawn_blocking_propagating_panics(move || -> StoreResult<Vec<BlobRef>> {
            if !bucket_dir.is_dir() {
                return Ok(vec![]);
            }
            let mut blobs = vec![];
            for path in walk_files(&bucket_dir)? {
                let name = relative_name(&bucket_dir, &path)?;
                if !name.starts_with(&prefix) {
                    continue;
                }
                let cached = hash_file(&hashes, &path)?;
                blobs.push(BlobRef {
                    bucket: bucket.clone(),
                    name,
                    content_hash: cached.hash,
                    generation: cached.generation,
                });
            }
            blobs.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(blobs)
        })
        .await
    }

    async fn read(&self, blob: &BlobRef) -> StoreResult<Vec<u8>> {
        let path = self.object_path(&blob.bucket, &blob.name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                bucket: blob.bucket.clone(),
                name: blob.name.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(level = "trace", skip(self, data))]
    async fn upload_if_absent(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        _content_type: &str,
    ) -> StoreResult<BlobRef> {
        let path = self.object_path(bucket, name)?;
        let bucket = bucket.to_owned();
        let name = name.to_owned();
        spawn_blocking_propagating_panics(move || -> StoreResult<BlobRef> {
            create_if_absent(&path, &data).map_err(|err| {
                if err.kind() == io::ErrorKind::AlreadyExists {
                    StoreError::AlreadyExists {
                        bucket: bucket.clone(),
                        name: name.clone(),
                    }
                } else {
                    StoreError::other(anyhow::Error::new(err).context(format!(
                        "could not write {}",
                        path.display()
                    )))
                }
            })?;
            Ok(BlobRef {
                content_hash: content_hash(&data),
                generation: generation_of(&path)?,
                bucket,
                name,
            })
        })
        .await
    }

    async fn delete(&self, blob: &BlobRef) -> StoreResult<()> {
        let path = self.object_path(&blob.bucket, &blob.name)?;
        let bucket_dir = self.root.join(&blob.bucket);
        let blob = blob.clone();
        let hashes = self.hashes.clone();
        spawn_blocking_propagating_panics(move || -> StoreResult<()> {
            let generation = match generation_of(&path) {
                Ok(generation) => generation,
                Err(StoreError::Other(_)) if !path.exists() => {
                    return Err(StoreError::NotFound {
                        bucket: blob.bucket,
                        name: blob.name,
                    });
                }
                Err(err) => return Err(err),
            };
            if generation != blob.generation {
                return Err(StoreError::Changed {
                    bucket: blob.bucket,
                    name: blob.name,
                });
            }
            fs::remove_file(&path)?;
            hashes.lock().expect("lock poisoned").remove(&path);
            remove_empty_parents(&path, &bucket_dir);
            Ok(())
        })
        .await
    }

    async fn copy_if_absent(
        &self,
        blob: &BlobRef,
        dest_bucket: &str,
        dest_name: &str,
    ) -> StoreResult<BlobRef> {
        let data = self.read(blob).await?;
        self.upload_if_absent(dest_bucket, dest_name, data, "application/octet-stream")
            .await
    }
}

/// Write `data` to `path`, failing with [`io::ErrorKind::AlreadyExists`] if
/// `path` exists. Readers never see a partially written file.
fn create_if_absent(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::other("object path has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    // Linking fails if `path` exists. Dropping `tmp` removes the temporary name.
    fs::hard_link(tmp.path(), path)
}

/// Recursively list all regular files under `dir`, skipping temporary files.
pub(crate) fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = vec![];
    let mut pending = vec![dir.to_owned()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file()
                && !entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX)
            {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Convert a path under `base` to a `/`-separated object name.
pub(crate) fn relative_name(base: &Path, path: &Path) -> StoreResult<String> {
    let relative = path.strip_prefix(base).map_err(StoreError::other)?;
    let parts = relative
        .components()
        .map(|c| {
            c.as_os_str().to_str().ok_or_else(|| {
                StoreError::other(anyhow!("non-UTF-8 path {}", path.display()))
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// Hash `path`, reusing the cached hash if its size and generation match.
fn hash_file(hashes: &HashCache, path: &Path) -> StoreResult<CachedHash> {
    let len = fs::metadata(path)?.len();
    let generation = generation_of(path)?;
    if let Some(cached) = hashes.lock().expect("lock poisoned").get(path) {
        if cached.len == len && cached.generation == generation {
            return Ok(cached.clone());
        }
    }
    let data = fs::read(path)?;
    let cached = CachedHash {
        len: data.len() as u64,
        generation,
        hash: content_hash(&data),
    };
    hashes
        .lock()
        .expect("lock poisoned")
        .insert(path.to_owned(), cached.clone());
    Ok(cached)
}

/// Use the modification time in nanoseconds as the generation number.
fn generation_of(path: &Path) -> StoreResult<i64> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| {
            StoreError::other(
                anyhow::Error::new(err).context(format!("could not stat {}", path.display())),
            )
        })?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map_err(StoreError::other)?
        .as_nanos();
    i64::try_from(nanos).map_err(StoreError::other)
}

/// Remove now-empty directories between `path` and `stop`, so deleted
/// documents don't leave a trail of empty prefixes behind.
fn remove_empty_parents(path: &Path, stop: &Path) {
    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == stop || fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}
