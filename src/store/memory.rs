//! In-memory store, used by tests.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::prelude::*;

use super::{BlobRef, ObjectStore, StoreError, StoreResult, content_hash};

/// An object held in memory.
#[derive(Clone, Debug)]
struct StoredObject {
    data: Vec<u8>,
    content_type: String,
    generation: i64,
}

/// An [`ObjectStore`] which keeps everything in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Objects, keyed by `(bucket, name)`.
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,

    /// The last generation number we handed out.
    last_generation: Mutex<i64>,

    /// How many times has `read` been called?
    reads: AtomicUsize,

    /// Buckets where every operation fails.
    failing_buckets: Mutex<HashSet<String>>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an object directly.
    pub fn put(&self, bucket: &str, name: &str, data: impl Into<Vec<u8>>) -> BlobRef {
        let data = data.into();
        let blob = self.blob_ref(bucket, name, &data);
        let object = StoredObject {
            data,
            content_type: "application/octet-stream".to_owned(),
            generation: blob.generation,
        };
        self.lock()
            .insert((bucket.to_owned(), name.to_owned()), object);
        blob
    }

    /// Get an object's content, if it exists.
    pub fn get(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.lock()
            .get(&(bucket.to_owned(), name.to_owned()))
            .map(|object| object.data.clone())
    }

    /// Get an object's content type, if it exists.
    pub fn content_type(&self, bucket: &str, name: &str) -> Option<String> {
        self.lock()
            .get(&(bucket.to_owned(), name.to_owned()))
            .map(|object| object.content_type.clone())
    }

    /// All object names in a bucket.
    pub fn names(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Remove every object.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Make every future operation on `bucket` fail.
    pub fn fail_bucket(&self, bucket: &str) {
        self.failing_buckets
            .lock()
            .expect("lock poisoned")
            .insert(bucket.to_owned());
    }

    fn check_bucket(&self, bucket: &str) -> StoreResult<()> {
        if self
            .failing_buckets
            .lock()
            .expect("lock poisoned")
            .contains(bucket)
        {
            Err(StoreError::other(anyhow!("simulated failure in {bucket}")))
        } else {
            Ok(())
        }
    }

    /// How many times has an object been read?
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), StoredObject>> {
        self.objects.lock().expect("lock poisoned")
    }

    fn blob_ref(&self, bucket: &str, name: &str, data: &[u8]) -> BlobRef {
        let mut generation = self.last_generation.lock().expect("lock poisoned");
        *generation += 1;
        BlobRef {
            bucket: bucket.to_owned(),
            name: name.to_owned(),
            content_hash: content_hash(data),
            generation: *generation,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StoreResult<Vec<BlobRef>> {
        self.check_bucket(bucket)?;
        let prefix = prefix.unwrap_or("");
        Ok(self
            .lock()
            .iter()
            .filter(|((b, name), _)| b == bucket && name.starts_with(prefix))
            .map(|((b, name), object)| BlobRef {
                bucket: b.clone(),
                name: name.clone(),
                content_hash: content_hash(&object.data),
                generation: object.generation,
            })
            .collect())
    }

    async fn read(&self, blob: &BlobRef) -> StoreResult<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_bucket(&blob.bucket)?;
        self.get(&blob.bucket, &blob.name)
            .ok_or_else(|| StoreError::NotFound {
                bucket: blob.bucket.clone(),
                name: blob.name.clone(),
            })
    }

    async fn upload_if_absent(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<BlobRef> {
        self.check_bucket(bucket)?;
        let key = (bucket.to_owned(), name.to_owned());
        let blob = self.blob_ref(bucket, name, &data);
        let object = StoredObject {
            data,
            content_type: content_type.to_owned(),
            generation: blob.generation,
        };
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                bucket: bucket.to_owned(),
                name: name.to_owned(),
            });
        }
        objects.insert(key, object);
        Ok(blob)
    }

    async fn delete(&self, blob: &BlobRef) -> StoreResult<()> {
        self.check_bucket(&blob.bucket)?;
        let mut objects = self.lock();
        let key = (blob.bucket.clone(), blob.name.clone());
        match objects.get(&key) {
            None => Err(StoreError::NotFound {
                bucket: blob.bucket.clone(),
                name: blob.name.clone(),
            }),
            Some(object) if object.generation != blob.generation => {
                Err(StoreError::Changed {
                    bucket: blob.bucket.clone(),
                    name: blob.name.clone(),
                })
            }
            Some(_) => {
                objects.remove(&key);
                Ok(())
            }
        }
    }

    async fn copy_if_absent(
        &self,
        blob: &BlobRef,
        dest_bucket: &str,
        dest_name: &str,
    ) -> StoreResult<BlobRef> {
        let data = self.get(&blob.bucket, &blob.name).ok_or_else(|| {
            StoreError::NotFound {
                bucket: blob.bucket.clone(),
                name: blob.name.clone(),
            }
        })?;
        let content_type = self
            .content_type(&blob.bucket, &blob.name)
            .unwrap_or_default();
        self.upload_if_absent(dest_bucket, dest_name, data, &content_type)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_upload_refuses_to_overwrite() {
        let store = MemoryStore::new();
        store
            .upload_if_absent("dst", "a/001.json", b"first".to_vec(), "application/json")
            .await
            .unwrap();
        let err = store
            .upload_if_absent("dst", "a/001.json", b"second".to_vec(), "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(store.get("dst", "a/001.json").unwrap(), b"first");
    }

    #[tokio::test]
    async fn delete_checks_generation() {
        let store = MemoryStore::new();
        let old = store.put("src", "a/001.png", "old");
        store.put("src", "a/001.png", "new");
        let err = store.delete(&old).await.unwrap_err();
        assert!(matches!(err, StoreError::Changed { .. }));
        assert_eq!(store.names("src"), vec!["a/001.png".to_owned()]);
    }
}
