//! Google Cloud Storage, via the JSON API.
//!
//! We only use a handful of endpoints, so we talk to them directly with
//! `reqwest`. Conditional operations use GCS generation preconditions:
//! `ifGenerationMatch=0` means "only if the object doesn't exist".

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};

use crate::prelude::*;

use super::{BlobRef, ObjectStore, StoreError, StoreResult};

/// The public GCS endpoint.
const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// A GCS client.
#[derive(Clone, Debug)]
pub struct GcsStore {
    client: reqwest::Client,

    /// The base URL of the server.
    endpoint: Url,

    /// An OAuth2 bearer token, if we have one.
    token: Option<String>,
}

impl GcsStore {
    /// Create a new client. `endpoint` may point at a fake GCS server.
    pub fn new(endpoint: Option<&str>, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid GCS endpoint {endpoint:?}"))?;
        if endpoint.cannot_be_a_base() {
            return Err(anyhow!("invalid GCS endpoint {endpoint}"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            token,
        })
    }

    /// Build a URL from the endpoint and a list of path segments. Each segment
    /// is percent-encoded, including any `/` inside object names.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            // Checked in `new`.
            .expect("endpoint should be a base URL")
            .pop_if_empty()
            .extend(segments);
        url
    }

    /// The metadata URL for an object.
    fn object_url(&self, bucket: &str, name: &str) -> Url {
        self.url(&["storage", "v1", "b", bucket, "o", name])
    }

    /// The URL for copying exactly `blob`'s generation to a new object. The
    /// only precondition is on the destination, so a 412 always means it
    /// already exists. A source generation which is gone is a 404.
    fn copy_url(&self, blob: &BlobRef, dest_bucket: &str, dest_name: &str) -> Url {
        let mut url = self.url(&[
            "storage",
            "v1",
            "b",
            &blob.bucket,
            "o",
            &blob.name,
            "copyTo",
            "b",
            dest_bucket,
            "o",
            dest_name,
        ]);
        url.query_pairs_mut()
            .append_pair("sourceGeneration", &blob.generation.to_string())
            .append_pair("ifGenerationMatch", "0");
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request, mapping well-known failure statuses to [`StoreError`].
    /// `precondition_failed` is returned for HTTP 412.
    async fn send(
        &self,
        builder: RequestBuilder,
        bucket: &str,
        name: &str,
        precondition_failed: fn(String, String) -> StoreError,
    ) -> StoreResult<Response> {
        let response = builder.send().await.map_err(StoreError::other)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                bucket: bucket.to_owned(),
                name: name.to_owned(),
            }),
            StatusCode::PRECONDITION_FAILED => {
                Err(precondition_failed(bucket.to_owned(), name.to_owned()))
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::other(anyhow!(
                    "GCS request for {bucket}/{name} failed with status {status}: {body}"
                )))
            }
        }
    }
}

fn already_exists(bucket: String, name: String) -> StoreError {
    StoreError::AlreadyExists { bucket, name }
}

fn changed(bucket: String, name: String) -> StoreError {
    StoreError::Changed { bucket, name }
}

/// One page of an object listing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

/// Object metadata, as returned by the JSON API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource {
    name: String,
    bucket: String,
    md5_hash: Option<String>,
    crc32c: Option<String>,

    /// GCS sends 64-bit integers as strings.
    generation: String,
}

impl ObjectResource {
    fn into_blob_ref(self) -> StoreResult<BlobRef> {
        let generation = self.generation.parse::<i64>().map_err(|err| {
            StoreError::other(anyhow::Error::new(err).context(format!(
                "invalid generation {:?} for {}",
                self.generation, self.name
            )))
        })?;
        // Composite objects have no MD5, so fall back to weaker identities.
        let content_hash = self
            .md5_hash
            .or(self.crc32c)
            .unwrap_or_else(|| format!("{}#{}", self.name, generation));
        Ok(BlobRef {
            bucket: self.bucket,
            name: self.name,
            content_hash,
            generation,
        })
    }
}

async fn parse_object(response: Response) -> StoreResult<BlobRef> {
    response
        .json::<ObjectResource>()
        .await
        .map_err(StoreError::other)?
        .into_blob_ref()
}

#[async_trait]
impl ObjectStore for GcsStore {
    #[instrument(level = "trace", skip(self))]
    async fn list(&self, bucket: &str, prefix: Option<&str>) -> StoreResult<Vec<BlobRef>> {
        let mut blobs = vec![];
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", bucket, "o"]);
            {
                let mut query = url.query_pairs_mut();
                if let Some(prefix) = prefix {
                    query.append_pair("prefix", prefix);
                }
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self
                .send(
                    self.request(Method::GET, url),
                    bucket,
                    prefix.unwrap_or(""),
                    changed,
                )
                .await?;
            let page = response
                .json::<ObjectList>()
                .await
                .map_err(StoreError::other)?;
            for item in page.items {
                blobs.push(item.into_blob_ref()?);
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blobs)
    }

    async fn read(&self, blob: &BlobRef) -> StoreResult<Vec<u8>> {
        let mut url = self.object_url(&blob.bucket, &blob.name);
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("generation", &blob.generation.to_string());
        let response = self
            .send(
                self.request(Method::GET, url),
                &blob.bucket,
                &blob.name,
                changed,
            )
            .await?;
        let bytes = response.bytes().await.map_err(StoreError::other)?;
        Ok(bytes.to_vec())
    }

    #[instrument(level = "trace", skip(self, data))]
    async fn upload_if_absent(
        &self,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<BlobRef> {
        let mut url = self.url(&["upload", "storage", "v1", "b", bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name)
            .append_pair("ifGenerationMatch", "0");
        let builder = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data);
        let response = self.send(builder, bucket, name, already_exists).await?;
        parse_object(response).await
    }

    async fn delete(&self, blob: &BlobRef) -> StoreResult<()> {
        let mut url = self.object_url(&blob.bucket, &blob.name);
        url.query_pairs_mut()
            .append_pair("ifGenerationMatch", &blob.generation.to_string());
        self.send(
            self.request(Method::DELETE, url),
            &blob.bucket,
            &blob.name,
            changed,
        )
        .await?;
        Ok(())
    }

    async fn copy_if_absent(
        &self,
        blob: &BlobRef,
        dest_bucket: &str,
        dest_name: &str,
    ) -> StoreResult<BlobRef> {
        let url = self.copy_url(blob, dest_bucket, dest_name);
        let response = self
            .send(
                self.request(Method::POST, url),
                dest_bucket,
                dest_name,
                already_exists,
            )
            .await?;
        parse_object(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_names_are_single_path_segments() {
        let store = GcsStore::new(Some("http://localhost:4443/"), None).unwrap();
        assert_eq!(
            store.object_url("src", "scans/a.pdf/001.png").as_str(),
            "http://localhost:4443/storage/v1/b/src/o/scans%2Fa.pdf%2F001.png"
        );
    }

    #[test]
    fn copies_name_the_source_generation() {
        let store = GcsStore::new(Some("http://localhost:4443"), None).unwrap();
        let blob = BlobRef {
            bucket: "src".to_owned(),
            name: "A/count".to_owned(),
            content_hash: "abc==".to_owned(),
            generation: 42,
        };
        let url = store.copy_url(&blob, "dst", "A/count");
        assert_eq!(url.path(), "/storage/v1/b/src/o/A%2Fcount/copyTo/b/dst/o/A%2Fcount");
        let query = url.query_pairs().collect::<Vec<_>>();
        assert!(query.contains(&("sourceGeneration".into(), "42".into())));
        assert!(query.contains(&("ifGenerationMatch".into(), "0".into())));
        assert!(!query.iter().any(|(key, _)| key == "ifSourceGenerationMatch"));
    }

    #[test]
    fn default_endpoint_is_public_gcs() {
        let store = GcsStore::new(None, None).unwrap();
        assert_eq!(
            store.url(&["storage", "v1", "b", "dst", "o"]).as_str(),
            "https://storage.googleapis.com/storage/v1/b/dst/o"
        );
    }

    #[test]
    fn rejects_bad_endpoints() {
        assert!(GcsStore::new(Some("not a url"), None).is_err());
        assert!(GcsStore::new(Some("mailto:someone@example.com"), None).is_err());
    }

    #[test]
    fn parses_object_resources() {
        let resource: ObjectResource = serde_json::from_str(
            r#"{"name": "a/001.png", "bucket": "src", "generation": "1712",
                "md5Hash": "abc==", "size": "10"}"#,
        )
        .unwrap();
        let blob = resource.into_blob_ref().unwrap();
        assert_eq!(blob.generation, 1712);
        assert_eq!(blob.content_hash, "abc==");

        let resource: ObjectResource = serde_json::from_str(
            r#"{"name": "a/001.png", "bucket": "src", "generation": "7"}"#,
        )
        .unwrap();
        assert_eq!(resource.into_blob_ref().unwrap().content_hash, "a/001.png#7");
    }
}
