//! The `stage` subcommand, which uploads pre-rendered pages to the source
//! bucket.

use std::collections::BTreeMap;

use clap::Args;
use futures::{StreamExt as _, TryStreamExt as _, stream};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    paths::{DocumentId, ObjectName, marker_path},
    prelude::*,
    store::{
        StoreOpts, StoreResultExt as _,
        fs::{relative_name, walk_files},
    },
    ui::{ProgressConfig, Ui},
};

/// Stage command line arguments.
#[derive(Debug, Args)]
pub struct StageOpts {
    /// A directory containing `<document-id>/<NNN>.png` page images.
    #[clap(value_name = "DIR")]
    pub input_dir: PathBuf,

    /// The bucket to upload to.
    #[clap(long, env = "SOURCE_BUCKET")]
    pub source_bucket: String,

    /// Max number of uploads to run at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    #[clap(flatten)]
    pub store_opts: StoreOpts,
}

/// A local page image and where it goes.
struct LocalPage {
    path: PathBuf,
    name: String,
}

/// The `stage` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_stage(ui: Ui, opts: &StageOpts) -> Result<()> {
    let store = opts.store_opts.create_store()?;
    let documents = find_pages(&opts.input_dir).await?;
    let page_count = documents.values().map(Vec::len).sum::<usize>();
    info!(
        "staging {} pages from {} documents",
        page_count,
        documents.len()
    );

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📤",
            msg: "Uploading pages",
            done_msg: "Uploaded pages",
        },
        u64::try_from(page_count).context("too many pages")?,
    );
    let uploads = documents.values().flatten().map(|page| {
        let store = store.clone();
        let bucket = opts.source_bucket.as_str();
        async move {
            let data = tokio::fs::read(&page.path)
                .await
                .with_context(|| format!("could not read {}", page.path.display()))?;
            let content_type = mime_guess::from_path(&page.path).first_or_octet_stream();
            let uploaded = store
                .upload_if_absent(bucket, &page.name, data, content_type.essence_str())
                .await
                .or_already_exists()
                .with_context(|| format!("could not upload {}", page.name))?;
            if uploaded.is_none() {
                debug!("{} already exists in {}", page.name, bucket);
            }
            Ok::<_, anyhow::Error>(())
        }
    });
    pb.wrap_stream(stream::iter(uploads).buffer_unordered(opts.job_count.max(1)))
        .try_collect::<Vec<()>>()
        .await?;

    // Markers go last, once every page they count is in place.
    for (document_id, pages) in &documents {
        let name = marker_path(document_id);
        let uploaded = store
            .upload_if_absent(
                &opts.source_bucket,
                &name,
                pages.len().to_string().into_bytes(),
                "text/plain",
            )
            .await
            .or_already_exists()
            .with_context(|| format!("could not upload {name}"))?;
        match uploaded {
            Some(_) => info!("staged {} with {} pages", document_id, pages.len()),
            None => debug!("{} already exists", name),
        }
    }
    Ok(())
}

/// Find page images under `dir`, grouped by document. Other files are
/// ignored with a warning.
async fn find_pages(dir: &Path) -> Result<BTreeMap<DocumentId, Vec<LocalPage>>> {
    let base = dir.to_owned();
    let files = spawn_blocking_propagating_panics(move || walk_files(&base))
        .await
        .with_context(|| format!("could not list {}", dir.display()))?;

    let mut documents = BTreeMap::<DocumentId, Vec<LocalPage>>::new();
    for path in files {
        let name = relative_name(dir, &path)?;
        match ObjectName::parse(&name) {
            Some(ObjectName::Page { document_id, .. }) => {
                documents
                    .entry(document_id)
                    .or_default()
                    .push(LocalPage { path, name });
            }
            _ => warn!("skipping {}: not a page image", path.display()),
        }
    }
    if documents.is_empty() {
        return Err(anyhow!("no page images found in {}", dir.display()));
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn groups_pages_by_document() {
        let dir = tempfile::TempDir::with_prefix("stage").unwrap();
        for name in ["A/001.png", "A/002.png", "scans/B/001.png", "A/notes.txt"] {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        let documents = find_pages(dir.path()).await.unwrap();
        let summary = documents
            .iter()
            .map(|(id, pages)| {
                let names = pages.iter().map(|p| p.name.as_str()).collect::<Vec<_>>();
                (id.as_str(), names)
            })
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            [
                ("A", vec!["A/001.png", "A/002.png"]),
                ("scans/B", vec!["scans/B/001.png"]),
            ]
        );
    }

    #[tokio::test]
    async fn empty_directories_are_an_error() {
        let dir = tempfile::TempDir::with_prefix("stage").unwrap();
        assert!(find_pages(dir.path()).await.is_err());
    }
}
