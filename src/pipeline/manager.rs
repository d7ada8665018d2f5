//! The manager decides which pages need OCR, and which documents are finished
//! and can be removed from the source bucket.
//!
//! It runs as a single actor task which owns the pending-page map and the
//! dedup set. Discovery never blocks on a full channel: jobs and markers wait
//! in local outboxes and are only handed over once the channel has room, so
//! the manager keeps consuming completion signals even when the OCR stage is
//! backed up.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use tokio::sync::{
    mpsc::{self, OwnedPermit, error::TrySendError},
    watch,
};

use crate::{
    async_utils::JoinWorker,
    paths::{DocumentId, ObjectName, PageNumber, result_path},
    prelude::*,
    store::{BlobRef, ObjectStore, StoreError},
};

use super::{
    CompletionSignal, PageJob,
    dedup::DedupSet,
    pending::{Completion, PendingPages},
};

/// Settings for the manager.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Where we find page images and markers.
    pub source_bucket: String,

    /// Where we write results and copy markers.
    pub sink_bucket: String,

    /// Run a single discovery pass, then close the page and marker channels
    /// once everything has been handed over.
    pub once: bool,
}

/// Asks the manager to run a discovery pass. Requests made while one is
/// already queued are merged into it.
#[derive(Clone, Debug)]
pub struct DiscoveryTrigger {
    tx: mpsc::Sender<()>,
}

impl DiscoveryTrigger {
    /// Request a discovery pass. Never blocks.
    pub fn request(&self) {
        match self.tx.try_send(()) {
            Ok(()) => trace!("discovery requested"),
            Err(TrySendError::Full(())) => debug!("discovery already queued"),
            Err(TrySendError::Closed(())) => {
                debug!("manager has stopped; ignoring discovery request")
            }
        }
    }
}

/// A handle to a running manager.
pub struct ManagerHandle {
    worker: JoinWorker,
    trigger: DiscoveryTrigger,
    passes: watch::Receiver<u64>,
}

impl ManagerHandle {
    /// Start the manager. The first discovery pass is queued immediately.
    pub fn spawn(
        store: Arc<dyn ObjectStore>,
        config: ManagerConfig,
        page_tx: mpsc::Sender<PageJob>,
        marker_tx: mpsc::Sender<BlobRef>,
        completion_rx: mpsc::Receiver<CompletionSignal>,
    ) -> Self {
        let (discover_tx, discover_rx) = mpsc::channel(1);
        let trigger = DiscoveryTrigger { tx: discover_tx };
        trigger.request();

        let (passes_tx, passes) = watch::channel(0);
        let manager = Manager {
            store,
            config,
            pending: PendingPages::new(),
            dedup: DedupSet::new(),
            page_outbox: VecDeque::new(),
            marker_outbox: VecDeque::new(),
            passes: passes_tx,
        };
        let worker = JoinWorker::spawn(
            "manager",
            manager.run(page_tx, marker_tx, discover_rx, completion_rx),
        );
        Self {
            worker,
            trigger,
            passes,
        }
    }

    /// A trigger which can be handed to a [`super::ticker::Ticker`].
    pub fn trigger(&self) -> DiscoveryTrigger {
        self.trigger.clone()
    }

    /// Request a discovery pass.
    pub fn request_discovery(&self) {
        self.trigger.request();
    }

    /// Watch the number of completed discovery passes.
    pub fn discovery_passes(&self) -> watch::Receiver<u64> {
        self.passes.clone()
    }

    /// Cancel discovery and cleanup. This closes the page and marker
    /// channels, so downstream stages drain and exit.
    pub fn stop(&self) {
        debug!("stopping manager");
        self.worker.abort();
    }

    /// Has the manager exited?
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the manager to exit.
    pub async fn join(self) -> Result<()> {
        self.worker.join().await
    }
}

/// Reserve a slot in `tx`. Returns `None` if the receiver is gone, and never
/// completes if we've already closed our end.
async fn reserve<T>(tx: Option<mpsc::Sender<T>>) -> Option<OwnedPermit<T>> {
    match tx {
        Some(tx) => tx.reserve_owned().await.ok(),
        None => std::future::pending().await,
    }
}

/// Manager state. Only the actor task touches this.
struct Manager {
    store: Arc<dyn ObjectStore>,
    config: ManagerConfig,
    pending: PendingPages,
    dedup: DedupSet,

    /// Page jobs waiting for room in the page channel.
    page_outbox: VecDeque<PageJob>,

    /// Markers waiting for room in the marker channel.
    marker_outbox: VecDeque<BlobRef>,

    /// Number of finished discovery passes.
    passes: watch::Sender<u64>,
}

impl Manager {
    /// The actor loop. Exits when the completion channel closes, which happens
    /// once the sink has written everything it will ever receive.
    async fn run(
        mut self,
        page_tx: mpsc::Sender<PageJob>,
        marker_tx: mpsc::Sender<BlobRef>,
        mut discover_rx: mpsc::Receiver<()>,
        mut completion_rx: mpsc::Receiver<CompletionSignal>,
    ) -> Result<()> {
        let mut page_tx = Some(page_tx);
        let mut marker_tx = Some(marker_tx);
        let mut accepting_discovery = true;

        loop {
            if self.config.once
                && (page_tx.is_some() || marker_tx.is_some())
                && *self.passes.borrow() > 0
                && self.page_outbox.is_empty()
                && self.marker_outbox.is_empty()
            {
                info!("all discovered work handed over; closing intake");
                page_tx = None;
                marker_tx = None;
            }

            tokio::select! {
                permit = reserve(page_tx.clone()), if !self.page_outbox.is_empty() => match permit {
                    Some(permit) => {
                        if let Some(job) = self.page_outbox.pop_front() {
                            trace!(blob = %job.blob.name, "sending page job");
                            permit.send(job);
                        }
                    }
                    None => {
                        warn!(
                            "OCR stage has stopped; dropping {} queued pages",
                            self.page_outbox.len()
                        );
                        self.page_outbox.clear();
                        page_tx = None;
                    }
                },
                permit = reserve(marker_tx.clone()), if !self.marker_outbox.is_empty() => match permit {
                    Some(permit) => {
                        if let Some(marker) = self.marker_outbox.pop_front() {
                            permit.send(marker);
                        }
                    }
                    None => {
                        warn!(
                            "marker copier has stopped; dropping {} queued markers",
                            self.marker_outbox.len()
                        );
                        self.marker_outbox.clear();
                        marker_tx = None;
                    }
                },
                request = discover_rx.recv(), if accepting_discovery => match request {
                    Some(()) => {
                        self.discover().await?;
                        if self.config.once {
                            accepting_discovery = false;
                        }
                    }
                    None => accepting_discovery = false,
                },
                signal = completion_rx.recv() => match signal {
                    Some(signal) => self.handle_completion(signal).await?,
                    None => {
                        debug!(
                            pending_documents = self.pending.document_count(),
                            "completion channel closed; manager exiting"
                        );
                        return Ok(());
                    }
                },
            }
        }
    }

    /// List both buckets, update the pending map, and queue every pending
    /// page we haven't already sent downstream.
    #[instrument(level = "debug", skip_all)]
    async fn discover(&mut self) -> Result<()> {
        let source_bucket = &self.config.source_bucket;
        let sink_bucket = &self.config.sink_bucket;
        info!("listing blobs from {source_bucket}");
        let sources = self
            .store
            .list(source_bucket, None)
            .await
            .with_context(|| format!("could not list {source_bucket}"))?;

        // Pages in listing order, so we can queue them in that order below.
        let mut listed: Vec<(DocumentId, PageNumber)> = vec![];
        for blob in sources {
            match ObjectName::parse(&blob.name) {
                Some(ObjectName::Page { document_id, page }) => {
                    listed.push((document_id.clone(), page));
                    self.pending.insert(document_id, page, blob);
                }
                Some(ObjectName::Marker { .. }) => {
                    debug!(blob = %blob.name, "queueing marker for copy");
                    self.marker_outbox.push_back(blob);
                }
                Some(ObjectName::Result { .. }) | None => {
                    debug!(blob = %blob.name, "ignoring unrecognized source object");
                }
            }
        }

        info!("listing results from {sink_bucket}");
        let results = self
            .store
            .list(sink_bucket, None)
            .await
            .with_context(|| format!("could not list {sink_bucket}"))?;
        let mut resumed = 0;
        for blob in results {
            if let Some(ObjectName::Result { document_id, page }) = ObjectName::parse(&blob.name) {
                if self.pending.remove_written(&document_id, page) {
                    resumed += 1;
                }
            }
        }

        let mut queued = 0;
        for (document_id, page) in listed {
            let Some(blob) = self.pending.get(&document_id, page) else {
                continue;
            };
            if !self.dedup.insert(&blob.content_hash) {
                trace!(blob = %blob.name, "already enqueued; skipping");
                continue;
            }
            info!("inserting blob {:?} ({})", blob.name, blob.content_hash);
            self.page_outbox.push_back(PageJob {
                blob: blob.clone(),
                document_id,
                page,
            });
            queued += 1;
        }

        for document_id in self.pending.take_empty_documents() {
            debug!(document = %document_id, "no pages left to OCR");
            self.tear_down(&document_id).await?;
        }

        info!(
            queued,
            resumed,
            pending_pages = self.pending.page_count(),
            seen_pages = self.dedup.len(),
            "discovery pass finished"
        );
        self.passes.send_modify(|passes| *passes += 1);
        Ok(())
    }

    /// Record a written page, and tear down its document if it was the last.
    async fn handle_completion(&mut self, signal: CompletionSignal) -> Result<()> {
        let CompletionSignal { document_id, page } = signal;
        match self.pending.complete(&document_id, page) {
            Completion::Untracked => {
                debug!(document = %document_id, %page, "completion for untracked page");
            }
            Completion::Remaining(remaining) => {
                debug!(document = %document_id, %page, remaining, "page finished");
            }
            Completion::DocumentDone => self.tear_down(&document_id).await?,
        }
        Ok(())
    }

    /// Delete a finished document's source objects. Objects of other
    /// documents nested under the same prefix are left alone, and so are pages
    /// without a result, which must have arrived after discovery. The marker is
    /// copied before it's deleted, unless a copy already exists.
    #[instrument(level = "debug", skip(self), fields(document = %document_id))]
    async fn tear_down(&self, document_id: &DocumentId) -> Result<()> {
        let source_bucket = &self.config.source_bucket;
        let sink_bucket = &self.config.sink_bucket;
        let prefix = document_id.prefix();
        info!("dropping blobs with prefix {prefix:?} from {source_bucket}");
        let sources = self
            .store
            .list(source_bucket, Some(&prefix))
            .await
            .with_context(|| format!("could not list {prefix:?} in {source_bucket}"))?;
        let written = self
            .store
            .list(sink_bucket, Some(&prefix))
            .await
            .with_context(|| format!("could not list {prefix:?} in {sink_bucket}"))?
            .into_iter()
            .map(|blob| blob.name)
            .collect::<HashSet<_>>();

        let mut doomed = vec![];
        let mut marker = None;
        let mut unprocessed = 0;
        for blob in sources {
            if blob.name[prefix.len()..].contains('/') {
                continue;
            }
            match ObjectName::parse(&blob.name) {
                Some(ObjectName::Page { document_id, page })
                    if !written.contains(&result_path(&document_id, page)) =>
                {
                    info!("{} has no result yet; leaving it for the next pass", blob.name);
                    unprocessed += 1;
                }
                Some(ObjectName::Marker { .. }) => marker = Some(blob),
                _ => doomed.push(blob),
            }
        }
        if let Some(marker) = marker {
            if unprocessed > 0 {
                debug!(blob = %marker.name, "keeping marker with unprocessed pages");
            } else {
                if !written.contains(&marker.name) {
                    self.copy_marker(&marker).await?;
                }
                doomed.push(marker);
            }
        }

        for blob in doomed {
            match self.store.delete(&blob).await {
                Ok(()) => trace!(blob = %blob.name, "deleted"),
                Err(StoreError::NotFound { .. }) => {
                    debug!(blob = %blob.name, "already deleted");
                }
                Err(StoreError::Changed { .. }) => {
                    warn!(
                        "{} changed since it was listed; leaving it for the next pass",
                        blob.name
                    );
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err))
                        .with_context(|| format!("could not delete {}", blob.name));
                }
            }
        }
        Ok(())
    }

    /// Copy a marker we're about to delete. The copy loop may not have got to
    /// it yet, or may have been cancelled in an earlier run.
    async fn copy_marker(&self, marker: &BlobRef) -> Result<()> {
        let sink_bucket = &self.config.sink_bucket;
        match self
            .store
            .copy_if_absent(marker, sink_bucket, &marker.name)
            .await
        {
            Ok(_) => info!(
                "copied blob {} to {sink_bucket} before removing it",
                marker.name
            ),
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(blob = %marker.name, "marker already copied")
            }
            Err(StoreError::NotFound { .. }) => {
                debug!(blob = %marker.name, "marker already removed")
            }
            Err(err) => {
                return Err(anyhow::Error::new(err))
                    .with_context(|| format!("could not copy {} to {sink_bucket}", marker.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::{
        paths::page_path,
        pipeline::COMPLETION_CHANNEL_CAPACITY,
        store::memory::MemoryStore,
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// A manager wired to channels we control.
    struct Harness {
        store: Arc<MemoryStore>,
        handle: ManagerHandle,
        page_rx: mpsc::Receiver<PageJob>,
        marker_rx: mpsc::Receiver<BlobRef>,
        completion_tx: mpsc::Sender<CompletionSignal>,
    }

    impl Harness {
        fn start(store: Arc<MemoryStore>, page_capacity: usize, once: bool) -> Self {
            let (page_tx, page_rx) = mpsc::channel(page_capacity);
            let (marker_tx, marker_rx) = mpsc::channel(100);
            let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
            let config = ManagerConfig {
                source_bucket: "src".to_owned(),
                sink_bucket: "dst".to_owned(),
                once,
            };
            let handle =
                ManagerHandle::spawn(store.clone(), config, page_tx, marker_tx, completion_rx);
            Self {
                store,
                handle,
                page_rx,
                marker_rx,
                completion_tx,
            }
        }

        async fn wait_for_passes(&self, count: u64) {
            let mut passes = self.handle.discovery_passes();
            timeout(WAIT, passes.wait_for(|passes| *passes >= count))
                .await
                .expect("timed out waiting for discovery")
                .unwrap();
        }

        async fn next_job(&mut self) -> PageJob {
            timeout(WAIT, self.page_rx.recv())
                .await
                .expect("timed out waiting for a page job")
                .expect("page channel closed")
        }

        /// Write a result and signal its completion, as the sink does.
        async fn complete(&self, document_id: &str, page: u32) {
            let document_id = DocumentId::new(document_id);
            let page = PageNumber::new(page);
            self.store.put("dst", &result_path(&document_id, page), "{}");
            self.completion_tx
                .send(CompletionSignal { document_id, page })
                .await
                .unwrap();
        }

        /// Wait until the source bucket holds exactly `names`.
        async fn wait_for_sources(&self, names: &[&str]) {
            let expected = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
            timeout(WAIT, async {
                while self.store.names("src") != expected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap_or_else(|_| panic!("sources are {:?}", self.store.names("src")));
        }
    }

    fn doc_a_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "page one");
        store.put("src", "A/002.png", "page two");
        store.put("src", "A/count", "2");
        store
    }

    #[tokio::test]
    async fn emits_pages_and_markers_then_tears_down_after_all_completions() {
        let mut harness = Harness::start(doc_a_store(), 100, false);

        let first = harness.next_job().await;
        let second = harness.next_job().await;
        assert_eq!(first.blob.name, "A/001.png");
        assert_eq!(second.blob.name, "A/002.png");
        let marker = timeout(WAIT, harness.marker_rx.recv()).await.unwrap().unwrap();
        assert_eq!(marker.name, "A/count");

        // Out of order, and one page at a time.
        harness.complete("A", 2).await;
        harness.complete("A", 2).await;
        harness.complete("B", 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.store.names("src").len(), 3);

        harness.complete("A", 1).await;
        harness.wait_for_sources(&[]).await;
    }

    #[tokio::test]
    async fn resumes_from_existing_results() {
        let store = doc_a_store();
        store.put("dst", "A/001.json", "{}");
        let mut harness = Harness::start(store, 100, false);

        let job = harness.next_job().await;
        assert_eq!(job.page, PageNumber::new(2));
        harness.wait_for_passes(1).await;
        assert!(harness.page_rx.try_recv().is_err());

        harness.complete("A", 2).await;
        harness.wait_for_sources(&[]).await;
    }

    #[tokio::test]
    async fn fully_written_documents_are_removed_immediately() {
        let store = doc_a_store();
        store.put("src", "B/001.png", "other document");
        store.put("dst", "A/001.json", "{}");
        store.put("dst", "A/002.json", "{}");
        let harness = Harness::start(store, 100, false);

        harness.wait_for_passes(1).await;
        assert_eq!(harness.store.names("src"), vec!["B/001.png".to_owned()]);
        assert_eq!(harness.store.get("dst", "A/count"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn markers_are_copied_before_teardown() {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "page one");
        store.put("src", "A/count", "1");
        store.put("dst", "A/001.json", "{}");
        let mut harness = Harness::start(store, 100, false);

        // Nobody is reading markers, so only teardown can have copied it.
        harness.wait_for_passes(1).await;
        harness.wait_for_sources(&[]).await;
        assert_eq!(harness.store.get("dst", "A/count"), Some(b"1".to_vec()));
        let queued = timeout(WAIT, harness.marker_rx.recv()).await.unwrap().unwrap();
        assert_eq!(queued.name, "A/count");
    }

    #[tokio::test]
    async fn existing_marker_copies_are_kept() {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "page one");
        store.put("src", "A/count", "1");
        store.put("dst", "A/001.json", "{}");
        store.put("dst", "A/count", "copied earlier");
        let harness = Harness::start(store, 100, false);

        harness.wait_for_passes(1).await;
        harness.wait_for_sources(&[]).await;
        assert_eq!(
            harness.store.get("dst", "A/count"),
            Some(b"copied earlier".to_vec())
        );
    }

    #[tokio::test]
    async fn teardown_keeps_pages_uploaded_after_discovery() {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "page one");
        store.put("src", "A/count", "2");
        let mut harness = Harness::start(store.clone(), 100, false);
        harness.next_job().await;
        harness.wait_for_passes(1).await;

        store.put("src", "A/002.png", "page two");
        harness.complete("A", 1).await;
        harness.wait_for_sources(&["A/002.png", "A/count"]).await;
        assert!(store.get("dst", "A/count").is_none());

        // The next pass picks the late page up and finishes the document.
        harness.handle.request_discovery();
        let job = harness.next_job().await;
        assert_eq!(job.page, PageNumber::new(2));
        harness.complete("A", 2).await;
        harness.wait_for_sources(&[]).await;
        assert_eq!(store.get("dst", "A/count"), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn teardown_leaves_nested_documents_alone() {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "outer");
        store.put("src", "A/inner/001.png", "inner");
        store.put("src", "A1/001.png", "neighbour");
        let mut harness = Harness::start(store, 100, false);
        for _ in 0..3 {
            harness.next_job().await;
        }

        harness.complete("A", 1).await;
        harness
            .wait_for_sources(&["A/inner/001.png", "A1/001.png"])
            .await;
    }

    #[tokio::test]
    async fn repeated_discovery_does_not_requeue_pages() {
        let mut harness = Harness::start(doc_a_store(), 100, false);
        harness.next_job().await;
        harness.next_job().await;
        harness.wait_for_passes(1).await;

        harness.handle.request_discovery();
        harness.wait_for_passes(2).await;
        assert!(harness.page_rx.try_recv().is_err());

        // The document is still torn down exactly once.
        harness.complete("A", 1).await;
        harness.complete("A", 2).await;
        harness.wait_for_sources(&[]).await;
    }

    #[tokio::test]
    async fn identical_content_is_enqueued_once_per_pass() {
        let store = Arc::new(MemoryStore::new());
        store.put("src", "A/001.png", "same bytes");
        store.put("src", "A/002.png", "same bytes");
        let mut harness = Harness::start(store, 100, false);
        let job = harness.next_job().await;
        assert_eq!(job.blob.name, "A/001.png");
        harness.wait_for_passes(1).await;
        assert!(harness.page_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_page_channel_does_not_block_completions() {
        let store = Arc::new(MemoryStore::new());
        for page in 1..=5 {
            let id = DocumentId::new("A");
            store.put(
                "src",
                &page_path(&id, PageNumber::new(page)),
                format!("page {page}"),
            );
        }
        let mut harness = Harness::start(store.clone(), 1, false);
        harness.wait_for_passes(1).await;

        // Only one job fits, but the manager still handles signals while the
        // rest wait in its outbox.
        harness.complete("Z", 1).await;
        for _ in 0..COMPLETION_CHANNEL_CAPACITY + 1 {
            harness.complete("Z", 1).await;
        }
        for page in 1..=5 {
            let job = harness.next_job().await;
            assert_eq!(job.page, PageNumber::new(page));
            harness.complete("A", page).await;
        }
        harness.wait_for_sources(&[]).await;
    }

    #[tokio::test]
    async fn one_shot_mode_closes_intake_after_first_pass() {
        let mut harness = Harness::start(doc_a_store(), 100, true);
        harness.next_job().await;
        harness.next_job().await;
        let closed = timeout(WAIT, harness.page_rx.recv()).await.unwrap();
        assert!(closed.is_none());
        let marker = timeout(WAIT, harness.marker_rx.recv()).await.unwrap();
        assert!(marker.is_some());
        assert!(timeout(WAIT, harness.marker_rx.recv()).await.unwrap().is_none());

        // Cleanup still runs until the completion channel closes.
        harness.complete("A", 1).await;
        harness.complete("A", 2).await;
        let Harness {
            handle,
            completion_tx,
            store,
            ..
        } = harness;
        drop(completion_tx);
        timeout(WAIT, handle.join()).await.unwrap().unwrap();
        assert!(store.names("src").is_empty());
    }

    #[tokio::test]
    async fn listing_failures_are_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.fail_bucket("src");
        let harness = Harness::start(store, 100, false);
        let err = timeout(WAIT, harness.handle.join()).await.unwrap().unwrap_err();
        assert!(format!("{err:?}").contains("could not list src"));
    }
}
