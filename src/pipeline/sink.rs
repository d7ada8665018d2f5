//! The sink writes OCR results and copies page-count markers.
//!
//! Writes are conditional creates, so a result which is delivered twice is
//! written once. Either way, a completion signal is sent back to the manager
//! after the write attempt.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::{
    async_utils::JoinWorker,
    paths::result_path,
    prelude::*,
    store::{BlobRef, ObjectStore, StoreError, StoreResultExt as _},
};

use super::{CompletionSignal, OcrResult};

/// Writes results to the destination bucket.
pub struct Sink {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

/// A handle to the sink's background loops.
pub struct SinkHandle {
    write_worker: JoinWorker,
    copy_worker: JoinWorker,
    alive: watch::Receiver<bool>,
}

/// Marks the write loop as stopped when dropped, however the loop exits.
struct AliveGuard(watch::Sender<bool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl Sink {
    /// Create a sink writing to `bucket`.
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Start the write loop and the marker copy loop.
    ///
    /// The write loop runs until `result_rx` is closed and empty, and the copy
    /// loop until `marker_rx` is. If the manager has gone away, results are
    /// still written.
    pub fn spawn(
        self,
        result_rx: mpsc::Receiver<OcrResult>,
        marker_rx: mpsc::Receiver<BlobRef>,
        completion_tx: mpsc::Sender<CompletionSignal>,
    ) -> SinkHandle {
        let sink = Arc::new(self);
        let (alive_tx, alive) = watch::channel(true);
        let write_worker = JoinWorker::spawn(
            "sink",
            sink.clone()
                .write_loop(result_rx, completion_tx, AliveGuard(alive_tx)),
        );
        let copy_worker = JoinWorker::spawn("marker copier", sink.copy_loop(marker_rx));
        SinkHandle {
            write_worker,
            copy_worker,
            alive,
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut result_rx: mpsc::Receiver<OcrResult>,
        completion_tx: mpsc::Sender<CompletionSignal>,
        _alive: AliveGuard,
    ) -> Result<()> {
        let mut completion_tx = Some(completion_tx);
        while let Some(result) = result_rx.recv().await {
            let signal = self.write_result(result).await?;
            if let Some(tx) = &completion_tx {
                if tx.send(signal).await.is_err() {
                    debug!("manager has stopped; no longer sending completion signals");
                    completion_tx = None;
                }
            }
        }
        debug!("result channel closed; sink exiting");
        Ok(())
    }

    /// Write one result. Finding an existing result counts as success.
    #[instrument(level = "debug", skip_all, fields(document = %result.document_id, page = %result.page))]
    pub async fn write_result(&self, result: OcrResult) -> Result<CompletionSignal> {
        let OcrResult {
            document_id,
            page,
            document,
        } = result;
        let name = result_path(&document_id, page);
        let data = serde_json::to_vec(&document).context("could not serialize OCR result")?;
        let written = self
            .store
            .upload_if_absent(&self.bucket, &name, data, "application/json")
            .await
            .or_already_exists()
            .with_context(|| format!("could not write {name} to {}", self.bucket))?;
        match written {
            Some(_) => info!("saved ocr result {name:?} to {}", self.bucket),
            None => debug!("ocr result {name:?} already exists in {}", self.bucket),
        }
        Ok(CompletionSignal { document_id, page })
    }

    /// Copy markers verbatim. This is best effort: failures are logged, and
    /// never hold up a document's cleanup.
    async fn copy_loop(self: Arc<Self>, mut marker_rx: mpsc::Receiver<BlobRef>) -> Result<()> {
        while let Some(marker) = marker_rx.recv().await {
            self.copy_marker(&marker).await;
        }
        debug!("marker channel closed; marker copier exiting");
        Ok(())
    }

    /// Copy one marker to the same name in our bucket.
    pub async fn copy_marker(&self, marker: &BlobRef) {
        let result = self
            .store
            .copy_if_absent(marker, &self.bucket, &marker.name)
            .await;
        match result {
            Ok(_) => info!("copied blob {} to {}", marker.name, self.bucket),
            Err(StoreError::AlreadyExists { .. }) => {
                debug!("blob {} already exists in {}", marker.name, self.bucket)
            }
            Err(StoreError::NotFound { .. }) => {
                debug!("{} was removed with its document", marker.name)
            }
            Err(err) => error!("could not copy {}: {}", marker.name, err),
        }
    }
}

impl SinkHandle {
    /// Is the write loop still running?
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Wait until the write loop has stopped.
    pub async fn write_loop_stopped(&self) {
        let mut alive = self.alive.clone();
        // An error means the guard is gone, which also means we've stopped.
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    /// Wait for both loops to exit, returning the first error.
    pub async fn join(self) -> Result<()> {
        let written = self.write_worker.join().await;
        let copied = self.copy_worker.join().await;
        written.and(copied)
    }
}
