//! The OCR stage: page jobs in, page results out.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    async_utils::JoinWorker, engines::OcrEngine, prelude::*, store::ObjectStore,
};

use super::{OcrResult, PageJob};

/// Runs each page through the OCR engine, one page at a time.
pub struct OcrStage {
    store: Arc<dyn ObjectStore>,
    engine: Box<dyn OcrEngine>,

    /// Stop at the first OCR failure instead of skipping the page.
    fail_fast: bool,
}

impl OcrStage {
    /// Create a new stage. The stage owns `engine` for its whole lifetime.
    pub fn new(store: Arc<dyn ObjectStore>, engine: Box<dyn OcrEngine>, fail_fast: bool) -> Self {
        Self {
            store,
            engine,
            fail_fast,
        }
    }

    /// Run the stage in the background. It exits, closing `result_tx`, once
    /// `page_rx` is closed and empty.
    pub fn spawn(
        self,
        page_rx: mpsc::Receiver<PageJob>,
        result_tx: mpsc::Sender<OcrResult>,
    ) -> JoinWorker {
        JoinWorker::spawn("OCR stage", self.run(page_rx, result_tx))
    }

    async fn run(
        self,
        mut page_rx: mpsc::Receiver<PageJob>,
        result_tx: mpsc::Sender<OcrResult>,
    ) -> Result<()> {
        while let Some(job) = page_rx.recv().await {
            let Some(result) = self.process(job).await? else {
                continue;
            };
            if result_tx.send(result).await.is_err() {
                warn!("sink has stopped; OCR stage exiting");
                return Ok(());
            }
        }
        debug!("page channel closed; OCR stage exiting");
        Ok(())
    }

    /// OCR one page. Returns `None` if the engine failed and we're skipping
    /// the page. Such pages stay pending, so their document is kept.
    #[instrument(level = "debug", skip_all, fields(document = %job.document_id, page = %job.page))]
    async fn process(&self, job: PageJob) -> Result<Option<OcrResult>> {
        info!("processing blob {:?}", job.blob.name);
        let image = self
            .store
            .read(&job.blob)
            .await
            .with_context(|| format!("could not read {}", job.blob.name))?;
        match self.engine.predict(&image).await {
            Ok(document) => {
                debug!(words = document.word_count(), "recognized page");
                Ok(Some(OcrResult {
                    document_id: job.document_id,
                    page: job.page,
                    document,
                }))
            }
            Err(err) if self.fail_fast => {
                Err(err.context(format!("OCR failed for {}", job.blob.name)))
            }
            Err(err) => {
                error!(
                    "OCR failed for {}; skipping it until the next run: {:?}",
                    job.blob.name, err
                );
                Ok(None)
            }
        }
    }
}
