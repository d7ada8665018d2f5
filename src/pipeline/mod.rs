//! The OCR job pipeline.
//!
//! ```text
//! manager --pages--> OCR stage --results--> sink --completions--> manager
//!    \-----------------markers-------------> sink
//! ```
//!
//! Every channel is bounded, so a slow stage pushes back on the stages feeding
//! it. The manager is the only task which knows which pages are pending, and
//! it deletes a document's sources only after every one of its pages has been
//! written.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    async_utils::BoxedFuture,
    document::PageDocument,
    engines::OcrEngine,
    paths::{DocumentId, PageNumber},
    prelude::*,
    store::{BlobRef, ObjectStore},
};

use self::{
    manager::{ManagerConfig, ManagerHandle},
    ocr_stage::OcrStage,
    shutdown::ShutdownCoordinator,
    sink::Sink,
    ticker::{TickFn, Ticker},
};

pub mod dedup;
pub mod manager;
pub mod ocr_stage;
pub mod pending;
pub mod shutdown;
pub mod sink;
pub mod ticker;

/// Page jobs waiting for OCR.
pub const PAGE_CHANNEL_CAPACITY: usize = 100;

/// OCR results waiting to be written. Results can be large, so keep this
/// small.
pub const RESULT_CHANNEL_CAPACITY: usize = 10;

/// Markers waiting to be copied.
pub const MARKER_CHANNEL_CAPACITY: usize = 100;

/// Completion signals waiting for the manager.
pub const COMPLETION_CHANNEL_CAPACITY: usize = 100;

/// A page which needs OCR.
#[derive(Clone, Debug)]
pub struct PageJob {
    pub document_id: DocumentId,
    pub page: PageNumber,
    pub blob: BlobRef,
}

/// The OCR output for one page.
#[derive(Clone, Debug)]
pub struct OcrResult {
    pub document_id: DocumentId,
    pub page: PageNumber,
    pub document: PageDocument,
}

/// Sent by the sink once a page's result is durably stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionSignal {
    pub document_id: DocumentId,
    pub page: PageNumber,
}

/// Pipeline settings.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// The bucket containing page images and page-count markers.
    pub source_bucket: String,

    /// The bucket to write results to.
    pub sink_bucket: String,

    /// How often to look for new work. `None` disables polling.
    pub poll_interval: Option<Duration>,

    /// Process what's there now, then exit.
    pub once: bool,

    /// Treat OCR failures as fatal.
    pub fail_fast: bool,
}

/// Start every pipeline stage. The returned coordinator owns them all.
pub fn start(
    store: Arc<dyn ObjectStore>,
    engine: Box<dyn OcrEngine>,
    config: PipelineConfig,
) -> Result<ShutdownCoordinator> {
    info!(
        source = %config.source_bucket,
        sink = %config.sink_bucket,
        once = config.once,
        "starting pipeline"
    );
    let (page_tx, page_rx) = mpsc::channel(PAGE_CHANNEL_CAPACITY);
    let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
    let (marker_tx, marker_rx) = mpsc::channel(MARKER_CHANNEL_CAPACITY);
    let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);

    let manager = ManagerHandle::spawn(
        store.clone(),
        ManagerConfig {
            source_bucket: config.source_bucket,
            sink_bucket: config.sink_bucket.clone(),
            once: config.once,
        },
        page_tx,
        marker_tx,
        completion_rx,
    );
    let ocr_stage = OcrStage::new(store.clone(), engine, config.fail_fast).spawn(page_rx, result_tx);
    let sink = Sink::new(store, config.sink_bucket).spawn(result_rx, marker_rx, completion_tx);

    let ticker = Ticker::new();
    match config.poll_interval {
        Some(interval) if !config.once => {
            let trigger = manager.trigger();
            let poll: TickFn = Arc::new(move || {
                let trigger = trigger.clone();
                Box::pin(async move {
                    trigger.request();
                    Ok(())
                }) as BoxedFuture<Result<()>>
            });
            ticker.schedule(poll, interval)?;
            info!("polling for new work every {:?}", interval);
        }
        _ => debug!("polling disabled"),
    }

    Ok(ShutdownCoordinator::new(ticker, manager, ocr_stage, sink))
}
