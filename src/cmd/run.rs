//! The `run` subcommand.

use std::time::Duration;

use clap::Args;

use crate::{
    engines::EngineOpts,
    pipeline::{self, PipelineConfig, shutdown::wait_for_shutdown_signal},
    prelude::*,
    store::StoreOpts,
};

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// The bucket to read page images and page-count markers from.
    #[clap(long, env = "SOURCE_BUCKET")]
    pub source_bucket: String,

    /// The bucket to write OCR results to.
    #[clap(long, env = "SINK_BUCKET")]
    pub sink_bucket: String,

    /// Seconds between discovery passes. 0 disables polling, so only the
    /// initial pass runs.
    #[clap(long, env = "POLL_INTERVAL", default_value = "300")]
    pub poll_interval: u64,

    /// Run one discovery pass, finish the work it found, and exit.
    #[clap(long)]
    pub once: bool,

    /// Stop at the first OCR failure, instead of skipping the page until the
    /// next run.
    #[clap(long, env = "FAIL_FAST")]
    pub fail_fast: bool,

    #[clap(flatten)]
    pub store_opts: StoreOpts,

    #[clap(flatten)]
    pub engine_opts: EngineOpts,
}

impl RunOpts {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source_bucket: self.source_bucket.clone(),
            sink_bucket: self.sink_bucket.clone(),
            poll_interval: (self.poll_interval > 0)
                .then(|| Duration::from_secs(self.poll_interval)),
            once: self.once,
            fail_fast: self.fail_fast,
        }
    }
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(opts: &RunOpts) -> Result<()> {
    if opts.source_bucket == opts.sink_bucket {
        return Err(anyhow!(
            "source and sink buckets must differ, got {:?} for both",
            opts.source_bucket
        ));
    }
    let store = opts.store_opts.create_store()?;
    let engine = opts.engine_opts.create_engine()?;
    let coordinator = pipeline::start(store, engine, opts.pipeline_config())?;
    coordinator.run_until(wait_for_shutdown_signal()).await
}
