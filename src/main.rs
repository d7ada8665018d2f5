use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod cpu_limit;
mod document;
mod engines;
mod paths;
mod pipeline;
mod prelude;
mod store;
mod ui;

/// OCR scanned document pages staged in an object store.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - SOURCE_BUCKET, SINK_BUCKET: Buckets to read pages from and write results to.
  - POLL_INTERVAL (optional): Seconds between discovery passes.
  - FAKE_GCS_SERVER (optional): Override the GCS endpoint.
  - GCS_ACCESS_TOKEN (optional): OAuth2 bearer token for GCS.
  - STORE_ROOT (optional): Root directory for `--store fs`.
  - RUST_LOG (optional): Log filter, defaulting to "info".

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// Watch the source bucket, OCR new pages, and clean up finished
    /// documents.
    Run(cmd::run::RunOpts),
    /// Upload a local directory of `<document-id>/<NNN>.png` pages.
    Stage(cmd::stage::StageOpts),
    /// Print the JSON Schema of our output.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(_) | Cmd::Stage(_) => false,
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);
    tracing_subscriber::registry().with(subscriber).init();

    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Not logged, because the store options may include an access token.
    let opts = Opts::parse();

    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    match &opts.subcmd {
        Cmd::Run(run_opts) => cmd::run::cmd_run(run_opts).await?,
        Cmd::Stage(stage_opts) => cmd::stage::cmd_stage(ui, stage_opts).await?,
        Cmd::Schema(schema_opts) => cmd::schema::cmd_schema(schema_opts).await?,
    }
    Ok(())
}
