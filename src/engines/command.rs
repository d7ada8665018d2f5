//! Run an external OCR program.
//!
//! This lets us plug in model servers and scripts which we don't want to link
//! into this binary. The program receives the path of a PNG file as its last
//! argument and must print JSON to standard output, in the same shape as our
//! own output. docTR's `export()` format, which wraps pages in a `pages`
//! array, is accepted too.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    document::PageDocument, prelude::*,
};

use super::OcrEngine;

/// OCR engine which runs a program once per page.
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    /// Create an engine from a program and its leading arguments.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("--engine command requires --engine-command"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// What an external engine may print.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EngineOutput {
    /// A whole document. We only send single images, so we take the first
    /// page.
    Document { pages: Vec<PageDocument> },

    /// A single page.
    Page(PageDocument),
}

impl EngineOutput {
    fn into_page(self) -> Result<PageDocument> {
        match self {
            EngineOutput::Document { pages } => pages
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("OCR command returned no pages")),
            EngineOutput::Page(page) => Ok(page),
        }
    }
}

#[async_trait]
impl OcrEngine for CommandEngine {
    #[instrument(level = "debug", skip_all, fields(program = %self.program))]
    async fn predict(&self, image: &[u8]) -> Result<PageDocument> {
        let input = tempfile::Builder::new()
            .prefix("page")
            .suffix(".png")
            .tempfile()
            .context("cannot create OCR input file")?;
        tokio::fs::write(input.path(), image)
            .await
            .context("cannot write OCR input file")?;

        let input_path = input.path();
        let output = with_cpu_semaphore(|| async move {
            Command::new(&self.program)
                .args(&self.args)
                .arg(input_path)
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("cannot run {}", self.program))
        })
        .await?;
        check_for_command_failure(&self.program, &output)?;

        serde_json::from_slice::<EngineOutput>(&output.stdout)
            .with_context(|| format!("could not parse output of {}", self.program))?
            .into_page()
    }
}
