//! OCR engines.
//!
//! An engine turns the bytes of one page image into a [`PageDocument`]. The
//! pipeline constructs exactly one engine and calls it once per page.

use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::{document::PageDocument, prelude::*};

pub mod command;
pub mod null;
pub mod tesseract;

/// Interface to an OCR engine.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Recognize the text in a single page image.
    async fn predict(&self, image: &[u8]) -> Result<PageDocument>;
}

/// Our different engine types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "snake_case")]
pub enum EngineType {
    /// Run the `tesseract` CLI.
    #[default]
    Tesseract,

    /// Run an external program which prints docTR-style JSON.
    Command,

    /// Don't recognize anything. Outputs empty pages with the right
    /// dimensions. Useful for testing the pipeline.
    Null,
}

/// Options for our OCR engine.
#[derive(Args, Clone, Debug)]
pub struct EngineOpts {
    /// The OCR engine to use.
    #[clap(long, value_enum, default_value_t = EngineType::default())]
    pub engine: EngineType,

    /// The program and arguments to run for `--engine command`. The path of
    /// the page image is appended as the last argument.
    #[clap(long, num_args = 1.., value_name = "PROGRAM")]
    pub engine_command: Vec<String>,

    /// The language(s) to pass to `tesseract`, such as "eng" or "eng+fra".
    #[clap(long, default_value = "eng")]
    pub tesseract_lang: String,

    /// A timeout, in seconds, for recognizing a single page.
    #[clap(long)]
    pub engine_timeout: Option<u64>,
}

impl EngineOpts {
    /// Instantiate the configured engine.
    pub fn create_engine(&self) -> Result<Box<dyn OcrEngine>> {
        let engine: Box<dyn OcrEngine> = match self.engine {
            EngineType::Tesseract => {
                Box::new(tesseract::TesseractEngine::new(&self.tesseract_lang))
            }
            EngineType::Command => {
                Box::new(command::CommandEngine::new(&self.engine_command)?)
            }
            EngineType::Null => Box::new(null::NullEngine),
        };
        match self.engine_timeout {
            Some(secs) => Ok(Box::new(WithTimeout {
                inner: engine,
                timeout: Duration::from_secs(secs),
            })),
            None => Ok(engine),
        }
    }
}

/// Fail any prediction that takes longer than `timeout`. Engines which run
/// subprocesses kill them when their future is dropped.
struct WithTimeout {
    inner: Box<dyn OcrEngine>,
    timeout: Duration,
}

#[async_trait]
impl OcrEngine for WithTimeout {
    async fn predict(&self, image: &[u8]) -> Result<PageDocument> {
        tokio::time::timeout(self.timeout, self.inner.predict(image))
            .await
            .map_err(|_| anyhow!("OCR timed out after {:?}", self.timeout))?
    }
}

/// Relative `[x, y]` corners of a pixel box on a page of the given size.
pub(crate) fn relative_box(
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    page_width: u32,
    page_height: u32,
) -> Vec<[f64; 2]> {
    let w = f64::from(page_width.max(1));
    let h = f64::from(page_height.max(1));
    vec![
        [f64::from(left) / w, f64::from(top) / h],
        [
            f64::from(left.saturating_add(width)) / w,
            f64::from(top.saturating_add(height)) / h,
        ],
    ]
}
