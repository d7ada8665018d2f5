//! Tesseract OCR engine.
//!
//! We run the `tesseract` CLI in TSV mode, which reports one row per page,
//! block, paragraph, line and word, each with a pixel bounding box. We turn
//! those rows back into a block/line/word tree.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure,
    cpu_limit::with_cpu_semaphore,
    document::{Block, Line, PageDocument, Word},
    prelude::*,
};

use super::{OcrEngine, relative_box};

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractEngine {
    /// Value for `tesseract -l`.
    lang: String,
}

impl TesseractEngine {
    /// Create a new `tesseract` engine.
    pub fn new(lang: &str) -> Self {
        Self {
            lang: lang.to_owned(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    #[instrument(level = "debug", skip_all)]
    async fn predict(&self, image: &[u8]) -> Result<PageDocument> {
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("input.png");
        tokio::fs::write(&input_path, image)
            .await
            .context("cannot write tesseract input file")?;

        let (input_path, lang) = (&input_path, &self.lang);
        let output = with_cpu_semaphore(|| async move {
            Command::new("tesseract")
                .arg(input_path)
                .arg("stdout")
                .arg("-l")
                .arg(lang)
                .arg("tsv")
                .kill_on_drop(true)
                .output()
                .await
                .context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        parse_tsv(&tsv)
    }
}

/// Tesseract TSV row levels.
const LEVEL_PAGE: u32 = 1;
const LEVEL_BLOCK: u32 = 2;
const LEVEL_LINE: u32 = 4;
const LEVEL_WORD: u32 = 5;

/// One row of `tesseract` TSV output. We ignore the `*_num` columns and rely
/// on rows appearing in tree order.
#[derive(Debug, Deserialize)]
struct TsvRow {
    level: u32,
    left: u32,
    top: u32,
    width: u32,
    height: u32,

    /// Confidence from 0 to 100, or -1 for non-word rows.
    conf: f64,

    #[serde(default)]
    text: String,
}

/// Build a [`PageDocument`] from `tesseract` TSV output. Lines without any
/// words, and blocks without any lines, are dropped.
fn parse_tsv(tsv: &str) -> Result<PageDocument> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .quoting(false)
        .from_reader(tsv.as_bytes());

    let mut page = PageDocument::default();
    let (mut page_width, mut page_height) = (0, 0);
    for row in rdr.deserialize::<TsvRow>() {
        let row = row.context("could not parse tesseract output")?;
        let geometry = relative_box(
            row.left,
            row.top,
            row.width,
            row.height,
            page_width,
            page_height,
        );
        match row.level {
            LEVEL_PAGE => {
                page_width = row.width;
                page_height = row.height;
                page.dimensions = [row.height, row.width];
            }
            LEVEL_BLOCK => page.blocks.push(Block {
                geometry,
                ..Block::default()
            }),
            LEVEL_LINE => {
                let block = page
                    .blocks
                    .last_mut()
                    .ok_or_else(|| anyhow!("tesseract output has a line outside a block"))?;
                block.lines.push(Line {
                    words: vec![],
                    geometry,
                });
            }
            LEVEL_WORD => {
                let text = row.text.trim();
                if text.is_empty() {
                    continue;
                }
                let line = page
                    .blocks
                    .last_mut()
                    .and_then(|block| block.lines.last_mut())
                    .ok_or_else(|| anyhow!("tesseract output has a word outside a line"))?;
                line.words.push(Word {
                    value: text.to_owned(),
                    confidence: (row.conf / 100.0).clamp(0.0, 1.0),
                    geometry,
                });
            }
            // Paragraphs.
            _ => {}
        }
    }

    for block in &mut page.blocks {
        block.lines.retain(|line| !line.words.is_empty());
    }
    page.blocks.retain(|block| !block.lines.is_empty());
    Ok(page)
}
