//! An engine which recognizes nothing.

use std::io::Cursor;

use image::ImageReader;

use crate::{document::PageDocument, prelude::*};

use super::OcrEngine;

/// Returns an empty page with the same dimensions as the input image.
pub struct NullEngine;

#[async_trait]
impl OcrEngine for NullEngine {
    #[instrument(level = "trace", skip_all)]
    async fn predict(&self, image: &[u8]) -> Result<PageDocument> {
        // Only the header is decoded, so this is cheap enough to do inline.
        let (width, height) = ImageReader::new(Cursor::new(image))
            .with_guessed_format()
            .context("could not read page image")?
            .into_dimensions()
            .context("could not decode page image")?;
        Ok(PageDocument::empty(height, width))
    }
}
