//! The structured OCR result for a single page.
//!
//! This is the JSON written to `<document-id>/<NNN>.json` in the destination
//! bucket. Field names and field order are part of the output format, so
//! don't reorder anything here.

use schemars::JsonSchema;

use crate::prelude::*;

/// A point in relative page coordinates, `[x, y]`, each between 0 and 1.
pub type Point = [f64; 2];

/// A region of the page. Straight boxes are two points (top-left and
/// bottom-right), rotated boxes are four.
pub type Geometry = Vec<Point>;

/// The OCR result for one page.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageDocument {
    /// Text blocks, in reading order.
    pub blocks: Vec<Block>,

    /// The index of this page in the image it was read from. Always 0 for
    /// single-page images.
    pub page_idx: usize,

    /// Page size in pixels, as `[height, width]`.
    pub dimensions: [u32; 2],

    /// The detected page orientation.
    pub orientation: Orientation,

    /// The detected page language.
    pub language: Language,
}

impl PageDocument {
    /// An empty page with the given pixel size.
    pub fn empty(height: u32, width: u32) -> Self {
        Self {
            dimensions: [height, width],
            ..Self::default()
        }
    }

    /// How many words were recognized on this page?
    pub fn word_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|block| &block.lines)
            .map(|line| line.words.len())
            .sum()
    }
}

/// A block of related lines.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Block {
    pub lines: Vec<Line>,
    pub artefacts: Vec<Artefact>,
    pub geometry: Geometry,
}

/// A line of words.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Line {
    pub words: Vec<Word>,
    pub geometry: Geometry,
}

/// A recognized word.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Word {
    /// The recognized text.
    pub value: String,

    /// Recognition confidence, between 0 and 1.
    pub confidence: f64,

    pub geometry: Geometry,
}

/// A non-text element, such as a photo or a QR code.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Artefact {
    pub artefact_type: String,
    pub confidence: f64,
    pub geometry: Geometry,
}

/// Page orientation in degrees, if the engine estimated one.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Orientation {
    pub value: Option<f64>,
    pub confidence: Option<f64>,
}

/// Page language, if the engine detected one.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Language {
    pub value: Option<String>,
    pub confidence: Option<f64>,
}
