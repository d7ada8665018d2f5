//! Object naming conventions shared by the source and destination buckets.
//!
//! Source pages live at `<document-id>/<NNN>.png`, the page-count marker at
//! `<document-id>/count`, and OCR results at `<document-id>/<NNN>.json`.
//! Other tools read these buckets, so these names must not change.

use std::{fmt, sync::LazyLock};

use regex::Regex;

/// The file name of the page-count marker stored next to a document's pages.
pub const MARKER_NAME: &str = "count";

/// Matches the file part of a page or result object name.
static PAGE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<page>[0-9]{3,})\.(?P<ext>png|json)$")
        .expect("failed to compile regex")
});

/// A document identifier. This is the path prefix shared by all of the
/// document's pages, without a trailing slash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The prefix which every object belonging to this document starts with.
    pub fn prefix(&self) -> String {
        format!("{}/", self.0)
    }

    /// The ID as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A 1-based page number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageNumber(u32);

impl PageNumber {
    /// Create a new page number.
    pub fn new(page: u32) -> Self {
        Self(page)
    }

    /// The page number as an integer.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PageNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// What kind of object a name refers to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectName {
    /// A rendered page image, `<document-id>/<NNN>.png`.
    Page {
        document_id: DocumentId,
        page: PageNumber,
    },

    /// An OCR result, `<document-id>/<NNN>.json`.
    Result {
        document_id: DocumentId,
        page: PageNumber,
    },

    /// The page-count marker, `<document-id>/count`.
    Marker { document_id: DocumentId },
}

impl ObjectName {
    /// Parse an object name. Returns `None` for names which follow none of
    /// our conventions.
    pub fn parse(name: &str) -> Option<Self> {
        let (document_id, file) = name.rsplit_once('/')?;
        if document_id.is_empty() {
            return None;
        }
        let document_id = DocumentId::new(document_id);
        if file == MARKER_NAME {
            return Some(ObjectName::Marker { document_id });
        }
        let caps = PAGE_FILE_RE.captures(file)?;
        let page = PageNumber::new(caps["page"].parse().ok()?);
        match &caps["ext"] {
            "png" => Some(ObjectName::Page { document_id, page }),
            "json" => Some(ObjectName::Result { document_id, page }),
            _ => None,
        }
    }
}

/// The source object name of a page image.
pub fn page_path(document_id: &DocumentId, page: PageNumber) -> String {
    format!("{document_id}/{page}.png")
}

/// The destination object name of a page's OCR result.
pub fn result_path(document_id: &DocumentId, page: PageNumber) -> String {
    format!("{document_id}/{page}.json")
}

/// The object name of a document's page-count marker.
pub fn marker_path(document_id: &DocumentId) -> String {
    format!("{document_id}/{MARKER_NAME}")
}
