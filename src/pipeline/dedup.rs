//! Remembers which page contents we've already sent downstream.

use std::collections::HashSet;

/// Content hashes of every page handed to the OCR stage since startup.
///
/// This is owned by the manager, so it needs no locking.
#[derive(Debug, Default)]
pub struct DedupSet {
    seen: HashSet<String>,
}

impl DedupSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `content_hash`. Returns `true` if it's new, and `false` if the
    /// same content was already enqueued.
    pub fn insert(&mut self, content_hash: &str) -> bool {
        if self.seen.contains(content_hash) {
            false
        } else {
            self.seen.insert(content_hash.to_owned())
        }
    }

    /// How many distinct hashes have we seen?
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
