//! Pages which have been discovered but not yet written.

use std::collections::{BTreeMap, HashMap};

use crate::{
    paths::{DocumentId, PageNumber},
    store::BlobRef,
};

/// What happened when a page was marked complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// We weren't tracking this page, so nothing changed.
    Untracked,

    /// The page was removed, and this many pages of its document remain.
    Remaining(usize),

    /// That was the document's last page. The document is no longer tracked,
    /// and its sources can be deleted.
    DocumentDone,
}

/// For each document, the source pages which don't have a result yet.
///
/// Outside of a discovery pass, every tracked document has at least one
/// pending page. Documents which become empty are reported exactly once, by
/// [`PendingPages::complete`] or [`PendingPages::take_empty_documents`].
#[derive(Debug, Default)]
pub struct PendingPages {
    documents: HashMap<DocumentId, BTreeMap<PageNumber, BlobRef>>,
}

impl PendingPages {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a source page, replacing any older listing of the same page.
    pub fn insert(&mut self, document_id: DocumentId, page: PageNumber, blob: BlobRef) {
        self.documents
            .entry(document_id)
            .or_default()
            .insert(page, blob);
    }

    /// The tracked source of a page, if any.
    pub fn get(&self, document_id: &DocumentId, page: PageNumber) -> Option<&BlobRef> {
        self.documents.get(document_id)?.get(&page)
    }

    /// Forget a page whose result already exists. Unlike [`Self::complete`],
    /// this may leave an empty document behind, to be collected with
    /// [`Self::take_empty_documents`]. Returns `true` if the page was tracked.
    pub fn remove_written(&mut self, document_id: &DocumentId, page: PageNumber) -> bool {
        self.documents
            .get_mut(document_id)
            .is_some_and(|pages| pages.remove(&page).is_some())
    }

    /// Stop tracking all documents without pending pages, and return their
    /// IDs in sorted order.
    pub fn take_empty_documents(&mut self) -> Vec<DocumentId> {
        let mut empty = self
            .documents
            .iter()
            .filter(|(_, pages)| pages.is_empty())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        empty.sort();
        for id in &empty {
            self.documents.remove(id);
        }
        empty
    }

    /// Mark a page as written.
    pub fn complete(&mut self, document_id: &DocumentId, page: PageNumber) -> Completion {
        let Some(pages) = self.documents.get_mut(document_id) else {
            return Completion::Untracked;
        };
        if pages.remove(&page).is_none() {
            return Completion::Untracked;
        }
        if pages.is_empty() {
            self.documents.remove(document_id);
            Completion::DocumentDone
        } else {
            Completion::Remaining(pages.len())
        }
    }

    /// How many documents are we tracking?
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// How many pages are pending, across all documents?
    pub fn page_count(&self) -> usize {
        self.documents.values().map(BTreeMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(name: &str) -> BlobRef {
        BlobRef {
            bucket: "src".to_owned(),
            name: name.to_owned(),
            content_hash: name.to_owned(),
            generation: 1,
        }
    }

    fn page(n: u32) -> PageNumber {
        PageNumber::new(n)
    }

    #[test]
    fn document_is_done_after_every_page_completes() {
        let doc = DocumentId::new("A");
        let mut pending = PendingPages::new();
        for n in 1..=3 {
            pending.insert(doc.clone(), page(n), blob(&format!("A/00{n}.png")));
        }
        // Completions can arrive in any order.
        assert_eq!(pending.complete(&doc, page(2)), Completion::Remaining(2));
        assert_eq!(pending.complete(&doc, page(3)), Completion::Remaining(1));
        assert_eq!(pending.complete(&doc, page(1)), Completion::DocumentDone);
        assert_eq!(pending.document_count(), 0);

        // A duplicate signal after teardown changes nothing.
        assert_eq!(pending.complete(&doc, page(1)), Completion::Untracked);
    }

    #[test]
    fn unknown_pages_are_ignored() {
        let doc = DocumentId::new("A");
        let mut pending = PendingPages::new();
        pending.insert(doc.clone(), page(1), blob("A/001.png"));
        assert_eq!(pending.complete(&doc, page(9)), Completion::Untracked);
        assert_eq!(
            pending.complete(&DocumentId::new("B"), page(1)),
            Completion::Untracked
        );
        assert_eq!(pending.page_count(), 1);
    }

    #[test]
    fn written_pages_leave_empty_documents_for_collection() {
        let a = DocumentId::new("A");
        let b = DocumentId::new("B");
        let mut pending = PendingPages::new();
        pending.insert(a.clone(), page(1), blob("A/001.png"));
        pending.insert(b.clone(), page(1), blob("B/001.png"));
        pending.insert(b.clone(), page(2), blob("B/002.png"));

        assert!(pending.remove_written(&a, page(1)));
        assert!(pending.remove_written(&b, page(2)));
        assert!(!pending.remove_written(&b, page(2)));

        assert_eq!(pending.take_empty_documents(), vec![a.clone()]);
        assert!(pending.take_empty_documents().is_empty());
        assert!(pending.get(&b, page(1)).is_some());
        assert_eq!(pending.complete(&a, page(1)), Completion::Untracked);
    }
}
