//! Local view of the user's bookmarks
//!
//! A non-authoritative cache fed from three directions: the initial list,
//! optimistic local mutations, and the change feed. Every operation here is
//! idempotent with respect to bookmark ids, so the order in which a store
//! acknowledgement and the matching feed event arrive does not matter.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::models::{Bookmark, BookmarkCard, NewBookmark};
use crate::session::SessionDependent;
use crate::store::BookmarkChange;

const PROVISIONAL_PREFIX: &str = "pending-";

#[derive(Debug, Clone)]
struct Entry {
    bookmark: Bookmark,
    // Optimistic entry not yet acknowledged by the store
    pending: bool,
}

/// An entry taken out by an optimistic delete, kept so it can be put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub index: usize,
    pub bookmark: Bookmark,
}

/// Bookmarks in display order, newest first.
#[derive(Debug, Default)]
pub struct BookmarkView {
    entries: Vec<Entry>,
    // Ids the store has confirmed gone; never shown again until the next full reload
    deleted: HashSet<String>,
}

impl BookmarkView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored entries with a freshly fetched list. Provisional
    /// entries still waiting for the store stay at the head.
    pub fn replace_all(&mut self, mut bookmarks: Vec<Bookmark>) {
        bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        bookmarks.dedup_by(|a, b| a.id == b.id);
        let pending: Vec<Entry> = self.entries.drain(..).filter(|e| e.pending).collect();
        self.entries = pending
            .into_iter()
            .chain(bookmarks.into_iter().map(|bookmark| Entry {
                bookmark,
                pending: false,
            }))
            .collect();
        self.deleted.clear();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.bookmark.id == id)
    }

    /// Adds a stored bookmark at its newest-first position.
    /// Returns `false` if the id is already shown.
    pub fn insert(&mut self, bookmark: Bookmark) -> bool {
        if self.contains(&bookmark.id) {
            trace!(id = %bookmark.id, "duplicate insert ignored");
            return false;
        }
        if self.deleted.contains(&bookmark.id) {
            trace!(id = %bookmark.id, "insert of a deleted bookmark ignored");
            return false;
        }
        let index = self
            .entries
            .iter()
            .position(|e| e.bookmark.created_at < bookmark.created_at)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            index,
            Entry {
                bookmark,
                pending: false,
            },
        );
        true
    }

    /// Removes the entry with `id`, if shown.
    pub fn remove(&mut self, id: &str) -> Option<Removed> {
        let index = self.entries.iter().position(|e| e.bookmark.id == id)?;
        let entry = self.entries.remove(index);
        Some(Removed {
            index,
            bookmark: entry.bookmark,
        })
    }

    /// Puts back an entry removed by a delete that then failed.
    pub fn restore(&mut self, removed: Removed) -> bool {
        if self.contains(&removed.bookmark.id) || self.deleted.contains(&removed.bookmark.id) {
            return false;
        }
        let index = removed.index.min(self.entries.len());
        self.entries.insert(
            index,
            Entry {
                bookmark: removed.bookmark,
                pending: false,
            },
        );
        true
    }

    /// Shows a submission at the head before the store has answered.
    /// Returns the provisional id to confirm or discard it with.
    pub fn add_provisional(&mut self, new: &NewBookmark) -> String {
        let id = format!("{}{}", PROVISIONAL_PREFIX, Uuid::new_v4());
        self.entries.insert(
            0,
            Entry {
                bookmark: Bookmark {
                    id: id.clone(),
                    title: new.title.clone(),
                    url: new.url.clone(),
                    category: new.category.clone(),
                    created_at: Utc::now(),
                    user_id: new.user_id.clone(),
                },
                pending: true,
            },
        );
        id
    }

    /// Swaps a provisional entry for the stored record. If the feed already
    /// delivered the record, the provisional entry is simply dropped; if the
    /// feed already reported it deleted, it is not shown at all. Does nothing
    /// when the provisional entry is gone (e.g. the view was cleared).
    pub fn confirm_provisional(&mut self, provisional_id: &str, confirmed: Bookmark) -> bool {
        if self.discard_provisional(provisional_id) {
            self.insert(confirmed);
            true
        } else {
            false
        }
    }

    pub fn discard_provisional(&mut self, provisional_id: &str) -> bool {
        match self
            .entries
            .iter()
            .position(|e| e.pending && e.bookmark.id == provisional_id)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Applies a change-feed event. Returns whether the view changed.
    pub fn apply(&mut self, change: BookmarkChange) -> bool {
        match change {
            BookmarkChange::Inserted(bookmark) => self.insert(bookmark),
            BookmarkChange::Deleted(id) => self.mark_deleted(&id),
        }
    }

    /// Records that the store no longer has `id` and drops it from the view.
    /// Returns whether an entry was shown.
    pub fn mark_deleted(&mut self, id: &str) -> bool {
        self.deleted.insert(id.to_string());
        self.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deleted.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        self.entries.iter().any(|e| e.pending)
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.entries.iter().map(|e| e.bookmark.clone()).collect()
    }

    pub fn cards(&self) -> Vec<BookmarkCard> {
        self.entries
            .iter()
            .map(|e| BookmarkCard::from_bookmark(&e.bookmark, e.pending))
            .collect()
    }
}

impl SessionDependent for Mutex<BookmarkView> {
    fn session_ended(&self) {
        self.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};

    fn at(id: &str, minutes: i64) -> Bookmark {
        let base: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        Bookmark {
            id: id.to_string(),
            title: id.to_uppercase(),
            url: format!("https://{}.example.com", id),
            category: "General".to_string(),
            created_at: base + Duration::minutes(minutes),
            user_id: "u1".to_string(),
        }
    }

    fn ids(view: &BookmarkView) -> Vec<String> {
        view.bookmarks().into_iter().map(|b| b.id).collect()
    }

    #[test]
    fn replace_all_orders_newest_first() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1), at("c", 3), at("b", 2)]);
        assert_eq!(ids(&view), ["c", "b", "a"]);
    }

    #[test]
    fn deleting_middle_keeps_relative_order() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1), at("b", 2), at("c", 3)]);

        let removed = view.remove("b").unwrap();
        assert_eq!(removed.index, 1);
        assert_eq!(ids(&view), ["c", "a"]);

        // Second delete of the same id is a no-op
        assert!(view.remove("b").is_none());
        assert!(!view.apply(BookmarkChange::Deleted("b".to_string())));
        assert_eq!(ids(&view), ["c", "a"]);
    }

    #[test]
    fn duplicate_inserts_are_suppressed() {
        let mut view = BookmarkView::new();
        assert!(view.insert(at("a", 1)));
        assert!(!view.apply(BookmarkChange::Inserted(at("a", 1))));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn inserts_land_by_timestamp() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1), at("c", 3)]);

        view.insert(at("b", 2));
        view.insert(at("d", 4));
        assert_eq!(ids(&view), ["d", "c", "b", "a"]);
    }

    #[test]
    fn restore_puts_entry_back_in_place() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1), at("b", 2), at("c", 3)]);

        let removed = view.remove("b").unwrap();
        assert!(view.restore(removed.clone()));
        assert_eq!(ids(&view), ["c", "b", "a"]);
        assert!(!view.restore(removed));
    }

    #[test]
    fn ack_then_feed_yields_one_entry() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1)]);
        let new = NewBookmark::new("u1", "Example", "https://example.com", "Dev").unwrap();

        let provisional = view.add_provisional(&new);
        assert!(view.has_pending());
        assert_eq!(view.bookmarks()[0].id, provisional);

        assert!(view.confirm_provisional(&provisional, at("x", 10)));
        view.apply(BookmarkChange::Inserted(at("x", 10)));

        assert_eq!(ids(&view), ["x", "a"]);
        assert!(!view.has_pending());
    }

    #[test]
    fn feed_then_ack_yields_one_entry() {
        let mut view = BookmarkView::new();
        let new = NewBookmark::new("u1", "Example", "https://example.com", "Dev").unwrap();

        let provisional = view.add_provisional(&new);
        view.apply(BookmarkChange::Inserted(at("x", 10)));
        assert_eq!(view.len(), 2);

        view.confirm_provisional(&provisional, at("x", 10));
        assert_eq!(ids(&view), ["x"]);
    }

    #[test]
    fn late_ack_does_not_bring_back_a_deleted_row() {
        let mut view = BookmarkView::new();
        let new = NewBookmark::new("u1", "Example", "https://example.com", "Dev").unwrap();

        let provisional = view.add_provisional(&new);
        view.apply(BookmarkChange::Inserted(at("x", 10)));
        // Another session deletes it before our insert is acknowledged
        view.apply(BookmarkChange::Deleted("x".to_string()));
        view.confirm_provisional(&provisional, at("x", 10));

        assert!(view.is_empty());
        assert!(!view.has_pending());
    }

    #[test]
    fn feed_replay_after_local_delete_is_ignored() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1), at("b", 2)]);

        assert!(view.mark_deleted("b"));
        assert!(!view.apply(BookmarkChange::Inserted(at("b", 2))));
        assert_eq!(ids(&view), ["a"]);

        // A full reload is authoritative again
        view.replace_all(vec![at("a", 1), at("b", 2)]);
        assert_eq!(ids(&view), ["b", "a"]);
    }

    #[test]
    fn confirm_after_clear_adds_nothing() {
        let mut view = BookmarkView::new();
        let new = NewBookmark::new("u1", "Example", "https://example.com", "Dev").unwrap();
        let provisional = view.add_provisional(&new);

        view.clear();
        assert!(!view.confirm_provisional(&provisional, at("x", 10)));
        assert!(view.is_empty());
    }

    #[test]
    fn reload_keeps_entries_still_being_saved() {
        let mut view = BookmarkView::new();
        let new = NewBookmark::new("u1", "Example", "https://example.com", "Dev").unwrap();
        let provisional = view.add_provisional(&new);

        view.replace_all(vec![at("a", 1)]);
        assert_eq!(ids(&view), [provisional.as_str(), "a"]);

        assert!(view.confirm_provisional(&provisional, at("x", 10)));
        assert_eq!(ids(&view), ["x", "a"]);
    }

    #[test]
    fn discard_only_touches_pending_entries() {
        let mut view = BookmarkView::new();
        view.replace_all(vec![at("a", 1)]);
        assert!(!view.discard_provisional("a"));
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn session_end_clears_shared_view() {
        let view = Mutex::new(BookmarkView::new());
        view.lock().unwrap().replace_all(vec![at("a", 1), at("b", 2)]);

        view.session_ended();
        assert!(view.lock().unwrap().is_empty());
    }
}
