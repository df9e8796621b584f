//! Bookmark Store Adapter
//!
//! Create/read/delete against the `bookmarks` table plus a change feed
//! scoped to one user. The table and the feed sit behind traits so the
//! store can be driven by PostgREST/Realtime or by in-memory fakes.

mod postgrest;
mod realtime;

pub use self::postgrest::PostgrestBackend;
pub use self::realtime::RealtimeFeed;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::{Bookmark, NewBookmark};
use crate::session::Session;

/// Row operations on the `bookmarks` table, authorized by the user's token.
#[async_trait]
pub trait BookmarkBackend: Send + Sync {
    /// All rows of `user_id`, newest first.
    async fn select_all(&self, access_token: &str, user_id: &str) -> Result<Vec<Bookmark>>;
    /// Inserts one row and returns it as stored.
    async fn insert(&self, access_token: &str, bookmark: &NewBookmark) -> Result<Bookmark>;
    /// Deletes by id. Deleting a missing id succeeds.
    async fn delete(&self, access_token: &str, id: &str) -> Result<()>;
}

/// Push notifications for rows owned by one user.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, access_token: &str, user_id: &str) -> Result<ChangeSubscription>;
    /// Re-authorizes open subscriptions after the user's token was refreshed.
    async fn update_token(&self, access_token: &str) -> Result<()>;
}

/// A remote change, already narrowed to what the view cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkChange {
    Inserted(Bookmark),
    Deleted(String),
}

/// Stops delivery for a [`ChangeSubscription`]. Called at most once.
pub trait FeedGuard: Send {
    fn release(&mut self);
}

/// A live change feed. Delivery stops on [`close`](Self::close) or drop.
pub struct ChangeSubscription {
    events: mpsc::UnboundedReceiver<BookmarkChange>,
    guard: Option<Box<dyn FeedGuard>>,
}

impl ChangeSubscription {
    pub fn new(events: mpsc::UnboundedReceiver<BookmarkChange>, guard: impl FeedGuard + 'static) -> Self {
        Self {
            events,
            guard: Some(Box::new(guard)),
        }
    }

    /// Next change; `None` once the feed has ended.
    pub async fn recv(&mut self) -> Option<BookmarkChange> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            guard.release();
            self.events.close();
        }
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("open", &self.guard.is_some())
            .finish()
    }
}

/// The store operations the presentation layer calls.
#[derive(Clone)]
pub struct BookmarkStore {
    backend: Arc<dyn BookmarkBackend>,
    feed: Arc<dyn ChangeFeed>,
}

impl BookmarkStore {
    pub fn new(backend: Arc<dyn BookmarkBackend>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { backend, feed }
    }

    /// One request, no pagination.
    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn list_bookmarks(&self, session: &Session) -> Result<Vec<Bookmark>> {
        let mut bookmarks = self
            .backend
            .select_all(&session.access_token, &session.user.id)
            .await
            .map_err(|e| {
                warn!(error = %e, "listing bookmarks failed");
                e
            })?;
        // Stable, so rows with equal timestamps keep the store's order
        bookmarks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(count = bookmarks.len(), "bookmarks listed");
        Ok(bookmarks)
    }

    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn create_bookmark(&self, session: &Session, bookmark: &NewBookmark) -> Result<Bookmark> {
        match self.backend.insert(&session.access_token, bookmark).await {
            Ok(created) => {
                info!(id = %created.id, "bookmark created");
                Ok(created)
            }
            Err(e) => {
                warn!(error = %e, "creating bookmark failed");
                Err(e)
            }
        }
    }

    #[instrument(skip(self, session), fields(user_id = %session.user.id))]
    pub async fn delete_bookmark(&self, session: &Session, id: &str) -> Result<()> {
        match self.backend.delete(&session.access_token, id).await {
            Ok(()) => {
                info!("bookmark deleted");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "deleting bookmark failed");
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn subscribe_to_changes(&self, session: &Session) -> Result<ChangeSubscription> {
        let subscription = self
            .feed
            .subscribe(&session.access_token, &session.user.id)
            .await
            .map_err(|e| {
                warn!(error = %e, "subscribing to changes failed");
                e
            })?;
        info!("change feed open");
        Ok(subscription)
    }

    #[instrument(skip_all, fields(user_id = %session.user.id))]
    pub async fn update_feed_token(&self, session: &Session) -> Result<()> {
        self.feed.update_token(&session.access_token).await.map_err(|e| {
            warn!(error = %e, "updating the change feed token failed");
            e
        })
    }
}
