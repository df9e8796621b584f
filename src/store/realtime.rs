use async_trait::async_trait;
use serde::Deserialize;
use smartmark_realtime::{ChangeType, PostgresChange, PostgresChanges, RealtimeClient};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::postgrest::BOOKMARKS_TABLE;
use super::{BookmarkChange, ChangeFeed, ChangeSubscription, FeedGuard};
use crate::error::Result;
use crate::models::Bookmark;

/// Bookmark changes over a Supabase Realtime `postgres_changes` channel.
///
/// Each subscription joins its own channel on the shared socket. The socket
/// is closed when the last channel leaves.
#[derive(Clone)]
pub struct RealtimeFeed {
    client: RealtimeClient,
    next_channel: Arc<AtomicU32>,
}

impl RealtimeFeed {
    pub fn new(client: RealtimeClient) -> Self {
        Self {
            client,
            next_channel: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, access_token: &str, user_id: &str) -> Result<ChangeSubscription> {
        let n = self.next_channel.fetch_add(1, Ordering::SeqCst);
        let mut subscription = self
            .client
            .channel(&format!("bookmarks-realtime-{}", n))
            .on_postgres_changes(PostgresChanges::new(BOOKMARKS_TABLE).eq("user_id", user_id))
            .access_token(access_token)
            .subscribe()
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Fires on release and when the guard is dropped
                    _ = &mut stop_rx => break,
                    change = subscription.recv() => match change {
                        Some(change) => {
                            if let Some(event) = to_bookmark_change(&change) {
                                if events_tx.send(event).is_err() {
                                    break;
                                }
                            }
                        }
                        None => {
                            debug!(topic = subscription.topic(), "realtime channel ended");
                            break;
                        }
                    },
                }
            }

            let topic = subscription.topic().to_string();
            if let Err(e) = subscription.close().await {
                warn!(%topic, error = %e, "leaving realtime channel failed");
            }
            if client.channel_count().await == 0 {
                if let Err(e) = client.disconnect().await {
                    warn!(error = %e, "closing realtime socket failed");
                }
            }
        });

        Ok(ChangeSubscription::new(events_rx, StopOnRelease(Some(stop_tx))))
    }

    async fn update_token(&self, access_token: &str) -> Result<()> {
        self.client.set_auth(access_token).await?;
        Ok(())
    }
}

struct StopOnRelease(Option<oneshot::Sender<()>>);

impl FeedGuard for StopOnRelease {
    fn release(&mut self) {
        if let Some(stop) = self.0.take() {
            let _ = stop.send(());
        }
    }
}

#[derive(Deserialize)]
struct DeletedKey {
    #[serde(deserialize_with = "id_as_string")]
    id: String,
}

fn id_as_string<'de, D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id {}", other))),
    }
}

/// Inserts carry the full row, deletes only the key. Updates are ignored.
pub(crate) fn to_bookmark_change(change: &PostgresChange) -> Option<BookmarkChange> {
    match change.change_type {
        ChangeType::Insert => match change.record_as::<Bookmark>() {
            Ok(bookmark) => Some(BookmarkChange::Inserted(bookmark)),
            Err(e) => {
                warn!(error = %e, "ignoring insert with an unreadable row");
                None
            }
        },
        ChangeType::Delete => match change.old_record_as::<DeletedKey>() {
            Ok(key) => Some(BookmarkChange::Deleted(key.id)),
            Err(e) => {
                warn!(error = %e, "ignoring delete without an id");
                None
            }
        },
        ChangeType::Update => None,
    }
}
