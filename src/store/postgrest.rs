use async_trait::async_trait;
use reqwest::Client;
use smartmark_postgrest::{PostgrestClient, SortOrder};

use super::BookmarkBackend;
use crate::error::{Error, Result};
use crate::models::{Bookmark, NewBookmark};

pub const BOOKMARKS_TABLE: &str = "bookmarks";

/// The `bookmarks` table over PostgREST.
#[derive(Debug, Clone)]
pub struct PostgrestBackend {
    base_url: String,
    anon_key: String,
    http_client: Client,
}

impl PostgrestBackend {
    pub fn new(base_url: &str, anon_key: &str, http_client: Client) -> Self {
        Self {
            base_url: base_url.to_string(),
            anon_key: anon_key.to_string(),
            http_client,
        }
    }

    fn table(&self, access_token: &str) -> PostgrestClient {
        PostgrestClient::new(
            &self.base_url,
            &self.anon_key,
            BOOKMARKS_TABLE,
            self.http_client.clone(),
        )
        .with_auth(access_token)
    }
}

#[async_trait]
impl BookmarkBackend for PostgrestBackend {
    async fn select_all(&self, access_token: &str, user_id: &str) -> Result<Vec<Bookmark>> {
        Ok(self
            .table(access_token)
            .select("*")
            .eq("user_id", user_id)
            .order("created_at", SortOrder::Descending)
            .execute()
            .await?)
    }

    async fn insert(&self, access_token: &str, bookmark: &NewBookmark) -> Result<Bookmark> {
        let rows: Vec<Bookmark> = self.table(access_token).insert(bookmark).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::store("insert returned no rows"))
    }

    async fn delete(&self, access_token: &str, id: &str) -> Result<()> {
        Ok(self.table(access_token).eq("id", id).delete().await?)
    }
}
