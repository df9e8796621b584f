//! In-memory stand-ins for GoTrue and the `bookmarks` table
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use smartmark::error::{Error, Result};
use smartmark::models::{Bookmark, NewBookmark};
use smartmark::preferences::Preferences;
use smartmark::session::{IdentityProvider, MemorySessionStore, Session, SessionManager, User};
use smartmark::store::{BookmarkBackend, BookmarkChange, BookmarkStore, ChangeFeed, ChangeSubscription, FeedGuard};
use smartmark::App;
use smartmark_auth::AuthError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const REDIRECT: &str = "http://localhost:3000/auth/callback";

pub fn user(id: &str) -> User {
    User {
        id: id.to_string(),
        email: Some(format!("{}@example.com", id)),
        app_metadata: serde_json::Value::Null,
        user_metadata: serde_json::json!({ "full_name": format!("User {}", id) }),
        created_at: None,
    }
}

/// A session for `user_id` whose token expires `expires_in` seconds from now.
pub fn session(user_id: &str, expires_in: i64) -> Session {
    Session {
        access_token: token_for(user_id),
        refresh_token: format!("refresh-{}", user_id),
        expires_in,
        expires_at_field: Some(Utc::now().timestamp() + expires_in),
        token_type: "bearer".to_string(),
        user: user(user_id),
    }
}

fn token_for(user_id: &str) -> String {
    format!("access-{}", user_id)
}

fn rejected(message: &str) -> Error {
    Error::Auth(AuthError::ApiError {
        status: 400,
        message: message.to_string(),
    })
}

/// GoTrue for a single Google account.
pub struct FakeProvider {
    user_id: String,
    pub reject_refresh: AtomicBool,
    pub fail_sign_out: AtomicBool,
    pub refreshes: AtomicUsize,
    pub sign_outs: AtomicUsize,
}

impl FakeProvider {
    pub fn new(user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            user_id: user_id.to_string(),
            reject_refresh: AtomicBool::new(false),
            fail_sign_out: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
            sign_outs: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> Result<String> {
        Ok(format!(
            "https://project.supabase.co/auth/v1/authorize?provider=google&redirect_to={}&code_challenge={}&code_challenge_method=s256",
            redirect_to, code_challenge
        ))
    }

    async fn exchange_code(&self, code: &str, _code_verifier: &str) -> Result<Session> {
        if code != "good-code" {
            return Err(rejected("invalid flow state, no valid flow state found"));
        }
        Ok(session(&self.user_id, 3600))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Session> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        if self.reject_refresh.load(Ordering::SeqCst) {
            return Err(rejected("Invalid Refresh Token: Refresh Token Not Found"));
        }
        Ok(session(&self.user_id, 3600))
    }

    async fn get_user(&self, access_token: &str) -> Result<User> {
        if access_token != token_for(&self.user_id) {
            return Err(Error::Auth(AuthError::AuthenticationError("invalid JWT".to_string())));
        }
        Ok(user(&self.user_id))
    }

    async fn sign_out(&self, _access_token: &str) -> Result<()> {
        self.sign_outs.fetch_add(1, Ordering::SeqCst);
        if self.fail_sign_out.load(Ordering::SeqCst) {
            return Err(Error::store("connection reset"));
        }
        Ok(())
    }
}

struct Release(Arc<AtomicUsize>);

impl FeedGuard for Release {
    fn release(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// The `bookmarks` table with row-level security and a per-user change feed.
/// Every App built on the same backend sees the same rows.
pub struct InMemoryBackend {
    rows: Mutex<Vec<Bookmark>>,
    feeds: Mutex<Vec<(String, mpsc::UnboundedSender<BookmarkChange>)>>,
    next_id: AtomicI64,
    pub fail_selects: AtomicBool,
    pub fail_inserts: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub released: Arc<AtomicUsize>,
    pub subscribes: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rows: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            fail_selects: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            released: Arc::new(AtomicUsize::new(0)),
            subscribes: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        })
    }

    /// Stores a row directly, as another device would.
    pub fn seed(&self, user_id: &str, title: &str, url: &str, category: &str) -> Bookmark {
        let new = NewBookmark::new(user_id, title, url, category).unwrap();
        let bookmark = self.store_row(&new);
        self.broadcast(user_id, BookmarkChange::Inserted(bookmark.clone()));
        bookmark
    }

    pub fn rows(&self, user_id: &str) -> Vec<Bookmark> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Feeds for `user_id` whose subscriber is still listening.
    pub fn active_feeds(&self, user_id: &str) -> usize {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .filter(|(owner, tx)| owner == user_id && !tx.is_closed())
            .count()
    }

    /// Ends every feed of `user_id` from the server side.
    pub fn drop_feeds(&self, user_id: &str) {
        self.feeds.lock().unwrap().retain(|(owner, _)| owner != user_id);
    }

    /// Tokens pushed to open feeds after a refresh.
    pub fn token_updates(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }

    fn store_row(&self, new: &NewBookmark) -> Bookmark {
        // One second apart so newest-first order is unambiguous
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bookmark = Bookmark {
            id: n.to_string(),
            title: new.title.clone(),
            url: new.url.clone(),
            category: new.category.clone(),
            created_at: Utc::now() + ChronoDuration::seconds(n),
            user_id: new.user_id.clone(),
        };
        self.rows.lock().unwrap().push(bookmark.clone());
        bookmark
    }

    fn broadcast(&self, user_id: &str, change: BookmarkChange) {
        for (owner, tx) in self.feeds.lock().unwrap().iter() {
            if owner == user_id {
                let _ = tx.send(change.clone());
            }
        }
    }

    fn authorize(access_token: &str, user_id: &str) -> Result<()> {
        if access_token == token_for(user_id) {
            Ok(())
        } else {
            Err(Error::store("new row violates row-level security policy"))
        }
    }

    fn owner_of(&self, id: &str) -> Option<String> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.user_id.clone())
    }
}

#[async_trait]
impl BookmarkBackend for InMemoryBackend {
    async fn select_all(&self, access_token: &str, user_id: &str) -> Result<Vec<Bookmark>> {
        Self::authorize(access_token, user_id)?;
        if self.fail_selects.load(Ordering::SeqCst) {
            return Err(Error::store("select failed"));
        }
        let mut rows = self.rows(user_id);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn insert(&self, access_token: &str, bookmark: &NewBookmark) -> Result<Bookmark> {
        Self::authorize(access_token, &bookmark.user_id)?;
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::store("insert failed"));
        }
        let created = self.store_row(bookmark);
        self.broadcast(&created.user_id, BookmarkChange::Inserted(created.clone()));
        Ok(created)
    }

    async fn delete(&self, access_token: &str, id: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::store("delete failed"));
        }
        // Rows the caller does not own are invisible, so nothing happens
        let Some(owner) = self.owner_of(id) else {
            return Ok(());
        };
        if Self::authorize(access_token, &owner).is_err() {
            return Ok(());
        }
        self.rows.lock().unwrap().retain(|b| b.id != id);
        self.broadcast(&owner, BookmarkChange::Deleted(id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, access_token: &str, user_id: &str) -> Result<ChangeSubscription> {
        Self::authorize(access_token, user_id)?;
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::store("channel join timed out"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push((user_id.to_string(), tx));
        Ok(ChangeSubscription::new(rx, Release(self.released.clone())))
    }

    async fn update_token(&self, access_token: &str) -> Result<()> {
        self.tokens.lock().unwrap().push(access_token.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub app: App,
    pub sessions: Arc<MemorySessionStore>,
    pub data_dir: tempfile::TempDir,
}

/// An App for `provider`'s user over `backend`, starting from `persisted`.
pub fn harness(provider: Arc<FakeProvider>, backend: Arc<InMemoryBackend>, persisted: Option<Session>) -> Harness {
    let sessions = Arc::new(match persisted {
        Some(session) => MemorySessionStore::with_session(session),
        None => MemorySessionStore::new(),
    });
    let manager = SessionManager::new(provider, sessions.clone(), REDIRECT, Duration::from_secs(60));
    let store = BookmarkStore::new(backend.clone(), backend);
    let data_dir = tempfile::tempdir().unwrap();
    let preferences = Preferences::load(data_dir.path().join("preferences.json"));

    Harness {
        app: App::new(Arc::new(manager), store, preferences).with_reconnect_delay(Duration::from_millis(10)),
        sessions,
        data_dir,
    }
}

pub fn preferences_path(harness: &Harness) -> std::path::PathBuf {
    Path::new(harness.data_dir.path()).join("preferences.json")
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
