//! Presentation state and the intents that drive it
//!
//! `App` owns the Session Manager, the store, the shared bookmark view and
//! the change-feed task. Front-ends read its state and call its intents;
//! they never talk to the services directly.

use reqwest::Client;
use smartmark_auth::AuthClient;
use smartmark_realtime::{RealtimeClient, RealtimeClientOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Bookmark, BookmarkCard, NewBookmark};
use crate::preferences::{Preferences, Theme};
use crate::session::{AuthEvent, FileSessionStore, LoginRedirect, Session, SessionDependent, SessionManager, User};
use crate::store::{BookmarkChange, BookmarkStore, ChangeSubscription, PostgrestBackend, RealtimeFeed};
use crate::view::BookmarkView;

/// Which top-level view to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Loading,
    SignedOut,
    Bookmarks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// A non-blocking message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// State of the live change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Signed out, live updates off, or the feed could not be opened.
    Stopped,
    Live,
    /// The feed dropped and is being resubscribed.
    Reconnecting,
}

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

type Notices = Arc<Mutex<Vec<Notice>>>;

fn push_notice(notices: &Notices, notice: Notice) {
    match notice.level {
        NoticeLevel::Error => warn!(message = %notice.message, "notice"),
        NoticeLevel::Info => info!(message = %notice.message, "notice"),
    }
    notices.lock().unwrap_or_else(|e| e.into_inner()).push(notice);
}

// Aborting the task drops its ChangeSubscription, which leaves the channel.
struct FeedTask(JoinHandle<()>);

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// The generation moves on every start and stop. A feed task only touches
// the view while its own generation is current, checked under the view lock.
struct FeedSlot {
    task: Mutex<Option<FeedTask>>,
    generation: AtomicU64,
    status: watch::Sender<FeedStatus>,
}

impl FeedSlot {
    fn new() -> Self {
        let (status, _) = watch::channel(FeedStatus::Stopped);
        Self {
            task: Mutex::new(None),
            generation: AtomicU64::new(0),
            status,
        }
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<FeedTask>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stops the running task, if any, and hands out the next generation.
    fn begin(&self) -> u64 {
        let mut task = self.lock_task();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *task = None;
        self.status.send_replace(FeedStatus::Stopped);
        generation
    }

    fn install(&self, generation: u64, task: FeedTask) {
        let mut slot = self.lock_task();
        // A stop in between wins; dropping `task` aborts it
        if self.is_current(generation) {
            *slot = Some(task);
        }
    }

    fn stop(&self) {
        let mut task = self.lock_task();
        self.generation.fetch_add(1, Ordering::SeqCst);
        *task = None;
        self.status.send_replace(FeedStatus::Stopped);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn set_status(&self, generation: u64, status: FeedStatus) {
        if self.is_current(generation) {
            self.status.send_replace(status);
        }
    }
}

impl SessionDependent for FeedSlot {
    fn session_ended(&self) {
        self.stop();
    }
}

/// Applies `change` unless the feed of `generation` has been stopped.
fn apply_change(view: &Mutex<BookmarkView>, slot: &FeedSlot, generation: u64, change: BookmarkChange) -> bool {
    let mut view = view.lock().unwrap_or_else(|e| e.into_inner());
    slot.is_current(generation) && view.apply(change)
}

#[derive(Debug, PartialEq, Eq)]
enum FeedEnd {
    Dropped,
    SessionOver,
}

/// Owns one open feed: applies its changes, keeps its token current and
/// resubscribes with backoff when the server drops it.
struct FeedSupervisor {
    generation: u64,
    slot: Arc<FeedSlot>,
    session: Arc<SessionManager>,
    store: BookmarkStore,
    view: Arc<Mutex<BookmarkView>>,
    events: broadcast::Sender<BookmarkChange>,
    notices: Notices,
    reconnect_delay: Duration,
}

impl FeedSupervisor {
    async fn run(self, mut subscription: ChangeSubscription, mut auth_events: broadcast::Receiver<AuthEvent>) {
        loop {
            let end = self.follow(&mut subscription, &mut auth_events).await;
            subscription.close();
            if end == FeedEnd::SessionOver {
                break;
            }

            warn!("change feed dropped, resubscribing");
            self.slot.set_status(self.generation, FeedStatus::Reconnecting);
            push_notice(&self.notices, Notice::info("Live updates interrupted. Reconnecting..."));
            match self.resubscribe().await {
                Some(next) => {
                    subscription = next;
                    self.slot.set_status(self.generation, FeedStatus::Live);
                    push_notice(&self.notices, Notice::info("Live updates restored."));
                }
                None => break,
            }
        }
        self.slot.set_status(self.generation, FeedStatus::Stopped);
        debug!("change feed stopped");
    }

    async fn follow(
        &self,
        subscription: &mut ChangeSubscription,
        auth_events: &mut broadcast::Receiver<AuthEvent>,
    ) -> FeedEnd {
        let mut not_before = Instant::now();
        loop {
            let Some(due_in) = self.session.refresh_due_in() else {
                return FeedEnd::SessionOver;
            };
            let refresh_at = (Instant::now() + due_in).max(not_before);

            tokio::select! {
                change = subscription.recv() => match change {
                    Some(change) => self.apply(change),
                    None => return FeedEnd::Dropped,
                },
                event = auth_events.recv() => match event {
                    Ok(AuthEvent::TokenRefreshed(session)) => self.update_token(&session).await,
                    Ok(AuthEvent::SignedIn(_)) => {}
                    Ok(AuthEvent::SignedOut) | Err(RecvError::Closed) => return FeedEnd::SessionOver,
                    Err(RecvError::Lagged(_)) => {
                        if let Some(session) = self.session.current() {
                            self.update_token(&session).await;
                        }
                    }
                },
                _ = tokio::time::sleep_until(refresh_at) => {
                    // A refresh comes back through `auth_events`
                    match self.session.ensure_fresh().await {
                        Ok(_) => {}
                        Err(Error::NotAuthenticated) => return FeedEnd::SessionOver,
                        Err(e) => warn!(error = %e, "refreshing the feed token failed"),
                    }
                    not_before = Instant::now() + MAX_RECONNECT_DELAY;
                }
            }
        }
    }

    async fn update_token(&self, session: &Session) {
        // On failure the server ends the channel once the old token expires
        if self.store.update_feed_token(session).await.is_ok() {
            debug!("change feed token updated");
        }
    }

    fn apply(&self, change: BookmarkChange) {
        if apply_change(&self.view, &self.slot, self.generation, change.clone()) {
            // No receivers is fine
            let _ = self.events.send(change);
        }
    }

    async fn resubscribe(&self) -> Option<ChangeSubscription> {
        let mut delay = self.reconnect_delay;
        loop {
            tokio::time::sleep(delay).await;
            match self.try_resubscribe().await {
                Ok(subscription) => return Some(subscription),
                Err(Error::NotAuthenticated) => return None,
                Err(e) => {
                    delay = (delay * 2).min(MAX_RECONNECT_DELAY);
                    warn!(error = %e, retry_in = ?delay, "resubscribing failed");
                }
            }
        }
    }

    async fn try_resubscribe(&self) -> Result<ChangeSubscription> {
        let session = self.session.ensure_fresh().await?;
        let subscription = self.store.subscribe_to_changes(&session).await?;
        // Whatever changed while the feed was down only shows in a fresh list
        let bookmarks = self.store.list_bookmarks(&session).await?;
        let mut view = self.view.lock().unwrap_or_else(|e| e.into_inner());
        if self.slot.is_current(self.generation) {
            view.replace_all(bookmarks);
        }
        Ok(subscription)
    }
}

pub struct App {
    session: Arc<SessionManager>,
    store: BookmarkStore,
    view: Arc<Mutex<BookmarkView>>,
    feed: Arc<FeedSlot>,
    feed_events: broadcast::Sender<BookmarkChange>,
    preferences: Preferences,
    screen: Screen,
    pending_delete: Option<String>,
    confirm_sign_out: bool,
    saving: bool,
    notices: Notices,
    live_updates: bool,
    reconnect_delay: Duration,
}

impl App {
    pub fn new(session: Arc<SessionManager>, store: BookmarkStore, preferences: Preferences) -> Self {
        let view = Arc::new(Mutex::new(BookmarkView::new()));
        let feed = Arc::new(FeedSlot::new());
        // Feed first, so no event lands in the view after it is cleared
        session.register_dependent(feed.clone());
        session.register_dependent(view.clone());
        let (feed_events, _) = broadcast::channel(64);

        Self {
            session,
            store,
            view,
            feed,
            feed_events,
            preferences,
            screen: Screen::Loading,
            pending_delete: None,
            confirm_sign_out: false,
            saving: false,
            notices: Arc::new(Mutex::new(Vec::new())),
            live_updates: true,
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Whether signing in opens the change feed. On by default; one-shot
    /// front-ends turn it off to skip the Realtime socket.
    pub fn with_live_updates(mut self, enabled: bool) -> Self {
        self.live_updates = enabled;
        self
    }

    /// First wait before resubscribing a dropped feed.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Wires GoTrue, PostgREST and Realtime clients from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http_client = Client::builder().timeout(config.request_timeout).build()?;
        let base_url = config.base_url();

        let auth = AuthClient::new(base_url, &config.anon_key, http_client.clone());
        let session = SessionManager::new(
            Arc::new(auth),
            Arc::new(FileSessionStore::new(config.session_path())),
            config.redirect_url()?.as_str(),
            config.refresh_margin,
        );

        let realtime = RealtimeClient::new_with_options(
            base_url,
            &config.anon_key,
            RealtimeClientOptions {
                heartbeat_interval: config.heartbeat_interval,
                ..Default::default()
            },
        );
        let store = BookmarkStore::new(
            Arc::new(PostgrestBackend::new(base_url, &config.anon_key, http_client)),
            Arc::new(RealtimeFeed::new(realtime)),
        );

        Ok(Self::new(
            Arc::new(session),
            store,
            Preferences::load(config.preferences_path()),
        )
        .with_reconnect_delay(config.reconnect_delay))
    }

    // --- state ---

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn user(&self) -> Option<User> {
        self.session.current_user()
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn cards(&self) -> Vec<BookmarkCard> {
        self.lock_view().cards()
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.lock_view().bookmarks()
    }

    /// "N saved"
    pub fn saved_count(&self) -> usize {
        self.lock_view().len()
    }

    pub fn pending_delete(&self) -> Option<&str> {
        self.pending_delete.as_deref()
    }

    pub fn is_confirming_sign_out(&self) -> bool {
        self.confirm_sign_out
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn is_feed_running(&self) -> bool {
        *self.feed.status.borrow() != FeedStatus::Stopped
    }

    /// Follows the feed through drops and reconnects.
    pub fn feed_status(&self) -> watch::Receiver<FeedStatus> {
        self.feed.status.subscribe()
    }

    pub fn theme(&self) -> Theme {
        self.preferences.theme()
    }

    /// Drains the notices raised since the last call.
    pub fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Changes the feed applied to the view, for front-ends that redraw on them.
    pub fn feed_events(&self) -> broadcast::Receiver<BookmarkChange> {
        self.feed_events.subscribe()
    }

    fn lock_view(&self) -> std::sync::MutexGuard<'_, BookmarkView> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify_error(&self, message: impl Into<String>) {
        push_notice(&self.notices, Notice::error(message));
    }

    // --- session intents ---

    /// Resolves the startup session and, if there is one, loads the list.
    pub async fn start(&mut self) -> Screen {
        self.screen = Screen::Loading;
        match self.session.get_current_session().await {
            Some(session) => self.enter_bookmarks(session).await,
            None => self.screen = Screen::SignedOut,
        }
        self.screen
    }

    pub fn begin_login(&self) -> Result<LoginRedirect> {
        self.session.begin_login()
    }

    /// Callback route: finishes sign-in with the provider's code.
    pub async fn complete_login(&mut self, code: &str) -> Result<()> {
        match self.session.complete_login(code).await {
            Ok(session) => {
                self.enter_bookmarks(session).await;
                Ok(())
            }
            Err(e) => {
                self.screen = Screen::SignedOut;
                Err(e)
            }
        }
    }

    async fn enter_bookmarks(&mut self, session: Session) {
        self.screen = Screen::Bookmarks;

        match self.store.list_bookmarks(&session).await {
            Ok(bookmarks) => self.lock_view().replace_all(bookmarks),
            Err(e) => self.notify_error(format!("Could not load bookmarks: {}", e)),
        }

        if !self.live_updates {
            return;
        }
        if let Err(e) = self.open_feed(&session).await {
            self.notify_error(format!("Live updates unavailable: {}", e));
        }
    }

    async fn open_feed(&mut self, session: &Session) -> Result<()> {
        let generation = self.feed.begin();
        // Before subscribing, so no refresh slips between the two
        let auth_events = self.session.on_session_change();
        let subscription = self.store.subscribe_to_changes(session).await?;

        let supervisor = FeedSupervisor {
            generation,
            slot: self.feed.clone(),
            session: self.session.clone(),
            store: self.store.clone(),
            view: self.view.clone(),
            events: self.feed_events.clone(),
            notices: self.notices.clone(),
            reconnect_delay: self.reconnect_delay,
        };
        self.feed.set_status(generation, FeedStatus::Live);
        let handle = tokio::spawn(supervisor.run(subscription, auth_events));
        self.feed.install(generation, FeedTask(handle));
        Ok(())
    }

    pub fn request_sign_out(&mut self) {
        self.confirm_sign_out = true;
    }

    pub fn cancel_sign_out(&mut self) {
        self.confirm_sign_out = false;
    }

    /// Signs out if the confirmation is showing; otherwise does nothing.
    pub async fn confirm_sign_out(&mut self) -> Result<()> {
        if !self.confirm_sign_out {
            return Ok(());
        }
        self.sign_out().await
    }

    /// Ends the session. Local state is cleared even when the provider
    /// call fails; that failure is raised as a notice and returned.
    pub async fn sign_out(&mut self) -> Result<()> {
        let result = self.session.end_session().await;
        self.signed_out();
        if let Err(e) = &result {
            self.notify_error(format!("Sign-out with the provider failed: {}", e));
        }
        result
    }

    fn signed_out(&mut self) {
        self.screen = Screen::SignedOut;
        self.confirm_sign_out = false;
        self.pending_delete = None;
        self.saving = false;
    }

    async fn active_session(&mut self) -> Result<Session> {
        match self.session.ensure_fresh().await {
            Ok(session) => Ok(session),
            Err(Error::NotAuthenticated) => {
                if self.screen == Screen::Bookmarks {
                    push_notice(&self.notices, Notice::info("Your session has expired. Please sign in again."));
                }
                self.signed_out();
                Err(Error::NotAuthenticated)
            }
            Err(e) => Err(e),
        }
    }

    // --- bookmark intents ---

    /// Submits the creation form. The entry shows at once and is replaced by
    /// the stored record, or withdrawn with a notice if the store refuses it.
    pub async fn create_bookmark(&mut self, title: &str, url: &str, category: &str) -> Result<Bookmark> {
        let session = self.active_session().await?;
        let new = match NewBookmark::new(&session.user.id, title, url, category) {
            Ok(new) => new,
            Err(e) => {
                self.notify_error(e.to_string());
                return Err(e);
            }
        };

        self.saving = true;
        let provisional = self.lock_view().add_provisional(&new);
        let result = self.store.create_bookmark(&session, &new).await;
        self.saving = false;

        match result {
            Ok(created) => {
                debug!(%provisional, id = %created.id, "provisional entry confirmed");
                self.lock_view().confirm_provisional(&provisional, created.clone());
                Ok(created)
            }
            Err(e) => {
                self.lock_view().discard_provisional(&provisional);
                self.notify_error(format!("Could not save \"{}\": {}", new.title, e));
                Err(e)
            }
        }
    }

    pub fn request_delete(&mut self, id: &str) {
        self.pending_delete = Some(id.to_string());
    }

    pub fn cancel_delete(&mut self) {
        self.pending_delete = None;
    }

    /// Deletes the bookmark awaiting confirmation, if any.
    pub async fn confirm_delete(&mut self) -> Result<()> {
        match self.pending_delete.take() {
            Some(id) => self.delete_bookmark(&id).await,
            None => Ok(()),
        }
    }

    /// Removes the entry at once; puts it back with a notice if the store
    /// refuses. Deleting an id that is not shown still asks the store.
    pub async fn delete_bookmark(&mut self, id: &str) -> Result<()> {
        let session = self.active_session().await?;
        let removed = self.lock_view().remove(id);

        if let Err(e) = self.store.delete_bookmark(&session, id).await {
            if let Some(removed) = removed {
                let title = removed.bookmark.title.clone();
                self.lock_view().restore(removed);
                self.notify_error(format!("Could not delete \"{}\": {}", title, e));
            } else {
                self.notify_error(format!("Could not delete bookmark {}: {}", id, e));
            }
            return Err(e);
        }
        // A feed replay of the row must not bring it back
        self.lock_view().mark_deleted(id);
        Ok(())
    }

    /// Reloads the list from the store. A failure keeps the current list
    /// and raises a notice.
    pub async fn refresh(&mut self) -> Result<()> {
        let session = self.active_session().await?;
        match self.store.list_bookmarks(&session).await {
            Ok(bookmarks) => {
                self.lock_view().replace_all(bookmarks);
                Ok(())
            }
            Err(e) => {
                self.notify_error(format!("Could not load bookmarks: {}", e));
                Err(e)
            }
        }
    }

    pub fn toggle_theme(&mut self) -> Result<Theme> {
        let theme = self.preferences.toggle_theme()?;
        info!(%theme, "theme toggled");
        Ok(theme)
    }
}

impl Drop for App {
    // The feed task holds the session manager, which holds the slot
    fn drop(&mut self) {
        self.feed.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bookmark(id: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            title: "Example".to_string(),
            url: "https://example.com".to_string(),
            category: "Dev".to_string(),
            created_at: Utc::now(),
            user_id: "u1".to_string(),
        }
    }

    #[test]
    fn stopped_feed_cannot_touch_the_view() {
        let view = Mutex::new(BookmarkView::new());
        let slot = FeedSlot::new();
        let generation = slot.begin();

        assert!(apply_change(&view, &slot, generation, BookmarkChange::Inserted(bookmark("1"))));

        slot.session_ended();
        view.lock().unwrap().clear();
        assert!(!apply_change(&view, &slot, generation, BookmarkChange::Inserted(bookmark("2"))));
        assert!(view.lock().unwrap().is_empty());
    }

    #[test]
    fn restart_supersedes_the_previous_feed() {
        let view = Mutex::new(BookmarkView::new());
        let slot = FeedSlot::new();
        let first = slot.begin();
        let second = slot.begin();

        assert!(!apply_change(&view, &slot, first, BookmarkChange::Inserted(bookmark("1"))));
        assert!(apply_change(&view, &slot, second, BookmarkChange::Inserted(bookmark("1"))));
    }

    #[test]
    fn status_follows_the_current_generation() {
        let slot = FeedSlot::new();
        let status = slot.status.subscribe();
        let generation = slot.begin();

        slot.set_status(generation, FeedStatus::Live);
        assert_eq!(*status.borrow(), FeedStatus::Live);

        slot.stop();
        slot.set_status(generation, FeedStatus::Reconnecting);
        assert_eq!(*status.borrow(), FeedStatus::Stopped);
    }
}
