//! Session Manager
//!
//! Tracks who is signed in. The identity provider and the place the session
//! is persisted are injected, so the same manager runs against GoTrue in the
//! binary and against fakes in tests.

mod store;

pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

use async_trait::async_trait;
use chrono::Utc;
use smartmark_auth::{AuthClient, OAuthProvider, OAuthSignInOptions, PkcePair};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

pub use smartmark_auth::{Session, User};

/// The calls the Session Manager makes to the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Google authorize URL carrying the PKCE challenge.
    fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> Result<String>;
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Session>;
    async fn refresh(&self, refresh_token: &str) -> Result<Session>;
    async fn get_user(&self, access_token: &str) -> Result<User>;
    async fn sign_out(&self, access_token: &str) -> Result<()>;
}

#[async_trait]
impl IdentityProvider for AuthClient {
    fn authorize_url(&self, redirect_to: &str, code_challenge: &str) -> Result<String> {
        let options = OAuthSignInOptions {
            redirect_to: Some(redirect_to.to_string()),
            code_challenge: Some(code_challenge.to_string()),
            ..Default::default()
        };
        Ok(self.get_oauth_sign_in_url(OAuthProvider::Google, options)?)
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<Session> {
        Ok(self.exchange_code_for_session(code, code_verifier).await?)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        Ok(self.refresh_session(refresh_token).await?)
    }

    async fn get_user(&self, access_token: &str) -> Result<User> {
        Ok(AuthClient::get_user(self, access_token).await?)
    }

    async fn sign_out(&self, access_token: &str) -> Result<()> {
        Ok(AuthClient::sign_out(self, access_token).await?)
    }
}

/// Cached state that must not outlive the session.
///
/// `session_ended` runs before `end_session` returns, so it must not block.
pub trait SessionDependent: Send + Sync {
    fn session_ended(&self);
}

/// A session transition.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthEvent {
    /// The session after the transition.
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => Some(session),
            AuthEvent::SignedOut => None,
        }
    }
}

/// Where to send the user to sign in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRedirect {
    pub url: String,
    /// The callback the provider will return to
    pub redirect_to: String,
}

pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<dyn SessionStore>,
    current: RwLock<Option<Session>>,
    // PKCE verifier of the login in flight
    pending_verifier: Mutex<Option<String>>,
    events: broadcast::Sender<AuthEvent>,
    dependents: Mutex<Vec<Arc<dyn SessionDependent>>>,
    redirect_to: String,
    refresh_margin: Duration,
}

impl SessionManager {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        redirect_to: &str,
        refresh_margin: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            provider,
            store,
            current: RwLock::new(None),
            pending_verifier: Mutex::new(None),
            events,
            dependents: Mutex::new(Vec::new()),
            redirect_to: redirect_to.to_string(),
            refresh_margin,
        }
    }

    /// Registers a cache to be cleared whenever the session ends.
    pub fn register_dependent(&self, dependent: Arc<dyn SessionDependent>) {
        self.dependents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(dependent);
    }

    /// The session as currently known, without contacting the provider.
    pub fn current(&self) -> Option<Session> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn current_user(&self) -> Option<User> {
        self.current().map(|session| session.user)
    }

    fn set_current(&self, session: Option<Session>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = session;
    }

    fn emit(&self, event: AuthEvent) {
        debug!(
            user_id = event.session().map(|s| s.user.id.as_str()).unwrap_or("-"),
            "session change"
        );
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Receives every transition after this call.
    pub fn on_session_change(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Resolves the session at startup: loads the persisted one, refreshes
    /// it if expired and validates it with the provider. Any failure
    /// discards the persisted session and resolves to `None`.
    #[instrument(skip(self))]
    pub async fn get_current_session(&self) -> Option<Session> {
        let stored = match self.store.load().await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "could not read the persisted session");
                return None;
            }
        };

        match self.validate(stored).await {
            Ok(session) => {
                info!(user_id = %session.user.id, "restored session");
                self.set_current(Some(session.clone()));
                Some(session)
            }
            Err(e) => {
                warn!(error = %e, "persisted session is no longer valid");
                if let Err(e) = self.store.clear().await {
                    warn!(error = %e, "could not discard the persisted session");
                }
                None
            }
        }
    }

    async fn validate(&self, mut session: Session) -> Result<Session> {
        let mut refreshed = false;
        if session.expires_within(0, Utc::now()) {
            session = self.provider.refresh(&session.refresh_token).await?;
            refreshed = true;
        }
        session.user = self.provider.get_user(&session.access_token).await?;
        if refreshed {
            self.persist(&session).await;
        }
        Ok(session)
    }

    async fn persist(&self, session: &Session) {
        if let Err(e) = self.store.save(session).await {
            warn!(error = %e, "could not persist the session");
        }
    }

    /// Starts the Google sign-in handshake. Nothing changes until
    /// [`complete_login`](Self::complete_login) is called with the code.
    pub fn begin_login(&self) -> Result<LoginRedirect> {
        let pkce = PkcePair::generate();
        let url = self.provider.authorize_url(&self.redirect_to, &pkce.challenge)?;
        *self
            .pending_verifier
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(pkce.verifier);

        info!("login started");
        Ok(LoginRedirect {
            url,
            redirect_to: self.redirect_to.clone(),
        })
    }

    /// Finishes the handshake with the code the provider sent to the callback.
    #[instrument(skip(self, code))]
    pub async fn complete_login(&self, code: &str) -> Result<Session> {
        let verifier = self
            .pending_verifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::login("no login in progress"))?;

        let session = match self.provider.exchange_code(code, &verifier).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "code exchange failed");
                return Err(e);
            }
        };

        self.persist(&session).await;
        self.set_current(Some(session.clone()));
        info!(user_id = %session.user.id, "signed in");
        self.emit(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Signs out with the provider, then clears local state whatever the
    /// provider said. The provider's error, if any, is returned afterwards.
    #[instrument(skip(self))]
    pub async fn end_session(&self) -> Result<()> {
        let remote = match self.current() {
            Some(session) => self.provider.sign_out(&session.access_token).await,
            None => Ok(()),
        };
        if let Err(e) = &remote {
            warn!(error = %e, "provider sign-out failed; clearing local session anyway");
        }

        self.clear_local().await;
        info!("signed out");
        remote
    }

    async fn clear_local(&self) {
        self.set_current(None);
        *self
            .pending_verifier
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "could not remove the persisted session");
        }

        let dependents = self
            .dependents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for dependent in dependents {
            dependent.session_ended();
        }
        self.emit(AuthEvent::SignedOut);
    }

    /// Time left before [`ensure_fresh`](Self::ensure_fresh) would refresh
    /// the current token. `None` when signed out.
    pub fn refresh_due_in(&self) -> Option<Duration> {
        let session = self.current()?;
        let margin = i64::try_from(self.refresh_margin.as_secs()).unwrap_or(i64::MAX);
        let due = session
            .expires_at()
            .map(|expires_at| expires_at.saturating_sub(margin) - Utc::now().timestamp())
            .unwrap_or(0);
        Some(Duration::from_secs(u64::try_from(due).unwrap_or(0)))
    }

    /// Returns a session whose access token is valid for at least the
    /// refresh margin, refreshing it if needed. A refresh the provider
    /// rejects ends the session; a network failure leaves it in place.
    pub async fn ensure_fresh(&self) -> Result<Session> {
        let session = self.current().ok_or(Error::NotAuthenticated)?;
        let margin = i64::try_from(self.refresh_margin.as_secs()).unwrap_or(i64::MAX);
        if !session.expires_within(margin, Utc::now()) {
            return Ok(session);
        }

        debug!("access token near expiry, refreshing");
        match self.provider.refresh(&session.refresh_token).await {
            Ok(refreshed) => {
                self.persist(&refreshed).await;
                self.set_current(Some(refreshed.clone()));
                self.emit(AuthEvent::TokenRefreshed(refreshed.clone()));
                Ok(refreshed)
            }
            Err(Error::Auth(e)) if e.is_rejection() => {
                warn!(error = %e, "refresh rejected, session expired");
                self.clear_local().await;
                Err(Error::NotAuthenticated)
            }
            Err(e) => Err(e),
        }
    }
}
