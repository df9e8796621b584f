//! Loopback listener for the OAuth callback route
//!
//! The identity provider redirects the browser to `{site_url}/auth/callback`
//! with either `?code=…` or `?error=…`. This serves that one route on a local
//! port and hands the outcome to whoever is waiting for it.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::CALLBACK_PATH;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug)]
enum Outcome {
    Code(String),
    Denied(String),
}

const SIGNED_IN_PAGE: &str =
    "<!doctype html><title>SmartMark</title><p>Signed in. You can close this tab and return to the terminal.</p>";
const DENIED_PAGE: &str =
    "<!doctype html><title>SmartMark</title><p>Sign-in was not completed. Return to the terminal and try again.</p>";

async fn callback(
    State(outcomes): State<mpsc::Sender<Outcome>>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, Html<&'static str>) {
    let (outcome, page) = match query {
        CallbackQuery { code: Some(code), .. } => (Outcome::Code(code), SIGNED_IN_PAGE),
        CallbackQuery {
            error: Some(error),
            error_description,
            ..
        } => (
            Outcome::Denied(error_description.unwrap_or(error)),
            DENIED_PAGE,
        ),
        _ => return (StatusCode::BAD_REQUEST, Html(DENIED_PAGE)),
    };

    // Only the first callback counts
    if outcomes.try_send(outcome).is_err() {
        warn!("ignoring repeated sign-in callback");
    }
    (StatusCode::OK, Html(page))
}

/// A running callback listener. Stops when the code arrives or on drop.
pub struct CallbackServer {
    addr: SocketAddr,
    outcomes: mpsc::Receiver<Outcome>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackServer {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (outcome_tx, outcomes) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let router = Router::new()
            .route(CALLBACK_PATH, get(callback))
            .with_state(outcome_tx);

        tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "callback server failed");
            }
        });

        info!(%addr, "waiting for the sign-in callback");
        Ok(Self {
            addr,
            outcomes,
            shutdown: Some(shutdown_tx),
        })
    }

    /// The callback URL this listener answers on.
    pub fn redirect_url(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    /// Waits for the provider to redirect back and returns the auth code.
    pub async fn wait_for_code(mut self, timeout: Duration) -> Result<String> {
        let outcome = tokio::time::timeout(timeout, self.outcomes.recv())
            .await
            .map_err(|_| Error::login("timed out waiting for the sign-in callback"))?
            .ok_or_else(|| Error::login("callback server stopped"))?;

        self.stop();
        match outcome {
            Outcome::Code(code) => Ok(code),
            Outcome::Denied(reason) => Err(Error::login(reason)),
        }
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        // Graceful, so a response still being written is not cut off
        self.stop();
    }
}
