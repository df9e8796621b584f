//! Error handling for the SmartMark client

use std::fmt;
use thiserror::Error;

use smartmark_auth::AuthError;
use smartmark_postgrest::PostgrestError;
use smartmark_realtime::RealtimeError;

/// Unified error type for SmartMark
#[derive(Error, Debug)]
pub enum Error {
    /// Identity provider errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Backing store errors
    #[error("Database error: {0}")]
    Postgrest(#[from] PostgrestError),

    /// Change feed errors
    #[error("Realtime error: {0}")]
    Realtime(#[from] RealtimeError),

    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected user input, e.g. an empty bookmark title
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation that needs a signed-in user was called without one
    #[error("Not signed in")]
    NotAuthenticated,

    /// The login handshake could not be completed
    #[error("Login failed: {0}")]
    Login(String),

    /// The store answered with something we could not use
    #[error("Unexpected store response: {0}")]
    Store(String),
}

impl Error {
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    pub fn invalid_input<T: fmt::Display>(msg: T) -> Self {
        Error::InvalidInput(msg.to_string())
    }

    pub fn login<T: fmt::Display>(msg: T) -> Self {
        Error::Login(msg.to_string())
    }

    pub fn store<T: fmt::Display>(msg: T) -> Self {
        Error::Store(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
