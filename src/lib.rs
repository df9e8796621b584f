//! SmartMark client library
//!
//! A realtime bookmark manager on Supabase: Google sign-in through GoTrue,
//! bookmarks in a PostgREST table, and live updates from Realtime.
//!
//! ```no_run
//! use smartmark::{App, Config};
//!
//! # async fn run() -> smartmark::error::Result<()> {
//! let config = Config::from_env()?;
//! let mut app = App::from_config(&config)?;
//! app.start().await;
//! for card in app.cards() {
//!     println!("{} ({})", card.title, card.hostname);
//! }
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod callback;
pub mod config;
pub mod error;
pub mod models;
pub mod preferences;
pub mod session;
pub mod store;
pub mod view;

pub use crate::app::{App, FeedStatus, Notice, NoticeLevel, Screen};
pub use crate::config::Config;
pub use crate::error::{Error, Result};

/// A convenience module for common imports
pub mod prelude {
    pub use crate::app::{App, FeedStatus, Notice, NoticeLevel, Screen};
    pub use crate::config::Config;
    pub use crate::error::Error;
    pub use crate::models::{Bookmark, BookmarkCard, Category, NewBookmark};
    pub use crate::preferences::Theme;
    pub use crate::session::{AuthEvent, SessionManager};
    pub use crate::store::{BookmarkChange, BookmarkStore};
}
