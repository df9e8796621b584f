//! Realtime change-feed client for SmartMark
//!
//! This crate speaks the Supabase Realtime (Phoenix channel) protocol over a
//! WebSocket and delivers row-level `postgres_changes` events for a table,
//! optionally scoped by a filter such as `user_id=eq.<id>`.

mod channel;
mod client;
mod error;
mod filters;
mod message;

pub use channel::{ChannelBuilder, PostgresChanges, Subscription};
pub use client::{ConnectionState, RealtimeClient, RealtimeClientOptions};
pub use error::RealtimeError;
pub use filters::{DatabaseFilter, FilterOperator};
pub use message::{
    ChangeType, ChannelEvent, PostgresChange, PostgresChangesPayload, RealtimeMessage,
    ReplyPayload,
};
