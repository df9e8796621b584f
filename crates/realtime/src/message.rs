use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Represents a full message received or sent over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub message_ref: Option<String>,
}

impl RealtimeMessage {
    pub fn new(topic: &str, event: ChannelEvent, payload: Value, message_ref: Option<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.as_str().to_string(),
            payload,
            message_ref,
        }
    }

    /// The known event kind, or `None` for events this client does not handle.
    pub fn kind(&self) -> Option<ChannelEvent> {
        ChannelEvent::parse(&self.event)
    }
}

/// チャンネルイベント (Phoenix/Realtime specific events)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    Join,
    Reply,
    Leave,
    Close,
    Error,
    Heartbeat,
    PostgresChanges,
    System,
    /// Client-sent: replaces the JWT a joined channel authorizes with.
    AccessToken,
}

impl ChannelEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Join => "phx_join",
            Self::Reply => "phx_reply",
            Self::Leave => "phx_leave",
            Self::Close => "phx_close",
            Self::Error => "phx_error",
            Self::Heartbeat => "heartbeat",
            Self::PostgresChanges => "postgres_changes",
            Self::System => "system",
            Self::AccessToken => "access_token",
        }
    }

    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "phx_join" => Some(Self::Join),
            "phx_reply" => Some(Self::Reply),
            "phx_leave" => Some(Self::Leave),
            "phx_close" => Some(Self::Close),
            "phx_error" => Some(Self::Error),
            "heartbeat" => Some(Self::Heartbeat),
            "postgres_changes" => Some(Self::PostgresChanges),
            "system" => Some(Self::System),
            "access_token" => Some(Self::AccessToken),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `phx_reply` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub status: String,
    #[serde(default)]
    pub response: Value,
}

impl ReplyPayload {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// 行レベルの変更種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

/// Payload of a `postgres_changes` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresChangesPayload {
    #[serde(default)]
    pub ids: Vec<u64>,
    pub data: PostgresChange,
}

/// A single row-level change delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChange {
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// The new row for inserts and updates, `Null` for deletes.
    #[serde(default)]
    pub record: Value,
    /// The old row (primary key at minimum) for updates and deletes.
    #[serde(default)]
    pub old_record: Value,
}

impl PostgresChange {
    pub fn record_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.record)
    }

    pub fn old_record_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.old_record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_insert_change_payload() {
        let raw = json!({
            "topic": "realtime:bookmarks-realtime",
            "event": "postgres_changes",
            "payload": {
                "ids": [42],
                "data": {
                    "schema": "public",
                    "table": "bookmarks",
                    "commit_timestamp": "2024-05-01T10:00:00Z",
                    "type": "INSERT",
                    "record": { "id": "b1", "title": "Example" },
                    "old_record": null,
                    "columns": []
                }
            },
            "ref": null
        });

        let message: RealtimeMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(message.kind(), Some(ChannelEvent::PostgresChanges));
        assert!(message.message_ref.is_none());

        let payload: PostgresChangesPayload = serde_json::from_value(message.payload).unwrap();
        assert_eq!(payload.ids, vec![42]);
        assert_eq!(payload.data.change_type, ChangeType::Insert);
        assert_eq!(payload.data.record["title"], "Example");
        assert!(payload.data.old_record.is_null());
    }

    #[test]
    fn unknown_events_have_no_kind() {
        let message = RealtimeMessage {
            topic: "realtime:x".to_string(),
            event: "presence_diff".to_string(),
            payload: Value::Null,
            message_ref: None,
        };
        assert_eq!(message.kind(), None);
    }

    #[test]
    fn delete_change_exposes_old_record() {
        #[derive(Deserialize)]
        struct Key {
            id: String,
        }

        let change: PostgresChange = serde_json::from_value(json!({
            "schema": "public",
            "table": "bookmarks",
            "type": "DELETE",
            "old_record": { "id": "b7" }
        }))
        .unwrap();

        assert_eq!(change.change_type, ChangeType::Delete);
        assert_eq!(change.old_record_as::<Key>().unwrap().id, "b7");
    }
}
