use crate::client::RealtimeClient;
use crate::error::RealtimeError;
use crate::filters::{DatabaseFilter, FilterOperator};
use crate::message::{ChangeType, ChannelEvent, PostgresChange, RealtimeMessage};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// データベース変更監視設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresChanges {
    table: String,
    event: Option<ChangeType>,
    filter: Option<DatabaseFilter>,
}

impl PostgresChanges {
    /// 新しいデータベース変更監視設定を作成 (all events, `public` schema)
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            event: None,
            filter: None,
        }
    }

    /// Restrict the binding to one kind of change.
    pub fn event(mut self, event: ChangeType) -> Self {
        self.event = Some(event);
        self
    }

    /// フィルター条件を設定 (the server accepts a single filter per binding)
    pub fn filter(mut self, filter: DatabaseFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn eq(self, column: &str, value: &str) -> Self {
        self.filter(DatabaseFilter::new(column, FilterOperator::Eq, value))
    }

    /// Binding object sent in the join payload.
    pub(crate) fn to_config(&self) -> Value {
        let event = match self.event {
            Some(ChangeType::Insert) => "INSERT",
            Some(ChangeType::Update) => "UPDATE",
            Some(ChangeType::Delete) => "DELETE",
            None => "*",
        };
        let mut config = json!({
            "event": event,
            "schema": "public",
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            config["filter"] = Value::String(filter.to_string());
        }
        config
    }
}

/// チャンネル作成と購読設定のためのビルダー
pub struct ChannelBuilder<'a> {
    client: &'a RealtimeClient,
    topic: String,
    changes: Vec<PostgresChanges>,
    access_token: Option<String>,
}

impl<'a> ChannelBuilder<'a> {
    pub(crate) fn new(client: &'a RealtimeClient, name: &str) -> Self {
        Self {
            client,
            topic: format!("realtime:{}", name),
            changes: Vec::new(),
            access_token: None,
        }
    }

    /// データベース変更イベントの監視を追加
    pub fn on_postgres_changes(mut self, changes: PostgresChanges) -> Self {
        self.changes.push(changes);
        self
    }

    /// User JWT so row level security applies to the delivered rows.
    pub fn access_token(mut self, token: &str) -> Self {
        self.access_token = Some(token.to_string());
        self
    }

    pub(crate) fn join_payload(&self) -> Value {
        let bindings: Vec<Value> = self.changes.iter().map(PostgresChanges::to_config).collect();
        let mut payload = json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": bindings,
                "private": false,
            }
        });
        if let Some(token) = &self.access_token {
            payload["access_token"] = Value::String(token.clone());
        }
        payload
    }

    /// チャンネルへの接続と購読を開始
    ///
    /// Connects the client if needed, joins the channel and waits for the
    /// server to acknowledge the join.
    pub async fn subscribe(self) -> Result<Subscription, RealtimeError> {
        if self.changes.is_empty() {
            return Err(RealtimeError::SubscriptionError(
                "channel has no postgres_changes bindings".to_string(),
            ));
        }

        self.client.connect().await?;

        let (sender, events) = mpsc::unbounded_channel();
        {
            let mut channels = self.client.channels.write().await;
            if channels.contains_key(&self.topic) {
                return Err(RealtimeError::SubscriptionError(format!(
                    "{} is already subscribed",
                    self.topic
                )));
            }
            channels.insert(self.topic.clone(), sender);
        }

        let join_ref = self.client.next_ref();
        let reply = self.client.register_reply(&join_ref).await;
        let message = RealtimeMessage::new(
            &self.topic,
            ChannelEvent::Join,
            self.join_payload(),
            Some(join_ref.clone()),
        );

        let outcome = match self.client.send_message(&message).await {
            Ok(()) => match timeout(self.client.options.join_timeout, reply).await {
                Ok(Ok(reply)) if reply.is_ok() => Ok(()),
                Ok(Ok(reply)) => Err(RealtimeError::SubscriptionError(format!(
                    "join rejected with status {}: {}",
                    reply.status, reply.response
                ))),
                Ok(Err(_)) => Err(RealtimeError::ConnectionError(
                    "connection closed before the join was acknowledged".to_string(),
                )),
                Err(_) => Err(RealtimeError::Timeout(format!("join of {}", self.topic))),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            warn!("Failed to join {}: {}", self.topic, e);
            self.client.forget_reply(&join_ref).await;
            self.client.channels.write().await.remove(&self.topic);
            return Err(e);
        }

        info!("Joined realtime channel {}", self.topic);
        Ok(Subscription {
            topic: self.topic,
            client: self.client.clone(),
            events,
            closed: false,
        })
    }
}

/// アクティブなチャンネル購読を表す
///
/// Leaves the channel on `close`, or in the background when dropped.
pub struct Subscription {
    topic: String,
    client: RealtimeClient,
    events: mpsc::UnboundedReceiver<PostgresChange>,
    closed: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next change, or `None` once the channel or connection has closed.
    pub async fn recv(&mut self) -> Option<PostgresChange> {
        self.events.recv().await
    }

    /// Leaves the channel and waits for the leave message to be queued.
    pub async fn close(mut self) -> Result<(), RealtimeError> {
        self.closed = true;
        self.events.close();
        self.client.leave(&self.topic).await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let topic = self.topic.clone();
        let client = self.client.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.leave(&topic).await {
                        warn!("Error leaving channel {}: {}", topic, e);
                    }
                });
            }
            Err(_) => debug!("No runtime to leave {} on drop", self.topic),
        }
    }
}
