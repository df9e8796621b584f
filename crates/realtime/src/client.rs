use crate::channel::ChannelBuilder;
use crate::error::RealtimeError;
use crate::message::{
    ChannelEvent, PostgresChange, PostgresChangesPayload, RealtimeMessage, ReplyPayload,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// RealtimeClient設定オプション
/// How long `disconnect` waits for the socket tasks before aborting them.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RealtimeClientOptions {
    pub heartbeat_interval: Duration,
    /// How long `subscribe` waits for the server to acknowledge a join.
    pub join_timeout: Duration,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) type ChannelMap = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<PostgresChange>>>>;
pub(crate) type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<ReplyPayload>>>>;

/// Realtimeクライアント本体
///
/// Cloning is cheap; clones share one WebSocket connection and channel table.
#[derive(Clone)]
pub struct RealtimeClient {
    pub(crate) url: String,
    pub(crate) key: String,
    pub(crate) options: RealtimeClientOptions,
    next_ref: Arc<AtomicU32>,
    // topic -> sender feeding the subscription for that topic
    pub(crate) channels: ChannelMap,
    pending_replies: PendingReplies,
    socket: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    state: Arc<RwLock<ConnectionState>>,
    state_change: broadcast::Sender<ConnectionState>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    connect_lock: Arc<Mutex<()>>,
}

impl RealtimeClient {
    /// デフォルトオプションで新しいクライアントを作成
    pub fn new(url: &str, key: &str) -> Self {
        Self::new_with_options(url, key, RealtimeClientOptions::default())
    }

    /// カスタムオプションで新しいクライアントを作成
    pub fn new_with_options(url: &str, key: &str, options: RealtimeClientOptions) -> Self {
        let (state_change, _) = broadcast::channel(16);
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            options,
            next_ref: Arc::new(AtomicU32::new(1)),
            channels: Arc::new(RwLock::new(HashMap::new())),
            pending_replies: Arc::new(Mutex::new(HashMap::new())),
            socket: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            state_change,
            tasks: Arc::new(Mutex::new(Vec::new())),
            connect_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 接続状態変更の通知を受け取るためのレシーバーを取得
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_change.subscribe()
    }

    /// 現在の接続状態を取得
    pub async fn get_connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Number of channels currently joined through this client.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// 特定のチャンネル名に対するビルダーを作成
    pub fn channel(&self, name: &str) -> ChannelBuilder {
        debug!("Creating channel builder for {}", name);
        ChannelBuilder::new(self, name)
    }

    /// 次のメッセージ参照番号を生成
    pub(crate) fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// WebSocket URL (`ws(s)://host/realtime/v1/websocket?apikey=..&vsn=1.0.0`)
    pub fn websocket_url(&self) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.url)?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(RealtimeError::ConnectionError(format!(
                    "Unsupported URL scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            RealtimeError::ConnectionError(format!("Cannot use scheme {} for {}", scheme, self.url))
        })?;
        url.set_path("/realtime/v1/websocket");
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    async fn set_connection_state(&self, state: ConnectionState) {
        set_state(&self.state, &self.state_change, state).await;
    }

    /// WebSocket接続を開始する
    ///
    /// Returns once the socket is open; reading, writing and heartbeats run in
    /// background tasks until `disconnect` or the server closes the socket.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let _guard = self.connect_lock.lock().await;
        if self.get_connection_state().await == ConnectionState::Connected {
            trace!("connect(): already connected");
            return Ok(());
        }

        let ws_url = self.websocket_url()?;
        info!("Connecting to realtime endpoint {}", redact_key(&ws_url));
        self.set_connection_state(ConnectionState::Connecting).await;

        let ws_stream = match connect_async(ws_url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                error!("WebSocket connection failed: {}", e);
                self.set_connection_state(ConnectionState::Disconnected).await;
                return Err(RealtimeError::ConnectionError(format!(
                    "WebSocket connection failed: {}",
                    e
                )));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (socket_tx, mut socket_rx) = mpsc::channel::<Message>(100);
        *self.socket.write().await = Some(socket_tx.clone());
        self.set_connection_state(ConnectionState::Connected).await;

        // --- WebSocket Writer Task ---
        let writer = tokio::spawn(async move {
            while let Some(message) = socket_rx.recv().await {
                trace!("Writer task sending {:?}", message);
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    error!("Writer task: WebSocket send error: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("Writer task finished");
        });

        // --- WebSocket Reader Task (and heartbeat) ---
        let channels = self.channels.clone();
        let pending = self.pending_replies.clone();
        let socket = self.socket.clone();
        let state = self.state.clone();
        let state_change = self.state_change.clone();
        let next_ref = self.next_ref.clone();
        let heartbeat_interval = self.options.heartbeat_interval;

        let reader = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    biased;

                    msg_result = read.next() => {
                        match msg_result {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<RealtimeMessage>(&text) {
                                    Ok(message) => route_message(message, &channels, &pending).await,
                                    Err(e) => error!("Failed to parse realtime message: {}. Raw: {}", e, text),
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                debug!("Reader task received close frame: {:?}", frame);
                                break;
                            }
                            Some(Ok(other)) => trace!("Ignoring non-text frame: {:?}", other),
                            Some(Err(e)) => {
                                error!("Reader task: WebSocket read error: {}", e);
                                break;
                            }
                            None => {
                                debug!("Reader task: stream closed by remote");
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        let heartbeat_ref = next_ref.fetch_add(1, Ordering::SeqCst).to_string();
                        let message = json!({
                            "topic": "phoenix",
                            "event": ChannelEvent::Heartbeat.as_str(),
                            "payload": {},
                            "ref": heartbeat_ref,
                        });
                        if let Err(e) = socket_tx.send(Message::Text(message.to_string())).await {
                            error!("Failed to send heartbeat: {}. Assuming connection lost.", e);
                            break;
                        }
                    }
                }
            }

            // Dropping the senders ends every open subscription stream.
            channels.write().await.clear();
            pending.lock().await.clear();
            *socket.write().await = None;
            set_state(&state, &state_change, ConnectionState::Disconnected).await;
            debug!("Reader task finished");
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    /// 切断処理
    pub async fn disconnect(&self) -> Result<(), RealtimeError> {
        info!("Disconnecting realtime client");
        if let Some(socket_tx) = self.socket.write().await.take() {
            // Best effort; the writer may already be gone.
            let _ = socket_tx.send(Message::Close(None)).await;
        }
        // Let the writer flush queued leaves and the close frame first
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let deadline = tokio::time::Instant::now() + CLOSE_GRACE;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.channels.write().await.clear();
        self.pending_replies.lock().await.clear();
        self.set_connection_state(ConnectionState::Disconnected).await;
        Ok(())
    }

    /// Sends a refreshed user JWT to every joined channel, so row level
    /// security keeps applying after the old token expires.
    pub async fn set_auth(&self, access_token: &str) -> Result<(), RealtimeError> {
        let topics: Vec<String> = self.channels.read().await.keys().cloned().collect();
        info!("Updating access token on {} channel(s)", topics.len());
        for topic in topics {
            let message = RealtimeMessage::new(
                &topic,
                ChannelEvent::AccessToken,
                json!({ "access_token": access_token }),
                Some(self.next_ref()),
            );
            self.send_message(&message).await?;
        }
        Ok(())
    }

    /// Helper to send a message through the WebSocket connection
    pub(crate) async fn send_message(&self, message: &RealtimeMessage) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(message)?;
        trace!("Sending realtime message: {}", text);
        let socket_guard = self.socket.read().await;
        match socket_guard.as_ref() {
            Some(socket_tx) => socket_tx
                .send(Message::Text(text))
                .await
                .map_err(|e| RealtimeError::ConnectionError(format!("Failed to send message to socket task: {}", e))),
            None => Err(RealtimeError::ConnectionError("Client socket unavailable".to_string())),
        }
    }

    pub(crate) async fn register_reply(&self, message_ref: &str) -> oneshot::Receiver<ReplyPayload> {
        let (tx, rx) = oneshot::channel();
        self.pending_replies.lock().await.insert(message_ref.to_string(), tx);
        rx
    }

    pub(crate) async fn forget_reply(&self, message_ref: &str) {
        self.pending_replies.lock().await.remove(message_ref);
    }

    /// Removes the topic from the channel table and tells the server to leave it.
    pub(crate) async fn leave(&self, topic: &str) -> Result<(), RealtimeError> {
        let removed = self.channels.write().await.remove(topic).is_some();
        if !removed {
            trace!("leave(): {} was not joined", topic);
            return Ok(());
        }
        if self.get_connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let message = RealtimeMessage::new(topic, ChannelEvent::Leave, json!({}), Some(self.next_ref()));
        self.send_message(&message).await
    }
}

async fn set_state(
    state: &RwLock<ConnectionState>,
    state_change: &broadcast::Sender<ConnectionState>,
    new_state: ConnectionState,
) {
    let mut current = state.write().await;
    if *current != new_state {
        debug!("Realtime state {:?} -> {:?}", *current, new_state);
        *current = new_state;
        // No receivers is fine
        let _ = state_change.send(new_state);
    }
}

fn redact_key(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(Some("apikey=***&vsn=1.0.0"));
    redacted.to_string()
}

/// Dispatches one incoming message to a pending reply or a channel stream.
pub(crate) async fn route_message(
    message: RealtimeMessage,
    channels: &ChannelMap,
    pending: &PendingReplies,
) {
    match message.kind() {
        Some(ChannelEvent::Reply) => {
            let waiter = match message.message_ref.as_deref() {
                Some(message_ref) => pending.lock().await.remove(message_ref),
                None => None,
            };
            match (waiter, serde_json::from_value::<ReplyPayload>(message.payload)) {
                (Some(waiter), Ok(reply)) => {
                    let _ = waiter.send(reply);
                }
                (None, _) => trace!("Reply for {} without a waiter", message.topic),
                (Some(_), Err(e)) => warn!("Malformed reply on {}: {}", message.topic, e),
            }
        }
        Some(ChannelEvent::PostgresChanges) => {
            let payload = match serde_json::from_value::<PostgresChangesPayload>(message.payload) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Malformed postgres_changes payload on {}: {}", message.topic, e);
                    return;
                }
            };
            let channels_guard = channels.read().await;
            match channels_guard.get(&message.topic) {
                Some(sender) => {
                    if sender.send(payload.data).is_err() {
                        debug!("Subscriber for {} is gone", message.topic);
                    }
                }
                None => warn!("Change for unknown topic {}", message.topic),
            }
        }
        Some(ChannelEvent::Error) => {
            error!("Channel {} reported an error: {}", message.topic, message.payload);
        }
        Some(ChannelEvent::Close) => {
            info!("Channel {} closed by server", message.topic);
            channels.write().await.remove(&message.topic);
        }
        Some(ChannelEvent::System) => debug!("System message on {}: {}", message.topic, message.payload),
        Some(other) => trace!("Ignoring {} on {}", other, message.topic),
        None => trace!("Unhandled event '{}' on {}", message.event, message.topic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_maps_https_to_wss() {
        let client = RealtimeClient::new("https://project.supabase.co/", "anon");
        let url = client.websocket_url().unwrap();
        assert_eq!(
            url.as_str(),
            "wss://project.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn websocket_url_rejects_unknown_scheme() {
        let client = RealtimeClient::new("ftp://project.supabase.co", "anon");
        assert!(matches!(
            client.websocket_url(),
            Err(RealtimeError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn routes_reply_to_waiting_join() {
        let client = RealtimeClient::new("http://localhost:4000", "anon");
        let rx = client.register_reply("7").await;

        let reply = RealtimeMessage {
            topic: "realtime:bookmarks".to_string(),
            event: "phx_reply".to_string(),
            payload: json!({ "status": "ok", "response": {} }),
            message_ref: Some("7".to_string()),
        };
        route_message(reply, &client.channels, &client.pending_replies).await;

        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn routes_changes_by_topic() {
        let client = RealtimeClient::new("http://localhost:4000", "anon");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .channels
            .write()
            .await
            .insert("realtime:bookmarks".to_string(), tx);

        let change = RealtimeMessage {
            topic: "realtime:bookmarks".to_string(),
            event: "postgres_changes".to_string(),
            payload: json!({
                "ids": [1],
                "data": {
                    "schema": "public",
                    "table": "bookmarks",
                    "type": "DELETE",
                    "old_record": { "id": "b1" }
                }
            }),
            message_ref: None,
        };
        route_message(change, &client.channels, &client.pending_replies).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.old_record["id"], "b1");
    }

    #[tokio::test]
    async fn server_close_drops_channel() {
        let client = RealtimeClient::new("http://localhost:4000", "anon");
        let (tx, mut rx) = mpsc::unbounded_channel();
        client
            .channels
            .write()
            .await
            .insert("realtime:bookmarks".to_string(), tx);

        let close = RealtimeMessage::new("realtime:bookmarks", ChannelEvent::Close, json!({}), None);
        route_message(close, &client.channels, &client.pending_replies).await;

        assert_eq!(client.channel_count().await, 0);
        assert!(rx.recv().await.is_none());
    }
}
