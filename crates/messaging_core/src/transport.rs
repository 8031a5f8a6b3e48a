//! Reference backend for the campus API: REST for queries and durable
//! writes, one multiplexed websocket for change-feed pushes and presence.
//!
//! The socket is driven by a single task owning the connection and the
//! topic routing tables; everything else talks to it through commands.
//! Routing tables are updated before the matching frame goes out, so a
//! reconnect can rebuild the server-side state from the tables alone.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::UserId,
    error::ApiError,
    protocol::{ConnectionRecord, MessageRecord, NewMessage, Peer, PresenceRecord},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    AttachmentUpload, BlobStore, ChangeFeed, ConnectionGraph, FeedEvent, FeedFilter,
    FeedSubscription, MessageStore, PresenceConnector, PresenceSession, SubscriptionGuard,
    FEED_CHANNEL_CAPACITY,
};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const PRESENCE_SNAPSHOT_CAPACITY: usize = 16;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// REST-side collaborators: connection graph, message store, blob store.
pub struct RestBackend {
    http: reqwest::Client,
    base_url: String,
}

impl RestBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

/// Raises the API's typed error envelope when the body carries one.
async fn checked(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(err) => Err(anyhow::Error::new(err)),
        Err(_) => Err(anyhow!("campus api returned {status}")),
    }
}

#[async_trait]
impl ConnectionGraph for RestBackend {
    async fn accepted_connections_for(&self, user: UserId) -> Result<Vec<ConnectionRecord>> {
        let response = self
            .http
            .get(format!("{}/connections", self.base_url))
            .query(&[
                ("user_id", user.0.to_string()),
                ("status", "accepted".to_string()),
            ])
            .send()
            .await
            .context("connection query failed")?;
        checked(response)
            .await?
            .json()
            .await
            .context("invalid connection list payload")
    }

    async fn profiles_by_ids(&self, ids: &[UserId]) -> Result<Vec<Peer>> {
        let ids = ids
            .iter()
            .map(|user| user.0.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .http
            .get(format!("{}/profiles", self.base_url))
            .query(&[("ids", ids)])
            .send()
            .await
            .context("profile query failed")?;
        checked(response)
            .await?
            .json()
            .await
            .context("invalid profile list payload")
    }
}

#[async_trait]
impl MessageStore for RestBackend {
    async fn conversation_between(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>> {
        let response = self
            .http
            .get(format!("{}/messages", self.base_url))
            .query(&[("user_a", a.0.to_string()), ("user_b", b.0.to_string())])
            .send()
            .await
            .context("conversation query failed")?;
        checked(response)
            .await?
            .json()
            .await
            .context("invalid message list payload")
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .json(&message)
            .send()
            .await
            .context("message insert failed")?;
        checked(response)
            .await?
            .json()
            .await
            .context("invalid inserted message payload")
    }

    async fn mark_read(&self, reader: UserId, sender: UserId) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/messages/read", self.base_url))
            .query(&[
                ("reader_id", reader.0.to_string()),
                ("sender_id", sender.0.to_string()),
            ])
            .send()
            .await
            .context("mark-read request failed")?;
        checked(response).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileUploadResponse {
    url: String,
}

#[async_trait]
impl BlobStore for RestBackend {
    async fn upload(&self, upload: AttachmentUpload) -> Result<String> {
        let mut request = self
            .http
            .post(format!("{}/files/upload", self.base_url))
            .query(&[("filename", upload.filename.clone())]);
        if let Some(mime_type) = upload.mime_type.clone() {
            request = request.query(&[("mime_type", mime_type)]);
        }
        let response = request
            .body(upload.bytes)
            .send()
            .await
            .context("attachment upload failed")?;
        let body: FileUploadResponse = checked(response)
            .await?
            .json()
            .await
            .context("invalid upload response payload")?;
        Ok(body.url)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    PresenceJoin { channel: String },
    PresenceLeave { channel: String },
    PresenceTrack { channel: String, record: PresenceRecord },
    PresenceUntrack { channel: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
enum ServerFrame {
    Insert { topic: String, row: Value },
    PresenceState {
        channel: String,
        records: Vec<PresenceRecord>,
    },
}

enum SocketCommand {
    Subscribe {
        topic: String,
        sender: mpsc::Sender<FeedEvent>,
    },
    Unsubscribe {
        topic: String,
    },
    PresenceJoin {
        channel: String,
        sender: broadcast::Sender<Vec<PresenceRecord>>,
    },
    PresenceLeave {
        channel: String,
    },
    PresenceTrack {
        channel: String,
        record: PresenceRecord,
    },
    PresenceUntrack {
        channel: String,
    },
}

/// Change feed + presence over one realtime socket.
pub struct SocketBackend {
    commands: mpsc::Sender<SocketCommand>,
}

impl SocketBackend {
    /// Connects the realtime socket for the given API base URL and spawns
    /// the driver task. The driver lives until the backend is dropped.
    pub async fn connect(base_url: &str) -> Result<Self> {
        let url = realtime_url(base_url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect realtime socket: {url}"))?;
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tokio::spawn(run_driver(url, stream, command_rx));
        Ok(Self { commands })
    }
}

#[async_trait]
impl ChangeFeed for SocketBackend {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription> {
        let topic = topic_for(&filter);
        let (sender, receiver) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        self.commands
            .send(SocketCommand::Subscribe {
                topic: topic.clone(),
                sender,
            })
            .await
            .map_err(|_| anyhow!("realtime socket closed"))?;
        let commands = self.commands.clone();
        let guard = SubscriptionGuard::new(move || {
            let unsubscribe = SocketCommand::Unsubscribe {
                topic: topic.clone(),
            };
            if commands.try_send(unsubscribe).is_err() {
                warn!(topic = %topic, "unsubscribe not delivered; socket closed or backlogged");
            }
        });
        Ok(FeedSubscription::new(receiver, guard))
    }
}

pub struct SocketPresenceSession {
    channel: String,
    commands: mpsc::Sender<SocketCommand>,
    snapshots: broadcast::Sender<Vec<PresenceRecord>>,
}

#[async_trait]
impl PresenceConnector for SocketBackend {
    async fn join(&self, channel: &str) -> Result<Arc<dyn PresenceSession>> {
        let (snapshots, _) = broadcast::channel(PRESENCE_SNAPSHOT_CAPACITY);
        self.commands
            .send(SocketCommand::PresenceJoin {
                channel: channel.to_string(),
                sender: snapshots.clone(),
            })
            .await
            .map_err(|_| anyhow!("realtime socket closed"))?;
        Ok(Arc::new(SocketPresenceSession {
            channel: channel.to_string(),
            commands: self.commands.clone(),
            snapshots,
        }))
    }
}

#[async_trait]
impl PresenceSession for SocketPresenceSession {
    async fn track(&self, record: PresenceRecord) -> Result<()> {
        self.commands
            .send(SocketCommand::PresenceTrack {
                channel: self.channel.clone(),
                record,
            })
            .await
            .map_err(|_| anyhow!("realtime socket closed"))
    }

    async fn untrack(&self) -> Result<()> {
        self.commands
            .send(SocketCommand::PresenceUntrack {
                channel: self.channel.clone(),
            })
            .await
            .map_err(|_| anyhow!("realtime socket closed"))
    }

    async fn leave(&self) -> Result<()> {
        self.commands
            .send(SocketCommand::PresenceLeave {
                channel: self.channel.clone(),
            })
            .await
            .map_err(|_| anyhow!("realtime socket closed"))
    }

    fn subscribe_snapshots(&self) -> broadcast::Receiver<Vec<PresenceRecord>> {
        self.snapshots.subscribe()
    }
}

#[derive(Default)]
struct DriverState {
    feeds: HashMap<String, mpsc::Sender<FeedEvent>>,
    presence: HashMap<String, broadcast::Sender<Vec<PresenceRecord>>>,
    tracked: HashMap<String, PresenceRecord>,
}

impl DriverState {
    /// Updates the routing tables and returns the frame to put on the
    /// wire. Tables change first: a lost frame is repaired by the next
    /// reconnect resync, which replays them.
    fn apply_command(&mut self, command: SocketCommand) -> ClientFrame {
        match command {
            SocketCommand::Subscribe { topic, sender } => {
                self.feeds.insert(topic.clone(), sender);
                ClientFrame::Subscribe { topic }
            }
            SocketCommand::Unsubscribe { topic } => {
                self.feeds.remove(&topic);
                ClientFrame::Unsubscribe { topic }
            }
            SocketCommand::PresenceJoin { channel, sender } => {
                self.presence.insert(channel.clone(), sender);
                ClientFrame::PresenceJoin { channel }
            }
            SocketCommand::PresenceLeave { channel } => {
                self.presence.remove(&channel);
                self.tracked.remove(&channel);
                ClientFrame::PresenceLeave { channel }
            }
            SocketCommand::PresenceTrack { channel, record } => {
                self.tracked.insert(channel.clone(), record.clone());
                ClientFrame::PresenceTrack { channel, record }
            }
            SocketCommand::PresenceUntrack { channel } => {
                self.tracked.remove(&channel);
                ClientFrame::PresenceUntrack { channel }
            }
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("unrecognized realtime frame: {err}");
                return;
            }
        };
        match frame {
            ServerFrame::Insert { topic, row } => {
                let Some(sender) = self.feeds.get(&topic).cloned() else {
                    return;
                };
                if sender.send(FeedEvent::Insert(row)).await.is_err() {
                    self.feeds.remove(&topic);
                }
            }
            ServerFrame::PresenceState { channel, records } => {
                if let Some(sender) = self.presence.get(&channel) {
                    let _ = sender.send(records);
                }
            }
        }
    }

    async fn notify_lapsed(&mut self) {
        let mut dead = Vec::new();
        for (topic, sender) in &self.feeds {
            if sender.send(FeedEvent::Lapsed).await.is_err() {
                dead.push(topic.clone());
            }
        }
        for topic in dead {
            self.feeds.remove(&topic);
        }
    }
}

async fn run_driver(
    url: Url,
    mut stream: WsStream,
    mut commands: mpsc::Receiver<SocketCommand>,
) {
    let mut state = DriverState::default();
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let frame = state.apply_command(command);
                if !send_frame(&mut stream, &frame).await {
                    match reestablish(&url, &mut state, &mut commands).await {
                        Some(next) => stream = next,
                        None => break,
                    }
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => state.dispatch(&text).await,
                Some(Ok(WsMessage::Close(_))) | None => {
                    match reestablish(&url, &mut state, &mut commands).await {
                        Some(next) => stream = next,
                        None => break,
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("realtime socket receive failed: {err}");
                    match reestablish(&url, &mut state, &mut commands).await {
                        Some(next) => stream = next,
                        None => break,
                    }
                }
            }
        }
    }
}

async fn send_frame(stream: &mut WsStream, frame: &ClientFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!("failed to encode realtime frame: {err}");
            return true;
        }
    };
    match stream.send(WsMessage::Text(text)).await {
        Ok(()) => true,
        Err(err) => {
            warn!("realtime socket send failed: {err}");
            false
        }
    }
}

/// Reconnects until it succeeds (or every command sender is gone), then
/// replays subscriptions and presence from the routing tables. Feeds that
/// were live across the gap get a `Lapsed` marker: the server does not
/// replay rows pushed while the socket was down.
async fn reestablish(
    url: &Url,
    state: &mut DriverState,
    commands: &mut mpsc::Receiver<SocketCommand>,
) -> Option<WsStream> {
    let mut attempt: u32 = 0;
    loop {
        loop {
            match commands.try_recv() {
                // Frames for queued commands are covered by the resync.
                Ok(command) => {
                    let _ = state.apply_command(command);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
            }
        }

        attempt += 1;
        tokio::time::sleep(RECONNECT_DELAY).await;
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                if resync(&mut stream, state).await {
                    info!(attempt, "realtime socket reconnected");
                    state.notify_lapsed().await;
                    return Some(stream);
                }
            }
            Err(err) => {
                warn!(attempt, "realtime reconnect failed: {err}");
            }
        }
    }
}

async fn resync(stream: &mut WsStream, state: &DriverState) -> bool {
    for topic in state.feeds.keys() {
        let frame = ClientFrame::Subscribe {
            topic: topic.clone(),
        };
        if !send_frame(stream, &frame).await {
            return false;
        }
    }
    for channel in state.presence.keys() {
        let frame = ClientFrame::PresenceJoin {
            channel: channel.clone(),
        };
        if !send_frame(stream, &frame).await {
            return false;
        }
    }
    for (channel, record) in &state.tracked {
        let frame = ClientFrame::PresenceTrack {
            channel: channel.clone(),
            record: record.clone(),
        };
        if !send_frame(stream, &frame).await {
            return false;
        }
    }
    true
}

fn topic_for(filter: &FeedFilter) -> String {
    match filter {
        FeedFilter::Pair(a, b) => {
            // Canonical ordering so both ends of a conversation land on
            // the same topic.
            let (lo, hi) = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
            format!("messages:pair:{lo}:{hi}")
        }
        FeedFilter::Inbox(user) => format!("messages:inbox:{}", user.0),
    }
}

fn realtime_url(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).context("invalid base url")?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(anyhow!("unsupported base url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to switch base url to websocket scheme"))?;
    url.set_path("/realtime");
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_topics_are_direction_agnostic() {
        let forward = topic_for(&FeedFilter::Pair(UserId(7), UserId(42)));
        let reverse = topic_for(&FeedFilter::Pair(UserId(42), UserId(7)));
        assert_eq!(forward, reverse);
        assert_eq!(forward, "messages:pair:7:42");
    }

    #[test]
    fn inbox_topics_are_per_user() {
        assert_eq!(
            topic_for(&FeedFilter::Inbox(UserId(9))),
            "messages:inbox:9"
        );
    }

    #[test]
    fn realtime_url_switches_scheme_and_path() {
        let url = realtime_url("http://127.0.0.1:8080/api/").expect("url");
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/realtime");
        let url = realtime_url("https://campus.example.edu").expect("url");
        assert_eq!(url.as_str(), "wss://campus.example.edu/realtime");
    }

    #[test]
    fn realtime_url_rejects_non_http_schemes() {
        assert!(realtime_url("ftp://campus.example.edu").is_err());
    }
}
