use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use shared::{
    domain::{MessageId, UserId},
    protocol::{ConnectionRecord, MessageRecord, NewMessage, Peer, PresenceRecord},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

pub mod cache;
pub mod directory;
pub mod error;
pub mod presence;
pub mod quote;
pub mod transport;
pub mod unread;

pub use cache::{ConversationCache, Message, ReconcileOutcome};
pub use error::{DirectoryError, SendError};
pub use presence::PresenceTracker;
pub use unread::UnreadLedger;

const EVENT_CHANNEL_CAPACITY: usize = 1024;
pub const FEED_CHANNEL_CAPACITY: usize = 256;
const PRESENCE_CHANNEL: &str = "campus:messaging:presence";

/// Scope of a change-feed subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFilter {
    /// Rows exchanged between the two users, either direction.
    Pair(UserId, UserId),
    /// Any row addressed to the user, regardless of sender.
    Inbox(UserId),
}

/// One delivery from a change-feed subscription. Rows arrive loosely
/// typed; the ingestor adapts them at a single boundary.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Insert(Value),
    /// The underlying subscription dropped and was re-established. Rows
    /// pushed in between are lost; the conversation is stale until the
    /// next explicit load.
    Lapsed,
}

/// Closes the subscription on drop. The close side effect must fire
/// before a replacement subscription opens, so the guard is held by the
/// conversation state and dropped during teardown, not parked in a task.
pub struct SubscriptionGuard {
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionGuard {
    pub fn new(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_close: Some(Box::new(on_close)),
        }
    }

    pub fn noop() -> Self {
        Self { on_close: None }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(close) = self.on_close.take() {
            close();
        }
    }
}

pub struct FeedSubscription {
    pub events: mpsc::Receiver<FeedEvent>,
    pub guard: SubscriptionGuard,
}

impl FeedSubscription {
    pub fn new(events: mpsc::Receiver<FeedEvent>, guard: SubscriptionGuard) -> Self {
        Self { events, guard }
    }
}

/// Attachment bytes handed to the blob store before a send.
#[derive(Debug, Clone)]
pub struct AttachmentUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ConnectionGraph: Send + Sync {
    /// Accepted bidirectional connections involving `user`.
    async fn accepted_connections_for(&self, user: UserId) -> Result<Vec<ConnectionRecord>>;
    /// Directory metadata for the given users, in any order.
    async fn profiles_by_ids(&self, ids: &[UserId]) -> Result<Vec<Peer>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Messages exchanged between the two users, ascending by creation
    /// time. A point-in-time snapshot; staleness afterwards is expected.
    async fn conversation_between(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>>;
    /// The durable write. The store assigns the id and authoritative
    /// timestamp and echoes the correlation token.
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRecord>;
    /// Stamps `read_at` on `sender`'s messages addressed to `reader`.
    async fn mark_read(&self, reader: UserId, sender: UserId) -> Result<()>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Opens a push subscription for newly inserted rows matching
    /// `filter`. Delivery is at-least-once and not necessarily in order.
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription>;
}

#[async_trait]
pub trait PresenceSession: Send + Sync {
    async fn track(&self, record: PresenceRecord) -> Result<()>;
    async fn untrack(&self) -> Result<()>;
    async fn leave(&self) -> Result<()>;
    fn subscribe_snapshots(&self) -> broadcast::Receiver<Vec<PresenceRecord>>;
}

#[async_trait]
pub trait PresenceConnector: Send + Sync {
    async fn join(&self, channel: &str) -> Result<Arc<dyn PresenceSession>>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Uploads the bytes and returns a durable URL.
    async fn upload(&self, upload: AttachmentUpload) -> Result<String>;
}

pub struct MissingConnectionGraph;

#[async_trait]
impl ConnectionGraph for MissingConnectionGraph {
    async fn accepted_connections_for(&self, user: UserId) -> Result<Vec<ConnectionRecord>> {
        Err(anyhow!("connection graph unavailable for user {}", user.0))
    }

    async fn profiles_by_ids(&self, _ids: &[UserId]) -> Result<Vec<Peer>> {
        Err(anyhow!("connection graph unavailable"))
    }
}

pub struct MissingMessageStore;

#[async_trait]
impl MessageStore for MissingMessageStore {
    async fn conversation_between(&self, a: UserId, b: UserId) -> Result<Vec<MessageRecord>> {
        Err(anyhow!(
            "message store unavailable for users {} and {}",
            a.0,
            b.0
        ))
    }

    async fn insert_message(&self, _message: NewMessage) -> Result<MessageRecord> {
        Err(anyhow!("message store unavailable"))
    }

    async fn mark_read(&self, _reader: UserId, _sender: UserId) -> Result<()> {
        Err(anyhow!("message store unavailable"))
    }
}

pub struct MissingChangeFeed;

#[async_trait]
impl ChangeFeed for MissingChangeFeed {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription> {
        Err(anyhow!("change feed unavailable for filter {filter:?}"))
    }
}

pub struct MissingPresenceConnector;

#[async_trait]
impl PresenceConnector for MissingPresenceConnector {
    async fn join(&self, channel: &str) -> Result<Arc<dyn PresenceSession>> {
        Err(anyhow!("presence channel {channel} unavailable"))
    }
}

pub struct MissingBlobStore;

#[async_trait]
impl BlobStore for MissingBlobStore {
    async fn upload(&self, upload: AttachmentUpload) -> Result<String> {
        Err(anyhow!("blob store unavailable for {}", upload.filename))
    }
}

/// Events fanned out to subscribed UI views.
#[derive(Debug, Clone)]
pub enum MessagingEvent {
    ConversationOpened { peer_id: UserId },
    /// The history snapshot for the open conversation finished merging.
    ConversationRefreshed { peer_id: UserId },
    /// A message appeared or was promoted in the open conversation.
    MessageUpserted { peer_id: UserId, message: Message },
    /// A provisional message was rolled back after a failed write.
    MessageRetracted { peer_id: UserId, provisional_id: Uuid },
    UnreadChanged { peer_id: UserId, count: u32 },
    PresenceUpdated { online: Vec<UserId> },
    /// The scoped feed lapsed; the conversation may be missing rows until
    /// it is reloaded.
    ConversationStale { peer_id: UserId },
    Error(String),
}

/// A compose action: plain text, optionally replying to a quoted message,
/// optionally carrying one attachment.
#[derive(Debug, Clone, Default)]
pub struct MessageDraft {
    pub body: String,
    pub quoted: Option<String>,
    pub attachment: Option<AttachmentUpload>,
}

impl MessageDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn reply(quoted: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            quoted: Some(quoted.into()),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachment = Some(attachment);
        self
    }
}

struct ActiveConversation {
    peer_id: UserId,
    cache: ConversationCache,
    /// Absent only for the instant between installing the conversation
    /// and spawning its feed reader; events buffer in the channel.
    feed_task: Option<JoinHandle<()>>,
    sub_guard: SubscriptionGuard,
    epoch: u64,
}

struct InboxSubscription {
    task: JoinHandle<()>,
    guard: SubscriptionGuard,
}

struct PresenceLink {
    session: Arc<dyn PresenceSession>,
    task: JoinHandle<()>,
}

struct ClientState {
    /// Bumped on every conversation switch; stale async completions
    /// compare against it and discard themselves.
    epoch: u64,
    active: Option<ActiveConversation>,
    unread: UnreadLedger,
    inbox: Option<InboxSubscription>,
    presence_link: Option<PresenceLink>,
}

/// Session-scoped messaging context. One instance per authenticated
/// session owns the stream cache, the unread ledger and the subscription
/// lifecycle; UI views hold the `Arc` and subscribe to events.
pub struct MessagingClient {
    local_user: UserId,
    graph: Arc<dyn ConnectionGraph>,
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn ChangeFeed>,
    presence_connector: Arc<dyn PresenceConnector>,
    blobs: Arc<dyn BlobStore>,
    inner: Mutex<ClientState>,
    presence_tracker: PresenceTracker,
    events: broadcast::Sender<MessagingEvent>,
}

impl MessagingClient {
    pub fn new(local_user: UserId) -> Arc<Self> {
        Self::new_with_collaborators(
            local_user,
            Arc::new(MissingConnectionGraph),
            Arc::new(MissingMessageStore),
            Arc::new(MissingChangeFeed),
            Arc::new(MissingPresenceConnector),
            Arc::new(MissingBlobStore),
        )
    }

    pub fn new_with_collaborators(
        local_user: UserId,
        graph: Arc<dyn ConnectionGraph>,
        store: Arc<dyn MessageStore>,
        feed: Arc<dyn ChangeFeed>,
        presence_connector: Arc<dyn PresenceConnector>,
        blobs: Arc<dyn BlobStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            local_user,
            graph,
            store,
            feed,
            presence_connector,
            blobs,
            inner: Mutex::new(ClientState {
                epoch: 0,
                active: None,
                unread: UnreadLedger::new(),
                inbox: None,
                presence_link: None,
            }),
            presence_tracker: PresenceTracker::new(),
            events,
        })
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MessagingEvent> {
        self.events.subscribe()
    }

    /// Enters the messaging view: opens the session-wide inbox
    /// subscription feeding the unread ledger and joins the presence
    /// channel, announcing the local user.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await;

        let FeedSubscription { events, guard } = self
            .feed
            .subscribe(FeedFilter::Inbox(self.local_user))
            .await
            .context("failed to subscribe to the inbox feed")?;
        let inbox_task = self.spawn_inbox_task(events);

        let session = match self.presence_connector.join(PRESENCE_CHANNEL).await {
            Ok(session) => session,
            Err(err) => {
                inbox_task.abort();
                return Err(err).context("failed to join the presence channel");
            }
        };
        if let Err(err) = session
            .track(PresenceRecord {
                user_id: self.local_user,
                joined_at: Utc::now(),
            })
            .await
        {
            inbox_task.abort();
            let _ = session.leave().await;
            return Err(err).context("failed to announce presence");
        }
        let presence_task = self.spawn_presence_task(session.subscribe_snapshots());

        let mut state = self.inner.lock().await;
        state.inbox = Some(InboxSubscription {
            task: inbox_task,
            guard,
        });
        state.presence_link = Some(PresenceLink {
            session,
            task: presence_task,
        });
        info!(user_id = self.local_user.0, "messaging session connected");
        Ok(())
    }

    /// Leaves the messaging view: withdraws presence, closes every
    /// subscription and drops the open conversation.
    pub async fn disconnect(&self) {
        let (active, inbox, link) = {
            let mut state = self.inner.lock().await;
            state.epoch += 1;
            state.unread.set_active(None);
            (
                state.active.take(),
                state.inbox.take(),
                state.presence_link.take(),
            )
        };

        if let Some(active) = active {
            teardown_conversation(active);
        }
        if let Some(inbox) = inbox {
            inbox.task.abort();
            drop(inbox.guard);
        }
        if let Some(link) = link {
            link.task.abort();
            // Withdraw before leaving; a failed withdraw leaves a stale
            // entry until the channel's own timeout expires it.
            if let Err(err) = link.session.untrack().await {
                warn!(user_id = self.local_user.0, "presence withdraw failed: {err}");
            }
            if let Err(err) = link.session.leave().await {
                warn!(user_id = self.local_user.0, "presence channel leave failed: {err}");
            }
            self.presence_tracker.clear().await;
        }
    }

    /// Opens `peer_id`'s conversation: swaps the scoped subscription,
    /// loads the history snapshot and zeroes the unread counter. Returns
    /// the merged message list.
    pub async fn open_conversation(self: &Arc<Self>, peer_id: UserId) -> Result<Vec<Message>> {
        let (epoch, carried_cache) = {
            let mut state = self.inner.lock().await;
            state.epoch += 1;
            // Reopening the current peer keeps its cache (a failed reload
            // must not wipe what is already on screen); switching peers
            // drops the old conversation entirely.
            let carried_cache = match state.active.take() {
                Some(prev) if prev.peer_id == peer_id => {
                    let ActiveConversation {
                        cache,
                        feed_task,
                        sub_guard,
                        ..
                    } = prev;
                    if let Some(task) = feed_task {
                        task.abort();
                    }
                    drop(sub_guard);
                    Some(cache)
                }
                Some(prev) => {
                    teardown_conversation(prev);
                    None
                }
                None => None,
            };
            state.unread.set_active(Some(peer_id));
            (state.epoch, carried_cache)
        };
        let _ = self
            .events
            .send(MessagingEvent::UnreadChanged { peer_id, count: 0 });

        // The scoped subscription opens before the snapshot is taken so a
        // row inserted in between is seen by at least one of the two.
        let FeedSubscription { events, guard } = self
            .feed
            .subscribe(FeedFilter::Pair(self.local_user, peer_id))
            .await
            .context("failed to subscribe to the conversation feed")?;
        {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                drop(guard);
                return Err(anyhow!(
                    "conversation changed while opening peer {}",
                    peer_id.0
                ));
            }
            state.active = Some(ActiveConversation {
                peer_id,
                cache: carried_cache.unwrap_or_else(|| ConversationCache::new(peer_id)),
                feed_task: None,
                sub_guard: guard,
                epoch,
            });
        }
        let feed_task = self.spawn_conversation_task(peer_id, epoch, events);
        {
            let mut state = self.inner.lock().await;
            match state.active.as_mut() {
                Some(active) if active.epoch == epoch => active.feed_task = Some(feed_task),
                _ => {
                    feed_task.abort();
                    return Err(anyhow!(
                        "conversation changed while opening peer {}",
                        peer_id.0
                    ));
                }
            }
        }
        let _ = self
            .events
            .send(MessagingEvent::ConversationOpened { peer_id });

        let history = self
            .store
            .conversation_between(self.local_user, peer_id)
            .await
            .context("failed to load conversation history")?;

        let messages = {
            let mut state = self.inner.lock().await;
            if state.epoch != epoch {
                // Late snapshot for an abandoned conversation; it must not
                // touch whatever is active now.
                return Err(anyhow!(
                    "conversation changed while loading peer {}",
                    peer_id.0
                ));
            }
            let Some(active) = state.active.as_mut() else {
                return Err(anyhow!(
                    "conversation closed while loading peer {}",
                    peer_id.0
                ));
            };
            active.cache.merge_history(history);
            let messages = active.cache.messages().to_vec();
            // Events may have raced the load; clear again now that the
            // pane is fully populated.
            state.unread.clear(peer_id);
            messages
        };
        let _ = self
            .events
            .send(MessagingEvent::UnreadChanged { peer_id, count: 0 });
        let _ = self
            .events
            .send(MessagingEvent::ConversationRefreshed { peer_id });

        if let Err(err) = self.store.mark_read(self.local_user, peer_id).await {
            warn!(peer_id = peer_id.0, "failed to mark conversation read: {err}");
        }

        Ok(messages)
    }

    /// Tears down the open conversation and its scoped subscription.
    pub async fn close_conversation(&self) {
        let prev = {
            let mut state = self.inner.lock().await;
            state.epoch += 1;
            state.unread.set_active(None);
            state.active.take()
        };
        if let Some(prev) = prev {
            info!(peer_id = prev.peer_id.0, "conversation closed");
            teardown_conversation(prev);
        }
    }

    /// Optimistic send: the provisional entry is visible before the
    /// durable write is attempted, promoted by the echo on success, and
    /// rolled back on failure. Exactly one write attempt; retrying is the
    /// user's call.
    pub async fn send_message(&self, draft: MessageDraft) -> Result<Message, SendError> {
        let peer_id = {
            let state = self.inner.lock().await;
            match state.active.as_ref() {
                Some(active) => active.peer_id,
                None => return Err(SendError::NoActiveConversation),
            }
        };

        // Upload first: a failed upload aborts the send before any
        // message object exists.
        let image_url = match draft.attachment {
            Some(upload) => Some(
                self.blobs
                    .upload(upload)
                    .await
                    .map_err(|source| SendError::Upload { source })?,
            ),
            None => None,
        };

        let content = match draft.quoted.as_deref() {
            Some(quoted) => quote::encode(quoted, &draft.body),
            None => draft.body,
        };

        let client_ref = Uuid::new_v4();
        let provisional_id = Uuid::new_v4();
        let provisional = Message {
            id: MessageId::Provisional(provisional_id),
            sender_id: self.local_user,
            recipient_id: peer_id,
            content: content.clone(),
            image_url: image_url.clone(),
            client_ref: Some(client_ref),
            created_at: Utc::now(),
            read_at: None,
        };

        {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active.as_mut() else {
                return Err(SendError::NoActiveConversation);
            };
            if active.peer_id != peer_id {
                return Err(SendError::NoActiveConversation);
            }
            active.cache.insert_provisional(provisional.clone());
        }
        let _ = self.events.send(MessagingEvent::MessageUpserted {
            peer_id,
            message: provisional.clone(),
        });

        let write = NewMessage {
            sender_id: self.local_user,
            recipient_id: peer_id,
            content,
            image_url,
            client_ref,
        };
        match self.store.insert_message(write).await {
            Ok(record) => {
                let confirmed = Message::from_record(record.clone());
                // The write acknowledgment races the feed echo; reconcile
                // absorbs whichever lands second.
                self.reconcile_into_active(peer_id, None, record).await;
                Ok(confirmed)
            }
            Err(source) => {
                let rolled_back = {
                    let mut state = self.inner.lock().await;
                    match state.active.as_mut() {
                        Some(active) if active.peer_id == peer_id => {
                            active.cache.rollback(provisional_id)
                        }
                        _ => false,
                    }
                };
                if rolled_back {
                    let _ = self.events.send(MessagingEvent::MessageRetracted {
                        peer_id,
                        provisional_id,
                    });
                }
                warn!(
                    peer_id = peer_id.0,
                    "durable write failed; provisional entry rolled back: {source}"
                );
                Err(SendError::Write { source })
            }
        }
    }

    /// Messageable peers from the accepted-connection graph.
    pub async fn list_peers(&self) -> Result<Vec<Peer>, DirectoryError> {
        directory::list_peers(self.graph.as_ref(), self.local_user).await
    }

    pub async fn active_conversation(&self) -> Option<UserId> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.peer_id)
    }

    /// Current message list of the open conversation, if any.
    pub async fn conversation_messages(&self) -> Option<Vec<Message>> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|active| active.cache.messages().to_vec())
    }

    pub async fn unread_counts(&self) -> HashMap<UserId, u32> {
        self.inner.lock().await.unread.snapshot()
    }

    pub async fn unread_count(&self, peer: UserId) -> u32 {
        self.inner.lock().await.unread.count(peer)
    }

    pub async fn online_peers(&self) -> HashSet<UserId> {
        self.presence_tracker.snapshot().await
    }

    pub async fn is_online(&self, peer: UserId) -> bool {
        self.presence_tracker.is_online(peer).await
    }

    fn spawn_conversation_task(
        self: &Arc<Self>,
        peer_id: UserId,
        epoch: u64,
        mut events: mpsc::Receiver<FeedEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    FeedEvent::Insert(row) => match parse_feed_row(row) {
                        Ok(record) => {
                            client
                                .reconcile_into_active(peer_id, Some(epoch), record)
                                .await;
                        }
                        Err(err) => {
                            let _ = client.events.send(MessagingEvent::Error(format!(
                                "discarded malformed feed event: {err}"
                            )));
                        }
                    },
                    FeedEvent::Lapsed => {
                        warn!(
                            peer_id = peer_id.0,
                            "conversation feed lapsed; rows pushed meanwhile are missing until reload"
                        );
                        let _ = client
                            .events
                            .send(MessagingEvent::ConversationStale { peer_id });
                    }
                }
            }
        })
    }

    fn spawn_inbox_task(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<FeedEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    FeedEvent::Insert(row) => match parse_feed_row(row) {
                        Ok(record) => client.ingest_inbox_record(record).await,
                        Err(err) => {
                            let _ = client.events.send(MessagingEvent::Error(format!(
                                "discarded malformed inbox event: {err}"
                            )));
                        }
                    },
                    FeedEvent::Lapsed => {
                        warn!("inbox feed lapsed; unread counters may lag behind");
                    }
                }
            }
        })
    }

    fn spawn_presence_task(
        self: &Arc<Self>,
        mut snapshots: broadcast::Receiver<Vec<PresenceRecord>>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match snapshots.recv().await {
                    Ok(records) => {
                        let online = client.presence_tracker.apply_snapshot(&records).await;
                        let mut online: Vec<UserId> = online.into_iter().collect();
                        online.sort_by_key(|user| user.0);
                        let _ = client
                            .events
                            .send(MessagingEvent::PresenceUpdated { online });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence snapshots lagged; next snapshot resyncs in full");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Routes one confirmed record into the open conversation, if it still
    /// matches. `required_epoch` pins feed deliveries to the subscription
    /// they came from; the write-acknowledgment path passes `None` and
    /// only requires the peer to match.
    async fn reconcile_into_active(
        &self,
        peer_id: UserId,
        required_epoch: Option<u64>,
        record: MessageRecord,
    ) {
        if !involves_pair(&record, self.local_user, peer_id) {
            return;
        }
        let applied = {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active.as_mut() else {
                return;
            };
            if active.peer_id != peer_id {
                return;
            }
            if required_epoch.is_some_and(|epoch| active.epoch != epoch) {
                return;
            }
            active.cache.reconcile(record.clone()) != ReconcileOutcome::Duplicate
        };
        if applied {
            let _ = self.events.send(MessagingEvent::MessageUpserted {
                peer_id,
                message: Message::from_record(record),
            });
        }
    }

    /// Feeds the unread ledger from the session-wide inbox subscription.
    /// The ledger itself suppresses increments for the active peer.
    async fn ingest_inbox_record(&self, record: MessageRecord) {
        if record.recipient_id != self.local_user {
            return;
        }
        let sender = record.sender_id;
        let incremented = {
            let mut state = self.inner.lock().await;
            state.unread.increment(sender)
        };
        if let Some(count) = incremented {
            let _ = self.events.send(MessagingEvent::UnreadChanged {
                peer_id: sender,
                count,
            });
        }
    }
}

fn teardown_conversation(conversation: ActiveConversation) {
    if let Some(task) = conversation.feed_task {
        task.abort();
    }
    // Guard drop sends the unsubscribe before any replacement opens.
    drop(conversation.sub_guard);
}

fn involves_pair(record: &MessageRecord, local: UserId, peer: UserId) -> bool {
    (record.sender_id == local && record.recipient_id == peer)
        || (record.sender_id == peer && record.recipient_id == local)
}

/// Single adapter point where loosely-typed feed payloads become strict
/// records; nothing past this function handles dynamic shapes.
fn parse_feed_row(row: Value) -> Result<MessageRecord> {
    serde_json::from_value(row).context("change feed row does not match the message shape")
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
