//! Message bus: the boundary between transports and the scheduler.
//!
//! Transports publish [`InboundMessage`]s and drain [`OutboundMessage`]s; the
//! scheduler is the only inbound consumer. Async tool completions re-enter
//! through the same inbound queue (`channel = "system"`) so that per-session
//! processing stays serialized.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};

use crate::routing::Peer;

/// Channels the scheduler considers internal: they never receive status
/// notices, compression warnings, or sub-agent result forwards.
pub const INTERNAL_CHANNELS: &[&str] = &["cli", "system", "subagent", "heartbeat"];

pub fn is_internal_channel(channel: &str) -> bool {
    INTERNAL_CHANNELS.contains(&channel)
}

#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub channel: String,
    pub sender_id: String,
    pub chat_id: String,
    pub content: String,
    /// Explicit session key; `agent:`-prefixed keys re-select the agent.
    pub session_key: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    pub fn new(channel: &str, sender_id: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            sender_id: sender_id.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            session_key: None,
            metadata: HashMap::new(),
        }
    }

    fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    /// Account the message arrived on; `"*"` when the transport did not say.
    pub fn account_id(&self) -> &str {
        self.meta("account_id").unwrap_or("*")
    }

    /// The conversational peer. An empty peer id defaults to the sender for
    /// direct chats and to the chat id otherwise.
    pub fn peer(&self) -> Peer {
        let kind = self.meta("peer_kind").unwrap_or("direct");
        let id = match self.meta("peer_id") {
            Some(id) => id.to_string(),
            None if kind == "direct" => self.sender_id.clone(),
            None => self.chat_id.clone(),
        };
        Peer {
            kind: kind.to_string(),
            id,
        }
    }

    /// The reply-to peer, when the transport reported one.
    pub fn parent_peer(&self) -> Option<Peer> {
        let id = self.meta("parent_peer_id")?;
        Some(Peer {
            kind: self.meta("parent_peer_kind").unwrap_or("direct").to_string(),
            id: id.to_string(),
        })
    }

    pub fn guild_id(&self) -> Option<&str> {
        self.meta("guild_id")
    }

    pub fn team_id(&self) -> Option<&str> {
        self.meta("team_id")
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    pub fn new(channel: &str, chat_id: &str, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// An ephemeral progress notice a transport may render transiently.
    pub fn status_update(channel: &str, chat_id: &str, content: &str) -> Self {
        let mut msg = Self::new(channel, chat_id, content);
        msg.metadata
            .insert("status_update".to_string(), "true".to_string());
        msg
    }

    pub fn is_status_update(&self) -> bool {
        self.metadata.get("status_update").map(|v| v == "true") == Some(true)
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<()>;

    /// Next inbound message; `None` when the bus is closed.
    async fn consume_inbound(&self) -> Option<InboundMessage>;

    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()>;

    /// Next outbound message; `None` when the bus is closed.
    async fn consume_outbound(&self) -> Option<OutboundMessage>;
}

/// Bounded in-process bus backed by two mpsc queues.
pub struct InMemoryBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<()> {
        self.inbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("Inbound queue closed"))
    }

    async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn publish_outbound(&self, msg: OutboundMessage) -> Result<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("Outbound queue closed"))
    }

    async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}
