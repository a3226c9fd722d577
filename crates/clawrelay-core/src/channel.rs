use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::logging::preview;
use crate::store::Store;
use crate::types::NewMessage;

/// Normalized event produced by a channel adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(NewMessage),
    /// A chat was seen; keeps names fresh for the available-groups snapshot.
    Metadata {
        jid: String,
        name: Option<String>,
        channel: String,
        timestamp: String,
    },
}

pub type InboundSender = mpsc::Sender<InboundEvent>;

/// A messaging platform connector.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving. Inbound traffic goes to `inbound` until disconnect.
    async fn connect(&self, inbound: InboundSender) -> Result<()>;

    async fn send_message(&self, jid: &str, text: &str) -> Result<()>;

    async fn set_typing(&self, _jid: &str, _typing: bool) -> Result<()> {
        Ok(())
    }

    async fn send_reaction(&self, _jid: &str, _message_id: &str, _emoji: &str) -> Result<()> {
        bail!("{} does not support reactions", self.name())
    }

    fn owns_jid(&self, jid: &str) -> bool;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<()>;
}

/// Split text into chunks of at most `max_len` bytes, preferring newline
/// then space boundaries. A character wider than `max_len` gets a chunk of
/// its own.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            limit = remaining.chars().next().map_or(remaining.len(), char::len_utf8);
        }
        let window = &remaining[..limit];
        let split = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(i) if i > 0 => i,
            _ => limit,
        };
        chunks.push(remaining[..split].to_string());
        remaining = remaining[split..].trim_start_matches(['\n', ' ']);
    }
    chunks
}

/// Routes outbound calls to whichever adapter owns a conversation id.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, channel: Arc<dyn Channel>) {
        self.channels.push(channel);
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn find(&self, jid: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns_jid(jid))
    }

    pub async fn connect_all(&self, inbound: InboundSender) -> Result<()> {
        for channel in &self.channels {
            channel.connect(inbound.clone()).await?;
            info!(channel = channel.name(), "channel connected");
        }
        Ok(())
    }

    pub async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
        let channel = self
            .find(jid)
            .ok_or_else(|| anyhow!("no channel owns {}", jid))?;
        channel.send_message(jid, text).await?;
        info!(jid, channel = channel.name(), chars = text.len(), "message sent");
        Ok(())
    }

    /// Best effort: typing failures are logged, never surfaced.
    pub async fn set_typing(&self, jid: &str, typing: bool) {
        if let Some(channel) = self.find(jid) {
            if let Err(e) = channel.set_typing(jid, typing).await {
                debug!(jid, error = %e, "failed to update typing indicator");
            }
        }
    }

    pub async fn send_reaction(&self, jid: &str, message_id: &str, emoji: &str) -> Result<()> {
        let channel = self
            .find(jid)
            .ok_or_else(|| anyhow!("no channel owns {}", jid))?;
        channel.send_reaction(jid, message_id, emoji).await
    }

    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            if let Err(e) = channel.disconnect().await {
                warn!(channel = channel.name(), error = %e, "disconnect failed");
            }
        }
    }
}

/// Persist inbound events until every sender is dropped.
pub async fn pump_inbound(store: Store, mut inbound: mpsc::Receiver<InboundEvent>) {
    while let Some(event) = inbound.recv().await {
        let result = match &event {
            InboundEvent::Message(msg) => store
                .store_chat_metadata(&msg.chat_jid, &msg.timestamp, None, None)
                .and_then(|_| store.store_message(msg))
                .map(|inserted| {
                    if inserted {
                        debug!(
                            jid = %msg.chat_jid,
                            sender = %msg.sender_name,
                            "stored message: {}",
                            preview(&msg.content, 50)
                        );
                    }
                }),
            InboundEvent::Metadata {
                jid,
                name,
                channel,
                timestamp,
            } => store.store_chat_metadata(jid, timestamp, name.as_deref(), Some(channel)),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist inbound event");
        }
    }
    debug!("inbound pump stopped");
}
