use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use chrono::DateTime;
use serenity::builder::CreateMessage;
use serenity::gateway::ShardManager;
use serenity::http::Http;
use serenity::model::channel::{Message, ReactionType};
use serenity::model::gateway::Ready;
use serenity::model::id::{ChannelId, MessageId, UserId};
use serenity::prelude::{Context, EventHandler, GatewayIntents};
use serenity::Client;
use tracing::{debug, error, info, warn};

use clawrelay_core::channel::{split_message, Channel, InboundEvent, InboundSender};
use clawrelay_core::logging::preview;
use clawrelay_core::router::has_trigger;
use clawrelay_core::schedule::to_iso;
use clawrelay_core::types::NewMessage;

pub const JID_PREFIX: &str = "dc:";
const MAX_MESSAGE_LEN: usize = 2000;
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

pub fn chat_jid(channel_id: ChannelId) -> String {
    format!("{}{}", JID_PREFIX, channel_id.get())
}

pub fn parse_jid(jid: &str) -> Option<ChannelId> {
    let id = jid.strip_prefix(JID_PREFIX)?.parse::<u64>().ok()?;
    (id != 0).then(|| ChannelId::new(id))
}

/// Creation time encoded in a snowflake, in ISO-8601 with millisecond precision.
pub fn snowflake_timestamp(id: u64) -> String {
    let millis = (id >> 22) + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(millis as i64)
        .map(to_iso)
        .unwrap_or_default()
}

/// Replace a `<@id>` / `<@!id>` mention of the bot with the assistant trigger.
pub fn rewrite_mention(content: &str, bot_id: u64, trigger: &str) -> String {
    if has_trigger(content, trigger) {
        return content.to_string();
    }
    let plain = format!("<@{}>", bot_id);
    let nick = format!("<@!{}>", bot_id);
    if !content.contains(&plain) && !content.contains(&nick) {
        return content.to_string();
    }
    let stripped = content.replace(&nick, "").replace(&plain, "");
    let rest = stripped.trim();
    if rest.is_empty() {
        trigger.to_string()
    } else {
        format!("{} {}", trigger, rest)
    }
}

struct Handler {
    sender: InboundSender,
    trigger: String,
    bot_id: Arc<OnceLock<UserId>>,
    connected: Arc<AtomicBool>,
}

impl Handler {
    async fn chat_name(&self, ctx: &Context, msg: &Message) -> Option<String> {
        if msg.guild_id.is_none() {
            return Some(msg.author.name.clone());
        }
        match msg.channel_id.name(ctx).await {
            Ok(name) => Some(name),
            Err(e) => {
                debug!(channel = %msg.channel_id, error = %e, "could not resolve channel name");
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let _ = self.bot_id.set(ready.user.id);
        self.connected.store(true, Ordering::SeqCst);
        info!(user = %ready.user.name, guilds = ready.guilds.len(), "discord bot connected");
    }

    async fn message(&self, ctx: Context, msg: Message) {
        let from_me = self.bot_id.get() == Some(&msg.author.id);
        if msg.author.bot && !from_me {
            return;
        }

        let jid = chat_jid(msg.channel_id);
        let timestamp = snowflake_timestamp(msg.id.get());
        let name = self.chat_name(&ctx, &msg).await;
        let _ = self
            .sender
            .send(InboundEvent::Metadata {
                jid: jid.clone(),
                name,
                channel: "discord".to_string(),
                timestamp: timestamp.clone(),
            })
            .await;

        if msg.content.trim().is_empty() {
            return;
        }

        if !from_me && msg.content.trim().eq_ignore_ascii_case("!chatid") {
            let reply = format!("Channel ID: {}", jid);
            if let Err(e) = msg.reply(&ctx.http, reply).await {
                warn!(jid = %jid, error = %e, "failed to answer !chatid");
            }
            return;
        }

        let content = match self.bot_id.get() {
            Some(id) if !from_me => rewrite_mention(&msg.content, id.get(), &self.trigger),
            _ => msg.content.clone(),
        };
        let sender_name = msg
            .author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone());
        debug!(jid = %jid, sender = %sender_name, "discord message: {}", preview(&content, 50));

        let message = NewMessage {
            id: msg.id.get().to_string(),
            chat_jid: jid,
            sender: msg.author.id.get().to_string(),
            sender_name,
            content,
            timestamp,
            is_from_me: from_me,
            is_bot_message: from_me,
            seq: 0,
        };
        if self.sender.send(InboundEvent::Message(message)).await.is_err() {
            warn!("inbound channel closed, dropping discord message");
        }
    }
}

/// Discord bot adapter over the gateway. Conversation ids are `dc:<channel id>`.
pub struct DiscordChannel {
    token: String,
    trigger: String,
    http: Arc<Http>,
    connected: Arc<AtomicBool>,
    shards: Mutex<Option<Arc<ShardManager>>>,
}

impl DiscordChannel {
    pub fn new(token: &str, trigger: impl Into<String>) -> Self {
        Self {
            token: token.to_string(),
            trigger: trigger.into(),
            http: Arc::new(Http::new(token)),
            connected: Arc::new(AtomicBool::new(false)),
            shards: Mutex::new(None),
        }
    }

    fn channel(&self, jid: &str) -> Result<ChannelId> {
        parse_jid(jid).ok_or_else(|| anyhow!("not a discord channel id: {}", jid))
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn connect(&self, inbound: InboundSender) -> Result<()> {
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let handler = Handler {
            sender: inbound,
            trigger: self.trigger.clone(),
            bot_id: Arc::new(OnceLock::new()),
            connected: Arc::clone(&self.connected),
        };
        let mut client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;
        if let Ok(mut slot) = self.shards.lock() {
            *slot = Some(Arc::clone(&client.shard_manager));
        }

        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            if let Err(e) = client.start().await {
                error!(error = %e, "discord client stopped with error");
            }
            connected.store(false, Ordering::SeqCst);
            info!("discord gateway closed");
        });
        Ok(())
    }

    async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
        let channel = self.channel(jid)?;
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            channel
                .send_message(&self.http, CreateMessage::new().content(chunk))
                .await
                .with_context(|| format!("failed to send to {}", jid))?;
        }
        Ok(())
    }

    async fn set_typing(&self, jid: &str, typing: bool) -> Result<()> {
        // The indicator expires after a few seconds; there is nothing to clear.
        if !typing {
            return Ok(());
        }
        self.channel(jid)?.broadcast_typing(&self.http).await?;
        Ok(())
    }

    async fn send_reaction(&self, jid: &str, message_id: &str, emoji: &str) -> Result<()> {
        let id: u64 = message_id
            .parse()
            .ok()
            .filter(|id| *id != 0)
            .ok_or_else(|| anyhow!("invalid discord message id '{}'", message_id))?;
        self.channel(jid)?
            .create_reaction(
                &self.http,
                MessageId::new(id),
                ReactionType::Unicode(emoji.to_string()),
            )
            .await?;
        Ok(())
    }

    fn owns_jid(&self, jid: &str) -> bool {
        jid.starts_with(JID_PREFIX)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<()> {
        let shards = self.shards.lock().ok().and_then(|mut slot| slot.take());
        if let Some(shards) = shards {
            shards.shutdown_all().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jid_roundtrip() {
        let id = ChannelId::new(1234567890123);
        assert_eq!(chat_jid(id), "dc:1234567890123");
        assert_eq!(parse_jid("dc:1234567890123"), Some(id));
        assert_eq!(parse_jid("dc:0"), None);
        assert_eq!(parse_jid("tg:5"), None);
        assert_eq!(parse_jid("dc:-5"), None);
    }

    #[test]
    fn test_snowflake_timestamp() {
        assert_eq!(
            snowflake_timestamp(175928847299117063),
            "2016-04-30T11:18:25.796Z"
        );
    }

    #[test]
    fn test_rewrite_mention() {
        assert_eq!(rewrite_mention("<@42> what's up", 42, "@Andy"), "@Andy what's up");
        assert_eq!(rewrite_mention("hey <@!42>", 42, "@Andy"), "@Andy hey");
        assert_eq!(rewrite_mention("<@42>", 42, "@Andy"), "@Andy");
        assert_eq!(rewrite_mention("<@7> hello", 42, "@Andy"), "<@7> hello");
        assert_eq!(
            rewrite_mention("@Andy ping <@42>", 42, "@Andy"),
            "@Andy ping <@42>"
        );
    }

    #[test]
    fn test_owns_only_discord_jids() {
        let channel = DiscordChannel::new("not-a-real-token", "@Andy");
        assert!(channel.owns_jid("dc:1"));
        assert!(!channel.owns_jid("tg:1"));
        assert!(!channel.is_connected());
    }
}
