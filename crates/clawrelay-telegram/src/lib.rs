use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, MessageId, ReactionType, ReplyParameters, UserId};
use tracing::{debug, error, info, warn};

use clawrelay_core::channel::{split_message, Channel, InboundEvent, InboundSender};
use clawrelay_core::logging::preview;
use clawrelay_core::router::has_trigger;
use clawrelay_core::schedule::to_iso;
use clawrelay_core::types::NewMessage;

pub const JID_PREFIX: &str = "tg:";
const MAX_MESSAGE_LEN: usize = 4096;

pub fn chat_jid(chat_id: ChatId) -> String {
    format!("{}{}", JID_PREFIX, chat_id.0)
}

pub fn parse_jid(jid: &str) -> Option<ChatId> {
    jid.strip_prefix(JID_PREFIX)?.parse::<i64>().ok().map(ChatId)
}

/// Telegram users address the bot as `@bot_username`; rewrite that into the
/// assistant trigger so group registrations requiring a trigger still fire.
pub fn rewrite_mention(content: &str, bot_username: &str, trigger: &str) -> String {
    if bot_username.is_empty() || has_trigger(content, trigger) {
        return content.to_string();
    }
    let pattern = format!(r"(?i)@{}\b", regex::escape(bot_username));
    match Regex::new(&pattern) {
        Ok(re) if re.is_match(content) => format!("{} {}", trigger, content),
        _ => content.to_string(),
    }
}

fn is_command(text: &str, command: &str) -> bool {
    let first = text.split_whitespace().next().unwrap_or("");
    let name = first.split('@').next().unwrap_or("");
    name.eq_ignore_ascii_case(command)
}

struct Inbound {
    sender: InboundSender,
    bot_id: UserId,
    bot_username: String,
    trigger: String,
}

impl Inbound {
    async fn handle(&self, bot: &Bot, msg: &Message) {
        let jid = chat_jid(msg.chat.id);
        let timestamp = to_iso(msg.date);
        let chat_name = msg
            .chat
            .title()
            .or_else(|| msg.chat.first_name())
            .map(str::to_string);
        let _ = self
            .sender
            .send(InboundEvent::Metadata {
                jid: jid.clone(),
                name: chat_name,
                channel: "telegram".to_string(),
                timestamp: timestamp.clone(),
            })
            .await;

        let Some(text) = msg.text().or_else(|| msg.caption()) else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        // Lets the operator find the id to register.
        if is_command(text, "/chatid") {
            let reply = format!("Chat ID: {}", jid);
            if let Err(e) = bot
                .send_message(msg.chat.id, reply)
                .reply_parameters(ReplyParameters::new(msg.id))
                .await
            {
                warn!(jid = %jid, error = %e, "failed to answer /chatid");
            }
            return;
        }

        let (sender, sender_name, from_me) = match msg.from.as_ref() {
            Some(user) => (
                user.id.0.to_string(),
                user.full_name(),
                user.id == self.bot_id,
            ),
            None => ("unknown".to_string(), "Unknown".to_string(), false),
        };
        let content = rewrite_mention(text, &self.bot_username, &self.trigger);
        debug!(jid = %jid, sender = %sender_name, "telegram message: {}", preview(&content, 50));

        let message = NewMessage {
            id: msg.id.0.to_string(),
            chat_jid: jid,
            sender,
            sender_name,
            content,
            timestamp,
            is_from_me: from_me,
            is_bot_message: from_me,
            seq: 0,
        };
        if self.sender.send(InboundEvent::Message(message)).await.is_err() {
            warn!("inbound channel closed, dropping telegram message");
        }
    }
}

/// Telegram bot adapter using long polling. Conversation ids are `tg:<chat id>`.
pub struct TelegramChannel {
    bot: Bot,
    trigger: String,
    connected: Arc<AtomicBool>,
    shutdown: Mutex<Option<ShutdownToken>>,
}

impl TelegramChannel {
    pub fn new(token: &str, trigger: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
            trigger: trigger.into(),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
        }
    }

    fn chat(&self, jid: &str) -> Result<ChatId> {
        parse_jid(jid).ok_or_else(|| anyhow!("not a telegram chat id: {}", jid))
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self, inbound: InboundSender) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .context("failed to reach the Telegram API")?;
        info!(username = %me.username(), "telegram bot connected");

        let ctx = Arc::new(Inbound {
            sender: inbound,
            bot_id: me.id,
            bot_username: me.username().to_string(),
            trigger: self.trigger.clone(),
        });
        let handler = Update::filter_message().endpoint(
            |bot: Bot, msg: Message, ctx: Arc<Inbound>| async move {
                ctx.handle(&bot, &msg).await;
                respond(())
            },
        );
        let mut dispatcher = Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![ctx])
            .build();
        if let Ok(mut slot) = self.shutdown.lock() {
            *slot = Some(dispatcher.shutdown_token());
        }

        let connected = Arc::clone(&self.connected);
        connected.store(true, Ordering::SeqCst);
        tokio::spawn(async move {
            dispatcher.dispatch().await;
            connected.store(false, Ordering::SeqCst);
            info!("telegram polling stopped");
        });
        Ok(())
    }

    async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
        let chat = self.chat(jid)?;
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.bot
                .send_message(chat, chunk)
                .await
                .with_context(|| format!("failed to send to {}", jid))?;
        }
        Ok(())
    }

    async fn set_typing(&self, jid: &str, typing: bool) -> Result<()> {
        // Telegram clears the indicator on its own.
        if !typing {
            return Ok(());
        }
        self.bot
            .send_chat_action(self.chat(jid)?, ChatAction::Typing)
            .await?;
        Ok(())
    }

    async fn send_reaction(&self, jid: &str, message_id: &str, emoji: &str) -> Result<()> {
        let id: i32 = message_id
            .parse()
            .with_context(|| format!("invalid telegram message id '{}'", message_id))?;
        self.bot
            .set_message_reaction(self.chat(jid)?, MessageId(id))
            .reaction(vec![ReactionType::Emoji {
                emoji: emoji.to_string(),
            }])
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
        let token = self.shutdown.lock().ok().and_then(|mut slot| slot.take());
        if let Some(token) = token {
            match token.shutdown() {
                Ok(done) => done.await,
                Err(e) => error!(error = ?e, "telegram dispatcher was not running"),
            }
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
        assert_eq!(chat_jid(ChatId(-100123)), "tg:-100123");
        assert_eq!(parse_jid("tg:-100123"), Some(ChatId(-100123)));
        assert_eq!(parse_jid("dc:5"), None);
        assert_eq!(parse_jid("tg:abc"), None);
    }

    #[test]
    fn test_rewrite_mention() {
        assert_eq!(
            rewrite_mention("hey @andy_relay_bot what's up", "andy_relay_bot", "@Andy"),
            "@Andy hey @andy_relay_bot what's up"
        );
        assert_eq!(
            rewrite_mention("@Andy already triggered", "andy_relay_bot", "@Andy"),
            "@Andy already triggered"
        );
        assert_eq!(
            rewrite_mention("no mention here", "andy_relay_bot", "@Andy"),
            "no mention here"
        );
    }

    #[test]
    fn test_is_command() {
        assert!(is_command("/chatid", "/chatid"));
        assert!(is_command("/chatid@andy_relay_bot", "/chatid"));
        assert!(!is_command("/chatidx", "/chatid"));
        assert!(!is_command("what is /chatid", "/chatid"));
    }

    #[test]
    fn test_owns_only_telegram_jids() {
        let channel = TelegramChannel::new("123:abc", "@Andy");
        assert!(channel.owns_jid("tg:1"));
        assert!(!channel.owns_jid("dc:1"));
        assert!(!channel.is_connected());
    }
}
