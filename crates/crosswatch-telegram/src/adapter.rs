//! Bot-API transport session backed by teloxide.
//!
//! Implements the capabilities the Bot API has: realtime updates via long
//! polling, chat resolution, sending, and media copy-forwarding. Joining
//! channels and iterating history are MTProto-only capabilities and surface
//! as `Unsupported`; the fan-in degrades to realtime-only for such sessions
//! (the operator adds the bots to their channels once, by hand).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{MessageId, Recipient};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crosswatch_ingest::{ChatTransport, RemoteMessage, TransportError};

/// Capacity of the realtime delivery queue per session.
const SUBSCRIBE_QUEUE: usize = 256;

pub struct TelegramTransport {
    name: String,
    bot: Bot,
}

impl TelegramTransport {
    /// Create a session and verify its token against `getMe`.
    pub async fn connect(name: &str, token: &str) -> Result<Self, TransportError> {
        let bot = Bot::new(token);
        let me = bot
            .get_me()
            .await
            .map_err(|e| TransportError::Unauthorized(e.to_string()))?;
        info!(
            session = name,
            bot = me.user.username.as_deref().unwrap_or("?"),
            "telegram session connected"
        );
        Ok(Self {
            name: name.to_string(),
            bot,
        })
    }
}

fn map_request_error(e: teloxide::RequestError) -> TransportError {
    match e {
        teloxide::RequestError::RetryAfter(secs) => TransportError::FloodWait {
            seconds: u64::from(secs.seconds()),
        },
        other => TransportError::Other(other.to_string()),
    }
}

fn to_remote(msg: &Message) -> RemoteMessage {
    let media_id = msg
        .photo()
        .and_then(|photos| photos.last())
        .map(|p| p.file.unique_id.clone())
        .or_else(|| msg.document().map(|d| d.file.unique_id.clone()))
        .or_else(|| msg.video().map(|v| v.file.unique_id.clone()));

    RemoteMessage {
        id: i64::from(msg.id.0),
        chat_id: msg.chat.id.0,
        chat_username: msg.chat.username().map(|s| s.to_string()),
        text: msg.text().or_else(|| msg.caption()).unwrap_or("").to_string(),
        date: msg.date,
        media_id,
        grouped_id: msg.media_group_id().map(|s| s.to_string()),
        // The Bot API never delivers the bot's own messages to itself.
        outgoing: false,
        from_bot: msg.via_bot.is_some()
            || msg.from.as_ref().map(|u| u.is_bot).unwrap_or(false),
    }
}

/// Dependencies injected into the dispatcher's endpoint.
struct SubscribeContext {
    allowed: HashSet<i64>,
    tx: mpsc::Sender<RemoteMessage>,
}

async fn on_update(msg: Message, ctx: Arc<SubscribeContext>) -> ResponseResult<()> {
    if !ctx.allowed.contains(&msg.chat.id.0) {
        return Ok(());
    }
    if ctx.tx.send(to_remote(&msg)).await.is_err() {
        debug!("realtime queue closed, update dropped");
    }
    Ok(())
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join_channel(&self, _username: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported("join_channel"))
    }

    async fn resolve_channel(&self, username: &str) -> Result<i64, TransportError> {
        let chat = self
            .bot
            .get_chat(Recipient::ChannelUsername(format!("@{username}")))
            .await
            .map_err(map_request_error)?;
        Ok(chat.id.0)
    }

    async fn fetch_after(
        &self,
        _chat_id: i64,
        _min_id: i64,
        _limit: usize,
    ) -> Result<Vec<RemoteMessage>, TransportError> {
        Err(TransportError::Unsupported("history iteration"))
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), TransportError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn forward_message(
        &self,
        chat_id: i64,
        message: &RemoteMessage,
        caption: &str,
    ) -> Result<(), TransportError> {
        if message.has_media() {
            self.bot
                .copy_message(
                    ChatId(chat_id),
                    ChatId(message.chat_id),
                    MessageId(message.id as i32),
                )
                .caption(caption.to_string())
                .await
                .map_err(map_request_error)?;
        } else {
            self.send_text(chat_id, caption).await?;
        }
        Ok(())
    }

    /// Long-polling dispatcher feeding matched updates into a channel.
    ///
    /// One subscription per session; a second call would start a second
    /// long-polling loop against the same token.
    async fn subscribe(
        &self,
        chat_ids: Vec<i64>,
    ) -> Result<mpsc::Receiver<RemoteMessage>, TransportError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_QUEUE);
        let ctx = Arc::new(SubscribeContext {
            allowed: chat_ids.into_iter().collect(),
            tx,
        });

        let handler = dptree::entry()
            .branch(Update::filter_channel_post().endpoint(on_update))
            .branch(Update::filter_message().endpoint(on_update));

        let bot = self.bot.clone();
        let session = self.name.clone();
        tokio::spawn(async move {
            info!(session = %session, "long-polling dispatcher started");
            Dispatcher::builder(bot, handler)
                .dependencies(dptree::deps![ctx])
                .default_handler(|_upd| async {})
                .build()
                .dispatch()
                .await;
            warn!(session = %session, "long-polling dispatcher ended");
        });

        Ok(rx)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Long polling holds no persistent connection worth tearing down.
        Ok(())
    }
}
