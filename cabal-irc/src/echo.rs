//! Turning log entries into IRC lines.
//!
//! Every entry that reaches the session passes through [`deliver`]: it is
//! filtered (type, own writes, subscription or mention), its author is
//! resolved to a display name, the channel is joined if a mention pulled it
//! in, and exactly one line is written.

use std::sync::Arc;

use cabal_store::{LogStore, Message as LogMessage, MessageKind, StoreError, UserInfo};
use tokio::sync::mpsc;

use crate::irc::{self, Message};
use crate::join;
use crate::server::SharedState;
use crate::session::Session;

/// Characters of a writer key shown when the writer never published a nick.
pub const KEY_PREFIX_LEN: usize = 8;

/// How an entry reached the echo engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// From the store's event bus. The local writer's own entries are
    /// dropped here since the client already saw what it sent.
    Live,
    /// Replayed by a recap, which covers the local writer's history too.
    Recap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Skipped,
    Written,
    /// A lookup or join failed; this entry is dropped.
    Abandoned,
}

/// Echo worker: delivers live entries one at a time, in arrival order.
pub async fn run(
    state: Arc<SharedState>,
    session: Arc<Session>,
    mut echoes: mpsc::UnboundedReceiver<LogMessage>,
) {
    while let Some(msg) = echoes.recv().await {
        if session.is_closed() {
            break;
        }
        deliver(&state, &session, &msg, Origin::Live).await;
    }
}

pub async fn deliver(
    state: &SharedState,
    session: &Session,
    msg: &LogMessage,
    origin: Origin,
) -> Delivery {
    if session.is_closed() || !session.is_ready() {
        return Delivery::Skipped;
    }
    if msg.kind() == MessageKind::Other {
        return Delivery::Skipped;
    }
    if origin == Origin::Live && msg.key == state.store.local_key() {
        return Delivery::Skipped;
    }

    let channel = msg.channel();
    if !irc::is_valid_channel_name(channel) {
        tracing::debug!(session_id = session.id, ?channel, "Entry on unrepresentable channel");
        return Delivery::Skipped;
    }
    let subscribed = session.is_joined(channel);
    if !subscribed && !is_mention(msg.text(), &session.nick()) {
        return Delivery::Skipped;
    }

    let name = match author_name(state.store.as_ref(), &msg.key).await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(session_id = session.id, key = %msg.key, "Author lookup failed: {e}");
            return Delivery::Abandoned;
        }
    };

    if !subscribed {
        tracing::debug!(session_id = session.id, %channel, "Mention pulls client into channel");
        match join::join(state, session, channel).await {
            Ok(outcome) if outcome.is_joined() => {}
            Ok(outcome) => {
                tracing::debug!(session_id = session.id, %channel, ?outcome, "Mention join did not complete");
                return Delivery::Abandoned;
            }
            Err(e) => {
                tracing::warn!(session_id = session.id, %channel, "Join failed: {e}");
                return Delivery::Abandoned;
            }
        }
    }

    match render(msg, &name) {
        Some(line) => {
            session.send(line);
            Delivery::Written
        }
        None => Delivery::Skipped,
    }
}

/// Case-insensitive substring match of `nick` in `text`.
pub fn is_mention(text: &str, nick: &str) -> bool {
    !nick.is_empty() && text.to_lowercase().contains(&nick.to_lowercase())
}

/// The IRC line for a chat entry, or `None` for types that have no rendering.
pub fn render(msg: &LogMessage, name: &str) -> Option<Message> {
    let mask = author_mask(name, &msg.key);
    let target = irc::channel_target(msg.channel());
    let line = match msg.kind() {
        MessageKind::Text => Message::with_prefix(&mask, "PRIVMSG", vec![&target, msg.text()]),
        MessageKind::Topic => Message::with_prefix(&mask, "TOPIC", vec![&target, msg.text()]),
        MessageKind::Emote => {
            let action = irc::ctcp_action(msg.text());
            Message::with_prefix(&mask, "PRIVMSG", vec![&target, &action])
        }
        MessageKind::Other => return None,
    };
    Some(line)
}

/// `name!cabal@key`: remote writers are addressed by their key.
pub fn author_mask(name: &str, key: &str) -> String {
    format!("{name}!cabal@{key}")
}

/// Display name of a writer. A writer with no published nick is shown by
/// its key prefix; any other lookup failure is returned.
pub async fn author_name(store: &dyn LogStore, key: &str) -> Result<String, StoreError> {
    match store.user(key).await {
        Ok(info) => Ok(writer_name(&info)),
        Err(e) if e.is_not_found() => Ok(key_prefix(key)),
        Err(e) => Err(e),
    }
}

/// The name a writer is shown under: its published nick, or its key prefix
/// when the nick is blank.
pub fn writer_name(info: &UserInfo) -> String {
    let name = display_name(&info.name);
    if name.is_empty() {
        key_prefix(&info.key)
    } else {
        name
    }
}

/// A published name made safe for IRC: no spaces inside a nick.
pub fn display_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join("_")
}

pub fn key_prefix(key: &str) -> String {
    key.chars().take(KEY_PREFIX_LEN).collect()
}
