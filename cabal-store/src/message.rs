//! Log entries, user records and events.

use serde::{Deserialize, Serialize};

/// The type of a chat entry. Entries with a type this crate does not know
/// still load; they come back as [`MessageKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "chat/text")]
    Text,
    #[serde(rename = "chat/topic")]
    Topic,
    #[serde(rename = "chat/emote")]
    Emote,
    #[serde(other)]
    Other,
}

/// Body of a chat entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    pub channel: String,
    pub text: String,
}

/// The value a writer appends to its feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageValue {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Content,
    /// Milliseconds since the unix epoch. Filled in by the store when zero.
    #[serde(default)]
    pub timestamp: i64,
}

impl MessageValue {
    pub fn new(kind: MessageKind, channel: &str, text: &str) -> Self {
        Self {
            kind,
            content: Content {
                channel: channel.to_string(),
                text: text.to_string(),
            },
            timestamp: 0,
        }
    }

    pub fn text(channel: &str, text: &str) -> Self {
        Self::new(MessageKind::Text, channel, text)
    }

    pub fn emote(channel: &str, text: &str) -> Self {
        Self::new(MessageKind::Emote, channel, text)
    }

    pub fn topic(channel: &str, text: &str) -> Self {
        Self::new(MessageKind::Topic, channel, text)
    }
}

/// A stored entry: who wrote it, where it sits in the log, and what it says.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Hex key of the writer.
    pub key: String,
    /// Logical position in the log.
    pub seq: u64,
    pub value: MessageValue,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.value.kind
    }

    pub fn channel(&self) -> &str {
        &self.value.content.channel
    }

    pub fn text(&self) -> &str {
        &self.value.content.text
    }
}

/// Latest nickname a writer published about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub key: String,
    pub name: String,
}

/// Events broadcast by the store to every subscriber in the process.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ChannelAdded(String),
    Message(Message),
    PeerConnected(String),
    PeerDisconnected(String),
}
