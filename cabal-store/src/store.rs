//! The log store surface and its SQLite-backed implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use tokio::sync::{broadcast, mpsc};

use crate::db::{Db, MessageRow};
use crate::error::StoreError;
use crate::message::{Message, MessageValue, StoreEvent, UserInfo};

/// Rows fetched per query when streaming a channel's history.
const PAGE_SIZE: usize = 64;

/// Capacity of the process-wide event bus.
const EVENT_CAPACITY: usize = 1024;

const LOCAL_KEY: &str = "local_key";

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Override the entry timestamp (milliseconds). Defaults to now.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Newest entries first.
    pub reverse: bool,
}

/// What the gateway needs from a chat log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Hex key of the local writer.
    fn local_key(&self) -> &str;

    async fn publish(
        &self,
        value: MessageValue,
        options: PublishOptions,
    ) -> Result<Message, StoreError>;

    async fn publish_nick(&self, name: &str) -> Result<(), StoreError>;

    async fn publish_channel_topic(&self, channel: &str, text: &str) -> Result<(), StoreError>;

    async fn channels(&self) -> Result<Vec<String>, StoreError>;

    /// Fails with [`StoreError::NotFound`] if no topic was ever set.
    async fn topic(&self, channel: &str) -> Result<String, StoreError>;

    /// Fails with [`StoreError::NotFound`] if the writer never published a nick.
    async fn user(&self, key: &str) -> Result<UserInfo, StoreError>;

    async fn users(&self) -> Result<HashMap<String, UserInfo>, StoreError>;

    /// Stream a channel's entries. The receiver closes once the history is
    /// exhausted.
    async fn read_messages(
        &self,
        channel: &str,
        options: ReadOptions,
    ) -> Result<mpsc::Receiver<Result<Message, StoreError>>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

struct Shared {
    db: Mutex<Db>,
    events: broadcast::Sender<StoreEvent>,
}

/// A writer's view of a SQLite-backed log. Clones and [`LocalStore::with_key`]
/// views share the database and the event bus.
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<Shared>,
    key: String,
}

impl LocalStore {
    /// Open (or create) a log at `path`. `key` overrides the persisted local
    /// writer key; without one, the persisted key is used or a new one made.
    pub fn open<P: AsRef<Path>>(path: P, key: Option<&str>) -> Result<Self, StoreError> {
        Self::from_db(Db::open(path)?, key)
    }

    /// Open an in-memory log (for testing and ephemeral gateways).
    pub fn open_memory(key: Option<&str>) -> Result<Self, StoreError> {
        Self::from_db(Db::open_memory()?, key)
    }

    fn from_db(db: Db, key: Option<&str>) -> Result<Self, StoreError> {
        let key = match key.map(normalize_key) {
            Some(key) => {
                db.set_meta(LOCAL_KEY, &key)?;
                key
            }
            None => match db.get_meta(LOCAL_KEY)? {
                Some(key) => key,
                None => {
                    let key = generate_key();
                    db.set_meta(LOCAL_KEY, &key)?;
                    tracing::info!("New local key created: {key}");
                    key
                }
            },
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                db: Mutex::new(db),
                events,
            }),
            key,
        })
    }

    /// Another writer on the same log.
    pub fn with_key(&self, key: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            key: normalize_key(key),
        }
    }

    /// Called by the swarm layer when a peer comes online.
    pub fn peer_connected(&self, key: &str) {
        self.emit(StoreEvent::PeerConnected(key.to_string()));
    }

    /// Called by the swarm layer when a peer goes away.
    pub fn peer_disconnected(&self, key: &str) {
        self.emit(StoreEvent::PeerDisconnected(key.to_string()));
    }

    fn db(&self) -> Result<MutexGuard<'_, Db>, StoreError> {
        self.shared
            .db
            .lock()
            .map_err(|_| StoreError::Unavailable("database lock poisoned".to_string()))
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.shared.events.send(event);
    }

    /// Append under an already-held lock. Returns the entry and whether its
    /// channel is new.
    fn append(
        &self,
        db: &Db,
        mut value: MessageValue,
        options: PublishOptions,
    ) -> Result<(Message, bool), StoreError> {
        if let Some(ts) = options.timestamp {
            value.timestamp = ts;
        } else if value.timestamp == 0 {
            value.timestamp = Utc::now().timestamp_millis();
        }
        let created = db.ensure_channel(&value.content.channel)?;
        let json = serde_json::to_string(&value)?;
        let seq = db.insert_message(&self.key, &value.content.channel, &json)?;
        let msg = Message {
            key: self.key.clone(),
            seq: seq as u64,
            value,
        };
        Ok((msg, created))
    }

    fn announce(&self, msg: &Message, created: bool) {
        if created {
            self.emit(StoreEvent::ChannelAdded(msg.channel().to_string()));
        }
        self.emit(StoreEvent::Message(msg.clone()));
    }

    fn page(
        &self,
        channel: &str,
        cursor: Option<i64>,
        reverse: bool,
    ) -> Result<Vec<MessageRow>, StoreError> {
        Ok(self.db()?.get_messages(channel, PAGE_SIZE, cursor, reverse)?)
    }
}

#[async_trait]
impl LogStore for LocalStore {
    fn local_key(&self) -> &str {
        &self.key
    }

    async fn publish(
        &self,
        value: MessageValue,
        options: PublishOptions,
    ) -> Result<Message, StoreError> {
        let (msg, created) = {
            let db = self.db()?;
            self.append(&db, value, options)?
        };
        self.announce(&msg, created);
        Ok(msg)
    }

    async fn publish_nick(&self, name: &str) -> Result<(), StoreError> {
        self.db()?.save_user(&self.key, name)?;
        Ok(())
    }

    async fn publish_channel_topic(&self, channel: &str, text: &str) -> Result<(), StoreError> {
        let (msg, created) = {
            let db = self.db()?;
            let appended =
                self.append(&db, MessageValue::topic(channel, text), PublishOptions::default())?;
            db.set_topic(channel, text)?;
            appended
        };
        self.announce(&msg, created);
        Ok(())
    }

    async fn channels(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.db()?.channel_names()?)
    }

    async fn topic(&self, channel: &str) -> Result<String, StoreError> {
        self.db()?.get_topic(channel)?.ok_or(StoreError::NotFound)
    }

    async fn user(&self, key: &str) -> Result<UserInfo, StoreError> {
        let row = self.db()?.get_user(key)?.ok_or(StoreError::NotFound)?;
        Ok(UserInfo {
            key: row.key,
            name: row.name,
        })
    }

    async fn users(&self) -> Result<HashMap<String, UserInfo>, StoreError> {
        let rows = self.db()?.load_users()?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.key.clone(),
                    UserInfo {
                        key: row.key,
                        name: row.name,
                    },
                )
            })
            .collect())
    }

    async fn read_messages(
        &self,
        channel: &str,
        options: ReadOptions,
    ) -> Result<mpsc::Receiver<Result<Message, StoreError>>, StoreError> {
        let (tx, rx) = mpsc::channel(PAGE_SIZE);
        let store = self.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut cursor = None;
            loop {
                let rows = match store.page(&channel, cursor, options.reverse) {
                    Ok(rows) => rows,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let last_page = rows.len() < PAGE_SIZE;
                cursor = rows.last().map(|r| r.seq).or(cursor);
                for row in rows {
                    if tx.send(decode_row(row)).await.is_err() {
                        // Reader went away.
                        return;
                    }
                }
                if last_page {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.shared.events.subscribe()
    }
}

fn decode_row(row: MessageRow) -> Result<Message, StoreError> {
    let value: MessageValue = serde_json::from_str(&row.value_json)
        .map_err(|e| StoreError::Malformed(format!("entry {}: {e}", row.seq)))?;
    Ok(Message {
        key: row.key,
        seq: row.seq as u64,
        value,
    })
}

/// Strip URL-style prefixes and slashes from a key given on the command line.
pub fn normalize_key(key: &str) -> String {
    let key = ["cabal://", "cbl://", "dat://"]
        .iter()
        .find_map(|p| key.strip_prefix(p))
        .unwrap_or(key);
    key.replace('/', "")
}

fn generate_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    async fn drain(mut rx: mpsc::Receiver<Result<Message, StoreError>>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item.unwrap());
        }
        out
    }

    #[test]
    fn key_normalization() {
        assert_eq!(normalize_key("cabal://abc/"), "abc");
        assert_eq!(normalize_key("dat://ab/cd"), "abcd");
        assert_eq!(normalize_key("plain"), "plain");
    }

    #[test]
    fn generated_key_is_hex() {
        let store = LocalStore::open_memory(None).unwrap();
        let key = store.local_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn publish_emits_channel_then_message() {
        let store = LocalStore::open_memory(Some("aa")).unwrap();
        let mut events = store.subscribe();

        let msg = store
            .publish(MessageValue::text("general", "hello"), PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.key, "aa");
        assert!(msg.value.timestamp > 0);

        assert!(matches!(events.recv().await.unwrap(), StoreEvent::ChannelAdded(c) if c == "general"));
        match events.recv().await.unwrap() {
            StoreEvent::Message(m) => {
                assert_eq!(m.text(), "hello");
                assert_eq!(m.kind(), MessageKind::Text);
            }
            other => panic!("unexpected event {other:?}"),
        }

        store
            .publish(MessageValue::text("general", "again"), PublishOptions::default())
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Message(_)));
        assert_eq!(store.channels().await.unwrap(), vec!["general"]);
    }

    #[tokio::test]
    async fn topic_lookup_and_event() {
        let store = LocalStore::open_memory(Some("aa")).unwrap();
        assert!(store.topic("general").await.unwrap_err().is_not_found());

        let mut events = store.subscribe();
        store.publish_channel_topic("general", "welcome").await.unwrap();
        assert_eq!(store.topic("general").await.unwrap(), "welcome");

        assert!(matches!(events.recv().await.unwrap(), StoreEvent::ChannelAdded(_)));
        match events.recv().await.unwrap() {
            StoreEvent::Message(m) => assert_eq!(m.kind(), MessageKind::Topic),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn users_are_per_writer() {
        let alice = LocalStore::open_memory(Some("aa")).unwrap();
        let bob = alice.with_key("bb");

        assert!(alice.user("aa").await.unwrap_err().is_not_found());
        alice.publish_nick("alice").await.unwrap();
        bob.publish_nick("bob").await.unwrap();

        assert_eq!(bob.user("aa").await.unwrap().name, "alice");
        let all = alice.users().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bb"].name, "bob");
    }

    #[tokio::test]
    async fn reverse_read_spans_pages() {
        let store = LocalStore::open_memory(Some("aa")).unwrap();
        let total = PAGE_SIZE * 2 + 5;
        for i in 0..total {
            store
                .publish(MessageValue::text("general", &i.to_string()), PublishOptions::default())
                .await
                .unwrap();
        }
        store
            .publish(MessageValue::text("other", "x"), PublishOptions::default())
            .await
            .unwrap();

        let rx = store
            .read_messages("general", ReadOptions { reverse: true })
            .await
            .unwrap();
        let msgs = drain(rx).await;
        assert_eq!(msgs.len(), total);
        assert_eq!(msgs[0].text(), (total - 1).to_string());
        assert_eq!(msgs[total - 1].text(), "0");

        let rx = store
            .read_messages("general", ReadOptions::default())
            .await
            .unwrap();
        let msgs = drain(rx).await;
        assert_eq!(msgs[0].text(), "0");
    }

    #[tokio::test]
    async fn writers_share_the_bus() {
        let alice = LocalStore::open_memory(Some("aa")).unwrap();
        let bob = alice.with_key("bb");
        let mut events = alice.subscribe();

        bob.publish(MessageValue::emote("general", "waves"), PublishOptions { timestamp: Some(7) })
            .await
            .unwrap();
        bob.peer_connected("bb");

        assert!(matches!(events.recv().await.unwrap(), StoreEvent::ChannelAdded(_)));
        match events.recv().await.unwrap() {
            StoreEvent::Message(m) => {
                assert_eq!(m.key, "bb");
                assert_eq!(m.value.timestamp, 7);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::PeerConnected(k) if k == "bb"));
    }

    #[test]
    fn key_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cabal.db");

        let first = LocalStore::open(&path, None).unwrap().local_key().to_string();
        drop(LocalStore::open(&path, None).unwrap());
        let second = LocalStore::open(&path, None).unwrap();
        assert_eq!(second.local_key(), first);

        let forced = LocalStore::open(&path, Some("cabal://ff")).unwrap();
        assert_eq!(forced.local_key(), "ff");
    }
}
