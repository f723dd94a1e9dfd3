//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cabal_store::{
    LocalStore, LogStore, Message, MessageValue, PublishOptions, ReadOptions, StoreError,
    StoreEvent, UserInfo,
};
use tokio::sync::{broadcast, mpsc};

use crate::config::GatewayConfig;
use crate::server::SharedState;
use crate::session::{Phase, Session, SessionIo};

/// Key of the local writer in every fixture store.
pub const LOCAL_KEY: &str = "aa";

pub fn state_with_store() -> (Arc<SharedState>, LocalStore) {
    let store = LocalStore::open_memory(Some(LOCAL_KEY)).unwrap();
    let state = state_over(Arc::new(store.clone()));
    (state, store)
}

pub fn state() -> Arc<SharedState> {
    state_with_store().0
}

pub fn state_over(store: Arc<dyn LogStore>) -> Arc<SharedState> {
    Arc::new(SharedState::new(GatewayConfig::default(), store))
}

/// A registered session installed as the active one.
pub fn ready_session(state: &Arc<SharedState>, nick: &str) -> (Arc<Session>, SessionIo) {
    let (session, io) = Session::new("test".into(), nick.into());
    session.set_phase(Phase::Ready);
    state.install(Arc::clone(&session));
    (session, io)
}

/// Every line queued so far, without CRLF.
pub fn drain_lines(io: &mut SessionIo) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = io.lines.try_recv() {
        lines.push(line.trim_end_matches("\r\n").to_string());
    }
    lines
}

/// Wait for the next queued line.
pub async fn next_line(io: &mut SessionIo) -> String {
    let line = tokio::time::timeout(Duration::from_secs(2), io.lines.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("line queue closed");
    line.trim_end_matches("\r\n").to_string()
}

#[derive(Default)]
struct Faults {
    publish: AtomicBool,
    nick: AtomicBool,
    users: AtomicBool,
    topic: AtomicBool,
    topic_delay: Mutex<Option<Duration>>,
}

/// A [`LocalStore`] whose calls can be made to fail or stall.
#[derive(Clone)]
pub struct FlakyStore {
    inner: LocalStore,
    faults: Arc<Faults>,
}

fn unavailable() -> StoreError {
    StoreError::Unavailable("injected failure".to_string())
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: LocalStore::open_memory(Some(LOCAL_KEY)).unwrap(),
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn inner(&self) -> &LocalStore {
        &self.inner
    }

    pub fn fail_publish(&self, on: bool) {
        self.faults.publish.store(on, Ordering::SeqCst);
    }

    pub fn fail_nick(&self, on: bool) {
        self.faults.nick.store(on, Ordering::SeqCst);
    }

    pub fn fail_users(&self, on: bool) {
        self.faults.users.store(on, Ordering::SeqCst);
    }

    pub fn fail_topic(&self, on: bool) {
        self.faults.topic.store(on, Ordering::SeqCst);
    }

    pub fn delay_topic(&self, delay: Duration) {
        *self.faults.topic_delay.lock().unwrap() = Some(delay);
    }

    fn failing(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(unavailable())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LogStore for FlakyStore {
    fn local_key(&self) -> &str {
        self.inner.local_key()
    }

    async fn publish(
        &self,
        value: MessageValue,
        options: PublishOptions,
    ) -> Result<Message, StoreError> {
        Self::failing(&self.faults.publish)?;
        self.inner.publish(value, options).await
    }

    async fn publish_nick(&self, name: &str) -> Result<(), StoreError> {
        Self::failing(&self.faults.nick)?;
        self.inner.publish_nick(name).await
    }

    async fn publish_channel_topic(&self, channel: &str, text: &str) -> Result<(), StoreError> {
        Self::failing(&self.faults.publish)?;
        self.inner.publish_channel_topic(channel, text).await
    }

    async fn channels(&self) -> Result<Vec<String>, StoreError> {
        self.inner.channels().await
    }

    async fn topic(&self, channel: &str) -> Result<String, StoreError> {
        let delay = *self.faults.topic_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::failing(&self.faults.topic)?;
        self.inner.topic(channel).await
    }

    async fn user(&self, key: &str) -> Result<UserInfo, StoreError> {
        Self::failing(&self.faults.users)?;
        self.inner.user(key).await
    }

    async fn users(&self) -> Result<HashMap<String, UserInfo>, StoreError> {
        Self::failing(&self.faults.users)?;
        self.inner.users().await
    }

    async fn read_messages(
        &self,
        channel: &str,
        options: ReadOptions,
    ) -> Result<mpsc::Receiver<Result<Message, StoreError>>, StoreError> {
        self.inner.read_messages(channel, options).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}
