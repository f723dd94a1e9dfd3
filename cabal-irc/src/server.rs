//! Gateway state and TCP listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use cabal_store::{LogStore, StoreEvent};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::connection;
use crate::irc::{self, Message};
use crate::peers::ConnectedPeers;
use crate::session::Session;

/// State shared by the listener, the store event loop and the one
/// connection currently attached.
pub struct SharedState {
    pub config: GatewayConfig,
    pub store: Arc<dyn LogStore>,
    pub peers: ConnectedPeers,
    active: Mutex<Option<Arc<Session>>>,
}

impl SharedState {
    pub fn new(config: GatewayConfig, store: Arc<dyn LogStore>) -> Self {
        Self {
            config,
            store,
            peers: ConnectedPeers::new(),
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Prefix of gateway-originated notices.
    pub fn bot_mask(&self) -> String {
        format!("cabal!cabal@{}", self.config.hostname)
    }

    /// Send a bot NOTICE to `target` (a nick or `#channel`).
    pub fn notice(&self, session: &Session, target: &str, text: &str) {
        let msg = Message::with_prefix(&self.bot_mask(), "NOTICE", vec![target, text]);
        session.send(msg);
    }

    /// The session currently attached, if any.
    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.active().clone()
    }

    /// Make `session` the only active session, closing whichever one it replaces.
    pub fn install(&self, session: Arc<Session>) {
        let previous = self.active().replace(Arc::clone(&session));
        if let Some(previous) = previous {
            tracing::info!(
                session_id = previous.id,
                replaced_by = session.id,
                "Evicting previous session"
            );
            previous.close();
        }
    }

    /// Forget `session` if it is still the active one.
    pub fn release(&self, session: &Session) {
        let mut active = self.active();
        if active.as_ref().is_some_and(|s| s.id == session.id) {
            *active = None;
        }
    }

    /// Route one store event through the session attached right now.
    pub fn dispatch(&self, event: StoreEvent) {
        match event {
            StoreEvent::Message(msg) => {
                if let Some(session) = self.active_session() {
                    session.enqueue_echo(msg);
                }
            }
            StoreEvent::ChannelAdded(name) => {
                tracing::info!(channel = %name, "Channel added");
                let Some(session) = self.active_session() else {
                    return;
                };
                if session.is_ready() && irc::is_valid_channel_name(&name) {
                    let text = format!("new channel available: #{name}");
                    self.notice(&session, &session.nick(), &text);
                }
            }
            StoreEvent::PeerConnected(key) => {
                tracing::info!(peer = %key, "Peer connected");
                self.peers.set(&key, true);
            }
            StoreEvent::PeerDisconnected(key) => {
                tracing::info!(peer = %key, "Peer disconnected");
                self.peers.set(&key, false);
            }
        }
    }
}

/// Subscribe to the store bus and feed every event to [`SharedState::dispatch`].
/// Ends when the state is dropped or the bus closes.
pub fn spawn_event_loop(state: &Arc<SharedState>) -> JoinHandle<()> {
    let mut events = state.store.subscribe();
    let state: Weak<SharedState> = Arc::downgrade(state);
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Store event loop lagged, {n} events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(state) = state.upgrade() else {
                break;
            };
            state.dispatch(event);
        }
    })
}

pub struct Server {
    config: GatewayConfig,
    store: Arc<dyn LogStore>,
}

impl Server {
    pub fn new(config: GatewayConfig, store: Arc<dyn LogStore>) -> Self {
        Self { config, store }
    }

    fn build_state(&self) -> Arc<SharedState> {
        let state = Arc::new(SharedState::new(self.config.clone(), Arc::clone(&self.store)));
        spawn_event_loop(&state);
        state
    }

    /// Run the gateway, blocking forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!(
            "Listening on {} for cabal://{}",
            self.config.listen_addr,
            self.store.local_key()
        );
        let state = self.build_state();
        accept_loop(listener, state).await
    }

    /// Start the gateway and return the bound address, its state and the
    /// listener task (for testing).
    pub async fn start(self) -> Result<(SocketAddr, Arc<SharedState>, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");

        let state = self.build_state();
        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Ok((addr, state, handle))
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<SharedState>) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::info!("Connection from {addr}");
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = connection::handle(stream, state).await {
                tracing::error!("Connection error: {e}");
            }
        });
    }
}
