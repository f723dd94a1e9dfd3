//! Replaying recent channel history to the client.
//!
//! History is read newest first. The newest `limit` entries are buffered
//! and flushed oldest first once the read is exhausted; anything older than
//! the window goes straight to the echo engine as it is read, so a very long
//! history is not held in memory but its tail may arrive out of order.
//! Live echo for the same channel is not paused while a recap runs.

use std::collections::VecDeque;

use cabal_store::{ReadOptions, StoreError};

use crate::echo::{self, Origin};
use crate::irc;
use crate::server::SharedState;
use crate::session::Session;

/// Recap one channel. Returns the number of entries in the replayed window.
pub async fn recap_channel(
    state: &SharedState,
    session: &Session,
    channel: &str,
    limit: usize,
) -> Result<usize, StoreError> {
    let mut history = state
        .store
        .read_messages(channel, ReadOptions { reverse: true })
        .await?;

    let mut window = VecDeque::with_capacity(limit.min(1024));
    while let Some(item) = history.recv().await {
        let msg = match item {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(session_id = session.id, %channel, "Skipping history entry: {e}");
                continue;
            }
        };
        if window.len() < limit {
            window.push_front(msg);
        } else {
            echo::deliver(state, session, &msg, Origin::Live).await;
        }
    }

    let count = window.len();
    for msg in &window {
        echo::deliver(state, session, msg, Origin::Recap).await;
    }

    let target = irc::channel_target(channel);
    state.notice(session, &target, &format!("recap of {target} complete"));
    tracing::debug!(session_id = session.id, %channel, count, "Recap complete");
    Ok(count)
}

/// Recap every channel in the store, one after another.
pub async fn recap_all(state: &SharedState, session: &Session, limit: usize) {
    let channels = match state.store.channels().await {
        Ok(channels) => channels,
        Err(e) => {
            tracing::warn!(session_id = session.id, "Listing channels for recap failed: {e}");
            return;
        }
    };
    for channel in channels.into_iter().filter(|c| irc::is_valid_channel_name(c)) {
        if session.is_closed() {
            return;
        }
        if let Err(e) = recap_channel(state, session, &channel, limit).await {
            tracing::warn!(session_id = session.id, %channel, "Recap failed: {e}");
        }
    }
}
