//! The channel join sequence.
//!
//! Explicit JOIN, the forced join after registration and mention auto-join
//! all go through [`join`]. The client gets JOIN, voice MODE, topic reply,
//! names and end-of-names in that order, and the channel enters the
//! session's join set only once all five lines are queued. Sequences for one
//! channel are serialized by the session's per-channel lock, so a second
//! caller waits and then sees the channel as joined.

use std::collections::HashMap;

use cabal_store::{StoreError, UserInfo};

use crate::echo;
use crate::irc::{self, Message};
use crate::server::SharedState;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
    /// The session closed while the join was in flight. Nothing was written.
    Closed,
    /// The name cannot be carried as an IRC channel parameter.
    InvalidName,
}

impl JoinOutcome {
    /// True if the channel is in the session's join set afterwards.
    pub fn is_joined(self) -> bool {
        matches!(self, JoinOutcome::Joined | JoinOutcome::AlreadyJoined)
    }
}

pub async fn join(
    state: &SharedState,
    session: &Session,
    channel: &str,
) -> Result<JoinOutcome, StoreError> {
    if !irc::is_valid_channel_name(channel) {
        tracing::debug!(session_id = session.id, ?channel, "Channel name not representable on IRC");
        return Ok(JoinOutcome::InvalidName);
    }

    let lock = session.join_lock(channel);
    let _guard = lock.lock().await;

    if session.is_joined(channel) {
        return Ok(JoinOutcome::AlreadyJoined);
    }

    let topic = match state.store.topic(channel).await {
        Ok(topic) => topic,
        Err(e) if e.is_not_found() => String::new(),
        Err(e) => return Err(e),
    };
    let users = state.store.users().await?;

    if session.is_closed() {
        return Ok(JoinOutcome::Closed);
    }

    let host = state.hostname();
    let nick = session.nick();
    let target = irc::channel_target(channel);

    session.send(Message::with_prefix(
        &session.hostmask(host),
        "JOIN",
        vec![&target],
    ));
    session.send(Message::from_server(host, "MODE", vec![&target, "+v", &nick]));
    send_topic(state, session, channel, &topic);
    send_names(state, session, channel, &users);

    session.mark_joined(channel);
    tracing::debug!(session_id = session.id, %channel, "Joined");
    Ok(JoinOutcome::Joined)
}

/// RPL_TOPIC, or RPL_NOTOPIC when the topic is empty.
pub fn send_topic(state: &SharedState, session: &Session, channel: &str, topic: &str) {
    let host = state.hostname();
    let nick = session.nick();
    let target = irc::channel_target(channel);
    let reply = if topic.is_empty() {
        Message::from_server(host, irc::RPL_NOTOPIC, vec![&nick, &target, "No topic is set"])
    } else {
        Message::from_server(host, irc::RPL_TOPIC, vec![&nick, &target, topic])
    };
    session.send(reply);
}

/// RPL_NAMREPLY and RPL_ENDOFNAMES for `channel`.
pub fn send_names(
    state: &SharedState,
    session: &Session,
    channel: &str,
    users: &HashMap<String, UserInfo>,
) {
    let host = state.hostname();
    let nick = session.nick();
    let target = irc::channel_target(channel);
    let names = member_names(state, &nick, users).join(" ");
    session.send(Message::from_server(
        host,
        irc::RPL_NAMREPLY,
        vec![&nick, "=", &target, &names],
    ));
    session.send(Message::from_server(
        host,
        irc::RPL_ENDOFNAMES,
        vec![&nick, &target, "End of /NAMES list."],
    ));
}

/// Every known writer, voiced when connected. The local writer is listed
/// under the session nick and is always voiced.
pub fn member_names(state: &SharedState, nick: &str, users: &HashMap<String, UserInfo>) -> Vec<String> {
    let local_key = state.store.local_key();
    let mut others: Vec<String> = users
        .values()
        .filter(|u| u.key != local_key)
        .map(|u| {
            let name = echo::writer_name(u);
            if state.peers.is_connected(&u.key) {
                format!("+{name}")
            } else {
                name
            }
        })
        .collect();
    others.sort();

    let mut names = Vec::with_capacity(others.len() + 1);
    names.push(format!("+{nick}"));
    names.extend(others);
    names
}
