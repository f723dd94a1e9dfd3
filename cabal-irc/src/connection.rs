//! Per-client connection handler.
//!
//! Each TCP connection gets a [`Session`] that manages:
//! - registration (NICK/USER), welcome and MOTD
//! - the forced join and recap that follow registration
//! - command dispatch once registered
//! - keepalive and teardown
//!
//! Installing the session evicts whichever client was attached before.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cabal_store::{MessageValue, PublishOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::command::Command;
use crate::echo;
use crate::irc::{self, Message};
use crate::join;
use crate::recap;
use crate::server::SharedState;
use crate::session::{Phase, Session, SessionIo};

const PING_INTERVAL: Duration = Duration::from_secs(90);
const PING_TIMEOUT: Duration = Duration::from_secs(180);
/// How long teardown waits for the writer task to flush queued lines.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether the read loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, state: Arc<SharedState>) -> Result<()> {
    let connection_id = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, connection_id, state).await
}

/// Handle any bidirectional stream.
pub async fn handle_generic<S>(stream: S, connection_id: String, state: Arc<SharedState>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, connection_id, state).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    connection_id: String,
    state: Arc<SharedState>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let nick = initial_nick(&state).await;
    let (session, io) = Session::new(connection_id, nick);
    let SessionIo { mut lines, echoes } = io;
    state.install(Arc::clone(&session));
    let session_id = session.id;
    tracing::info!(session_id, connection = %session.connection_id, "Session started");

    // Spawn writer task
    let mut write_half = writer;
    let write_handle = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                tracing::warn!(session_id, "Write error: {e}");
                break;
            }
        }
    });

    let echo_handle = tokio::spawn(echo::run(
        Arc::clone(&state),
        Arc::clone(&session),
        echoes,
    ));

    let mut line_buf = Vec::new();
    let mut last_activity = tokio::time::Instant::now();
    let mut awaiting_pong = false;
    let mut requested_nick: Option<String> = None;

    loop {
        let read_result = tokio::select! {
            _ = session.closed() => break,
            result = tokio::time::timeout(PING_INTERVAL, reader.read_until(b'\n', &mut line_buf)) => result,
        };

        match read_result {
            Ok(Ok(0)) => break,
            Ok(Err(e)) => {
                tracing::debug!(session_id, "Read error: {e}");
                break;
            }
            Err(_) => {
                // Timeout: no data received, send PING or check PONG
                if awaiting_pong {
                    if last_activity.elapsed() > PING_TIMEOUT {
                        tracing::info!(session_id, "Ping timeout");
                        break;
                    }
                } else {
                    let host = state.hostname();
                    session.send(Message::from_server(host, "PING", vec![host]));
                    awaiting_pong = true;
                }
                continue;
            }
            Ok(Ok(_)) => {}
        }

        last_activity = tokio::time::Instant::now();
        awaiting_pong = false;

        // Clients in legacy encodings are read lossily rather than dropped.
        let line = String::from_utf8_lossy(&line_buf).into_owned();
        line_buf.clear();
        let Some(msg) = Message::parse(&line) else {
            continue;
        };
        tracing::debug!(session_id, "<- {}", line.trim_end());

        let command = Command::from_message(&msg);
        if dispatch(&state, &session, &mut requested_nick, command).await == Flow::Quit {
            break;
        }
    }

    tracing::info!(session_id, "Session ended");
    session.close();
    state.release(&session);
    echo_handle.abort();

    // Closing dropped the queue's sender, so the writer ends after the
    // lines already queued.
    let abort = write_handle.abort_handle();
    if tokio::time::timeout(FLUSH_TIMEOUT, write_handle).await.is_err() {
        tracing::debug!(session_id, "Writer did not drain in time");
        abort.abort();
    }
    Ok(())
}

/// The nick a new session starts with: the local writer's published name,
/// or its key prefix.
async fn initial_nick(state: &SharedState) -> String {
    let key = state.store.local_key();
    match echo::author_name(state.store.as_ref(), key).await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!("Looking up local nick failed: {e}");
            echo::key_prefix(key)
        }
    }
}

async fn dispatch(
    state: &Arc<SharedState>,
    session: &Arc<Session>,
    requested_nick: &mut Option<String>,
    command: Command,
) -> Flow {
    if !session.is_ready() && !command.is_registration() {
        tracing::debug!(session_id = session.id, "Ignoring {command:?} before registration");
        return Flow::Continue;
    }

    match command {
        Command::Quit => return Flow::Quit,
        Command::Disconnect => {
            tracing::debug!(session_id = session.id, "Swallowing disconnect pseudo-command");
        }
        Command::Ping(token) => {
            let host = state.hostname();
            session.send(Message::from_server(host, "PONG", vec![host, &token]));
        }
        Command::Pong => {}
        Command::Cap(subcommand, args) => handle_cap(state, session, subcommand.as_deref(), args),
        Command::Nick(nick) => {
            if session.is_ready() {
                change_nick(state, session, &nick, true).await;
            } else {
                *requested_nick = Some(nick);
            }
        }
        Command::User { username, realname } => {
            handle_user(state, session, requested_nick.take(), &username, &realname).await;
        }
        Command::Join(channels) => handle_join(state, session, &channels).await,
        Command::Part(channels) => handle_part(state, session, &channels),
        Command::Privmsg { target, text } => handle_privmsg(state, session, &target, &text).await,
        Command::Topic { channel, topic } => {
            handle_topic(state, session, &channel, topic.as_deref()).await;
        }
        Command::Names(channels) => handle_names(state, session, &channels).await,
        Command::Whois(nick) => handle_whois(state, session, &nick).await,
        Command::Mode(target) => handle_mode(state, session, &target),
        Command::List => handle_list(state, session).await,
        Command::NeedMoreParams(name) => {
            let nick = session.nick();
            session.send(Message::from_server(
                state.hostname(),
                irc::ERR_NEEDMOREPARAMS,
                vec![&nick, &name, "Not enough parameters"],
            ));
        }
        Command::Unknown(name) => {
            if !name.is_empty() {
                tracing::warn!(session_id = session.id, "Not implemented: {name}");
                let nick = session.nick();
                session.send(Message::from_server(
                    state.hostname(),
                    irc::ERR_UNKNOWNCOMMAND,
                    vec![&nick, &name, "Unknown command"],
                ));
            }
        }
    }
    Flow::Continue
}

// ── Registration ───────────────────────────────────────────────────────

async fn handle_user(
    state: &Arc<SharedState>,
    session: &Arc<Session>,
    requested_nick: Option<String>,
    username: &str,
    realname: &str,
) {
    if !session.set_user(username, realname) {
        tracing::debug!(session_id = session.id, "USER repeated, ignoring");
        return;
    }
    session.set_phase(Phase::Handshake);

    // The client learns its nick from the welcome, so no NICK line here.
    if let Some(nick) = requested_nick {
        change_nick(state, session, &nick, false).await;
    }

    send_welcome(state, session);
    session.set_phase(Phase::Ready);
    tracing::info!(session_id = session.id, nick = %session.nick(), "Registered");

    if state.config.lazy_join {
        announce_channels(state, session).await;
    } else {
        tokio::spawn(forced_join(Arc::clone(state), Arc::clone(session)));
    }
}

fn send_welcome(state: &SharedState, session: &Session) {
    let host = state.hostname();
    let nick = session.nick();
    let reply = |code: &str, text: &str| {
        session.send(Message::from_server(host, code, vec![&nick, text]));
    };

    reply(irc::RPL_WELCOME, &format!("Welcome to cabal, {nick}!"));
    reply(irc::RPL_MOTDSTART, &format!("- {host} Message of the day -"));
    reply(irc::RPL_MOTD, "- Welcome to the cabal IRC gateway");
    reply(irc::RPL_MOTD, "- Enjoy using your favourite IRC client");
    reply(irc::RPL_MOTD, "- on the decentralized cabal network");
    if let Some(ref motd) = state.config.motd {
        reply(irc::RPL_MOTD, &format!("- {motd}"));
    }
    reply(irc::RPL_ENDOFMOTD, "End of MOTD command");
}

async fn announce_channels(state: &SharedState, session: &Session) {
    let channels = match state.store.channels().await {
        Ok(channels) => channels,
        Err(e) => {
            tracing::warn!(session_id = session.id, "Listing channels failed: {e}");
            return;
        }
    };
    let list = channels
        .iter()
        .filter(|c| irc::is_valid_channel_name(c))
        .map(|c| irc::channel_target(c))
        .collect::<Vec<_>>()
        .join(" ");
    if list.is_empty() {
        return;
    }
    state.notice(session, &session.nick(), &format!("channels available: {list}"));
}

/// Join the client to every channel, then recap them after a pause that
/// lets the client settle the join burst.
async fn forced_join(state: Arc<SharedState>, session: Arc<Session>) {
    let channels: Vec<String> = match state.store.channels().await {
        Ok(channels) => channels
            .into_iter()
            .filter(|c| irc::is_valid_channel_name(c))
            .collect(),
        Err(e) => {
            tracing::warn!(session_id = session.id, "Listing channels failed: {e}");
            return;
        }
    };

    for channel in &channels {
        match join::join(&state, &session, channel).await {
            Ok(join::JoinOutcome::Closed) => return,
            Ok(_) => {}
            Err(e) => tracing::warn!(session_id = session.id, %channel, "Join failed: {e}"),
        }
    }

    if state.config.no_recap || channels.is_empty() {
        return;
    }
    tokio::time::sleep(state.config.recap_delay()).await;

    for channel in &channels {
        if session.is_closed() {
            return;
        }
        let limit = state.config.recap_limit;
        if let Err(e) = recap::recap_channel(&state, &session, channel, limit).await {
            tracing::warn!(session_id = session.id, %channel, "Recap failed: {e}");
        }
    }
}

// ── Nick ───────────────────────────────────────────────────────────────

async fn change_nick(state: &SharedState, session: &Session, new_nick: &str, announce: bool) {
    let host = state.hostname();
    let old_nick = session.nick();
    if new_nick.is_empty() {
        session.send(Message::from_server(
            host,
            irc::ERR_NONICKNAMEGIVEN,
            vec![&old_nick, "No nickname given"],
        ));
        return;
    }

    let stored = match state.store.user(state.store.local_key()).await {
        Ok(info) => Some(info.name),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            tracing::warn!(session_id = session.id, "Looking up local nick failed: {e}");
            None
        }
    };

    if stored.as_deref() != Some(new_nick) {
        if let Err(e) = state.store.publish_nick(new_nick).await {
            tracing::warn!(session_id = session.id, "Publishing nick failed: {e}");
            session.send(Message::from_server(
                host,
                irc::ERR_NICKNAMEINUSE,
                vec![&old_nick, new_nick, "Nickname is already in use"],
            ));
            return;
        }
    }

    if old_nick == new_nick {
        return;
    }
    if announce {
        session.send(Message::with_prefix(
            &session.hostmask(host),
            "NICK",
            vec![new_nick],
        ));
    }
    session.set_nick(new_nick);
    tracing::info!(session_id = session.id, %old_nick, %new_nick, "Nick changed");
}

// ── Channels ───────────────────────────────────────────────────────────

async fn handle_join(state: &SharedState, session: &Session, channels: &[String]) {
    for raw in channels {
        let channel = irc::strip_channel_marker(raw);
        if channel.is_empty() {
            continue;
        }
        if let Err(e) = join::join(state, session, channel).await {
            tracing::warn!(session_id = session.id, %channel, "Join failed: {e}");
        }
    }
}

/// The log has no leave; PART only updates the session and is always
/// acknowledged.
fn handle_part(state: &SharedState, session: &Session, channels: &[String]) {
    let mask = session.hostmask(state.hostname());
    for raw in channels {
        let channel = irc::strip_channel_marker(raw);
        session.mark_parted(channel);
        let target = irc::channel_target(channel);
        session.send(Message::with_prefix(&mask, "PART", vec![&target]));
    }
}

async fn handle_privmsg(state: &Arc<SharedState>, session: &Arc<Session>, target: &str, text: &str) {
    if !irc::is_channel(target) {
        let nick = session.nick();
        session.send(Message::from_server(
            state.hostname(),
            irc::ERR_NOSUCHNICK,
            vec![&nick, target, "No such nick/channel"],
        ));
        return;
    }
    let channel = irc::strip_channel_marker(target);

    if text.split_whitespace().next() == Some("!recap") {
        let state = Arc::clone(state);
        let session = Arc::clone(session);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let limit = state.config.recap_limit;
            if let Err(e) = recap::recap_channel(&state, &session, &channel, limit).await {
                tracing::warn!(session_id = session.id, %channel, "Recap failed: {e}");
            }
        });
        return;
    }

    let value = if let Some(action) = irc::parse_ctcp_action(text) {
        MessageValue::emote(channel, action)
    } else if irc::is_ctcp(text) {
        tracing::debug!(session_id = session.id, "Ignoring CTCP request");
        return;
    } else {
        MessageValue::text(channel, text)
    };

    if let Err(e) = state.store.publish(value, PublishOptions::default()).await {
        tracing::warn!(session_id = session.id, %channel, "Publish failed: {e}");
    }
}

async fn handle_topic(state: &SharedState, session: &Session, raw: &str, topic: Option<&str>) {
    let channel = irc::strip_channel_marker(raw);
    let Some(text) = topic else {
        match state.store.topic(channel).await {
            Ok(topic) => join::send_topic(state, session, channel, &topic),
            Err(e) if e.is_not_found() => join::send_topic(state, session, channel, ""),
            Err(e) => tracing::warn!(session_id = session.id, %channel, "Topic lookup failed: {e}"),
        }
        return;
    };

    match state.store.publish_channel_topic(channel, text).await {
        Ok(()) => {
            // Own writes are not echoed live, so confirm it directly.
            let target = irc::channel_target(channel);
            session.send(Message::with_prefix(
                &session.hostmask(state.hostname()),
                "TOPIC",
                vec![&target, text],
            ));
        }
        Err(e) => tracing::warn!(session_id = session.id, %channel, "Setting topic failed: {e}"),
    }
}

async fn handle_names(state: &SharedState, session: &Session, channels: &[String]) {
    let channels: Vec<String> = if channels.is_empty() {
        session.joined_channels()
    } else {
        channels
            .iter()
            .map(|c| irc::strip_channel_marker(c).to_string())
            .collect()
    };
    let users = match state.store.users().await {
        Ok(users) => users,
        Err(e) => {
            tracing::warn!(session_id = session.id, "Listing users failed: {e}");
            return;
        }
    };
    for channel in &channels {
        join::send_names(state, session, channel, &users);
    }
}

fn handle_mode(state: &SharedState, session: &Session, target: &str) {
    let host = state.hostname();
    let nick = session.nick();
    if irc::is_channel(target) {
        session.send(Message::from_server(
            host,
            irc::RPL_CHANNELMODEIS,
            vec![&nick, target, "+n"],
        ));
    } else {
        session.send(Message::from_server(host, irc::RPL_UMODEIS, vec![&nick, "+"]));
    }
}

async fn handle_list(state: &SharedState, session: &Session) {
    let host = state.hostname();
    let nick = session.nick();
    session.send(Message::from_server(
        host,
        irc::RPL_LISTSTART,
        vec![&nick, "Channel", "Users  Name"],
    ));

    // Every writer is listed in every channel's names, so each channel
    // reports the size of that same list.
    let members = match state.store.users().await {
        Ok(users) => join::member_names(state, &nick, &users).len(),
        Err(e) => {
            tracing::warn!(session_id = session.id, "Listing users failed: {e}");
            1
        }
    };
    match state.store.channels().await {
        Ok(channels) => {
            for channel in channels.iter().filter(|c| irc::is_valid_channel_name(c)) {
                let topic = state.store.topic(channel).await.unwrap_or_default();
                let target = irc::channel_target(channel);
                let count = members.to_string();
                session.send(Message::from_server(
                    host,
                    irc::RPL_LIST,
                    vec![&nick, &target, &count, &topic],
                ));
            }
        }
        Err(e) => tracing::warn!(session_id = session.id, "Listing channels failed: {e}"),
    }

    session.send(Message::from_server(host, irc::RPL_LISTEND, vec![&nick, "End of /LIST"]));
}

async fn handle_whois(state: &SharedState, session: &Session, target: &str) {
    let host = state.hostname();
    let nick = session.nick();

    let found = if target.eq_ignore_ascii_case(&nick) {
        let identity = session.identity();
        Some((
            identity.nick,
            identity.username,
            state.store.local_key().to_string(),
            identity.realname,
        ))
    } else {
        match state.store.users().await {
            Ok(users) => users
                .into_values()
                .map(|u| (echo::writer_name(&u), u.key))
                .find(|(name, _)| name.eq_ignore_ascii_case(target))
                .map(|(name, key)| (name.clone(), "cabal".to_string(), key, name)),
            Err(e) => {
                tracing::warn!(session_id = session.id, "Listing users failed: {e}");
                None
            }
        }
    };

    let Some((who, user, key, realname)) = found else {
        session.send(Message::from_server(
            host,
            irc::ERR_NOSUCHNICK,
            vec![&nick, target, "No such nick/channel"],
        ));
        return;
    };
    session.send(Message::from_server(
        host,
        irc::RPL_WHOISUSER,
        vec![&nick, &who, &user, &key, "*", &realname],
    ));
    session.send(Message::from_server(
        host,
        irc::RPL_ENDOFWHOIS,
        vec![&nick, &who, "End of /WHOIS list"],
    ));
}

fn handle_cap(state: &SharedState, session: &Session, subcommand: Option<&str>, args: Option<String>) {
    let host = state.hostname();
    match subcommand {
        Some("LS") => session.send(Message::from_server(host, "CAP", vec!["*", "LS", ""])),
        Some("REQ") => {
            let requested = args.unwrap_or_default();
            session.send(Message::from_server(host, "CAP", vec!["*", "NAK", &requested]));
        }
        _ => {}
    }
}
