//! Decoded client commands.
//!
//! Every line the client sends maps onto one [`Command`] variant. Anything
//! the gateway does not handle lands in [`Command::Unknown`] so the
//! dispatcher can answer it without failing.

use crate::irc::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Nick(String),
    User { username: String, realname: String },
    Ping(String),
    Pong,
    Part(Vec<String>),
    Privmsg { target: String, text: String },
    Whois(String),
    Mode(String),
    List,
    Cap(Option<String>, Option<String>),
    Join(Vec<String>),
    Topic { channel: String, topic: Option<String> },
    Names(Vec<String>),
    Quit,
    /// Non-standard quit signal some clients send as a bare pseudo-parameter.
    Disconnect,
    /// A known command missing required parameters.
    NeedMoreParams(String),
    Unknown(String),
}

fn split_list(param: &str) -> Vec<String> {
    param
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Command {
    pub fn from_message(msg: &Message) -> Command {
        let param = |i: usize| msg.params.get(i).cloned();
        let missing = || Command::NeedMoreParams(msg.command.clone());

        match msg.command.as_str() {
            "" => {
                let pseudo = msg.prefix.as_deref().or(msg.params.first().map(|s| s.as_str()));
                if pseudo.is_some_and(|p| p.eq_ignore_ascii_case("disconnect")) {
                    Command::Disconnect
                } else {
                    Command::Unknown(String::new())
                }
            }
            "DISCONNECT" => Command::Disconnect,
            "NICK" => param(0).map(Command::Nick).unwrap_or_else(missing),
            "USER" => {
                if msg.params.len() >= 4 {
                    Command::User {
                        username: msg.params[0].clone(),
                        realname: msg.params[3].clone(),
                    }
                } else {
                    missing()
                }
            }
            "PING" => Command::Ping(param(0).unwrap_or_default()),
            "PONG" => Command::Pong,
            "PART" => param(0).map(|p| Command::Part(split_list(&p))).unwrap_or_else(missing),
            "PRIVMSG" => match (param(0), param(1)) {
                (Some(target), Some(text)) => Command::Privmsg { target, text },
                _ => missing(),
            },
            "WHOIS" => {
                // WHOIS [server] nick
                msg.params.last().cloned().map(Command::Whois).unwrap_or_else(missing)
            }
            "MODE" => param(0).map(Command::Mode).unwrap_or_else(missing),
            "LIST" => Command::List,
            "CAP" => Command::Cap(param(0).map(|s| s.to_ascii_uppercase()), param(1)),
            "JOIN" => param(0).map(|p| Command::Join(split_list(&p))).unwrap_or_else(missing),
            "TOPIC" => match param(0) {
                Some(channel) => Command::Topic {
                    channel,
                    topic: param(1),
                },
                None => missing(),
            },
            "NAMES" => Command::Names(param(0).map(|p| split_list(&p)).unwrap_or_default()),
            "QUIT" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }

    /// Commands that take effect before registration completes. Everything
    /// else is ignored until the client has sent USER.
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            Command::Nick(_)
                | Command::User { .. }
                | Command::Ping(_)
                | Command::Pong
                | Command::Cap(..)
                | Command::Quit
                | Command::Disconnect
                | Command::NeedMoreParams(_)
        )
    }
}
