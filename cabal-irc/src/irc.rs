//! IRC message parsing and formatting.
//!
//! Implements the subset of RFC 1459 / RFC 2812 line format the gateway
//! speaks, plus the CTCP ACTION envelope used for emotes.

use std::borrow::Cow;
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional message prefix (server or user origin).
    pub prefix: Option<String>,
    /// The IRC command (e.g. "NICK", "PRIVMSG", "001"). Empty for a
    /// prefix-only line.
    pub command: String,
    /// Command parameters.
    pub params: Vec<String>,
}

/// Commands whose last parameter is free text and always goes out as a
/// trailing parameter.
const TEXT_COMMANDS: &[&str] = &["PRIVMSG", "NOTICE", "TOPIC", "NICK", "QUIT", "PONG"];

impl Message {
    /// Parse a raw IRC line into a Message.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let mut rest = line;

        // IRCv3 tags are not negotiated; skip them if a client sends some anyway.
        if rest.starts_with('@') {
            let end = rest.find(' ')?;
            rest = rest[end + 1..].trim_start();
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            match stripped.find(' ') {
                Some(end) => {
                    let pfx = stripped[..end].to_string();
                    rest = stripped[end + 1..].trim_start();
                    Some(pfx)
                }
                None => {
                    return Some(Message {
                        prefix: Some(stripped.to_string()),
                        command: String::new(),
                        params: Vec::new(),
                    });
                }
            }
        } else {
            None
        };

        let mut params = Vec::new();
        let command;

        if let Some(space) = rest.find(' ') {
            command = rest[..space].to_ascii_uppercase();
            rest = &rest[space + 1..];

            while !rest.is_empty() {
                if let Some(trailing) = rest.strip_prefix(':') {
                    params.push(trailing.to_string());
                    break;
                }
                if let Some(space) = rest.find(' ') {
                    if space > 0 {
                        params.push(rest[..space].to_string());
                    }
                    rest = &rest[space + 1..];
                } else {
                    params.push(rest.to_string());
                    break;
                }
            }
        } else {
            command = rest.to_ascii_uppercase();
        }

        Some(Message {
            prefix,
            command,
            params,
        })
    }

    /// Create a new message with the given prefix.
    pub fn with_prefix(prefix: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            prefix: Some(prefix.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a new message with a server prefix.
    pub fn from_server(server: &str, command: &str, params: Vec<&str>) -> Self {
        Self::with_prefix(server, command, params)
    }

    fn text_command(&self) -> bool {
        TEXT_COMMANDS.contains(&self.command.as_str())
    }
}

/// Replace the characters that would end or truncate a line on the wire.
fn one_line(s: &str) -> Cow<'_, str> {
    if s.contains(['\r', '\n', '\0']) {
        Cow::Owned(s.replace(['\r', '\n', '\0'], " "))
    } else {
        Cow::Borrowed(s)
    }
}

impl fmt::Display for Message {
    /// Always renders exactly one line: CR, LF and NUL inside the prefix or
    /// any parameter are written as spaces.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{} ", one_line(prefix))?;
        }
        write!(f, "{}", one_line(&self.command))?;
        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            let param = one_line(param);
            let trailing = i == last
                && (self.text_command()
                    || param.contains(' ')
                    || param.starts_with(':')
                    || param.is_empty());
            if trailing {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Wrap text in a CTCP ACTION envelope.
pub fn ctcp_action(text: &str) -> String {
    format!("\x01ACTION {text}\x01")
}

/// Body of a CTCP ACTION, if `text` is one.
pub fn parse_ctcp_action(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\x01')?;
    let inner = inner.strip_suffix('\x01').unwrap_or(inner);
    inner
        .strip_prefix("ACTION ")
        .or_else(|| (inner == "ACTION").then_some(""))
}

/// True for any CTCP-framed text.
pub fn is_ctcp(text: &str) -> bool {
    text.starts_with('\x01')
}

/// True if `target` names a channel.
pub fn is_channel(target: &str) -> bool {
    target.starts_with('#') || target.starts_with('&')
}

/// Drop the leading channel marker. Log channels carry bare names.
pub fn strip_channel_marker(target: &str) -> &str {
    target
        .strip_prefix('#')
        .or_else(|| target.strip_prefix('&'))
        .unwrap_or(target)
}

/// True if a log channel name can be sent as a single IRC parameter.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(|c| c.is_whitespace() || c.is_control() || c == ',')
}

/// IRC form of a log channel name.
pub fn channel_target(name: &str) -> String {
    format!("#{name}")
}

pub const RPL_WELCOME: &str = "001";
pub const RPL_UMODEIS: &str = "221";

// WHOIS numerics
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_ENDOFWHOIS: &str = "318";

// LIST numerics
pub const RPL_LISTSTART: &str = "321";
pub const RPL_LIST: &str = "322";
pub const RPL_LISTEND: &str = "323";

// Channel numerics
pub const RPL_CHANNELMODEIS: &str = "324";
pub const RPL_NOTOPIC: &str = "331";
pub const RPL_TOPIC: &str = "332";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

// MOTD numerics
pub const RPL_MOTD: &str = "372";
pub const RPL_MOTDSTART: &str = "375";
pub const RPL_ENDOFMOTD: &str = "376";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_UNKNOWNCOMMAND: &str = "421";
pub const ERR_NONICKNAMEGIVEN: &str = "431";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const ERR_NEEDMOREPARAMS: &str = "461";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_command() {
        let msg = Message::parse("NICK alice\r\n").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["alice"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_user_with_trailing() {
        let msg = Message::parse("user alice 0 * :Alice Liddell").unwrap();
        assert_eq!(msg.command, "USER");
        assert_eq!(msg.params, vec!["alice", "0", "*", "Alice Liddell"]);
    }

    #[test]
    fn parse_with_prefix_and_tags() {
        let msg = Message::parse("@time=now :alice!~a@host PRIVMSG #chan :hello world").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("alice!~a@host"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello world"]);
    }

    #[test]
    fn parse_prefix_only_line() {
        let msg = Message::parse(":disconnect").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("disconnect"));
        assert!(msg.command.is_empty());
        assert!(msg.params.is_empty());
    }

    #[test]
    fn blank_line_is_none() {
        assert!(Message::parse("\r\n").is_none());
    }

    #[test]
    fn numeric_formatting() {
        let msg = Message::from_server("irc.example", RPL_WELCOME, vec!["alice", "Welcome to IRC"]);
        assert_eq!(msg.to_string(), ":irc.example 001 alice :Welcome to IRC");

        let mode = Message::from_server("irc.example", "MODE", vec!["#chan", "+v", "alice"]);
        assert_eq!(mode.to_string(), ":irc.example MODE #chan +v alice");
    }

    #[test]
    fn text_commands_always_trail() {
        let msg = Message::with_prefix("bob!cabal@bb", "PRIVMSG", vec!["#general", "hello"]);
        assert_eq!(msg.to_string(), ":bob!cabal@bb PRIVMSG #general :hello");
    }

    #[test]
    fn embedded_line_breaks_stay_on_one_line() {
        let msg = Message::with_prefix(
            "bob!cabal@bb",
            "PRIVMSG",
            vec!["#general", "hi\r\n:127.0.0.1 KILL alice :spoofed\0"],
        );
        let line = msg.to_string();
        assert!(!line.contains(['\r', '\n', '\0']));
        assert_eq!(line, ":bob!cabal@bb PRIVMSG #general :hi  :127.0.0.1 KILL alice :spoofed ");

        // A lone parameter that only gains a space after cleaning still trails.
        let mode = Message::from_server("gw", "MODE", vec!["#a", "x\ny"]);
        assert_eq!(mode.to_string(), ":gw MODE #a :x y");
    }

    #[test]
    fn channel_name_validity() {
        assert!(is_valid_channel_name("general"));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("foo bar"));
        assert!(!is_valid_channel_name("a\r\nb"));
        assert!(!is_valid_channel_name("a,b"));
    }

    #[test]
    fn ctcp_action_envelope() {
        let wrapped = ctcp_action("waves");
        assert_eq!(wrapped, "\x01ACTION waves\x01");
        assert_eq!(parse_ctcp_action(&wrapped), Some("waves"));
        assert_eq!(parse_ctcp_action("\x01ACTION dances"), Some("dances"));
        assert_eq!(parse_ctcp_action("\x01VERSION\x01"), None);
        assert_eq!(parse_ctcp_action("plain"), None);
    }

    #[test]
    fn channel_markers() {
        assert!(is_channel("#general"));
        assert!(!is_channel("alice"));
        assert_eq!(strip_channel_marker("#general"), "general");
        assert_eq!(strip_channel_marker("&local"), "local");
        assert_eq!(strip_channel_marker("bare"), "bare");
        assert_eq!(channel_target("general"), "#general");
    }
}
