use std::collections::BTreeMap;

pub const CMD_PASS: &str = "PASS";
pub const CMD_NICK: &str = "NICK";
pub const CMD_JOIN: &str = "JOIN";
pub const CMD_PING: &str = "PING";
pub const CMD_PRIVMSG: &str = "PRIVMSG";
pub const CMD_NOTICE: &str = "NOTICE";

pub const PONG_REPLY: &str = "PONG :tmi.twitch.tv";
pub const TWITCH_CAPABILITIES: &str = "CAP REQ :twitch.tv/tags twitch.tv/commands";

pub const AUTH_ERROR_LOGIN_FAILED: &str = "Login authentication failed";
pub const AUTH_ERROR_IMPROPERLY_FORMATTED: &str = "Improperly formatted auth";

const PRIVMSG_SEPARATOR: &str = " PRIVMSG ";
const TRAILING_SEPARATOR: &str = " :";

/// A chat message split out of a raw `PRIVMSG` line. Borrows from the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivMsg<'a> {
    pub tags: Option<&'a str>,
    pub channel: &'a str,
    pub user: &'a str,
    pub message: &'a str,
}

impl<'a> PrivMsg<'a> {
    pub fn get_tag_value(&self, key_to_find: &str) -> Option<&'a str> {
        self.tags.and_then(|tags_str| {
            tags_str.split(';').find_map(|component| {
                let mut parts = component.splitn(2, '=');
                let key = parts.next()?;
                if key == key_to_find {
                    parts.next().or(Some(""))
                } else {
                    None
                }
            })
        })
    }

    /// All tags as an owned map; empty when the line carried none.
    pub fn tag_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if let Some(tags_str) = self.tags {
            for component in tags_str.split(';').filter(|c| !c.is_empty()) {
                let mut parts = component.splitn(2, '=');
                if let Some(key) = parts.next() {
                    map.insert(key.to_string(), parts.next().unwrap_or("").to_string());
                }
            }
        }
        map
    }

    /// Numeric sender id, only present on tagged lines.
    pub fn user_id(&self) -> Option<&'a str> {
        self.get_tag_value("user-id").filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcLine<'a> {
    Ping,
    PrivMsg(PrivMsg<'a>),
    /// Anything else. `diagnostic` is set when the line looked like a
    /// `PRIVMSG` but could not be split.
    Other { diagnostic: Option<&'static str> },
}

impl<'a> IrcLine<'a> {
    /// Classifies one protocol line. Never fails: unknown or malformed
    /// lines come back as `Other`.
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.starts_with(CMD_PING) {
            return IrcLine::Ping;
        }

        let (tags, body) = split_tags(line);

        let Some((prefix, rest)) = body.split_once(PRIVMSG_SEPARATOR) else {
            return IrcLine::Other { diagnostic: None };
        };

        let user = prefix
            .split('!')
            .next()
            .unwrap_or_default()
            .trim_start_matches(':');

        let Some((target, message)) = rest.split_once(TRAILING_SEPARATOR) else {
            return IrcLine::Other {
                diagnostic: Some("PRIVMSG without trailing message"),
            };
        };
        let channel = target.trim_start_matches('#');

        if user.is_empty() {
            return IrcLine::Other {
                diagnostic: Some("PRIVMSG without sender"),
            };
        }
        if channel.is_empty() {
            return IrcLine::Other {
                diagnostic: Some("PRIVMSG without channel"),
            };
        }

        IrcLine::PrivMsg(PrivMsg {
            tags,
            channel,
            user,
            message,
        })
    }
}

fn split_tags(line: &str) -> (Option<&str>, &str) {
    match line.strip_prefix('@') {
        Some(tagged) => match tagged.split_once(' ') {
            Some((tags, body)) => (Some(tags), body),
            None => (Some(tagged), ""),
        },
        None => (None, line),
    }
}

/// True for the NOTICE Twitch sends right before dropping a login with a bad token.
pub fn is_auth_failure_notice(line: &str) -> bool {
    let (_, body) = split_tags(line.trim_end_matches(['\r', '\n']));
    let mut words = body.split_whitespace();
    let command = match words.next() {
        Some(prefix) if prefix.starts_with(':') => words.next(),
        first => first,
    };
    command == Some(CMD_NOTICE)
        && (body.contains(AUTH_ERROR_LOGIN_FAILED) || body.contains(AUTH_ERROR_IMPROPERLY_FORMATTED))
}
