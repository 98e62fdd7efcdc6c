// SPDX-License-Identifier: Apache-2.0

//! The line-based wire format and its `Message` in-memory representation.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A parsed or to-be-serialized message. Parameters are always stored as
/// their wire-form strings; [`Message::get_integer`]/[`get_address`]/
/// [`get_timespec`] parse on demand: string-valued on the wire, typed in
/// memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub sent_from_server: Option<String>,
    pub sent_from_service: Option<String>,
    pub sent_to_server: Option<String>,
    pub sent_to_service: Option<String>,
    pub command: String,
    pub parameters: BTreeMap<String, String>,
    pub processed: bool,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Message {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    pub fn get_integer(&self, name: &str) -> Result<i64> {
        let raw = self
            .get_string(name)
            .ok_or_else(|| Error::protocol(format!("missing parameter {name}")))?;
        raw.parse::<i64>()
            .map_err(|e| Error::protocol(format!("parameter {name} is not an integer: {e}")))
    }

    /// Address parsing itself is an external collaborator; here we only
    /// validate the minimal `ip[:port]` shape and hand back the raw string
    /// for the caller's address library to resolve.
    pub fn get_address(&self, name: &str) -> Result<&str> {
        let raw = self
            .get_string(name)
            .ok_or_else(|| Error::protocol(format!("missing parameter {name}")))?;
        if raw.is_empty() {
            return Err(Error::protocol(format!("parameter {name} is an empty address")));
        }
        Ok(raw)
    }

    pub fn get_timespec(&self, name: &str) -> Result<i64> {
        self.get_integer(name)
    }

    /// Serializes to a single `\n`-terminated wire line. Parameters are
    /// emitted in lexicographic name order so canonical messages satisfy
    /// the round-trip law `parse(serialize(m)) == m`.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let has_routing = self.sent_from_server.is_some()
            || self.sent_from_service.is_some()
            || self.sent_to_server.is_some()
            || self.sent_to_service.is_some();
        if has_routing {
            out.push_str(self.sent_from_server.as_deref().unwrap_or(""));
            out.push(':');
            out.push_str(self.sent_from_service.as_deref().unwrap_or(""));
            out.push('/');
            out.push_str(self.sent_to_server.as_deref().unwrap_or(""));
            out.push(':');
            out.push_str(self.sent_to_service.as_deref().unwrap_or(""));
            out.push(' ');
        }
        out.push_str(&self.command);
        for (name, value) in &self.parameters {
            out.push(' ');
            out.push_str(name);
            out.push('=');
            out.push_str(&quote_value(value));
        }
        out.push('\n');
        out
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '\\')
}

fn quote_value(value: &str) -> String {
    if !needs_quoting(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Parses a single wire line (without its trailing `\n`, though a
/// trailing `\n`/`\r\n` is tolerated and stripped).
pub fn parse(line: &str) -> Result<Message> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    let tokens = tokenize(line)?;
    let mut iter = tokens.into_iter();

    let first = iter
        .next()
        .ok_or_else(|| Error::protocol("empty message line"))?;

    let (routing, command) = if is_routing_header(&first) {
        let command = iter
            .next()
            .ok_or_else(|| Error::protocol("message has a routing header but no command"))?;
        (Some(first), command)
    } else {
        (None, first)
    };

    if !is_identifier(&command) {
        return Err(Error::protocol(format!("invalid command {command:?}")));
    }

    let mut message = Message::new(command);
    if let Some(routing) = routing {
        parse_routing(&routing, &mut message)?;
    }

    for token in iter {
        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| Error::protocol(format!("parameter {token:?} is missing '='")))?;
        let canonical = name.replace('-', "_");
        if !is_identifier(&canonical) {
            return Err(Error::protocol(format!("invalid parameter name {name:?}")));
        }
        message.parameters.insert(canonical, value.to_string());
    }

    Ok(message)
}

fn is_routing_header(token: &str) -> bool {
    token.contains('/') && token.contains(':')
}

fn parse_routing(token: &str, message: &mut Message) -> Result<()> {
    let (from, to) = token
        .split_once('/')
        .ok_or_else(|| Error::protocol("malformed routing header"))?;
    let (from_server, from_service) = from
        .split_once(':')
        .ok_or_else(|| Error::protocol("malformed routing header"))?;
    let (to_server, to_service) = to
        .split_once(':')
        .ok_or_else(|| Error::protocol("malformed routing header"))?;
    message.sent_from_server = none_if_empty(from_server);
    message.sent_from_service = none_if_empty(from_service);
    message.sent_to_server = none_if_empty(to_server);
    message.sent_to_service = none_if_empty(to_service);
    Ok(())
}

fn none_if_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Splits a line on unquoted whitespace, honoring `'`/`"` quoting and the
/// escape set `\\ \" \' \a \b \f \n \r \t \v`.
fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '"' || c == '\'' {
            let quote = c;
            chars.next();
            loop {
                match chars.next() {
                    None => return Err(Error::protocol("unterminated quoted value")),
                    Some(c) if c == quote => break,
                    Some('\\') => {
                        let escaped = chars
                            .next()
                            .ok_or_else(|| Error::protocol("dangling escape at end of line"))?;
                        token.push(unescape(escaped));
                    }
                    Some(c) => token.push(c),
                }
            }
        } else {
            loop {
                match chars.peek() {
                    None => break,
                    Some(c) if c.is_whitespace() => break,
                    Some('\\') => {
                        chars.next();
                        let escaped = chars
                            .next()
                            .ok_or_else(|| Error::protocol("dangling escape at end of line"))?;
                        token.push(unescape(escaped));
                    }
                    Some(&c) => {
                        token.push(c);
                        chars.next();
                    }
                }
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

fn unescape(c: char) -> char {
    match c {
        'a' => '\u{07}',
        'b' => '\u{08}',
        'f' => '\u{0C}',
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        'v' => '\u{0B}',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_canonical_message() {
        let mut m = Message::new("ECHO");
        m.set("who", "alice");
        m.set("count", "3");
        let wire = m.serialize();
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn round_trip_with_routing() {
        let mut m = Message::new("PING");
        m.sent_from_server = Some("srvA".into());
        m.sent_from_service = Some("svcA".into());
        m.sent_to_server = Some("srvB".into());
        m.sent_to_service = Some("svcB".into());
        m.set("who", "alice");
        let wire = m.serialize();
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn round_trip_quoted_value_with_space() {
        let mut m = Message::new("LOGIN");
        m.set("user", "bob smith");
        let wire = m.serialize();
        let parsed = parse(&wire).unwrap();
        assert_eq!(parsed.get_string("user"), Some("bob smith"));
    }

    #[test]
    fn dash_in_parameter_name_is_canonicalized() {
        let parsed = parse("LOGIN user-name=bob\n").unwrap();
        assert_eq!(parsed.get_string("user_name"), Some("bob"));
    }

    #[test]
    fn malformed_line_rejected() {
        assert!(parse("").is_err());
        assert!(parse("not_an_=ident entifier=x\n").is_err());
        assert!(parse("COMMAND badparam\n").is_err());
    }

    #[test]
    fn simple_echo_scenario() {
        let parsed = parse("PING who=alice\n").unwrap();
        assert_eq!(parsed.command, "PING");
        assert_eq!(parsed.get_string("who"), Some("alice"));
    }
}
