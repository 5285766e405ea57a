//! Minimal STOMP 1.2 frame codec for the room topic channel.
//!
//! Only what a subscribing client needs: `CONNECT`, `SUBSCRIBE`,
//! `UNSUBSCRIBE`, `DISCONNECT` outbound; `CONNECTED`, `MESSAGE`, `RECEIPT`,
//! `ERROR` and heart-beat EOLs inbound.

use std::time::Duration;

use crate::error::TransportError;

pub const ACCEPT_VERSION: &str = "1.2";
pub const HEARTBEAT_FRAME: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    // CONNECT and CONNECTED headers are never escaped, for 1.0 compatibility.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value for `name`; repeated headers keep the first occurrence.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, bearer_token: Option<&str>, heartbeat: HeartbeatOffer) -> Self {
        let frame = Self::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", heartbeat.header_value());
        match bearer_token {
            Some(token) => frame.header("Authorization", format!("Bearer {token}")),
            None => frame,
        }
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).header("receipt", receipt)
    }

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        let escape = self.command.escapes_headers();
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Something read off the wire: a frame or a bare heart-beat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Heartbeat,
    Frame(Frame),
}

/// Decodes every frame in one transport message. Leading EOLs are heart-beats
/// and collapse into a single [`Incoming::Heartbeat`].
pub fn decode(text: &str) -> Result<Vec<Incoming>, TransportError> {
    let mut out = Vec::new();
    let mut rest = text;
    loop {
        let trimmed = rest.trim_start_matches(['\r', '\n']);
        if trimmed.len() != rest.len() && out.last() != Some(&Incoming::Heartbeat) {
            out.push(Incoming::Heartbeat);
        }
        rest = trimmed;
        if rest.is_empty() {
            return Ok(out);
        }
        let (frame, remaining) = decode_frame(rest)?;
        out.push(Incoming::Frame(frame));
        rest = remaining;
    }
}

fn decode_frame(text: &str) -> Result<(Frame, &str), TransportError> {
    let (command_line, mut rest) = split_line(text)
        .ok_or_else(|| TransportError::Frame("frame ends before command line".into()))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| TransportError::Frame(format!("unknown command '{command_line}'")))?;

    let mut headers = Vec::new();
    loop {
        let (line, next) = split_line(rest)
            .ok_or_else(|| TransportError::Frame("frame ends inside headers".into()))?;
        rest = next;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| TransportError::Frame(format!("header without ':' in '{line}'")))?;
        if command.escapes_headers() {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(name, _)| name == "content-length")
        .map(|(_, value)| value.trim().parse::<usize>())
        .transpose()
        .map_err(|err| TransportError::Frame(format!("invalid content-length: {err}")))?;

    let body_end = match content_length {
        Some(len) => {
            if rest.as_bytes().get(len) != Some(&0) || !rest.is_char_boundary(len) {
                return Err(TransportError::Frame(
                    "content-length does not end at a NUL octet".into(),
                ));
            }
            len
        }
        None => rest
            .find('\0')
            .ok_or_else(|| TransportError::Frame("missing NUL terminator".into()))?,
    };

    let frame = Frame {
        command,
        headers,
        body: rest[..body_end].to_string(),
    };
    Ok((frame, &rest[body_end + 1..]))
}

fn split_line(text: &str) -> Option<(&str, &str)> {
    let idx = text.find('\n')?;
    let line = text[..idx].strip_suffix('\r').unwrap_or(&text[..idx]);
    Some((line, &text[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, TransportError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(TransportError::Frame(format!(
                    "invalid header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Client side of the `heart-beat` header: `outgoing,incoming` in ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatOffer {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl HeartbeatOffer {
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Combines the offer with the server's `heart-beat` header. A zero on
    /// either side disables that direction; otherwise the larger value wins.
    pub fn negotiate(&self, server_header: Option<&str>) -> NegotiatedHeartbeat {
        let (server_outgoing, server_incoming) = server_header
            .and_then(|value| value.split_once(','))
            .and_then(|(sx, sy)| Some((sx.trim().parse::<u64>().ok()?, sy.trim().parse::<u64>().ok()?)))
            .unwrap_or((0, 0));

        let pick = |ours: Duration, theirs: u64| {
            if ours.is_zero() || theirs == 0 {
                None
            } else {
                Some(ours.max(Duration::from_millis(theirs)))
            }
        };

        NegotiatedHeartbeat {
            outgoing: pick(self.outgoing, server_incoming),
            incoming: pick(self.incoming, server_outgoing),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedHeartbeat {
    pub outgoing: Option<Duration>,
    pub incoming: Option<Duration>,
}

impl NegotiatedHeartbeat {
    /// Silence tolerated before the server is considered gone.
    pub fn incoming_deadline(&self) -> Option<Duration> {
        self.incoming.map(|interval| interval * 2)
    }
}

#[cfg(test)]
#[path = "tests/stomp_tests.rs"]
mod tests;
