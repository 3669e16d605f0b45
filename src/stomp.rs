//! STOMP 1.2 text frames, as spoken by the server's message broker over
//! its raw WebSocket endpoint.

use crate::{
    consts::STOMP_ACCEPT_VERSION,
    error::{LiveError, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            "DISCONNECT" => Self::Disconnect,
            _ => return None,
        })
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Stomp | Self::Connected)
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

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header repeats.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn connect(host: &str, heartbeat_ms: u64) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", STOMP_ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},0"))
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

    pub fn send_json(destination: &str, body: impl Into<String>) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(body)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Human-readable reason carried by an ERROR frame.
    pub fn error_message(&self) -> String {
        match self.get("message") {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => self.body.trim().to_string(),
        }
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
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

    /// Decode one frame. `Ok(None)` is a heart-beat.
    pub fn decode(input: &str) -> Result<Option<Self>> {
        let text = input.trim_start_matches(|c| c == '\r' || c == '\n');
        if text.is_empty() || text == "\0" {
            return Ok(None);
        }

        let mut remaining = text;
        let mut lines = Vec::new();
        loop {
            let (line, tail) = remaining
                .split_once('\n')
                .ok_or_else(|| LiveError::Frame("missing header terminator".to_string()))?;
            remaining = tail;
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }

        let (command_line, header_lines) = lines
            .split_first()
            .ok_or_else(|| LiveError::Frame("missing command".to_string()))?;
        let command = Command::parse(command_line)
            .ok_or_else(|| LiveError::Frame(format!("unknown command {command_line:?}")))?;

        let escape = command.escapes_headers();
        let mut headers = Vec::with_capacity(header_lines.len());
        for line in header_lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| LiveError::Frame(format!("header without colon {line:?}")))?;
            if escape {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let mut frame = Self {
            command,
            headers,
            body: String::new(),
        };
        let declared_length = frame
            .get("content-length")
            .map(|value| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| LiveError::Frame(format!("bad content-length {value:?}")))
            })
            .transpose()?;
        frame.body = match declared_length {
            Some(length) => remaining
                .get(..length)
                .ok_or_else(|| LiveError::Frame("body shorter than content-length".to_string()))?
                .to_string(),
            None => {
                let end = remaining
                    .find('\0')
                    .ok_or_else(|| LiveError::Frame("unterminated frame".to_string()))?;
                remaining[..end].to_string()
            }
        };
        Ok(Some(frame))
    }
}

/// A single EOL keeps the broker's heart-beat expectations satisfied.
pub const HEARTBEAT: &str = "\n";

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
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

fn unescape_header(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
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
                return Err(LiveError::Frame(format!(
                    "invalid header escape {:?}",
                    other.map(|c| format!("\\{c}")).unwrap_or_else(|| "\\".into())
                )))
            }
        }
    }
    Ok(out)
}
