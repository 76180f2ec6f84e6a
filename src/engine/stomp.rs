// Gisma Link: STOMP 1.2 Frame Codec
//
// Text-only STOMP framing as spoken by the chat server's message broker:
//   COMMAND\n
//   header:value\n
//   ...\n
//   \n
//   body\0
//
// A lone EOL is a heart-beat. Header values are escaped (\\ \n \r \c) on every
// frame except CONNECT / CONNECTED. `content-length`, when present, bounds the
// body; otherwise the body runs to the first NUL.

use crate::atoms::error::{LinkError, LinkResult};
use std::fmt;

// ── Commands ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // client → server
    Connect,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    // server → client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Command> {
        Some(match s {
            // STOMP is the 1.2 alias of CONNECT
            "CONNECT" | "STOMP" => Command::Connect,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        })
    }

    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Frame ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Frame { command, headers: Vec::new(), body: String::new() }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header named `name` (repeated headers: first wins).
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    // ── Client frames ──────────────────────────────────────────────────

    pub fn connect(host: &str, heartbeat: (u64, u64)) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(body)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    // ── Server frames (used by loopback servers and tests) ─────────────

    pub fn connected(heartbeat: (u64, u64)) -> Self {
        Frame::new(Command::Connected)
            .header("version", "1.2")
            .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
    }

    pub fn message(subscription: &str, destination: &str, body: impl Into<String>) -> Self {
        Frame::new(Command::Message)
            .header("subscription", subscription)
            .header("destination", destination)
            .header("message-id", uuid::Uuid::new_v4().to_string())
            .body(body)
    }

    pub fn error(message: &str) -> Self {
        Frame::new(Command::Error).header("message", message)
    }

    // ── Encoding ───────────────────────────────────────────────────────

    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        let escape = self.command.escapes_headers();
        for (k, v) in &self.headers {
            if escape {
                out.push_str(&escape_header(k));
                out.push(':');
                out.push_str(&escape_header(v));
            } else {
                out.push_str(k);
                out.push(':');
                out.push_str(v);
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

// ── Decoding ───────────────────────────────────────────────────────────

/// Parse every frame contained in one transport message.
/// Heart-beat EOLs between or around frames are skipped; a message that is
/// nothing but heart-beats yields an empty vector.
pub fn parse_frames(raw: &str) -> LinkResult<Vec<Frame>> {
    let mut frames = Vec::new();
    let mut rest = raw;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            break;
        }
        let (frame, consumed) = parse_one(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
    Ok(frames)
}

fn parse_one(input: &str) -> LinkResult<(Frame, usize)> {
    let mut pos = 0;

    let command_line = read_line(input, &mut pos)
        .ok_or_else(|| LinkError::protocol("Truncated frame: missing command"))?;
    let command = Command::parse(command_line)
        .ok_or_else(|| LinkError::protocol(format!("Unknown STOMP command '{}'", command_line)))?;

    let mut headers = Vec::new();
    loop {
        let line = read_line(input, &mut pos)
            .ok_or_else(|| LinkError::protocol("Truncated frame: unterminated headers"))?;
        if line.is_empty() {
            break;
        }
        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| LinkError::protocol(format!("Malformed header line '{}'", line)))?;
        if command.escapes_headers() {
            headers.push((unescape_header(k)?, unescape_header(v)?));
        } else {
            headers.push((k.to_string(), v.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| LinkError::protocol(format!("Bad content-length '{}'", v)))
        })
        .transpose()?;

    let remaining = &input[pos..];
    let body_len = match content_length {
        Some(n) => {
            if n >= remaining.len() || !remaining.is_char_boundary(n) {
                return Err(LinkError::protocol("Body shorter than content-length"));
            }
            if remaining.as_bytes()[n] != 0 {
                return Err(LinkError::protocol("Missing NUL after body"));
            }
            n
        }
        None => remaining
            .find('\0')
            .ok_or_else(|| LinkError::protocol("Missing NUL terminator"))?,
    };

    let body = remaining[..body_len].to_string();
    let consumed = pos + body_len + 1;
    Ok((Frame { command, headers, body }, consumed))
}

/// Read one EOL-terminated line starting at `*pos`, accepting `\n` or `\r\n`.
fn read_line<'a>(input: &'a str, pos: &mut usize) -> Option<&'a str> {
    let rest = &input[*pos..];
    let end = rest.find('\n')?;
    *pos += end + 1;
    Some(rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]))
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> LinkResult<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(LinkError::protocol(format!(
                    "Undefined header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

// ── Heart-beating ──────────────────────────────────────────────────────

/// Parse a `heart-beat:cx,cy` header value.
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (a, b) = value.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

/// Negotiate `(outgoing, incoming)` intervals in milliseconds from the
/// client's requested `(cx, cy)` and the server's advertised `(sx, sy)`.
/// Zero disables that direction.
pub fn negotiate_heartbeat(client: (u64, u64), server: (u64, u64)) -> (u64, u64) {
    let (cx, cy) = client;
    let (sx, sy) = server;
    let outgoing = if cx == 0 || sy == 0 { 0 } else { cx.max(sy) };
    let incoming = if cy == 0 || sx == 0 { 0 } else { cy.max(sx) };
    (outgoing, incoming)
}
