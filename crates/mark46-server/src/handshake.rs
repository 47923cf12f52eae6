use crate::error::ServerError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use mark46_common::types::SERVER_TAG;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// GUID mixed into the accept key (RFC 6455 §4.2.2).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the HTTP request head.
const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Parsed request line and headers of the upgrade request.
#[derive(Debug)]
pub struct RequestHead {
    /// HTTP method.
    pub method: String,
    /// Request target.
    pub target: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn parse(text: &str) -> Result<Self, &'static str> {
        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or("empty request")?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or("malformed request line")?.to_string();
        let target = parts.next().ok_or("malformed request line")?.to_string();
        if !parts.next().is_some_and(|v| v.starts_with("HTTP/")) {
            return Err("malformed request line");
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or("malformed header line")?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
        Ok(Self {
            method,
            target,
            headers,
        })
    }
}

/// The validated pieces of an acceptable upgrade request.
#[derive(Debug, PartialEq)]
pub struct UpgradeRequest {
    /// The client's `Sec-WebSocket-Key`.
    pub key: String,
    /// Requested subprotocol, echoed back verbatim when present.
    pub protocol: Option<String>,
}

/// Reads the HTTP request head off a fresh connection.
///
/// Returns the parsed head plus any bytes the client sent past the blank
/// line; those must be fed to the frame receiver before new transport reads.
///
/// # Errors
///
/// Fails when the connection closes early, the head exceeds 8 KiB, or the
/// head is not parseable HTTP.
pub async fn read_head(stream: &mut TcpStream) -> Result<(RequestHead, Bytes), ServerError> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let text = std::str::from_utf8(&buf[..end])
                .map_err(|_| ServerError::Handshake("request head is not valid UTF-8"))?;
            let head = RequestHead::parse(text).map_err(ServerError::Handshake)?;
            let leftover = Bytes::copy_from_slice(&buf[end + 4..]);
            return Ok((head, leftover));
        }
        if buf.len() >= MAX_HEAD_BYTES {
            return Err(ServerError::Handshake("request head too large"));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(ServerError::Handshake("connection closed before request head"));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Validates the upgrade request per the acceptance rules: GET method,
/// `Upgrade: websocket`, version 8 or 13, and a well-formed key.
///
/// # Errors
///
/// Returns a short description of the first failed check.
pub fn validate_upgrade(head: &RequestHead) -> Result<UpgradeRequest, &'static str> {
    if head.method != "GET" {
        return Err("method must be GET");
    }

    let upgrade = head.header("upgrade").ok_or("missing Upgrade header")?;
    if !upgrade.trim().eq_ignore_ascii_case("websocket") {
        return Err("Upgrade header must be websocket");
    }

    let version = head
        .header("sec-websocket-version")
        .ok_or("missing Sec-WebSocket-Version header")?;
    if !matches!(version.trim(), "8" | "13") {
        return Err("unsupported Sec-WebSocket-Version");
    }

    let key = head
        .header("sec-websocket-key")
        .ok_or("missing Sec-WebSocket-Key header")?;
    if !valid_key(key) {
        return Err("malformed Sec-WebSocket-Key");
    }

    Ok(UpgradeRequest {
        key: key.to_string(),
        protocol: head.header("sec-websocket-protocol").map(str::to_string),
    })
}

/// True when `key` matches `^[+/0-9A-Za-z]{22}==$`.
#[must_use]
pub fn valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes[22] == b'='
        && bytes[23] == b'='
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

/// Computes the `Sec-WebSocket-Accept` value for the client's key.
///
/// # Examples
///
/// ```
/// use mark46_server::handshake::accept_key;
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Builds the 101 response. `protocol` is the echoed subprotocol, or the
/// literal `undefined` when the client requested none.
#[must_use]
pub fn switching_protocols(accept: &str, protocol: &str, peer_id: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols ({SERVER_TAG})\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Sec-WebSocket-Protocol: {protocol}\r\n\
         Sec-WebSocket-ID: {peer_id}\r\n\
         \r\n"
    )
}

/// Builds a handshake failure response; the body is the default status text.
#[must_use]
pub fn failure_response(status: u16) -> String {
    let text = status_text(status);
    format!(
        "HTTP/1.1 {status} {text} ({SERVER_TAG})\r\n\
         Connection: close\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {text}",
        text.len()
    )
}

/// Default status text for the failure responses this server emits.
#[must_use]
pub fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}
