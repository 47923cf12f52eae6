#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use mark46_common::signal::{decode_signal, encode_signal, SignalBody};
use mark46_common::types::opcode;
use mark46_server::config::ServerConfig;
use mark46_server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

pub const TEST_PROTOCOL: &str = "mark46";
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        tls: false,
        tls_cert: None,
        tls_key: None,
        max_payload: 1_048_576,
        max_clients: 64,
        verify_timeout: 7,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
    }
}

async fn spawn_server(config: ServerConfig) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = mark46_server::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    (addr, state)
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    spawn_server(test_config()).await
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let mut config = test_config();
    tweak(&mut config);
    spawn_server(config).await
}

// ---------------------------------------------------------------------------
// Library client: drives the server through tokio-tungstenite, which
// independently validates the handshake and the unmasked server frames.
// ---------------------------------------------------------------------------

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    pub id: Option<String>,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr) -> Self {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        let url = format!("ws://{addr}");
        let mut req = url.into_client_request().unwrap();
        req.headers_mut()
            .insert("Sec-WebSocket-Protocol", TEST_PROTOCOL.parse().unwrap());
        let (ws, _) = tokio_tungstenite::connect_async(req).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self {
            ws_tx,
            ws_rx,
            id: None,
        }
    }

    /// Sends the code-0 signal and reads the server's reply. Returns the
    /// assigned peer id and the info JSON that followed it.
    pub async fn authenticate(&mut self, credentials: &str) -> (String, String) {
        self.send_signal(0, credentials.as_bytes()).await;
        let (code, data) = self.recv_signal().await;
        assert_eq!(code, 0, "expected auth reply signal");
        let text = String::from_utf8(data).unwrap();
        let (id, info) = text.split_at(14);
        self.id = Some(id.to_string());
        (id.to_string(), info.to_string())
    }

    pub fn id(&self) -> String {
        self.id.clone().expect("client not authenticated")
    }

    pub async fn send_signal(&mut self, code: u16, data: &[u8]) {
        let message = encode_signal(code, &SignalBody::Bytes(data.to_vec())).unwrap();
        self.ws_tx.send(Message::Binary(message)).await.unwrap();
    }

    /// Sends raw bytes as a single binary frame, envelope not included.
    pub async fn send_binary(&mut self, payload: Vec<u8>) {
        self.ws_tx.send(Message::Binary(payload)).await.unwrap();
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn close(&mut self, code: u16, reason: &str) {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        self.ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await
            .unwrap();
    }

    pub async fn recv_signal(&mut self) -> (u16, Vec<u8>) {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for signal")
                .expect("stream ended")
                .expect("websocket error");
            match msg {
                Message::Binary(data) => {
                    let (code, payload) = decode_signal(&data).unwrap();
                    return (code, payload.to_vec());
                }
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected binary signal, got {other:?}"),
            }
        }
    }

    /// True when nothing arrives within `wait`.
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.ws_rx.next()).await.is_err()
    }
}

// ---------------------------------------------------------------------------
// Raw client: hand-rolled handshake and framing, for the paths where the
// exact bytes matter (status lines, close codes, fragmentation, masking).
// ---------------------------------------------------------------------------

pub const RAW_MASK: [u8; 4] = [0x5A, 0xA5, 0x3C, 0xC3];

pub struct RawClient {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl RawClient {
    /// Opens a connection and performs the upgrade handshake. Returns the
    /// client plus the server's full response head for inspection.
    pub async fn connect(addr: &SocketAddr, protocol: Option<&str>) -> (Self, String) {
        Self::connect_with_key(addr, SAMPLE_KEY, protocol).await
    }

    pub async fn connect_with_key(
        addr: &SocketAddr,
        key: &str,
        protocol: Option<&str>,
    ) -> (Self, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut request = format!(
            "GET /signal HTTP/1.1\r\n\
             Host: {addr}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n"
        );
        if let Some(protocol) = protocol {
            request.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut buf = Vec::new();
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8(buf[..end].to_vec()).unwrap();
                let leftover = buf[end + 4..].to_vec();
                return (
                    Self {
                        stream,
                        buf: leftover,
                    },
                    head,
                );
            }
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed during handshake");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn send_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) {
        let frame = build_frame(fin, opcode, Some(RAW_MASK), payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_unmasked_frame(&mut self, fin: bool, opcode: u8, payload: &[u8]) {
        let frame = build_frame(fin, opcode, None, payload);
        self.stream.write_all(&frame).await.unwrap();
    }

    pub async fn send_signal(&mut self, code: u16, data: &[u8]) {
        let message = encode_signal(code, &SignalBody::Bytes(data.to_vec())).unwrap();
        self.send_frame(true, opcode::BINARY, &message).await;
    }

    /// Sends code-0 credentials and returns the assigned peer id from the
    /// reply signal.
    pub async fn authenticate(&mut self, credentials: &str) -> String {
        self.send_signal(0, credentials.as_bytes()).await;
        let (code, data) = self.read_signal().await;
        assert_eq!(code, 0, "expected auth reply signal");
        String::from_utf8(data[..14].to_vec()).unwrap()
    }

    /// Reads one server-to-client frame: `(opcode, fin, payload)`.
    pub async fn read_frame(&mut self) -> (u8, bool, Vec<u8>) {
        loop {
            if let Some((opcode, fin, payload, consumed)) = parse_server_frame(&self.buf) {
                self.buf.drain(..consumed);
                return (opcode, fin, payload);
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("timeout waiting for frame")
                .unwrap();
            assert!(n > 0, "connection closed while waiting for frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    pub async fn read_signal(&mut self) -> (u16, Vec<u8>) {
        let (op, fin, payload) = self.read_frame().await;
        assert_eq!(op, opcode::BINARY, "expected binary frame");
        assert!(fin);
        let (code, data) = decode_signal(&payload).unwrap();
        (code, data.to_vec())
    }

    /// Reads until the close frame and returns its code plus the raw reason
    /// text (which carries the server's `--` prefix).
    pub async fn read_close(&mut self) -> (u16, String) {
        loop {
            let (op, _fin, payload) = self.read_frame().await;
            if op != opcode::CLOSE {
                continue;
            }
            assert!(payload.len() >= 2, "close frame without code");
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = String::from_utf8(payload[2..].to_vec()).unwrap();
            return (code, reason);
        }
    }

    /// Waits for the server to drop the connection without sending frames.
    pub async fn read_eof(&mut self) {
        let mut chunk = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                .await
                .expect("timeout waiting for eof")
                .unwrap_or(0);
            if n == 0 {
                return;
            }
        }
    }
}

pub fn build_frame(fin: bool, opcode: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    let mut out = Vec::with_capacity(14 + len);
    out.push(if fin { 0x80 } else { 0 } | (opcode & 0x0F));
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }
    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i & 3]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

fn parse_server_frame(buf: &[u8]) -> Option<(u8, bool, Vec<u8>, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    assert_eq!(buf[1] & 0x80, 0, "server frames must be unmasked");
    let (len, mut offset) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            (
                u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]),
                10,
            )
        }
        n => (u64::from(n), 2),
    };
    let len = usize::try_from(len).unwrap();
    if buf.len() < offset + len {
        return None;
    }
    let payload = buf[offset..offset + len].to_vec();
    offset += len;
    Some((opcode, fin, payload, offset))
}
