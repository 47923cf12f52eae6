use crate::handshake;
use crate::metrics::{counters, gauges};
use crate::registry::{Outbound, Peer};
use crate::server::{AuthOutcome, ServerState};
use bytes::{Bytes, BytesMut};
use mark46_common::close;
use mark46_common::signal::{encode_signal, SignalBody};
use mark46_common::types::{opcode, AUTH_SIGNAL, PEER_ID_PREFIX};
use mark46_common::wire::{encode_frame, FrameReceiver, ReceiverEvent};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

/// Depth of the per-connection outbound queue. Broadcast deliveries beyond
/// this are dropped rather than blocking the sender.
const OUTBOUND_QUEUE: usize = 256;

/// Generates a peer id: `"MK"` plus the last 12 hex characters of a fresh
/// UUIDv4, uppercased.
pub(crate) fn generate_peer_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}{}", PEER_ID_PREFIX, uuid[20..].to_ascii_uppercase())
}

/// Accepts the upgrade handshake and drives the connection until it ends.
pub(crate) async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), crate::error::ServerError> {
    if !state.is_running() || state.client_count() >= state.config.max_clients as usize {
        counters::handshakes_total("unavailable");
        let response = handshake::failure_response(503);
        let _ = stream.write_all(response.as_bytes()).await;
        return Ok(());
    }

    let (head, leftover) = match handshake::read_head(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            counters::handshakes_total("rejected");
            let response = handshake::failure_response(400);
            let _ = stream.write_all(response.as_bytes()).await;
            return Err(e);
        }
    };
    let upgrade = match handshake::validate_upgrade(&head) {
        Ok(upgrade) => upgrade,
        Err(reason) => {
            counters::handshakes_total("rejected");
            tracing::debug!(peer = %peer_addr, reason, "rejecting upgrade request");
            let response = handshake::failure_response(400);
            let _ = stream.write_all(response.as_bytes()).await;
            return Ok(());
        }
    };

    let peer_id = generate_peer_id();
    let accept = handshake::accept_key(&upgrade.key);
    let protocol = upgrade.protocol.as_deref().unwrap_or("undefined");
    let response = handshake::switching_protocols(&accept, protocol, &peer_id);
    stream.write_all(response.as_bytes()).await?;
    stream.set_nodelay(true)?;
    counters::handshakes_total("upgraded");

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let peer = Arc::new(Peer::new(peer_id, peer_addr, outbound_tx));
    tracing::info!(peer = %peer.id(), addr = %peer_addr, "connection upgraded");

    gauges::inc_connections_active();
    Connection::new(peer, state, outbound_rx).run(stream, leftover).await;
    gauges::dec_connections_active();
    Ok(())
}

enum Flow {
    Continue,
    Stop,
}

/// Per-connection lifecycle driver.
///
/// Owns the frame receiver and serializes everything that happens on one
/// connection: reads feed the receiver, decoded signals dispatch through
/// the facade, outbound frames from other tasks interleave between reads,
/// and the verify timer fires once if the peer never authenticates. The
/// first inbound signal is fully processed, reply write included, before
/// any later bytes are looked at.
struct Connection {
    peer: Arc<Peer>,
    state: Arc<ServerState>,
    receiver: FrameReceiver,
    outbound_rx: mpsc::Receiver<Outbound>,
    close_sent: bool,
    finished: bool,
}

impl Connection {
    fn new(
        peer: Arc<Peer>,
        state: Arc<ServerState>,
        outbound_rx: mpsc::Receiver<Outbound>,
    ) -> Self {
        let receiver = FrameReceiver::new(state.config.max_payload);
        Self {
            peer,
            state,
            receiver,
            outbound_rx,
            close_sent: false,
            finished: false,
        }
    }

    async fn run(mut self, stream: TcpStream, head: Bytes) {
        let (mut read_half, mut write_half) = stream.into_split();
        let verify_deadline = Instant::now() + self.state.config.verify_timeout();
        let mut buf = BytesMut::with_capacity(8 * 1024);

        // The client may have pipelined frames behind the handshake.
        self.receiver.feed(head);
        if let Flow::Stop = self.drain_events(&mut write_half).await {
            return;
        }

        loop {
            tokio::select! {
                read = read_half.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        self.finish(1000, String::new());
                        break;
                    }
                    Ok(_) => {
                        self.receiver.feed(buf.split().freeze());
                        if let Flow::Stop = self.drain_events(&mut write_half).await {
                            break;
                        }
                    }
                    Err(e) => {
                        let (code, reason) = close::server_exception(&e.to_string());
                        self.finish(code, reason);
                        break;
                    }
                },
                Some(outbound) = self.outbound_rx.recv() => match outbound {
                    Outbound::Frame(frame) => {
                        if write_half.write_all(&frame).await.is_err() {
                            let (code, reason) = close::server_exception("write failed");
                            self.finish(code, reason);
                            break;
                        }
                    }
                    Outbound::Close { frame, code, reason } => {
                        if !self.close_sent {
                            self.close_sent = true;
                            let _ = write_half.write_all(&frame).await;
                            let _ = write_half.shutdown().await;
                        }
                        self.finish(code, reason);
                        break;
                    }
                },
                () = sleep_until(verify_deadline), if !self.peer.is_verified() => {
                    let (code, reason) = close::kicked(Some("Server"), Some("Invalid client."));
                    tracing::debug!(peer = %self.peer.id(), "verify deadline reached");
                    self.send_close(&mut write_half, code, &reason).await;
                    self.finish(code, reason);
                    break;
                }
            }
        }
    }

    /// Drains every event the receiver can produce from its buffer.
    async fn drain_events(&mut self, writer: &mut OwnedWriteHalf) -> Flow {
        loop {
            match self.receiver.poll() {
                Ok(None) => return Flow::Continue,
                Ok(Some(ReceiverEvent::Signal { code, data })) => {
                    if let Flow::Stop = self.on_inbound_signal(code, &data, writer).await {
                        return Flow::Stop;
                    }
                }
                Ok(Some(ReceiverEvent::Conclude { code, reason })) => {
                    let reason = close::ws_code_reason(code, &reason);
                    let _ = writer.shutdown().await;
                    self.finish(code, reason);
                    return Flow::Stop;
                }
                Err(err) => {
                    tracing::debug!(
                        peer = %self.peer.id(),
                        tag = err.tag(),
                        "frame error: {err}"
                    );
                    let code = err.close_code();
                    let reason = err.to_string();
                    self.send_close(writer, code, &reason).await;
                    self.finish(code, reason);
                    return Flow::Stop;
                }
            }
        }
    }

    async fn on_inbound_signal(
        &mut self,
        code: u16,
        data: &[u8],
        writer: &mut OwnedWriteHalf,
    ) -> Flow {
        if self.peer.is_verified() {
            // Any code is fair game once verified, a repeated 0 included.
            self.state.dispatch_signal(&self.peer, code, data);
            return Flow::Continue;
        }
        if code != AUTH_SIGNAL {
            let (code, reason) = close::kicked(Some("Server"), Some("Invalid client."));
            self.send_close(writer, code, &reason).await;
            self.finish(code, reason);
            return Flow::Stop;
        }

        self.peer.verify();
        let credentials = parse_credentials(data);
        match self.state.authenticate(&self.peer, &credentials) {
            AuthOutcome::Accepted => {
                let reply = format!("{}{}", self.peer.id(), self.peer.info_json());
                let message = encode_signal(AUTH_SIGNAL, &SignalBody::Text(reply))
                    .expect("code 0 is always in range");
                let frame = encode_frame(true, opcode::BINARY, &message);
                if writer.write_all(&frame).await.is_err() {
                    let (code, reason) = close::server_exception("write failed");
                    self.finish(code, reason);
                    return Flow::Stop;
                }
                self.state.notify_connected(&self.peer);
                Flow::Continue
            }
            AuthOutcome::Rejected => {
                let (code, reason) = close::authorization_error();
                self.send_close(writer, code, &reason).await;
                self.finish(code, reason);
                Flow::Stop
            }
            AuthOutcome::ServerFull => {
                let (code, reason) = close::server_full();
                self.send_close(writer, code, &reason).await;
                self.finish(code, reason);
                Flow::Stop
            }
        }
    }

    /// Writes a close frame and shuts the write side down. Safe to call
    /// more than once; only the first call emits anything.
    async fn send_close(&mut self, writer: &mut OwnedWriteHalf, code: u16, reason: &str) {
        if self.close_sent {
            return;
        }
        self.close_sent = true;
        let payload = close::close_frame_payload(code, reason);
        let frame = encode_frame(true, opcode::CLOSE, &payload);
        let _ = writer.write_all(&frame).await;
        let _ = writer.shutdown().await;
    }

    /// Single Disconnected transition for every close origin. Idempotent:
    /// the registry is pruned and `client.disconnected` fires exactly once.
    fn finish(&mut self, code: u16, reason: String) {
        if self.finished {
            return;
        }
        self.finished = true;
        tracing::info!(peer = %self.peer.id(), code, reason = %reason, "peer disconnected");
        self.state.notify_disconnected(&self.peer, code, &reason);
    }
}

/// Credentials are JSON when they parse as JSON; anything else is passed
/// through as a string value.
fn parse_credentials(data: &[u8]) -> Value {
    serde_json::from_slice(data)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(data).into_owned()))
}
