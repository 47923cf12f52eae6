use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::events::EventHooks;
use crate::metrics::{counters, histograms};
use crate::registry::{Peer, PeerRegistry, PeerState};
use mark46_common::signal::{encode_signal, SignalBody};
use mark46_common::types::opcode;
use mark46_common::wire::encode_frame;
use mark46_common::PeerId;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Outcome of the authentication fold for a pending peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthOutcome {
    /// Every listener accepted and capacity allows the peer.
    Accepted,
    /// At least one listener returned false.
    Rejected,
    /// Listeners accepted but the server is at capacity.
    ServerFull,
}

/// Shared state and application facade of the signaling server.
///
/// Connections dispatch lifecycle events through this type; applications
/// subscribe to them and talk back through the send/broadcast/room APIs.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connected peers and room membership.
    pub registry: PeerRegistry,
    /// Application event tables.
    pub hooks: EventHooks,
    running: AtomicBool,
}

impl ServerState {
    /// Creates the server state in RUNNING mode.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: PeerRegistry::new(),
            hooks: EventHooks::new(),
            running: AtomicBool::new(true),
        }
    }

    /// True while the server accepts upgrade requests.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Flips the RUNNING flag; new handshakes answer 503 while false.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    // -- event subscription ------------------------------------------------

    /// Subscribes to `client.authentication`. All listeners must return
    /// true for a peer to be admitted.
    pub fn on_authentication(
        &self,
        listener: impl Fn(&Arc<Peer>, &Value) -> bool + Send + Sync + 'static,
    ) -> usize {
        self.hooks.authentication.subscribe(Arc::new(listener))
    }

    /// Removes a `client.authentication` listener by handle.
    pub fn off_authentication(&self, handle: usize) -> bool {
        self.hooks.authentication.unsubscribe(handle)
    }

    /// Subscribes to `client.connected`.
    pub fn on_connected(&self, listener: impl Fn(&Arc<Peer>) + Send + Sync + 'static) -> usize {
        self.hooks.connected.subscribe(Arc::new(listener))
    }

    /// Removes a `client.connected` listener by handle.
    pub fn off_connected(&self, handle: usize) -> bool {
        self.hooks.connected.unsubscribe(handle)
    }

    /// Subscribes to `client.disconnected`.
    pub fn on_disconnected(
        &self,
        listener: impl Fn(&Arc<Peer>, u16, &str) + Send + Sync + 'static,
    ) -> usize {
        self.hooks.disconnected.subscribe(Arc::new(listener))
    }

    /// Removes a `client.disconnected` listener by handle.
    pub fn off_disconnected(&self, handle: usize) -> bool {
        self.hooks.disconnected.unsubscribe(handle)
    }

    /// Subscribes to `client.signal`.
    pub fn on_signal(
        &self,
        listener: impl Fn(&Arc<Peer>, u16, &[u8]) + Send + Sync + 'static,
    ) -> usize {
        self.hooks.signal.subscribe(Arc::new(listener))
    }

    /// Removes a `client.signal` listener by handle.
    pub fn off_signal(&self, handle: usize) -> bool {
        self.hooks.signal.unsubscribe(handle)
    }

    // -- queries -----------------------------------------------------------

    /// Looks up a connected peer by id.
    #[must_use]
    pub fn client(&self, id: &str) -> Option<Arc<Peer>> {
        self.registry.get(id)
    }

    /// All connected peers.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Peer>> {
        self.registry.clients()
    }

    /// Number of connected peers.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.registry.count()
    }

    // -- rooms -------------------------------------------------------------

    /// Adds the peer to a room. Joining twice appends a second entry.
    pub fn join(&self, peer: &Peer, room: &str) {
        self.registry.join(room, peer.id());
    }

    /// Removes the peer from a room. True only if it was a member.
    pub fn leave(&self, peer: &Peer, room: &str) -> bool {
        self.registry.leave(room, peer.id())
    }

    /// Removes the peer from every room. True if any membership was removed.
    pub fn leave_all(&self, peer: &Peer) -> bool {
        self.registry.leave_all(peer.id(), |_| {})
    }

    // -- outbound ----------------------------------------------------------

    /// Sends a signal to one peer.
    ///
    /// # Errors
    ///
    /// Fails when the code is out of range, the encoded message reaches
    /// `max_payload`, or the peer's connection is gone.
    pub fn send(&self, peer: &Peer, code: u16, body: &SignalBody) -> Result<(), ServerError> {
        let frame = self.encode_outgoing(code, body)?;
        if peer.try_send_frame(frame) {
            counters::signals_total("out");
            Ok(())
        } else {
            Err(ServerError::ConnectionClosed)
        }
    }

    /// Broadcasts a signal to every connected peer not listed in `except`.
    /// Returns the number of peers the message was queued for.
    ///
    /// # Errors
    ///
    /// Fails when the code is out of range or the encoded message reaches
    /// `max_payload`.
    pub fn broadcast(
        &self,
        code: u16,
        body: &SignalBody,
        except: &[PeerId],
    ) -> Result<usize, ServerError> {
        self.fan_out(code, body, None, except)
    }

    /// Broadcasts a signal to every connected peer in `room` not listed in
    /// `except`. Returns the number of peers the message was queued for.
    ///
    /// # Errors
    ///
    /// Fails when the code is out of range or the encoded message reaches
    /// `max_payload`.
    pub fn broadcast_in_room(
        &self,
        code: u16,
        body: &SignalBody,
        room: &str,
        except: &[PeerId],
    ) -> Result<usize, ServerError> {
        self.fan_out(code, body, Some(room), except)
    }

    fn fan_out(
        &self,
        code: u16,
        body: &SignalBody,
        room: Option<&str>,
        except: &[PeerId],
    ) -> Result<usize, ServerError> {
        let frame = self.encode_outgoing(code, body)?;
        // Snapshot: concurrent joins and leaves cannot invalidate the walk.
        let targets = self
            .registry
            .clients_filtered(room, |peer| peer.state() == PeerState::Connected);
        let mut delivered = 0;
        for peer in targets {
            if except.iter().any(|id| id == peer.id()) {
                continue;
            }
            if peer.try_send_frame(frame.clone()) {
                counters::signals_total("out");
                delivered += 1;
            }
        }
        counters::broadcasts_total();
        Ok(delivered)
    }

    fn encode_outgoing(&self, code: u16, body: &SignalBody) -> Result<Vec<u8>, ServerError> {
        let message = encode_signal(code, body)?;
        let limit = self.config.max_payload;
        if limit > 0 && message.len() as u64 >= limit {
            warn!(code, size = message.len(), limit, "refusing oversized outgoing signal");
            return Err(ServerError::MaxPayloadExceeded {
                size: message.len(),
                limit,
            });
        }
        Ok(encode_frame(true, opcode::BINARY, &message))
    }

    // -- lifecycle dispatch (driven by connection tasks) --------------------

    pub(crate) fn authenticate(&self, peer: &Arc<Peer>, credentials: &Value) -> AuthOutcome {
        let accepted = self
            .hooks
            .authentication
            .snapshot()
            .iter()
            .all(|listener| listener(peer, credentials));
        if !accepted {
            counters::auth_total("rejected");
            return AuthOutcome::Rejected;
        }
        if self.registry.count() >= self.config.max_clients as usize {
            counters::auth_total("server_full");
            return AuthOutcome::ServerFull;
        }
        AuthOutcome::Accepted
    }

    pub(crate) fn notify_connected(&self, peer: &Arc<Peer>) {
        peer.set_state(PeerState::Connected);
        self.registry.insert(peer.clone());
        counters::auth_total("accepted");
        for listener in self.hooks.connected.snapshot() {
            listener(peer);
        }
    }

    pub(crate) fn notify_disconnected(&self, peer: &Arc<Peer>, code: u16, reason: &str) {
        peer.set_state(PeerState::Disconnected);
        self.registry.remove(peer.id());
        self.registry.leave_all(peer.id(), |_| {});
        counters::disconnects_total(code);
        for listener in self.hooks.disconnected.snapshot() {
            listener(peer, code, reason);
        }
    }

    pub(crate) fn dispatch_signal(&self, peer: &Arc<Peer>, code: u16, data: &[u8]) {
        counters::signals_total("in");
        let start = Instant::now();
        for listener in self.hooks.signal.snapshot() {
            listener(peer, code, data);
        }
        histograms::dispatch_seconds(start.elapsed().as_secs_f64());
    }
}

/// Accept loop: one spawned task per connection.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ServerError> {
    let local_addr = listener.local_addr().map_err(ServerError::Io)?;
    info!("server listening on {}", local_addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, state).await {
                        tracing::debug!("connection from {} closed: {}", addr, e);
                    }
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}
