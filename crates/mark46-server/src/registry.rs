use dashmap::DashMap;
use mark46_common::types::opcode;
use mark46_common::wire::encode_frame;
use mark46_common::{close, PeerId};
use serde_json::{Map, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Lifecycle state of a peer. Transitions only move forward:
/// `Pending → Connected → Disconnected` or `Pending → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerState {
    /// Upgraded but not yet authenticated.
    Pending = 0,
    /// Authenticated and registered.
    Connected = 1,
    /// Torn down; no further events will fire.
    Disconnected = 2,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// A message queued for a connection's writer.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// An encoded frame to write.
    Frame(Vec<u8>),
    /// A close frame; the writer sends it, shuts the write side down and
    /// tears the connection down with the given code and reason.
    Close {
        frame: Vec<u8>,
        code: u16,
        reason: String,
    },
}

/// A connected (or connecting) peer.
///
/// Shared as `Arc<Peer>` between the connection task, the registry and
/// application hooks. All mutation goes through interior locks or atomics,
/// so hooks may inspect and message peers from any task.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    remote_addr: IpAddr,
    remote_port: u16,
    info: Mutex<Map<String, Value>>,
    settings: Mutex<Map<String, Value>>,
    state: AtomicU8,
    verified: AtomicBool,
    outbound: mpsc::Sender<Outbound>,
}

impl Peer {
    pub(crate) fn new(id: PeerId, remote: SocketAddr, outbound: mpsc::Sender<Outbound>) -> Self {
        let mut info = Map::new();
        info.insert("client_id".to_string(), Value::String(id.clone()));
        let mut settings = Map::new();
        settings.insert("online".to_string(), Value::Bool(false));
        Self {
            id,
            remote_addr: remote.ip(),
            remote_port: remote.port(),
            info: Mutex::new(info),
            settings: Mutex::new(settings),
            state: AtomicU8::new(PeerState::Pending as u8),
            verified: AtomicBool::new(false),
            outbound,
        }
    }

    /// The peer identifier (`"MK"` + 12 uppercase hex characters).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote IP address of the underlying transport.
    #[must_use]
    pub fn remote_addr(&self) -> IpAddr {
        self.remote_addr
    }

    /// Remote TCP port of the underlying transport.
    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advances the lifecycle state. Backward transitions are ignored.
    pub(crate) fn set_state(&self, next: PeerState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// True once the authentication signal has been accepted for processing.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::Acquire)
    }

    /// Marks the peer verified. Returns true on the first call only.
    pub(crate) fn verify(&self) -> bool {
        !self.verified.swap(true, Ordering::AcqRel)
    }

    /// Application-visible info map as a JSON object. Always contains
    /// `client_id`.
    #[must_use]
    pub fn info_value(&self) -> Value {
        Value::Object(self.info.lock().expect("info lock poisoned").clone())
    }

    /// The info map serialized to a JSON string.
    #[must_use]
    pub fn info_json(&self) -> String {
        self.info_value().to_string()
    }

    /// Sets an entry in the info map.
    pub fn set_info(&self, key: &str, value: Value) {
        self.info
            .lock()
            .expect("info lock poisoned")
            .insert(key.to_string(), value);
    }

    /// Per-peer settings map as a JSON object. Defaults to `{"online": false}`.
    #[must_use]
    pub fn settings_value(&self) -> Value {
        Value::Object(self.settings.lock().expect("settings lock poisoned").clone())
    }

    /// Sets an entry in the settings map.
    pub fn set_setting(&self, key: &str, value: Value) {
        self.settings
            .lock()
            .expect("settings lock poisoned")
            .insert(key.to_string(), value);
    }

    /// Queues an already-encoded frame. Returns false when the connection
    /// is gone or its queue is full.
    pub(crate) fn try_send_frame(&self, frame: Vec<u8>) -> bool {
        self.outbound.try_send(Outbound::Frame(frame)).is_ok()
    }

    /// Initiates the close handshake with the given code and reason.
    ///
    /// The close frame is queued, the write side shuts down after it, and
    /// `client.disconnected` fires with the same code and reason. Returns
    /// false when the connection is already gone.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        let payload = close::close_frame_payload(code, reason);
        let frame = encode_frame(true, opcode::CLOSE, &payload);
        self.outbound
            .try_send(Outbound::Close {
                frame,
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

/// Indexed set of active peers plus room membership.
///
/// Rooms are ordered lists: `join` appends without deduplicating (a peer
/// joining twice appears twice) and `leave` removes every occurrence.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    clients: DashMap<PeerId, Arc<Peer>>,
    rooms: DashMap<String, Vec<PeerId>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connected peer. Returns false if the id was already
    /// present.
    pub fn insert(&self, peer: Arc<Peer>) -> bool {
        self.clients.insert(peer.id().to_string(), peer).is_none()
    }

    /// Removes a peer. Returns true if it was registered.
    pub fn remove(&self, id: &str) -> bool {
        self.clients.remove(id).is_some()
    }

    /// Looks up a peer by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.clients.get(id).map(|entry| entry.value().clone())
    }

    /// Number of registered peers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Appends the peer to the room, creating the room on first join.
    pub fn join(&self, room: &str, id: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .push(id.to_string());
    }

    /// Removes every occurrence of the peer from the room. Returns true
    /// only if the peer was a member. Empty rooms are dropped.
    pub fn leave(&self, room: &str, id: &str) -> bool {
        let Some(mut members) = self.rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|member| member != id);
        let removed = members.len() != before;
        let empty = members.is_empty();
        drop(members);
        if empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
        removed
    }

    /// Removes the peer from every room, invoking `on_room` for each room
    /// it was actually a member of. Returns true if any membership was
    /// removed.
    pub fn leave_all(&self, id: &str, mut on_room: impl FnMut(&str)) -> bool {
        let names: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        let mut any = false;
        for room in names {
            if self.leave(&room, id) {
                on_room(&room);
                any = true;
            }
        }
        any
    }

    /// All registered peers, unfiltered.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<Peer>> {
        self.clients.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Snapshot of peers, optionally restricted to a room and filtered by
    /// a predicate. Duplicate room entries yield the peer once.
    pub fn clients_filtered(
        &self,
        room: Option<&str>,
        predicate: impl Fn(&Peer) -> bool,
    ) -> Vec<Arc<Peer>> {
        let members: Option<Vec<PeerId>> = match room {
            Some(name) => match self.rooms.get(name) {
                Some(entry) => Some(entry.value().clone()),
                None => return Vec::new(),
            },
            None => None,
        };
        self.clients
            .iter()
            .filter(|entry| match &members {
                Some(ids) => ids.iter().any(|id| id == entry.key()),
                None => true,
            })
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of entries in the room's membership list (duplicates count).
    #[must_use]
    pub fn count_in_room(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |entry| entry.len())
    }
}
