use crate::registry::Peer;
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// `client.authentication` listener. All subscribed listeners must return
/// true for the peer to be admitted.
pub type AuthenticationHook = Arc<dyn Fn(&Arc<Peer>, &Value) -> bool + Send + Sync>;
/// `client.connected` listener.
pub type ConnectedHook = Arc<dyn Fn(&Arc<Peer>) + Send + Sync>;
/// `client.disconnected` listener.
pub type DisconnectedHook = Arc<dyn Fn(&Arc<Peer>, u16, &str) + Send + Sync>;
/// `client.signal` listener.
pub type SignalHook = Arc<dyn Fn(&Arc<Peer>, u16, &[u8]) + Send + Sync>;

/// Append-only listener table addressed by integer handles.
///
/// Unsubscribing tombstones the slot; handles are never reused within a
/// table, so a stale handle can at worst unsubscribe nothing. Dispatch
/// snapshots the live listeners under the lock, so a listener subscribing
/// during dispatch only takes effect from the next event on.
pub struct HookTable<T> {
    slots: Mutex<Vec<Option<T>>>,
}

impl<T> Default for HookTable<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> HookTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener and returns its handle.
    pub fn subscribe(&self, hook: T) -> usize {
        let mut slots = self.slots.lock().expect("hook table lock poisoned");
        slots.push(Some(hook));
        slots.len() - 1
    }

    /// Removes the listener behind `handle`. Returns true if it was live.
    pub fn unsubscribe(&self, handle: usize) -> bool {
        let mut slots = self.slots.lock().expect("hook table lock poisoned");
        match slots.get_mut(handle) {
            Some(slot) => slot.take().is_some(),
            None => false,
        }
    }

    /// Live listeners in subscription order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        self.slots
            .lock()
            .expect("hook table lock poisoned")
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// The four application event tables of the server facade.
#[derive(Default)]
pub struct EventHooks {
    /// `client.authentication`: AND-folded over all listeners.
    pub authentication: HookTable<AuthenticationHook>,
    /// `client.connected`: fired once per admitted peer.
    pub connected: HookTable<ConnectedHook>,
    /// `client.disconnected`: fired at most once per peer.
    pub disconnected: HookTable<DisconnectedHook>,
    /// `client.signal`: fired for every verified signal.
    pub signal: HookTable<SignalHook>,
}

impl EventHooks {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
