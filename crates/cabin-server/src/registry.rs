//! Active-connection registry.
//!
//! Every accepted control socket gets a server-assigned `wsId` and an
//! outbox sender; everything that needs to push frames to a client goes
//! through this registry by id. Process subscriptions are held here as a
//! pair of inverse indexes (pid → wsIds, wsId → pids) so that both
//! process exit and client disconnect clean up with plain index removals.
//!
//! Send failures mark a dead outbox but never abort a fan-out: the
//! disconnect path is responsible for removing the entry.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use cabin_core::new_token;

struct ConnectionEntry {
    outbox: mpsc::UnboundedSender<Message>,
    auth_token: Option<String>,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, ConnectionEntry>,
    process_subscribers: HashMap<u32, HashSet<String>>,
    client_processes: HashMap<String, HashSet<u32>>,
}

/// Registry of live control connections and their process subscriptions.
#[derive(Default)]
pub struct Connections {
    inner: RwLock<Inner>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox; returns its new `wsId`.
    pub fn register(&self, outbox: mpsc::UnboundedSender<Message>) -> String {
        let ws_id = new_token();
        let mut inner = self.inner.write().expect("connection registry poisoned");
        inner.active.insert(
            ws_id.clone(),
            ConnectionEntry {
                outbox,
                auth_token: None,
            },
        );
        ws_id
    }

    /// Remove a connection and every process subscription it holds.
    ///
    /// Spawned processes themselves keep running; only the subscription
    /// goes away.
    pub fn deregister(&self, ws_id: &str) {
        let mut inner = self.inner.write().expect("connection registry poisoned");
        inner.active.remove(ws_id);

        if let Some(pids) = inner.client_processes.remove(ws_id) {
            for pid in pids {
                if let Some(subscribers) = inner.process_subscribers.get_mut(&pid) {
                    subscribers.remove(ws_id);
                    // An empty subscriber set stays until the process
                    // exits; output simply has nowhere to go.
                }
            }
        }
    }

    /// Send a text frame to one connection. Returns false when the
    /// connection is gone or its writer has stopped.
    pub fn send_to(&self, ws_id: &str, text: String) -> bool {
        let inner = self.inner.read().expect("connection registry poisoned");
        match inner.active.get(ws_id) {
            Some(entry) => entry.outbox.send(Message::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Send a text frame to every connection. Individual failures are
    /// ignored; the message still reaches everyone else.
    pub fn broadcast(&self, text: &str) {
        let inner = self.inner.read().expect("connection registry poisoned");
        for entry in inner.active.values() {
            let _ = entry.outbox.send(Message::Text(text.to_string()));
        }
    }

    /// Subscribe a connection to a pid's output.
    pub fn subscribe_process(&self, ws_id: &str, pid: u32) {
        let mut inner = self.inner.write().expect("connection registry poisoned");
        inner
            .process_subscribers
            .entry(pid)
            .or_default()
            .insert(ws_id.to_string());
        inner
            .client_processes
            .entry(ws_id.to_string())
            .or_default()
            .insert(pid);
    }

    /// Current subscribers of a pid.
    pub fn process_subscribers(&self, pid: u32) -> Vec<String> {
        let inner = self.inner.read().expect("connection registry poisoned");
        inner
            .process_subscribers
            .get(&pid)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all subscription state for an exited pid.
    pub fn drop_process(&self, pid: u32) {
        let mut inner = self.inner.write().expect("connection registry poisoned");
        if let Some(subscribers) = inner.process_subscribers.remove(&pid) {
            for ws_id in subscribers {
                if let Some(pids) = inner.client_processes.get_mut(&ws_id) {
                    pids.remove(&pid);
                }
            }
        }
    }

    /// Record the token a connection authenticated with.
    pub fn set_auth_token(&self, ws_id: &str, token: &str) {
        let mut inner = self.inner.write().expect("connection registry poisoned");
        if let Some(entry) = inner.active.get_mut(ws_id) {
            entry.auth_token = Some(token.to_string());
        }
    }

    /// The token a connection authenticated with, if any.
    pub fn auth_token(&self, ws_id: &str) -> Option<String> {
        let inner = self.inner.read().expect("connection registry poisoned");
        inner.active.get(ws_id).and_then(|e| e.auth_token.clone())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner
            .read()
            .expect("connection registry poisoned")
            .active
            .len()
    }

    /// Whether a pid has subscription state (for tests and invariants).
    pub fn tracks_process(&self, pid: u32) -> bool {
        self.inner
            .read()
            .expect("connection registry poisoned")
            .process_subscribers
            .contains_key(&pid)
    }

    /// Drop everything. Used on shutdown.
    pub fn clear(&self) {
        let mut inner = self.inner.write().expect("connection registry poisoned");
        inner.active.clear();
        inner.process_subscribers.clear();
        inner.client_processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(registry: &Connections) -> (String, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    #[test]
    fn register_assigns_distinct_token_ids() {
        let registry = Connections::new();
        let (a, _rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);

        assert_ne!(a, b);
        assert_eq!(a.len(), 7);
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn send_to_reaches_only_the_addressed_connection() {
        let registry = Connections::new();
        let (a, mut rx_a) = connect(&registry);
        let (_b, mut rx_b) = connect(&registry);

        assert!(registry.send_to(&a, "hello".to_string()));
        assert!(matches!(rx_a.try_recv(), Ok(Message::Text(t)) if t == "hello"));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_survives_dead_outboxes() {
        let registry = Connections::new();
        let (_a, rx_a) = connect(&registry);
        let (_b, mut rx_b) = connect(&registry);

        // Simulate a connection whose writer died without deregistering.
        drop(rx_a);

        registry.broadcast("ports changed");
        assert!(matches!(rx_b.try_recv(), Ok(Message::Text(t)) if t == "ports changed"));
    }

    #[test]
    fn process_subscriptions_maintain_inverse_indexes() {
        let registry = Connections::new();
        let (a, _rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);

        registry.subscribe_process(&a, 100);
        registry.subscribe_process(&b, 100);
        registry.subscribe_process(&a, 200);

        let mut subs = registry.process_subscribers(100);
        subs.sort();
        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(subs, expected);
        assert_eq!(registry.process_subscribers(200), vec![a.clone()]);
    }

    #[test]
    fn deregister_removes_subscriptions_but_not_the_process_entry() {
        let registry = Connections::new();
        let (a, _rx_a) = connect(&registry);

        registry.subscribe_process(&a, 100);
        registry.deregister(&a);

        assert_eq!(registry.connection_count(), 0);
        assert!(registry.process_subscribers(100).is_empty());
        // The pid entry persists until the process exits.
        assert!(registry.tracks_process(100));
        assert!(!registry.send_to(&a, "late".to_string()));
    }

    #[test]
    fn drop_process_clears_both_indexes() {
        let registry = Connections::new();
        let (a, _rx_a) = connect(&registry);

        registry.subscribe_process(&a, 100);
        registry.drop_process(100);

        assert!(!registry.tracks_process(100));
        assert!(registry.process_subscribers(100).is_empty());
    }

    #[test]
    fn auth_token_round_trips() {
        let registry = Connections::new();
        let (a, _rx_a) = connect(&registry);

        assert_eq!(registry.auth_token(&a), None);
        registry.set_auth_token(&a, "secret");
        assert_eq!(registry.auth_token(&a), Some("secret".to_string()));
    }
}
