//! Connection registry: peer id -> live outbound channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::envelope::Outbound;

/// Capacity of each peer's outbound queue
const OUTBOUND_QUEUE: usize = 100;

/// Forwarding to a peer failed
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("peer channel closed")]
    Closed,

    #[error("peer queue full")]
    Full,
}

/// Outbound handle for one peer connection.
///
/// Cloning is cheap; every clone feeds the same socket writer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: u64,
    tx: mpsc::Sender<String>,
    close: Arc<Notify>,
}

/// Receiving half owned by the connection's socket writer task
pub struct PeerOutbox {
    pub rx: mpsc::Receiver<String>,
    pub close: Arc<Notify>,
}

impl PeerHandle {
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue an envelope for the peer without waiting.
    ///
    /// A peer that stops reading fills its queue; further envelopes are
    /// rejected with [`DeliveryError::Full`] instead of stalling the caller.
    pub fn deliver(&self, envelope: &Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(envelope.to_json()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the writer task to close the socket
    pub fn close(&self) {
        self.close.notify_one();
    }
}

/// Registry entry for a connected peer
#[derive(Debug)]
struct PeerEntry {
    handle: PeerHandle,
    /// Peer this one last tried to pair with. Advisory, never enforced.
    connected_to: Option<String>,
}

/// Process-wide map of connected peers
#[derive(Debug, Default)]
pub struct Registry {
    peers: RwLock<HashMap<String, PeerEntry>>,
    next_conn_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a channel for a new connection
    pub fn open_channel(&self) -> (PeerHandle, PeerOutbox) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let close = Arc::new(Notify::new());
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = PeerHandle {
            conn_id,
            tx,
            close: close.clone(),
        };
        (handle, PeerOutbox { rx, close })
    }

    /// Insert or replace the entry for `peer_id`.
    ///
    /// Returns the superseded handle, if any. The registry does not close it.
    pub async fn register(&self, peer_id: &str, handle: PeerHandle) -> Option<PeerHandle> {
        let entry = PeerEntry {
            handle,
            connected_to: None,
        };
        self.peers
            .write()
            .await
            .insert(peer_id.to_string(), entry)
            .map(|old| old.handle)
    }

    pub async fn lookup(&self, peer_id: &str) -> Option<PeerHandle> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .map(|entry| entry.handle.clone())
    }

    /// Remove the entry for `peer_id`. No-op if absent.
    pub async fn remove(&self, peer_id: &str) {
        self.peers.write().await.remove(peer_id);
    }

    /// Remove the entry for `peer_id` only if it still belongs to `conn_id`.
    ///
    /// A connection superseded by a re-registration must not evict its
    /// successor when it shuts down.
    pub async fn release(&self, peer_id: &str, conn_id: u64) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get(peer_id) {
            Some(entry) if entry.handle.conn_id == conn_id => {
                peers.remove(peer_id);
                true
            }
            _ => false,
        }
    }

    pub async fn exists(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn set_partner(&self, peer_id: &str, partner: Option<String>) {
        if let Some(entry) = self.peers.write().await.get_mut(peer_id) {
            entry.connected_to = partner;
        }
    }

    pub async fn partner(&self, peer_id: &str) -> Option<String> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .and_then(|entry| entry.connected_to.clone())
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
