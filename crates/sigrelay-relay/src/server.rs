//! Signaling router - one WebSocket connection per peer

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::envelope::{Inbound, Outbound};
use crate::registry::{PeerHandle, PeerOutbox, Registry};

/// Signaling relay state shared by all connections
#[derive(Clone, Default)]
pub struct RelayState {
    pub registry: Arc<Registry>,
}

impl RelayState {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

/// WebSocket upgrade handler for `/<prefix>/:peer_id`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(peer_id): Path<String>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer_id, state))
}

/// Handle a peer connection from upgrade to cleanup
async fn handle_socket(socket: WebSocket, peer_id: String, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, outbox) = state.registry.open_channel();
    let PeerOutbox { mut rx, close } = outbox;

    // Forward queued envelopes to the client until the queue closes,
    // a write fails, or the connection is superseded
    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if sender.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                _ = close.notified() => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    // Registration is implicit: the peer is routable as soon as it connects
    if let Some(previous) = state.registry.register(&peer_id, handle.clone()).await {
        info!("Peer {} re-registered, closing previous connection", peer_id);
        previous.close();
    }
    info!("Peer {} connected", peer_id);

    let session = PeerSession {
        peer_id: &peer_id,
        handle: &handle,
        registry: &state.registry,
    };

    loop {
        let result = tokio::select! {
            result = receiver.next() => result,
            _ = &mut send_task => {
                debug!("Writer for {} finished", peer_id);
                break;
            }
        };

        let msg = match result {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("WebSocket error for {}: {}", peer_id, e);
                break;
            }
        };

        trace!("Received from {}: {}", peer_id, msg);
        session.route(&msg).await;
    }

    send_task.abort();
    if state.registry.release(&peer_id, handle.conn_id()).await {
        info!("Peer {} disconnected", peer_id);
    } else {
        debug!("Superseded connection for {} closed", peer_id);
    }
}

/// Dispatches envelopes from one connected peer
struct PeerSession<'a> {
    peer_id: &'a str,
    handle: &'a PeerHandle,
    registry: &'a Registry,
}

impl PeerSession<'_> {
    async fn route(&self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("Ignoring malformed envelope from {}: {}", self.peer_id, e);
                return;
            }
        };

        match &inbound {
            Inbound::Register => {
                info!("Peer {} registered", self.peer_id);
                self.reply(Outbound::registered(self.peer_id)).await;
                return;
            }
            Inbound::Unknown(msg_type) => {
                trace!("Ignoring unknown type {:?} from {}", msg_type, self.peer_id);
                return;
            }
            _ => {}
        }

        let Some(target) = inbound.target().map(str::to_string) else {
            return;
        };
        let is_connect = matches!(inbound, Inbound::Connect { .. });
        let is_disconnect = matches!(inbound, Inbound::Disconnect { .. });

        if is_disconnect {
            self.registry.set_partner(self.peer_id, None).await;
        }

        let Some(peer) = self.registry.lookup(&target).await else {
            // A disconnect to a vanished peer needs no answer
            if !is_disconnect {
                debug!("Peer {} not found for {}", target, self.peer_id);
                self.reply(Outbound::peer_unavailable(&target)).await;
            }
            return;
        };

        if is_connect {
            self.registry
                .set_partner(self.peer_id, Some(target.clone()))
                .await;
        }
        self.forward(&peer, &target, inbound).await;
    }

    async fn forward(&self, peer: &PeerHandle, target: &str, inbound: Inbound) {
        let Some(envelope) = Outbound::forwarded(inbound, self.peer_id) else {
            return;
        };
        match peer.deliver(&envelope) {
            Ok(()) => debug!(
                "Forwarded {} from {} to {}",
                envelope.msg_type(),
                self.peer_id,
                target
            ),
            Err(e) => warn!(
                "Dropped {} from {} to {}: {}",
                envelope.msg_type(),
                self.peer_id,
                target,
                e
            ),
        }
    }

    async fn reply(&self, envelope: Outbound) {
        if let Err(e) = self.handle.deliver(&envelope) {
            debug!("Reply to {} dropped: {}", self.peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn setup_test_server() -> (String, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let state = RelayState::new(registry.clone());

        let app = axum::Router::new()
            .route("/ws/:peer_id", axum::routing::get(ws_handler))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr.to_string(), registry)
    }

    async fn connect_peer(addr: &str, peer_id: &str, registry: &Registry) -> Client {
        let url = format!("ws://{}/ws/{}", addr, peer_id);
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        wait_for_peer(registry, peer_id, true).await;
        ws
    }

    async fn wait_for_peer(registry: &Registry, peer_id: &str, present: bool) {
        for _ in 0..100 {
            if registry.exists(peer_id).await == present {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("peer {} never reached present={}", peer_id, present);
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timeout waiting for message")
            .unwrap()
            .unwrap();
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    async fn assert_silent(ws: &mut Client) {
        let res = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
        assert!(res.is_err(), "unexpected message: {:?}", res);
    }

    #[tokio::test]
    async fn test_register_ack() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;

        send(&mut alice, json!({"type": "register"})).await;
        assert_eq!(
            recv(&mut alice).await,
            json!({"type": "registered", "peer_id": "alice"})
        );

        // Acknowledgment is idempotent
        send(&mut alice, json!({"type": "register"})).await;
        assert_eq!(recv(&mut alice).await["type"], "registered");
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_routable_before_register() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        send(&mut alice, json!({"type": "connect", "target": "bob"})).await;
        assert_eq!(
            recv(&mut bob).await,
            json!({"type": "connection-request", "from": "alice"})
        );
        assert_eq!(registry.partner("alice").await.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn test_payloads_forwarded_in_order() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        let offer = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"});
        send(&mut alice, json!({"type": "offer", "target": "bob", "offer": offer})).await;
        for i in 0..5 {
            let candidate = json!({"candidate": format!("candidate:{}", i), "sdpMid": "0"});
            send(
                &mut alice,
                json!({"type": "ice-candidate", "target": "bob", "candidate": candidate}),
            )
            .await;
        }

        assert_eq!(
            recv(&mut bob).await,
            json!({"type": "offer", "from": "alice", "offer": offer})
        );
        for i in 0..5 {
            let msg = recv(&mut bob).await;
            assert_eq!(msg["type"], "ice-candidate");
            assert_eq!(msg["from"], "alice");
            assert_eq!(msg["candidate"]["candidate"], format!("candidate:{}", i));
        }

        let answer = json!({"type": "answer", "sdp": "v=0"});
        send(&mut bob, json!({"type": "answer", "target": "alice", "answer": answer})).await;
        assert_eq!(
            recv(&mut alice).await,
            json!({"type": "answer", "from": "bob", "answer": answer})
        );
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn test_client_supplied_from_is_replaced() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        send(
            &mut alice,
            json!({"type": "offer", "target": "bob", "from": "mallory", "offer": {}}),
        )
        .await;
        assert_eq!(recv(&mut bob).await["from"], "alice");
    }

    #[tokio::test]
    async fn test_unavailable_target() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;

        for msg_type in ["connect", "offer", "answer", "ice-candidate"] {
            send(&mut alice, json!({"type": msg_type, "target": "ghost"})).await;
            assert_eq!(
                recv(&mut alice).await,
                json!({"type": "peer-unavailable", "target": "ghost"})
            );
        }
        assert_silent(&mut alice).await;
        assert_eq!(registry.partner("alice").await, None);
    }

    #[tokio::test]
    async fn test_disconnect_notifies_target_only() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        send(&mut alice, json!({"type": "connect", "target": "bob"})).await;
        recv(&mut bob).await;

        send(&mut alice, json!({"type": "disconnect", "target": "bob"})).await;
        assert_eq!(
            recv(&mut bob).await,
            json!({"type": "peer-disconnected", "from": "alice"})
        );
        assert_silent(&mut alice).await;
        assert!(registry.exists("alice").await);
        assert_eq!(registry.partner("alice").await, None);

        // Disconnect to an absent peer is silent
        send(&mut alice, json!({"type": "disconnect", "target": "ghost"})).await;
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn test_cleanup_on_close() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        bob.close(None).await.unwrap();
        wait_for_peer(&registry, "bob", false).await;

        send(&mut alice, json!({"type": "ice-candidate", "target": "bob", "candidate": {}})).await;
        assert_eq!(
            recv(&mut alice).await,
            json!({"type": "peer-unavailable", "target": "bob"})
        );
    }

    #[tokio::test]
    async fn test_abrupt_drop_cleans_up() {
        let (addr, registry) = setup_test_server().await;
        let bob = connect_peer(&addr, "bob", &registry).await;

        drop(bob);
        wait_for_peer(&registry, "bob", false).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_input_ignored() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;

        alice.send(Message::Text("not valid json".to_string())).await.unwrap();
        send(&mut alice, json!({"target": "bob"})).await;
        send(&mut alice, json!(["register"])).await;
        send(&mut alice, json!({"type": 7})).await;
        send(&mut alice, json!({"type": "offer", "offer": {}})).await;
        send(&mut alice, json!({"type": "hello", "target": "bob"})).await;
        alice.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_silent(&mut alice).await;

        // Connection is still open and routable
        assert!(registry.exists("alice").await);
        send(&mut alice, json!({"type": "register"})).await;
        assert_eq!(recv(&mut alice).await["type"], "registered");
    }

    #[tokio::test]
    async fn test_reregistration_supersedes_previous_connection() {
        let (addr, registry) = setup_test_server().await;
        let mut old = connect_peer(&addr, "alice", &registry).await;
        let first_id = registry.lookup("alice").await.unwrap().conn_id();

        let url = format!("ws://{}/ws/alice", addr);
        let (mut new, _) = connect_async(&url).await.unwrap();
        for _ in 0..100 {
            let current = registry.lookup("alice").await.map(|h| h.conn_id());
            if current.is_some_and(|id| id != first_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Old socket receives a close frame
        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match old.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "superseded connection was not closed");

        // The old connection's cleanup leaves the new entry in place
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.exists("alice").await);

        let mut bob = connect_peer(&addr, "bob", &registry).await;
        send(&mut bob, json!({"type": "connect", "target": "alice"})).await;
        assert_eq!(
            recv(&mut new).await,
            json!({"type": "connection-request", "from": "bob"})
        );
    }

    #[tokio::test]
    async fn test_multiple_senders_to_one_target() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        let mut carol = connect_peer(&addr, "carol", &registry).await;
        let mut bob = connect_peer(&addr, "bob", &registry).await;

        send(&mut alice, json!({"type": "connect", "target": "bob"})).await;
        send(&mut carol, json!({"type": "connect", "target": "bob"})).await;

        let mut senders = vec![
            recv(&mut bob).await["from"].as_str().unwrap().to_string(),
            recv(&mut bob).await["from"].as_str().unwrap().to_string(),
        ];
        senders.sort();
        assert_eq!(senders, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn test_stalled_target_does_not_pin_sender() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;
        // Bob connects but never reads
        let _bob = connect_peer(&addr, "bob", &registry).await;

        let sdp = "a".repeat(64 * 1024);
        let flood = tokio::time::timeout(Duration::from_secs(10), async {
            for _ in 0..300 {
                send(
                    &mut alice,
                    json!({"type": "offer", "target": "bob", "offer": {"sdp": &sdp}}),
                )
                .await;
            }
        })
        .await;
        assert!(flood.is_ok(), "sender stalled behind a full target queue");

        drop(alice);
        wait_for_peer(&registry, "alice", false).await;
        assert!(registry.exists("bob").await);
    }

    #[tokio::test]
    async fn test_forward_to_dead_queue_is_dropped() {
        let (addr, registry) = setup_test_server().await;
        let mut alice = connect_peer(&addr, "alice", &registry).await;

        // Entry whose writer is already gone
        let (zombie, outbox) = registry.open_channel();
        registry.register("zombie", zombie).await;
        drop(outbox);

        send(&mut alice, json!({"type": "offer", "target": "zombie", "offer": {}})).await;
        assert_silent(&mut alice).await;

        send(&mut alice, json!({"type": "register"})).await;
        assert_eq!(
            recv(&mut alice).await,
            json!({"type": "registered", "peer_id": "alice"})
        );
    }
}
