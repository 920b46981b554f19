//! Message router (C6): the central stateful component. Holds the
//! wallet→connections and wallet→queue maps and decides, for each
//! inbound frame, whether to fan it out to live connections or hand it
//! to the delivery queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use solconnect_crypto::{WalletAddress, primitives};
use solconnect_proto::{Ack, AckStatus, ChatMessage, ControlMessage, MessageId, WireMessage};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::metrics::MetricsSink;
use crate::queue::{DeliveryQueue, EnqueueOutcome};

/// Maximum size of an encrypted chat payload the router will accept.
/// Chosen well under the 1 MiB frame cap so the tagged-union overhead
/// and length prefix never push a borderline frame over it.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Outbound capacity per connection. A full channel is treated as a
/// failed connection rather than applying unbounded backpressure.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A registered outbound channel for one connection. Two connections for
/// the same wallet (multi-device) get distinct handles.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::Sender<WireMessage>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<WireMessage>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub enum RouteOutcome {
    Delivered,
    Queued,
    Rejected(RelayError),
}

struct Routes {
    /// wallet -> connections currently registered for it.
    connections: HashMap<WalletAddress, Vec<ConnectionHandle>>,
}

/// Central router. Cheap to clone (wraps an `Arc` internally via the
/// caller holding `Arc<Router>`); the two maps share a single lock that
/// is held only across map mutation and FIFO handoff, never across
/// transport I/O.
pub struct Router {
    routes: Mutex<Routes>,
    queue: DeliveryQueue,
    metrics: Arc<dyn MetricsSink>,
}

impl Router {
    pub fn new(per_wallet_cap: usize, global_cap: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            routes: Mutex::new(Routes {
                connections: HashMap::new(),
            }),
            queue: DeliveryQueue::new(per_wallet_cap, global_cap),
            metrics,
        }
    }

    /// Insert `handle` into `wallet`'s connection set and atomically
    /// drain any queued messages into it, in FIFO order. Expired
    /// entries are discarded and an EXPIRED ack emitted for each.
    pub async fn register(&self, wallet: WalletAddress, handle: ConnectionHandle) -> usize {
        {
            let mut routes = self.routes.lock();
            let set = routes.connections.entry(wallet).or_default();
            if set.is_empty() {
                self.metrics.wallet_registered();
            }
            set.push(handle.clone());
        }

        let (live, expired) = self.queue.drain(&wallet);
        self.metrics.queue_depth_changed(-(live.len() as i64) - (expired.len() as i64));

        for entry in &expired {
            self.ack_to_sender(
                WalletAddress(entry.message.sender_wallet),
                entry.message.message_id,
                AckStatus::Expired,
            )
            .await;
            self.metrics.message_expired();
        }

        let mut drained = 0;
        for entry in live {
            if handle.tx.send(WireMessage::Chat(entry.message)).await.is_ok() {
                drained += 1;
            }
        }
        drained
    }

    /// Remove `handle` from `wallet`'s connection set. The wallet is
    /// offline once the set becomes empty.
    pub fn unregister(&self, wallet: &WalletAddress, handle_id: u64) {
        let mut routes = self.routes.lock();
        if let Some(set) = routes.connections.get_mut(wallet) {
            set.retain(|h| h.id() != handle_id);
            if set.is_empty() {
                routes.connections.remove(wallet);
                self.metrics.wallet_unregistered();
            }
        }
    }

    /// Route a chat message: verify the sender's signature, enforce
    /// TTL and payload-size caps, then deliver or enqueue.
    pub async fn route(&self, message: ChatMessage) -> RouteOutcome {
        let start = Instant::now();
        let outcome = self.route_inner(message).await;
        self.metrics.routing_latency(start.elapsed());
        outcome
    }

    async fn route_inner(&self, message: ChatMessage) -> RouteOutcome {
        if message.ttl_seconds == 0 {
            self.reject(&message, RelayError::InvalidTtl, AckStatus::Rejected)
                .await;
            return RouteOutcome::Rejected(RelayError::InvalidTtl);
        }
        if message.encrypted_payload.len() > MAX_PAYLOAD_BYTES {
            self.reject(&message, RelayError::PayloadTooLarge, AckStatus::Rejected)
                .await;
            return RouteOutcome::Rejected(RelayError::PayloadTooLarge);
        }
        if !self.verify_signature(&message) {
            self.reject(&message, RelayError::InvalidSignature, AckStatus::Rejected)
                .await;
            return RouteOutcome::Rejected(RelayError::InvalidSignature);
        }

        let recipient = WalletAddress(message.recipient_wallet);
        let sender = WalletAddress(message.sender_wallet);
        let message_id = message.message_id;
        let payload_len = message.encrypted_payload.len();

        let handles = {
            let routes = self.routes.lock();
            routes.connections.get(&recipient).cloned()
        };

        let Some(mut handles) = handles.filter(|h| !h.is_empty()) else {
            return self.enqueue_and_ack(recipient, sender, message).await;
        };

        let mut delivered_to_any = false;
        let mut failed_ids = Vec::new();
        for handle in &handles {
            match handle.tx.try_send(WireMessage::Chat(message.clone())) {
                Ok(()) => delivered_to_any = true,
                Err(_) => failed_ids.push(handle.id()),
            }
        }

        if !failed_ids.is_empty() {
            let mut routes = self.routes.lock();
            if let Some(set) = routes.connections.get_mut(&recipient) {
                set.retain(|h| !failed_ids.contains(&h.id()));
                if set.is_empty() {
                    routes.connections.remove(&recipient);
                    self.metrics.wallet_unregistered();
                }
            }
            handles.retain(|h| !failed_ids.contains(&h.id()));
        }

        if delivered_to_any {
            self.metrics.message_routed(payload_len);
            self.metrics.bytes_out(payload_len);
            self.ack_to_sender(sender, message_id, AckStatus::Delivered)
                .await;
            RouteOutcome::Delivered
        } else {
            self.enqueue_and_ack(recipient, sender, message).await
        }
    }

    async fn enqueue_and_ack(
        &self,
        recipient: WalletAddress,
        sender: WalletAddress,
        message: ChatMessage,
    ) -> RouteOutcome {
        let message_id = message.message_id;
        let payload_len = message.encrypted_payload.len();
        match self.queue.enqueue(recipient, message) {
            EnqueueOutcome::Accepted => {
                self.metrics.message_queued(payload_len);
                self.metrics.queue_depth_changed(1);
                self.ack_to_sender(sender, message_id, AckStatus::Queued).await;
                RouteOutcome::Queued
            }
            EnqueueOutcome::AcceptedWithEviction(evicted) => {
                self.metrics.message_queued(payload_len);
                self.metrics.message_expired();
                let evicted_sender = WalletAddress(evicted.message.sender_wallet);
                self.ack_to_sender(
                    evicted_sender,
                    evicted.message.message_id,
                    AckStatus::Expired,
                )
                .await;
                self.ack_to_sender(sender, message_id, AckStatus::Queued).await;
                RouteOutcome::Queued
            }
            EnqueueOutcome::RejectedGlobalFull => {
                self.metrics.message_rejected();
                self.ack_to_sender(sender, message_id, AckStatus::Failed).await;
                RouteOutcome::Rejected(RelayError::QueueFull)
            }
        }
    }

    /// Route a control-message frame (typing/read-receipt/reaction) the
    /// same way as a chat message, but best-effort: no queueing, no ack.
    /// The relay never interprets its payload.
    pub fn route_control(&self, control: ControlMessage) {
        let recipient = WalletAddress(control.recipient_wallet);
        let routes = self.routes.lock();
        if let Some(handles) = routes.connections.get(&recipient) {
            for handle in handles {
                let _ = handle.tx.try_send(WireMessage::Control(control.clone()));
            }
        }
    }

    /// Dispatch an ack to the sender's connection, if still connected.
    /// Acks are never queued for offline senders.
    pub async fn ack_to_sender(
        &self,
        sender: WalletAddress,
        ref_message_id: MessageId,
        status: AckStatus,
    ) {
        let handles = {
            let routes = self.routes.lock();
            routes.connections.get(&sender).cloned()
        };
        let Some(handles) = handles else { return };
        let ack = Ack {
            ack_id: rand_id(),
            ref_message_id,
            status,
        };
        for handle in &handles {
            let _ = handle.tx.try_send(WireMessage::Ack(ack.clone()));
        }
    }

    async fn reject(&self, message: &ChatMessage, _err: RelayError, status: AckStatus) {
        self.metrics.message_rejected();
        self.ack_to_sender(
            WalletAddress(message.sender_wallet),
            message.message_id,
            status,
        )
        .await;
    }

    fn verify_signature(&self, message: &ChatMessage) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&message.sender_wallet) else {
            return false;
        };
        primitives::verify(&verifying_key, &message.signing_bytes(), &message.signature).is_ok()
    }

    /// Run one pass of the periodic TTL sweep (§4.6: default every 10s),
    /// emitting an EXPIRED ack for every entry it discards.
    pub async fn sweep_expired(&self) {
        let swept = self.queue.sweep_expired();
        for entry in swept {
            self.metrics.message_expired();
            self.metrics.queue_depth_changed(-1);
            self.ack_to_sender(
                WalletAddress(entry.message.sender_wallet),
                entry.message.message_id,
                AckStatus::Expired,
            )
            .await;
        }
    }

    pub fn queue_total_len(&self) -> usize {
        self.queue.total_len()
    }

    pub fn connection_opened(&self) {
        self.metrics.connection_opened();
    }

    pub fn connection_closed(&self, lifetime: std::time::Duration) {
        self.metrics.connection_closed(lifetime);
    }
}

fn rand_id() -> [u8; 16] {
    use rand::RngCore;
    let mut id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_message(
        signing_key: &SigningKey,
        sender: [u8; 32],
        recipient: [u8; 32],
        ttl_seconds: u32,
    ) -> ChatMessage {
        let mut message = ChatMessage {
            message_id: rand_id(),
            sender_wallet: sender,
            recipient_wallet: recipient,
            timestamp_ms: 0,
            encrypted_payload: vec![1, 2, 3],
            attachment_url: None,
            ttl_seconds,
            signature: [0u8; 64],
        };
        message.signature = signing_key.sign(&message.signing_bytes()).to_bytes();
        message
    }

    fn test_metrics() -> Arc<crate::metrics::AtomicMetrics> {
        Arc::new(crate::metrics::AtomicMetrics::new())
    }

    #[tokio::test]
    async fn delivers_to_a_registered_recipient() {
        let metrics = test_metrics();
        let router = Router::new(100, 10_000, metrics.clone());
        let alice_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let bob = WalletAddress([7u8; 32]);

        let (tx, mut rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        router.register(bob, ConnectionHandle::new(tx)).await;

        let message = signed_message(&alice_key, alice_key.verifying_key().to_bytes(), bob.0, 60);
        assert!(matches!(router.route(message).await, RouteOutcome::Delivered));
        assert!(matches!(rx.recv().await, Some(WireMessage::Chat(_))));
        assert_eq!(metrics.snapshot().messages_routed, 1);
    }

    #[tokio::test]
    async fn queues_for_an_offline_recipient_then_drains_on_register() {
        let metrics = test_metrics();
        let router = Router::new(100, 10_000, metrics);
        let alice_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let bob = WalletAddress([8u8; 32]);

        for _ in 0..3 {
            let message =
                signed_message(&alice_key, alice_key.verifying_key().to_bytes(), bob.0, 60);
            assert!(matches!(router.route(message).await, RouteOutcome::Queued));
        }

        let (tx, mut rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let drained = router.register(bob, ConnectionHandle::new(tx)).await;
        assert_eq!(drained, 3);
        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(WireMessage::Chat(_))));
        }
    }

    #[tokio::test]
    async fn rejects_messages_with_invalid_signatures() {
        let metrics = test_metrics();
        let router = Router::new(100, 10_000, metrics.clone());
        let alice_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let eve_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let bob = WalletAddress([9u8; 32]);

        // Eve signs with her own key but claims Alice's wallet as sender.
        let message = signed_message(&eve_key, alice_key.verifying_key().to_bytes(), bob.0, 60);
        assert!(matches!(
            router.route(message).await,
            RouteOutcome::Rejected(RelayError::InvalidSignature)
        ));
        assert_eq!(metrics.snapshot().messages_rejected, 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected() {
        let metrics = test_metrics();
        let router = Router::new(100, 10_000, metrics);
        let alice_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let message =
            signed_message(&alice_key, alice_key.verifying_key().to_bytes(), [1u8; 32], 0);
        assert!(matches!(
            router.route(message).await,
            RouteOutcome::Rejected(RelayError::InvalidTtl)
        ));
    }
}
