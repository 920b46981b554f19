//! Delivery queue (C7): a bounded per-recipient FIFO with TTL expiry and
//! a global cap. Bounded memory under adversarial load; newer messages
//! are preferred over stale ones.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use solconnect_proto::ChatMessage;
use solconnect_crypto::WalletAddress;

pub const DEFAULT_PER_WALLET_CAP: usize = 100;
pub const DEFAULT_GLOBAL_CAP: usize = 10_000;

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message: ChatMessage,
    pub enqueued_at: Instant,
    pub expires_at: Instant,
}

impl QueuedMessage {
    fn new(message: ChatMessage) -> Self {
        let now = Instant::now();
        let ttl = Duration::from_secs(message.ttl_seconds as u64);
        Self {
            message,
            enqueued_at: now,
            expires_at: now + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Outcome of an enqueue attempt, used by the router to decide which
/// acks to emit.
pub enum EnqueueOutcome {
    Accepted,
    AcceptedWithEviction(QueuedMessage),
    RejectedGlobalFull,
}

struct Inner {
    per_wallet: HashMap<WalletAddress, VecDeque<QueuedMessage>>,
    total_len: usize,
}

/// Per-recipient bounded FIFO, capped globally across all recipients.
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    per_wallet_cap: usize,
    global_cap: usize,
}

impl DeliveryQueue {
    pub fn new(per_wallet_cap: usize, global_cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                per_wallet: HashMap::new(),
                total_len: 0,
            }),
            per_wallet_cap,
            global_cap,
        }
    }

    /// Enqueue a message for `recipient`. On a full per-recipient queue,
    /// evicts the oldest entry to make room. On a full global queue,
    /// rejects the new message outright.
    pub fn enqueue(&self, recipient: WalletAddress, message: ChatMessage) -> EnqueueOutcome {
        let mut inner = self.inner.lock();
        let total_len = inner.total_len;
        let queue = inner.per_wallet.entry(recipient).or_default();

        if queue.len() >= self.per_wallet_cap {
            let evicted = queue.pop_front();
            queue.push_back(QueuedMessage::new(message));
            if let Some(evicted) = evicted {
                return EnqueueOutcome::AcceptedWithEviction(evicted);
            }
            return EnqueueOutcome::Accepted;
        }

        if total_len >= self.global_cap {
            return EnqueueOutcome::RejectedGlobalFull;
        }

        queue.push_back(QueuedMessage::new(message));
        inner.total_len += 1;
        EnqueueOutcome::Accepted
    }

    /// Drain all non-expired entries for `recipient` in FIFO order.
    /// Expired entries are discarded and returned separately so the
    /// caller can emit EXPIRED acks for them.
    pub fn drain(&self, recipient: &WalletAddress) -> (Vec<QueuedMessage>, Vec<QueuedMessage>) {
        let mut inner = self.inner.lock();
        let Some(queue) = inner.per_wallet.remove(recipient) else {
            return (Vec::new(), Vec::new());
        };
        inner.total_len = inner.total_len.saturating_sub(queue.len());

        let now = Instant::now();
        let mut live = Vec::with_capacity(queue.len());
        let mut expired = Vec::new();
        for entry in queue {
            if entry.is_expired(now) {
                expired.push(entry);
            } else {
                live.push(entry);
            }
        }
        (live, expired)
    }

    /// Periodic sweep: remove expired entries from every recipient queue
    /// without draining the live ones, returning what was swept.
    pub fn sweep_expired(&self) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut swept = Vec::new();
        for queue in inner.per_wallet.values_mut() {
            let mut i = 0;
            while i < queue.len() {
                if queue[i].is_expired(now) {
                    if let Some(entry) = queue.remove(i) {
                        swept.push(entry);
                    }
                } else {
                    i += 1;
                }
            }
        }
        inner.total_len = inner.total_len.saturating_sub(swept.len());
        swept
    }

    pub fn len_for(&self, recipient: &WalletAddress) -> usize {
        self.inner
            .lock()
            .per_wallet
            .get(recipient)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn total_len(&self) -> usize {
        self.inner.lock().total_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet(byte: u8) -> WalletAddress {
        WalletAddress([byte; 32])
    }

    fn chat_message(ttl_seconds: u32) -> ChatMessage {
        ChatMessage {
            message_id: [1u8; 16],
            sender_wallet: [2u8; 32],
            recipient_wallet: [3u8; 32],
            timestamp_ms: 0,
            encrypted_payload: vec![9, 9, 9],
            attachment_url: None,
            ttl_seconds,
            signature: [0u8; 64],
        }
    }

    #[test]
    fn enqueue_and_drain_preserves_fifo_order() {
        let q = DeliveryQueue::new(10, 100);
        let bob = wallet(1);
        for i in 0..3u8 {
            let mut m = chat_message(60);
            m.message_id = [i; 16];
            assert!(matches!(q.enqueue(bob, m), EnqueueOutcome::Accepted));
        }
        let (live, expired) = q.drain(&bob);
        assert!(expired.is_empty());
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].message.message_id, [0u8; 16]);
        assert_eq!(live[2].message.message_id, [2u8; 16]);
    }

    #[test]
    fn per_wallet_cap_evicts_oldest() {
        let q = DeliveryQueue::new(3, 100);
        let bob = wallet(1);
        for i in 0..4u8 {
            let mut m = chat_message(60);
            m.message_id = [i; 16];
            let outcome = q.enqueue(bob, m);
            if i < 3 {
                assert!(matches!(outcome, EnqueueOutcome::Accepted));
            } else {
                match outcome {
                    EnqueueOutcome::AcceptedWithEviction(evicted) => {
                        assert_eq!(evicted.message.message_id, [0u8; 16]);
                    }
                    _ => panic!("expected eviction"),
                }
            }
        }
        let (live, _) = q.drain(&bob);
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].message.message_id, [1u8; 16]);
    }

    #[test]
    fn global_cap_rejects_new_messages() {
        let q = DeliveryQueue::new(100, 2);
        let bob = wallet(1);
        let carol = wallet(2);
        assert!(matches!(
            q.enqueue(bob, chat_message(60)),
            EnqueueOutcome::Accepted
        ));
        assert!(matches!(
            q.enqueue(carol, chat_message(60)),
            EnqueueOutcome::Accepted
        ));
        assert!(matches!(
            q.enqueue(bob, chat_message(60)),
            EnqueueOutcome::RejectedGlobalFull
        ));
    }

    #[test]
    fn expired_entries_are_skipped_on_drain() {
        let q = DeliveryQueue::new(10, 100);
        let bob = wallet(1);
        q.enqueue(bob, chat_message(0));
        std::thread::sleep(Duration::from_millis(5));
        let (live, expired) = q.drain(&bob);
        assert!(live.is_empty());
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn sweep_removes_expired_without_touching_live_entries() {
        let q = DeliveryQueue::new(10, 100);
        let bob = wallet(1);
        q.enqueue(bob, chat_message(0));
        q.enqueue(bob, chat_message(60));
        std::thread::sleep(Duration::from_millis(5));
        let swept = q.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(q.len_for(&bob), 1);
    }
}
