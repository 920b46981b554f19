//! Connection manager (C5): per-connection handshake and frame dispatch.
//! Generic over any `AsyncRead + AsyncWrite` transport so the same code
//! serves plain TCP and TLS-wrapped sockets alike, mirroring how the
//! rest of the relay is transport-agnostic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use solconnect_crypto::{WalletAddress, primitives};
use solconnect_proto::{AckStatus, HandshakeRequest, HandshakeResponse, SessionParams, WireMessage};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::router::{ConnectionHandle, OUTBOUND_CHANNEL_CAPACITY, Router};

/// Bounded handshake timeout (§5): expiry closes the connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// No data from the peer within this window triggers an outbound ping.
/// Acts as the transport-agnostic substitute for a TCP-level keepalive
/// probe, since the handler is generic over the stream type.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// No activity at all (including a pong reply) within this window after
/// the connection has gone idle is treated as a dead peer.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-connection token bucket for chat/control frames: bursts up to
/// this many messages, refilling at the same rate per second.
const RATE_LIMIT_PER_SEC: f64 = 10.0;

pub struct HandshakeOutcome {
    pub wallet: WalletAddress,
}

/// Handle one accepted connection end to end: handshake, registration,
/// frame dispatch, and cleanup on disconnect.
pub async fn handle_connection<S>(
    mut stream: S,
    router: Arc<Router>,
    max_payload_len: u32,
) -> Result<(), RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        perform_handshake(&mut stream, max_payload_len),
    )
    .await
    .map_err(|_| RelayError::HandshakeFailed)??;

    let wallet = handshake.wallet;
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::channel::<WireMessage>(OUTBOUND_CHANNEL_CAPACITY);
    let outbound = tx.clone();
    let handle = ConnectionHandle::new(tx);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if solconnect_proto::write_frame(&mut writer, &message)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    router.register(wallet, handle.clone()).await;
    router.connection_opened();
    let opened_at = Instant::now();

    let reader_result = read_loop(reader, &router, wallet, outbound).await;

    router.unregister(&wallet, handle.id());
    router.connection_closed(opened_at.elapsed());
    writer_task.abort();

    reader_result
}

async fn perform_handshake<S>(
    stream: &mut S,
    max_payload_len: u32,
) -> Result<HandshakeOutcome, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut challenge);
    stream
        .write_all(&challenge)
        .await
        .map_err(|_| RelayError::ConnectionLost)?;

    let request = match solconnect_proto::read_frame(stream).await? {
        Some(WireMessage::HandshakeRequest(request)) => request,
        Some(_) => return Err(RelayError::ProtocolViolation),
        None => return Err(RelayError::ConnectionLost),
    };

    let accepted = verify_handshake(&request, &challenge);
    let response = HandshakeResponse {
        accepted,
        session_params: accepted.then_some(SessionParams {
            max_frame_len: solconnect_proto::MAX_FRAME_LEN,
            max_payload_len,
        }),
    };
    solconnect_proto::write_frame(stream, &WireMessage::HandshakeResponse(response)).await?;

    if !accepted {
        return Err(RelayError::HandshakeFailed);
    }

    Ok(HandshakeOutcome {
        wallet: WalletAddress(request.wallet),
    })
}

fn verify_handshake(request: &HandshakeRequest, challenge: &[u8; 32]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&request.wallet) else {
        return false;
    };
    let mut signed = Vec::with_capacity(64);
    signed.extend_from_slice(challenge);
    signed.extend_from_slice(&request.client_nonce);
    primitives::verify(&verifying_key, &signed, &request.signature).is_ok()
}

/// Token bucket guarding a single connection's chat/control frame rate.
/// Registration-time traffic (the handshake) never passes through this —
/// it's exempt the same way the teacher exempts CAP/SASL negotiation.
struct RateLimiter {
    tokens: f64,
    last_refill: Instant,
    max: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    fn new(rate_per_sec: f64) -> Self {
        Self {
            tokens: rate_per_sec,
            last_refill: Instant::now(),
            max: rate_per_sec,
            refill_per_sec: rate_per_sec,
        }
    }

    /// Returns `true` and consumes one token if the bucket isn't empty.
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.max);
        self.last_refill = now;
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

async fn read_loop<R>(
    mut reader: R,
    router: &Arc<Router>,
    wallet: WalletAddress,
    outbound: mpsc::Sender<WireMessage>,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut last_activity = Instant::now();
    let mut awaiting_pong = false;
    let mut limiter = RateLimiter::new(RATE_LIMIT_PER_SEC);

    loop {
        let frame = match tokio::time::timeout(PING_INTERVAL, solconnect_proto::read_frame(&mut reader)).await
        {
            Ok(result) => result?,
            Err(_) => {
                // No frame within the ping interval. Probe once; if the
                // peer stays silent past the pong timeout, give up.
                if awaiting_pong {
                    if last_activity.elapsed() > PONG_TIMEOUT {
                        return Err(RelayError::ConnectionLost);
                    }
                } else {
                    let nonce = ping_nonce();
                    if outbound.send(WireMessage::Ping(nonce)).await.is_err() {
                        return Err(RelayError::ConnectionLost);
                    }
                    awaiting_pong = true;
                }
                continue;
            }
        };

        let Some(message) = frame else {
            return Ok(());
        };
        last_activity = Instant::now();

        match message {
            WireMessage::Pong(_) => {
                awaiting_pong = false;
            }
            WireMessage::Ping(nonce) => {
                let _ = outbound.send(WireMessage::Pong(nonce)).await;
            }
            WireMessage::Chat(mut chat) => {
                // The router re-verifies the signature; it doesn't trust
                // the connection's authenticated wallet for anything but
                // the protocol-violation check below.
                if WalletAddress(chat.sender_wallet) != wallet {
                    return Err(RelayError::ProtocolViolation);
                }
                if !limiter.allow() {
                    router
                        .ack_to_sender(wallet, chat.message_id, AckStatus::Rejected)
                        .await;
                    continue;
                }
                chat.sender_wallet = wallet.0;
                router.route(chat).await;
            }
            WireMessage::Control(mut control) => {
                if WalletAddress(control.sender_wallet) != wallet {
                    return Err(RelayError::ProtocolViolation);
                }
                if !limiter.allow() {
                    continue;
                }
                control.sender_wallet = wallet.0;
                router.route_control(control);
            }
            WireMessage::HandshakeRequest(_) | WireMessage::HandshakeResponse(_) => {
                return Err(RelayError::ProtocolViolation);
            }
            WireMessage::Ack(_) => {
                // Clients don't send acks to the relay; only the relay
                // emits them.
                return Err(RelayError::ProtocolViolation);
            }
        }
    }
}

fn ping_nonce() -> [u8; 8] {
    let mut nonce = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use ed25519_dalek::{Signer, SigningKey};
    use std::sync::Arc;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_succeeds_for_a_correctly_signed_request() {
        let (mut client, server) = duplex(4096);
        let router = Arc::new(Router::new(
            100,
            10_000,
            Arc::new(crate::metrics::AtomicMetrics::new()),
        ));

        let server_task = tokio::spawn(handle_connection(server, router, 512 * 1024));

        let mut challenge = [0u8; 32];
        client.read_exact(&mut challenge).await.unwrap();

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let wallet = signing_key.verifying_key().to_bytes();
        let client_nonce = [7u8; 32];
        let mut signed = Vec::new();
        signed.extend_from_slice(&challenge);
        signed.extend_from_slice(&client_nonce);
        let signature = signing_key.sign(&signed).to_bytes();

        let request = HandshakeRequest {
            wallet,
            client_nonce,
            signature,
        };
        solconnect_proto::write_frame(
            &mut client,
            &WireMessage::HandshakeRequest(request),
        )
        .await
        .unwrap();

        let response = solconnect_proto::read_frame(&mut client).await.unwrap();
        match response {
            Some(WireMessage::HandshakeResponse(r)) => assert!(r.accepted),
            other => panic!("unexpected response: {other:?}"),
        }

        drop(client);
        let _ = server_task.await;
    }

    #[tokio::test]
    async fn handshake_rejects_a_bad_signature() {
        let (mut client, server) = duplex(4096);
        let router = Arc::new(Router::new(
            100,
            10_000,
            Arc::new(crate::metrics::AtomicMetrics::new()),
        ));

        let server_task = tokio::spawn(handle_connection(server, router, 512 * 1024));

        let mut challenge = [0u8; 32];
        client.read_exact(&mut challenge).await.unwrap();

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let wallet = signing_key.verifying_key().to_bytes();
        let request = HandshakeRequest {
            wallet,
            client_nonce: [1u8; 32],
            signature: [0u8; 64],
        };
        solconnect_proto::write_frame(
            &mut client,
            &WireMessage::HandshakeRequest(request),
        )
        .await
        .unwrap();

        let response = solconnect_proto::read_frame(&mut client).await.unwrap();
        match response {
            Some(WireMessage::HandshakeResponse(r)) => assert!(!r.accepted),
            other => panic!("unexpected response: {other:?}"),
        }

        let result = server_task.await.unwrap();
        assert!(matches!(result, Err(RelayError::HandshakeFailed)));
    }

    #[test]
    fn rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new(2.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow(), "bucket should be empty after two tokens");

        std::thread::sleep(Duration::from_millis(600));
        assert!(limiter.allow(), "should have refilled at least one token");
    }

    async fn handshake_as_client(
        client: &mut tokio::io::DuplexStream,
        signing_key: &SigningKey,
    ) -> [u8; 32] {
        let mut challenge = [0u8; 32];
        client.read_exact(&mut challenge).await.unwrap();

        let wallet = signing_key.verifying_key().to_bytes();
        let client_nonce = [3u8; 32];
        let mut signed = Vec::new();
        signed.extend_from_slice(&challenge);
        signed.extend_from_slice(&client_nonce);
        let signature = signing_key.sign(&signed).to_bytes();

        solconnect_proto::write_frame(
            client,
            &WireMessage::HandshakeRequest(HandshakeRequest {
                wallet,
                client_nonce,
                signature,
            }),
        )
        .await
        .unwrap();

        match solconnect_proto::read_frame(client).await.unwrap() {
            Some(WireMessage::HandshakeResponse(r)) if r.accepted => wallet,
            other => panic!("handshake was not accepted: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bursting_past_the_rate_limit_gets_the_overflow_message_rejected() {
        let (mut client, server) = duplex(1 << 16);
        let router = Arc::new(Router::new(
            100,
            10_000,
            Arc::new(crate::metrics::AtomicMetrics::new()),
        ));
        tokio::spawn(handle_connection(server, router, 512 * 1024));

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let wallet = handshake_as_client(&mut client, &signing_key).await;

        let mut message_ids = Vec::new();
        for i in 0..(RATE_LIMIT_PER_SEC as u8 + 1) {
            let mut chat = solconnect_proto::ChatMessage {
                message_id: [i; 16],
                sender_wallet: wallet,
                recipient_wallet: [9u8; 32],
                timestamp_ms: 0,
                encrypted_payload: vec![1, 2, 3],
                attachment_url: None,
                ttl_seconds: 60,
                signature: [0u8; 64],
            };
            chat.signature = signing_key.sign(&chat.signing_bytes()).to_bytes();
            message_ids.push(chat.message_id);
            solconnect_proto::write_frame(&mut client, &WireMessage::Chat(chat))
                .await
                .unwrap();
        }

        for id in &message_ids[..RATE_LIMIT_PER_SEC as usize] {
            match solconnect_proto::read_frame(&mut client).await.unwrap() {
                Some(WireMessage::Ack(ack)) => {
                    assert_eq!(&ack.ref_message_id, id);
                    assert_ne!(ack.status, solconnect_proto::AckStatus::Rejected);
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        match solconnect_proto::read_frame(&mut client).await.unwrap() {
            Some(WireMessage::Ack(ack)) => {
                assert_eq!(&ack.ref_message_id, message_ids.last().unwrap());
                assert_eq!(ack.status, solconnect_proto::AckStatus::Rejected);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
