//! The client facade (C9): wallet connect, session lifecycle, and
//! send/receive. Mirrors the relay's connection pattern from the other
//! side — a background task owns the socket, the caller only ever touches
//! a cheap, cloneable handle and a channel of commands/events.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::RngCore;
use solconnect_crypto::{
    IdentityKeyPair, IdentityStore, InitialHandshake, PreKeyBundle, SessionEnvelope, WalletAddress,
};
use solconnect_proto::{
    AckStatus, ChatMessage, ControlKind, ControlMessage, HandshakeRequest, MessageId,
    WireMessage,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

use crate::config::SdkConfig;
use crate::error::SdkError;
use crate::event::{DeliveryStatus, Event};

/// Matches the relay's own payload cap (§C6). Duplicated rather than
/// imported: the SDK and the relay are peers over the wire, neither
/// depends on the other's crate.
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const ACK_TIMEOUT: Duration = Duration::from_secs(15);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletInfo {
    pub wallet: WalletAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSession {
    pub id: [u8; 32],
    pub peer_wallet: WalletAddress,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryReceipt {
    pub message_id: MessageId,
    pub status: DeliveryStatus,
    pub timestamp_ms: u64,
}

struct SessionEntry {
    peer_wallet: WalletAddress,
    session: Option<solconnect_crypto::Session>,
    /// Rides on the next outgoing message only; `Session::initiate` hands
    /// this back once per session.
    pending_handshake: Option<InitialHandshake>,
    subscribers: HashMap<u64, mpsc::Sender<Event>>,
}

impl SessionEntry {
    fn empty(peer_wallet: WalletAddress) -> Self {
        Self {
            peer_wallet,
            session: None,
            pending_handshake: None,
            subscribers: HashMap::new(),
        }
    }

    fn broadcast(&self, event: Event) {
        for tx in self.subscribers.values() {
            let _ = tx.try_send(event.clone());
        }
    }
}

struct PendingAck {
    session_id: [u8; 32],
    responder: oneshot::Sender<AckStatus>,
}

struct Inner {
    config: SdkConfig,
    wallet: WalletAddress,
    sessions: Mutex<HashMap<[u8; 32], SessionEntry>>,
    pending_acks: Mutex<HashMap<MessageId, PendingAck>>,
    outbound: Mutex<Option<mpsc::Sender<WireMessage>>>,
}

/// Owns the connection to a relay and every active session for one wallet.
#[derive(Clone)]
pub struct SolConnectClient {
    inner: Arc<Inner>,
}

impl SolConnectClient {
    /// Prepares the client without touching the network. Seeds the local
    /// identity store with the presented wallet identity so this client can
    /// both publish its own bundle and respond to sessions others initiate.
    pub fn initialize(config: SdkConfig) -> Self {
        let wallet = config.identity.wallet();
        config.identity_store.insert_identity(config.identity.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                wallet,
                sessions: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
            }),
        }
    }

    pub fn wallet(&self) -> WalletAddress {
        self.inner.wallet
    }

    /// Publishes this client's current pre-key bundle so peers can
    /// `start_session` with it. Not dialed automatically by `connect_wallet`
    /// since the distribution channel is host-application specific; call
    /// this once the directory is ready to accept it.
    pub fn publish_bundle(&self) -> Result<PreKeyBundle, SdkError> {
        let bundle = self
            .inner
            .config
            .identity_store
            .publish_prekey_bundle(self.inner.wallet)?;
        Ok(bundle)
    }

    /// Connects to the configured relay, authenticates as this wallet, and
    /// spawns the background reader/writer tasks. Returns once the relay
    /// has accepted the handshake.
    pub async fn connect_wallet(&self) -> Result<WalletInfo, SdkError> {
        let addr = self.inner.config.relay_endpoint.clone();
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|_| SdkError::ConnectionLost)?;

        if self.inner.config.tls {
            let connector = build_tls_connector(self.inner.config.tls_insecure);
            let host = addr.split(':').next().unwrap_or("localhost").to_string();
            let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host)
                .map_err(|_| SdkError::ConnectionLost)?
                .to_owned();
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|_| SdkError::ConnectionLost)?;
            self.connect_with_stream(tls_stream).await
        } else {
            self.connect_with_stream(tcp).await
        }
    }

    /// Runs the handshake and spawns the reader/writer tasks over an
    /// already-established stream. `connect_wallet` is the usual entry
    /// point; this is exposed for callers (and tests) that already have a
    /// transport, e.g. one upgraded out of band or an in-memory duplex.
    pub async fn connect_with_stream<S>(&self, mut stream: S) -> Result<WalletInfo, SdkError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        perform_handshake(&mut stream, &self.inner.config.identity).await?;

        let (reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<WireMessage>(OUTBOUND_CHANNEL_CAPACITY);
        *self.inner.outbound.lock() = Some(tx);

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if solconnect_proto::write_frame(&mut writer, &message)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        tokio::spawn(async move {
            read_loop(reader, inner).await;
        });

        Ok(WalletInfo { wallet: self.inner.wallet })
    }

    /// Derives the session id a peer would use, so a subscriber can attach
    /// before the peer's first message arrives.
    pub fn session_id_for(&self, peer_wallet: WalletAddress) -> [u8; 32] {
        solconnect_crypto::Session::compute_session_id(self.inner.wallet, peer_wallet)
    }

    /// Reserves a session slot for `peer_wallet` without running the X3DH
    /// handshake, so `subscribe` has somewhere to attach before that peer's
    /// first message (or this client's own `start_session`) arrives.
    pub fn expect_session(&self, peer_wallet: WalletAddress) -> [u8; 32] {
        let id = self.session_id_for(peer_wallet);
        let mut sessions = self.inner.sessions.lock();
        sessions
            .entry(id)
            .or_insert_with(|| SessionEntry::empty(peer_wallet));
        id
    }

    /// Initiates a Double Ratchet session with `peer_wallet`, fetching its
    /// prekey bundle from the configured `PeerDirectory`. The X3DH handshake
    /// reference is attached automatically to the first message
    /// `send_message` sends on this session.
    pub fn start_session(&self, peer_wallet: WalletAddress) -> Result<ChatSession, SdkError> {
        let peer_bundle = self
            .inner
            .config
            .peer_directory
            .fetch(peer_wallet)
            .map_err(|_| SdkError::PeerUnknown)?;

        let (session, handshake) =
            solconnect_crypto::Session::initiate(&self.inner.config.identity, &peer_bundle)?;
        let id = session.session_id();
        let peer_wallet = peer_bundle.wallet;

        let mut sessions = self.inner.sessions.lock();
        let entry = sessions
            .entry(id)
            .or_insert_with(|| SessionEntry::empty(peer_wallet));
        entry.session = Some(session);
        entry.pending_handshake = Some(handshake);

        Ok(ChatSession { id, peer_wallet })
    }

    /// Terminates ratchet state for a session and drops it. Idempotent.
    pub fn end_session(&self, session_id: [u8; 32]) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(mut entry) = sessions.remove(&session_id) {
            if let Some(session) = entry.session.as_mut() {
                session.terminate();
            }
        }
    }

    /// Encrypts `plaintext` under `session_id`'s ratchet, sends it to the
    /// relay, and waits for the relay's terminal ack (delivered, queued, or
    /// failed/expired/rejected — the last three all surface as `Failed`).
    pub async fn send_message(
        &self,
        session_id: [u8; 32],
        plaintext: &[u8],
    ) -> Result<DeliveryReceipt, SdkError> {
        self.send_with_ttl(session_id, plaintext, 86_400).await
    }

    pub async fn send_with_ttl(
        &self,
        session_id: [u8; 32],
        plaintext: &[u8],
        ttl_seconds: u32,
    ) -> Result<DeliveryReceipt, SdkError> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(SdkError::NotConnected)?;

        let (peer_wallet, header, ciphertext, handshake) = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions.get_mut(&session_id).ok_or(SdkError::UnknownSession)?;
            let session = entry.session.as_mut().ok_or(SdkError::UnknownSession)?;
            let (header, ciphertext) = session.encrypt(plaintext)?;
            (entry.peer_wallet, header, ciphertext, entry.pending_handshake.take())
        };

        let envelope = SessionEnvelope {
            version: solconnect_crypto::envelope::ENVELOPE_VERSION,
            sender_wallet: self.inner.wallet,
            header,
            ciphertext,
            handshake,
        };
        let payload = envelope.to_bytes();
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(SdkError::PayloadTooLarge);
        }

        let message_id = random_message_id();
        let timestamp_ms = now_millis();
        let mut chat = ChatMessage {
            message_id,
            sender_wallet: self.inner.wallet.0,
            recipient_wallet: peer_wallet.0,
            timestamp_ms,
            encrypted_payload: payload,
            attachment_url: None,
            ttl_seconds,
            signature: [0u8; 64],
        };
        chat.signature = self.inner.config.identity.sign(&chat.signing_bytes());

        let (responder, awaiter) = oneshot::channel();
        self.inner.pending_acks.lock().insert(
            message_id,
            PendingAck { session_id, responder },
        );

        if outbound.send(WireMessage::Chat(chat)).await.is_err() {
            self.inner.pending_acks.lock().remove(&message_id);
            return Err(SdkError::ClientShutDown);
        }

        let status = tokio::time::timeout(ACK_TIMEOUT, awaiter)
            .await
            .map_err(|_| SdkError::AckTimeout)?
            .map_err(|_| SdkError::ClientShutDown)?;

        Ok(DeliveryReceipt {
            message_id,
            status: status.into(),
            timestamp_ms,
        })
    }

    /// Submits an opaque control payload (typing, read receipt, reaction)
    /// to the session's peer. Uninterpreted by the relay; delivered best
    /// effort, with no ack and no queueing for an offline peer.
    pub async fn send_control(
        &self,
        session_id: [u8; 32],
        kind: ControlKind,
        payload: Vec<u8>,
    ) -> Result<(), SdkError> {
        let outbound = self
            .inner
            .outbound
            .lock()
            .clone()
            .ok_or(SdkError::NotConnected)?;
        let peer_wallet = {
            let sessions = self.inner.sessions.lock();
            sessions
                .get(&session_id)
                .ok_or(SdkError::UnknownSession)?
                .peer_wallet
        };
        let control = ControlMessage {
            control_id: random_message_id(),
            sender_wallet: self.inner.wallet.0,
            recipient_wallet: peer_wallet.0,
            kind,
            payload,
        };
        outbound
            .send(WireMessage::Control(control))
            .await
            .map_err(|_| SdkError::ClientShutDown)
    }

    /// Subscribes to events for a session already known to this client
    /// (created by `start_session` or reserved by `expect_session`).
    pub fn subscribe(&self, session_id: [u8; 32]) -> Result<Subscription, SdkError> {
        let mut sessions = self.inner.sessions.lock();
        let entry = sessions.get_mut(&session_id).ok_or(SdkError::UnknownSession)?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let id = NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed);
        entry.subscribers.insert(id, tx);
        Ok(Subscription {
            id,
            session_id,
            rx,
            inner: self.inner.clone(),
        })
    }
}

pub struct Subscription {
    id: u64,
    session_id: [u8; 32],
    rx: mpsc::Receiver<Event>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(entry) = self.inner.sessions.lock().get_mut(&self.session_id) {
            entry.subscribers.remove(&self.id);
        }
    }
}

fn random_message_id() -> MessageId {
    let mut id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn build_tls_connector(insecure: bool) -> TlsConnector {
    use tokio_rustls::rustls;
    let config = if insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}

#[derive(Debug)]
struct NoVerify;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &tokio_rustls::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error>
    {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme::*;
        vec![ED25519, ECDSA_NISTP256_SHA256, RSA_PSS_SHA256, RSA_PKCS1_SHA256]
    }
}

async fn perform_handshake<S>(stream: &mut S, identity: &IdentityKeyPair) -> Result<(), SdkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; 32];
    stream
        .read_exact(&mut challenge)
        .await
        .map_err(|_| SdkError::ConnectionLost)?;

    let mut client_nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut client_nonce);
    let mut signed = Vec::with_capacity(64);
    signed.extend_from_slice(&challenge);
    signed.extend_from_slice(&client_nonce);

    let request = HandshakeRequest {
        wallet: identity.wallet().0,
        client_nonce,
        signature: identity.sign(&signed),
    };
    solconnect_proto::write_frame(stream, &WireMessage::HandshakeRequest(request))
        .await
        .map_err(|_| SdkError::ConnectionLost)?;

    match solconnect_proto::read_frame(stream).await {
        Ok(Some(WireMessage::HandshakeResponse(response))) if response.accepted => Ok(()),
        _ => Err(SdkError::HandshakeFailed),
    }
}

async fn read_loop<R>(mut reader: R, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match solconnect_proto::read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            _ => {
                broadcast_disconnect(&inner, "connection to relay lost");
                return;
            }
        };

        match frame {
            WireMessage::Chat(chat) => handle_inbound_chat(&inner, chat),
            WireMessage::Control(control) => handle_inbound_control(&inner, control),
            WireMessage::Ack(ack) => handle_inbound_ack(&inner, ack),
            WireMessage::Ping(nonce) => {
                let outbound = inner.outbound.lock().clone();
                if let Some(outbound) = outbound {
                    let _ = outbound.send(WireMessage::Pong(nonce)).await;
                }
            }
            WireMessage::Pong(_) => {}
            WireMessage::HandshakeRequest(_) | WireMessage::HandshakeResponse(_) => {}
        }
    }
}

fn handle_inbound_chat(inner: &Arc<Inner>, chat: ChatMessage) {
    let Ok(envelope) = SessionEnvelope::from_bytes(&chat.encrypted_payload) else {
        return;
    };
    let sender = envelope.sender_wallet;
    let session_id = solconnect_crypto::Session::compute_session_id(inner.wallet, sender);

    let mut sessions = inner.sessions.lock();
    let entry = sessions
        .entry(session_id)
        .or_insert_with(|| SessionEntry::empty(sender));

    if entry.session.is_none() {
        let Some(handshake) = envelope.handshake else {
            return;
        };
        let Ok(session) = solconnect_crypto::Session::respond(
            &inner.config.identity,
            inner.config.identity_store.as_ref(),
            sender,
            &handshake,
        ) else {
            return;
        };
        entry.session = Some(session);
    }

    let Some(session) = entry.session.as_mut() else {
        return;
    };
    if let Ok(plaintext) = session.decrypt(&envelope.header, &envelope.ciphertext) {
        entry.broadcast(Event::Message {
            message_id: chat.message_id,
            plaintext,
        });
    }
}

fn handle_inbound_control(inner: &Arc<Inner>, control: ControlMessage) {
    let sender = WalletAddress(control.sender_wallet);
    let session_id = solconnect_crypto::Session::compute_session_id(inner.wallet, sender);
    let sessions = inner.sessions.lock();
    if let Some(entry) = sessions.get(&session_id) {
        entry.broadcast(Event::Control {
            kind: control.kind,
            payload: control.payload,
        });
    }
}

fn handle_inbound_ack(inner: &Arc<Inner>, ack: solconnect_proto::Ack) {
    let Some(pending) = inner.pending_acks.lock().remove(&ack.ref_message_id) else {
        return;
    };
    if let Some(entry) = inner.sessions.lock().get(&pending.session_id) {
        entry.broadcast(Event::Ack {
            message_id: ack.ref_message_id,
            status: ack.status.into(),
        });
    }
    let _ = pending.responder.send(ack.status);
}

fn broadcast_disconnect(inner: &Arc<Inner>, reason: &str) {
    let sessions = inner.sessions.lock();
    for entry in sessions.values() {
        entry.broadcast(Event::Disconnected {
            reason: reason.to_string(),
        });
    }
}

