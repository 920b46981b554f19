//! Drives two `SolConnectClient`s through a real `solconnect-relay` router
//! over in-memory duplex streams, end to end: connect, establish a
//! session, send, and receive.

use std::sync::Arc;

use solconnect_crypto::IdentityKeyPair;
use solconnect_relay::connection::handle_connection;
use solconnect_relay::metrics::AtomicMetrics;
use solconnect_relay::router::Router;
use solconnect_sdk::config::SdkConfig;
use solconnect_sdk::directory::InMemoryPeerDirectory;
use solconnect_sdk::event::Event;
use solconnect_sdk::SolConnectClient;

fn spawn_relay() -> Arc<Router> {
    Arc::new(Router::new(100, 10_000, Arc::new(AtomicMetrics::new())))
}

async fn connect_client(router: &Arc<Router>, client: &SolConnectClient) {
    let (client_side, relay_side) = tokio::io::duplex(8192);
    tokio::spawn(handle_connection(relay_side, router.clone(), 512 * 1024));
    client.connect_with_stream(client_side).await.unwrap();
}

#[tokio::test]
async fn basic_message_delivery() {
    let router = spawn_relay();
    let directory = Arc::new(InMemoryPeerDirectory::new());

    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();
    let bob_wallet = bob_identity.wallet();

    let alice = SolConnectClient::initialize(
        SdkConfig::new("unused", alice_identity).with_peer_directory(directory.clone()),
    );
    let bob = SolConnectClient::initialize(
        SdkConfig::new("unused", bob_identity).with_peer_directory(directory.clone()),
    );

    connect_client(&router, &alice).await;
    connect_client(&router, &bob).await;

    let bob_bundle = bob.publish_bundle().unwrap();
    directory.publish(bob_bundle);

    let bob_session_id = bob.expect_session(alice.wallet());
    let mut bob_sub = bob.subscribe(bob_session_id).unwrap();

    let session = alice.start_session(bob_wallet).unwrap();
    assert_eq!(session.peer_wallet, bob_wallet);

    let receipt = alice
        .send_message(session.id, b"hello bob")
        .await
        .unwrap();
    assert_eq!(receipt.status, solconnect_sdk::DeliveryStatus::Sent);

    match bob_sub.recv().await.expect("bob should receive a message") {
        Event::Message { plaintext, .. } => assert_eq!(plaintext, b"hello bob"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn offline_recipient_message_is_queued() {
    let router = spawn_relay();
    let directory = Arc::new(InMemoryPeerDirectory::new());

    let alice_identity = IdentityKeyPair::generate();
    let bob_identity = IdentityKeyPair::generate();

    let bob = SolConnectClient::initialize(
        SdkConfig::new("unused", bob_identity).with_peer_directory(directory.clone()),
    );
    let bob_wallet = bob.wallet();
    let bob_bundle = bob.publish_bundle().unwrap();
    directory.publish(bob_bundle);
    drop(bob); // Bob never connects: the relay has no channel registered for him.

    let alice = SolConnectClient::initialize(
        SdkConfig::new("unused", alice_identity).with_peer_directory(directory),
    );
    connect_client(&router, &alice).await;

    let session = alice.start_session(bob_wallet).unwrap();
    let receipt = alice
        .send_message(session.id, b"are you there?")
        .await
        .unwrap();
    assert_eq!(receipt.status, solconnect_sdk::DeliveryStatus::Queued);
    assert_eq!(router.queue_total_len(), 1);
}
