//! Integration tests for multi-node behaviour.
//!
//! Every node runs on the in-process `MemoryNetwork`, so these scenarios
//! exercise the full stack (codec, dispatcher, lookups, stores, bootstrap)
//! without touching real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use overlay_dht::dht::message::{Message, MessageBody, Sender, StoreStatusCode};
use overlay_dht::dht::{SecurityToken, Transport};
use overlay_dht::{Dht, DhtSettings, DhtValueEntity, DhtValueType, Kuid, MemoryNetwork};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_settings() -> DhtSettings {
    DhtSettings {
        request_timeout_ms: 500,
        request_sweep_interval_ms: 20,
        lookup_timeout_ms: 5_000,
        ..DhtSettings::default()
    }
}

fn node(network: &Arc<MemoryNetwork>) -> Dht {
    let transport: Arc<dyn Transport> = Arc::new(network.bind_next().expect("bind failed"));
    Dht::with_transport(transport, fast_settings()).expect("node creation failed")
}

/// A seed node plus `count - 1` nodes bootstrapped through it
async fn network_of(network: &Arc<MemoryNetwork>, count: usize) -> Vec<Dht> {
    let seed = node(network);
    seed.bootstrap(Vec::new()).await.expect("seed bootstrap failed");
    let seed_addr = seed.local_addr();

    let mut nodes = vec![seed];
    for _ in 1..count {
        let dht = node(network);
        dht.bootstrap(vec![seed_addr]).await.expect("bootstrap failed");
        nodes.push(dht);
    }
    nodes
}

async fn shutdown_all(nodes: &[Dht]) {
    for dht in nodes {
        dht.shutdown().await;
    }
}

/// Send one raw request and wait for its response
async fn raw_exchange(
    transport: &dyn Transport,
    sender: Sender,
    to: SocketAddr,
    body: MessageBody,
) -> Message {
    let request = Message::request(sender, body);
    transport.send_to(&request.encode(), to).await.expect("send failed");
    loop {
        let (data, from) = timeout(TEST_TIMEOUT, transport.recv_from())
            .await
            .expect("no response")
            .expect("receive failed");
        let message = Message::decode(&data).expect("undecodable response");
        if from == to && message.id == request.id {
            return message;
        }
    }
}

// =============================================================================
// Test: three-node bootstrap
// =============================================================================

/// B and C bootstrap through A; afterwards A finds C as the node closest to C's id.
#[tokio::test]
async fn three_node_bootstrap_and_lookup() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 3).await;
    let (a, c) = (&nodes[0], &nodes[2]);

    for dht in &nodes {
        assert!(dht.is_bootstrapped());
        assert!(dht.is_ready());
    }

    let result = timeout(TEST_TIMEOUT, a.lookup_nodes(c.local_id()))
        .await
        .expect("lookup timed out")
        .expect("lookup failed");
    assert_eq!(result.contacts.first().map(|contact| contact.id), Some(c.local_id()));
    assert_eq!(result.contacts.len(), 2);
    assert!(result.token_for(&c.local_id()).is_some());

    shutdown_all(&nodes).await;
}

/// A node that has never seen anyone does not answer pings until it bootstraps.
#[tokio::test]
async fn bootstrap_fails_against_silent_seed() {
    let network = MemoryNetwork::new();
    let lonely = node(&network);
    lonely.start();

    let joiner = node(&network);
    let err = joiner
        .bootstrap(vec![lonely.local_addr()])
        .await
        .expect_err("bootstrap should fail");
    assert!(!joiner.is_bootstrapped());
    assert!(err.to_string().contains("No bootstrap seed responded"));

    lonely.shutdown().await;
    joiner.shutdown().await;
}

// =============================================================================
// Test: store and find value
// =============================================================================

/// A value stored from one node comes back byte for byte from another.
#[tokio::test]
async fn store_then_find_value_round_trip() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 5).await;
    let (writer, reader) = (&nodes[1], &nodes[4]);

    let key = Kuid::hash_of(b"round-trip");
    let value: Vec<u8> = (0u8..=255).collect();

    let stored = timeout(TEST_TIMEOUT, writer.submit_store(key, DhtValueType::BINARY, value.clone()))
        .await
        .expect("store timed out")
        .expect("store failed");
    assert_eq!(stored.stored_at.len(), 4);
    assert!(stored.failed.is_empty());

    let found = timeout(TEST_TIMEOUT, reader.submit_find_value(key, DhtValueType::BINARY))
        .await
        .expect("lookup timed out")
        .expect("lookup failed");
    assert!(found.is_found());
    assert_eq!(found.entities.len(), 1);
    assert_eq!(found.entities[0].value, value);
    assert_eq!(found.entities[0].creator, writer.local_id());
    assert_eq!(found.entities[0].value_type, DhtValueType::BINARY);

    // type filter
    let other = reader
        .submit_find_value(key, DhtValueType::TEXT)
        .await
        .expect("lookup failed");
    assert!(!other.is_found());

    shutdown_all(&nodes).await;
}

/// Removing a value deletes the replicas too.
#[tokio::test]
async fn remove_clears_replicas() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 3).await;
    let writer = &nodes[2];
    let key = Kuid::hash_of(b"short-lived");

    writer
        .submit_store(key, DhtValueType::TEXT, b"hello".to_vec())
        .await
        .expect("store failed");
    assert!(nodes[0].dispatcher().database().read().contains_key(&key));

    writer.submit_remove(key, DhtValueType::TEXT).await.expect("remove failed");
    for dht in &nodes {
        assert!(!dht.dispatcher().database().read().contains_key(&key));
    }

    shutdown_all(&nodes).await;
}

// =============================================================================
// Test: security tokens
// =============================================================================

/// Stores without a token issued to the sender's address are rejected and
/// leave nothing behind.
#[tokio::test]
async fn store_without_valid_token_is_rejected() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 2).await;
    let target = &nodes[0];

    let attacker = network.bind_next().expect("bind failed");
    let accomplice = network.bind_next().expect("bind failed");
    let attacker_id = Kuid::random();
    let sender = Sender::local(attacker_id, 0, false);
    let key = Kuid::hash_of(b"forged");
    let entity = DhtValueEntity::new(
        attacker_id,
        attacker.local_addr(),
        key,
        DhtValueType::BINARY,
        b"forged".to_vec(),
    );

    // no token at all
    let response = raw_exchange(
        &attacker,
        sender,
        target.local_addr(),
        MessageBody::StoreRequest {
            token: SecurityToken::empty(),
            entities: vec![entity.clone()],
        },
    )
    .await;
    match response.body {
        MessageBody::StoreResponse { status, results } => {
            assert_eq!(status, StoreStatusCode::InvalidToken);
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].code, StoreStatusCode::InvalidToken);
        }
        other => panic!("unexpected response {:?}", other),
    }

    // a genuine token, but issued to a different address
    let response = raw_exchange(
        &accomplice,
        Sender::local(Kuid::random(), 0, false),
        target.local_addr(),
        MessageBody::FindNodeRequest { target: key },
    )
    .await;
    let token = match response.body {
        MessageBody::FindNodeResponse { token, .. } => token,
        other => panic!("unexpected response {:?}", other),
    };
    assert!(!token.is_empty());

    let response = raw_exchange(
        &attacker,
        sender,
        target.local_addr(),
        MessageBody::StoreRequest {
            token,
            entities: vec![entity],
        },
    )
    .await;
    match response.body {
        MessageBody::StoreResponse { status, .. } => assert_eq!(status, StoreStatusCode::InvalidToken),
        other => panic!("unexpected response {:?}", other),
    }

    assert!(!target.dispatcher().database().read().contains_key(&key));
    shutdown_all(&nodes).await;
}

/// A third party holding a valid token can neither replace nor delete a
/// value that its creator stored directly.
#[tokio::test]
async fn foreign_creator_cannot_overwrite_or_remove() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 2).await;
    let (holder, owner) = (&nodes[0], &nodes[1]);
    let key = Kuid::hash_of(b"owned");

    let stored = owner
        .submit_store(key, DhtValueType::TEXT, b"genuine".to_vec())
        .await
        .expect("store failed");
    assert_eq!(stored.stored_at.len(), 1);

    let intruder = network.bind_next().expect("bind failed");
    let sender = Sender::local(Kuid::random(), 0, false);
    let response = raw_exchange(
        &intruder,
        sender,
        holder.local_addr(),
        MessageBody::FindNodeRequest { target: key },
    )
    .await;
    let token = match response.body {
        MessageBody::FindNodeResponse { token, .. } => token,
        other => panic!("unexpected response {:?}", other),
    };

    for value in [b"forged".to_vec(), Vec::new()] {
        let forged = DhtValueEntity::new(owner.local_id(), owner.local_addr(), key, DhtValueType::TEXT, value);
        let response = raw_exchange(
            &intruder,
            sender,
            holder.local_addr(),
            MessageBody::StoreRequest {
                token: token.clone(),
                entities: vec![forged],
            },
        )
        .await;
        match response.body {
            MessageBody::StoreResponse { status, results } => {
                assert_eq!(status, StoreStatusCode::Failure);
                assert_eq!(results[0].code, StoreStatusCode::Failure);
            }
            other => panic!("unexpected response {:?}", other),
        }

        let values = holder.dispatcher().database().read().get(&key);
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].value, b"genuine");
    }

    shutdown_all(&nodes).await;
}

// =============================================================================
// Test: lookup termination
// =============================================================================

/// Lookups in a fixed 50-node network converge in a few hops.
#[tokio::test]
async fn fifty_node_lookup_terminates() {
    let network = MemoryNetwork::new();
    let nodes = network_of(&network, 50).await;

    for (from, to) in [(10, 37), (49, 1), (25, 0)] {
        let target = nodes[to].local_id();
        let result = timeout(TEST_TIMEOUT, nodes[from].lookup_nodes(target))
            .await
            .expect("lookup did not terminate")
            .expect("lookup failed");

        assert_eq!(result.contacts.first().map(|c| c.id), Some(target));
        assert!(result.contacts.len() <= 20);
        assert!(result.hops <= 8, "lookup took {} hops", result.hops);
        assert!(result.queried < 50);
    }

    // a random target converges as well
    let result = timeout(TEST_TIMEOUT, nodes[5].lookup_nodes(Kuid::random()))
        .await
        .expect("lookup did not terminate")
        .expect("lookup failed");
    assert_eq!(result.contacts.len(), 20);

    shutdown_all(&nodes).await;
}
