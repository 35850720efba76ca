//! Sync coordinator integration tests
//!
//! Drives a `SyncCoordinator` through its channels with hand-made swarm
//! events, without a network underneath.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use libp2p::{identity, Multiaddr, PeerId};
use rand::rngs::OsRng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use kiwi_node::admission::{unix_now, Admission};
use kiwi_node::config::SyncConfig;
use kiwi_node::message::{Identity, Message, MessageBody};
use kiwi_node::p2p::transport::{SwarmCommand, SwarmEvent};
use kiwi_node::registry::{RegistrySnapshot, SnapshotCache, StaticRegistry};
use kiwi_node::store::{spawn_writer, LeafStore};
use kiwi_node::sync::{PeerState, RequestBody, SyncCoordinator, SyncResponse, SyncService, SyncStatus};
use kiwi_node::validation::{FreshnessPolicy, Validator};

struct Harness {
    service: SyncService,
    events: mpsc::Sender<SwarmEvent>,
    commands: mpsc::Receiver<SwarmCommand>,
    status: watch::Receiver<SyncStatus>,
    task: JoinHandle<()>,
}

fn start(key: &SigningKey, config: SyncConfig, command_capacity: usize) -> Harness {
    start_with(key, config, command_capacity, |_| {})
}

fn start_with(
    key: &SigningKey,
    config: SyncConfig,
    command_capacity: usize,
    setup: impl FnOnce(&mut SyncCoordinator),
) -> Harness {
    let snapshot = RegistrySnapshot::new([Identity::from_signing_key(key)], []);
    let store = Arc::new(LeafStore::in_memory());
    let (writer, _task) = spawn_writer(store, 64);
    let cache = Arc::new(SnapshotCache::with_snapshot(
        Arc::new(StaticRegistry::new(snapshot.clone())),
        snapshot,
    ));
    let admission = Admission::new(Validator::new(FreshnessPolicy::default()), cache, writer);
    let service = SyncService::new(admission, config.limits());

    let mut coordinator = SyncCoordinator::new(service.clone(), &config);
    setup(&mut coordinator);
    let status = coordinator.status();

    let (events, event_rx) = mpsc::channel(16);
    let (command_tx, commands) = mpsc::channel(command_capacity);
    let task = tokio::spawn(coordinator.run(event_rx, command_tx));

    Harness {
        service,
        events,
        commands,
        status,
        task,
    }
}

fn random_peer() -> PeerId {
    PeerId::from(identity::Keypair::generate_ed25519().public())
}

fn submission(key: &SigningKey, href: &str) -> Message {
    Message::sign(
        key,
        MessageBody::Submission {
            href: href.to_string(),
            title: format!("title for {}", href),
        },
        unix_now(),
    )
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

fn peer_state(status: &watch::Receiver<SyncStatus>, peer: PeerId) -> Option<PeerState> {
    status
        .borrow()
        .peers
        .iter()
        .find(|p| p.peer_id == peer.to_string())
        .map(|p| p.state)
}

async fn next_command(commands: &mut mpsc::Receiver<SwarmCommand>) -> SwarmCommand {
    tokio::time::timeout(Duration::from_secs(5), commands.recv())
        .await
        .expect("coordinator sent nothing")
        .expect("command channel closed")
}

/// Handshake `peer` to the streaming state against an equal root.
async fn make_streaming(harness: &mut Harness, peer: PeerId) {
    harness
        .events
        .send(SwarmEvent::Connected { peer_id: peer })
        .await
        .unwrap();
    match next_command(&mut harness.commands).await {
        SwarmCommand::SendRequest { peer_id, request } => {
            assert_eq!(peer_id, peer);
            assert!(matches!(request.body, RequestBody::Hello(_)));
        }
        other => panic!("expected hello, got {:?}", other),
    }
    harness
        .events
        .send(SwarmEvent::ResponseReceived {
            peer_id: peer,
            response: SyncResponse::Hello(harness.service.hello()),
        })
        .await
        .unwrap();
    let status = harness.status.clone();
    assert!(wait_for(|| peer_state(&status, peer) == Some(PeerState::Idle)).await);
}

#[tokio::test]
async fn test_zero_interval_does_not_panic() {
    let key = SigningKey::generate(&mut OsRng);
    let config = SyncConfig {
        anti_entropy_interval_ms: 0,
        ..SyncConfig::default()
    };
    let mut harness = start(&key, config, 64);

    let peer = random_peer();
    harness
        .events
        .send(SwarmEvent::Connected { peer_id: peer })
        .await
        .unwrap();
    assert!(matches!(
        next_command(&mut harness.commands).await,
        SwarmCommand::SendRequest { .. }
    ));

    drop(harness.events);
    tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .expect("coordinator did not stop")
        .expect("coordinator panicked");
}

#[tokio::test]
async fn test_inbound_peer_forgotten_on_disconnect() {
    let key = SigningKey::generate(&mut OsRng);
    let bootstrap = random_peer();
    let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4021".parse().unwrap();
    let mut harness = start_with(&key, SyncConfig::default(), 64, |coordinator| {
        coordinator.add_bootstrap(bootstrap, addr)
    });

    // The bootstrap peer is dialed on the first tick.
    assert!(matches!(
        next_command(&mut harness.commands).await,
        SwarmCommand::Dial { peer_id, .. } if peer_id == bootstrap
    ));

    let inbound = random_peer();
    for peer_id in [inbound, bootstrap] {
        harness
            .events
            .send(SwarmEvent::Connected { peer_id })
            .await
            .unwrap();
        next_command(&mut harness.commands).await;
    }
    let status = harness.status.clone();
    assert!(wait_for(|| peer_state(&status, inbound) == Some(PeerState::Handshaking)).await);

    for peer_id in [bootstrap, inbound] {
        harness
            .events
            .send(SwarmEvent::Disconnected { peer_id })
            .await
            .unwrap();
    }

    assert!(wait_for(|| peer_state(&status, inbound).is_none()).await);
    // Peers with known addresses stay around for the redial.
    assert_eq!(peer_state(&status, bootstrap), Some(PeerState::Disconnected));
}

#[tokio::test]
async fn test_full_command_channel_drops_announces() {
    let key = SigningKey::generate(&mut OsRng);
    let config = SyncConfig {
        anti_entropy_interval_ms: 60_000,
        ..SyncConfig::default()
    };
    let mut harness = start(&key, config, 1);
    let peer = random_peer();
    make_streaming(&mut harness, peer).await;

    // Nobody drains commands from here on.
    for i in 0..20 {
        harness
            .service
            .admission()
            .submit(submission(&key, &format!("https://flood.example/{}", i)))
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Events are still handled while the command channel is full.
    harness
        .events
        .send(SwarmEvent::Disconnected { peer_id: peer })
        .await
        .unwrap();
    let status = harness.status.clone();
    assert!(wait_for(|| peer_state(&status, peer).is_none()).await);

    let mut queued = 0;
    while let Ok(command) = harness.commands.try_recv() {
        assert!(matches!(
            command,
            SwarmCommand::SendRequest { ref request, .. }
                if matches!(request.body, RequestBody::Announce { .. })
        ));
        queued += 1;
    }
    assert_eq!(queued, 1);
    assert_eq!(harness.service.store().len(), 20);
}
