//! Sync coordinator - drives peer sessions over the swarm.
//!
//! Handles incoming sync requests, runs reconciliation with every connected
//! peer, announces newly inserted leaves and redials lost peers with backoff.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{RequestBody, SyncRequest, SyncResponse, WireError};
use super::service::{IngestResult, SyncService};
use super::session::{Backoff, PeerSession, PeerState};
use crate::config::SyncConfig;
use crate::p2p::transport::{SwarmCommand, SwarmEvent};
use crate::store::InsertedLeaf;

/// Externally visible state of one peer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub peer_id: String,
    pub state: PeerState,
    pub invalid_messages: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub peers: Vec<PeerStatus>,
}

struct KnownPeer {
    session: PeerSession,
    addrs: Vec<Multiaddr>,
    redial_at: Option<Instant>,
}

/// Orchestrates sync across peers.
pub struct SyncCoordinator {
    service: SyncService,
    peers: HashMap<PeerId, KnownPeer>,
    anti_entropy: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    status: watch::Sender<SyncStatus>,
}

impl SyncCoordinator {
    pub fn new(service: SyncService, config: &SyncConfig) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            service,
            peers: HashMap::new(),
            anti_entropy: config.anti_entropy_interval(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
            status,
        }
    }

    /// Peer states, updated after every event.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Register a statically configured peer; it is dialed on start.
    pub fn add_bootstrap(&mut self, peer_id: PeerId, addr: Multiaddr) {
        let peer = self.peer_entry(peer_id);
        if !peer.addrs.contains(&addr) {
            peer.addrs.push(addr);
        }
        peer.redial_at = Some(Instant::now());
        info!(%peer_id, "Added bootstrap peer");
    }

    /// Run the coordinator event loop.
    ///
    /// Listens for swarm events and inserted leaves, and periodically
    /// re-handshakes idle peers and redials lost ones.
    pub async fn run(
        mut self,
        mut swarm_events: mpsc::Receiver<SwarmEvent>,
        swarm_commands: mpsc::Sender<SwarmCommand>,
    ) {
        let mut inserted = self.service.admission().writer().subscribe();
        let mut timer = tokio::time::interval(self.anti_entropy);

        loop {
            tokio::select! {
                event = swarm_events.recv() => match event {
                    Some(event) => self.handle_swarm_event(event, &swarm_commands).await,
                    None => break,
                },
                leaf = inserted.recv() => match leaf {
                    Ok(leaf) => self.announce(leaf, &swarm_commands),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Anti-entropy repairs what was not announced.
                        warn!(skipped, "Announce stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = timer.tick() => {
                    self.tick(&swarm_commands).await;
                }
            }
            self.publish_status();
        }
        info!("Sync coordinator stopped");
    }

    fn peer_entry(&mut self, peer_id: PeerId) -> &mut KnownPeer {
        let limits = *self.service.limits();
        let backoff = Backoff::new(self.backoff_base, self.backoff_cap);
        self.peers.entry(peer_id).or_insert_with(|| KnownPeer {
            session: PeerSession::new(peer_id.to_string(), limits, backoff),
            addrs: Vec::new(),
            redial_at: None,
        })
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent, commands: &mpsc::Sender<SwarmCommand>) {
        match event {
            SwarmEvent::PeerDiscovered { peer_id, addrs } => {
                let peer = self.peer_entry(peer_id);
                for addr in addrs {
                    if !peer.addrs.contains(&addr) {
                        peer.addrs.push(addr);
                    }
                }
                if peer.session.state() == PeerState::Disconnected && peer.redial_at.is_none() {
                    info!(%peer_id, "New peer discovered, dialing");
                    let addrs = peer.addrs.clone();
                    send(commands, SwarmCommand::Dial { peer_id, addrs }).await;
                }
            }

            SwarmEvent::PeerExpired { peer_id } => {
                let idle = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|p| p.session.state() == PeerState::Disconnected);
                if idle {
                    self.peers.remove(&peer_id);
                    info!(%peer_id, "Peer expired, removed");
                }
            }

            SwarmEvent::Connected { peer_id } => {
                let hello = self.service.hello();
                let peer = self.peer_entry(peer_id);
                peer.redial_at = None;
                info!(%peer_id, "Peer connected, handshaking");
                if let Some(request) = peer.session.start(hello) {
                    send(commands, SwarmCommand::SendRequest { peer_id, request }).await;
                }
            }

            SwarmEvent::Disconnected { peer_id } => {
                let Some(peer) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                let delay = peer.session.disconnect();
                if peer.addrs.is_empty() {
                    // Inbound only: nothing to redial.
                    self.peers.remove(&peer_id);
                    info!(%peer_id, "Peer disconnected, removed");
                } else {
                    peer.redial_at = Some(Instant::now() + delay);
                    info!(%peer_id, redial_in = ?delay, "Peer disconnected");
                }
            }

            SwarmEvent::IncomingRequest {
                peer_id,
                request,
                channel,
            } => {
                self.handle_request(peer_id, request, channel, commands).await;
            }

            SwarmEvent::ResponseReceived { peer_id, response } => {
                self.handle_response(peer_id, response, commands).await;
            }

            SwarmEvent::OutboundFailure { peer_id, error } => {
                let reconciling = self.peers.get(&peer_id).is_some_and(|p| {
                    matches!(
                        p.session.state(),
                        PeerState::Handshaking | PeerState::Synchronizing
                    )
                });
                if reconciling {
                    warn!(%peer_id, %error, "Reconciliation request failed, dropping peer");
                    send(commands, SwarmCommand::Disconnect { peer_id }).await;
                } else {
                    debug!(%peer_id, %error, "Announce failed");
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        peer_id: PeerId,
        request: SyncRequest,
        channel: libp2p::request_response::ResponseChannel<SyncResponse>,
        commands: &mpsc::Sender<SwarmCommand>,
    ) {
        let peer = peer_id.to_string();
        let is_announce = matches!(request.body, RequestBody::Announce { .. });

        // A peer ahead of us only learns that from our reply; reconcile too.
        if let RequestBody::Hello(remote) = &request.body {
            let local = self.service.hello();
            if remote.root != local.root {
                let known = self.peer_entry(peer_id);
                if known.session.is_streaming() {
                    if let Some(request) = known.session.start(local) {
                        send(commands, SwarmCommand::SendRequest { peer_id, request }).await;
                    }
                }
            }
        }

        let response = self.service.handle(&peer, request).await;
        let mismatch = matches!(response, SyncResponse::Error(WireError::VersionMismatch { .. }));
        if is_announce && response == (SyncResponse::Ack { accepted: false }) {
            self.peer_entry(peer_id).session.record_invalid();
        }

        send(commands, SwarmCommand::SendResponse { channel, response }).await;
        if mismatch {
            send(commands, SwarmCommand::Disconnect { peer_id }).await;
        }
    }

    async fn handle_response(
        &mut self,
        peer_id: PeerId,
        response: SyncResponse,
        commands: &mpsc::Sender<SwarmCommand>,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            debug!(%peer_id, "Response from unknown peer ignored");
            return;
        };

        let step = match peer.session.on_response(response, self.service.store()) {
            Ok(step) => step,
            Err(e) => {
                warn!(%peer_id, error = %e, "Peer protocol error, disconnecting");
                send(commands, SwarmCommand::Disconnect { peer_id }).await;
                return;
            }
        };

        let source = peer_id.to_string();
        let mut invalid = 0;
        for message in step.deliver {
            if self.service.ingest(&source, message).await == IngestResult::Invalid {
                invalid += 1;
            }
        }

        if let Some(peer) = self.peers.get_mut(&peer_id) {
            for _ in 0..invalid {
                peer.session.record_invalid();
            }
        }
        for request in step.requests {
            send(commands, SwarmCommand::SendRequest { peer_id, request }).await;
        }
    }

    /// Push a freshly inserted leaf to every streaming peer except its source.
    ///
    /// Never waits on the swarm: an announce that does not fit is dropped and
    /// left to anti-entropy.
    fn announce(&self, inserted: InsertedLeaf, commands: &mpsc::Sender<SwarmCommand>) {
        for (peer_id, peer) in &self.peers {
            if !peer.session.is_streaming() {
                continue;
            }
            if inserted.source.as_deref() == Some(peer.session.peer()) {
                continue;
            }
            let request = SyncRequest::new(RequestBody::Announce {
                message: inserted.leaf.message.clone(),
            });
            let command = SwarmCommand::SendRequest {
                peer_id: *peer_id,
                request,
            };
            match commands.try_send(command) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(%peer_id, seq = inserted.leaf.seq, "Swarm busy, announce dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Swarm command channel closed");
                    return;
                }
            }
        }
    }

    /// Anti-entropy round and due redials.
    async fn tick(&mut self, commands: &mpsc::Sender<SwarmCommand>) {
        let hello = self.service.hello();
        let now = Instant::now();

        for (peer_id, peer) in self.peers.iter_mut() {
            match peer.session.state() {
                PeerState::Idle => {
                    if let Some(request) = peer.session.start(hello) {
                        send(
                            commands,
                            SwarmCommand::SendRequest {
                                peer_id: *peer_id,
                                request,
                            },
                        )
                        .await;
                    }
                }
                PeerState::Disconnected => {
                    if peer.redial_at.is_some_and(|at| at <= now) && !peer.addrs.is_empty() {
                        debug!(%peer_id, "Redialing peer");
                        peer.redial_at = None;
                        send(
                            commands,
                            SwarmCommand::Dial {
                                peer_id: *peer_id,
                                addrs: peer.addrs.clone(),
                            },
                        )
                        .await;
                    }
                }
                PeerState::Handshaking | PeerState::Synchronizing => {}
            }
        }
    }

    fn publish_status(&self) {
        let mut peers: Vec<PeerStatus> = self
            .peers
            .values()
            .map(|p| PeerStatus {
                peer_id: p.session.peer().to_string(),
                state: p.session.state(),
                invalid_messages: p.session.invalid_messages(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        self.status.send_replace(SyncStatus { peers });
    }
}

async fn send(commands: &mpsc::Sender<SwarmCommand>, command: SwarmCommand) {
    if commands.send(command).await.is_err() {
        warn!("Swarm command channel closed");
    }
}
