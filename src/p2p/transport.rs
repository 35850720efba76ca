//! libp2p transport configuration
//!
//! Builds the KiwiSwarm with multi-transport support (QUIC + TCP/Noise/Yamux),
//! mDNS discovery, identify, and request-response for sync. The swarm runs
//! in its own task: it forwards events to the coordinator and executes the
//! commands the coordinator sends back.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    identify, identity, mdns, noise, request_response, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Swarm, SwarmBuilder,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocols::{SyncCodec, IDENTIFY_PROTOCOL, SYNC_PROTOCOL};
use crate::config::P2PConfig;
use crate::sync::protocol::{SyncRequest, SyncResponse};

/// Combined libp2p behaviour for kiwi nodes.
#[derive(NetworkBehaviour)]
pub struct KiwiBehaviour {
    pub request_response: request_response::Behaviour<SyncCodec>,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub identify: identify::Behaviour,
}

/// Events emitted by the swarm for the coordinator to process.
#[derive(Debug)]
pub enum SwarmEvent {
    /// A new peer was discovered via mDNS.
    PeerDiscovered { peer_id: PeerId, addrs: Vec<Multiaddr> },
    /// An mDNS record expired.
    PeerExpired { peer_id: PeerId },
    /// First connection to a peer is up.
    Connected { peer_id: PeerId },
    /// Last connection to a peer closed.
    Disconnected { peer_id: PeerId },
    /// Incoming sync request from a peer.
    IncomingRequest {
        peer_id: PeerId,
        request: SyncRequest,
        channel: request_response::ResponseChannel<SyncResponse>,
    },
    /// Response received from a peer for an outbound request.
    ResponseReceived {
        peer_id: PeerId,
        response: SyncResponse,
    },
    /// An outbound request failed.
    OutboundFailure { peer_id: PeerId, error: String },
}

/// Commands sent from the coordinator to the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Dial {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
    },
    SendRequest {
        peer_id: PeerId,
        request: SyncRequest,
    },
    SendResponse {
        channel: request_response::ResponseChannel<SyncResponse>,
        response: SyncResponse,
    },
    Disconnect {
        peer_id: PeerId,
    },
}

/// Wrapper around the libp2p Swarm with kiwi-specific helpers.
pub struct KiwiSwarm {
    swarm: Swarm<KiwiBehaviour>,
    local_peer_id: PeerId,
}

impl KiwiSwarm {
    /// Get our local peer ID.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Addresses the swarm is currently listening on.
    pub fn listeners(&self) -> Vec<Multiaddr> {
        self.swarm.listeners().cloned().collect()
    }

    fn execute(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Dial { peer_id, addrs } => {
                let opts = DialOpts::peer_id(peer_id).addresses(addrs).build();
                if let Err(e) = self.swarm.dial(opts) {
                    debug!(%peer_id, error = %e, "Dial failed");
                }
            }
            SwarmCommand::SendRequest { peer_id, request } => {
                self.swarm
                    .behaviour_mut()
                    .request_response
                    .send_request(&peer_id, request);
            }
            SwarmCommand::SendResponse { channel, response } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .request_response
                    .send_response(channel, response)
                    .is_err()
                {
                    debug!("Response channel closed before reply");
                }
            }
            SwarmCommand::Disconnect { peer_id } => {
                let _ = self.swarm.disconnect_peer_id(peer_id);
            }
        }
    }

    /// Run the swarm event loop until the command channel closes.
    ///
    /// Events wait in a local queue until the coordinator has room for them,
    /// so commands keep draining while the event channel is full.
    pub async fn run(
        mut self,
        event_tx: mpsc::Sender<SwarmEvent>,
        mut commands: mpsc::Receiver<SwarmCommand>,
    ) {
        let mut pending: VecDeque<SwarmEvent> = VecDeque::new();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.execute(command),
                    None => break,
                },
                permit = event_tx.reserve(), if !pending.is_empty() => match permit {
                    Ok(permit) => {
                        if let Some(event) = pending.pop_front() {
                            permit.send(event);
                        }
                    }
                    Err(_) => break,
                },
                event = self.swarm.select_next_some() => self.translate(event, &mut pending),
            }
        }
        info!("Swarm task stopped");
    }

    /// Map a libp2p event onto the events the coordinator consumes.
    fn translate(
        &mut self,
        event: libp2p::swarm::SwarmEvent<KiwiBehaviourEvent>,
        pending: &mut VecDeque<SwarmEvent>,
    ) {
        use libp2p::swarm::SwarmEvent as LibSwarmEvent;

        match event {
            // mDNS discovery
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    debug!(%peer_id, %addr, "mDNS: peer discovered");
                    pending.push_back(SwarmEvent::PeerDiscovered {
                        peer_id,
                        addrs: vec![addr],
                    });
                }
            }
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _addr) in peers {
                    debug!(%peer_id, "mDNS: peer expired");
                    pending.push_back(SwarmEvent::PeerExpired { peer_id });
                }
            }

            // Request-response events
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::RequestResponse(
                request_response::Event::Message { peer, message, .. },
            )) => pending.push_back(match message {
                request_response::Message::Request {
                    request, channel, ..
                } => SwarmEvent::IncomingRequest {
                    peer_id: peer,
                    request,
                    channel,
                },
                request_response::Message::Response { response, .. } => {
                    SwarmEvent::ResponseReceived {
                        peer_id: peer,
                        response,
                    }
                }
            }),
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::RequestResponse(
                request_response::Event::OutboundFailure { peer, error, .. },
            )) => {
                warn!(%peer, %error, "Outbound sync request failed");
                pending.push_back(SwarmEvent::OutboundFailure {
                    peer_id: peer,
                    error: error.to_string(),
                });
            }
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::RequestResponse(
                request_response::Event::InboundFailure { peer, error, .. },
            )) => {
                // Malformed frames surface here; the peer is dropped.
                warn!(%peer, %error, "Inbound sync request failed");
                let _ = self.swarm.disconnect_peer_id(peer);
            }

            // Identify events (log only)
            LibSwarmEvent::Behaviour(KiwiBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }

            // Connection events
            LibSwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening on");
            }
            LibSwarmEvent::ConnectionEstablished {
                peer_id,
                num_established,
                ..
            } if num_established.get() == 1 => {
                debug!(%peer_id, "Connection established");
                pending.push_back(SwarmEvent::Connected { peer_id });
            }
            LibSwarmEvent::ConnectionClosed {
                peer_id,
                num_established: 0,
                ..
            } => {
                debug!(%peer_id, "Connection closed");
                pending.push_back(SwarmEvent::Disconnected { peer_id });
            }
            LibSwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } if !self.swarm.is_connected(&peer_id) => {
                debug!(%peer_id, %error, "Outgoing connection failed");
                pending.push_back(SwarmEvent::Disconnected { peer_id });
            }

            _ => {}
        }
    }
}

/// Build the libp2p swarm from config.
///
/// Creates or loads an Ed25519 identity keypair, configures transports,
/// and constructs the composite behaviour.
pub fn build_swarm(config: &P2PConfig, data_dir: &Path) -> Result<KiwiSwarm> {
    let keypair = load_or_generate_keypair(data_dir)?;
    let local_peer_id = PeerId::from(keypair.public());
    info!(%local_peer_id, "Node identity");

    let request_timeout = Duration::from_secs(config.request_timeout_secs);
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let enable_mdns = config.enable_mdns;

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .context("TCP transport")?
        .with_quic()
        .with_behaviour(|key| -> Result<KiwiBehaviour, Box<dyn std::error::Error + Send + Sync>> {
            let sync_protocol = StreamProtocol::new(SYNC_PROTOCOL);
            let rr_config = request_response::Config::default().with_request_timeout(request_timeout);
            let request_response = request_response::Behaviour::with_codec(
                SyncCodec,
                [(sync_protocol, request_response::ProtocolSupport::Full)],
                rr_config,
            );

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?)
            } else {
                None
            };

            let identify = identify::Behaviour::new(
                identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                    .with_agent_version(format!("kiwi-node/{}", env!("CARGO_PKG_VERSION"))),
            );

            Ok(KiwiBehaviour {
                request_response,
                mdns: Toggle::from(mdns),
                identify,
            })
        })
        .context("swarm behaviour")?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
        .build();

    let mut kiwi_swarm = KiwiSwarm {
        swarm,
        local_peer_id,
    };

    for addr_str in &config.listen_addrs {
        let addr: Multiaddr = addr_str
            .parse()
            .with_context(|| format!("invalid listen address: {}", addr_str))?;
        kiwi_swarm
            .swarm
            .listen_on(addr)
            .with_context(|| format!("failed to listen on {}", addr_str))?;
    }

    Ok(kiwi_swarm)
}

/// Load an Ed25519 keypair from disk, or generate and persist a new one.
///
/// The keypair is stored as protobuf-encoded bytes at `{data_dir}/node_key`.
pub fn load_or_generate_keypair(data_dir: &Path) -> Result<identity::Keypair> {
    let key_path = data_dir.join("node_key");

    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("reading node key")?;
        let keypair =
            identity::Keypair::from_protobuf_encoding(&bytes).context("decoding node key")?;
        info!("Loaded existing node identity");
        Ok(keypair)
    } else {
        let keypair = identity::Keypair::generate_ed25519();
        std::fs::create_dir_all(data_dir).context("creating data directory")?;
        let bytes = keypair
            .to_protobuf_encoding()
            .context("encoding node key")?;
        std::fs::write(&key_path, &bytes).context("writing node key")?;
        info!("Generated new node identity");
        Ok(keypair)
    }
}

/// Parse a multiaddr string like `/ip4/1.2.3.4/tcp/4001/p2p/12D3Koo...`
/// into a (PeerId, Multiaddr) pair.
pub fn parse_peer_addr(addr_str: &str) -> Option<(PeerId, Multiaddr)> {
    let addr: Multiaddr = addr_str.parse().ok()?;
    let peer_id = addr.iter().find_map(|p| {
        if let libp2p::multiaddr::Protocol::P2p(peer_id) = p {
            Some(peer_id)
        } else {
            None
        }
    })?;
    let addr_without_p2p: Multiaddr = addr
        .iter()
        .filter(|p| !matches!(p, libp2p::multiaddr::Protocol::P2p(_)))
        .collect();
    Some((peer_id, addr_without_p2p))
}
