//! P2P networking layer - libp2p transport
//!
//! Handles:
//! - Multi-transport (QUIC + TCP with Noise/Yamux)
//! - Sync protocol codec (length-prefixed MessagePack)
//! - Peer discovery (mDNS, static bootstrap peers)

pub mod protocols;
pub mod transport;

pub use transport::{build_swarm, KiwiSwarm, SwarmCommand, SwarmEvent};
