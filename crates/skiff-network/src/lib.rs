//! # skiff-network
//!
//! Container networking for skiff: bridge networks with bitmap IP
//! allocation, veth wiring into container namespaces, and a userspace TCP
//! port proxy fed through a System V message queue.

#![warn(missing_docs)]

mod cmd;

pub mod bridge;
pub mod driver;
pub mod ipam;
pub mod mq;
pub mod netns;
pub mod network;
pub mod portmap;
pub mod subnet;
pub mod veth;

pub use bridge::BridgeManager;
pub use driver::{BridgeDriver, NetworkDriver};
pub use ipam::Ipam;
pub use mq::MessageQueue;
pub use netns::{NetnsGuard, join_netns, netns_path, with_netns};
pub use network::{EndPoint, Network, NetworkContext};
pub use portmap::{PortMappingRequest, PortMappingSink, PortMappingSource, PortProxy};
pub use subnet::Subnet;
pub use veth::VethPair;
