//! Network drivers.

use skiff_common::SkiffResult;

use crate::bridge::BridgeManager;
use crate::network::{EndPoint, Network};

/// Link-layer backend of a network.
pub trait NetworkDriver: Send + Sync {
    /// Driver name as given to `network create --driver`.
    fn name(&self) -> &'static str;

    /// Create the network's device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be set up.
    fn create(&self, network: &Network) -> SkiffResult<()>;

    /// Destroy the network's device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be removed.
    fn delete(&self, network: &Network) -> SkiffResult<()>;

    /// Create the endpoint's host-side link and attach it to the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be created or attached.
    fn connect(&self, network: &Network, endpoint: &EndPoint) -> SkiffResult<()>;

    /// Hand the endpoint's container-side link to the network namespace of
    /// `pid` and give it the endpoint address and a default route.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be moved or configured.
    fn configure(&self, network: &Network, endpoint: &EndPoint, pid: u32) -> SkiffResult<()>;

    /// Detach and destroy the endpoint's host-side link.
    ///
    /// # Errors
    ///
    /// Returns an error if the link cannot be removed.
    fn disconnect(&self, network: &Network, endpoint: &EndPoint) -> SkiffResult<()>;
}

/// Linux bridge driver: one bridge per network, veth pairs per endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeDriver;

impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &'static str {
        "bridge"
    }

    fn create(&self, network: &Network) -> SkiffResult<()> {
        BridgeManager::new(&network.name)?.setup(network.gateway, &network.ip_range)
    }

    fn delete(&self, network: &Network) -> SkiffResult<()> {
        BridgeManager::new(&network.name)?.delete(&network.ip_range)
    }

    fn connect(&self, network: &Network, endpoint: &EndPoint) -> SkiffResult<()> {
        let bridge = BridgeManager::new(&network.name)?;
        endpoint.veth.create()?;
        if let Err(e) = bridge.add_interface(&endpoint.veth.host) {
            if let Err(cleanup) = endpoint.veth.delete() {
                tracing::warn!(error = %cleanup, "Failed to remove veth after attach error");
            }
            return Err(e);
        }
        Ok(())
    }

    fn configure(&self, network: &Network, endpoint: &EndPoint, pid: u32) -> SkiffResult<()> {
        endpoint.veth.move_to_netns(pid)?;
        endpoint.veth.configure_in_netns(
            pid,
            endpoint.ip,
            network.ip_range.prefix(),
            network.gateway,
        )
    }

    fn disconnect(&self, _network: &Network, endpoint: &EndPoint) -> SkiffResult<()> {
        endpoint.veth.delete()
    }
}
