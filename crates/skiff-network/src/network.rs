//! Networks, endpoints and the context that ties them together.
//!
//! A network is a persisted record (`<root>/network/network/<name>`) naming
//! its subnet, gateway and driver. Connecting a container allocates an
//! address from the subnet, wires a veth pair between the driver's device and
//! the container's namespace, and asks the port proxy to publish the
//! container's ports.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, SkiffError, SkiffPaths, SkiffResult};

use crate::driver::{BridgeDriver, NetworkDriver};
use crate::ipam::Ipam;
use crate::mq::MessageQueue;
use crate::portmap::{PortMappingRequest, PortMappingSink, endpoint_mappings};
use crate::subnet::Subnet;
use crate::veth::VethPair;

/// Length of the container id prefix used in interface names.
const ENDPOINT_PREFIX_LEN: usize = 8;

/// A persisted network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// Network name, also the name of its bridge device.
    pub name: String,
    /// Address block of the network.
    pub ip_range: Subnet,
    /// Gateway address, the first address of the block.
    pub gateway: Ipv4Addr,
    /// Driver name.
    pub driver: String,
}

/// A container's attachment to a network.
#[derive(Debug, Clone)]
pub struct EndPoint {
    /// `<containerId>-<network>`.
    pub id: String,
    /// Address assigned to the container.
    pub ip: Ipv4Addr,
    /// Veth pair linking the container to the network device.
    pub veth: VethPair,
    /// Network the endpoint belongs to.
    pub network: Network,
    /// Published mappings as `hostPort:ip:containerPort`.
    pub port_mappings: Vec<String>,
}

/// Drivers, persisted networks and the address allocator.
pub struct NetworkContext {
    paths: SkiffPaths,
    ipam: Ipam,
    drivers: HashMap<&'static str, Box<dyn NetworkDriver>>,
    networks: BTreeMap<String, Network>,
    port_sink: Option<Box<dyn PortMappingSink>>,
}

impl std::fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkContext")
            .field("root", &self.paths.root)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("networks", &self.networks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl NetworkContext {
    /// Load every persisted network under `paths` with the bridge driver
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the network directory cannot be created or read.
    /// Unparseable records are skipped with a warning.
    pub fn load(paths: &SkiffPaths) -> SkiffResult<Self> {
        let dir = paths.networks();
        fs::create_dir_all(&dir).map_err(|e| SkiffError::from_io(e, "create network dir"))?;
        fs::create_dir_all(paths.ipam()).map_err(|e| SkiffError::from_io(e, "create ipam dir"))?;

        let mut networks = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let loaded = fs::read_to_string(&path)
                .map_err(SkiffError::from)
                .and_then(|json| serde_json::from_str::<Network>(&json).map_err(SkiffError::from));
            match loaded {
                Ok(network) => {
                    networks.insert(network.name.clone(), network);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable network record");
                }
            }
        }

        let context = Self {
            paths: paths.clone(),
            ipam: Ipam::new(paths.ipam_table()),
            drivers: HashMap::new(),
            networks,
            port_sink: None,
        };
        Ok(context.with_driver(Box::new(BridgeDriver)))
    }

    /// Register `driver` under its own name, replacing any previous one.
    #[must_use]
    pub fn with_driver(mut self, driver: Box<dyn NetworkDriver>) -> Self {
        self.drivers.insert(driver.name(), driver);
        self
    }

    /// Send port mapping requests to `sink` instead of the shared queue.
    #[must_use]
    pub fn with_port_sink(mut self, sink: Box<dyn PortMappingSink>) -> Self {
        self.port_sink = Some(sink);
        self
    }

    /// The address allocator.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// All networks, ordered by name.
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Look up a network by name.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NetworkNotFound`] if there is none.
    pub fn network(&self, name: &str) -> SkiffResult<&Network> {
        self.networks
            .get(name)
            .ok_or_else(|| SkiffError::NetworkNotFound {
                name: name.to_string(),
            })
    }

    /// Create a network: allocate its gateway, let the driver build the
    /// device and persist the record.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown driver or a taken name, or if any step
    /// fails; the gateway is released again when the driver fails.
    pub fn create_network(
        &mut self,
        driver: &str,
        subnet: Subnet,
        name: &str,
    ) -> SkiffResult<&Network> {
        let driver_impl = self
            .drivers
            .get(driver)
            .ok_or_else(|| SkiffError::DriverNotFound {
                driver: driver.to_string(),
            })?;
        if self.networks.contains_key(name) {
            return Err(SkiffError::NetworkExists {
                name: name.to_string(),
            });
        }

        let gateway = self.ipam.allocate(&subnet)?;
        let network = Network {
            name: name.to_string(),
            ip_range: subnet,
            gateway,
            driver: driver_impl.name().to_string(),
        };

        if let Err(e) = driver_impl.create(&network) {
            self.release_quietly(&subnet, gateway);
            return Err(e);
        }
        if let Err(e) = self.persist(&network) {
            self.release_quietly(&subnet, gateway);
            return Err(e);
        }

        tracing::info!(network = %name, %subnet, %gateway, "Network created");
        Ok(self.networks.entry(network.name.clone()).or_insert(network))
    }

    /// Delete a network: release its gateway, tear down the device and drop
    /// the record.
    ///
    /// Device teardown failures are logged; the record is removed anyway.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::NetworkNotFound`], or an error if the gateway
    /// cannot be released or the record cannot be removed.
    pub fn delete_network(&mut self, name: &str) -> SkiffResult<()> {
        let network = self.network(name)?.clone();

        self.ipam.release(&network.ip_range, network.gateway)?;

        match self.drivers.get(network.driver.as_str()) {
            Some(driver) => {
                if let Err(e) = driver.delete(&network) {
                    tracing::warn!(network = %name, error = %e, "Failed to remove network device");
                }
            }
            None => tracing::warn!(network = %name, driver = %network.driver, "Driver no longer available"),
        }

        match fs::remove_file(self.paths.network(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SkiffError::from_io(e, "remove network record")),
        }
        self.networks.remove(name);

        tracing::info!(network = %name, "Network removed");
        Ok(())
    }

    /// Connect the container `id` running as `pid` to the network `name`.
    ///
    /// `port_specs` are the container's `hostPort:containerPort` requests;
    /// they are published through the port proxy once the interface is up.
    /// A failure to publish them is logged and the endpoint is still
    /// returned, so the caller records the address and can release it.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown, no address is left, or any
    /// link step fails. The address and veth pair are released on failure.
    pub fn connect(
        &self,
        name: &str,
        id: &ContainerId,
        pid: u32,
        port_specs: &[String],
    ) -> SkiffResult<EndPoint> {
        let network = self.network(name)?.clone();
        let driver = self.driver_for(&network)?;
        endpoint_mappings(Ipv4Addr::UNSPECIFIED, port_specs)?;

        let ip = self.ipam.allocate(&network.ip_range)?;
        let port_mappings = match endpoint_mappings(ip, port_specs) {
            Ok(mappings) => mappings,
            Err(e) => {
                self.release_quietly(&network.ip_range, ip);
                return Err(e);
            }
        };
        let endpoint = EndPoint {
            id: format!("{id}-{name}"),
            ip,
            veth: VethPair::for_endpoint(id.prefix(ENDPOINT_PREFIX_LEN)),
            network,
            port_mappings,
        };

        if let Err(e) = driver.connect(&endpoint.network, &endpoint) {
            self.release_quietly(&endpoint.network.ip_range, ip);
            return Err(e);
        }

        if let Err(e) = driver.configure(&endpoint.network, &endpoint, pid) {
            if let Err(cleanup) = driver.disconnect(&endpoint.network, &endpoint) {
                tracing::debug!(error = %cleanup, "veth already gone");
            }
            self.release_quietly(&endpoint.network.ip_range, ip);
            return Err(e);
        }

        if !endpoint.port_mappings.is_empty() {
            let request = PortMappingRequest::mapping(endpoint.port_mappings.clone());
            if let Err(e) = self.send_ports(&request) {
                tracing::warn!(
                    endpoint = %endpoint.id,
                    error = %e,
                    "Port mappings not published; container stays connected"
                );
            }
        }

        tracing::info!(endpoint = %endpoint.id, %ip, "Container connected");
        Ok(endpoint)
    }

    /// Undo a connection of a container that is gone: withdraw its
    /// `port_mappings` (already in `hostPort:ip:containerPort` form) and
    /// release `ip`.
    ///
    /// Both steps are attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the network is unknown or either step fails.
    pub fn disconnect(&self, name: &str, ip: Ipv4Addr, port_mappings: &[String]) -> SkiffResult<()> {
        let network = self.network(name)?;

        let ports = if port_mappings.is_empty() {
            Ok(())
        } else {
            self.send_ports(&PortMappingRequest::unmapping(port_mappings.to_vec()))
        };
        if let Err(e) = &ports {
            tracing::warn!(network = %name, error = %e, "Failed to withdraw port mappings");
        }
        let released = self.ipam.release(&network.ip_range, ip);
        if let Err(e) = &released {
            tracing::warn!(network = %name, %ip, error = %e, "Failed to release address");
        }
        ports.and(released)
    }

    fn driver_for(&self, network: &Network) -> SkiffResult<&dyn NetworkDriver> {
        self.drivers
            .get(network.driver.as_str())
            .map(|driver| &**driver)
            .ok_or_else(|| SkiffError::DriverNotFound {
                driver: network.driver.clone(),
            })
    }

    fn send_ports(&self, request: &PortMappingRequest) -> SkiffResult<()> {
        match &self.port_sink {
            Some(sink) => sink.send(request),
            None => MessageQueue::open()?.send(request),
        }
    }

    fn persist(&self, network: &Network) -> SkiffResult<()> {
        let json = serde_json::to_string_pretty(network)?;
        fs::write(self.paths.network(&network.name), json)
            .map_err(|e| SkiffError::from_io(e, "write network record"))
    }

    fn release_quietly(&self, subnet: &Subnet, ip: Ipv4Addr) {
        if let Err(e) = self.ipam.release(subnet, ip) {
            tracing::warn!(%subnet, %ip, error = %e, "Failed to release address");
        }
    }
}
