//! Virtual ethernet pair management.

use std::net::Ipv4Addr;

use skiff_common::SkiffResult;

use crate::cmd::run_ip;
use crate::netns::with_netns;

/// Virtual ethernet pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name.
    pub host: String,
    /// Container-side interface name.
    pub container: String,
}

impl VethPair {
    /// Interface names for an endpoint: `veth<prefix>` on the host and
    /// `cif-<prefix>` inside the container.
    #[must_use]
    pub fn for_endpoint(prefix: &str) -> Self {
        Self {
            host: format!("veth{prefix}"),
            container: format!("cif-{prefix}"),
        }
    }

    /// Create the pair and bring the host side up.
    ///
    /// # Errors
    ///
    /// Returns an error if either `ip` command fails.
    pub fn create(&self) -> SkiffResult<()> {
        tracing::debug!(host = %self.host, container = %self.container, "Creating veth pair");

        run_ip(&[
            "link",
            "add",
            &self.host,
            "type",
            "veth",
            "peer",
            "name",
            &self.container,
        ])?;
        run_ip(&["link", "set", &self.host, "up"])
    }

    /// Move the container side into the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip link set netns` fails.
    pub fn move_to_netns(&self, pid: u32) -> SkiffResult<()> {
        tracing::debug!(interface = %self.container, pid, "Moving to netns");
        run_ip(&["link", "set", &self.container, "netns", &pid.to_string()])
    }

    /// Inside the namespace of `pid`, give the container side `ip/prefix`,
    /// bring it and loopback up, and route everything through `gateway`.
    ///
    /// # Errors
    ///
    /// Returns an error if entering the namespace or any `ip` step fails;
    /// the namespace switch is undone either way.
    pub fn configure_in_netns(
        &self,
        pid: u32,
        ip: Ipv4Addr,
        prefix: u8,
        gateway: Ipv4Addr,
    ) -> SkiffResult<()> {
        let cidr = format!("{ip}/{prefix}");
        let gateway = gateway.to_string();
        let peer = self.container.as_str();

        with_netns(pid, || {
            run_ip(&["addr", "add", &cidr, "dev", peer])?;
            run_ip(&["link", "set", peer, "up"])?;
            run_ip(&["link", "set", "lo", "up"])?;
            run_ip(&["route", "add", "default", "via", &gateway, "dev", peer])
        })?;

        tracing::debug!(interface = %self.container, pid, ip = %cidr, "Configured container interface");
        Ok(())
    }

    /// Delete the pair through its host side.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip link delete` fails.
    pub fn delete(&self) -> SkiffResult<()> {
        tracing::debug!(host = %self.host, "Deleting veth pair");
        run_ip(&["link", "delete", &self.host])
    }
}
