//! Linux bridge management.
//!
//! This module provides utilities for creating and tearing down the bridge
//! device backing a network, including its NAT masquerade rule.

use std::net::Ipv4Addr;

use skiff_common::{SkiffError, SkiffResult};

use crate::cmd::{link_exists, run_ip, run_iptables};
use crate::subnet::Subnet;

/// Maximum length of a Linux interface name.
pub const IFNAMSIZ: usize = 15;

/// A bridge device named after its network.
#[derive(Debug, Clone)]
pub struct BridgeManager {
    name: String,
}

impl BridgeManager {
    /// Handle for the bridge called `name`; nothing is created yet.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] when `name` is not a valid interface name.
    pub fn new(name: &str) -> SkiffResult<Self> {
        if name.is_empty()
            || name.len() > IFNAMSIZ
            || name.contains(|c: char| c == '/' || c.is_whitespace())
        {
            return Err(SkiffError::Config {
                message: format!(
                    "'{name}' is not a valid interface name (1-{IFNAMSIZ} chars, no '/' or spaces)"
                ),
            });
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Check if a bridge exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        link_exists(name)
    }

    /// Get the bridge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create the bridge, give it the gateway address, bring it up and
    /// masquerade traffic leaving the subnet through other interfaces.
    ///
    /// # Errors
    ///
    /// Returns an error if any `ip`/`iptables` step fails.
    pub fn setup(&self, gateway: Ipv4Addr, subnet: &Subnet) -> SkiffResult<()> {
        tracing::debug!(name = %self.name, %gateway, %subnet, "Creating bridge");

        if Self::exists(&self.name) {
            tracing::warn!(name = %self.name, "Bridge already exists, reusing it");
        } else {
            run_ip(&["link", "add", "name", &self.name, "type", "bridge"])?;
        }

        self.set_ip(gateway, subnet)?;
        self.up()?;
        run_iptables(&self.masquerade_rule("-A", subnet))?;

        tracing::info!(name = %self.name, %subnet, "Bridge created successfully");
        Ok(())
    }

    /// Bring the bridge interface up.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip link set up` fails.
    pub fn up(&self) -> SkiffResult<()> {
        run_ip(&["link", "set", &self.name, "up"])
    }

    /// Set the gateway address on the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip addr add` fails for a reason other than the
    /// address already being present.
    pub fn set_ip(&self, gateway: Ipv4Addr, subnet: &Subnet) -> SkiffResult<()> {
        let cidr = format!("{gateway}/{}", subnet.prefix());
        match run_ip(&["addr", "add", &cidr, "dev", &self.name]) {
            Err(SkiffError::Command { message, .. }) if message.contains("File exists") => {
                tracing::warn!(bridge = %self.name, ip = %cidr, "Address already assigned");
                Ok(())
            }
            other => other,
        }
    }

    /// Attach an interface to the bridge.
    ///
    /// # Errors
    ///
    /// Returns an error if `ip link set master` fails.
    pub fn add_interface(&self, interface: &str) -> SkiffResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Adding interface to bridge");
        run_ip(&["link", "set", interface, "master", &self.name])
    }

    /// Remove the masquerade rule and delete the bridge.
    ///
    /// Both steps are attempted; the first failure is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if either command fails.
    pub fn delete(&self, subnet: &Subnet) -> SkiffResult<()> {
        tracing::debug!(name = %self.name, "Deleting bridge");

        let rule = run_iptables(&self.masquerade_rule("-D", subnet));
        if let Err(e) = &rule {
            tracing::warn!(name = %self.name, error = %e, "Failed to remove masquerade rule");
        }
        let link = run_ip(&["link", "delete", &self.name, "type", "bridge"]);
        if let Err(e) = &link {
            tracing::warn!(name = %self.name, error = %e, "Failed to delete bridge");
        }
        rule.and(link)
    }

    fn masquerade_rule(&self, action: &str, subnet: &Subnet) -> Vec<String> {
        vec![
            "-t".into(),
            "nat".into(),
            action.into(),
            "POSTROUTING".into(),
            "-s".into(),
            subnet.to_string(),
            "!".into(),
            "-o".into(),
            self.name.clone(),
            "-j".into(),
            "MASQUERADE".into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_exists_nonexistent() {
        assert!(!BridgeManager::exists("nonexistent_bridge_12345"));
    }

    #[test]
    fn rejects_bad_names() {
        assert!(BridgeManager::new("").is_err());
        assert!(BridgeManager::new("a-very-long-bridge-name").is_err());
        assert!(BridgeManager::new("br 0").is_err());
        assert!(BridgeManager::new("skiff0").is_ok());
    }

    #[test]
    fn masquerade_rule_shape() {
        let bridge = BridgeManager::new("skiff0").unwrap();
        let subnet: Subnet = "172.18.0.0/24".parse().unwrap();
        assert_eq!(
            bridge.masquerade_rule("-A", &subnet).join(" "),
            "-t nat -A POSTROUTING -s 172.18.0.0/24 ! -o skiff0 -j MASQUERADE"
        );
    }
}
