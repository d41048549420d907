//! A network interface attached to a host.
//!
//! Plain interfaces are realized as dummy devices when no other machinery
//! provides them; the far end of a veth link arrives in the namespace
//! already created, so `create` skips devices that exist.

use netbed_common::config::VlanDef;
use netbed_common::{Cidr, Result};

use crate::shell::Shell;

#[derive(Debug, Clone)]
pub struct Interface {
    name: String,
    shell: Shell,
    mac: Option<String>,
    addresses: Vec<Cidr>,
    linked_bridge: Option<String>,
    vlans: Vec<VlanDef>,
}

impl Interface {
    pub fn new(
        name: impl Into<String>,
        shell: Shell,
        mac: Option<String>,
        addresses: Vec<Cidr>,
        linked_bridge: Option<String>,
        vlans: Vec<VlanDef>,
    ) -> Self {
        Self {
            name: name.into(),
            shell,
            mac,
            addresses,
            linked_bridge,
            vlans,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    pub fn addresses(&self) -> &[Cidr] {
        &self.addresses
    }

    pub fn first_address(&self) -> Option<&Cidr> {
        self.addresses.first()
    }

    pub fn linked_bridge(&self) -> Option<&str> {
        self.linked_bridge.as_deref()
    }

    pub fn vlans(&self) -> &[VlanDef] {
        &self.vlans
    }

    /// Whether the OS-level device currently exists on this host.
    pub fn exists(&self) -> Result<bool> {
        let result = self
            .shell
            .run(&format!("ip link show dev {}", self.name))?;
        Ok(result.success())
    }

    /// Allocate the OS-level device. Skipped when the device already
    /// exists — the peer end of a veth link lands in this namespace
    /// before the owning host boots.
    pub fn create(&self) -> Result<()> {
        if self.exists()? {
            tracing::debug!(iface = %self.name, "device already present, skipping create");
        } else {
            tracing::debug!(iface = %self.name, "creating dummy device");
            self.shell
                .run_checked(&format!("ip link add {} type dummy", self.name))?;
        }
        if let Some(mac) = &self.mac {
            self.shell
                .run_checked(&format!("ip link set dev {} address {}", self.name, mac))?;
        }
        if let Some(bridge) = &self.linked_bridge {
            self.shell
                .run_checked(&format!("ip link set dev {} master {}", self.name, bridge))?;
        }
        Ok(())
    }

    pub fn up(&self) -> Result<()> {
        self.shell
            .run_checked(&format!("ip link set dev {} up", self.name))?;
        Ok(())
    }

    /// Administrative down. Tolerates a missing device — `down` runs on
    /// teardown paths that may race namespace deletion.
    pub fn down(&self) -> Result<()> {
        let _ = self.shell.run(&format!("ip link set dev {} down", self.name))?;
        Ok(())
    }

    /// Apply the configured address list. Idempotent: an address that is
    /// already present is left alone.
    pub fn config_addr(&self) -> Result<()> {
        for addr in &self.addresses {
            add_address(&self.shell, &self.name, addr)?;
        }
        Ok(())
    }

    /// Add a single address, independent of the configured list.
    pub fn add_ip(&self, addr: &Cidr) -> Result<()> {
        add_address(&self.shell, &self.name, addr)
    }

    /// Remove a single address, independent of the configured list.
    pub fn del_ip(&self, addr: &Cidr) -> Result<()> {
        self.shell
            .run_checked(&format!("ip addr del {} dev {}", addr, self.name))?;
        Ok(())
    }

    /// Delete the device. Tolerates one that is already gone so teardown
    /// stays idempotent.
    pub fn remove(&self) -> Result<()> {
        tracing::debug!(iface = %self.name, "removing device");
        let result = self.shell.run(&format!("ip link del {}", self.name))?;
        if !result.success() && !missing_device(&result.stderr) {
            tracing::warn!(
                iface = %self.name,
                stderr = %result.stderr.trim_end(),
                "device removal failed"
            );
        }
        Ok(())
    }

    /// Create, address, and bring up the configured 802.1Q sub-interfaces.
    pub fn start_vlans(&self) -> Result<()> {
        for vlan in &self.vlans {
            let sub = format!("{}.{}", self.name, vlan.id);
            tracing::debug!(iface = %sub, "starting vlan sub-interface");
            self.shell.run_checked(&format!(
                "ip link add link {} name {} type vlan id {}",
                self.name, sub, vlan.id
            ))?;
            for addr in &vlan.ip_addresses {
                add_address(&self.shell, &sub, addr)?;
            }
            self.shell.run_checked(&format!("ip link set dev {sub} up"))?;
        }
        Ok(())
    }

    /// Tear down the 802.1Q sub-interfaces, tolerating already-removed
    /// devices.
    pub fn stop_vlans(&self) -> Result<()> {
        for vlan in &self.vlans {
            let sub = format!("{}.{}", self.name, vlan.id);
            let _ = self.shell.run(&format!("ip link set dev {sub} down"))?;
            let _ = self.shell.run(&format!("ip link del {sub}"))?;
        }
        Ok(())
    }

    pub fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!(
            "{}{}: mac [{}] on bridge [{}]",
            pad,
            self.name,
            self.mac.as_deref().unwrap_or("auto"),
            self.linked_bridge.as_deref().unwrap_or("-"),
        );
        for addr in &self.addresses {
            println!("{}    ip: {}", pad, addr);
        }
        for vlan in &self.vlans {
            let ips: Vec<String> = vlan.ip_addresses.iter().map(|a| a.to_string()).collect();
            println!("{}    vlan {}: {}", pad, vlan.id, ips.join(", "));
        }
    }
}

/// `ip addr add` with "already assigned" treated as success.
pub(crate) fn add_address(shell: &Shell, device: &str, addr: &Cidr) -> Result<()> {
    let result = shell.run(&format!("ip addr add {} dev {}", addr, device))?;
    if result.success() || result.stderr.contains("File exists") {
        return Ok(());
    }
    Err(netbed_common::Error::SubprocessFailed {
        command: format!("ip addr add {} dev {}", addr, device),
        status: result.status,
        stderr: result.stderr.trim_end().to_string(),
    })
}

pub(crate) fn missing_device(stderr: &str) -> bool {
    stderr.contains("Cannot find device") || stderr.contains("does not exist")
}
