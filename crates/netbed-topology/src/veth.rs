//! Veth-pair links between hosts.
//!
//! A [`VirtualInterface`] owns the near end of a veth pair. The peer end
//! is derived deterministically (`<name>.p`) and, when a far end is
//! configured, moved into the far host's namespace and renamed to the far
//! interface's identity. Address configuration on the far end stays lazy:
//! the far host's own `Interface::config_addr` applies it during its
//! `net_up`, exactly like any other interface it owns.

use netbed_common::{Cidr, Result};

use crate::interface::{missing_device, Interface};
use crate::shell::Shell;

/// The identity the peer end assumes on the far host.
#[derive(Debug, Clone)]
pub struct FarEnd {
    pub shell: Shell,
    pub interface: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VirtualInterface {
    inner: Interface,
    peer_name: String,
    far: Option<FarEnd>,
    /// Gateway address the peer's default route points at, resolved at
    /// wiring time (near interface address, else linked bridge address).
    peer_gateway: Option<Cidr>,
}

/// Deterministic peer-device name for a near-end name.
pub fn peer_name_for(name: &str) -> String {
    format!("{name}.p")
}

impl VirtualInterface {
    pub fn new(inner: Interface, far: Option<FarEnd>, peer_gateway: Option<Cidr>) -> Self {
        let peer_name = peer_name_for(inner.name());
        Self {
            inner,
            peer_name,
            far,
            peer_gateway,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn far(&self) -> Option<&FarEnd> {
        self.far.as_ref()
    }

    pub fn inner(&self) -> &Interface {
        &self.inner
    }

    /// Allocate the veth pair. With a far end configured the peer is
    /// moved into the far namespace and renamed; without one the pair is
    /// left local (loopback-style testing).
    pub fn create(&self) -> Result<()> {
        let shell = self.inner.shell();
        let name = self.inner.name();

        tracing::debug!(
            iface = name,
            peer = %self.peer_name,
            far = self.far.as_ref().map(|f| f.interface.as_str()),
            "creating veth pair"
        );
        shell.run_checked(&format!(
            "ip link add {} type veth peer name {}",
            name, self.peer_name
        ))?;

        if let Some(mac) = self.inner.mac() {
            shell.run_checked(&format!("ip link set dev {} address {}", name, mac))?;
        }
        if let Some(bridge) = self.inner.linked_bridge() {
            shell.run_checked(&format!("ip link set dev {} master {}", name, bridge))?;
        }

        if let Some(far) = &self.far {
            match far.shell.netns_name() {
                Some(ns) => {
                    shell.run_checked(&format!(
                        "ip link set {} netns {}",
                        self.peer_name, ns
                    ))?;
                }
                // Far end on the root OS: the peer only has to move when
                // the pair was created inside a namespace. PID 1 owns
                // the root network namespace.
                None if shell.is_netns() => {
                    shell.run_checked(&format!(
                        "ip link set {} netns 1",
                        self.peer_name
                    ))?;
                }
                None => {}
            }
            // Rename happens in the peer's final namespace; a fresh veth
            // end is still down, so no down/up dance is needed.
            far.shell.run_checked(&format!(
                "ip link set dev {} name {}",
                self.peer_name, far.interface
            ))?;
            if let Some(mac) = &far.mac {
                far.shell.run_checked(&format!(
                    "ip link set dev {} address {}",
                    far.interface, mac
                ))?;
            }
        }
        Ok(())
    }

    pub fn up(&self) -> Result<()> {
        self.inner.up()
    }

    pub fn down(&self) -> Result<()> {
        self.inner.down()
    }

    pub fn config_addr(&self) -> Result<()> {
        self.inner.config_addr()
    }

    pub fn start_vlans(&self) -> Result<()> {
        self.inner.start_vlans()
    }

    pub fn stop_vlans(&self) -> Result<()> {
        self.inner.stop_vlans()
    }

    /// Install the peer's default route pointing at the near end. Veth
    /// peers have no notion of a gateway by default, so this runs as a
    /// post-wiring step once both ends are up. Skipped when no gateway
    /// address was resolvable (near end and its bridge both addressless).
    pub fn add_peer_route(&self) -> Result<()> {
        let (far, gateway) = match (&self.far, &self.peer_gateway) {
            (Some(far), Some(gw)) => (far, gw),
            (Some(_), None) => {
                tracing::debug!(
                    iface = %self.inner.name(),
                    "near end has no address, skipping peer route"
                );
                return Ok(());
            }
            (None, _) => return Ok(()),
        };
        tracing::debug!(
            iface = %self.inner.name(),
            peer = %far.interface,
            gateway = %gateway.addr(),
            "installing peer default route"
        );
        far.shell.run_checked(&format!(
            "ip route replace default via {}",
            gateway.addr()
        ))?;
        Ok(())
    }

    /// Remove both ends. Deleting the near end takes the peer with it;
    /// when the near end is already gone (its namespace was torn down
    /// first) the far end is deleted directly. Safe to call twice.
    pub fn remove(&self) -> Result<()> {
        let result = self
            .inner
            .shell()
            .run(&format!("ip link del {}", self.inner.name()))?;
        if result.success() {
            return Ok(());
        }
        if !missing_device(&result.stderr) {
            tracing::warn!(
                iface = %self.inner.name(),
                stderr = %result.stderr.trim_end(),
                "veth removal failed"
            );
            return Ok(());
        }
        if let Some(far) = &self.far {
            let _ = far
                .shell
                .run(&format!("ip link del {}", far.interface))?;
        }
        Ok(())
    }

    pub fn print_config(&self, indent: usize) {
        self.inner.print_config(indent);
        let pad = "    ".repeat(indent + 1);
        match &self.far {
            Some(far) => println!(
                "{}peer: {} as {} in [{}]",
                pad,
                self.peer_name,
                far.interface,
                far.shell.netns_name().unwrap_or("root")
            ),
            None => println!("{}peer: {} (local pair)", pad, self.peer_name),
        }
    }
}
