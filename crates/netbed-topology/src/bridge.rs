//! Linux bridge devices grouping interfaces on a host.
//!
//! Membership is decided by topology wiring, not by runtime joins:
//! member interfaces set `master` when they are created, so a bridge
//! only has to exist and be up before its members come up. Host boot
//! enforces that ordering.

use netbed_common::{Cidr, Result};

use crate::interface::add_address;
use crate::shell::Shell;

#[derive(Debug, Clone)]
pub struct Bridge {
    name: String,
    shell: Shell,
    mac: Option<String>,
    addresses: Vec<Cidr>,
    options: Vec<String>,
    members: Vec<String>,
}

impl Bridge {
    pub fn new(
        name: impl Into<String>,
        shell: Shell,
        mac: Option<String>,
        addresses: Vec<Cidr>,
        options: Vec<String>,
        members: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            shell,
            mac,
            addresses,
            options,
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Names of the interfaces configured to join this bridge. Members
    /// attach themselves (`master`) when they are created.
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn addresses(&self) -> &[Cidr] {
        &self.addresses
    }

    pub fn first_address(&self) -> Option<&Cidr> {
        self.addresses.first()
    }

    pub fn create(&self) -> Result<()> {
        tracing::debug!(bridge = %self.name, "creating bridge");
        self.shell
            .run_checked(&format!("ip link add name {} type bridge", self.name))?;
        if self.options.iter().any(|o| o == "stp") {
            self.shell.run_checked(&format!(
                "ip link set dev {} type bridge stp_state 1",
                self.name
            ))?;
        }
        if let Some(mac) = &self.mac {
            self.shell
                .run_checked(&format!("ip link set dev {} address {}", self.name, mac))?;
        }
        Ok(())
    }

    pub fn up(&self) -> Result<()> {
        self.shell
            .run_checked(&format!("ip link set dev {} up", self.name))?;
        Ok(())
    }

    pub fn down(&self) -> Result<()> {
        let _ = self
            .shell
            .run(&format!("ip link set dev {} down", self.name))?;
        Ok(())
    }

    /// Apply the configured address list, idempotently.
    pub fn config_addr(&self) -> Result<()> {
        for addr in &self.addresses {
            add_address(&self.shell, &self.name, addr)?;
        }
        Ok(())
    }

    /// Delete the bridge device, tolerating one that is already gone.
    pub fn remove(&self) -> Result<()> {
        tracing::debug!(bridge = %self.name, "removing bridge");
        let _ = self.shell.run(&format!("ip link del {}", self.name))?;
        Ok(())
    }

    pub fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!(
            "{}{}: mac [{}] options [{}]",
            pad,
            self.name,
            self.mac.as_deref().unwrap_or("auto"),
            self.options.join(","),
        );
        for addr in &self.addresses {
            println!("{}    ip: {}", pad, addr);
        }
        if !self.members.is_empty() {
            println!("{}    members: {}", pad, self.members.join(", "));
        }
    }
}
