//! TCP/UDP echo test helpers.
//!
//! The harness ships two helper binaries (`echo_server`, `echo_send`)
//! that hosts launch through their own execution context, so an echo
//! server started on a namespaced host really listens inside that
//! namespace. The server replies `<request>:<echo_data>` to each
//! request; the client prints the reply to stdout and prints nothing
//! (exit 0) when the target never answers — an unbound port yields an
//! empty response, not an error.

use std::fmt;
use std::path::PathBuf;
use std::process::Child;
use std::time::Duration;

use netbed_common::{Error, Result};

use crate::shell::{terminate_child, Shell};

pub const DEFAULT_ECHO_PORT: u16 = 7777;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for EchoProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoProtocol::Tcp => write!(f, "tcp"),
            EchoProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// A background echo server bound to one port on one host.
pub struct EchoServerHandle {
    port: u16,
    child: Child,
    stopped: bool,
}

impl EchoServerHandle {
    pub fn spawn(
        shell: &Shell,
        ip: &str,
        port: u16,
        echo_data: &str,
        protocol: EchoProtocol,
    ) -> Result<EchoServerHandle> {
        let bin = harness_bin("echo_server")?;
        let cmdline = format!(
            "{} --ip {} --port {} --data '{}' --protocol {}",
            bin.display(),
            ip,
            port,
            echo_data,
            protocol
        );
        tracing::debug!(%ip, port, "starting echo server");
        let child = shell.spawn(&cmdline)?;
        Ok(EchoServerHandle {
            port,
            child,
            stopped: false,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        tracing::debug!(port = self.port, "stopping echo server");
        terminate_child(&mut self.child, Duration::from_secs(2));
        self.stopped = true;
    }
}

impl Drop for EchoServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send one echo request through `shell` and return the reply (empty
/// when the target did not answer). A non-zero client exit is a
/// subprocess failure, not an empty reply.
pub fn send_echo_request(
    shell: &Shell,
    dest_ip: &str,
    dest_port: u16,
    payload: &str,
    protocol: EchoProtocol,
    timeout_secs: u64,
) -> Result<String> {
    let bin = harness_bin("echo_send")?;
    let cmdline = format!(
        "{} --ip {} --port {} --payload '{}' --protocol {} --timeout {}",
        bin.display(),
        dest_ip,
        dest_port,
        payload,
        protocol,
        timeout_secs
    );
    let result = shell.run_checked(&cmdline)?;
    Ok(result.stdout.trim().to_string())
}

/// Locate a sibling helper binary next to the currently running
/// executable, falling back to the workspace target directory.
pub fn harness_bin(name: &str) -> Result<PathBuf> {
    let mut path = std::env::current_exe()?;
    path.pop(); // binary name
    let candidate = path.join(name);
    if candidate.exists() {
        return Ok(candidate);
    }
    // Test executables live one level down in target/<profile>/deps.
    path.pop();
    let candidate = path.join(name);
    if candidate.exists() {
        return Ok(candidate);
    }
    for prefix in ["target/debug", "target/release"] {
        let candidate = std::env::current_dir()?.join(prefix).join(name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::ObjectNotFound(format!(
        "helper binary `{name}` (build the netbed-topology bin targets first)"
    )))
}
