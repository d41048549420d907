//! A provisioning unit representing one emulated machine.
//!
//! A host is either the root OS or a network namespace; either way it
//! owns its bridges, interfaces, routing rules, applications, echo
//! servers, and packet captures, and every OS mutation it performs goes
//! through its own [`Shell`]. Lifecycle transitions are driven externally
//! by the topology manager in strict global order:
//!
//! ```text
//! create -> boot -> net_up -> net_finalize -> [steady state]
//!        -> net_down -> shutdown -> remove
//! ```
//!
//! Failures during bring-up are fatal and propagate; teardown paths
//! tolerate already-removed resources so cleanup after a failed setup
//! stays best-effort.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use netbed_common::config::{AppKind, HostDef, HostKind, InterfaceDef, RouteDef};
use netbed_common::{Cidr, Error, Result};

use crate::application::{build_application, Application};
use crate::bridge::Bridge;
use crate::capture::{Packet, PacketCapture};
use crate::echo::{send_echo_request, EchoProtocol, EchoServerHandle};
use crate::interface::Interface;
use crate::shell::Shell;
use crate::veth::{FarEnd, VirtualInterface};

/// Settle delay between stop and start in a restart cycle. A fixed sleep
/// is a known source of flakiness accepted for simplicity.
const RESTART_SETTLE: Duration = Duration::from_secs(3);

/// An interface slot on a host: a plain device, or the near end of a
/// veth link installed by topology wiring.
#[derive(Debug)]
pub enum HostInterface {
    Plain(Interface),
    Virtual(VirtualInterface),
}

impl HostInterface {
    pub fn name(&self) -> &str {
        match self {
            HostInterface::Plain(i) => i.name(),
            HostInterface::Virtual(v) => v.name(),
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualInterface> {
        match self {
            HostInterface::Virtual(v) => Some(v),
            HostInterface::Plain(_) => None,
        }
    }

    pub fn as_plain(&self) -> Option<&Interface> {
        match self {
            HostInterface::Plain(i) => Some(i),
            HostInterface::Virtual(_) => None,
        }
    }

    pub fn addresses(&self) -> &[Cidr] {
        match self {
            HostInterface::Plain(i) => i.addresses(),
            HostInterface::Virtual(v) => v.inner().addresses(),
        }
    }

    pub fn create(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.create(),
            HostInterface::Virtual(v) => v.create(),
        }
    }

    pub fn up(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.up(),
            HostInterface::Virtual(v) => v.up(),
        }
    }

    pub fn down(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.down(),
            HostInterface::Virtual(v) => v.down(),
        }
    }

    pub fn config_addr(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.config_addr(),
            HostInterface::Virtual(v) => v.config_addr(),
        }
    }

    pub fn start_vlans(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.start_vlans(),
            HostInterface::Virtual(v) => v.start_vlans(),
        }
    }

    pub fn stop_vlans(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.stop_vlans(),
            HostInterface::Virtual(v) => v.stop_vlans(),
        }
    }

    pub fn remove(&self) -> Result<()> {
        match self {
            HostInterface::Plain(i) => i.remove(),
            HostInterface::Virtual(v) => v.remove(),
        }
    }

    pub fn print_config(&self, indent: usize) {
        match self {
            HostInterface::Plain(i) => i.print_config(indent),
            HostInterface::Virtual(v) => v.print_config(indent),
        }
    }
}

pub struct Host {
    name: String,
    shell: Shell,
    on_namespace: bool,
    start_priority: u32,
    main_ip: Option<IpAddr>,
    bridges: BTreeMap<String, Bridge>,
    interfaces: BTreeMap<String, HostInterface>,
    applications: Vec<Box<dyn Application>>,
    ip_forward_rules: Vec<(String, String)>,
    route_rules: Vec<RouteDef>,
    echo_servers: HashMap<u16, EchoServerHandle>,
    captures: HashMap<String, PacketCapture>,
    dhcp_clients: HashSet<String>,
    tap_interfaces: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("on_namespace", &self.on_namespace)
            .field("start_priority", &self.start_priority)
            .field("main_ip", &self.main_ip)
            .field("bridges", &self.bridges)
            .field("interfaces", &self.interfaces)
            .field("applications", &self.applications.len())
            .field("ip_forward_rules", &self.ip_forward_rules)
            .field("route_rules", &self.route_rules)
            .field("echo_servers", &self.echo_servers.len())
            .field("dhcp_clients", &self.dhcp_clients)
            .field("tap_interfaces", &self.tap_interfaces)
            .finish()
    }
}

impl Host {
    /// Build a host from its topology definition. Applications are
    /// constructed here; one instance per kind unless the kind allows
    /// more.
    pub fn from_def(def: &HostDef) -> Result<Host> {
        let shell = match def.kind {
            HostKind::Root => Shell::root(),
            HostKind::Netns => Shell::netns(&def.name),
        };

        let mut bridges = BTreeMap::new();
        for br in &def.bridges {
            let members: Vec<String> = def
                .interfaces
                .iter()
                .filter(|i| i.linked_bridge.as_deref() == Some(br.name.as_str()))
                .map(|i| i.name.clone())
                .collect();
            bridges.insert(
                br.name.clone(),
                Bridge::new(
                    &br.name,
                    shell.clone(),
                    br.mac.clone(),
                    br.ip_addresses.clone(),
                    br.options.clone(),
                    members,
                ),
            );
        }

        let mut interfaces = BTreeMap::new();
        for iface in &def.interfaces {
            if let Some(bridge) = &iface.linked_bridge {
                if !bridges.contains_key(bridge) {
                    return Err(Error::ObjectNotFound(format!(
                        "linked bridge `{}` on interface `{}` not found on host `{}`",
                        bridge, iface.name, def.name
                    )));
                }
            }
            interfaces.insert(
                iface.name.clone(),
                HostInterface::Plain(Interface::new(
                    &iface.name,
                    shell.clone(),
                    iface.mac.clone(),
                    iface.ip_addresses.clone(),
                    iface.linked_bridge.clone(),
                    iface.vlans.clone(),
                )),
            );
        }

        // Main IP: eth0's first address when present, else the first
        // declared interface's first address.
        let main_ip = def
            .interfaces
            .iter()
            .find(|i| i.name == "eth0")
            .or_else(|| def.interfaces.first())
            .and_then(|i| i.ip_addresses.first())
            .map(|c| c.addr());

        let mut applications: Vec<Box<dyn Application>> = Vec::new();
        let mut kind_counts: HashMap<AppKind, usize> = HashMap::new();
        for app_def in &def.applications {
            let count = kind_counts.entry(app_def.kind).or_insert(0);
            *count += 1;
            if *count > 1 && !app_def.kind.multi_allowed() {
                return Err(Error::ArgMismatch(format!(
                    "cannot run more than one application of kind `{}` on host `{}`",
                    app_def.kind, def.name
                )));
            }
            applications.push(build_application(
                app_def,
                &def.name,
                main_ip,
                shell.clone(),
            )?);
        }

        Ok(Host {
            name: def.name.clone(),
            on_namespace: def.kind == HostKind::Netns,
            start_priority: def.start_priority,
            main_ip,
            shell,
            bridges,
            interfaces,
            applications,
            ip_forward_rules: def
                .ip_forward_rules
                .iter()
                .map(|r| (r.exterior.clone(), r.interior.clone()))
                .collect(),
            route_rules: def.route_rules.clone(),
            echo_servers: HashMap::new(),
            captures: HashMap::new(),
            dhcp_clients: HashSet::new(),
            tap_interfaces: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn on_namespace(&self) -> bool {
        self.on_namespace
    }

    pub fn start_priority(&self) -> u32 {
        self.start_priority
    }

    pub fn main_ip(&self) -> Option<IpAddr> {
        self.main_ip
    }

    pub fn interfaces(&self) -> &BTreeMap<String, HostInterface> {
        &self.interfaces
    }

    pub fn interface(&self, name: &str) -> Result<&HostInterface> {
        self.interfaces.get(name).ok_or_else(|| {
            Error::ObjectNotFound(format!("interface `{}` on host `{}`", name, self.name))
        })
    }

    pub fn bridges(&self) -> &BTreeMap<String, Bridge> {
        &self.bridges
    }

    pub fn applications(&self) -> &[Box<dyn Application>] {
        &self.applications
    }

    /// Whether this host runs a network agent (hypervisor role).
    pub fn is_hypervisor(&self) -> bool {
        self.applications.iter().any(|a| a.kind() == AppKind::Agent)
    }

    // ── Wiring ──────────────────────────────────────────────────────

    /// Replace a plain interface with the near end of a veth link to the
    /// given far end. The peer's gateway is resolved here: the near
    /// interface's first address, else its linked bridge's first
    /// address.
    pub fn link_interface(&mut self, near_name: &str, far: FarEnd) -> Result<()> {
        let near = match self.interfaces.remove(near_name) {
            Some(HostInterface::Plain(i)) => i,
            Some(virt @ HostInterface::Virtual(_)) => {
                self.interfaces.insert(near_name.to_string(), virt);
                return Err(Error::Configuration(format!(
                    "interface `{}` on host `{}` is already wired",
                    near_name, self.name
                )));
            }
            None => {
                return Err(Error::ObjectNotFound(format!(
                    "interface `{}` on host `{}`",
                    near_name, self.name
                )))
            }
        };

        tracing::debug!(
            host = %self.name,
            iface = near_name,
            far = %far.interface,
            "wiring interface to far end"
        );
        let gateway = near
            .first_address()
            .copied()
            .or_else(|| {
                near.linked_bridge()
                    .and_then(|b| self.bridges.get(b))
                    .and_then(|b| b.first_address())
                    .copied()
            });
        self.interfaces.insert(
            near_name.to_string(),
            HostInterface::Virtual(VirtualInterface::new(near, Some(far), gateway)),
        );
        Ok(())
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create the host's namespace. No-op for the root host.
    pub fn create(&self) -> Result<()> {
        if self.on_namespace {
            Shell::create_namespace(&self.name)?;
        }
        Ok(())
    }

    /// Create bridges (and bring them up) first, then create all
    /// interfaces without activating them, then ensure loopback.
    pub fn boot(&self) -> Result<()> {
        tracing::info!(host = %self.name, "booting");
        for bridge in self.bridges.values() {
            bridge.create()?;
            bridge.config_addr()?;
            bridge.up()?;
        }
        for iface in self.interfaces.values() {
            iface.create()?;
        }
        self.set_loopback()?;
        Ok(())
    }

    /// Bring up and address-configure every interface, then start VLAN
    /// sub-interfaces.
    pub fn net_up(&self) -> Result<()> {
        tracing::info!(host = %self.name, "bringing network up");
        for iface in self.interfaces.values() {
            iface.up()?;
            iface.config_addr()?;
            iface.start_vlans()?;
        }
        Ok(())
    }

    /// Post-wiring configuration: peer default routes for veth links,
    /// then NAT/forwarding rules, then static routes, in declared order.
    pub fn net_finalize(&self) -> Result<()> {
        for iface in self.interfaces.values() {
            if let Some(vif) = iface.as_virtual() {
                vif.add_peer_route()?;
            }
        }
        for (exterior, interior) in &self.ip_forward_rules {
            self.shell.run_checked(&format!(
                "iptables -t nat -A POSTROUTING -o {exterior} -j MASQUERADE"
            ))?;
            self.shell.run_checked(&format!(
                "iptables -A FORWARD -i {interior} -o {exterior} -j ACCEPT"
            ))?;
            self.shell.run_checked(&format!(
                "iptables -A FORWARD -i {exterior} -o {interior} \
                 -m state --state RELATED,ESTABLISHED -j ACCEPT"
            ))?;
        }
        for route in &self.route_rules {
            self.add_route(&route.dest, route.gateway.as_ref(), route.device.as_deref())?;
        }
        Ok(())
    }

    /// Reverse of `net_finalize` + `net_up`. Best-effort: rules and
    /// devices that are already gone are tolerated.
    pub fn net_down(&self) -> Result<()> {
        tracing::info!(host = %self.name, "bringing network down");
        for route in &self.route_rules {
            self.del_route(&route.dest)?;
        }
        for (exterior, interior) in &self.ip_forward_rules {
            let _ = self.shell.run(&format!(
                "iptables -t nat -D POSTROUTING -o {exterior} -j MASQUERADE"
            ))?;
            let _ = self.shell.run(&format!(
                "iptables -D FORWARD -i {interior} -o {exterior} -j ACCEPT"
            ))?;
            let _ = self.shell.run(&format!(
                "iptables -D FORWARD -i {exterior} -o {interior} \
                 -m state --state RELATED,ESTABLISHED -j ACCEPT"
            ))?;
        }
        for iface in self.interfaces.values() {
            iface.stop_vlans()?;
            iface.down()?;
        }
        for bridge in self.bridges.values() {
            bridge.down()?;
        }
        Ok(())
    }

    /// Reverse of `boot`: remove interfaces, then bridges.
    pub fn shutdown(&mut self) -> Result<()> {
        tracing::info!(host = %self.name, "shutting down");
        let running_dhcp: Vec<String> = self.dhcp_clients.iter().cloned().collect();
        for iface in running_dhcp {
            self.stop_dhcp_client(&iface)?;
        }
        for iface in self.interfaces.values() {
            iface.remove()?;
        }
        for bridge in self.bridges.values() {
            bridge.remove()?;
        }
        Ok(())
    }

    pub fn reboot(&mut self) -> Result<()> {
        self.shutdown()?;
        self.boot()
    }

    /// Destroy the host's namespace. Echo servers and captures still
    /// running are stopped first so no orphan process outlives its
    /// namespace.
    pub fn remove(&mut self) -> Result<()> {
        for (_, mut server) in self.echo_servers.drain() {
            server.stop();
        }
        for (_, mut capture) in self.captures.drain() {
            capture.stop();
        }
        if self.on_namespace {
            Shell::delete_namespace(&self.name)?;
        }
        Ok(())
    }

    /// Ensure loopback carries 127.0.0.1/8 and is up.
    pub fn set_loopback(&self) -> Result<()> {
        if !self
            .shell
            .grep_output("ip addr show dev lo", "inet 127.0.0.1")?
        {
            self.shell.run_checked("ip addr add 127.0.0.1/8 dev lo")?;
        }
        self.shell.run_checked("ip link set dev lo up")?;
        Ok(())
    }

    // ── Routing ─────────────────────────────────────────────────────

    /// Add a route to `dest` ("default" or a CIDR). At least one of
    /// gateway and device must be given.
    pub fn add_route(
        &self,
        dest: &str,
        gateway: Option<&Cidr>,
        device: Option<&str>,
    ) -> Result<()> {
        let cmd = match (gateway, device) {
            (None, None) => {
                return Err(Error::ArgMismatch(
                    "must specify either next-hop gateway or device to add a route".into(),
                ))
            }
            (None, Some(dev)) => format!("ip route add {dest} dev {dev}"),
            (Some(gw), None) => format!("ip route add {dest} via {}", gw.addr()),
            (Some(gw), Some(dev)) => {
                format!("ip route add {dest} via {} dev {dev}", gw.addr())
            }
        };
        self.shell.run_checked(&cmd)?;
        Ok(())
    }

    /// Delete a route. Tolerates a route that is already gone — this
    /// runs on teardown paths.
    pub fn del_route(&self, dest: &str) -> Result<()> {
        let _ = self.shell.run(&format!("ip route del {dest}"))?;
        Ok(())
    }

    /// Replace the default route with one via the given gateway.
    pub fn reset_default_route(&self, gateway: IpAddr) -> Result<()> {
        let _ = self.shell.run("ip route del default")?;
        self.shell
            .run_checked(&format!("ip route add default via {gateway}"))?;
        Ok(())
    }

    /// First IPv4 address currently assigned to an interface, if any.
    pub fn get_ip(&self, iface: &str) -> Result<Option<String>> {
        let result = self.shell.run(&format!(
            "ip addr show dev {iface} | grep -w inet | awk '{{print $2}}' | sed 's/\\/.*//g'"
        ))?;
        Ok(result
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    /// Flush the host's ARP table.
    pub fn flush_arp(&self) -> Result<()> {
        self.shell.run_checked("ip neighbour flush all")?;
        Ok(())
    }

    // ── DHCP client ─────────────────────────────────────────────────

    fn dhcp_file_stem(&self, iface: &str) -> String {
        format!("{}.{}", self.name, iface)
    }

    /// Start a DHCP client on the interface and poll until an address
    /// is assigned or the timeout elapses.
    pub fn request_ip_from_dhcp(&mut self, iface: &str, timeout: Duration) -> Result<String> {
        let stem = self.dhcp_file_stem(iface);
        self.shell.run_checked(&format!(
            "dhclient -nw -pf /run/dhclient-{stem}.pid \
             -lf /var/lib/dhcp/dhclient-{stem}.lease {iface}"
        ))?;
        self.dhcp_clients.insert(iface.to_string());

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ip) = self.get_ip(iface)? {
                tracing::debug!(host = %self.name, iface, %ip, "received IP from DHCP");
                return Ok(ip);
            }
            if Instant::now() >= deadline {
                self.stop_dhcp_client(iface)?;
                return Err(Error::SubprocessTimeout {
                    operation: format!("DHCP lease on {}/{}", self.name, iface),
                    seconds: timeout.as_secs(),
                });
            }
            std::thread::sleep(Duration::from_millis(200));
        }
    }

    /// Release the lease and stop the DHCP client for the interface.
    pub fn stop_dhcp_client(&mut self, iface: &str) -> Result<()> {
        let stem = self.dhcp_file_stem(iface);
        let _ = self.shell.run(&format!(
            "dhclient -r -pf /run/dhclient-{stem}.pid \
             -lf /var/lib/dhcp/dhclient-{stem}.lease {iface}"
        ))?;
        self.shell
            .remove_file(&PathBuf::from(format!("/run/dhclient-{stem}.pid")))?;
        self.shell.remove_file(&PathBuf::from(format!(
            "/var/lib/dhcp/dhclient-{stem}.lease"
        )))?;
        self.dhcp_clients.remove(iface);
        Ok(())
    }

    // ── Applications ────────────────────────────────────────────────

    fn filtered_apps<'a>(
        &'a self,
        kinds: Option<&'a [AppKind]>,
    ) -> impl Iterator<Item = &'a Box<dyn Application>> {
        self.applications
            .iter()
            .filter(move |a| kinds.is_none_or(|ks| ks.contains(&a.kind())))
    }

    pub fn prepare_applications(&self) -> Result<()> {
        for app in &self.applications {
            app.prepare_config()?;
        }
        Ok(())
    }

    /// Start applications, optionally only those of the given kinds —
    /// the filter enables targeted failure injection in tests.
    pub fn start_applications(&self, kinds: Option<&[AppKind]>) -> Result<()> {
        for app in self.filtered_apps(kinds) {
            tracing::debug!(host = %self.name, app = app.name(), "starting application");
            app.start()?;
        }
        Ok(())
    }

    pub fn wait_for_applications_start(&self, kinds: Option<&[AppKind]>) -> Result<()> {
        for app in self.filtered_apps(kinds) {
            tracing::debug!(host = %self.name, app = app.name(), "waiting for application");
            app.wait_for_start()?;
        }
        Ok(())
    }

    pub fn stop_applications(&self, kinds: Option<&[AppKind]>) -> Result<()> {
        for app in self.filtered_apps(kinds) {
            tracing::debug!(host = %self.name, app = app.name(), "stopping application");
            app.stop()?;
        }
        Ok(())
    }

    pub fn wait_for_applications_stop(&self, kinds: Option<&[AppKind]>) -> Result<()> {
        for app in self.filtered_apps(kinds) {
            app.wait_for_stop()?;
        }
        Ok(())
    }

    /// Stop, wait, settle, start, wait.
    pub fn restart_applications(&self, kinds: Option<&[AppKind]>) -> Result<()> {
        self.stop_applications(kinds)?;
        self.wait_for_applications_stop(kinds)?;
        std::thread::sleep(RESTART_SETTLE);
        self.start_applications(kinds)?;
        self.wait_for_applications_start(kinds)
    }

    /// Collect a named resource from every application of the given
    /// kinds (all applications when no filter is given).
    pub fn fetch_resources_from_applications(
        &self,
        resource: &str,
        kinds: Option<&[AppKind]>,
    ) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for app in self.filtered_apps(kinds) {
            if let Some(value) = app.get_resource(resource)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    // ── Test primitives ─────────────────────────────────────────────

    /// Ping a target. Returns true when every probe succeeded.
    pub fn ping(
        &self,
        target: &str,
        iface: Option<&str>,
        count: u32,
        timeout_secs: Option<u64>,
    ) -> Result<bool> {
        let mut cmd = String::from("ping -n");
        if let Some(iface) = iface {
            cmd.push_str(&format!(" -I {iface}"));
        }
        cmd.push_str(&format!(" -c {count}"));
        if let Some(t) = timeout_secs {
            cmd.push_str(&format!(" -W {t}"));
        }
        cmd.push_str(&format!(" {target}"));
        Ok(self.shell.run(&cmd)?.success())
    }

    /// Start an echo server bound to ip:port. A server already running
    /// on the port is stopped and replaced.
    pub fn start_echo_server(
        &mut self,
        ip: &str,
        port: u16,
        echo_data: &str,
        protocol: EchoProtocol,
    ) -> Result<()> {
        if let Some(mut old) = self.echo_servers.remove(&port) {
            old.stop();
        }
        let handle = EchoServerHandle::spawn(&self.shell, ip, port, echo_data, protocol)?;
        self.echo_servers.insert(port, handle);
        Ok(())
    }

    /// Stop the echo server on the port. Does nothing when none is
    /// running.
    pub fn stop_echo_server(&mut self, port: u16) {
        if let Some(mut server) = self.echo_servers.remove(&port) {
            server.stop();
        }
    }

    /// Send an echo request and return the reply; an unanswered request
    /// returns an empty string.
    pub fn send_echo_request(
        &self,
        dest_ip: &str,
        dest_port: u16,
        payload: &str,
        protocol: EchoProtocol,
        timeout_secs: u64,
    ) -> Result<String> {
        send_echo_request(
            &self.shell,
            dest_ip,
            dest_port,
            payload,
            protocol,
            timeout_secs,
        )
    }

    /// Start capturing packets on an interface. At most one capture per
    /// interface: an existing one is stopped and replaced.
    pub fn start_capture(
        &mut self,
        iface: &str,
        count: u32,
        filter: Option<&str>,
        dump_file: Option<PathBuf>,
    ) -> Result<()> {
        if let Some(mut old) = self.captures.remove(iface) {
            tracing::debug!(host = %self.name, iface, "replacing existing capture");
            old.stop();
        }
        let capture = PacketCapture::start(&self.shell, iface, count, filter, dump_file)?;
        self.captures.insert(iface.to_string(), capture);
        Ok(())
    }

    /// Wait for `count` captured packets (0 drains the buffer without
    /// blocking). Raises when no capture is or was running on the
    /// interface.
    pub fn capture_packets(
        &mut self,
        iface: &str,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Packet>> {
        let capture = self.captures.get_mut(iface).ok_or_else(|| {
            Error::ObjectNotFound(format!(
                "no packet capture is running or was run on {}/{}",
                self.name, iface
            ))
        })?;
        capture.wait_for_packets(count, timeout)
    }

    /// Halt the capture on the interface; already-captured packets stay
    /// retrievable via `capture_packets`.
    pub fn stop_capture(&mut self, iface: &str) {
        if let Some(capture) = self.captures.get_mut(iface) {
            capture.stop();
        }
    }

    // ── Guest taps ──────────────────────────────────────────────────

    /// Create a tap interface wiring a guest's interface to this
    /// hypervisor host, and bring both ends up immediately.
    pub fn create_tap_interface_for_guest(
        &mut self,
        tap_name: &str,
        guest_id: &str,
        guest: &mut Host,
        guest_iface: &InterfaceDef,
    ) -> Result<()> {
        if !self.is_hypervisor() {
            return Err(Error::ArgMismatch(
                "can only create a tap for a guest on a hypervisor host".into(),
            ));
        }
        tracing::debug!(
            host = %self.name,
            tap = tap_name,
            guest = guest.name(),
            "creating tap interface for guest"
        );

        guest.interfaces.insert(
            guest_iface.name.clone(),
            HostInterface::Plain(Interface::new(
                &guest_iface.name,
                guest.shell.clone(),
                guest_iface.mac.clone(),
                guest_iface.ip_addresses.clone(),
                None,
                guest_iface.vlans.clone(),
            )),
        );

        self.interfaces.insert(
            tap_name.to_string(),
            HostInterface::Plain(Interface::new(
                tap_name,
                self.shell.clone(),
                None,
                Vec::new(),
                None,
                Vec::new(),
            )),
        );
        self.link_interface(
            tap_name,
            FarEnd {
                shell: guest.shell.clone(),
                interface: guest_iface.name.clone(),
                mac: guest_iface.mac.clone(),
            },
        )?;

        let tap = self.interface(tap_name)?;
        tap.create()?;
        tap.up()?;
        tap.config_addr()?;

        let far = guest.interface(&guest_iface.name)?;
        far.up()?;
        far.config_addr()?;
        far.start_vlans()?;

        self.tap_interfaces
            .entry(guest_id.to_string())
            .or_default()
            .push(tap_name.to_string());
        Ok(())
    }

    /// Remove all tap interfaces created for a guest.
    pub fn remove_taps(&mut self, guest_id: &str) -> Result<()> {
        if let Some(taps) = self.tap_interfaces.remove(guest_id) {
            for tap in taps {
                if let Some(iface) = self.interfaces.remove(&tap) {
                    iface.remove()?;
                }
            }
        }
        Ok(())
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    pub fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!(
            "{}{}: {} (priority {})",
            pad,
            self.name,
            if self.on_namespace { "netns" } else { "root" },
            self.start_priority,
        );
        println!("{}    is-hypervisor: {}", pad, self.is_hypervisor());
        if !self.bridges.is_empty() {
            println!("{}    [bridges]", pad);
            for bridge in self.bridges.values() {
                bridge.print_config(indent + 2);
            }
        }
        if !self.route_rules.is_empty() {
            println!("{}    [routes]", pad);
            for route in &self.route_rules {
                println!(
                    "{}        to {} via {} on {}",
                    pad,
                    route.dest,
                    route
                        .gateway
                        .map(|g| g.addr().to_string())
                        .unwrap_or_else(|| "-".into()),
                    route.device.as_deref().unwrap_or("-"),
                );
            }
        }
        if !self.interfaces.is_empty() {
            println!("{}    [interfaces]", pad);
            for iface in self.interfaces.values() {
                iface.print_config(indent + 2);
            }
        }
        if !self.applications.is_empty() {
            println!("{}    [applications]", pad);
            for app in &self.applications {
                app.print_config(indent + 2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netbed_common::config::{ApplicationDef, BridgeDef};
    use serde_json::Value;

    fn host_def(name: &str) -> HostDef {
        HostDef {
            name: name.to_string(),
            kind: HostKind::Netns,
            start_priority: 0,
            bridges: Vec::new(),
            interfaces: Vec::new(),
            ip_forward_rules: Vec::new(),
            route_rules: Vec::new(),
            applications: Vec::new(),
        }
    }

    fn iface_def(name: &str, addrs: &[&str]) -> InterfaceDef {
        InterfaceDef {
            name: name.to_string(),
            mac: None,
            ip_addresses: addrs.iter().map(|a| a.parse().unwrap()).collect(),
            linked_bridge: None,
            vlans: Vec::new(),
        }
    }

    fn agent_def() -> ApplicationDef {
        ApplicationDef {
            kind: AppKind::Agent,
            options: [("command".to_string(), Value::from("sleep 60"))]
                .into_iter()
                .collect(),
        }
    }

    #[test]
    fn duplicate_app_kind_is_rejected() {
        let mut def = host_def("cmp1");
        def.applications = vec![agent_def(), agent_def()];
        let err = Host::from_def(&def).unwrap_err();
        assert!(matches!(err, Error::ArgMismatch(_)));
    }

    #[test]
    fn unknown_linked_bridge_is_rejected() {
        let mut def = host_def("edge1");
        let mut iface = iface_def("eth0", &[]);
        iface.linked_bridge = Some("br-missing".into());
        def.interfaces = vec![iface];
        let err = Host::from_def(&def).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn main_ip_prefers_eth0() {
        let mut def = host_def("zoo1");
        def.interfaces = vec![
            iface_def("eth1", &["192.168.1.1/24"]),
            iface_def("eth0", &["10.0.0.2/24"]),
        ];
        let host = Host::from_def(&def).unwrap();
        assert_eq!(host.main_ip().unwrap().to_string(), "10.0.0.2");
    }

    #[test]
    fn link_interface_resolves_gateway_from_bridge() {
        let mut def = host_def("root");
        def.kind = HostKind::Root;
        def.bridges = vec![BridgeDef {
            name: "br0".into(),
            mac: None,
            ip_addresses: vec!["10.0.0.240/24".parse().unwrap()],
            options: Vec::new(),
        }];
        let mut iface = iface_def("zoo1eth0", &[]);
        iface.linked_bridge = Some("br0".into());
        def.interfaces = vec![iface];
        let mut host = Host::from_def(&def).unwrap();

        host.link_interface(
            "zoo1eth0",
            FarEnd {
                shell: Shell::netns("zoo1"),
                interface: "eth0".into(),
                mac: None,
            },
        )
        .unwrap();

        let vif = host.interface("zoo1eth0").unwrap().as_virtual().unwrap();
        assert_eq!(vif.peer_name(), "zoo1eth0.p");
        assert_eq!(vif.far().unwrap().interface, "eth0");

        // Wiring the same interface twice is a configuration error.
        let err = host
            .link_interface(
                "zoo1eth0",
                FarEnd {
                    shell: Shell::netns("zoo1"),
                    interface: "eth0".into(),
                    mac: None,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn capture_lookup_without_start_fails() {
        let def = host_def("test1");
        let mut host = Host::from_def(&def).unwrap();
        let err = host.capture_packets("eth0", 0, None).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn add_route_requires_gateway_or_device() {
        let def = host_def("test1");
        let host = Host::from_def(&def).unwrap();
        let err = host.add_route("10.1.0.0/16", None, None).unwrap_err();
        assert!(matches!(err, Error::ArgMismatch(_)));
    }

    #[test]
    fn tap_creation_requires_hypervisor() {
        let def = host_def("plain1");
        let mut host = Host::from_def(&def).unwrap();
        let mut guest = Host::from_def(&host_def("guest1")).unwrap();
        let err = host
            .create_tap_interface_for_guest(
                "tapX",
                "guest_1",
                &mut guest,
                &iface_def("eth0", &["10.0.5.2/24"]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ArgMismatch(_)));
    }
}
