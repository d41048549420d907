//! Integration tests: real network namespaces, veth links, and helper
//! processes.
//!
//! These tests mutate OS state and therefore require root (or
//! CAP_NET_ADMIN) plus the `ip` tool; they skip themselves when the
//! environment cannot support that. Every topology is built from
//! unique, per-process resource names and torn down in all paths, so
//! parallel runs and failed runs do not poison each other.
//!
//! Run:
//! ```bash
//! sudo cargo test -p netbed-topology --test lifecycle -- --nocapture
//! ```

use std::process::Command;
use std::time::Duration;

use netbed_common::config::{
    BridgeDef, HostDef, HostKind, InterfaceDef, TopologyConfig, WiringDef,
};
use netbed_common::Error;
use netbed_topology::echo::EchoProtocol;
use netbed_topology::test_util::{check_privileges, unique_name};
use netbed_topology::{Shell, TopologyManager};

fn iface(name: &str, addrs: &[&str], bridge: Option<&str>) -> InterfaceDef {
    InterfaceDef {
        name: name.to_string(),
        mac: None,
        ip_addresses: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        linked_bridge: bridge.map(str::to_string),
        vlans: Vec::new(),
    }
}

fn netns_host(name: &str, interfaces: Vec<InterfaceDef>) -> HostDef {
    HostDef {
        name: name.to_string(),
        kind: HostKind::Netns,
        start_priority: 10,
        bridges: Vec::new(),
        interfaces,
        ip_forward_rules: Vec::new(),
        route_rules: Vec::new(),
        applications: Vec::new(),
    }
}

/// A root host owning one bridge and one unaddressed near-end interface
/// per wired guest.
fn root_host(bridge: &str, bridge_ip: &str, near_ifaces: &[&str]) -> HostDef {
    HostDef {
        name: "root".to_string(),
        kind: HostKind::Root,
        start_priority: 0,
        bridges: vec![BridgeDef {
            name: bridge.to_string(),
            mac: None,
            ip_addresses: vec![bridge_ip.parse().unwrap()],
            options: Vec::new(),
        }],
        interfaces: near_ifaces
            .iter()
            .map(|n| iface(n, &[], Some(bridge)))
            .collect(),
        ip_forward_rules: Vec::new(),
        route_rules: Vec::new(),
        applications: Vec::new(),
    }
}

fn wire(host: &str, interface: &str, far_host: &str, far_interface: &str) -> WiringDef {
    WiringDef {
        host: host.to_string(),
        interface: interface.to_string(),
        far_host: far_host.to_string(),
        far_interface: far_interface.to_string(),
    }
}

/// Bring a topology up, run the test body, and always tear down.
fn with_topology(
    cfg: TopologyConfig,
    body: impl FnOnce(&mut TopologyManager) -> anyhow::Result<()>,
) {
    let mut manager = TopologyManager::new();
    manager.configure_from(&cfg).expect("configure");
    let up = manager.startup();
    let result = match up {
        Ok(()) => body(&mut manager),
        Err(e) => Err(anyhow::anyhow!("startup failed: {e}")),
    };
    // Teardown runs regardless of the body's outcome.
    manager.shutdown().expect("shutdown");
    result.expect("test body");
}

fn tcpdump_available() -> bool {
    Command::new("tcpdump")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn namespace_boot_shutdown_round_trip() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let ns = unique_name("nb_rt");
    let cfg = TopologyConfig {
        hosts: vec![netns_host(&ns, vec![iface("eth0", &["10.211.1.2/24"], None)])],
        wiring: Vec::new(),
    };

    let mut manager = TopologyManager::new();
    manager.configure_from(&cfg).expect("configure");
    manager.startup().expect("startup");

    assert!(Shell::namespace_exists(&ns).unwrap());
    let host = manager.host(&ns).unwrap();
    assert!(host.shell().grep_output("ip link", "eth0").unwrap());
    assert!(host
        .shell()
        .grep_output("ip addr show dev eth0", "10.211.1.2")
        .unwrap());

    manager.shutdown().expect("shutdown");
    assert!(!Shell::namespace_exists(&ns).unwrap());
    // A second shutdown of an already-down topology must not blow up.
    manager.shutdown().expect("second shutdown");
}

#[test]
fn veth_link_relocates_peer_and_removes_idempotently() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let ns = unique_name("nb_vl");
    let near = unique_name("nbv");
    let bridge = unique_name("nbbr");
    let cfg = TopologyConfig {
        hosts: vec![
            root_host(&bridge, "10.212.1.1/24", &[&near]),
            netns_host(&ns, vec![iface("eth0", &["10.212.1.2/24"], None)]),
        ],
        wiring: vec![wire("root", &near, &ns, "eth0")],
    };

    with_topology(cfg, |manager| {
        let root = manager.host("root")?;
        let guest = manager.host(&ns)?;

        // Near end lives on the root OS, the renamed peer inside the
        // namespace; the derived peer name must be gone from the root.
        anyhow::ensure!(Shell::root().grep_output("ip link", &near)?);
        anyhow::ensure!(guest.shell().grep_output("ip link", "eth0")?);
        anyhow::ensure!(!Shell::root().grep_output("ip link", &format!("{near}.p"))?);

        // The peer's default route points at the bridge.
        anyhow::ensure!(guest
            .shell()
            .grep_output("ip route", "default via 10.212.1.1")?);

        // The wired subnet carries traffic.
        anyhow::ensure!(guest.ping("10.212.1.1", None, 1, Some(2))?);

        // Removing the link removes both ends; a second remove is a
        // no-op even though everything is already gone.
        let vif = root.interface(&near)?.as_virtual().expect("wired");
        vif.remove()?;
        anyhow::ensure!(!Shell::root().grep_output("ip link", &near)?);
        anyhow::ensure!(!guest.shell().grep_output("ip link", "eth0")?);
        vif.remove()?;
        Ok(())
    });
}

#[test]
fn echo_round_trip_between_hosts() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let ns_a = unique_name("nb_ea");
    let ns_b = unique_name("nb_eb");
    let near_a = unique_name("nbea");
    let near_b = unique_name("nbeb");
    let bridge = unique_name("nbeb_br");
    let cfg = TopologyConfig {
        hosts: vec![
            root_host(&bridge, "10.213.1.1/24", &[&near_a, &near_b]),
            netns_host(&ns_a, vec![iface("eth0", &["10.213.1.4/24"], None)]),
            netns_host(&ns_b, vec![iface("eth0", &["10.213.1.5/24"], None)]),
        ],
        wiring: vec![
            wire("root", &near_a, &ns_a, "eth0"),
            wire("root", &near_b, &ns_b, "eth0"),
        ],
    };

    with_topology(cfg, |manager| {
        manager
            .host_mut(&ns_a)?
            .start_echo_server("10.213.1.4", 7777, "pong", EchoProtocol::Tcp)?;
        // Give the listener a moment to bind.
        std::thread::sleep(Duration::from_secs(1));

        let sender = manager.host(&ns_b)?;
        let reply = sender.send_echo_request("10.213.1.4", 7777, "ping", EchoProtocol::Tcp, 5)?;
        anyhow::ensure!(reply == "ping:pong", "unexpected reply `{reply}`");

        // An unbound port yields an empty reply, not an error.
        let silent = sender.send_echo_request("10.213.1.4", 8888, "ping", EchoProtocol::Tcp, 2)?;
        anyhow::ensure!(silent.is_empty(), "expected empty reply, got `{silent}`");

        manager.host_mut(&ns_a)?.stop_echo_server(7777);
        Ok(())
    });
}

#[test]
fn capture_collects_packets_and_times_out() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }
    if !tcpdump_available() {
        eprintln!("Skipping test, tcpdump not available");
        return;
    }

    let ns_a = unique_name("nb_ca");
    let ns_b = unique_name("nb_cb");
    let near_a = unique_name("nbca");
    let near_b = unique_name("nbcb");
    let bridge = unique_name("nbcb_br");
    let cfg = TopologyConfig {
        hosts: vec![
            root_host(&bridge, "10.214.1.1/24", &[&near_a, &near_b]),
            netns_host(&ns_a, vec![iface("eth0", &["10.214.1.4/24"], None)]),
            netns_host(&ns_b, vec![iface("eth0", &["10.214.1.5/24"], None)]),
        ],
        wiring: vec![
            wire("root", &near_a, &ns_a, "eth0"),
            wire("root", &near_b, &ns_b, "eth0"),
        ],
    };

    with_topology(cfg, |manager| {
        manager
            .host_mut(&ns_a)?
            .start_capture("eth0", 0, Some("icmp"), None)?;
        // Let tcpdump attach before traffic flows.
        std::thread::sleep(Duration::from_secs(1));

        anyhow::ensure!(manager.host(&ns_b)?.ping("10.214.1.4", None, 3, Some(2))?);

        let packets = manager.host_mut(&ns_a)?.capture_packets(
            "eth0",
            2,
            Some(Duration::from_secs(10)),
        )?;
        anyhow::ensure!(packets.len() == 2, "expected 2 packets, got {}", packets.len());

        manager.host_mut(&ns_a)?.stop_capture("eth0");

        // A quiet interface on the other host: waiting for packets that
        // never arrive must time out, not hang.
        manager
            .host_mut(&ns_b)?
            .start_capture("eth0", 0, Some("udp port 19999"), None)?;
        let err = manager
            .host_mut(&ns_b)?
            .capture_packets("eth0", 5, Some(Duration::from_secs(1)))
            .unwrap_err();
        anyhow::ensure!(
            matches!(err, Error::SubprocessTimeout { .. }),
            "expected timeout, got {err}"
        );
        manager.host_mut(&ns_b)?.stop_capture("eth0");
        Ok(())
    });
}

#[test]
fn route_add_del_round_trip() {
    if !check_privileges() {
        eprintln!("Skipping test, insufficient privileges or missing tools");
        return;
    }

    let ns = unique_name("nb_ro");
    let cfg = TopologyConfig {
        hosts: vec![netns_host(&ns, vec![iface("eth0", &["10.215.1.2/24"], None)])],
        wiring: Vec::new(),
    };

    with_topology(cfg, |manager| {
        let host = manager.host(&ns)?;
        let before = host.shell().run("ip route")?.stdout;

        host.add_route("10.99.0.0/16", None, Some("eth0"))?;
        anyhow::ensure!(host.shell().grep_output("ip route", "10.99.0.0/16")?);
        host.del_route("10.99.0.0/16")?;

        let after = host.shell().run("ip route")?.stdout;
        anyhow::ensure!(before == after, "routing table changed:\n{before}\nvs\n{after}");
        Ok(())
    });
}
