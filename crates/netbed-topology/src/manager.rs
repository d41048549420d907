//! The topology manager: builds the host graph from a declarative
//! config and orchestrates its lifecycle.
//!
//! Bring-up is phase-barriered across the whole topology: a phase
//! completes for every host before the next phase begins for any host,
//! because later phases assume earlier ones are globally satisfied (a
//! peer route cannot be installed before the far end's interface
//! exists). Teardown always iterates the bring-up order in reverse —
//! enforced here, in one place, never at call sites.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use netbed_common::config::TopologyConfig;
use netbed_common::{ids, Error, Result};

use crate::fixture::ServiceFixture;
use crate::host::Host;
use crate::veth::FarEnd;

#[derive(Default)]
pub struct TopologyManager {
    hosts: HashMap<String, Host>,
    start_order: Vec<String>,
    fixtures: Vec<(String, Box<dyn ServiceFixture>)>,
    config_file: Option<PathBuf>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a topology file and build the host graph.
    pub fn configure(&mut self, config_file: &Path) -> Result<()> {
        let cfg = TopologyConfig::load(config_file)?;
        self.config_file = Some(config_file.to_path_buf());
        self.configure_from(&cfg)
    }

    /// Build the host graph from an in-memory config: construct hosts,
    /// wire veth links, and compute the deterministic start order.
    pub fn configure_from(&mut self, cfg: &TopologyConfig) -> Result<()> {
        let mut hosts = HashMap::new();
        for def in &cfg.hosts {
            let host = Host::from_def(def)?;
            if hosts.insert(def.name.clone(), host).is_some() {
                return Err(Error::Configuration(format!(
                    "duplicate host name `{}` in topology",
                    def.name
                )));
            }
        }

        // Wiring: resolve the far end first (immutably), then install
        // the near end.
        for wire in &cfg.wiring {
            let far_host = hosts.get(&wire.far_host).ok_or_else(|| {
                Error::ObjectNotFound(format!(
                    "far host `{}` referenced by wiring of {}/{}",
                    wire.far_host, wire.host, wire.interface
                ))
            })?;
            let far_iface = far_host.interface(&wire.far_interface)?;
            let far = FarEnd {
                shell: far_host.shell().clone(),
                interface: wire.far_interface.clone(),
                mac: match far_iface {
                    crate::host::HostInterface::Plain(i) => i.mac().map(str::to_string),
                    crate::host::HostInterface::Virtual(_) => {
                        return Err(Error::Configuration(format!(
                            "far interface {}/{} is itself a wired link",
                            wire.far_host, wire.far_interface
                        )))
                    }
                },
            };
            let near_host = hosts.get_mut(&wire.host).ok_or_else(|| {
                Error::ObjectNotFound(format!("host `{}` referenced by wiring", wire.host))
            })?;
            near_host.link_interface(&wire.interface, far)?;
        }

        // Deterministic start order: priority first (lower starts
        // earlier), declaration order as the tie-break. Never
        // alphabetical.
        let mut order: Vec<(u32, usize, String)> = cfg
            .hosts
            .iter()
            .enumerate()
            .map(|(idx, def)| (def.start_priority, idx, def.name.clone()))
            .collect();
        order.sort();

        let start_order: Vec<String> = order.into_iter().map(|(_, _, name)| name).collect();

        // The order must respect wiring dependencies: the near host owns
        // the veth pair and the bridge the link lands on, so a far host
        // must never start before it.
        let position: HashMap<&str, usize> = start_order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        for wire in &cfg.wiring {
            if position[wire.host.as_str()] > position[wire.far_host.as_str()] {
                return Err(Error::Configuration(format!(
                    "host `{}` starts after `{}` but owns the link to it; \
                     lower its start_priority",
                    wire.host, wire.far_host
                )));
            }
        }

        self.start_order = start_order;
        self.hosts = hosts;
        Ok(())
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    // ── Host access ─────────────────────────────────────────────────

    pub fn hosts_by_name(&self) -> &HashMap<String, Host> {
        &self.hosts
    }

    pub fn host(&self, name: &str) -> Result<&Host> {
        self.hosts
            .get(name)
            .ok_or_else(|| Error::ObjectNotFound(format!("host `{name}`")))
    }

    pub fn host_mut(&mut self, name: &str) -> Result<&mut Host> {
        self.hosts
            .get_mut(name)
            .ok_or_else(|| Error::ObjectNotFound(format!("host `{name}`")))
    }

    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    pub fn hosts_in_start_order(&self) -> impl Iterator<Item = &Host> {
        self.start_order.iter().filter_map(|n| self.hosts.get(n))
    }

    /// Hosts running a network agent, in start order.
    pub fn hypervisors(&self) -> Vec<&Host> {
        self.hosts_in_start_order()
            .filter(|h| h.is_hypervisor())
            .collect()
    }

    /// A fresh, manager-scoped unique guest name.
    pub fn create_guest_id(&self) -> String {
        ids::guest_id()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Bring the whole topology up. Each phase runs for every host (in
    /// start order) before the next phase begins; the first failure
    /// aborts bring-up and propagates — callers are expected to attempt
    /// `shutdown` for cleanup.
    pub fn startup(&mut self) -> Result<()> {
        tracing::info!(hosts = self.start_order.len(), "topology startup");
        for name in &self.start_order {
            self.hosts[name].create()?;
        }
        for name in &self.start_order {
            self.hosts[name].boot()?;
        }
        for name in &self.start_order {
            self.hosts[name].net_up()?;
        }
        for name in &self.start_order {
            self.hosts[name].net_finalize()?;
        }
        for name in &self.start_order {
            self.hosts[name].prepare_applications()?;
        }
        for name in &self.start_order {
            self.hosts[name].start_applications(None)?;
        }
        for name in &self.start_order {
            self.hosts[name].wait_for_applications_start(None)?;
        }
        tracing::info!("topology up");
        Ok(())
    }

    /// Tear the whole topology down: the exact mirror of `startup`,
    /// iterating the bring-up order in reverse. Best-effort — a failing
    /// host is logged and teardown continues, so a partial bring-up can
    /// still be cleaned.
    pub fn shutdown(&mut self) -> Result<()> {
        tracing::info!(hosts = self.start_order.len(), "topology shutdown");
        let order: Vec<String> = self.start_order.iter().rev().cloned().collect();
        for name in &order {
            if let Some(host) = self.hosts.get(name) {
                log_teardown_err(name, "stop applications", host.stop_applications(None));
                log_teardown_err(
                    name,
                    "wait for applications",
                    host.wait_for_applications_stop(None),
                );
            }
        }
        for name in &order {
            if let Some(host) = self.hosts.get(name) {
                log_teardown_err(name, "net down", host.net_down());
            }
        }
        for name in &order {
            if let Some(host) = self.hosts.get_mut(name) {
                log_teardown_err(name, "shutdown", host.shutdown());
            }
        }
        for name in &order {
            if let Some(host) = self.hosts.get_mut(name) {
                log_teardown_err(name, "remove", host.remove());
            }
        }
        tracing::info!("topology down");
        Ok(())
    }

    // ── Fixtures ────────────────────────────────────────────────────

    /// Register a fixture under a name. Registering twice under the
    /// same name replaces the earlier fixture (last registration wins)
    /// while keeping its position in the setup order.
    pub fn add_fixture(&mut self, name: &str, fixture: Box<dyn ServiceFixture>) {
        match self.fixtures.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = fixture,
            None => self.fixtures.push((name.to_string(), fixture)),
        }
    }

    pub fn fixture(&self, name: &str) -> Result<&dyn ServiceFixture> {
        self.fixtures
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f.as_ref())
            .ok_or_else(|| Error::ObjectNotFound(format!("fixture `{name}`")))
    }

    /// Run every fixture's setup, in registration order. The first
    /// failure propagates.
    pub fn fixture_setup(&mut self) -> Result<()> {
        let mut fixtures = std::mem::take(&mut self.fixtures);
        let mut result = Ok(());
        for (name, fixture) in fixtures.iter_mut() {
            tracing::debug!(fixture = %name, "fixture setup");
            if let Err(e) = fixture.setup(self) {
                result = Err(e);
                break;
            }
        }
        self.fixtures = fixtures;
        result
    }

    /// Run every fixture's teardown in reverse registration order,
    /// best-effort.
    pub fn fixture_teardown(&mut self) {
        let mut fixtures = std::mem::take(&mut self.fixtures);
        for (name, fixture) in fixtures.iter_mut().rev() {
            tracing::debug!(fixture = %name, "fixture teardown");
            if let Err(e) = fixture.teardown(self) {
                tracing::warn!(fixture = %name, error = %e, "fixture teardown failed");
            }
        }
        self.fixtures = fixtures;
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    /// Features of this topology, for scenario selection and debugging.
    pub fn topology_features(&self) -> BTreeMap<String, String> {
        let mut features = BTreeMap::new();
        if let Some(path) = &self.config_file {
            features.insert("config_file".to_string(), path.display().to_string());
        }
        features.insert("hosts".to_string(), self.hosts.len().to_string());
        features.insert(
            "compute_hosts".to_string(),
            self.hypervisors().len().to_string(),
        );
        features
    }

    /// Human-readable recursive dump of the whole topology.
    pub fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!("{}[topology]", pad);
        for host in self.hosts_in_start_order() {
            host.print_config(indent + 1);
        }
        if !self.fixtures.is_empty() {
            println!("{}[fixtures]", pad);
            for (name, _) in &self.fixtures {
                println!("{}    {}", pad, name);
            }
        }
    }
}

fn log_teardown_err(host: &str, step: &str, result: Result<()>) {
    if let Err(e) = result {
        tracing::warn!(host, step, error = %e, "teardown step failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn two_tier_config() -> TopologyConfig {
        let text = r#"{
            "hosts": [
                {
                    "name": "zoo1",
                    "start_priority": 10,
                    "interfaces": [
                        {"name": "eth0", "ip_addresses": ["10.0.0.2/24"]}
                    ]
                },
                {
                    "name": "root",
                    "kind": "root",
                    "start_priority": 0,
                    "bridges": [
                        {"name": "br0", "ip_addresses": ["10.0.0.240/24"]}
                    ],
                    "interfaces": [
                        {"name": "zoo1eth0", "linked_bridge": "br0"}
                    ]
                },
                {
                    "name": "cmp1",
                    "start_priority": 10,
                    "interfaces": [
                        {"name": "eth0", "ip_addresses": ["10.0.0.8/24"]}
                    ],
                    "applications": [
                        {"kind": "agent", "options": {"command": "sleep 60"}}
                    ]
                }
            ],
            "wiring": [
                {
                    "host": "root",
                    "interface": "zoo1eth0",
                    "far_host": "zoo1",
                    "far_interface": "eth0"
                }
            ]
        }"#;
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn start_order_follows_priority_then_declaration() {
        let mut manager = TopologyManager::new();
        manager.configure_from(&two_tier_config()).unwrap();
        // root has the lowest priority; zoo1 and cmp1 tie at 10 and
        // keep declaration order. Not alphabetical.
        assert_eq!(manager.start_order(), ["root", "zoo1", "cmp1"]);
    }

    #[test]
    fn wiring_installs_virtual_interfaces() {
        let mut manager = TopologyManager::new();
        manager.configure_from(&two_tier_config()).unwrap();
        let root = manager.host("root").unwrap();
        let vif = root
            .interface("zoo1eth0")
            .unwrap()
            .as_virtual()
            .expect("wired interface should be virtual");
        assert_eq!(vif.far().unwrap().interface, "eth0");
        assert_eq!(vif.peer_name(), "zoo1eth0.p");
        // The far host keeps its plain interface for lazy config.
        let zoo1 = manager.host("zoo1").unwrap();
        assert!(zoo1.interface("eth0").unwrap().as_virtual().is_none());
    }

    #[test]
    fn wiring_to_unknown_host_fails() {
        let mut cfg = two_tier_config();
        cfg.wiring[0].far_host = "ghost".into();
        let err = TopologyManager::new().configure_from(&cfg).unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[test]
    fn start_order_must_respect_wiring_dependencies() {
        let mut cfg = two_tier_config();
        // Push the link-owning root host after its dependent guest.
        cfg.hosts[1].start_priority = 99;
        let err = TopologyManager::new().configure_from(&cfg).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn duplicate_host_names_fail() {
        let mut cfg = two_tier_config();
        let dup = cfg.hosts[0].clone();
        cfg.hosts.push(dup);
        let err = TopologyManager::new().configure_from(&cfg).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn unknown_host_lookup_fails() {
        let mut manager = TopologyManager::new();
        manager.configure_from(&two_tier_config()).unwrap();
        assert!(matches!(
            manager.host("nope").unwrap_err(),
            Error::ObjectNotFound(_)
        ));
    }

    #[test]
    fn features_count_hypervisors() {
        let mut manager = TopologyManager::new();
        manager.configure_from(&two_tier_config()).unwrap();
        let features = manager.topology_features();
        assert_eq!(features["hosts"], "3");
        assert_eq!(features["compute_hosts"], "1");
        assert_eq!(manager.hypervisors()[0].name(), "cmp1");
    }

    #[derive(Debug)]
    struct RecordingFixture {
        label: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl ServiceFixture for RecordingFixture {
        fn name(&self) -> &str {
            self.label
        }

        fn setup(&mut self, _manager: &TopologyManager) -> Result<()> {
            self.log.borrow_mut().push(format!("setup:{}", self.label));
            Ok(())
        }

        fn teardown(&mut self, _manager: &TopologyManager) -> Result<()> {
            self.log
                .borrow_mut()
                .push(format!("teardown:{}", self.label));
            Ok(())
        }
    }

    #[test]
    fn fixtures_run_in_order_and_teardown_reversed() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = TopologyManager::new();
        manager.add_fixture(
            "a",
            Box::new(RecordingFixture {
                label: "a",
                log: log.clone(),
            }),
        );
        manager.add_fixture(
            "b",
            Box::new(RecordingFixture {
                label: "b",
                log: log.clone(),
            }),
        );
        manager.fixture_setup().unwrap();
        manager.fixture_teardown();
        assert_eq!(
            *log.borrow(),
            vec!["setup:a", "setup:b", "teardown:b", "teardown:a"]
        );
    }

    #[test]
    fn fixture_registration_last_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut manager = TopologyManager::new();
        manager.add_fixture(
            "ready",
            Box::new(RecordingFixture {
                label: "first",
                log: log.clone(),
            }),
        );
        manager.add_fixture(
            "ready",
            Box::new(RecordingFixture {
                label: "second",
                log: log.clone(),
            }),
        );
        manager.fixture_setup().unwrap();
        assert_eq!(*log.borrow(), vec!["setup:second"]);
        assert_eq!(manager.fixture("ready").unwrap().name(), "second");
        assert!(matches!(
            manager.fixture("missing").unwrap_err(),
            Error::ObjectNotFound(_)
        ));
    }
}
