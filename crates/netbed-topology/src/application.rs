//! Long-running applications hosted on topology hosts.
//!
//! The variant set is fixed and enumerable: an application is selected by
//! the `kind` tag in its config entry, never by resolving a class name at
//! runtime. Each kind implements the same lifecycle protocol —
//! `prepare_config` → `start` → `wait_for_start` → … → `stop` →
//! `wait_for_stop` — executed through the owning host's shell. Processes
//! are tracked through pidfiles, so the harness can stop an application
//! it did not start in this process.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use netbed_common::config::{AppKind, ApplicationDef};
use netbed_common::{Error, Result};
use serde_json::Value;

use crate::shell::{signal_pid, Shell};

/// Bounded retries (one per second) for readiness and shutdown waits.
const APP_WAIT_RETRIES: u64 = 30;

/// The lifecycle protocol every application kind implements.
pub trait Application {
    fn kind(&self) -> AppKind;
    fn name(&self) -> &str;

    /// Write out any on-disk configuration the process needs before it
    /// can start.
    fn prepare_config(&self) -> Result<()>;

    /// Launch the process in the background (async: returns once the
    /// launch command is issued, not once the service is ready).
    fn start(&self) -> Result<()>;

    /// Ask the process to stop. Tolerates a process that is already
    /// gone.
    fn stop(&self) -> Result<()>;

    /// Block until the application reports ready, with bounded retries.
    fn wait_for_start(&self) -> Result<()>;

    /// Block until the process has exited, with bounded retries.
    fn wait_for_stop(&self) -> Result<()>;

    /// Fetch a named resource (e.g. `log`) from the application.
    fn get_resource(&self, name: &str) -> Result<Option<String>>;

    fn print_config(&self, indent: usize);
}

/// Build an application from its config entry. This is the whole
/// registry: adding a kind means adding a variant here and to
/// [`AppKind`].
pub fn build_application(
    def: &ApplicationDef,
    host_name: &str,
    main_ip: Option<IpAddr>,
    shell: Shell,
) -> Result<Box<dyn Application>> {
    match def.kind {
        AppKind::Coordinator => Ok(Box::new(Coordinator::configure(
            def, host_name, main_ip, shell,
        )?)),
        AppKind::Agent => Ok(Box::new(NetworkAgent::configure(def, host_name, shell)?)),
    }
}

// ── Option helpers ──────────────────────────────────────────────────

fn opt_str(options: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    options.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn opt_u16(options: &BTreeMap<String, Value>, key: &str) -> Result<Option<u16>> {
    match options.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| {
                Error::Configuration(format!("application option `{key}` must be a port number"))
            }),
    }
}

fn required_str(options: &BTreeMap<String, Value>, key: &str, kind: AppKind) -> Result<String> {
    opt_str(options, key).ok_or_else(|| {
        Error::Configuration(format!("{kind} application requires option `{key}`"))
    })
}

fn read_pidfile(shell: &Shell, path: &PathBuf) -> Option<i32> {
    shell
        .read_file(path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok())
}

fn process_alive(shell: &Shell, pid: i32) -> bool {
    shell
        .run(&format!("kill -0 {pid}"))
        .map(|r| r.success())
        .unwrap_or(false)
}

/// Launch a command detached in an isolated mount/UTS namespace and
/// record its pid.
fn launch_daemon(shell: &Shell, name: &str, command: &str, pidfile: &PathBuf) -> Result<()> {
    let wrapped = format!("unshare --mount --uts -- {command}");
    let child = shell.spawn(&wrapped)?;
    shell.write_file(pidfile, &child.id().to_string(), false)?;
    tracing::info!(app = name, pid = child.id(), "application started");
    Ok(())
}

fn stop_daemon(shell: &Shell, name: &str, pidfile: &PathBuf) -> Result<()> {
    match read_pidfile(shell, pidfile) {
        Some(pid) => {
            tracing::info!(app = name, pid, "stopping application");
            signal_pid(pid, libc::SIGTERM);
        }
        None => tracing::debug!(app = name, "no pidfile, nothing to stop"),
    }
    Ok(())
}

fn wait_daemon_stopped(shell: &Shell, name: &str, pidfile: &PathBuf) -> Result<()> {
    let pid = match read_pidfile(shell, pidfile) {
        Some(pid) => pid,
        None => return Ok(()),
    };
    for _ in 0..APP_WAIT_RETRIES {
        if !process_alive(shell, pid) {
            shell.remove_file(pidfile)?;
            return Ok(());
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    Err(Error::SubprocessTimeout {
        operation: format!("application {name} to stop"),
        seconds: APP_WAIT_RETRIES,
    })
}

// ── Coordinator ─────────────────────────────────────────────────────

/// A coordination/quorum service instance (one member of an ensemble).
/// Readiness is a TCP liveness probe against its client port.
#[derive(Debug)]
pub struct Coordinator {
    name: String,
    shell: Shell,
    num_id: String,
    ip: Option<IpAddr>,
    port: u16,
    quorum: Vec<IpAddr>,
    command: String,
    pidfile: PathBuf,
    config_file: Option<PathBuf>,
}

impl Coordinator {
    pub fn configure(
        def: &ApplicationDef,
        host_name: &str,
        main_ip: Option<IpAddr>,
        shell: Shell,
    ) -> Result<Self> {
        let num_id = opt_str(&def.options, "id").unwrap_or_else(|| "1".to_string());
        let port = opt_u16(&def.options, "port")?.unwrap_or(2181);
        let command = required_str(&def.options, "command", AppKind::Coordinator)?;
        let quorum = match def.options.get("quorum") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .and_then(|s| s.parse::<IpAddr>().ok())
                        .ok_or_else(|| {
                            Error::Configuration(format!(
                                "coordinator quorum entry `{v}` is not an IP address"
                            ))
                        })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(Error::Configuration(format!(
                    "coordinator option `quorum` must be a list, got `{other}`"
                )))
            }
        };
        Ok(Self {
            name: format!("coordinator-{host_name}"),
            shell,
            config_file: opt_str(&def.options, "config_file").map(PathBuf::from),
            pidfile: PathBuf::from(format!("/run/netbed/coordinator.{num_id}.pid")),
            num_id,
            ip: main_ip,
            port,
            quorum,
            command,
        })
    }

    fn probe_addr(&self) -> SocketAddr {
        let ip = self
            .ip
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, self.port)
    }

    /// One liveness probe: can we open a TCP connection to the client
    /// port?
    pub fn is_ready(&self) -> bool {
        TcpStream::connect_timeout(&self.probe_addr(), Duration::from_secs(1)).is_ok()
    }
}

impl Application for Coordinator {
    fn kind(&self) -> AppKind {
        AppKind::Coordinator
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_config(&self) -> Result<()> {
        let path = match &self.config_file {
            Some(p) => p.clone(),
            None => return Ok(()),
        };
        let mut members = String::new();
        for (idx, ip) in self.quorum.iter().enumerate() {
            members.push_str(&format!("member.{}={}:2888:3888\n", idx + 1, ip));
        }
        tracing::debug!(app = %self.name, file = %path.display(), "writing quorum config");
        self.shell.write_file(&path, &members, false)?;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        launch_daemon(&self.shell, &self.name, &self.command, &self.pidfile)
    }

    fn stop(&self) -> Result<()> {
        stop_daemon(&self.shell, &self.name, &self.pidfile)
    }

    fn wait_for_start(&self) -> Result<()> {
        let addr = self.probe_addr();
        for _ in 0..APP_WAIT_RETRIES {
            tracing::debug!(app = %self.name, %addr, "probing coordinator");
            if self.is_ready() {
                tracing::info!(app = %self.name, %addr, "coordinator ready");
                return Ok(());
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        Err(Error::SubprocessTimeout {
            operation: format!("coordinator {} to accept connections on {addr}", self.num_id),
            seconds: APP_WAIT_RETRIES,
        })
    }

    fn wait_for_stop(&self) -> Result<()> {
        wait_daemon_stopped(&self.shell, &self.name, &self.pidfile)
    }

    fn get_resource(&self, name: &str) -> Result<Option<String>> {
        match name {
            "log" => {
                let path = PathBuf::from(format!("/var/log/netbed/coordinator.{}.log", self.num_id));
                Ok(self.shell.read_file(&path).ok())
            }
            _ => Ok(None),
        }
    }

    fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!("{}{} (coordinator)", pad, self.name);
        println!("{}    num-id: {}", pad, self.num_id);
        if let Some(ip) = self.ip {
            println!("{}    self-ip: {}:{}", pad, ip, self.port);
        }
        let members: Vec<String> = self.quorum.iter().map(|ip| ip.to_string()).collect();
        println!("{}    quorum: {}", pad, members.join(", "));
    }
}

// ── Network agent ───────────────────────────────────────────────────

/// A per-hypervisor network agent. Readiness is a pidfile-and-alive
/// probe — the agent forks on its own and writes its pid.
pub struct NetworkAgent {
    name: String,
    shell: Shell,
    command: String,
    pidfile: PathBuf,
    log_file: Option<PathBuf>,
}

impl NetworkAgent {
    pub fn configure(def: &ApplicationDef, host_name: &str, shell: Shell) -> Result<Self> {
        let command = required_str(&def.options, "command", AppKind::Agent)?;
        let pidfile = opt_str(&def.options, "pidfile")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/run/netbed/agent.{host_name}.pid")));
        Ok(Self {
            name: format!("agent-{host_name}"),
            shell,
            command,
            pidfile,
            log_file: opt_str(&def.options, "log_file").map(PathBuf::from),
        })
    }
}

impl Application for NetworkAgent {
    fn kind(&self) -> AppKind {
        AppKind::Agent
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_config(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        launch_daemon(&self.shell, &self.name, &self.command, &self.pidfile)
    }

    fn stop(&self) -> Result<()> {
        stop_daemon(&self.shell, &self.name, &self.pidfile)
    }

    fn wait_for_start(&self) -> Result<()> {
        for _ in 0..APP_WAIT_RETRIES {
            if let Some(pid) = read_pidfile(&self.shell, &self.pidfile) {
                if process_alive(&self.shell, pid) {
                    tracing::info!(app = %self.name, pid, "agent ready");
                    return Ok(());
                }
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        Err(Error::SubprocessTimeout {
            operation: format!("agent {} to come up", self.name),
            seconds: APP_WAIT_RETRIES,
        })
    }

    fn wait_for_stop(&self) -> Result<()> {
        wait_daemon_stopped(&self.shell, &self.name, &self.pidfile)
    }

    fn get_resource(&self, name: &str) -> Result<Option<String>> {
        match (name, &self.log_file) {
            ("log", Some(path)) => Ok(self.shell.read_file(path).ok()),
            _ => Ok(None),
        }
    }

    fn print_config(&self, indent: usize) {
        let pad = "    ".repeat(indent);
        println!("{}{} (agent)", pad, self.name);
        println!("{}    command: {}", pad, self.command);
        println!("{}    pidfile: {}", pad, self.pidfile.display());
    }
}
