//! Command execution, either directly on the root OS or inside a named
//! Linux network namespace.
//!
//! Every topology entity holds a [`Shell`] for the host it lives on, so
//! an interface on a namespaced host always executes inside that
//! namespace. Commands are run through `sh -c`, which keeps the calling
//! convention identical for plain commands and for the pipe-style
//! diagnostics the harness uses (`ip addr | grep ...`).
//!
//! Mount and file state is shared between namespaces — `ip netns` only
//! isolates the network stack — so file helpers always operate on the
//! root filesystem regardless of context.

use std::fs;
use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use netbed_common::{Error, Result};

/// Outcome of a blocking command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Execution context: the root OS or a named network namespace.
#[derive(Debug, Clone)]
pub struct Shell {
    netns: Option<String>,
}

impl Shell {
    /// A shell executing directly on the root OS.
    pub fn root() -> Self {
        Self { netns: None }
    }

    /// A shell executing inside the named network namespace.
    pub fn netns(name: impl Into<String>) -> Self {
        Self {
            netns: Some(name.into()),
        }
    }

    pub fn is_netns(&self) -> bool {
        self.netns.is_some()
    }

    /// The namespace name, if this shell is namespace-scoped.
    pub fn netns_name(&self) -> Option<&str> {
        self.netns.as_deref()
    }

    fn command(&self, cmdline: &str) -> Command {
        match &self.netns {
            Some(ns) => {
                let mut c = Command::new("ip");
                c.args(["netns", "exec", ns, "sh", "-c", cmdline]);
                c
            }
            None => {
                let mut c = Command::new("sh");
                c.args(["-c", cmdline]);
                c
            }
        }
    }

    /// Run a command to completion, capturing output. A non-zero exit is
    /// reported in the result, not as an error; use [`Shell::run_checked`]
    /// for operations that must succeed.
    pub fn run(&self, cmdline: &str) -> Result<CommandResult> {
        tracing::trace!(netns = self.netns.as_deref(), cmd = cmdline, "run");
        let output = self.command(cmdline).output()?;
        let result = CommandResult {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            tracing::debug!(
                netns = self.netns.as_deref(),
                cmd = cmdline,
                status = result.status,
                stderr = %result.stderr.trim_end(),
                "command exited non-zero"
            );
        }
        Ok(result)
    }

    /// Run a command that must succeed. Non-zero exit raises
    /// [`Error::SubprocessFailed`] carrying the captured stderr.
    pub fn run_checked(&self, cmdline: &str) -> Result<CommandResult> {
        let result = self.run(cmdline)?;
        if !result.success() {
            return Err(Error::SubprocessFailed {
                command: cmdline.to_string(),
                status: result.status,
                stderr: result.stderr.trim_end().to_string(),
            });
        }
        Ok(result)
    }

    /// Launch a command in the background with output discarded. The
    /// returned handle can be polled or terminated by the caller.
    pub fn spawn(&self, cmdline: &str) -> Result<Child> {
        tracing::trace!(netns = self.netns.as_deref(), cmd = cmdline, "spawn");
        let child = self
            .command(cmdline)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    /// Launch a command in the background with piped stdout/stderr, for
    /// callers that consume the output stream (packet captures).
    pub fn spawn_piped(&self, cmdline: &str) -> Result<Child> {
        tracing::trace!(netns = self.netns.as_deref(), cmd = cmdline, "spawn piped");
        let child = self
            .command(cmdline)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    /// Run a command and check whether any line of its stdout contains
    /// `pattern`.
    pub fn grep_output(&self, cmdline: &str, pattern: &str) -> Result<bool> {
        let result = self.run(cmdline)?;
        Ok(result.stdout.lines().any(|l| l.contains(pattern)))
    }

    // ── File helpers ────────────────────────────────────────────────
    //
    // The mount namespace is shared, so these are plain filesystem
    // operations; they exist so call sites stay within the execution
    // abstraction.

    pub fn write_file(&self, path: &Path, contents: &str, append: bool) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if append {
            use std::io::Write;
            let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
            f.write_all(contents.as_bytes())?;
        } else {
            fs::write(path, contents)?;
        }
        Ok(())
    }

    pub fn read_file(&self, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    pub fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
        Ok(())
    }

    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    // ── Namespace management ────────────────────────────────────────
    //
    // Namespace create/delete always run on the root OS; a namespace
    // cannot manage its own lifetime.

    pub fn create_namespace(name: &str) -> Result<()> {
        tracing::debug!(netns = name, "creating network namespace");
        // Clean up any leftover namespace with the same name from an
        // earlier run that failed before teardown.
        let _ = Shell::root().run(&format!("ip netns del {name}"))?;
        Shell::root().run_checked(&format!("ip netns add {name}"))?;
        Ok(())
    }

    /// Delete a namespace, tolerating one that is already gone so
    /// teardown stays idempotent.
    pub fn delete_namespace(name: &str) -> Result<()> {
        tracing::debug!(netns = name, "deleting network namespace");
        let result = Shell::root().run(&format!("ip netns del {name}"))?;
        if !result.success() && !result.stderr.contains("No such file") {
            return Err(Error::SubprocessFailed {
                command: format!("ip netns del {name}"),
                status: result.status,
                stderr: result.stderr.trim_end().to_string(),
            });
        }
        Ok(())
    }

    pub fn namespace_exists(name: &str) -> Result<bool> {
        let result = Shell::root().run("ip netns list")?;
        Ok(result
            .stdout
            .lines()
            .any(|l| l.split_whitespace().next() == Some(name)))
    }
}

/// Poll a child process until it exits or the timeout elapses.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            return Err(Error::SubprocessTimeout {
                operation: format!("child process {} to exit", child.id()),
                seconds: timeout.as_secs(),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Stop a child process: SIGTERM, a bounded wait for clean exit, then
/// SIGKILL if it lingers.
pub fn terminate_child(child: &mut Child, grace: Duration) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: pid is our own child's OS process ID; worst case the
    // process already exited and kill returns ESRCH.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    if wait_with_timeout(child, grace).is_err() {
        tracing::warn!(pid, "child didn't exit after SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Send SIGTERM to an arbitrary pid (used for pidfile-managed daemons).
pub fn signal_pid(pid: i32, signal: i32) {
    // SAFETY: sending a signal to a pid; a stale pid is at worst ESRCH.
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}
