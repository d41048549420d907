//! Background packet capture on a host interface.
//!
//! A capture spawns `tcpdump` in line-buffered text mode inside the
//! host's execution context. A reader thread forwards each packet line
//! into a channel; consumers block on [`PacketCapture::wait_for_packets`]
//! with an optional timeout. At most one capture runs per interface name
//! (the host enforces replace-on-restart).

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::Child;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use netbed_common::{Error, Result};

use crate::shell::{terminate_child, Shell};

/// One captured packet, as tcpdump's one-line text rendering.
pub type Packet = String;

pub struct PacketCapture {
    interface: String,
    child: Child,
    rx: Receiver<Packet>,
    reader: Option<JoinHandle<()>>,
    buffered: VecDeque<Packet>,
    stopped: bool,
}

impl PacketCapture {
    /// Start capturing on `interface`. `count > 0` makes tcpdump exit by
    /// itself after that many packets; `0` captures until stopped.
    /// `filter` is a pcap filter expression appended verbatim. When
    /// `dump_file` is set, packet lines are also appended to that file.
    pub fn start(
        shell: &Shell,
        interface: &str,
        count: u32,
        filter: Option<&str>,
        dump_file: Option<PathBuf>,
    ) -> Result<PacketCapture> {
        let mut cmdline = format!("tcpdump -l -n -e -i {interface}");
        if count > 0 {
            cmdline.push_str(&format!(" -c {count}"));
        }
        if let Some(f) = filter {
            cmdline.push_str(&format!(" {f}"));
        }
        tracing::debug!(iface = interface, cmd = %cmdline, "starting packet capture");

        let mut child = shell.spawn_piped(&cmdline)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Configuration("capture child has no stdout".into()))?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let iface_label = interface.to_string();
        let reader = std::thread::spawn(move || {
            let mut dump = dump_file.and_then(|p| {
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(p)
                    .ok()
            });
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(l) => l,
                    Err(_) => break,
                };
                if let Some(f) = dump.as_mut() {
                    use std::io::Write;
                    let _ = writeln!(f, "{line}");
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            tracing::debug!(iface = %iface_label, "capture stream closed");
        });

        Ok(PacketCapture {
            interface: interface.to_string(),
            child,
            rx,
            reader: Some(reader),
            buffered: VecDeque::new(),
            stopped: false,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Wait until `count` packets have been seen, or `timeout` elapses.
    ///
    /// `count == 0` drains whatever is buffered without blocking. On
    /// timeout the packets received so far stay buffered and retrievable;
    /// the error only reports the shortfall.
    pub fn wait_for_packets(
        &mut self,
        count: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Packet>> {
        // Pull anything the reader already delivered.
        while let Ok(p) = self.rx.try_recv() {
            self.buffered.push_back(p);
        }

        if count == 0 {
            return Ok(self.buffered.drain(..).collect());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        while self.buffered.len() < count {
            let wait = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::SubprocessTimeout {
                            operation: format!(
                                "{} packets on {} ({} seen)",
                                count,
                                self.interface,
                                self.buffered.len()
                            ),
                            seconds: timeout.unwrap_or_default().as_secs(),
                        });
                    }
                    d - now
                }
                // No bound given: poll generously so a dead capture
                // still surfaces as a timeout rather than a hang.
                None => Duration::from_secs(3600),
            };
            match self.rx.recv_timeout(wait) {
                Ok(p) => self.buffered.push_back(p),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::SubprocessTimeout {
                        operation: format!(
                            "{} packets on {} (capture ended after {})",
                            count,
                            self.interface,
                            self.buffered.len()
                        ),
                        seconds: 0,
                    });
                }
            }
        }
        Ok(self.buffered.drain(..count).collect())
    }

    /// Halt the background capture. Already-captured packets stay
    /// retrievable through [`PacketCapture::wait_for_packets`].
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        tracing::debug!(iface = %self.interface, "stopping packet capture");
        terminate_child(&mut self.child, Duration::from_secs(2));
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.stopped = true;
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Feed the capture machinery from a plain shell command instead of
    // tcpdump so the channel/buffer logic is testable without privileges.
    fn fake_capture(cmdline: &str) -> PacketCapture {
        let shell = Shell::root();
        let mut child = shell.spawn_piped(cmdline).unwrap();
        let stdout = child.stdout.take().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        PacketCapture {
            interface: "fake0".into(),
            child,
            rx,
            reader: Some(reader),
            buffered: VecDeque::new(),
            stopped: false,
        }
    }

    #[test]
    fn collects_count_packets() {
        let mut cap = fake_capture("printf 'p1\\np2\\np3\\n'");
        let packets = cap
            .wait_for_packets(2, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(packets, vec!["p1".to_string(), "p2".to_string()]);
        // The third line stays buffered for a later drain.
        let rest = cap.wait_for_packets(0, None).unwrap();
        assert_eq!(rest, vec!["p3".to_string()]);
        cap.stop();
    }

    #[test]
    fn zero_count_drains_without_blocking() {
        let mut cap = fake_capture("sleep 5");
        let packets = cap.wait_for_packets(0, None).unwrap();
        assert!(packets.is_empty());
        cap.stop();
    }

    #[test]
    fn timeout_preserves_partial_packets() {
        let mut cap = fake_capture("printf 'only\\n'; sleep 5");
        let err = cap
            .wait_for_packets(3, Some(Duration::from_millis(300)))
            .unwrap_err();
        assert!(matches!(err, Error::SubprocessTimeout { .. }));
        // The packet that did arrive is still there.
        let rest = cap.wait_for_packets(0, None).unwrap();
        assert_eq!(rest, vec!["only".to_string()]);
        cap.stop();
    }
}
