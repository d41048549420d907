//! One-shot echo client used by host echo tests.
//!
//! Connects to ip:port, sends the payload, and prints the reply to
//! stdout. A target that never answers (unbound port, timeout) produces
//! empty output and exit 0 — tests distinguish "no reply" from harness
//! failure by output, not by exit code.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "echo_send", about = "netbed one-shot echo client")]
struct Cli {
    /// Destination address.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Destination port.
    #[arg(long, default_value_t = 7777)]
    port: u16,

    /// Request payload.
    #[arg(long, default_value = "ping")]
    payload: String,

    /// Transport protocol: tcp or udp.
    #[arg(long, default_value = "tcp")]
    protocol: String,

    /// Connect/read timeout in seconds.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let addr: SocketAddr = format!("{}:{}", cli.ip, cli.port).parse()?;
    let timeout = Duration::from_secs(cli.timeout);

    let reply = match cli.protocol.as_str() {
        "tcp" => send_tcp(addr, &cli.payload, timeout),
        "udp" => send_udp(addr, &cli.payload, timeout),
        other => anyhow::bail!("unknown protocol `{other}`"),
    };

    if let Some(reply) = reply {
        print!("{reply}");
    }
    Ok(())
}

fn send_tcp(addr: SocketAddr, payload: &str, timeout: Duration) -> Option<String> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    stream.write_all(payload.as_bytes()).ok()?;
    // Half-close so a server reading to EOF sees the whole request.
    stream.shutdown(std::net::Shutdown::Write).ok()?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).ok()?;
    Some(reply)
}

fn send_udp(addr: SocketAddr, payload: &str, timeout: Duration) -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.set_read_timeout(Some(timeout)).ok()?;
    socket.send_to(payload.as_bytes(), addr).ok()?;
    let mut buf = [0u8; 4096];
    let (n, _) = socket.recv_from(&mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf[..n]).into_owned())
}
