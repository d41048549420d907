//! Echo responder used by host echo tests.
//!
//! Binds the given ip:port and answers every request with
//! `<request>:<data>`. Runs until killed; the harness terminates it via
//! its process handle.

use std::io::{Read, Write};
use std::net::{TcpListener, UdpSocket};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo_server", about = "netbed echo responder")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    ip: String,

    /// Port to bind.
    #[arg(long, default_value_t = 7777)]
    port: u16,

    /// Reply payload appended to each request.
    #[arg(long, default_value = "pong")]
    data: String,

    /// Transport protocol: tcp or udp.
    #[arg(long, default_value = "tcp")]
    protocol: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let bind = format!("{}:{}", cli.ip, cli.port);
    match cli.protocol.as_str() {
        "tcp" => serve_tcp(&bind, &cli.data),
        "udp" => serve_udp(&bind, &cli.data),
        other => anyhow::bail!("unknown protocol `{other}`"),
    }
}

fn serve_tcp(bind: &str, data: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)?;
    tracing::info!(%bind, "echo server listening (tcp)");
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let mut buf = [0u8; 4096];
        let n = match stream.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "read failed");
                continue;
            }
        };
        let request = String::from_utf8_lossy(&buf[..n]);
        let reply = format!("{}:{}", request.trim_end(), data);
        tracing::debug!(%request, %reply, "echo");
        if let Err(e) = stream.write_all(reply.as_bytes()) {
            tracing::warn!(error = %e, "write failed");
        }
    }
    Ok(())
}

fn serve_udp(bind: &str, data: &str) -> anyhow::Result<()> {
    let socket = UdpSocket::bind(bind)?;
    tracing::info!(%bind, "echo server listening (udp)");
    let mut buf = [0u8; 4096];
    loop {
        let (n, peer) = socket.recv_from(&mut buf)?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let reply = format!("{}:{}", request.trim_end(), data);
        tracing::debug!(%request, %reply, %peer, "echo");
        if let Err(e) = socket.send_to(reply.as_bytes(), peer) {
            tracing::warn!(error = %e, "send failed");
        }
    }
}
