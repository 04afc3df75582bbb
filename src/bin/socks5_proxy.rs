//! SOCKS5 proxy: performs the handshake through compiled schemas, then relays bytes.
//!
//! Usage:
//!   socks5_proxy [-p|--port PORT] [--bind ADDR]
//!
//! One thread per connection. Log level comes from `RUST_LOG` (default `info`).

use anyhow::{anyhow, Context as _};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use structwire::socks5::{self, Socks5Schemas};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 8080;

struct Options {
    port: u16,
    bind: Ipv4Addr,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut port = None;
    let mut bind = Ipv4Addr::UNSPECIFIED;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-p" | "--port" => {
                let v = args.next().ok_or_else(|| anyhow!("{} needs a value", arg))?;
                port = Some(v.parse().with_context(|| format!("invalid port {:?}", v))?);
            }
            "--bind" => {
                let v = args.next().ok_or_else(|| anyhow!("--bind needs a value"))?;
                bind = v.parse().with_context(|| format!("invalid bind address {:?}", v))?;
            }
            other => return Err(anyhow!("unknown argument {:?}", other)),
        }
    }
    let port = port.unwrap_or_else(|| {
        warn!("no port explicitly passed in, using the default port of {}", DEFAULT_PORT);
        DEFAULT_PORT
    });
    Ok(Options { port, bind })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts = parse_args()?;
    let schemas = Arc::new(Socks5Schemas::new()?);
    let listener = TcpListener::bind((opts.bind, opts.port))
        .with_context(|| format!("bind {}:{}", opts.bind, opts.port))?;
    info!("hosting SOCKS5 proxy on {}", listener.local_addr()?);

    for conn in listener.incoming() {
        let client = match conn {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let schemas = Arc::clone(&schemas);
        thread::spawn(move || {
            if let Err(e) = handle(&schemas, client) {
                warn!(error = %e, "connection closed with error");
            }
        });
    }
    Ok(())
}

fn handle(schemas: &Socks5Schemas, mut client: TcpStream) -> anyhow::Result<()> {
    let peer = client.peer_addr()?;
    info!(%peer, "connection received");
    let request = socks5::accept_handshake(schemas, &mut client).context("handshake")?;
    debug!(%peer, host = %request.host, port = request.port, "connecting upstream");

    let upstream = match TcpStream::connect((request.host.as_str(), request.port)) {
        Ok(s) => s,
        Err(e) => {
            let unspecified = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
            socks5::send_reply(schemas, &mut client, socks5::REPLY_HOST_UNREACHABLE, unspecified)?;
            return Err(e).with_context(|| format!("connect {}:{}", request.host, request.port));
        }
    };
    let bound = match upstream.local_addr()? {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    };
    socks5::send_reply(schemas, &mut client, socks5::REPLY_SUCCEEDED, bound)?;
    relay(client, upstream)
}

/// Copy bytes both ways until each side closes its write half.
fn relay(client: TcpStream, upstream: TcpStream) -> anyhow::Result<()> {
    let mut client_read = client.try_clone()?;
    let mut upstream_write = upstream.try_clone()?;
    let uploader = thread::spawn(move || {
        let n = io::copy(&mut client_read, &mut upstream_write);
        let _ = upstream_write.shutdown(Shutdown::Write);
        n
    });

    let mut upstream_read = upstream;
    let mut client_write = client;
    let down = io::copy(&mut upstream_read, &mut client_write);
    let _ = client_write.shutdown(Shutdown::Write);

    let up = uploader
        .join()
        .map_err(|_| anyhow!("relay thread panicked"))?
        .context("client to upstream")?;
    let down = down.context("upstream to client")?;
    debug!(up, down, "relay finished");
    Ok(())
}
