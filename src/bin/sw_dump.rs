//! Parse one or more SOCKS5 messages from a file (or stdin) and print them.
//!
//! Usage:
//!   sw_dump MESSAGE [FILE]
//!
//! MESSAGE is one of: client-handshake, server-handshake, client-request, server-response.
//! Records are parsed back to back until the input is exhausted.

use anyhow::{anyhow, Context as _};
use std::io::{self, Cursor, Read};
use structwire::dump::{dump_values, hex_string};
use structwire::socks5::Socks5Schemas;
use structwire::Schema;
use tracing_subscriber::EnvFilter;

fn pick<'a>(schemas: &'a Socks5Schemas, message: &str) -> anyhow::Result<&'a Schema> {
    Ok(match message {
        "client-handshake" => schemas.client_handshake.as_ref(),
        "server-handshake" => schemas.server_handshake.as_ref(),
        "client-request" => schemas.client_request.as_ref(),
        "server-response" => schemas.server_response.as_ref(),
        other => return Err(anyhow!("unknown message {:?}", other)),
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let message = args
        .first()
        .ok_or_else(|| anyhow!("usage: sw_dump MESSAGE [FILE]"))?;
    let data = match args.get(1) {
        Some(path) => std::fs::read(path).with_context(|| format!("read {}", path))?,
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let schemas = Socks5Schemas::new()?;
    let schema = pick(&schemas, message)?;
    let mut cursor = Cursor::new(data.as_slice());
    let mut index = 0usize;
    while (cursor.position() as usize) < data.len() {
        let start = cursor.position() as usize;
        match schema.parse(&mut cursor) {
            Ok(values) => {
                println!("# {} {} (bytes {}..{})", message, index, start, cursor.position());
                println!("{}", dump_values(&values));
            }
            Err(e) => {
                eprintln!("record {} at byte {}: {}", index, start, e);
                eprintln!("remaining: {}", hex_string(&data[start..]));
                std::process::exit(1);
            }
        }
        index += 1;
    }
    Ok(())
}
