//! ee-ipc-probe - send one payload to the execution engine and print the reply.
//!
//! Connects to the engine socket, writes a hex-encoded payload (framed with
//! Content-Length headers unless `--raw`), and prints whatever comes back as
//! hex. Useful for checking that an engine is listening and answering.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ee_ipc::config::{TransportConfig, SOCKET_ENV};
use ee_ipc::ipc::{Framed, Transport};

/// Largest reply read in `--raw` mode.
const RAW_READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Parser)]
#[command(name = "ee-ipc-probe", version, about)]
struct Args {
    /// Engine socket path
    #[arg(long, env = SOCKET_ENV)]
    socket: Option<PathBuf>,

    /// JSON transport config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Send bytes as-is and do a single read instead of framing
    #[arg(long)]
    raw: bool,

    /// Read and write timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Connect attempts before giving up
    #[arg(long)]
    attempts: Option<u32>,

    /// Payload as hex, e.g. 010203
    payload: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ee_ipc=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();
    let payload = hex::decode(args.payload.trim()).context("Payload is not valid hex")?;

    let mut config = match &args.config {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::from_env()?,
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(ms) = args.timeout_ms {
        config.read_timeout_ms = Some(ms);
        config.write_timeout_ms = Some(ms);
    }
    if let Some(attempts) = args.attempts {
        config.retry.max_attempts = attempts;
    }

    tracing::info!(
        "Probing {} with {} bytes",
        config.socket_path.display(),
        payload.len()
    );
    let client = config
        .connect()
        .with_context(|| format!("Engine not reachable at {}", config.socket_path.display()))?;

    let reply = if args.raw {
        probe_raw(client, &payload)?
    } else {
        probe_framed(client, &payload)?
    };

    match reply {
        Some(bytes) => println!("{}", hex::encode(bytes)),
        None => {
            tracing::warn!("Engine closed the connection without replying");
            eprintln!("peer closed");
        }
    }
    Ok(())
}

fn probe_raw<T: Transport>(mut transport: T, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    transport
        .write_all(payload)
        .context("Failed to send payload")?;

    let mut buf = vec![0u8; RAW_READ_SIZE];
    let n = transport.read(&mut buf).context("Failed to read reply")?;
    transport.close();

    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

fn probe_framed<T: Transport>(transport: T, payload: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut framed = Framed::new(transport);
    framed
        .write_frame(payload)
        .context("Failed to send frame")?;
    let reply = framed.read_frame().context("Failed to read reply frame")?;
    framed.get_mut().close();
    Ok(reply)
}
