//! Entry point for `coap-blockwise-harness`.
//!
//! `serve` runs the block-wise file server on its own so a client can be
//! pointed at it by hand.  `main.rs` owns only process setup (logging,
//! signal handling, argument parsing).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};

use coap_blockwise_harness::endpoint::Security;
use coap_blockwise_harness::gate::{AlwaysAnswer, ModuloBackoff, RetransmissionGate};
use coap_blockwise_harness::scenario::dummy_payload;
use coap_blockwise_harness::server::FileServer;
use coap_blockwise_harness::HarnessConfig;

/// CoAP block-wise download harness.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve one resource block-wise until interrupted.
    Serve {
        /// Local address to bind.
        #[arg(short, long, default_value = "127.0.0.1:5683")]
        bind: SocketAddr,
        /// Resource path.
        #[arg(short, long, default_value = "/")]
        path: String,
        /// File to serve; a random 16 KiB payload when omitted.
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Block size offered to clients (16..=1024, power of two).
        #[arg(long, default_value_t = 1024)]
        block_size: usize,
        /// Which requests to leave unanswered.
        #[arg(long, value_enum, default_value_t = DropPolicy::None)]
        drop_policy: DropPolicy,
        /// Modulus for `--drop-policy modulo`.
        #[arg(long, default_value_t = 4)]
        modulus: u32,
        /// PSK identity; serves `coaps://` URIs together with `--psk-key`.
        #[arg(long, requires = "psk_key")]
        psk_identity: Option<String>,
        #[arg(long, requires = "psk_identity")]
        psk_key: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DropPolicy {
    /// Answer everything.
    None,
    /// Ignore block `n` until it has been seen `n % modulus` times.
    Modulo,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve {
            bind,
            path,
            file,
            block_size,
            drop_policy,
            modulus,
            psk_identity,
            psk_key,
        } => {
            let payload = match file {
                Some(file) => tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("reading {}", file.display()))?,
                None => dummy_payload(),
            };
            let security = match (psk_identity, psk_key) {
                (Some(identity), Some(key)) => Security::psk(identity, key),
                (None, None) => Security::NoSec,
                _ => bail!("--psk-identity and --psk-key go together"),
            };
            let gate: Arc<dyn RetransmissionGate> = match drop_policy {
                DropPolicy::None => Arc::new(AlwaysAnswer),
                DropPolicy::Modulo => Arc::new(ModuloBackoff::new(modulus)),
            };
            let config = HarnessConfig::default().with_block_size(block_size);

            let server = FileServer::bind(bind, security, gate, config)
                .await
                .context("starting file server")?;
            let uri = server.store().register(&path, payload.clone());
            let handle = server.run();
            log::info!("Serving {} bytes at {uri}", payload.len());
            println!("{uri}");

            tokio::signal::ctrl_c().await?;
            let stats = handle.shutdown().await?;
            log::info!(
                "Done: {} requests, {} dropped, {} answered, {} transfers",
                stats.received,
                stats.dropped,
                stats.answered,
                stats.completed
            );
        }
    }
    Ok(())
}
