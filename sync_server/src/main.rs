//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p sync_server -- [--config server.json] [--addr 0.0.0.0:6567] [--tick-hz 60]
//!
//! Console commands:
//!   status                    - List players
//!   whitelist-add <uuid>      - Allow an identity on a whitelisted server
//!   ban <uuid> / banip <ip>   - Ban and kick
//!   unban <uuid|ip>           - Lift a ban
//!   admin <uuid>              - Grant admin rights
//!   kickall                   - Kick every connection
//!   quit                      - Shutdown server

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use sync_server::{admin::Administration, world::World, GameServer};
use sync_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "server", about = "Authoritative multiplayer sync server")]
struct Args {
    /// JSON config file; missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address for TCP and UDP.
    #[arg(long)]
    addr: Option<String>,

    #[arg(long)]
    tick_hz: Option<u32>,

    /// Directory for persisted player records.
    #[arg(long)]
    data_dir: Option<String>,

    /// World size in tiles.
    #[arg(long, default_value_t = 200)]
    width: u16,

    #[arg(long, default_value_t = 200)]
    height: u16,
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let mut cfg = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = &args.addr {
        cfg.server_addr = addr.clone();
    }
    if let Some(hz) = args.tick_hz {
        cfg.tick_hz = hz;
    }
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = load_config(&args)?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, data_dir = %cfg.data_dir, "Starting server");

    let records = Path::new(&cfg.data_dir).join("players.json");
    let admins = Administration::load(&records).context("load player records")?;
    let world = World::new(args.width, args.height);

    let mut server = GameServer::new(cfg, admins, world)
        .await
        .context("create server")?;
    info!(local = %server.local_addr(), "Server listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("> ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    server.run().await?;
    // Writer tasks still hold the shutdown kicks.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    info!("Server stopped");
    Ok(())
}
