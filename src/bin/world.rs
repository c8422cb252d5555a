//! cyberspace-world-server binary
//!
//! Loads (or creates) the world-state database, starts the listener and the
//! background pipelines, and runs until SIGINT.
//!
//! ## Configuration (flags / env)
//!
//! | Key                  | Default            | Description                       |
//! |----------------------|--------------------|-----------------------------------|
//! | `WORLD_STATE_DIR`    | `./cyberspace`     | Root of on-disk state             |
//! | `WORLD_LISTEN_PORT`  | `7600`             | Main TCP/TLS port                 |
//! | `WORLD_UDP_PORT`     | `7601`             | Voice-broadcast UDP port          |
//! | `WORLD_CERT_FILE`    | `<state>/cert.pem` | TLS certificate (PEM)             |
//! | `WORLD_KEY_FILE`     | `<state>/key.pem`  | TLS private key (PEM)             |
//! | `--read-only`        | off                | Reject every mutating frame       |
//!
//! Exits 0 on clean shutdown, 1 on fatal init error (bind failure, corrupt
//! or unwritable state dir).

use anyhow::{Context, Result};
use clap::Parser;
use cyberspace_world::server::{Server, ServerConfig};
use cyberspace_world::worlds::AllWorlds;
use cyberspace_world::{baker, dyntex, listener, lod, maintenance, npc, udp};
use cyberspace_world::{RecordStore, ResourceManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "cyberspace-world-server", about = "Cyberspace world server", version)]
struct Args {
    /// Root of on-disk state (records file, resources dir, photos dir)
    #[arg(long, env = "WORLD_STATE_DIR", default_value = "./cyberspace")]
    state_dir: PathBuf,

    /// Main TCP/TLS port
    #[arg(long, env = "WORLD_LISTEN_PORT", default_value_t = 7600)]
    listen_port: u16,

    /// UDP port for voice-chat broadcast
    #[arg(long, env = "WORLD_UDP_PORT", default_value_t = 7601)]
    udp_port: u16,

    /// Reject every mutating frame with a typed error
    #[arg(long)]
    read_only: bool,

    /// TLS certificate file (PEM); defaults to <state-dir>/cert.pem
    #[arg(long, env = "WORLD_CERT_FILE")]
    cert_file: Option<PathBuf>,

    /// TLS private key file (PEM); defaults to <state-dir>/key.pem
    #[arg(long, env = "WORLD_KEY_FILE")]
    key_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cyberspace_world=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = ServerConfig {
        state_dir: args.state_dir.clone(),
        listen_port: args.listen_port,
        udp_port: args.udp_port,
        read_only: args.read_only,
        cert_file: args
            .cert_file
            .unwrap_or_else(|| args.state_dir.join("cert.pem")),
        key_file: args
            .key_file
            .unwrap_or_else(|| args.state_dir.join("key.pem")),
    };

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state dir '{}'", config.state_dir.display()))?;
    std::fs::create_dir_all(config.resources_dir()).context("creating resources dir")?;
    std::fs::create_dir_all(config.photos_dir()).context("creating photos dir")?;

    let resources = ResourceManager::new(config.resources_dir());

    // Open the records file.  A legacy single-stream state file is imported
    // once into a fresh record store; the snapshotter then persists it.
    let records_path = config.records_file_path();
    let mut state = AllWorlds::new();
    let legacy_bytes = match std::fs::read(&records_path) {
        Ok(bytes) if AllWorlds::is_legacy_format(&bytes) => Some(bytes),
        _ => None,
    };
    let store = if let Some(bytes) = legacy_bytes {
        log::info!("importing legacy state file '{}'", records_path.display());
        state
            .import_legacy_format(&bytes, &resources)
            .context("importing legacy state file")?;
        RecordStore::create(&records_path).context("creating records file")?
    } else {
        let mut store = RecordStore::open(&records_path)
            .with_context(|| format!("opening records file '{}'", records_path.display()))?;
        state
            .load(&mut store, &resources)
            .context("loading world state")?;
        store
    };
    cyberspace_world::creation::create_initial_parcels(&mut state);

    log::info!(
        "world state ready: {} worlds, {} users, {} records",
        state.worlds.len(),
        state.users.len(),
        store.num_records()
    );

    let (lod_tx, lod_rx) = mpsc::unbounded_channel();
    let (npc_tx, npc_rx) = mpsc::unbounded_channel();
    let server = Arc::new(Server::new(config, state, store, resources, lod_tx, npc_tx));

    let tls = listener::load_tls_config(&server.config.cert_file, &server.config.key_file)
        .context("loading TLS configuration")?;

    // With an LLM credential configured, the root world gets a resident
    // greeter NPC.
    if server.credential("llm_api_key").is_some() {
        let spawn_pos = server.state.lock().world_entry("").settings.spawn_pos;
        npc::spawn_bot_avatar(&server, "", "Guide", spawn_pos);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Background workers.
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(lod::run(
        server.clone(),
        lod_rx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(baker::run(server.clone(), shutdown_rx.clone())));
    tasks.push(tokio::spawn(dyntex::run(server.clone(), shutdown_rx.clone())));
    tasks.push(tokio::spawn(npc::run(
        server.clone(),
        npc_rx,
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(maintenance::run_snapshotter(
        server.clone(),
        shutdown_rx.clone(),
    )));
    tasks.push(tokio::spawn(maintenance::run_maintenance(
        server.clone(),
        shutdown_rx.clone(),
    )));

    {
        let server = server.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = udp::run(server, shutdown).await {
                log::warn!("UDP handler stopped: {}", e);
            }
        }));
    }

    // The listener's bind failure is the fatal init path (exit code 1).
    let listener_task = tokio::spawn(listener::run(server.clone(), tls, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("SIGINT received, shutting down");
        }
        r = listener_task => {
            let r = r.context("listener task panicked")?;
            r.context("listener failed")?;
            anyhow::bail!("listener exited unexpectedly");
        }
    }

    // Signal shutdown; the snapshotter does a final flush on its way out.
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    log::info!("shutdown complete");
    Ok(())
}
