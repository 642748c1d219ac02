// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! tidepoold — clustered time-series database server.
//!
//! Usage:
//!   tidepoold serve        --config tidepool.toml
//!   tidepoold status       --config tidepool.toml
//!   tidepoold new-database --config tidepool.toml --name dbtest --precision s

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tidepool::cluster::replicate;
use tidepool::config::Config;
use tidepool::db::engine::Engine;
use tidepool::health;
use tidepool::net::server as net_server;
use tidepool::tasks;
use tidepool::time::Precision;

#[derive(Parser)]
#[command(name = "tidepoold", about = "Clustered time-series database", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the server.
    Serve {
        #[arg(short, long, default_value = "tidepool.toml")]
        config: PathBuf,
    },
    /// Print a brief status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "tidepool.toml")]
        config: PathBuf,
    },
    /// Create a new database and exit.
    NewDatabase {
        #[arg(short, long, default_value = "tidepool.toml")]
        config: PathBuf,
        /// Database name.
        #[arg(long)]
        name: String,
        /// Time precision: s, ms, us or ns.
        #[arg(long, default_value = "s")]
        precision: String,
        /// Buffer slot size in bytes (multiple of 512).
        #[arg(long, default_value_t = tidepool::db::DEFAULT_BUFFER_SIZE)]
        buffer_size: usize,
        /// Numeric shard duration in seconds.
        #[arg(long, default_value_t = tidepool::db::DEFAULT_DURATION_NUM_SECS)]
        duration_num: u64,
        /// Log shard duration in seconds.
        #[arg(long, default_value_t = tidepool::db::DEFAULT_DURATION_LOG_SECS)]
        duration_log: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            run_serve(config).await;
        }
        Command::Status { config } => {
            run_status(config);
        }
        Command::NewDatabase {
            config,
            name,
            precision,
            buffer_size,
            duration_num,
            duration_log,
        } => {
            run_new_database(config, name, precision, buffer_size, duration_num, duration_log);
        }
    }
}

fn load_config(path: &PathBuf) -> Config {
    match Config::from_file(path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            std::process::exit(1);
        }
    }
}

async fn run_serve(config_path: PathBuf) {
    let cfg = load_config(&config_path);

    info!(
        server = cfg.server.name,
        db_path = ?cfg.storage.db_path,
        client_port = cfg.server.listen_client_port,
        server_port = cfg.server.listen_server_port,
        compression = cfg.storage.enable_shard_compression,
        "Starting tidepool"
    );

    let engine = Engine::new(cfg.clone());
    if let Err(e) = engine.load_databases() {
        error!(error = %e, "Failed to load databases");
        std::process::exit(1);
    }

    // Listeners.
    let client_addr = format!(
        "{}:{}",
        cfg.server.bind_client_address, cfg.server.listen_client_port
    );
    let backend_addr = format!(
        "{}:{}",
        cfg.server.bind_server_address, cfg.server.listen_server_port
    );
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = net_server::listen_clients(engine, client_addr).await {
                error!(error = %e, "Client listener failed");
            }
        });
    }
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = net_server::listen_backend(engine, backend_addr).await {
                error!(error = %e, "Backend listener failed");
            }
        });
    }

    // HTTP surface.
    if cfg.http.status_port != 0 {
        let state = Arc::new(health::HttpState {
            engine: engine.clone(),
        });
        let router = health::build_status_router(state);
        let port = cfg.http.status_port;
        tokio::spawn(async move {
            health::serve(router, port).await;
        });
    }
    if cfg.http.api_port != 0 {
        let state = Arc::new(health::HttpState {
            engine: engine.clone(),
        });
        let router = health::build_api_router(state);
        let port = cfg.http.api_port;
        tokio::spawn(async move {
            health::serve(router, port).await;
        });
    }

    // Background tasks.
    tokio::spawn(tidepool::net::client::maintain_peers(engine.clone()));
    tokio::spawn(tasks::heartbeat(
        engine.clone(),
        cfg.storage.heartbeat_interval_s,
    ));
    tokio::spawn(tasks::optimize(
        engine.clone(),
        cfg.storage.optimize_interval_s,
    ));
    tokio::spawn(tasks::buffersync(
        engine.clone(),
        cfg.storage.buffer_sync_interval_ms,
    ));
    tokio::spawn(tasks::groups(engine.clone(), 1_000));

    // Replication, one task per database with a replica.
    for db in engine.databases() {
        let Some(fifo) = db.fifo.clone() else { continue };
        let Some(replica) = ({
            let pools = db.pools.lock();
            pools.replica_of(db.server.pool, db.server.uuid)
        }) else {
            continue;
        };
        db.replicate.lock().start();
        tokio::spawn(replicate::run(
            db.replicate.clone(),
            fifo,
            replica,
            engine.cancelled.clone(),
        ));
    }

    // Wait for CTRL+C.
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received CTRL+C, shutting down…");
        }
        Err(e) => {
            error!(error = %e, "Signal error");
        }
    }
    engine.shutdown();
}

fn run_status(config_path: PathBuf) {
    let cfg = load_config(&config_path);
    let engine = Engine::new(cfg.clone());
    if let Err(e) = engine.load_databases() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    println!("=== tidepool status ===");
    println!("Server      : {}", cfg.server.name);
    println!("Time        : {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Path        : {}", cfg.storage.db_path.display());
    let databases = engine.databases();
    println!("Databases   : {}", databases.len());
    for db in databases {
        let meta = db.meta.lock();
        let store = db.store.lock();
        let points: usize = {
            let mut total = 0;
            store.series.walk(|_, s| total += s.length);
            total
        };
        println!(
            "  {} ({}): {} series, {} shards, {} points",
            meta.name,
            meta.precision.as_str(),
            store.series.len(),
            store.shards.len(),
            points,
        );
    }
}

fn run_new_database(
    config_path: PathBuf,
    name: String,
    precision: String,
    buffer_size: usize,
    duration_num: u64,
    duration_log: u64,
) {
    let cfg = load_config(&config_path);
    let Some(precision) = Precision::from_str(&precision) else {
        eprintln!("Invalid precision '{precision}'; use s, ms, us or ns");
        std::process::exit(1);
    };
    let engine = Engine::new(cfg);
    if let Err(e) = engine.load_databases() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    match engine.new_database(&name, precision, buffer_size, duration_num, duration_log) {
        Ok(_) => {
            println!("Database '{name}' created.");
        }
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
