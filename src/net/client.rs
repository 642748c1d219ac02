// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Outgoing peer connections.
//!
//! A maintenance task dials every unconnected cluster peer, authenticates
//! with the database name, and keeps a reader that resolves promises by
//! pid. Losing the socket detaches the server and cancels its open
//! promises; the next maintenance tick redials.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::cluster::server::{Server, FLAG_AUTHENTICATED, FLAG_CONNECTED, FLAG_RUNNING};
use crate::db::engine::Engine;
use crate::db::Database;
use crate::net::pkg::Pkg;
use crate::net::promise::DEFAULT_TIMEOUT;
use crate::net::protocol;
use crate::qpack::Packer;

pub const RECONNECT_INTERVAL_S: u64 = 10;

/// Periodically dial every peer that is not connected.
pub async fn maintain_peers(engine: Arc<Engine>) {
    let mut tick = interval(Duration::from_secs(RECONNECT_INTERVAL_S));
    loop {
        tick.tick().await;
        if engine.is_cancelled() {
            break;
        }
        for db in engine.databases() {
            let peers: Vec<Arc<Server>> = {
                let servers = db.servers.lock();
                servers
                    .iter()
                    .filter(|s| {
                        s.uuid != db.server.uuid && s.flags() & FLAG_CONNECTED == 0
                    })
                    .cloned()
                    .collect()
            };
            for peer in peers {
                let db = db.clone();
                tokio::spawn(async move {
                    connect_peer(db, peer).await;
                });
            }
        }
    }
    info!("Peer connector stopped");
}

async fn connect_peer(db: Arc<Database>, server: Arc<Server>) {
    let addr = server.name();
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = addr, error = %e, "Peer unreachable");
            return;
        }
    };
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Pkg>();
    server.attach(tx);

    // Writer half.
    {
        let server = server.clone();
        tokio::spawn(async move {
            while let Some(pkg) = rx.recv().await {
                if let Err(e) = pkg.write_to(&mut wr).await {
                    debug!(peer = %server.name(), error = %e, "Peer write failed");
                    break;
                }
            }
        });
    }

    // Reader half: every frame resolves the promise with its pid.
    {
        let server = server.clone();
        tokio::spawn(async move {
            loop {
                match Pkg::read_from(&mut rd, u32::MAX).await {
                    Ok(pkg) => {
                        if !server.promises.resolve(pkg.pid, Ok(pkg)) {
                            debug!(peer = %server.name(), "Reply without promise");
                        }
                    }
                    Err(e) => {
                        debug!(peer = %server.name(), error = %e, "Peer connection lost");
                        server.detach();
                        break;
                    }
                }
            }
        });
    }

    // Authenticate the link with our identity and database.
    let mut p = Packer::new();
    p.add_string(&db.server.uuid.to_string());
    p.add_string(&db.name());
    match server
        .send_pkg(protocol::BPROTO_AUTH_REQUEST, p.into_bytes(), DEFAULT_TIMEOUT)
        .await
    {
        Ok(reply) if protocol::is_bproto_ack(reply.tp) => {
            server.set_flag(FLAG_AUTHENTICATED | FLAG_RUNNING);
            info!(peer = %server.name(), "Peer authenticated");
        }
        Ok(reply) => {
            warn!(peer = %server.name(), tp = protocol::type_name(reply.tp), "Peer auth rejected");
            server.detach();
        }
        Err(e) => {
            warn!(peer = %server.name(), error = %e, "Peer auth failed");
            server.detach();
        }
    }
}
