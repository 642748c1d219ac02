// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Connection handling.
//!
//! One task per accepted socket reads frames in order; replies carry the
//! pid of their request. A writer task owns the outgoing half so query
//! work never blocks the read loop. Clients authenticate per database;
//! peers speak the backend protocol on a separate listener.

use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backup;
use crate::db::access::ACCESS_INSERT;
use crate::db::engine::Engine;
use crate::db::Database;
use crate::error::{Result, TdbError};
use crate::insert;
use crate::net::pkg::{Pkg, MAX_CLIENT_PKG_SIZE};
use crate::net::protocol as proto;
use crate::qpack::{Packer, Unpacker};
use crate::query;
use crate::time::Precision;

/// Per-connection client state; set by a successful auth.
struct ClientState {
    db: Arc<Database>,
    user: String,
    access: u32,
}

fn pack_error_msg(msg: &str) -> Vec<u8> {
    let mut p = Packer::new();
    p.open_map();
    p.add_string("error_msg");
    p.add_string(msg);
    p.close_map();
    p.into_bytes()
}

/// Response type matching the error kind.
fn error_pkg(pid: u16, e: &TdbError) -> Pkg {
    let tp = match e {
        TdbError::Query(_) => proto::ERR_QUERY,
        TdbError::Insert(_) => proto::ERR_INSERT,
        TdbError::Pool(_) => proto::ERR_POOL,
        TdbError::UserAccess(_) => proto::ERR_USER_ACCESS,
        TdbError::NotAuthenticated => proto::ERR_NOT_AUTHENTICATED,
        TdbError::AuthCredentials => proto::ERR_AUTH_CREDENTIALS,
        TdbError::AuthUnknownDb(_) => proto::ERR_AUTH_UNKNOWN_DB,
        TdbError::Server(_) => proto::ERR_SERVER,
        TdbError::Io(_) | TdbError::Storage(_) | TdbError::Buffer(_) | TdbError::Corrupt(_) => {
            proto::ERR_FILE
        }
        _ => proto::ERR_MSG,
    };
    Pkg::new(pid, tp, pack_error_msg(&e.to_string()))
}

async fn writer_loop(mut rx: mpsc::UnboundedReceiver<Pkg>, mut wr: OwnedWriteHalf) {
    while let Some(pkg) = rx.recv().await {
        if let Err(e) = pkg.write_to(&mut wr).await {
            debug!(error = %e, "Write failed, closing connection");
            break;
        }
    }
}

// ─────────────────────────── client listener ────────────────────────────────

pub async fn listen_clients(engine: Arc<Engine>, addr: String) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TdbError::Transport(format!("bind {addr}: {e}")))?;
    info!(addr, "Client listener started");
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| TdbError::Transport(format!("accept: {e}")))?;
        debug!(peer = %peer, "Client connected");
        let engine = engine.clone();
        tokio::spawn(async move {
            serve_client(engine, stream).await;
        });
    }
}

async fn serve_client(engine: Arc<Engine>, stream: TcpStream) {
    let (mut rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Pkg>();
    tokio::spawn(writer_loop(rx, wr));

    let mut state: Option<ClientState> = None;

    loop {
        let pkg = match Pkg::read_from(&mut rd, MAX_CLIENT_PKG_SIZE).await {
            Ok(pkg) => pkg,
            Err(e) => {
                debug!(error = %e, "Client disconnected");
                break;
            }
        };
        let pid = pkg.pid;
        let reply = handle_client_pkg(&engine, &mut state, pkg).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => error_pkg(pid, &e),
        };
        if tx.send(reply).is_err() {
            break;
        }
    }
}

async fn handle_client_pkg(
    engine: &Arc<Engine>,
    state: &mut Option<ClientState>,
    pkg: Pkg,
) -> Result<Pkg> {
    match pkg.tp {
        proto::REQ_PING => Ok(Pkg::new(pkg.pid, proto::RES_ACK, Vec::new())),
        proto::REQ_AUTH => {
            let mut up = Unpacker::new(&pkg.data);
            let user = up.expect_str()?.to_string();
            let password = up.expect_str()?.to_string();
            let dbname = up.expect_str()?.to_string();

            let db = engine
                .get_database(&dbname)
                .ok_or_else(|| TdbError::AuthUnknownDb(dbname.clone()))?;
            let access = {
                let users = db.users.lock();
                users.authenticate(&user, &password)?.access
            };
            info!(user, db = dbname, "Client authenticated");
            *state = Some(ClientState { db, user, access });
            Ok(Pkg::new(pkg.pid, proto::RES_AUTH_SUCCESS, Vec::new()))
        }
        proto::REQ_QUERY => {
            let state = state.as_ref().ok_or(TdbError::NotAuthenticated)?;
            let mut up = Unpacker::new(&pkg.data);
            let q = up.expect_str()?;
            let result =
                query::execute(&state.db, q, &state.user, state.access).await?;
            Ok(Pkg::new(pkg.pid, proto::RES_QUERY, result.to_bytes()))
        }
        proto::REQ_INSERT => {
            let state = state.as_ref().ok_or(TdbError::NotAuthenticated)?;
            crate::db::access::check_access(state.access, ACCESS_INSERT)?;
            let n = insert::insert(&state.db, &pkg.data).await?;
            let mut p = Packer::new();
            p.open_map();
            p.add_string("success_msg");
            p.add_string(&format!("Inserted {n} point(s) successfully."));
            p.close_map();
            Ok(Pkg::new(pkg.pid, proto::RES_INSERT, p.into_bytes()))
        }
        proto::REQ_SERVICE => handle_service(engine, pkg).await,
        other => {
            warn!(tp = other, "Unexpected packet type from client");
            Ok(Pkg::new(
                pkg.pid,
                proto::ERR_MSG,
                pack_error_msg(&format!(
                    "unexpected packet type {} ({})",
                    other,
                    proto::type_name(other)
                )),
            ))
        }
    }
}

// ─────────────────────────── service requests ───────────────────────────────

/// Administrative requests: `new_database`, `new_account`,
/// `change_password`, `drop_account`. Payload is a packed map.
async fn handle_service(engine: &Arc<Engine>, pkg: Pkg) -> Result<Pkg> {
    let mut up = Unpacker::new(&pkg.data);
    let mut request = String::new();
    let mut fields: Vec<(String, String)> = Vec::new();

    match up.next_obj()? {
        crate::qpack::Obj::Map(n) => {
            for _ in 0..n {
                let key = up.expect_str()?.to_string();
                let value = match up.next_obj()? {
                    crate::qpack::Obj::Raw(r) => {
                        String::from_utf8_lossy(r).into_owned()
                    }
                    crate::qpack::Obj::Int(v) => v.to_string(),
                    _ => String::new(),
                };
                if key == "request" {
                    request = value;
                } else {
                    fields.push((key, value));
                }
            }
        }
        crate::qpack::Obj::MapOpen => loop {
            match up.next_obj()? {
                crate::qpack::Obj::MapClose => break,
                crate::qpack::Obj::Raw(key) => {
                    let key = String::from_utf8_lossy(key).into_owned();
                    let value = match up.next_obj()? {
                        crate::qpack::Obj::Raw(r) => {
                            String::from_utf8_lossy(r).into_owned()
                        }
                        crate::qpack::Obj::Int(v) => v.to_string(),
                        _ => String::new(),
                    };
                    if key == "request" {
                        request = value;
                    } else {
                        fields.push((key, value));
                    }
                }
                _ => {
                    return Ok(Pkg::new(
                        pkg.pid,
                        proto::ERR_SERVICE_INVALID_REQUEST,
                        pack_error_msg("invalid service request"),
                    ))
                }
            }
        },
        _ => {
            return Ok(Pkg::new(
                pkg.pid,
                proto::ERR_SERVICE_INVALID_REQUEST,
                pack_error_msg("invalid service request"),
            ))
        }
    }

    let get = |name: &str| -> Option<&str> {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    match request.as_str() {
        "new_database" => {
            let name = get("dbname").unwrap_or_default().to_string();
            let precision = Precision::from_str(get("time_precision").unwrap_or("s"))
                .ok_or_else(|| TdbError::Config("invalid time precision".into()))?;
            let buffer_size = get("buffer_size")
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::db::DEFAULT_BUFFER_SIZE);
            let duration_num = get("duration_num")
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::db::DEFAULT_DURATION_NUM_SECS);
            let duration_log = get("duration_log")
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::db::DEFAULT_DURATION_LOG_SECS);
            engine.new_database(&name, precision, buffer_size, duration_num, duration_log)?;
            Ok(Pkg::new(pkg.pid, proto::ACK_SERVICE, Vec::new()))
        }
        "new_account" | "change_password" => {
            let db = get("dbname")
                .and_then(|n| engine.get_database(n))
                .ok_or_else(|| {
                    TdbError::AuthUnknownDb(get("dbname").unwrap_or_default().into())
                })?;
            let account = get("account").unwrap_or_default();
            let password = get("password").unwrap_or_default();
            let mut users = db.users.lock();
            if request == "new_account" {
                users.create(account, password, crate::db::access::PROFILE_FULL)?;
            } else {
                users.set_password(account, password)?;
            }
            Ok(Pkg::new(pkg.pid, proto::ACK_SERVICE, Vec::new()))
        }
        "drop_account" => {
            let db = get("dbname")
                .and_then(|n| engine.get_database(n))
                .ok_or_else(|| {
                    TdbError::AuthUnknownDb(get("dbname").unwrap_or_default().into())
                })?;
            db.users.lock().drop_user(get("account").unwrap_or_default())?;
            Ok(Pkg::new(pkg.pid, proto::ACK_SERVICE, Vec::new()))
        }
        other => Ok(Pkg::new(
            pkg.pid,
            proto::ERR_SERVICE_INVALID_REQUEST,
            pack_error_msg(&format!("unknown service request '{other}'")),
        )),
    }
}

// ─────────────────────────── backend listener ───────────────────────────────

pub async fn listen_backend(engine: Arc<Engine>, addr: String) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| TdbError::Transport(format!("bind {addr}: {e}")))?;
    info!(addr, "Backend listener started");
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| TdbError::Transport(format!("accept: {e}")))?;
        debug!(peer = %peer, "Peer connected");
        let engine = engine.clone();
        tokio::spawn(async move {
            serve_backend(engine, stream).await;
        });
    }
}

async fn serve_backend(engine: Arc<Engine>, stream: TcpStream) {
    let (mut rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Pkg>();
    tokio::spawn(writer_loop(rx, wr));

    let mut db: Option<Arc<Database>> = None;

    loop {
        // Peer packets have no client-facing size cap.
        let pkg = match Pkg::read_from(&mut rd, u32::MAX).await {
            Ok(pkg) => pkg,
            Err(e) => {
                debug!(error = %e, "Peer disconnected");
                break;
            }
        };
        let pid = pkg.pid;
        let tp = pkg.tp;
        let reply = match handle_backend_pkg(&engine, &mut db, pkg).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(tp = proto::type_name(tp), error = %e, "Backend request failed");
                Pkg::new(pid, proto::bproto_err(tp.clamp(128, 159)), pack_error_msg(&e.to_string()))
            }
        };
        if tx.send(reply).is_err() {
            break;
        }
    }
}

async fn handle_backend_pkg(
    engine: &Arc<Engine>,
    db: &mut Option<Arc<Database>>,
    pkg: Pkg,
) -> Result<Pkg> {
    let ack = |pkg: &Pkg| Pkg::new(pkg.pid, proto::bproto_ack(pkg.tp), Vec::new());
    match pkg.tp {
        proto::BPROTO_AUTH_REQUEST => {
            let mut up = Unpacker::new(&pkg.data);
            let _uuid = up.expect_str()?;
            let dbname = up.expect_str()?;
            let found = engine
                .get_database(dbname)
                .ok_or_else(|| TdbError::AuthUnknownDb(dbname.into()))?;
            *db = Some(found);
            Ok(ack(&pkg))
        }
        proto::BPROTO_INSERT_POOL
        | proto::BPROTO_INSERT_SERVER
        | proto::BPROTO_INSERT_TEST_POOL
        | proto::BPROTO_INSERT_TEST_SERVER => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            let n = insert::insert_local(db, &pkg.data)?;
            debug!(points = n, "Forwarded insert applied");
            Ok(ack(&pkg))
        }
        proto::BPROTO_FLAGS_UPDATE => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            let mut up = Unpacker::new(&pkg.data);
            let uuid: uuid::Uuid = up
                .expect_str()?
                .parse()
                .map_err(|_| TdbError::Corrupt("invalid uuid".into()))?;
            let flags = up.expect_int()? as u16;
            let servers = db.servers.lock();
            if let Some(server) = servers.iter().find(|s| s.uuid == uuid) {
                server.update_flags(flags);
            }
            Ok(ack(&pkg))
        }
        proto::BPROTO_DROP_SERIES => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            let mut up = Unpacker::new(&pkg.data);
            let mut names = Vec::new();
            if matches!(up.next_obj()?, crate::qpack::Obj::ArrayOpen) {
                loop {
                    match up.next_obj()? {
                        crate::qpack::Obj::ArrayClose => break,
                        crate::qpack::Obj::Raw(raw) => {
                            names.push(String::from_utf8_lossy(raw).into_owned())
                        }
                        _ => break,
                    }
                }
            }
            let mut store = db.store.lock();
            let ids: Vec<u32> = names
                .iter()
                .filter_map(|n| store.trie.get(n.as_bytes()).copied())
                .collect();
            for &id in &ids {
                db.drop_prepare(&mut store, id)?;
            }
            db.sync_dropped(&mut store)?;
            for &id in &ids {
                db.drop_commit(&mut store, id)?;
            }
            Ok(ack(&pkg))
        }
        proto::BPROTO_REPL_FINISHED => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            db.server
                .clear_flag(crate::cluster::server::FLAG_SYNCHRONIZING);
            Ok(ack(&pkg))
        }
        proto::BPROTO_ENABLE_BACKUP_MODE => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            backup::enable(db)?;
            Ok(ack(&pkg))
        }
        proto::BPROTO_DISABLE_BACKUP_MODE => {
            let db = db.as_ref().ok_or(TdbError::NotAuthenticated)?;
            backup::disable(db)?;
            Ok(ack(&pkg))
        }
        other => {
            warn!(tp = other, "Unexpected backend packet type");
            Ok(Pkg::new(
                pkg.pid,
                proto::bproto_err(other.clamp(128, 159)),
                pack_error_msg("unexpected packet type"),
            ))
        }
    }
}
