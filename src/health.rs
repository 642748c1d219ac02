// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! HTTP surface — health probes and the JSON API mirror.
//!
//! Endpoints (status port):
//!   GET /status   → 200 OK | SYNCHRONIZING | REINDEXING | 503 NOK
//!   GET /ready    → 200 READY | 503 NOK
//!   GET /healthy  → 200 OK
//!
//! Endpoints (api port):
//!   POST /query/{dbname}   → JSON {username, password, query}
//!   POST /insert/{dbname}  → JSON {username, password, data}

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::cluster::server::{FLAG_REINDEXING, FLAG_RUNNING, FLAG_SYNCHRONIZING};
use crate::db::engine::Engine;
use crate::error::TdbError;
use crate::insert;
use crate::points::Value;
use crate::qpack::Packer;
use crate::query;

pub struct HttpState {
    pub engine: Arc<Engine>,
}

// ─────────────────────────── status listener ────────────────────────────────

pub fn build_status_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/ready", get(handle_ready))
        .route("/healthy", get(handle_healthy))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(router: Router, port: u16) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr, error = %e, "Cannot bind HTTP listener");
            return;
        }
    };
    info!(addr, "HTTP listener started");
    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "HTTP listener stopped");
    }
}

/// Aggregate server state across databases.
fn aggregate_flags(engine: &Engine) -> u16 {
    engine
        .databases()
        .iter()
        .fold(0u16, |acc, db| acc | db.server.flags())
}

async fn handle_status(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    if state.engine.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "NOK");
    }
    let flags = aggregate_flags(&state.engine);
    if flags & FLAG_SYNCHRONIZING != 0 {
        (StatusCode::OK, "SYNCHRONIZING")
    } else if flags & FLAG_REINDEXING != 0 {
        (StatusCode::OK, "REINDEXING")
    } else if flags & FLAG_RUNNING != 0 || state.engine.databases().is_empty() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOK")
    }
}

async fn handle_ready(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let flags = aggregate_flags(&state.engine);
    let ready = !state.engine.is_cancelled()
        && flags & FLAG_SYNCHRONIZING == 0
        && (flags & FLAG_RUNNING != 0 || state.engine.databases().is_empty());
    if ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOK")
    }
}

async fn handle_healthy() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

// ─────────────────────────── api listener ───────────────────────────────────

pub fn build_api_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/query/{dbname}", post(handle_query))
        .route("/insert/{dbname}", post(handle_insert))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct QueryBody {
    username: String,
    password: String,
    query: String,
}

#[derive(Deserialize)]
struct InsertBody {
    username: String,
    password: String,
    data: serde_json::Map<String, serde_json::Value>,
}

fn http_error(e: &TdbError) -> (StatusCode, Json<serde_json::Value>) {
    let code = match e {
        TdbError::AuthCredentials | TdbError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        TdbError::UserAccess(_) => StatusCode::FORBIDDEN,
        TdbError::AuthUnknownDb(_) => StatusCode::NOT_FOUND,
        TdbError::Query(_) | TdbError::Insert(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(json!({ "error_msg": e.to_string() })))
}

async fn handle_query(
    State(state): State<Arc<HttpState>>,
    Path(dbname): Path<String>,
    Json(body): Json<QueryBody>,
) -> impl IntoResponse {
    let Some(db) = state.engine.get_database(&dbname) else {
        return http_error(&TdbError::AuthUnknownDb(dbname));
    };
    let access = {
        let users = db.users.lock();
        match users.authenticate(&body.username, &body.password) {
            Ok(user) => user.access,
            Err(e) => return http_error(&e),
        }
    };
    match query::execute(&db, &body.query, &body.username, access).await {
        Ok(result) => (StatusCode::OK, Json(result.to_json())),
        Err(e) => http_error(&e),
    }
}

async fn handle_insert(
    State(state): State<Arc<HttpState>>,
    Path(dbname): Path<String>,
    Json(body): Json<InsertBody>,
) -> impl IntoResponse {
    let Some(db) = state.engine.get_database(&dbname) else {
        return http_error(&TdbError::AuthUnknownDb(dbname));
    };
    let access = {
        let users = db.users.lock();
        match users.authenticate(&body.username, &body.password) {
            Ok(user) => user.access,
            Err(e) => return http_error(&e),
        }
    };
    if let Err(e) =
        crate::db::access::check_access(access, crate::db::access::ACCESS_INSERT)
    {
        return http_error(&e);
    }

    let payload = match json_to_insert_payload(&body.data) {
        Ok(payload) => payload,
        Err(e) => return http_error(&e),
    };
    match insert::insert(&db, &payload).await {
        Ok(n) => (
            StatusCode::OK,
            Json(json!({ "success_msg": format!("Inserted {n} point(s) successfully.") })),
        ),
        Err(e) => http_error(&e),
    }
}

/// Translate a JSON insert body into the packed payload the pipeline
/// expects.
fn json_to_insert_payload(
    data: &serde_json::Map<String, serde_json::Value>,
) -> crate::error::Result<Vec<u8>> {
    let mut p = Packer::new();
    p.open_map();
    for (name, points) in data {
        p.add_string(name);
        let serde_json::Value::Array(points) = points else {
            return Err(TdbError::Insert("Expecting an array of points".into()));
        };
        p.open_array();
        for point in points {
            let serde_json::Value::Array(pair) = point else {
                return Err(TdbError::Insert("Expecting an array of points".into()));
            };
            if pair.len() != 2 {
                return Err(TdbError::Insert("Expecting an array of points".into()));
            }
            let ts = pair[0]
                .as_u64()
                .ok_or_else(|| TdbError::Insert("Expecting an integer timestamp".into()))?;
            let val = json_value(&pair[1])?;
            p.fixed_array(2);
            p.add_int(ts as i64);
            match val {
                Value::Int(v) => p.add_int(v),
                Value::Double(v) => p.add_double(v),
                Value::Log(raw) => p.add_raw(&raw),
            }
        }
        p.close_array();
    }
    p.close_map();
    Ok(p.into_bytes())
}

fn json_value(v: &serde_json::Value) -> crate::error::Result<Value> {
    match v {
        serde_json::Value::Number(n) if n.is_i64() => Ok(Value::Int(n.as_i64().unwrap())),
        serde_json::Value::Number(n) => Ok(Value::Double(n.as_f64().unwrap_or(0.0))),
        serde_json::Value::String(s) => Ok(Value::Log(s.as_bytes().to_vec())),
        _ => Err(TdbError::Insert("Unsupported value received".into())),
    }
}
