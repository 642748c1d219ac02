// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TdbError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shard storage error: {0}")]
    Storage(String),

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Insert error: {0}")]
    Insert(String),

    #[error("Invalid credentials")]
    AuthCredentials,

    #[error("Unknown database: {0}")]
    AuthUnknownDb(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Access denied: {0}")]
    UserAccess(String),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Critical error: {0}")]
    Critical(String),
}

pub type Result<T> = std::result::Result<T, TdbError>;

/// Process-wide critical flag. Raised on irrecoverable storage errors and
/// observed by the main loop, which then initiates an orderly shutdown.
static CRITICAL: AtomicBool = AtomicBool::new(false);

pub fn raise_critical() {
    CRITICAL.store(true, Ordering::SeqCst);
}

pub fn is_critical() -> bool {
    CRITICAL.load(Ordering::SeqCst)
}
