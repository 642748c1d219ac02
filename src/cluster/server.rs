// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cluster server peer.
//!
//! A server is a row in `servers.dat` plus, while connected, an outgoing
//! packet channel and a promise table. Status flags mirror what the peer
//! last told us through flag updates.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, TdbError};
use crate::net::pkg::Pkg;
use crate::net::promise::Promises;

pub const FLAG_RUNNING: u16 = 1 << 0;
pub const FLAG_SYNCHRONIZING: u16 = 1 << 1;
pub const FLAG_REINDEXING: u16 = 1 << 2;
pub const FLAG_BACKUP_MODE: u16 = 1 << 3;
pub const FLAG_CONNECTED: u16 = 1 << 4;
pub const FLAG_AUTHENTICATED: u16 = 1 << 5;

pub struct Server {
    pub uuid: Uuid,
    pub address: String,
    pub port: u16,
    pub pool: u16,
    /// Position inside the pool (0 or 1), assigned by uuid order.
    pub id: u8,
    flags: AtomicU16,
    pub promises: Promises,
    conn: Mutex<Option<mpsc::UnboundedSender<Pkg>>>,
}

impl Server {
    pub fn new(uuid: Uuid, address: String, port: u16, pool: u16) -> Self {
        Server {
            uuid,
            address,
            port,
            pool,
            id: 0,
            flags: AtomicU16::new(0),
            promises: Promises::new(),
            conn: Mutex::new(None),
        }
    }

    /// "address:port", used all over status output.
    pub fn name(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn flags(&self) -> u16 {
        self.flags.load(Ordering::SeqCst)
    }

    pub fn set_flag(&self, flag: u16) {
        self.flags.fetch_or(flag, Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: u16) {
        self.flags.fetch_and(!flag, Ordering::SeqCst);
    }

    /// Replace status flags from a peer update, keeping the local
    /// connection bits.
    pub fn update_flags(&self, new: u16) {
        let keep = self.flags() & (FLAG_CONNECTED | FLAG_AUTHENTICATED);
        self.flags.store(
            (new & !(FLAG_CONNECTED | FLAG_AUTHENTICATED)) | keep,
            Ordering::SeqCst,
        );
    }

    pub fn is_online(&self) -> bool {
        let f = self.flags();
        f & (FLAG_RUNNING | FLAG_CONNECTED) == (FLAG_RUNNING | FLAG_CONNECTED)
    }

    /// Connected and authenticated, with no special state.
    pub fn is_available(&self) -> bool {
        let f = self.flags();
        f & (FLAG_RUNNING | FLAG_CONNECTED | FLAG_AUTHENTICATED)
            == (FLAG_RUNNING | FLAG_CONNECTED | FLAG_AUTHENTICATED)
            && f & (FLAG_SYNCHRONIZING | FLAG_REINDEXING | FLAG_BACKUP_MODE) == 0
    }

    /// Available or re-indexing; such a server still takes writes.
    pub fn is_accessible(&self) -> bool {
        let f = self.flags();
        f & (FLAG_RUNNING | FLAG_CONNECTED | FLAG_AUTHENTICATED)
            == (FLAG_RUNNING | FLAG_CONNECTED | FLAG_AUTHENTICATED)
            && f & (FLAG_SYNCHRONIZING | FLAG_BACKUP_MODE) == 0
    }

    pub fn is_synchronizing(&self) -> bool {
        self.flags() & FLAG_SYNCHRONIZING != 0
    }

    /// Render status flags as text, e.g. "running | re-indexing".
    pub fn status_str(&self) -> String {
        let f = self.flags();
        let mut parts = Vec::new();
        if f & FLAG_RUNNING != 0 {
            parts.push("running");
        }
        if f & FLAG_SYNCHRONIZING != 0 {
            parts.push("synchronizing");
        }
        if f & FLAG_REINDEXING != 0 {
            parts.push("re-indexing");
        }
        if f & FLAG_BACKUP_MODE != 0 {
            parts.push("backup-mode");
        }
        if parts.is_empty() {
            parts.push("offline");
        }
        parts.join(" | ")
    }

    /// Attach an outgoing channel once the peer socket is up.
    pub fn attach(&self, tx: mpsc::UnboundedSender<Pkg>) {
        *self.conn.lock() = Some(tx);
        self.set_flag(FLAG_CONNECTED);
    }

    /// Drop the connection; open promises resolve cancelled.
    pub fn detach(&self) {
        *self.conn.lock() = None;
        self.clear_flag(FLAG_CONNECTED | FLAG_AUTHENTICATED);
        self.promises.cancel_all();
    }

    /// Send a request and await its reply. A fresh monotonic pid is
    /// assigned; expiry resolves [`TdbError::Timeout`].
    pub async fn send_pkg(&self, tp: u8, data: Vec<u8>, timeout: Duration) -> Result<Pkg> {
        let (pid, rx) = self.promises.register();
        let pkg = Pkg::new(pid, tp, data);
        {
            let conn = self.conn.lock();
            let Some(tx) = conn.as_ref() else {
                self.promises.forget(pid);
                return Err(TdbError::Server(format!(
                    "server {} is not connected",
                    self.name()
                )));
            };
            if tx.send(pkg).is_err() {
                self.promises.forget(pid);
                return Err(TdbError::Transport(format!(
                    "connection to {} is closing",
                    self.name()
                )));
            }
        }
        debug!(server = %self.name(), pid, tp, "Request sent");
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.promises.forget(pid);
                Err(TdbError::Timeout)
            }
            Ok(Err(_)) => Err(TdbError::Cancelled),
            Ok(Ok(result)) => result,
        }
    }

    /// Fire a packet without waiting for a reply (flag updates).
    pub fn send_unacked(&self, tp: u8, data: Vec<u8>) -> Result<()> {
        let conn = self.conn.lock();
        let Some(tx) = conn.as_ref() else {
            return Err(TdbError::Server(format!(
                "server {} is not connected",
                self.name()
            )));
        };
        tx.send(Pkg::new(0, tp, data))
            .map_err(|_| TdbError::Transport("connection closing".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new(Uuid::new_v4(), "10.0.0.1".into(), 9010, 0)
    }

    #[test]
    fn test_availability_ladder() {
        let s = server();
        assert!(!s.is_online());
        s.set_flag(FLAG_RUNNING | FLAG_CONNECTED);
        assert!(s.is_online());
        assert!(!s.is_available());
        s.set_flag(FLAG_AUTHENTICATED);
        assert!(s.is_available());
        assert!(s.is_accessible());
        s.set_flag(FLAG_REINDEXING);
        assert!(!s.is_available());
        assert!(s.is_accessible());
        s.set_flag(FLAG_SYNCHRONIZING);
        assert!(!s.is_accessible());
    }

    #[test]
    fn test_update_flags_keeps_connection_bits() {
        let s = server();
        s.set_flag(FLAG_CONNECTED | FLAG_AUTHENTICATED);
        s.update_flags(FLAG_RUNNING | FLAG_BACKUP_MODE);
        assert!(s.flags() & FLAG_CONNECTED != 0);
        assert!(s.flags() & FLAG_AUTHENTICATED != 0);
        assert!(s.flags() & FLAG_BACKUP_MODE != 0);
    }

    #[test]
    fn test_status_str() {
        let s = server();
        assert_eq!(s.status_str(), "offline");
        s.set_flag(FLAG_RUNNING | FLAG_REINDEXING);
        assert_eq!(s.status_str(), "running | re-indexing");
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let s = server();
        let err = s.send_pkg(1, vec![], Duration::from_millis(10)).await;
        assert!(matches!(err, Err(TdbError::Server(_))));
        assert!(s.promises.is_empty());
    }
}
