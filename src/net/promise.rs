// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Request promises.
//!
//! Every outgoing request gets a fresh monotonic pid and a oneshot channel
//! resolved by the reply with the same pid, by a transport error, or by
//! cancellation. Timeouts are applied by the waiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, TdbError};
use crate::net::pkg::Pkg;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
pub struct Promises {
    next_pid: AtomicU16,
    pending: Mutex<HashMap<u16, oneshot::Sender<Result<Pkg>>>>,
}

impl Promises {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a pid and the channel its reply resolves.
    pub fn register(&self) -> (u16, oneshot::Receiver<Result<Pkg>>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        // Skip pids still in flight; with u16 wrap-around an ancient
        // request could otherwise be resolved by the wrong reply.
        let pid = loop {
            let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&pid) {
                break pid;
            }
        };
        pending.insert(pid, tx);
        (pid, rx)
    }

    /// Resolve the promise for `pid`. Returns false when no promise was
    /// waiting (late reply after timeout).
    pub fn resolve(&self, pid: u16, result: Result<Pkg>) -> bool {
        match self.pending.lock().remove(&pid) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Drop a promise without resolving it (timeout path).
    pub fn forget(&self, pid: u16) {
        self.pending.lock().remove(&pid);
    }

    /// Resolve everything with a cancellation error (connection lost).
    pub fn cancel_all(&self) {
        let pending: Vec<_> = {
            let mut map = self.pending.lock();
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(TdbError::Cancelled));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_resolve() {
        let promises = Promises::new();
        let (pid, rx) = promises.register();
        assert!(promises.resolve(pid, Ok(Pkg::new(pid, 0, vec![]))));
        let pkg = rx.await.unwrap().unwrap();
        assert_eq!(pkg.pid, pid);
    }

    #[tokio::test]
    async fn test_late_reply_ignored() {
        let promises = Promises::new();
        let (pid, rx) = promises.register();
        promises.forget(pid);
        drop(rx);
        assert!(!promises.resolve(pid, Ok(Pkg::new(pid, 0, vec![]))));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let promises = Promises::new();
        let (_, rx1) = promises.register();
        let (_, rx2) = promises.register();
        promises.cancel_all();
        assert!(matches!(rx1.await.unwrap(), Err(TdbError::Cancelled)));
        assert!(matches!(rx2.await.unwrap(), Err(TdbError::Cancelled)));
        assert!(promises.is_empty());
    }

    #[tokio::test]
    async fn test_pids_are_monotonic() {
        let promises = Promises::new();
        let (p1, _rx1) = promises.register();
        let (p2, _rx2) = promises.register();
        assert_eq!(p2, p1.wrapping_add(1));
    }
}
