// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Replication task.
//!
//! Drains the replica FIFO one frame at a time: pop, send to the replica,
//! commit on ACK. A transport error leaves the frame queued for redelivery;
//! a timeout or an unexpected reply commits with an error since the packet
//! may well have been applied and the receiver is idempotent on duplicate
//! points. When the replica is synchronizing and the queue runs dry a
//! replication-finished control packet flips it to available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::cluster::fifo::Fifo;
use crate::cluster::server::{Server, FLAG_SYNCHRONIZING};
use crate::error::TdbError;
use crate::net::pkg::Pkg;
use crate::net::promise::DEFAULT_TIMEOUT;
use crate::net::protocol;

pub const REPLICATE_SLEEP_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Running,
    Paused,
    Stopping,
    Closed,
}

pub struct Replicate {
    pub status: Status,
}

impl Default for Replicate {
    fn default() -> Self {
        Self::new()
    }
}

impl Replicate {
    pub fn new() -> Self {
        Replicate {
            status: Status::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == Status::Idle
    }

    /// Start delivering. Only valid from idle.
    pub fn start(&mut self) {
        debug_assert!(self.is_idle());
        self.status = Status::Running;
    }

    /// Request a pause; a running task acknowledges by moving from
    /// stopping to paused at its next tick. Do not close the fifo before
    /// the status reads paused.
    pub fn pause(&mut self) {
        debug_assert!(self.status != Status::Closed);
        self.status = if self.status == Status::Idle {
            Status::Paused
        } else {
            Status::Stopping
        };
    }

    /// Resume after a pause.
    pub fn resume(&mut self) {
        debug_assert!(self.status != Status::Closed);
        self.status = Status::Running;
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn close(&mut self) {
        self.status = Status::Closed;
    }
}

/// Periodic delivery loop; lives for as long as the database has a
/// replica. Reschedules itself every [`REPLICATE_SLEEP_MS`].
pub async fn run(
    replicate: Arc<Mutex<Replicate>>,
    fifo: Arc<Mutex<Fifo>>,
    replica: Arc<Server>,
    cancelled: Arc<AtomicBool>,
) {
    let mut tick = interval(Duration::from_millis(REPLICATE_SLEEP_MS));
    info!(replica = %replica.name(), "Replication task started");

    loop {
        tick.tick().await;

        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        {
            let mut r = replicate.lock();
            match r.status {
                Status::Closed => break,
                Status::Stopping => {
                    r.status = Status::Paused;
                    continue;
                }
                Status::Paused | Status::Idle => continue,
                Status::Running => {}
            }
        }

        if !(replica.is_accessible() || replica.is_synchronizing()) {
            continue;
        }

        let frame = {
            let mut q = fifo.lock();
            if q.has_data() {
                match q.pop() {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        error!(error = %e, "Fifo pop failed");
                        None
                    }
                }
            } else {
                None
            }
        };

        match frame {
            Some(frame) => {
                deliver(&fifo, &replica, frame).await;
            }
            None if replica.is_synchronizing() => {
                finish_sync(&replica).await;
            }
            None => {}
        }
    }

    replicate.lock().close();
    info!(replica = %replica.name(), "Replication task closed");
}

async fn deliver(fifo: &Arc<Mutex<Fifo>>, replica: &Arc<Server>, frame: Vec<u8>) {
    let pkg = match Pkg::decode(&frame) {
        Ok(pkg) => pkg,
        Err(e) => {
            // An unparsable frame can never be delivered; skip it.
            error!(error = %e, "Corrupt fifo frame");
            commit_err(fifo);
            return;
        }
    };

    match replica.send_pkg(pkg.tp, pkg.data, DEFAULT_TIMEOUT).await {
        Ok(reply) if protocol::is_bproto_ack(reply.tp) => {
            debug!(tp = protocol::type_name(pkg.tp), "Replica acknowledged");
            if let Err(e) = fifo.lock().commit() {
                error!(error = %e, "Fifo commit failed");
            }
        }
        Ok(reply) => {
            warn!(
                tp = protocol::type_name(reply.tp),
                "Unexpected reply from replica, committing with error"
            );
            commit_err(fifo);
        }
        Err(TdbError::Timeout) => {
            warn!("Replica did not answer in time, committing with error");
            commit_err(fifo);
        }
        Err(e) => {
            // Write error: the frame stays queued and is re-delivered.
            debug!(error = %e, "Replica unreachable, will retry");
        }
    }
}

fn commit_err(fifo: &Arc<Mutex<Fifo>>) {
    if let Err(e) = fifo.lock().commit_err() {
        error!(error = %e, "Fifo error-commit failed");
    }
}

async fn finish_sync(replica: &Arc<Server>) {
    match replica
        .send_pkg(protocol::BPROTO_REPL_FINISHED, Vec::new(), DEFAULT_TIMEOUT)
        .await
    {
        Ok(reply) if protocol::is_bproto_ack(reply.tp) => {
            replica.clear_flag(FLAG_SYNCHRONIZING);
            info!(replica = %replica.name(), "Replica finished synchronizing");
        }
        Ok(_) | Err(_) => {
            // Keep synchronizing; the next empty tick tries again.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_machine() {
        let mut r = Replicate::new();
        assert!(r.is_idle());
        r.start();
        assert_eq!(r.status, Status::Running);
        r.pause();
        assert_eq!(r.status, Status::Stopping);
        r.resume();
        assert_eq!(r.status, Status::Running);
        r.close();
        assert_eq!(r.status, Status::Closed);
    }

    #[test]
    fn test_pause_from_idle() {
        let mut r = Replicate::new();
        r.pause();
        assert!(r.is_paused());
        r.resume();
        assert_eq!(r.status, Status::Running);
    }
}
