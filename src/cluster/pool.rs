// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Pools — one or two servers jointly owning a slice of the series
//! namespace. The peer sharing a pool is the replica.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::cluster::lookup::Lookup;
use crate::cluster::server::Server;
use crate::error::{Result, TdbError};
use crate::net::pkg::Pkg;

pub struct Pool {
    pub id: u16,
    pub servers: Vec<Arc<Server>>,
}

impl Pool {
    pub fn new(id: u16) -> Self {
        Pool {
            id,
            servers: Vec::with_capacity(2),
        }
    }

    /// Attach a server, ordered by uuid so both cluster members agree on
    /// the 0/1 position.
    pub fn add_server(&mut self, server: Arc<Server>) {
        debug_assert!(self.servers.len() < 2);
        self.servers.push(server);
        self.servers.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    }

    pub fn online(&self) -> bool {
        self.servers.iter().any(|s| s.is_online())
    }

    pub fn available(&self) -> bool {
        self.servers.iter().any(|s| s.is_available())
    }

    pub fn accessible(&self) -> bool {
        self.servers.iter().any(|s| s.is_accessible())
    }

    /// Pick one accessible server; uniform-random when both qualify.
    pub fn pick_accessible(&self) -> Option<Arc<Server>> {
        let candidates: Vec<_> = self
            .servers
            .iter()
            .filter(|s| s.is_accessible())
            .collect();
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            n => Some(candidates[rand::thread_rng().gen_range(0..n)].clone()),
        }
    }
}

/// All pools of a database plus the name lookup.
pub struct Pools {
    pub pools: Vec<Pool>,
    pub lookup: Lookup,
    /// Pool this server belongs to.
    pub local: u16,
}

impl Pools {
    pub fn new(num_pools: u16, local: u16) -> Self {
        let pools = (0..num_pools).map(Pool::new).collect();
        Pools {
            pools,
            lookup: Lookup::new(num_pools),
            local,
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    pub fn get(&self, pool: u16) -> Option<&Pool> {
        self.pools.get(pool as usize)
    }

    /// Pool owning a series name.
    pub fn pool_for(&self, name: &[u8]) -> u16 {
        self.lookup.pool_for(name)
    }

    /// Replica of the given server within its pool, if the pool has two.
    pub fn replica_of(&self, pool: u16, uuid: uuid::Uuid) -> Option<Arc<Server>> {
        self.get(pool)?
            .servers
            .iter()
            .find(|s| s.uuid != uuid)
            .cloned()
    }

    /// Route a request to one accessible server of `pool` and await the
    /// reply.
    pub async fn send_pkg(
        &self,
        pool: u16,
        tp: u8,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Pkg> {
        let server = self
            .get(pool)
            .and_then(|p| p.pick_accessible())
            .ok_or_else(|| {
                TdbError::Pool(
                    "At least one pool has no server available to process the request".into(),
                )
            })?;
        server.send_pkg(tp, data, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::server::{FLAG_AUTHENTICATED, FLAG_CONNECTED, FLAG_RUNNING};
    use uuid::Uuid;

    fn online_server(pool: u16) -> Arc<Server> {
        let s = Server::new(Uuid::new_v4(), "127.0.0.1".into(), 9010, pool);
        s.set_flag(FLAG_RUNNING | FLAG_CONNECTED | FLAG_AUTHENTICATED);
        Arc::new(s)
    }

    #[test]
    fn test_pool_accessors() {
        let mut pool = Pool::new(0);
        assert!(!pool.online());
        pool.add_server(online_server(0));
        assert!(pool.online());
        assert!(pool.available());
        assert!(pool.accessible());
        assert!(pool.pick_accessible().is_some());
    }

    #[test]
    fn test_servers_ordered_by_uuid() {
        let mut pool = Pool::new(0);
        let a = online_server(0);
        let b = online_server(0);
        pool.add_server(a.clone());
        pool.add_server(b.clone());
        assert!(pool.servers[0].uuid <= pool.servers[1].uuid);
    }

    #[tokio::test]
    async fn test_send_pkg_without_accessible_server() {
        let pools = Pools::new(1, 0);
        let err = pools
            .send_pkg(0, 0, vec![], Duration::from_millis(10))
            .await;
        match err {
            Err(TdbError::Pool(msg)) => {
                assert!(msg.contains("no server available"));
            }
            other => panic!("expected pool error, got {other:?}"),
        }
    }
}
