// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Engine — the single process-wide value owning every database, the
//! configuration and the shared file handle cache. Init and teardown are
//! explicit; signal handlers only flip the cancel flag, observed by the
//! background tasks at their next tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info};

use crate::config::Config;
use crate::db::{Database, DbOptions};
use crate::error::{Result, TdbError};
use crate::storage::fcache::FileCache;
use crate::time::Precision;

pub struct Engine {
    pub config: Config,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    pub fcache: Arc<FileCache>,
    pub cancelled: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config) -> Arc<Engine> {
        let fcache = Arc::new(FileCache::new(config.storage.max_open_files.min(32_768)));
        Arc::new(Engine {
            config,
            databases: RwLock::new(HashMap::new()),
            fcache,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn db_options(&self) -> DbOptions {
        DbOptions {
            buffer_size: self.config.storage.buffer_size,
            compression: self.config.storage.enable_shard_compression,
            ignore_broken_data: self.config.storage.ignore_broken_data,
        }
    }

    /// Open every database directory found under the configured path.
    pub fn load_databases(&self) -> Result<()> {
        let base = &self.config.storage.db_path;
        std::fs::create_dir_all(base)?;
        for entry in std::fs::read_dir(base)? {
            let entry = entry?;
            if !entry.path().join(super::DB_FN).exists() {
                continue;
            }
            match Database::open(
                &entry.path(),
                self.db_options(),
                &self.config.server.bind_server_address,
                self.config.server.listen_server_port,
                self.fcache.clone(),
            ) {
                Ok(db) => {
                    let name = db.name();
                    info!(db = name, "Database loaded");
                    self.databases.write().insert(name, db);
                }
                Err(e) => {
                    error!(path = ?entry.path(), error = %e, "Cannot load database");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Create a database and register it.
    pub fn new_database(
        &self,
        name: &str,
        precision: Precision,
        buffer_size: usize,
        duration_num_secs: u64,
        duration_log_secs: u64,
    ) -> Result<Arc<Database>> {
        if self.databases.read().contains_key(name) {
            return Err(TdbError::Config(format!(
                "database '{name}' already exists"
            )));
        }
        // Auto-duration: finer precisions imply higher rates, so shard
        // windows shrink when the caller kept the default.
        let duration_num_secs = if self.config.storage.enable_shard_auto_duration
            && duration_num_secs == crate::db::DEFAULT_DURATION_NUM_SECS
        {
            match precision {
                Precision::Seconds => crate::db::DEFAULT_DURATION_NUM_SECS,
                Precision::Milliseconds => 86_400,
                Precision::Microseconds => 21_600,
                Precision::Nanoseconds => 3_600,
            }
        } else {
            duration_num_secs
        };
        let path = self.config.storage.db_path.join(name);
        let db = Database::create(
            &path,
            name,
            precision,
            buffer_size,
            duration_num_secs,
            duration_log_secs,
            self.db_options(),
            &self.config.server.bind_server_address,
            self.config.server.listen_server_port,
            self.fcache.clone(),
        )?;
        self.databases.write().insert(name.to_string(), db.clone());
        Ok(db)
    }

    pub fn get_database(&self, name: &str) -> Option<Arc<Database>> {
        self.databases.read().get(name).cloned()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.read().values().cloned().collect()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Orderly teardown: flush and persist every database.
    pub fn shutdown(&self) {
        self.cancel();
        for db in self.databases() {
            if let Err(e) = db.shutdown() {
                error!(db = db.name(), error = %e, "Shutdown flush failed");
            }
        }
        info!("Engine shut down");
    }
}
