// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Backup mode.
//!
//! While enabled, optimize and replication pause and every file handle of
//! the database is released so an external tool can copy the directory.
//! Memory-resident state keeps serving; disabling reopens the files and
//! resumes the paused tasks.

use tracing::info;

use crate::cluster::server::{FLAG_BACKUP_MODE, FLAG_SYNCHRONIZING};
use crate::db::Database;
use crate::error::{Result, TdbError};

pub fn enable(db: &Database) -> Result<()> {
    if db.in_backup_mode() {
        return Err(TdbError::Server("backup mode is already enabled".into()));
    }
    db.replicate.lock().pause();
    db.flush_all()?;
    db.save_series()?;
    db.close_files()?;
    db.server.set_flag(FLAG_BACKUP_MODE);
    info!(db = db.name(), "Backup mode enabled");
    Ok(())
}

pub fn disable(db: &Database) -> Result<()> {
    if !db.in_backup_mode() {
        return Err(TdbError::Server("backup mode is not enabled".into()));
    }
    db.reopen_files()?;
    db.server.clear_flag(FLAG_BACKUP_MODE);

    // Replication resumes; optimize follows on its next tick unless the
    // replica is still synchronizing.
    let replica_syncing = {
        let pools = db.pools.lock();
        pools
            .replica_of(db.server.pool, db.server.uuid)
            .is_some_and(|r| r.flags() & FLAG_SYNCHRONIZING != 0)
    };
    if !replica_syncing {
        db.replicate.lock().resume();
    }
    info!(db = db.name(), "Backup mode disabled");
    Ok(())
}
