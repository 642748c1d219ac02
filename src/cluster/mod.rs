// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cluster subsystem — pool lookup, servers, replica FIFO, replication.

pub mod fifo;
pub mod lookup;
pub mod pool;
pub mod replicate;
pub mod server;
