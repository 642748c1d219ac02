// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Wire protocol — framed packets, type taxonomy, promises, listeners.

pub mod client;
pub mod pkg;
pub mod promise;
pub mod protocol;
pub mod server;
