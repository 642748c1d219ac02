// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Packet type taxonomy.
//!
//! Client requests live in 0..16, success responses in 16..64, error
//! responses in 64..128 and the peer (backend) protocol in 128..255.
//! Backend acknowledgements and errors derive from the request type by a
//! fixed offset so every request has symmetric ACK / ERR variants.

// Client → server.
pub const REQ_QUERY: u8 = 0;
pub const REQ_INSERT: u8 = 1;
pub const REQ_AUTH: u8 = 2;
pub const REQ_PING: u8 = 3;
pub const REQ_SERVICE: u8 = 4;
pub const REQ_REGISTER_SERVER: u8 = 5;
pub const REQ_FILE_SERVERS: u8 = 6;
pub const REQ_FILE_USERS: u8 = 7;
pub const REQ_FILE_GROUPS: u8 = 8;
pub const REQ_FILE_DATABASE: u8 = 9;

// Server → client, success.
pub const RES_QUERY: u8 = 16;
pub const RES_INSERT: u8 = 17;
pub const RES_AUTH_SUCCESS: u8 = 18;
pub const RES_ACK: u8 = 19;
pub const RES_FILE: u8 = 20;
pub const ACK_SERVICE: u8 = 21;
pub const ACK_SERVICE_DATA: u8 = 22;

// Server → client, errors.
pub const ERR_MSG: u8 = 64;
pub const ERR_QUERY: u8 = 65;
pub const ERR_INSERT: u8 = 66;
pub const ERR_SERVER: u8 = 67;
pub const ERR_POOL: u8 = 68;
pub const ERR_USER_ACCESS: u8 = 69;
pub const ERR_NOT_AUTHENTICATED: u8 = 70;
pub const ERR_AUTH_CREDENTIALS: u8 = 71;
pub const ERR_AUTH_UNKNOWN_DB: u8 = 72;
pub const ERR_FILE: u8 = 73;
pub const ERR_SERVICE: u8 = 74;
pub const ERR_SERVICE_INVALID_REQUEST: u8 = 75;
pub const ERR_GENERIC: u8 = 76;

// Peer ↔ peer requests.
pub const BPROTO_AUTH_REQUEST: u8 = 128;
pub const BPROTO_FLAGS_UPDATE: u8 = 129;
pub const BPROTO_LOG_LEVEL_UPDATE: u8 = 130;
pub const BPROTO_REPL_FINISHED: u8 = 131;
pub const BPROTO_QUERY_SERVER: u8 = 132;
pub const BPROTO_QUERY_UPDATE: u8 = 133;
pub const BPROTO_INSERT_POOL: u8 = 134;
pub const BPROTO_INSERT_SERVER: u8 = 135;
pub const BPROTO_INSERT_TEST_POOL: u8 = 136;
pub const BPROTO_INSERT_TEST_SERVER: u8 = 137;
pub const BPROTO_INSERT_TESTED_POOL: u8 = 138;
pub const BPROTO_INSERT_TESTED_SERVER: u8 = 139;
pub const BPROTO_REGISTER_SERVER: u8 = 140;
pub const BPROTO_DROP_SERIES: u8 = 141;
pub const BPROTO_REQ_GROUPS: u8 = 142;
pub const BPROTO_ENABLE_BACKUP_MODE: u8 = 143;
pub const BPROTO_DISABLE_BACKUP_MODE: u8 = 144;

const BPROTO_ACK_OFFSET: u8 = 48;
const BPROTO_ERR_OFFSET: u8 = 96;

/// ACK type for a backend request.
pub fn bproto_ack(req: u8) -> u8 {
    debug_assert!((128..176).contains(&req));
    req + BPROTO_ACK_OFFSET
}

/// ERR type for a backend request.
pub fn bproto_err(req: u8) -> u8 {
    debug_assert!((128..160).contains(&req));
    req + BPROTO_ERR_OFFSET
}

pub fn is_bproto_ack(tp: u8) -> bool {
    (176..224).contains(&tp)
}

pub fn is_bproto_err(tp: u8) -> bool {
    tp >= 224
}

/// Human-readable type name for logs.
pub fn type_name(tp: u8) -> &'static str {
    match tp {
        REQ_QUERY => "REQ_QUERY",
        REQ_INSERT => "REQ_INSERT",
        REQ_AUTH => "REQ_AUTH",
        REQ_PING => "REQ_PING",
        REQ_SERVICE => "REQ_SERVICE",
        REQ_REGISTER_SERVER => "REQ_REGISTER_SERVER",
        REQ_FILE_SERVERS => "REQ_FILE_SERVERS",
        REQ_FILE_USERS => "REQ_FILE_USERS",
        REQ_FILE_GROUPS => "REQ_FILE_GROUPS",
        REQ_FILE_DATABASE => "REQ_FILE_DATABASE",
        RES_QUERY => "RES_QUERY",
        RES_INSERT => "RES_INSERT",
        RES_AUTH_SUCCESS => "RES_AUTH_SUCCESS",
        RES_ACK => "RES_ACK",
        RES_FILE => "RES_FILE",
        ACK_SERVICE => "ACK_SERVICE",
        ACK_SERVICE_DATA => "ACK_SERVICE_DATA",
        ERR_MSG => "ERR_MSG",
        ERR_QUERY => "ERR_QUERY",
        ERR_INSERT => "ERR_INSERT",
        ERR_SERVER => "ERR_SERVER",
        ERR_POOL => "ERR_POOL",
        ERR_USER_ACCESS => "ERR_USER_ACCESS",
        ERR_NOT_AUTHENTICATED => "ERR_NOT_AUTHENTICATED",
        ERR_AUTH_CREDENTIALS => "ERR_AUTH_CREDENTIALS",
        ERR_AUTH_UNKNOWN_DB => "ERR_AUTH_UNKNOWN_DB",
        ERR_FILE => "ERR_FILE",
        ERR_SERVICE => "ERR_SERVICE",
        ERR_SERVICE_INVALID_REQUEST => "ERR_SERVICE_INVALID_REQUEST",
        ERR_GENERIC => "ERR_GENERIC",
        BPROTO_AUTH_REQUEST => "BPROTO_AUTH_REQUEST",
        BPROTO_FLAGS_UPDATE => "BPROTO_FLAGS_UPDATE",
        BPROTO_LOG_LEVEL_UPDATE => "BPROTO_LOG_LEVEL_UPDATE",
        BPROTO_REPL_FINISHED => "BPROTO_REPL_FINISHED",
        BPROTO_QUERY_SERVER => "BPROTO_QUERY_SERVER",
        BPROTO_QUERY_UPDATE => "BPROTO_QUERY_UPDATE",
        BPROTO_INSERT_POOL => "BPROTO_INSERT_POOL",
        BPROTO_INSERT_SERVER => "BPROTO_INSERT_SERVER",
        BPROTO_INSERT_TEST_POOL => "BPROTO_INSERT_TEST_POOL",
        BPROTO_INSERT_TEST_SERVER => "BPROTO_INSERT_TEST_SERVER",
        BPROTO_INSERT_TESTED_POOL => "BPROTO_INSERT_TESTED_POOL",
        BPROTO_INSERT_TESTED_SERVER => "BPROTO_INSERT_TESTED_SERVER",
        BPROTO_REGISTER_SERVER => "BPROTO_REGISTER_SERVER",
        BPROTO_DROP_SERIES => "BPROTO_DROP_SERIES",
        BPROTO_REQ_GROUPS => "BPROTO_REQ_GROUPS",
        BPROTO_ENABLE_BACKUP_MODE => "BPROTO_ENABLE_BACKUP_MODE",
        BPROTO_DISABLE_BACKUP_MODE => "BPROTO_DISABLE_BACKUP_MODE",
        _ if is_bproto_ack(tp) => "BPROTO_ACK",
        _ if is_bproto_err(tp) => "BPROTO_ERR",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_err_symmetry() {
        let ack = bproto_ack(BPROTO_INSERT_POOL);
        let err = bproto_err(BPROTO_INSERT_POOL);
        assert!(is_bproto_ack(ack));
        assert!(is_bproto_err(err));
        assert_ne!(ack, err);
    }

    #[test]
    fn test_ranges_disjoint() {
        assert!(!is_bproto_ack(BPROTO_DISABLE_BACKUP_MODE));
        assert!(!is_bproto_err(bproto_ack(BPROTO_REPL_FINISHED)));
    }
}
