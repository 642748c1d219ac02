// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Access bits and aggregated profiles.

use crate::error::{Result, TdbError};

pub const ACCESS_SHOW: u32 = 1 << 0;
pub const ACCESS_COUNT: u32 = 1 << 1;
pub const ACCESS_LIST: u32 = 1 << 2;
pub const ACCESS_SELECT: u32 = 1 << 3;
pub const ACCESS_INSERT: u32 = 1 << 4;
pub const ACCESS_CREATE: u32 = 1 << 5;
pub const ACCESS_ALTER: u32 = 1 << 6;
pub const ACCESS_DROP: u32 = 1 << 7;
pub const ACCESS_GRANT: u32 = 1 << 8;
pub const ACCESS_REVOKE: u32 = 1 << 9;

pub const PROFILE_READ: u32 = ACCESS_SHOW | ACCESS_COUNT | ACCESS_LIST | ACCESS_SELECT;
pub const PROFILE_WRITE: u32 = PROFILE_READ | ACCESS_INSERT | ACCESS_CREATE;
pub const PROFILE_MODIFY: u32 = PROFILE_WRITE | ACCESS_ALTER | ACCESS_DROP;
pub const PROFILE_FULL: u32 = PROFILE_MODIFY | ACCESS_GRANT | ACCESS_REVOKE;

/// Profiles first so rendering folds them; biggest masks lead.
const ACCESS_MAP: [(&str, u32); 14] = [
    ("full", PROFILE_FULL),
    ("modify", PROFILE_MODIFY),
    ("write", PROFILE_WRITE),
    ("read", PROFILE_READ),
    ("alter", ACCESS_ALTER),
    ("count", ACCESS_COUNT),
    ("create", ACCESS_CREATE),
    ("drop", ACCESS_DROP),
    ("grant", ACCESS_GRANT),
    ("insert", ACCESS_INSERT),
    ("list", ACCESS_LIST),
    ("revoke", ACCESS_REVOKE),
    ("select", ACCESS_SELECT),
    ("show", ACCESS_SHOW),
];

/// Access bits for a keyword; 0 when unknown.
pub fn access_from_str(s: &str) -> u32 {
    ACCESS_MAP
        .iter()
        .find(|(repr, _)| *repr == s)
        .map(|(_, bit)| *bit)
        .unwrap_or(0)
}

/// Render an access mask as "show, count and list" style text; profiles
/// are folded first.
pub fn access_to_str(mut access: u32) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for (repr, bits) in ACCESS_MAP {
        if access == 0 {
            break;
        }
        if access & bits == bits {
            access -= bits;
            parts.push(repr);
        }
    }
    match parts.len() {
        0 => "no access".to_string(),
        1 => parts[0].to_string(),
        n => format!("{} and {}", parts[..n - 1].join(", "), parts[n - 1]),
    }
}

/// Verify `access` covers `required`, naming the missing bits otherwise.
pub fn check_access(access: u32, required: u32) -> Result<()> {
    if access & required == required {
        Ok(())
    } else {
        Err(TdbError::UserAccess(format!(
            "Insufficient privileges; missing '{}'",
            access_to_str(required & !access)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_nest() {
        assert_eq!(PROFILE_READ & PROFILE_WRITE, PROFILE_READ);
        assert_eq!(PROFILE_WRITE & PROFILE_MODIFY, PROFILE_WRITE);
        assert_eq!(PROFILE_MODIFY & PROFILE_FULL, PROFILE_MODIFY);
    }

    #[test]
    fn test_check_access_exact_rule() {
        assert!(check_access(PROFILE_READ, ACCESS_SELECT).is_ok());
        assert!(check_access(PROFILE_READ, ACCESS_INSERT).is_err());
        assert!(check_access(PROFILE_FULL, PROFILE_MODIFY).is_ok());
    }

    #[test]
    fn test_missing_bits_named() {
        let err = check_access(PROFILE_READ, ACCESS_INSERT).unwrap_err();
        assert!(err.to_string().contains("insert"));
    }

    #[test]
    fn test_to_str_folds_profiles() {
        assert_eq!(access_to_str(PROFILE_FULL), "full");
        assert_eq!(access_to_str(PROFILE_READ), "read");
        assert_eq!(
            access_to_str(ACCESS_SHOW | ACCESS_COUNT | ACCESS_INSERT),
            "count, insert and show"
        );
        assert_eq!(access_to_str(0), "no access");
        assert_eq!(access_to_str(ACCESS_GRANT), "grant");
    }

    #[test]
    fn test_from_str() {
        assert_eq!(access_from_str("insert"), ACCESS_INSERT);
        assert_eq!(access_from_str("full"), PROFILE_FULL);
        assert_eq!(access_from_str("bogus"), 0);
    }
}
