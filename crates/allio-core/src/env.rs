//! Environment variable helpers used by configuration and logging.
//!
//! ```ignore
//! use allio_core::env::{env_get, env_get_bool};
//!
//! let sq: u32 = env_get("ALLIO_SQ_ENTRIES", 256);
//! let flush = env_get_bool("ALLIO_FLUSH_EPRINT", false);
//! ```
//!
//! Unset variables and values that fail to parse both fall back to the
//! default; configuration never fails because of the environment.

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if set and valid.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag. "1", "true", "yes", "on" (any case) are true, "0",
/// "false", "no", "off" are false, anything else yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__ALLIO_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        let val: Option<u32> = env_get_opt("__ALLIO_TEST_UNSET__");
        assert!(val.is_none());
        assert_eq!(env_get_str("__ALLIO_TEST_UNSET__", "auto"), "auto");
        assert!(!env_is_set("__ALLIO_TEST_UNSET__"));
    }

    #[test]
    fn test_env_get_parses_trimmed() {
        std::env::set_var("__ALLIO_TEST_NUM__", " 512 ");
        let val: u32 = env_get("__ALLIO_TEST_NUM__", 0);
        assert_eq!(val, 512);
        std::env::set_var("__ALLIO_TEST_NUM__", "lots");
        let val: u32 = env_get("__ALLIO_TEST_NUM__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__ALLIO_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for (raw, expected) in [("1", true), ("YES", true), ("on", true), ("0", false), ("Off", false)] {
            std::env::set_var("__ALLIO_TEST_BOOL__", raw);
            assert_eq!(env_get_bool("__ALLIO_TEST_BOOL__", !expected), expected, "{}", raw);
        }
        std::env::set_var("__ALLIO_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__ALLIO_TEST_BOOL__", true));
        assert!(!env_get_bool("__ALLIO_TEST_BOOL__", false));
        std::env::remove_var("__ALLIO_TEST_BOOL__");
    }
}
