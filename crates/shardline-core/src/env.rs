//! Environment variable utilities
//!
//! Generic `env_get<T>` function for parsing environment variables with defaults.
//!
//! # Usage
//!
//! ```ignore
//! use shardline_core::env::{env_get, env_get_bool};
//!
//! let threads: usize = env_get("SHARDLINE_IO_THREADS", 4);
//! let timeout: u64 = env_get("SHARDLINE_POLL_TIMEOUT_MS", 50);
//!
//! // Boolean helper (accepts "1", "true", "yes", "on")
//! let nodelay: bool = env_get_bool("SHARDLINE_NODELAY", true);
//! ```

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Works with any type that implements `FromStr`. A value that fails to
/// parse is treated as unset.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts: "1", "true", "yes", "on" (case-insensitive) as true.
/// Any other value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
///
/// Returns `Some(T)` if the variable is set and parses successfully,
/// `None` otherwise.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SHARDLINE_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__SHARDLINE_TEST_UNSET__", true));
        assert_eq!(env_get_opt::<u16>("__SHARDLINE_TEST_UNSET__"), None);
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__SHARDLINE_TEST_NUM__", " 123 ");
        let val: usize = env_get("__SHARDLINE_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__SHARDLINE_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        for v in ["1", "true", "TRUE", "yes", "on"] {
            std::env::set_var("__SHARDLINE_TEST_BOOL__", v);
            assert!(env_get_bool("__SHARDLINE_TEST_BOOL__", false), "{}", v);
        }
        for v in ["0", "false", "garbage"] {
            std::env::set_var("__SHARDLINE_TEST_BOOL__", v);
            assert!(!env_get_bool("__SHARDLINE_TEST_BOOL__", true), "{}", v);
        }
        std::env::remove_var("__SHARDLINE_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__SHARDLINE_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__SHARDLINE_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__SHARDLINE_TEST_INVALID__");
    }
}
