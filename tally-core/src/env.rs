//! convenience fns for parsing env vars
use anyhow::Context;

use std::{env, str};

/// Returns the value of the environment variable with the given key. If it
/// doesn't exist, returns `default`. Casts the value to the type of `default`
/// # Examples
/// ```
/// let retries: u32 = tally_core::env::parse_var("TALLY_DOC_UNSET_RETRIES", 3).unwrap();
/// assert_eq!(retries, 3);
/// ```
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but gives a default error message with the environment
/// variable name in it
///
/// [`parse_var`]: crate::env::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let fmt: String = parse_var("TALLY_TEST_UNSET_LOG_FORMAT", "standard").unwrap();
        assert_eq!(fmt, "standard");
        let timeout: u64 = parse_var_with_err("TALLY_TEST_UNSET_TIMEOUT", 30).unwrap();
        assert_eq!(timeout, 30);
    }

    #[test]
    fn test_parse_error_names_var() {
        let err = parse_var_with_err::<u32, _>("TALLY_TEST_UNSET_THREADS", "many").unwrap_err();
        assert!(err.to_string().contains("TALLY_TEST_UNSET_THREADS"));
    }
}
