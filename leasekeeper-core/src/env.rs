//! convenience fns for parsing env vars
use anyhow::Context;

use std::{env, str};

/// Returns the value of the environment variable with the given key. If it
/// doesn't exist, returns `default` Casts the value to the type of `default`
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Returns the value of the environment variable with the given key, or None if
/// it doesn't exist or is empty.
pub fn parse_var_opt<T>(name: &str) -> Option<T>
where
    T: str::FromStr,
{
    let val = env::var(name).ok()?;
    if val.trim().is_empty() {
        return None;
    }
    val.trim().parse::<T>().ok()
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

/// Returns a whitespace separated env var as a list, None if it is unset or
/// blank
pub fn parse_list(name: &str) -> Option<Vec<String>> {
    let val = env::var(name).ok()?;
    let list = val
        .split_whitespace()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if list.is_empty() { None } else { Some(list) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var_default() {
        let val: u32 = parse_var("LEASEKEEPER_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(val, 42);
        assert!(parse_var_opt::<u32>("LEASEKEEPER_TEST_UNSET_VAR").is_none());
    }

    #[test]
    fn test_parse_list() {
        // SAFETY: the var name is unique to this test
        unsafe { env::set_var("LEASEKEEPER_TEST_LIST", " vcenter-1.ci  vcenter-2.ci ") };
        assert_eq!(
            parse_list("LEASEKEEPER_TEST_LIST"),
            Some(vec!["vcenter-1.ci".to_owned(), "vcenter-2.ci".to_owned()])
        );
        unsafe { env::set_var("LEASEKEEPER_TEST_LIST", "   ") };
        assert_eq!(parse_list("LEASEKEEPER_TEST_LIST"), None);
        unsafe { env::remove_var("LEASEKEEPER_TEST_LIST") };
    }

    #[test]
    fn test_parse_var_with_err() {
        // SAFETY: the var name is unique to this test
        unsafe { env::set_var("LEASEKEEPER_TEST_BAD_NUM", "abc") };
        let err = parse_var_with_err::<u32, _>("LEASEKEEPER_TEST_BAD_NUM", 1).unwrap_err();
        assert!(err.to_string().contains("LEASEKEEPER_TEST_BAD_NUM"));
        unsafe { env::remove_var("LEASEKEEPER_TEST_BAD_NUM") };
    }
}
