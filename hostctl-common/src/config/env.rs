//! Environment variable overrides.
//!
//! Every getter returns `None` when the variable is unset, so callers only
//! overwrite file values that the environment actually provides. Bad values
//! are collected rather than returned, so all of them can be reported at once.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Reads `HOSTCTL_*` variables.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "HOSTCTL_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Unset and empty both read as `None`.
    pub fn get_string(&mut self, name: &str) -> Option<String> {
        env::var(self.var_name(name)).ok().filter(|v| !v.is_empty())
    }

    /// Accepts 1/true/yes/on and 0/false/no/off, any case.
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "boolean (true/false/1/0/yes/no)".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Parse a number and check it lies in `min..=max`.
    pub fn get_range<T>(&mut self, name: &str, min: T, max: T) -> Option<T>
    where
        T: FromStr + PartialOrd + Display + Copy,
    {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        match value.trim().parse::<T>() {
            Ok(n) if n >= min && n <= max => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: format!("number in {min}..={max}"),
                    value,
                });
                None
            }
        }
    }

    /// Any `FromStr` value; `expected` describes it in the error.
    pub fn get_parsed<T: FromStr>(&mut self, name: &str, expected: &str) -> Option<T> {
        let var = self.var_name(name);
        let value = env::var(&var).ok().filter(|v| !v.is_empty())?;
        match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: expected.to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Lower-cased tracing level.
    pub fn get_log_level(&mut self, name: &str) -> Option<String> {
        let var = self.var_name(name);
        let value = env::var(&var).ok()?;
        let lower = value.to_ascii_lowercase();
        if is_log_level(&lower) {
            return Some(lower);
        }
        self.errors.push(EnvError::InvalidLogLevel { var, value });
        None
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_log_level(level: &str) -> bool {
    matches!(level, "trace" | "debug" | "info" | "warn" | "error" | "off")
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;
    use proptest::prelude::*;

    fn set_env(key: &str, value: &str) {
        // SAFETY: serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn test_unset_reads_none() {
        let _guard = env_test_lock();
        cleanup_env(&["HOSTCTL_TEST_UNSET"]);
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_string("TEST_UNSET"), None);
        assert_eq!(parser.get_bool("TEST_UNSET"), None);
        assert_eq!(parser.get_range::<u16>("TEST_UNSET", 1, 10), None);
        assert!(!parser.has_errors());
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        for (val, expected) in [("1", true), ("YES", true), ("off", false), ("False", false)] {
            set_env("HOSTCTL_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert_eq!(parser.get_bool("TEST_BOOL"), Some(expected), "value '{val}'");
            assert!(!parser.has_errors());
        }
        set_env("HOSTCTL_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_bool("TEST_BOOL"), None);
        assert_eq!(parser.errors().len(), 1);
        cleanup_env(&["HOSTCTL_TEST_BOOL"]);
    }

    #[test]
    fn test_get_range_rejects_out_of_range_and_garbage() {
        let _guard = env_test_lock();
        set_env("HOSTCTL_TEST_PORT", "70000");
        set_env("HOSTCTL_TEST_SECS", "soon");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_range::<u32>("TEST_PORT", 1, 65535), None);
        assert_eq!(parser.get_range::<u64>("TEST_SECS", 1, 3600), None);

        let errors = parser.take_errors();
        assert!(matches!(errors[0], EnvError::OutOfRange { .. }));
        assert!(matches!(errors[1], EnvError::InvalidValue { .. }));
        assert!(!parser.has_errors());
        cleanup_env(&["HOSTCTL_TEST_PORT", "HOSTCTL_TEST_SECS"]);
    }

    #[test]
    fn test_get_log_level_lowercases() {
        let _guard = env_test_lock();
        set_env("HOSTCTL_TEST_LEVEL", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LEVEL").as_deref(), Some("debug"));

        set_env("HOSTCTL_TEST_LEVEL", "chatty");
        assert_eq!(parser.get_log_level("TEST_LEVEL"), None);
        assert!(parser.errors()[0].to_string().contains("HOSTCTL_TEST_LEVEL"));
        cleanup_env(&["HOSTCTL_TEST_LEVEL"]);
    }

    proptest! {
        #[test]
        fn test_is_log_level_accepts_only_known(s in "[a-z]{0,8}") {
            let known = ["trace", "debug", "info", "warn", "error", "off"];
            prop_assert_eq!(is_log_level(&s), known.contains(&s.as_str()));
        }
    }
}
