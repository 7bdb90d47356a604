//! Environment variable parsing with type safety.
//!
//! Provides a parser for `CTLCHECK_*` variables that collects every invalid
//! value instead of stopping at the first, so a misconfigured run reports all
//! of its problems together.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a new parser with the CTLCHECK_ prefix.
    pub fn new() -> Self {
        Self::with_prefix("CTLCHECK_")
    }

    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Take ownership of errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Get the full variable name with prefix.
    pub fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if !value.trim().is_empty() => Some((var_name, value.trim().to_string())),
            _ => None,
        }
    }

    /// Get an optional string (None if not set or empty).
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, value)| value)
    }

    /// Get an optional path with `~/` expanded against `HOME`.
    pub fn get_optional_path(&mut self, name: &str) -> Option<PathBuf> {
        self.raw(name).map(|(_, value)| expand_home(&value))
    }

    /// Get an optional duration. Accepts humantime forms (`500ms`, `2m`,
    /// `1h 30s`) and bare integers, which are read as seconds.
    pub fn get_optional_duration(&mut self, name: &str) -> Option<Duration> {
        let (var, value) = self.raw(name)?;
        match parse_duration(&value) {
            Some(duration) => Some(duration),
            None => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                None
            }
        }
    }

    /// Get an optional u32 with range validation.
    pub fn get_optional_u32_range(&mut self, name: &str, min: u32, max: u32) -> Option<u32> {
        let (var, value) = self.raw(name)?;
        match value.parse::<u32>() {
            Ok(n) if (min..=max).contains(&n) => Some(n),
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
                    expected: "unsigned 32-bit integer".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Get a comma-separated list of `KEY=VALUE` pairs.
    pub fn get_key_values(&mut self, name: &str) -> Vec<(String, String)> {
        let Some((var, value)) = self.raw(name) else {
            return Vec::new();
        };
        let mut pairs = Vec::new();
        for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match item.split_once('=') {
                Some((key, val)) if !key.trim().is_empty() => {
                    pairs.push((key.trim().to_string(), val.trim().to_string()));
                }
                _ => self.errors.push(EnvError::InvalidValue {
                    var: var.clone(),
                    expected: "comma-separated KEY=VALUE pairs".to_string(),
                    value: item.to_string(),
                }),
            }
        }
        pairs
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a duration: humantime syntax, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).ok()
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(value),
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: env-mutating tests are serialized with #[serial]
        unsafe { env::set_var(key, value) };
    }

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env-mutating tests are serialized with #[serial]
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_all_collected() {
        set_env("CTLCHECK_TEST_DURATION", "whenever");
        set_env("CTLCHECK_TEST_ATTEMPTS", "500");
        let mut parser = EnvParser::new();

        assert_eq!(parser.get_optional_duration("TEST_DURATION"), None);
        assert_eq!(parser.get_optional_u32_range("TEST_ATTEMPTS", 1, 100), None);
        assert_eq!(parser.errors().len(), 2);
        assert!(matches!(
            parser.errors()[0],
            EnvError::InvalidDuration { .. }
        ));
        assert!(matches!(parser.errors()[1], EnvError::OutOfRange { .. }));

        cleanup_env(&["CTLCHECK_TEST_DURATION", "CTLCHECK_TEST_ATTEMPTS"]);
    }

    #[test]
    #[serial]
    fn test_empty_value_is_unset() {
        set_env("CTLCHECK_TEST_HOST", "   ");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_optional_string("TEST_HOST"), None);
        assert!(!parser.has_errors());
        cleanup_env(&["CTLCHECK_TEST_HOST"]);
    }

    #[test]
    #[serial]
    fn test_key_values() {
        set_env("CTLCHECK_TEST_ENV", "A=1, B = two ,broken");
        let mut parser = EnvParser::new();
        let pairs = parser.get_key_values("TEST_ENV");
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two".to_string())
            ]
        );
        assert_eq!(parser.take_errors().len(), 1);
        assert!(!parser.has_errors());
        cleanup_env(&["CTLCHECK_TEST_ENV"]);
    }
}
