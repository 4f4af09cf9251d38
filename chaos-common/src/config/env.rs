//! Environment variable parsing with type safety.
//!
//! Every override is optional: an unset variable yields `None` and leaves
//! the file/default value alone. Malformed values are collected rather than
//! aborting the parse, so all problems can be reported at once.

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    /// Parser for `CHAOS_*` variables.
    pub fn new() -> Self {
        Self::with_prefix("CHAOS_")
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

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn raw(&self, name: &str) -> Option<(String, String)> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if !value.trim().is_empty() => Some((var_name, value.trim().to_string())),
            _ => None,
        }
    }

    pub fn get_string(&mut self, name: &str) -> Option<String> {
        self.raw(name).map(|(_, value)| value)
    }

    pub fn get_path(&mut self, name: &str) -> Option<PathBuf> {
        self.raw(name).map(|(_, value)| PathBuf::from(value))
    }

    /// Accepts 1/true/yes/on and 0/false/no/off.
    pub fn get_bool(&mut self, name: &str) -> Option<bool> {
        let (var, value) = self.raw(name)?;
        match value.to_lowercase().as_str() {
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

    pub fn get_f64_range(&mut self, name: &str, min: f64, max: f64) -> Option<f64> {
        let (var, value) = self.raw(name)?;
        match value.parse::<f64>() {
            Ok(v) if v.is_finite() && (min..=max).contains(&v) => Some(v),
            Ok(_) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value,
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "number".to_string(),
                    value,
                });
                None
            }
        }
    }

    /// Humantime duration ("5s", "250ms", "1m 30s").
    pub fn get_duration(&mut self, name: &str) -> Option<Duration> {
        let (var, value) = self.raw(name)?;
        match humantime::parse_duration(&value) {
            Ok(d) => Some(d),
            Err(_) => {
                self.errors.push(EnvError::InvalidDuration { var, value });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own prefix so parallel tests never share variables.
    #[allow(unsafe_code)]
    fn set(var: &str, value: &str) {
        // SAFETY: variables are unique per test via distinct prefixes.
        unsafe { env::set_var(var, value) };
    }

    #[test]
    fn unset_variables_yield_none() {
        let mut parser = EnvParser::with_prefix("CHAOS_TEST_UNSET_");
        assert_eq!(parser.get_string("NOTHING"), None);
        assert_eq!(parser.get_duration("NOTHING"), None);
        assert!(!parser.has_errors());
    }

    #[test]
    fn parses_durations_and_ranges() {
        set("CHAOS_TEST_OK_POLL", "250ms");
        set("CHAOS_TEST_OK_CPU", "72.5");
        set("CHAOS_TEST_OK_FLAG", "yes");
        let mut parser = EnvParser::with_prefix("CHAOS_TEST_OK_");
        assert_eq!(parser.get_duration("POLL"), Some(Duration::from_millis(250)));
        assert_eq!(parser.get_f64_range("CPU", 0.0, 100.0), Some(72.5));
        assert_eq!(parser.get_bool("FLAG"), Some(true));
        assert!(!parser.has_errors());
    }

    #[test]
    fn collects_all_errors() {
        set("CHAOS_TEST_BAD_POLL", "soon");
        set("CHAOS_TEST_BAD_CPU", "140");
        set("CHAOS_TEST_BAD_FLAG", "maybe");
        let mut parser = EnvParser::with_prefix("CHAOS_TEST_BAD_");
        assert_eq!(parser.get_duration("POLL"), None);
        assert_eq!(parser.get_f64_range("CPU", 0.0, 100.0), None);
        assert_eq!(parser.get_bool("FLAG"), None);

        let errors = parser.take_errors();
        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], EnvError::InvalidDuration { .. }));
        assert!(matches!(errors[1], EnvError::OutOfRange { .. }));
        assert!(matches!(errors[2], EnvError::InvalidValue { .. }));
        assert!(!parser.has_errors());
    }
}
