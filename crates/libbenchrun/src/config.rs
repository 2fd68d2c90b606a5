//! Flat key/value run configuration
//!
//! A run is configured with `--<key> <value>` pairs. A handful of keys are
//! read by the engine itself (see the `keys` module); everything else is
//! passed through to the workload untouched.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{BenchError, Result};

/// Keys interpreted by the engine
pub mod keys {
    /// Workload name
    pub const BENCH: &str = "bench";
    /// Reporter interval in seconds
    pub const REPORT: &str = "report";
    /// Destination of the file sink; absent disables it
    pub const REPORT_FILE: &str = "reportfile";
    /// `host:port` of the telemetry collector; absent disables the telemetry sink
    pub const TELEMETRY: &str = "telemetry";
    /// Extra tag appended to every telemetry record
    pub const TELEMETRY_TAG: &str = "telemetrytag";
    /// When reporters are stopped: `first` or `last` agent to finish
    pub const STOP_REPORTERS: &str = "stopreporters";
    /// Path of the JSON outcome report
    pub const JSON_REPORT: &str = "jsonreport";
    /// Disable the console sink
    pub const QUIET: &str = "quiet";
}

/// Default reporter interval
pub const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;

/// Immutable run configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    values: BTreeMap<String, String>,
}

/// Result of parsing the command line
#[derive(Debug, Clone)]
pub struct ParsedArgs {
    pub config: Configuration,
    /// `--help` was present
    pub help: bool,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Parse `--<key> <value>` pairs.
    ///
    /// `--help` is a bare flag. Tokens that do not start with `--` and are
    /// not the value of a preceding key are ignored.
    pub fn from_args<I, S>(args: I) -> Result<ParsedArgs>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::from_args_with(ConfigurationBuilder::default(), args)
    }

    /// Same as [`Configuration::from_args`], layering the pairs over `base`
    pub fn from_args_with<I, S>(base: ConfigurationBuilder, args: I) -> Result<ParsedArgs>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        debug!("Parsing command line options");
        let mut builder = base;
        let mut help = false;
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            let arg = arg.as_ref();
            if arg == "--help" {
                help = true;
                continue;
            }
            let Some(key) = arg.strip_prefix("--") else {
                continue;
            };
            if key.is_empty() {
                return Err(BenchError::Config("empty option name '--'".to_string()));
            }
            match iter.next() {
                Some(value) => builder = builder.set(key, value.as_ref()),
                None => {
                    return Err(BenchError::Config(format!(
                        "--{} must have an argument",
                        key
                    )))
                }
            }
        }

        Ok(ParsedArgs {
            config: builder.build(),
            help,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value of `key`, treating an empty string as absent
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Parse the value of `key`; a malformed value is a configuration error
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                BenchError::Config(format!("invalid value '{}' for option --{}", raw, key))
            }),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get_parsed(key)
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> Result<u64> {
        Ok(self.get_u64(key)?.unwrap_or(default))
    }

    pub fn get_usize_or(&self, key: &str, default: usize) -> Result<usize> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                _ => Err(BenchError::Config(format!(
                    "invalid value '{}' for option --{} (expected true or false)",
                    raw, key
                ))),
            },
        }
    }

    /// Workload name given with `--bench`
    pub fn bench(&self) -> Option<&str> {
        self.get_non_empty(keys::BENCH)
    }

    /// Reporter sampling interval
    pub fn report_interval(&self) -> Result<Duration> {
        let secs = self.get_u64_or(keys::REPORT, DEFAULT_REPORT_INTERVAL_SECS)?;
        if secs == 0 {
            return Err(BenchError::Config(
                "--report must be at least one second".to_string(),
            ));
        }
        Ok(Duration::from_secs(secs))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Mutable staging area for a [`Configuration`]
#[derive(Debug, Clone, Default)]
pub struct ConfigurationBuilder {
    values: BTreeMap<String, String>,
}

impl ConfigurationBuilder {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Load a flat TOML table of scalars; later `set` calls override it
    pub fn load_toml(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        self.merge_toml_str(&content)
    }

    pub fn merge_toml_str(mut self, content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        for (key, value) in table {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(BenchError::Config(format!(
                        "option '{}' must be a scalar, found {}",
                        key,
                        other.type_str()
                    )))
                }
            };
            self.values.insert(key, value);
        }
        Ok(self)
    }

    pub fn build(self) -> Configuration {
        Configuration {
            values: self.values,
        }
    }
}
