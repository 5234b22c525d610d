//! Runtime configuration, read once from the environment at init.

use std::{env, path::PathBuf};

use crate::{
    diag::Format,
    error::ConfigError,
    usm::DEFAULT_FREED_RETENTION,
    verify::Severity,
};

pub const PRINT_FORMAT: &str = "SYCL_TRACE_PRINT_FORMAT";
pub const TERMINATE_ON_WARNING: &str = "SYCL_TRACE_TERMINATE_ON_WARNING";
pub const TERMINATE_ON_ERROR: &str = "SYCL_TRACE_TERMINATE_ON_ERROR";
pub const FREED_RETENTION: &str = "SYCL_TRACE_FREED_RETENTION";
pub const PI_CATALOG: &str = "SYCL_TRACE_PI_CATALOG";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub format: Format,
    /// Lowest severity of a memory-safety finding that terminates the
    /// process. `None` reports and continues.
    pub terminate_at: Option<Severity>,
    pub freed_retention: usize,
    /// Replaces the built-in function catalog
    pub catalog_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            format: Format::Text,
            terminate_at: None,
            freed_retention: DEFAULT_FREED_RETENTION,
            catalog_path: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build a configuration from any variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |var: &str| lookup(var).is_some_and(|value| is_truthy(&value));

        let terminate_at = if flag(TERMINATE_ON_WARNING) {
            Some(Severity::Warning)
        } else if flag(TERMINATE_ON_ERROR) {
            Some(Severity::Error)
        } else {
            None
        };

        let freed_retention = match lookup(FREED_RETENTION) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: FREED_RETENTION,
                    value,
                })?,
            None => DEFAULT_FREED_RETENTION,
        };

        Ok(Self {
            format: lookup(PRINT_FORMAT)
                .map(|selector| Format::from_selector(&selector))
                .unwrap_or_default(),
            terminate_at,
            freed_retention,
            catalog_path: lookup(PI_CATALOG)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }
}

/// Non-empty, and not one of `0`, `false`, `off`, `no`
pub fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty()
        && !["0", "false", "off", "no"]
            .iter()
            .any(|falsy| value.eq_ignore_ascii_case(falsy))
}
