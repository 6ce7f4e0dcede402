//! Dispatch configuration.
//!
//! Two option blocks are consumed by the dispatchers: validation toggles and
//! caching toggles. They are read once per dispatch call from a process-wide
//! [`SharedOptions`] handle; updating them after startup is allowed but an
//! in-flight dispatch keeps the snapshot it started with.
//!
//! Options can be loaded from the environment:
//!
//! | variable                             | field                                          |
//! |--------------------------------------|------------------------------------------------|
//! | `MERIDIAN_VALIDATE_COMMANDS`         | `validation.commands_enabled`                  |
//! | `MERIDIAN_VALIDATE_QUERIES`          | `validation.queries_enabled`                   |
//! | `MERIDIAN_CACHE_ENABLED`             | `caching.enabled`                              |
//! | `MERIDIAN_CACHE_DYNAMIC_EXPRESSIONS` | `caching.dynamic_expression_caching_enabled`   |

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_VALIDATE_COMMANDS: &str = "MERIDIAN_VALIDATE_COMMANDS";
pub const ENV_VALIDATE_QUERIES: &str = "MERIDIAN_VALIDATE_QUERIES";
pub const ENV_CACHE_ENABLED: &str = "MERIDIAN_CACHE_ENABLED";
pub const ENV_CACHE_DYNAMIC_EXPRESSIONS: &str = "MERIDIAN_CACHE_DYNAMIC_EXPRESSIONS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid boolean for {var}: '{value}'")]
    InvalidBool { var: String, value: String },
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    pub commands_enabled: bool,
    pub queries_enabled: bool,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingOptions {
    pub enabled: bool,
    /// Carried for query-translation backends that memoize compiled query
    /// expressions; the dispatchers only pass it through.
    pub dynamic_expression_caching_enabled: bool,
}

/// Every toggle the dispatchers read. Defaults to everything disabled.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchOptions {
    pub validation: ValidationOptions,
    pub caching: CachingOptions,
}

impl DispatchOptions {
    /// Load from `MERIDIAN_*` environment variables; unset variables keep their default.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable lookup (tests, layered config sources).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let flag = |var: &str| -> Result<bool, ConfigError> {
            match lookup(var) {
                Some(value) => parse_bool(var, &value),
                None => Ok(false),
            }
        };

        Ok(Self {
            validation: ValidationOptions {
                commands_enabled: flag(ENV_VALIDATE_COMMANDS)?,
                queries_enabled: flag(ENV_VALIDATE_QUERIES)?,
            },
            caching: CachingOptions {
                enabled: flag(ENV_CACHE_ENABLED)?,
                dynamic_expression_caching_enabled: flag(ENV_CACHE_DYNAMIC_EXPRESSIONS)?,
            },
        })
    }

    pub fn with_command_validation(mut self, enabled: bool) -> Self {
        self.validation.commands_enabled = enabled;
        self
    }

    pub fn with_query_validation(mut self, enabled: bool) -> Self {
        self.validation.queries_enabled = enabled;
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.caching.enabled = enabled;
        self
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Process-wide, cheaply cloneable handle to the current [`DispatchOptions`].
#[derive(Debug, Clone, Default)]
pub struct SharedOptions {
    inner: Arc<RwLock<DispatchOptions>>,
}

impl SharedOptions {
    pub fn new(options: DispatchOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(options)),
        }
    }

    /// Copy of the current options; taken once per dispatch call.
    pub fn snapshot(&self) -> DispatchOptions {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, f: impl FnOnce(&mut DispatchOptions)) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

impl From<DispatchOptions> for SharedOptions {
    fn from(value: DispatchOptions) -> Self {
        Self::new(value)
    }
}
