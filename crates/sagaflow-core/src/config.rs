// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// Default step timeout when neither the step nor the workflow sets one.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of reload-and-retry rounds on a storage write conflict.
pub const DEFAULT_CONFLICT_RETRY_LIMIT: u32 = 16;

/// Sagaflow engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Step timeout used when neither the step nor its workflow sets one.
    pub default_step_timeout: Duration,
    /// Reload-and-retry rounds on storage conflict before giving up.
    pub conflict_retry_limit: u32,
    /// Whether [`WorkflowEngine::start`](crate::engine::WorkflowEngine::start) runs the recovery sweep.
    pub recover_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            conflict_retry_limit: DEFAULT_CONFLICT_RETRY_LIMIT,
            recover_on_start: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS`: fallback step timeout (default: 30000)
    /// - `SAGAFLOW_CONFLICT_RETRY_LIMIT`: conflict reload rounds (default: 16)
    /// - `SAGAFLOW_RECOVER_ON_START`: run recovery on start (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let step_timeout_ms: u64 = std::env::var("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS")
            .unwrap_or_else(|_| DEFAULT_STEP_TIMEOUT.as_millis().to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS",
                    "must be a non-negative integer",
                )
            })?;
        if step_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        let conflict_retry_limit: u32 = std::env::var("SAGAFLOW_CONFLICT_RETRY_LIMIT")
            .unwrap_or_else(|_| DEFAULT_CONFLICT_RETRY_LIMIT.to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SAGAFLOW_CONFLICT_RETRY_LIMIT",
                    "must be a non-negative integer",
                )
            })?;

        let recover_on_start = match std::env::var("SAGAFLOW_RECOVER_ON_START") {
            Ok(v) => match v.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "SAGAFLOW_RECOVER_ON_START",
                        "must be true/false or 1/0",
                    ));
                }
            },
            Err(_) => true,
        };

        Ok(Self {
            default_step_timeout: Duration::from_millis(step_timeout_ms),
            conflict_retry_limit,
            recover_on_start,
        })
    }

    /// Set the fallback step timeout.
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Set the conflict retry limit.
    pub fn with_conflict_retry_limit(mut self, limit: u32) -> Self {
        self.conflict_retry_limit = limit;
        self
    }

    /// Enable or disable the recovery sweep on start.
    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        guard.remove("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS");
        guard.remove("SAGAFLOW_CONFLICT_RETRY_LIMIT");
        guard.remove("SAGAFLOW_RECOVER_ON_START");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.default_step_timeout, Duration::from_secs(30));
        assert_eq!(config.conflict_retry_limit, 16);
        assert!(config.recover_on_start);
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS", "1500");
        guard.set("SAGAFLOW_CONFLICT_RETRY_LIMIT", "3");
        guard.set("SAGAFLOW_RECOVER_ON_START", "0");

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.default_step_timeout, Duration::from_millis(1500));
        assert_eq!(config.conflict_retry_limit, 3);
        assert!(!config.recover_on_start);
    }

    #[test]
    fn test_config_invalid_step_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS", "soon");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS", _)
        ));
    }

    #[test]
    fn test_config_zero_step_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS", "0");

        assert!(EngineConfig::from_env().is_err());
    }

    #[test]
    fn test_config_negative_retry_limit_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SAGAFLOW_CONFLICT_RETRY_LIMIT", "-1");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("SAGAFLOW_CONFLICT_RETRY_LIMIT", _)
        ));
    }

    #[test]
    fn test_config_invalid_recover_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);
        guard.set("SAGAFLOW_RECOVER_ON_START", "maybe");

        assert!(EngineConfig::from_env().is_err());
    }

    #[test]
    fn test_builder_pattern() {
        let config = EngineConfig::default()
            .with_default_step_timeout(Duration::from_millis(200))
            .with_conflict_retry_limit(2)
            .with_recover_on_start(false);

        assert_eq!(config.default_step_timeout, Duration::from_millis(200));
        assert_eq!(config.conflict_retry_limit, 2);
        assert!(!config.recover_on_start);
    }

    #[test]
    fn test_config_error_display() {
        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
