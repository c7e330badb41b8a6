use std::path::Path;

use crate::config::schema::{ServiceConfig, DEFAULT_WORKER_COUNT};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Environment variable overriding `worker_count`.
pub const WORKER_CONCURRENCY_ENV: &str = "UNMARK_WORKER_CONCURRENCY";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<ServiceConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let mut config: ServiceConfig = serde_json::from_value(json_value)?;

    apply_env_overrides(&mut config);

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Applies environment overrides on top of the file values.
pub fn apply_env_overrides(config: &mut ServiceConfig) {
    if let Ok(raw) = std::env::var(WORKER_CONCURRENCY_ENV) {
        config.worker_count = parse_worker_concurrency(&raw);
    }
}

/// Parses a worker count override. Garbage falls back to the default with a
/// warning; anything below 1 is raised to 1.
pub fn parse_worker_concurrency(raw: &str) -> usize {
    match raw.trim().parse::<i64>() {
        Ok(n) if n < 1 => 1,
        Ok(n) => usize::try_from(n).unwrap_or(DEFAULT_WORKER_COUNT),
        Err(_) => {
            tracing::warn!(
                "Invalid {} value '{}', using {}",
                WORKER_CONCURRENCY_ENV,
                raw,
                DEFAULT_WORKER_COUNT
            );
            DEFAULT_WORKER_COUNT
        }
    }
}

fn validate_config(config: &ServiceConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }

    if config.batch.concurrency_limit == 0 {
        return Err(ConfigError::Validation {
            message: "batch.concurrency_limit must be at least 1".to_string(),
        });
    }

    let retry = &config.finalize_retry;
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "finalize_retry.max_delay_ms ({}) is below base_delay_ms ({})",
                retry.max_delay_ms, retry.base_delay_ms
            ),
        });
    }

    if let Some(ref transform) = config.transform {
        if transform.program.trim().is_empty() {
            return Err(ConfigError::Validation {
                message: "transform.program must not be empty".to_string(),
            });
        }
    }

    Ok(())
}
