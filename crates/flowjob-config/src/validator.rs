//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::{Config, StoreBackend};

/// Longest accepted lock. Lock expiry is added to wall-clock time on every cycle.
pub const MAX_LOCK_DURATION_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Turn the first error into a [`ConfigError`], keeping warnings for the caller.
    pub fn into_result(self) -> Result<Vec<ValidationWarning>, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(ConfigError::InvalidValue {
                field: error.path,
                message: error.message,
            }),
            None => Ok(self.warnings),
        }
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_executor(config, &mut result);
        Self::validate_lock_duration(config, &mut result);
        Self::validate_store(config, &mut result);
        Self::validate_logging(config, &mut result);

        Ok(result)
    }

    fn validate_executor(config: &Config, result: &mut ValidationResult) {
        let executor = &config.executor;

        if executor.queue_capacity == 0 {
            result.add_error(ValidationError::new(
                "executor.queue_capacity",
                "queue_capacity must be greater than 0",
            ));
        }

        if executor.workers == 0 {
            result.add_error(ValidationError::new(
                "executor.workers",
                "workers must be greater than 0",
            ));
        }

        if executor.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "executor.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if executor.default_retries == 0 {
            result.add_warning(ValidationWarning::new(
                "executor.default_retries",
                "default_retries is 0, new jobs are dead-lettered on their first failure",
            ));
        }

        if let Some(node_id) = &executor.node_id {
            if node_id.trim().is_empty() {
                result.add_error(ValidationError::new(
                    "executor.node_id",
                    "node_id cannot be blank",
                ));
            }
        }

        if executor.backoff.max_delay_ms < executor.backoff.increment_ms {
            result.add_warning(ValidationWarning::new(
                "executor.backoff.max_delay_ms",
                "max_delay_ms is below increment_ms, every retry is capped at max_delay_ms",
            ));
        }
    }

    /// A lock that expires while its job is still queued lets a second node
    /// run the same job concurrently.
    fn validate_lock_duration(config: &Config, result: &mut ValidationResult) {
        let executor = &config.executor;

        if executor.lock_duration_ms == 0 {
            result.add_error(ValidationError::new(
                "executor.lock_duration_ms",
                "lock_duration_ms must be greater than 0",
            ));
            return;
        }

        if executor.lock_duration_ms > MAX_LOCK_DURATION_MS {
            result.add_error(ValidationError::new(
                "executor.lock_duration_ms",
                format!(
                    "lock_duration_ms must not exceed {} (30 days)",
                    MAX_LOCK_DURATION_MS
                ),
            ));
            return;
        }

        if executor.lock_duration_ms <= executor.poll_interval_ms {
            result.add_warning(ValidationWarning::new(
                "executor.lock_duration_ms",
                "lock_duration_ms should be longer than poll_interval_ms",
            ));
        }

        let worst_case = executor.worst_case_lock_hold();
        if executor.lock_duration() < worst_case {
            result.add_warning(ValidationWarning::new(
                "executor.lock_duration_ms",
                format!(
                    "lock_duration_ms ({}) is shorter than the worst case queue wait plus runtime ({} ms); \
                     locks may expire before their jobs finish",
                    executor.lock_duration_ms,
                    worst_case.as_millis()
                ),
            ));
        }
    }

    fn validate_store(config: &Config, result: &mut ValidationResult) {
        if config.store.backend == StoreBackend::Sqlite {
            match &config.store.path {
                None => result.add_error(ValidationError::new(
                    "store.path",
                    "sqlite backend requires a database path",
                )),
                Some(path) if path.trim().is_empty() => result.add_error(ValidationError::new(
                    "store.path",
                    "database path cannot be empty",
                )),
                Some(_) => {}
            }
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        if config.logging.level.trim().is_empty() {
            result.add_error(ValidationError::new(
                "logging.level",
                "log level cannot be empty",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
