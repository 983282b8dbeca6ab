//! # flowjob Config
//!
//! Configuration management for the flowjob asynchronous job executor.
//!
//! Configuration is read from TOML with `${VAR}` environment substitution and
//! checked by [`ConfigValidator`] before an executor is built from it.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{
    ConfigValidator, ValidationError, ValidationResult, ValidationWarning, MAX_LOCK_DURATION_MS,
};
