//! Configuration validation.

use crate::config::Config;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Validate the configuration.
///
/// Checks for:
/// - A known log level
/// - A non-empty response body
///
/// A zero shutdown timeout is allowed and means "do not wait at all".
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    let level = config.global.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(format!(
            "unknown log level '{}' (expected one of: {})",
            config.global.log_level,
            LOG_LEVELS.join(", ")
        ));
    }

    if config.server.body.is_empty() {
        errors.push("server body cannot be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
