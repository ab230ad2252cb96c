//! Configuration loader with TOML parsing and environment variable overrides

use super::schema::TallyConfig;
use super::secret_string;
use crate::domain::errors::TallyError;
use crate::domain::result::Result;
use regex::Regex;
use std::fs;
use std::path::Path;

/// Loads configuration from a TOML file
///
/// This function:
/// 1. Reads the TOML file
/// 2. Performs environment variable substitution (${VAR} syntax)
/// 3. Parses the TOML into TallyConfig
/// 4. Applies environment variable overrides (TALLY_* prefix)
/// 5. Validates the configuration
///
/// # Errors
///
/// Returns a configuration error if the file cannot be read or parsed, a
/// referenced variable is unset, an override does not parse, or validation
/// fails.
///
/// # Examples
///
/// ```no_run
/// use tally::config::loader::load_config;
///
/// let config = load_config("tally.toml").expect("Failed to load config");
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TallyConfig> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(TallyError::Configuration(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        TallyError::Configuration(format!(
            "Failed to read configuration file {}: {}",
            path.display(),
            e
        ))
    })?;

    let contents = substitute_env_vars(&contents)?;

    let mut config: TallyConfig = toml::from_str(&contents)
        .map_err(|e| TallyError::Configuration(format!("Failed to parse TOML: {e}")))?;

    apply_env_overrides(&mut config)?;

    config.validate().map_err(|e| {
        TallyError::Configuration(format!("Configuration validation failed: {e}"))
    })?;

    Ok(config)
}

/// Substitutes environment variables in the format ${VAR_NAME}
///
/// Comment lines are left untouched.
///
/// # Errors
///
/// Returns an error listing every referenced variable that is not set
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| TallyError::Other(format!("Invalid substitution pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());
    let mut missing_vars: Vec<String> = Vec::new();

    for line in input.lines() {
        if line.trim_start().starts_with('#') {
            result.push_str(line);
            result.push('\n');
            continue;
        }

        let processed = re.replace_all(line, |caps: &regex::Captures<'_>| {
            let var_name = &caps[1];
            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    if !missing_vars.iter().any(|v| v == var_name) {
                        missing_vars.push(var_name.to_string());
                    }
                    String::new()
                }
            }
        });
        result.push_str(&processed);
        result.push('\n');
    }

    if !missing_vars.is_empty() {
        return Err(TallyError::Configuration(format!(
            "Missing required environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()> {
    if let Ok(val) = std::env::var(name) {
        *target = val.trim().parse().map_err(|_| {
            TallyError::Configuration(format!("Invalid value '{val}' for {name}"))
        })?;
    }
    Ok(())
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(val) = std::env::var(name) {
        *target = val;
    }
}

/// Applies environment variable overrides using TALLY_* prefix
///
/// Environment variables follow the pattern: TALLY_<SECTION>_<KEY>
/// For example: TALLY_DATABASE_SCHEMA, TALLY_DAEMON_CONCURRENCY
fn apply_env_overrides(config: &mut TallyConfig) -> Result<()> {
    env_string("TALLY_APPLICATION_LOG_LEVEL", &mut config.application.log_level);

    // Database overrides
    if let Ok(val) = std::env::var("TALLY_DATABASE_CONNECTION_STRING") {
        config.database.connection_string = secret_string(val);
    }
    env_string("TALLY_DATABASE_SCHEMA", &mut config.database.schema);
    env_parse("TALLY_DATABASE_MAX_CONNECTIONS", &mut config.database.max_connections)?;
    env_parse(
        "TALLY_DATABASE_STATEMENT_TIMEOUT_SECONDS",
        &mut config.database.statement_timeout_seconds,
    )?;
    env_string("TALLY_DATABASE_SSL_MODE", &mut config.database.ssl_mode);

    // Broker overrides
    env_string("TALLY_BROKER_BASE_URL", &mut config.broker.base_url);
    env_string("TALLY_BROKER_USERNAME", &mut config.broker.username);
    if let Ok(val) = std::env::var("TALLY_BROKER_PASSWORD") {
        config.broker.password = secret_string(val);
    }
    env_string("TALLY_BROKER_COLLECTION_ID", &mut config.broker.collection_id);
    if let Ok(val) = std::env::var("TALLY_BROKER_TASK_TYPE") {
        config.broker.task_type = if val.trim().is_empty() { None } else { Some(val) };
    }
    env_parse(
        "TALLY_BROKER_POLLING_INTERVAL_MS",
        &mut config.broker.polling_interval_ms,
    )?;

    // Daemon overrides
    env_parse("TALLY_DAEMON_CONCURRENCY", &mut config.daemon.concurrency)?;
    env_parse(
        "TALLY_DAEMON_TASK_TIMEOUT_SECONDS",
        &mut config.daemon.task_timeout_seconds,
    )?;
    env_parse(
        "TALLY_DAEMON_EXECUTION_MAX_ATTEMPTS",
        &mut config.daemon.execution_retry.max_attempts,
    )?;
    env_parse(
        "TALLY_DAEMON_PUBLISH_MAX_ATTEMPTS",
        &mut config.daemon.publish_retry.max_attempts,
    )?;

    // Disclosure overrides
    env_parse("TALLY_DISCLOSURE_THRESHOLD", &mut config.disclosure.threshold)?;
    env_parse("TALLY_DISCLOSURE_ROUNDING", &mut config.disclosure.rounding)?;

    // Logging overrides
    env_parse("TALLY_LOGGING_LOCAL_ENABLED", &mut config.logging.local_enabled)?;
    env_string("TALLY_LOGGING_LOCAL_PATH", &mut config.logging.local_path);

    Ok(())
}
