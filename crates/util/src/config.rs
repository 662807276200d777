use std::{env, fmt};

use super::database_url;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub environment: Environment,
    /// IANA timezone used when stamping the program year onto case ids.
    pub agency_timezone: String,
    /// When `true`, the deriver only opens cases for identities carrying at
    /// least one eligibility signal.
    pub case_require_signal: bool,
    /// Hours a terminal import job stays queryable before the expiry sweep
    /// removes it.
    pub job_ttl_hours: i64,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let agency_timezone = env::var("AGENCY_TIMEZONE").unwrap_or_else(|_| "UTC".to_string());
        let case_require_signal = read_bool("CASE_REQUIRE_SIGNAL", true)?;
        let job_ttl_hours = read_hours("JOB_TTL_HOURS", 24)?;

        Ok(Self {
            database_url: database_url(),
            environment,
            agency_timezone,
            case_require_signal,
            job_ttl_hours,
        })
    }
}

fn read_bool(var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => match value.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidBool { var, value }),
        },
    }
}

fn read_hours(var: &'static str, default: i64) -> Result<i64, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => match value.parse::<i64>() {
            Ok(hours) if hours > 0 => Ok(hours),
            _ => Err(ConfigError::InvalidHours { var, value }),
        },
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    InvalidBool { var: &'static str, value: String },
    InvalidHours { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::InvalidBool { var, value } => {
                write!(f, "{var} must be 'true' or 'false' (got {value})")
            }
            Self::InvalidHours { var, value } => {
                write!(f, "{var} must be a positive number of hours (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
