//! Server configuration.
//!
//! Loaded from environment variables. The RTC signing secret is the only
//! required value; everything else has a default. The secret is held as a
//! `SecretString` and redacted in `Debug` output.
//!
//! `ENSEMBLE_DIRECTORY` seeds the in-memory project directory a standalone
//! server authorizes against: comma-separated `project:user:role[:name]`
//! entries, where `role` is `admin` or `member`.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ensemble_participant::{CredentialConfig, JoinRequestConfig};
use ensemble_protocol::{ProjectId, UserId};
use ensemble_session::{ProjectRole, StaticDirectory};
use secrecy::{ExposeSecret, SecretString};

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_RTC_TOKEN_TTL_SECONDS: u64 = 3600;
pub const DEFAULT_RTC_PROVIDER_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_JOIN_REQUEST_TTL_SECONDS: u64 = 300;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 60;

/// Shortest RTC secret accepted, in bytes.
pub const MIN_RTC_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// One `ENSEMBLE_DIRECTORY` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub project: ProjectId,
    pub user: UserId,
    pub role: ProjectRole,
    pub name: Option<String>,
}

#[derive(Clone)]
pub struct EnsembleConfig {
    /// `ENSEMBLE_BIND_ADDRESS`.
    pub bind_address: String,

    /// `ENSEMBLE_RTC_SECRET`. Shared with the RTC provider.
    pub rtc_secret: SecretString,

    /// `ENSEMBLE_RTC_TOKEN_TTL_SECONDS`.
    pub rtc_token_ttl_seconds: u64,

    /// `ENSEMBLE_RTC_PROVIDER_TIMEOUT_MS`.
    pub rtc_provider_timeout_ms: u64,

    /// `ENSEMBLE_JOIN_REQUEST_TTL_SECONDS`.
    pub join_request_ttl_seconds: u64,

    /// `ENSEMBLE_SWEEP_INTERVAL_SECONDS`.
    pub sweep_interval_seconds: u64,

    /// `ENSEMBLE_OUTBOX_CAPACITY`. Events queued per connection before it
    /// is cut off.
    pub outbox_capacity: usize,

    /// `ENSEMBLE_IDLE_TIMEOUT_SECONDS`. A connection that sends nothing
    /// for this long is closed.
    pub idle_timeout_seconds: u64,

    /// `ENSEMBLE_LOG_JSON`. Emit logs as JSON lines.
    pub log_json: bool,

    /// `ENSEMBLE_DIRECTORY`. Project memberships and display names.
    pub directory: Vec<DirectoryEntry>,
}

impl fmt::Debug for EnsembleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnsembleConfig")
            .field("bind_address", &self.bind_address)
            .field("rtc_secret", &"[REDACTED]")
            .field("rtc_token_ttl_seconds", &self.rtc_token_ttl_seconds)
            .field("rtc_provider_timeout_ms", &self.rtc_provider_timeout_ms)
            .field("join_request_ttl_seconds", &self.join_request_ttl_seconds)
            .field("sweep_interval_seconds", &self.sweep_interval_seconds)
            .field("outbox_capacity", &self.outbox_capacity)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("log_json", &self.log_json)
            .field("directory", &self.directory.len())
            .finish()
    }
}

impl EnsembleConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let rtc_secret = vars
            .get("ENSEMBLE_RTC_SECRET")
            .ok_or_else(|| ConfigError::MissingVar("ENSEMBLE_RTC_SECRET".to_string()))?;
        if rtc_secret.len() < MIN_RTC_SECRET_LEN {
            return Err(ConfigError::invalid(
                "ENSEMBLE_RTC_SECRET",
                format!("must be at least {MIN_RTC_SECRET_LEN} bytes"),
            ));
        }

        let bind_address = vars
            .get("ENSEMBLE_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let config = Self {
            bind_address,
            rtc_secret: SecretString::from(rtc_secret.clone()),
            rtc_token_ttl_seconds: parse_var(
                vars,
                "ENSEMBLE_RTC_TOKEN_TTL_SECONDS",
                DEFAULT_RTC_TOKEN_TTL_SECONDS,
            )?,
            rtc_provider_timeout_ms: parse_var(
                vars,
                "ENSEMBLE_RTC_PROVIDER_TIMEOUT_MS",
                DEFAULT_RTC_PROVIDER_TIMEOUT_MS,
            )?,
            join_request_ttl_seconds: parse_var(
                vars,
                "ENSEMBLE_JOIN_REQUEST_TTL_SECONDS",
                DEFAULT_JOIN_REQUEST_TTL_SECONDS,
            )?,
            sweep_interval_seconds: parse_var(
                vars,
                "ENSEMBLE_SWEEP_INTERVAL_SECONDS",
                DEFAULT_SWEEP_INTERVAL_SECONDS,
            )?,
            outbox_capacity: parse_var(vars, "ENSEMBLE_OUTBOX_CAPACITY", DEFAULT_OUTBOX_CAPACITY)?,
            idle_timeout_seconds: parse_var(
                vars,
                "ENSEMBLE_IDLE_TIMEOUT_SECONDS",
                DEFAULT_IDLE_TIMEOUT_SECONDS,
            )?,
            log_json: parse_flag(vars, "ENSEMBLE_LOG_JSON")?,
            directory: match vars.get("ENSEMBLE_DIRECTORY") {
                Some(raw) => parse_directory(raw)?,
                None => Vec::new(),
            },
        };

        for (name, value) in [
            ("ENSEMBLE_RTC_TOKEN_TTL_SECONDS", config.rtc_token_ttl_seconds),
            ("ENSEMBLE_RTC_PROVIDER_TIMEOUT_MS", config.rtc_provider_timeout_ms),
            ("ENSEMBLE_JOIN_REQUEST_TTL_SECONDS", config.join_request_ttl_seconds),
            ("ENSEMBLE_SWEEP_INTERVAL_SECONDS", config.sweep_interval_seconds),
            ("ENSEMBLE_IDLE_TIMEOUT_SECONDS", config.idle_timeout_seconds),
            ("ENSEMBLE_OUTBOX_CAPACITY", config.outbox_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(name, "must be greater than zero"));
            }
        }
        Ok(config)
    }

    /// A config with defaults and the given secret. Skips the length
    /// check, so tests can use short secrets.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            rtc_secret: SecretString::from(secret.into()),
            rtc_token_ttl_seconds: DEFAULT_RTC_TOKEN_TTL_SECONDS,
            rtc_provider_timeout_ms: DEFAULT_RTC_PROVIDER_TIMEOUT_MS,
            join_request_ttl_seconds: DEFAULT_JOIN_REQUEST_TTL_SECONDS,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECONDS,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            log_json: false,
            directory: Vec::new(),
        }
    }

    pub fn credential_config(&self) -> CredentialConfig {
        CredentialConfig {
            token_ttl: Duration::from_secs(self.rtc_token_ttl_seconds),
            provider_timeout: Duration::from_millis(self.rtc_provider_timeout_ms),
        }
    }

    pub fn join_request_config(&self) -> JoinRequestConfig {
        JoinRequestConfig {
            ttl: Duration::from_secs(self.join_request_ttl_seconds),
            ..JoinRequestConfig::default()
        }
    }

    /// The `ENSEMBLE_DIRECTORY` entries as a ready-to-use directory.
    pub fn static_directory(&self) -> StaticDirectory {
        let mut directory = StaticDirectory::new();
        for entry in &self.directory {
            directory.grant(entry.project, entry.user, entry.role);
            if let Some(name) = &entry.name {
                directory = directory.with_name(entry.user, name.clone());
            }
        }
        directory
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub(crate) fn secret_len(&self) -> usize {
        self.rtc_secret.expose_secret().len()
    }
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(name, e.to_string())),
    }
}

fn parse_flag(vars: &HashMap<String, String>, name: &str) -> Result<bool, ConfigError> {
    match vars.get(name).map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("0") | Some("false") | Some("no") => Ok(false),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::invalid(name, format!("not a boolean: {other}"))),
    }
}

fn parse_directory(raw: &str) -> Result<Vec<DirectoryEntry>, ConfigError> {
    const NAME: &str = "ENSEMBLE_DIRECTORY";
    let mut entries = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let mut parts = item.splitn(4, ':');
        let (Some(project), Some(user), Some(role)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ConfigError::invalid(
                NAME,
                format!("expected project:user:role[:name], got {item:?}"),
            ));
        };
        let project = project
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(NAME, format!("project in {item:?}: {e}")))?;
        let user = user
            .trim()
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(NAME, format!("user in {item:?}: {e}")))?;
        let role = match role.trim().to_ascii_lowercase().as_str() {
            "admin" => ProjectRole::Admin,
            "member" => ProjectRole::Member,
            other => {
                return Err(ConfigError::invalid(NAME, format!("unknown role: {other}")));
            }
        };
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        entries.push(DirectoryEntry {
            project: ProjectId(project),
            user: UserId(user),
            role,
            name,
        });
    }
    Ok(entries)
}
