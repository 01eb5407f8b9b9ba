//! Listener configuration, loaded once at startup

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ListenerError, Result};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_DEPLOY_SCRIPT: &str = "./deploy.sh";
pub const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 600;
/// GitHub caps webhook payloads at 25MB
pub const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Optional TOML file read before the environment is applied
pub const CONFIG_PATH_VAR: &str = "WEBHOOK_CONFIG";

const SECRET_VAR: &str = "WEBHOOK_SECRET";
const ALLOW_UNSIGNED_VAR: &str = "ALLOW_UNSIGNED_WEBHOOKS";
const HOST_VAR: &str = "WEBHOOK_HOST";
const PORT_VAR: &str = "WEBHOOK_PORT";
const SCRIPT_VAR: &str = "DEPLOY_SCRIPT_PATH";
const BRANCHES_VAR: &str = "ALLOWED_BRANCHES";
const TIMEOUT_VAR: &str = "DEPLOY_TIMEOUT_SECS";
const MAX_BODY_VAR: &str = "WEBHOOK_MAX_BODY_BYTES";
const LOG_DIR_VAR: &str = "WEBHOOK_LOG_DIR";
const EXPECTED_USER_VAR: &str = "DEPLOY_EXPECTED_USER";

#[derive(Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ListenerConfig {
    /// Shared HMAC secret. `None` is only accepted together with `allow_unsigned`.
    pub secret: Option<String>,
    pub allow_unsigned: bool,
    pub host: String,
    pub port: u16,
    pub deploy_script: PathBuf,
    pub allowed_branches: Vec<String>,
    pub deploy_timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Directory for rolling log files; console only when unset
    pub log_dir: Option<PathBuf>,
    /// Warn at startup when running as someone else
    pub expected_user: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            secret: None,
            allow_unsigned: false,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            deploy_script: PathBuf::from(DEFAULT_DEPLOY_SCRIPT),
            allowed_branches: vec!["main".to_string(), "master".to_string()],
            deploy_timeout_secs: DEFAULT_DEPLOY_TIMEOUT_SECS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            log_dir: None,
            expected_user: None,
        }
    }
}

// Keep the secret out of logs
impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("allow_unsigned", &self.allow_unsigned)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("deploy_script", &self.deploy_script)
            .field("allowed_branches", &self.allowed_branches)
            .field("deploy_timeout_secs", &self.deploy_timeout_secs)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("log_dir", &self.log_dir)
            .field("expected_user", &self.expected_user)
            .finish()
    }
}

impl ListenerConfig {
    /// Load `.env`, the optional TOML file named by `WEBHOOK_CONFIG`, then the
    /// process environment, and validate the result.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let base = match std::env::var(CONFIG_PATH_VAR) {
            Ok(path) if !path.is_empty() => Self::from_toml_file(Path::new(&path))?,
            _ => Self::default(),
        };

        let config = Self::from_lookup(base, |key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path).map_err(|e| {
            ListenerError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_toml_str(&config_str).map_err(|e| {
            ListenerError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    /// Applies every variable `lookup` knows about on top of `base`.
    pub fn from_lookup<F>(mut base: Self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secret) = lookup(SECRET_VAR) {
            base.secret = Some(secret);
        }
        if let Some(value) = lookup(ALLOW_UNSIGNED_VAR) {
            base.allow_unsigned = parse_bool(ALLOW_UNSIGNED_VAR, &value)?;
        }
        if let Some(host) = lookup(HOST_VAR) {
            base.host = host;
        }
        if let Some(value) = lookup(PORT_VAR) {
            base.port = parse_number(PORT_VAR, &value)?;
        }
        if let Some(path) = lookup(SCRIPT_VAR) {
            base.deploy_script = PathBuf::from(path);
        }
        if let Some(value) = lookup(BRANCHES_VAR) {
            base.allowed_branches = value
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(value) = lookup(TIMEOUT_VAR) {
            base.deploy_timeout_secs = parse_number(TIMEOUT_VAR, &value)?;
        }
        if let Some(value) = lookup(MAX_BODY_VAR) {
            base.max_body_bytes = parse_number(MAX_BODY_VAR, &value)?;
        }
        if let Some(dir) = lookup(LOG_DIR_VAR) {
            base.log_dir = Some(PathBuf::from(dir)).filter(|d| !d.as_os_str().is_empty());
        }
        if let Some(user) = lookup(EXPECTED_USER_VAR) {
            base.expected_user = Some(user).filter(|u| !u.is_empty());
        }

        // An empty secret is no secret
        base.secret = base.secret.filter(|s| !s.is_empty());
        Ok(base)
    }

    pub fn validate(&self) -> Result<()> {
        if self.secret.is_none() && !self.allow_unsigned {
            return Err(ListenerError::Config(format!(
                "{} is not set; set {}=true to accept unsigned webhooks",
                SECRET_VAR, ALLOW_UNSIGNED_VAR
            )));
        }
        if self.allowed_branches.is_empty() {
            return Err(ListenerError::Config(
                "At least one allowed branch is required".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ListenerError::Config("Port must not be 0".to_string()));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(ListenerError::Config(
                "Deployment timeout must be at least 1 second".to_string(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ListenerError::Config(
                "Maximum body size must not be 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    /// Secret used for verification, `None` in unsigned mode
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(ListenerError::Config(format!(
            "{} must be a boolean, got '{}'",
            var, other
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e| {
        ListenerError::Config(format!("{} has invalid value '{}': {}", var, value, e))
    })
}
