//! Harness configuration.
//!
//! Loaded from a TOML file (default `~/.config/hostctl/config.toml`), then
//! overridden by `HOSTCTL_*` environment variables. Every section and
//! field has a default, so an empty file is a valid configuration.

pub mod env;

pub use env::{EnvError, EnvParser};

use crate::controller::HostTimeouts;
use crate::errors::{Cataloged, ErrorCode};
use crate::logging::LoggingConfig;
use crate::session::{Credentials, Endpoint, RetryPolicy, SessionOptions, TransportKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Prompt of either controller on a two-controller system.
pub const DEFAULT_INITIAL_PROMPT: &str = r".*controller-[01]:~\$ ";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub general: GeneralConfig,
    pub lab: LabConfig,
    pub session: SessionConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Directory for JSON log files; none disables file logging.
    pub log_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            log_json: false,
        }
    }
}

/// Where the lab's active controller answers, and how to log in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabConfig {
    /// Floating address of the active controller.
    pub host: String,
    /// Defaults to the transport's well-known port.
    pub port: Option<u16>,
    /// `ssh`, `telnet` or `mock`.
    pub transport: String,
    pub user: String,
    pub password: String,
    pub identity_file: Option<PathBuf>,
    /// Regex matching the shell prompt right after login.
    pub initial_prompt: String,
    /// Prompt for one controller, `{host}` replaced by its name.
    pub prompt_template: Option<String>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            transport: TransportKind::Ssh.to_string(),
            user: "sysadmin".to_string(),
            password: String::new(),
            identity_file: None,
            initial_prompt: DEFAULT_INITIAL_PROMPT.to_string(),
            prompt_template: Some(r".*{host}:~\$ ".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub login_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub retry_max_interval_secs: u64,
    pub retry_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_timeout_secs: 30,
            command_timeout_secs: 60,
            probe_timeout_secs: 10,
            retry_interval_secs: 3,
            retry_max_interval_secs: 30,
            retry_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub lock_secs: u64,
    pub online_after_lock_secs: u64,
    pub controller_unlock_secs: u64,
    pub compute_unlock_secs: u64,
    pub storage_unlock_secs: u64,
    pub reboot_secs: u64,
    pub fail_after_reboot_secs: u64,
    pub swact_secs: u64,
    pub swact_start_secs: u64,
    pub task_clear_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let t = HostTimeouts::default();
        Self {
            lock_secs: t.lock.as_secs(),
            online_after_lock_secs: t.online_after_lock.as_secs(),
            controller_unlock_secs: t.controller_unlock.as_secs(),
            compute_unlock_secs: t.compute_unlock.as_secs(),
            storage_unlock_secs: t.storage_unlock.as_secs(),
            reboot_secs: t.reboot.as_secs(),
            fail_after_reboot_secs: t.fail_after_reboot.as_secs(),
            swact_secs: t.swact.as_secs(),
            swact_start_secs: t.swact_start.as_secs(),
            task_clear_secs: t.task_clear.as_secs(),
            check_interval_secs: t.check_interval.as_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl Cataloged for ConfigError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Invalid(_) => ErrorCode::ConfigValidationError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from [`HarnessConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub severity: Severity,
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag}: {}: {}", self.field, self.message)
    }
}

/// `~/.config/hostctl/config.toml`, if a config directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("hostctl").join(CONFIG_FILE_NAME))
}

impl HarnessConfig {
    /// Parse a config file. `~` and `$VARS` in the path are expanded.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let expanded = expand_path(path);
        if !expanded.exists() {
            return Err(ConfigError::NotFound(expanded));
        }
        let content = std::fs::read_to_string(&expanded).map_err(|source| ConfigError::Read {
            path: expanded.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: expanded,
            source,
        })
    }

    /// Load an explicit file, or the default file if it exists, or defaults;
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::from_file(&default)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let mut env = EnvParser::new();

        if let Some(host) = env.get_string("LAB_HOST") {
            self.lab.host = host;
        }
        if let Some(port) = env.get_range::<u16>("LAB_PORT", 1, u16::MAX) {
            self.lab.port = Some(port);
        }
        if let Some(transport) = env.get_parsed::<TransportKind>("TRANSPORT", "ssh, telnet or mock") {
            self.lab.transport = transport.to_string();
        }
        if let Some(user) = env.get_string("LAB_USER") {
            self.lab.user = user;
        }
        if let Some(password) = env.get_string("LAB_PASSWORD") {
            self.lab.password = password;
        }
        if let Some(level) = env.get_log_level("LOG_LEVEL") {
            self.general.log_level = level;
        }
        if let Some(json) = env.get_bool("LOG_JSON") {
            self.general.log_json = json;
        }
        if let Some(secs) = env.get_range::<u64>("CHECK_INTERVAL_SECS", 1, 600) {
            self.timeouts.check_interval_secs = secs;
        }

        if env.has_errors() {
            return Err(ConfigError::Env(env.take_errors()));
        }
        Ok(())
    }

    /// Check the configuration. Errors make [`endpoint`](Self::endpoint)
    /// fail or would make every operation time out; warnings are likely
    /// mistakes.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut findings = Vec::new();
        let mut push = |severity, field, message: String| {
            findings.push(ConfigWarning {
                severity,
                field,
                message,
            })
        };

        if self.lab.host.trim().is_empty() {
            push(Severity::Error, "lab.host", "no lab host configured".to_string());
        }
        if let Err(e) = self.lab.transport.parse::<TransportKind>() {
            push(Severity::Error, "lab.transport", e);
        }
        if let Err(e) = regex::Regex::new(&self.lab.initial_prompt) {
            push(Severity::Error, "lab.initial_prompt", e.to_string());
        }
        if let Some(template) = &self.lab.prompt_template
            && !template.contains("{host}")
        {
            push(
                Severity::Error,
                "lab.prompt_template",
                "template has no {host} placeholder".to_string(),
            );
        }
        if self.lab.password.is_empty() && self.lab.identity_file.is_none() {
            push(
                Severity::Warning,
                "lab.password",
                "no password or identity file; login relies on the ssh agent".to_string(),
            );
        }
        if let Some(identity) = &self.lab.identity_file
            && !expand_path(identity).exists()
        {
            push(
                Severity::Warning,
                "lab.identity_file",
                format!("{} does not exist", identity.display()),
            );
        }
        if !env::is_log_level(&self.general.log_level.to_ascii_lowercase())
            && tracing_subscriber::EnvFilter::try_new(&self.general.log_level).is_err()
        {
            push(
                Severity::Error,
                "general.log_level",
                format!("'{}' is not a valid filter", self.general.log_level),
            );
        }

        let t = &self.timeouts;
        if t.check_interval_secs == 0 {
            push(
                Severity::Error,
                "timeouts.check_interval_secs",
                "must be at least 1".to_string(),
            );
        }
        if t.fail_after_reboot_secs >= t.reboot_secs {
            push(
                Severity::Warning,
                "timeouts.fail_after_reboot_secs",
                "not shorter than reboot_secs; nothing is left for the host to come back".to_string(),
            );
        }
        if t.swact_start_secs > t.swact_secs {
            push(
                Severity::Warning,
                "timeouts.swact_start_secs",
                "longer than swact_secs".to_string(),
            );
        }
        if self.session.command_timeout_secs == 0 {
            push(
                Severity::Error,
                "session.command_timeout_secs",
                "must be at least 1".to_string(),
            );
        }

        findings
    }

    pub fn transport(&self) -> Result<TransportKind, ConfigError> {
        self.lab.transport.parse().map_err(ConfigError::Invalid)
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        if self.lab.host.trim().is_empty() {
            return Err(ConfigError::Invalid("lab.host is empty".to_string()));
        }
        let kind = self.transport()?;
        let port = self.lab.port.unwrap_or_else(|| kind.default_port());
        Ok(Endpoint::new(self.lab.host.trim(), port, kind))
    }

    pub fn credentials(&self) -> Credentials {
        let mut credentials = Credentials::new(&self.lab.user, &self.lab.password);
        credentials.identity_file = self.lab.identity_file.as_deref().map(expand_path);
        credentials
    }

    pub fn session_options(&self) -> SessionOptions {
        let s = &self.session;
        SessionOptions {
            retry: RetryPolicy {
                base_delay: Duration::from_secs(s.retry_interval_secs),
                max_delay: Duration::from_secs(s.retry_max_interval_secs),
                retry_timeout: Duration::from_secs(s.retry_timeout_secs),
                ..RetryPolicy::default()
            },
            login_timeout: Duration::from_secs(s.login_timeout_secs),
            command_timeout: Duration::from_secs(s.command_timeout_secs),
            probe_timeout: Duration::from_secs(s.probe_timeout_secs),
            ..SessionOptions::default()
        }
    }

    pub fn host_timeouts(&self) -> HostTimeouts {
        let t = &self.timeouts;
        HostTimeouts {
            lock: Duration::from_secs(t.lock_secs),
            online_after_lock: Duration::from_secs(t.online_after_lock_secs),
            controller_unlock: Duration::from_secs(t.controller_unlock_secs),
            compute_unlock: Duration::from_secs(t.compute_unlock_secs),
            storage_unlock: Duration::from_secs(t.storage_unlock_secs),
            reboot: Duration::from_secs(t.reboot_secs),
            fail_after_reboot: Duration::from_secs(t.fail_after_reboot_secs),
            swact: Duration::from_secs(t.swact_secs),
            swact_start: Duration::from_secs(t.swact_start_secs),
            task_clear: Duration::from_secs(t.task_clear_secs),
            check_interval: Duration::from_secs(t.check_interval_secs.max(1)),
            command: Duration::from_secs(self.session.command_timeout_secs),
        }
    }

    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.general.log_level.clone(),
            json_stderr: self.general.log_json,
            log_dir: self.general.log_dir.as_deref().map(expand_path),
        }
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let file = write_config("");
        let config = HarnessConfig::from_file(file.path()).unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.host_timeouts(), HostTimeouts::default());
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let file = write_config(
            r#"
[lab]
host = "10.10.10.2"
transport = "telnet"
port = 2023

[timeouts]
compute_unlock_secs = 600
"#,
        );
        let config = HarnessConfig::from_file(file.path()).unwrap();
        let endpoint = config.endpoint().unwrap();
        assert_eq!(endpoint.kind, TransportKind::Telnet);
        assert_eq!(endpoint.port, 2023);
        assert_eq!(config.host_timeouts().compute_unlock, Duration::from_secs(600));
        assert_eq!(config.host_timeouts().lock, Duration::from_secs(900));
        assert_eq!(config.lab.user, "sysadmin");
    }

    #[test]
    fn test_default_port_follows_transport() {
        let mut config = HarnessConfig::default();
        config.lab.host = "lab".to_string();
        assert_eq!(config.endpoint().unwrap().port, 22);
        config.lab.transport = "telnet".to_string();
        assert_eq!(config.endpoint().unwrap().port, 23);
    }

    #[test]
    fn test_missing_file_and_bad_toml() {
        let err = HarnessConfig::from_file(Path::new("/nonexistent/hostctl.toml")).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ConfigNotFound);

        let file = write_config("[lab\nhost = 1");
        let err = HarnessConfig::from_file(file.path()).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ConfigParseError);
    }

    #[test]
    fn test_validate_flags_missing_host_and_bad_template() {
        let mut config = HarnessConfig::default();
        config.lab.prompt_template = Some("controller:~$ ".to_string());
        config.timeouts.check_interval_secs = 0;

        let findings = config.validate();
        let errors: Vec<_> = findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .map(|f| f.field)
            .collect();
        assert!(errors.contains(&"lab.host"));
        assert!(errors.contains(&"lab.prompt_template"));
        assert!(errors.contains(&"timeouts.check_interval_secs"));
    }

    #[test]
    fn test_validate_clean_config() {
        let mut config = HarnessConfig::default();
        config.lab.host = "10.10.10.2".to_string();
        config.lab.password = "secret".to_string();
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_env_overrides_apply_and_collect_errors() {
        let _guard = env_test_lock();
        // SAFETY: serialized via env_test_lock
        unsafe {
            std::env::set_var("HOSTCTL_LAB_HOST", "192.168.204.2");
            std::env::set_var("HOSTCTL_TRANSPORT", "telnet");
            std::env::set_var("HOSTCTL_LAB_PORT", "not-a-port");
        }

        let mut config = HarnessConfig::default();
        let err = config.apply_env_overrides().unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::ConfigEnvError);
        assert!(err.to_string().contains("HOSTCTL_LAB_PORT"));
        assert_eq!(config.lab.host, "192.168.204.2");
        assert_eq!(config.lab.transport, "telnet");

        // SAFETY: serialized via env_test_lock
        unsafe {
            std::env::remove_var("HOSTCTL_LAB_HOST");
            std::env::remove_var("HOSTCTL_TRANSPORT");
            std::env::remove_var("HOSTCTL_LAB_PORT");
        }
    }

    #[test]
    fn test_credentials_debug_masks_password() {
        let mut config = HarnessConfig::default();
        config.lab.password = "St8rlingX*".to_string();
        let debug = format!("{:?}", config.credentials());
        assert!(!debug.contains("St8rlingX*"));
    }
}
