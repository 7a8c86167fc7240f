use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub listen: String,
    pub auth: AuthConfig,
    #[serde(default)]
    pub global_limit: GlobalLimitConfig,
    pub i18n_dir: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_header_name")]
    pub header_name: String,
    pub backend: TokenBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenBackendConfig {
    /// Self-contained signed token; sessions live until their absolute
    /// expiry.
    Signed { secret: String },
    /// Opaque id referencing a payload in the shared counter store;
    /// sessions can be revoked.
    Reference,
}

/// Process-wide per-IP limiter applied before routing.
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalLimitConfig {
    #[serde(default = "default_global_max_times")]
    pub max_times: i64,
    #[serde(default = "default_global_interval_secs")]
    pub interval_secs: u64,
}

impl Default for GlobalLimitConfig {
    fn default() -> Self {
        Self {
            max_times: default_global_max_times(),
            interval_secs: default_global_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_true")]
    pub to_stdout: bool,
    #[serde(default)]
    pub file: Option<LogFileConfig>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            to_stdout: true,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogFileConfig {
    #[serde(default)]
    pub enabled: bool,
    pub dir: String,
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub rotation: LogRotation,
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    MissingEnvVar(String),
    Validation(String),
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(yaml)?;
        let config: Self = serde_yaml::from_str(&interpolated).map_err(ConfigError::Yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "`listen` must not be empty".to_string(),
            ));
        }

        if self.i18n_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "`i18n_dir` must not be empty".to_string(),
            ));
        }

        if self.auth.cookie_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "`auth.cookie_name` must not be empty".to_string(),
            ));
        }

        if let TokenBackendConfig::Signed { secret } = &self.auth.backend
            && secret.trim().is_empty()
        {
            return Err(ConfigError::Validation(
                "`auth.backend.secret` must not be empty".to_string(),
            ));
        }

        if self.global_limit.max_times <= 0 {
            return Err(ConfigError::Validation(
                "`global_limit.max_times` must be > 0".to_string(),
            ));
        }

        if self.global_limit.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "`global_limit.interval_secs` must be > 0".to_string(),
            ));
        }

        if let Some(file) = &self.logging.file
            && file.enabled
        {
            if file.dir.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "`logging.file.dir` must not be empty".to_string(),
                ));
            }
            if file.max_files == 0 {
                return Err(ConfigError::Validation(
                    "`logging.file.max_files` must be > 0".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io error: {err}"),
            Self::Yaml(err) => write!(f, "yaml parse error: {err}"),
            Self::MissingEnvVar(name) => write!(f, "missing environment variable `{name}`"),
            Self::Validation(msg) => write!(f, "config validation error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;

    while let Some(rel_start) = input[cursor..].find("${") {
        let start = cursor + rel_start;
        out.push_str(&input[cursor..start]);

        let key_start = start + 2;
        let rel_end = input[key_start..].find('}').ok_or_else(|| {
            ConfigError::Validation("unterminated `${...}` expression".to_string())
        })?;
        let end = key_start + rel_end;
        let key = &input[key_start..end];

        if key.is_empty() {
            return Err(ConfigError::Validation(
                "empty environment variable name in `${}`".to_string(),
            ));
        }

        let value = env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))?;
        out.push_str(&value);
        cursor = end + 1;
    }

    out.push_str(&input[cursor..]);
    Ok(out)
}

fn default_true() -> bool {
    true
}

fn default_cookie_name() -> String {
    "token".to_string()
}

fn default_header_name() -> String {
    "token".to_string()
}

fn default_global_max_times() -> i64 {
    1_500
}

fn default_global_interval_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_prefix() -> String {
    "apikit.log".to_string()
}

fn default_log_max_files() -> usize {
    7
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, TokenBackendConfig};

    #[test]
    fn parse_minimal_config() {
        let yaml = r#"
listen: "127.0.0.1:8080"
i18n_dir: "i18n"
auth:
  backend:
    type: "signed"
    secret: "jwt-secret"
"#;

        let config = AppConfig::from_yaml_str(yaml).expect("config should parse");
        assert_eq!(config.auth.cookie_name, "token");
        assert_eq!(config.global_limit.max_times, 1_500);
        assert!(matches!(
            config.auth.backend,
            TokenBackendConfig::Signed { .. }
        ));
    }

    #[test]
    fn parse_reference_backend() {
        let yaml = r#"
listen: "127.0.0.1:8080"
i18n_dir: "i18n"
auth:
  backend:
    type: "reference"
global_limit:
  max_times: 10
  interval_secs: 60
"#;

        let config = AppConfig::from_yaml_str(yaml).expect("config should parse");
        assert!(matches!(config.auth.backend, TokenBackendConfig::Reference));
        assert_eq!(config.global_limit.max_times, 10);
    }

    #[test]
    fn parse_config_with_env_interpolation() {
        let yaml = r#"
listen: "127.0.0.1:8080"
i18n_dir: "i18n"
auth:
  backend:
    type: "signed"
    secret: '${PATH}'
"#;

        let config = AppConfig::from_yaml_str(yaml).expect("config should parse");
        let TokenBackendConfig::Signed { secret } = config.auth.backend else {
            panic!("expected signed backend");
        };
        assert!(!secret.is_empty());
    }

    #[test]
    fn reject_empty_signed_secret() {
        let yaml = r#"
listen: "127.0.0.1:8080"
i18n_dir: "i18n"
auth:
  backend:
    type: "signed"
    secret: ""
"#;

        let error = AppConfig::from_yaml_str(yaml).expect_err("config should fail");
        assert!(error.to_string().contains("auth.backend.secret"));
    }

    #[test]
    fn reject_zero_interval_global_limit() {
        let yaml = r#"
listen: "127.0.0.1:8080"
i18n_dir: "i18n"
auth:
  backend:
    type: "reference"
global_limit:
  max_times: 10
  interval_secs: 0
"#;

        let error = AppConfig::from_yaml_str(yaml).expect_err("config should fail");
        assert!(error.to_string().contains("interval_secs"));
    }
}
