//! Connection and executor settings.
//!
//! Settings can be built in code, or loaded from TOML with `${ENV_VAR}`
//! expansion in string values:
//!
//! ```toml
//! user = "app"
//! password = "${PGPASSWORD}"
//! host = "db.internal"
//! dbname = "shop"
//! template_dir = "sql"
//! template_extension = ".sql"
//! max_size = 16
//!
//! [retry]
//! max_attempts = 5
//! initial_delay_ms = 50
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Connection pool size used when no maximum is configured.
pub const DEFAULT_UNBOUNDED_MAX_SIZE: usize = 64;

/// Settings for a client: connection parameters, pool sizing, template
/// location and retry policy.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Database user.
    pub user: String,
    /// Database password. Never displayed or serialized.
    #[serde(serialize_with = "serialize_secret", deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Server host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    #[serde(default = "default_dbname")]
    pub dbname: String,
    /// Directory templates are loaded from.
    #[serde(default = "default_template_dir")]
    pub template_dir: PathBuf,
    /// Extension appended to template names that lack it.
    #[serde(default)]
    pub template_extension: String,
    /// Connections opened when the pool is first used.
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    /// Maximum pool size; `None` means no configured limit.
    #[serde(default)]
    pub max_size: Option<usize>,
    /// Reported to the server as `application_name`.
    #[serde(default = "default_application_name")]
    pub application_name: String,
    /// How long to wait for a pooled connection.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// How long to wait when opening a new connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetrySettings,
}

/// The file form of [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts per query, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay.
    pub max_delay_ms: u64,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetrySettings {
    /// Build the runtime retry configuration.
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .max_attempts(self.max_attempts)
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .backoff_multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_dbname() -> String {
    "public".to_string()
}

fn default_template_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_min_size() -> usize {
    4
}

fn default_application_name() -> String {
    "pgstencil".to_string()
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn serialize_secret<S>(_secret: &SecretString, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(SecretString::from(s))
}

impl Settings {
    /// Settings with the given credentials and every other field defaulted.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: SecretString::from(password.into()),
            host: default_host(),
            port: default_port(),
            dbname: default_dbname(),
            template_dir: default_template_dir(),
            template_extension: String::new(),
            min_size: default_min_size(),
            max_size: None,
            application_name: default_application_name(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry: RetrySettings::default(),
        }
    }

    /// Create a builder.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Load settings from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse settings from TOML, expanding `${VAR}` references inside
    /// string values.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(content)
            .map_err(|e| Error::config(format!("invalid settings: {e}")))?;
        table.iter_mut().for_each(|(_, v)| expand_value(v));

        let settings: Self = toml::Value::Table(table)
            .try_into()
            .map_err(|e| Error::config(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.user.is_empty() {
            return Err(Error::config("user must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port must not be 0"));
        }
        if let Some(max) = self.max_size {
            if max == 0 {
                return Err(Error::config("max_size must be at least 1"));
            }
            if self.min_size > max {
                return Err(Error::config(format!(
                    "min_size ({}) must not exceed max_size ({max})",
                    self.min_size
                )));
            }
        }
        Ok(())
    }

    /// The effective pool capacity.
    ///
    /// The pool needs a fixed capacity, so an unset `max_size` maps to
    /// [`DEFAULT_UNBOUNDED_MAX_SIZE`] (or `min_size`, if larger).
    pub fn pool_max_size(&self) -> usize {
        self.max_size
            .unwrap_or_else(|| DEFAULT_UNBOUNDED_MAX_SIZE.max(self.min_size))
    }

    /// How long to wait for a pooled connection.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// How long to wait when opening a connection.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The libpq connection string, password included.
    ///
    /// Only hand this to a driver; it must not be logged.
    pub fn conninfo(&self) -> String {
        [
            ("host", self.host.as_str()),
            ("port", &self.port.to_string()),
            ("dbname", &self.dbname),
            ("user", &self.user),
            ("password", self.password.expose_secret()),
            ("application_name", &self.application_name),
        ]
        .iter()
        .map(|(key, value)| format!("{key}={}", quote_conninfo_value(value)))
        .collect::<Vec<_>>()
        .join(" ")
    }

    /// Convert to a tokio-postgres config.
    pub fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.dbname(&self.dbname);
        config.user(&self.user);
        config.password(self.password.expose_secret());
        config.application_name(&self.application_name);
        config.connect_timeout(self.connect_timeout());
        config
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.dbname)
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("template_dir", &self.template_dir)
            .field("template_extension", &self.template_extension)
            .field("min_size", &self.min_size)
            .field("max_size", &self.max_size)
            .field("application_name", &self.application_name)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Quote a libpq key/value: empty values and values with spaces, quotes or
/// backslashes are single-quoted with `\'` and `\\` escapes.
fn quote_conninfo_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '\'' || c == '\\');
    if !needs_quotes {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Expand `${VAR}` references in every string inside `value`.
fn expand_value(value: &mut toml::Value) {
    match value {
        toml::Value::String(text) => {
            if text.contains("${") {
                *text = expand_env_vars(text);
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(expand_value),
        toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| expand_value(v)),
        _ => {}
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
///
/// Unset variables are left as written.
fn expand_env_vars(content: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}") else {
        return content.to_string();
    };

    re.replace_all(content, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

/// Builder for [`Settings`].
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    user: Option<String>,
    password: Option<SecretString>,
    host: Option<String>,
    port: Option<u16>,
    dbname: Option<String>,
    template_dir: Option<PathBuf>,
    template_extension: Option<String>,
    min_size: Option<usize>,
    max_size: Option<usize>,
    application_name: Option<String>,
    acquire_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    retry: Option<RetrySettings>,
}

impl SettingsBuilder {
    /// Set the user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the database name.
    pub fn dbname(mut self, dbname: impl Into<String>) -> Self {
        self.dbname = Some(dbname.into());
        self
    }

    /// Set the template directory.
    pub fn template_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(dir.into());
        self
    }

    /// Set the template extension.
    pub fn template_extension(mut self, extension: impl Into<String>) -> Self {
        self.template_extension = Some(extension.into());
        self
    }

    /// Set the number of connections opened up front.
    pub fn min_size(mut self, n: usize) -> Self {
        self.min_size = Some(n);
        self
    }

    /// Set the maximum pool size.
    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = Some(n);
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set how long to wait for a pooled connection.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Set how long to wait when opening a connection.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build and validate the settings.
    pub fn build(self) -> Result<Settings> {
        let user = self.user.ok_or_else(|| Error::config("user is required"))?;
        let password = self
            .password
            .ok_or_else(|| Error::config("password is required"))?;

        let defaults = Settings::new(String::new(), String::new());
        let settings = Settings {
            user,
            password,
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            dbname: self.dbname.unwrap_or(defaults.dbname),
            template_dir: self.template_dir.unwrap_or(defaults.template_dir),
            template_extension: self.template_extension.unwrap_or(defaults.template_extension),
            min_size: self.min_size.unwrap_or(defaults.min_size),
            max_size: self.max_size,
            application_name: self.application_name.unwrap_or(defaults.application_name),
            acquire_timeout_ms: self
                .acquire_timeout
                .map_or(defaults.acquire_timeout_ms, |d| d.as_millis() as u64),
            connect_timeout_ms: self
                .connect_timeout
                .map_or(defaults.connect_timeout_ms, |d| d.as_millis() as u64),
            retry: self.retry.unwrap_or(defaults.retry),
        };

        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let settings = Settings::new("app", "secret");
        assert_eq!(settings.host, "localhost");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.dbname, "public");
        assert_eq!(settings.template_dir, PathBuf::from("."));
        assert_eq!(settings.template_extension, "");
        assert_eq!(settings.min_size, 4);
        assert_eq!(settings.max_size, None);
        assert_eq!(settings.application_name, "pgstencil");
        assert_eq!(settings.pool_max_size(), DEFAULT_UNBOUNDED_MAX_SIZE);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_display_and_debug_hide_password() {
        let settings = Settings::new("app", "hunter2");
        assert_eq!(settings.to_string(), "localhost:5432/public");

        let debug = format!("{settings:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_conninfo_quoting() {
        let settings = Settings::builder()
            .user("app")
            .password("it's a \\secret")
            .dbname("shop")
            .application_name("")
            .build()
            .unwrap();

        assert_eq!(
            settings.conninfo(),
            "host=localhost port=5432 dbname=shop user=app \
             password='it\\'s a \\\\secret' application_name=''"
        );
    }

    #[test]
    fn test_builder_requires_credentials() {
        assert!(Settings::builder().user("app").build().is_err());
        assert!(Settings::builder().password("x").build().is_err());
    }

    #[test]
    fn test_validation() {
        let err = Settings::builder()
            .user("app")
            .password("x")
            .min_size(8)
            .max_size(4)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("min_size"));

        let err = Settings::builder()
            .user("app")
            .password("x")
            .min_size(0)
            .max_size(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_size"));

        let err = Settings::builder().user("app").password("x").port(0).build().unwrap_err();
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_pool_max_size_covers_min_size() {
        let settings = Settings::builder()
            .user("app")
            .password("x")
            .min_size(100)
            .build()
            .unwrap();
        assert_eq!(settings.pool_max_size(), 100);
    }

    #[test]
    fn test_from_toml_str() {
        let toml = r#"
            user = "app"
            password = "secret"
            host = "db.internal"
            template_dir = "sql"
            template_extension = ".sql"
            max_size = 16

            [retry]
            max_attempts = 5
        "#;

        let settings = Settings::from_toml_str(toml).unwrap();
        assert_eq!(settings.host, "db.internal");
        assert_eq!(settings.port, 5432);
        assert_eq!(settings.template_dir, PathBuf::from("sql"));
        assert_eq!(settings.max_size, Some(16));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.initial_delay_ms, 100);
        assert_eq!(settings.password.expose_secret(), "secret");
    }

    #[test]
    fn test_from_toml_requires_password() {
        let err = Settings::from_toml_str("user = \"app\"").unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_serialize_redacts_password() {
        let settings = Settings::new("app", "hunter2");
        let out = toml::to_string(&settings).unwrap();
        assert!(!out.contains("hunter2"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn test_env_var_expansion() {
        // SAFETY: the variable name is unique to this test
        unsafe {
            std::env::set_var("PGSTENCIL_TEST_CONFIG_PASSWORD", "from-env");
        }
        let expanded = expand_env_vars(
            "password = \"${PGSTENCIL_TEST_CONFIG_PASSWORD}\"\nhost = \"${PGSTENCIL_TEST_UNSET_VAR}\"",
        );
        assert_eq!(
            expanded,
            "password = \"from-env\"\nhost = \"${PGSTENCIL_TEST_UNSET_VAR}\""
        );
        unsafe {
            std::env::remove_var("PGSTENCIL_TEST_CONFIG_PASSWORD");
        }
    }

    #[test]
    fn test_env_values_with_quotes_and_backslashes() {
        // SAFETY: the variable name is unique to this test
        unsafe {
            std::env::set_var("PGSTENCIL_TEST_TRICKY_PASSWORD", r#"p"w\d"#);
        }
        let settings = Settings::from_toml_str(
            r#"
            user = "app"
            password = "${PGSTENCIL_TEST_TRICKY_PASSWORD}"
            host = "${PGSTENCIL_TEST_UNSET_HOST}"
            port = 5433
            "#,
        )
        .unwrap();
        unsafe {
            std::env::remove_var("PGSTENCIL_TEST_TRICKY_PASSWORD");
        }

        assert_eq!(settings.password.expose_secret(), r#"p"w\d"#);
        assert_eq!(settings.host, "${PGSTENCIL_TEST_UNSET_HOST}");
        assert_eq!(settings.port, 5433);
    }
}
