//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: PASSCTRL_, path separator: __)
//! 2. Config file (TOML, default ./passctrl.toml)
//! 3. Default values
//!
//! Keys are camelCase, e.g. `server.rules.rulesFolder` or
//! `PASSCTRL_SERVER__CACHE__TTLSECONDS`. Endpoint and rule documents may be
//! declared inline under `endpoints.*` / `rules.*` or loaded from the rules
//! folder/file configured under `server.rules`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rules::model::{EndpointDoc, RuleDoc};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Inline endpoint definitions
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointDoc>,

    /// Inline rule definitions
    #[serde(default)]
    pub rules: BTreeMap<String, RuleDoc>,
}

/// Server-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Listen address and port
    #[serde(default)]
    pub listen: ListenConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rule document sources
    #[serde(default)]
    pub rules: RuleSourcesConfig,

    /// Template sandbox configuration
    #[serde(default)]
    pub templates: TemplatesConfig,

    /// Decision cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream backend client configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Process-wide variable sources
    #[serde(default)]
    pub variables: VariablesConfig,
}

/// Listen configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    /// Bind address
    #[serde(default = "default_address")]
    pub address: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Correlation header name read from requests and echoed on responses
    #[serde(default = "default_correlation_header")]
    pub correlation_header: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            correlation_header: default_correlation_header(),
        }
    }
}

/// Rule document sources. `rulesFolder` and `rulesFile` are mutually exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSourcesConfig {
    /// Folder scanned for rule/endpoint documents (yaml/json/toml by extension)
    #[serde(default)]
    pub rules_folder: Option<PathBuf>,

    /// Single rule/endpoint document
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

/// Template sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatesConfig {
    /// Root folder for template file references; paths must resolve inside it
    #[serde(default)]
    pub templates_folder: Option<PathBuf>,

    /// Expose an `env` namespace to templates
    #[serde(default)]
    pub templates_allow_env: bool,

    /// Environment variable names exposed when `templatesAllowEnv` is set
    #[serde(default)]
    pub templates_allowed_env: Vec<String>,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            templates_folder: None,
            templates_allow_env: false,
            templates_allowed_env: Vec::new(),
        }
    }
}

/// Decision cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Cache backend: "memory" or "redis"
    #[serde(default = "default_cache_backend")]
    pub backend: String,

    /// Server-wide maximum TTL in seconds for cached decisions
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Salt mixed into every base key
    #[serde(default)]
    pub key_salt: String,

    /// Initial cache epoch; bumped on every reload
    #[serde(default)]
    pub epoch: u64,

    /// Key namespace prefix
    #[serde(default = "default_cache_namespace")]
    pub namespace: String,

    /// Redis connection settings (required when backend = "redis")
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            ttl_seconds: default_cache_ttl(),
            key_salt: String::new(),
            epoch: 0,
            namespace: default_cache_namespace(),
            redis: None,
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedisConfig {
    /// Redis connection URL (redis://host:port)
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_redis_max_connections")]
    pub max_connections: usize,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Upstream backend client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Per-page fetch timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout: default_backend_timeout(),
        }
    }
}

/// Process-wide variable sources
///
/// `environment` maps a variable name to the environment variable it is read
/// from (null = same name). `secrets` has the same shape but reads files from
/// the secrets folder (`/run/secrets` by default), stripping one trailing
/// newline. A missing env var or secret file is a startup failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariablesConfig {
    /// Environment-sourced variables
    #[serde(default)]
    pub environment: BTreeMap<String, Option<String>>,

    /// Secret-file-sourced variables
    #[serde(default)]
    pub secrets: BTreeMap<String, Option<String>>,

    /// Folder holding secret files
    #[serde(default = "default_secrets_folder")]
    pub secrets_folder: PathBuf,
}

impl Default for VariablesConfig {
    fn default() -> Self {
        Self {
            environment: BTreeMap::new(),
            secrets: BTreeMap::new(),
            secrets_folder: default_secrets_folder(),
        }
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_correlation_header() -> String {
    "x-correlation-id".to_string()
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_namespace() -> String {
    "passctrl".to_string()
}

fn default_redis_max_connections() -> usize {
    16
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_backend_timeout() -> u64 {
    10
}

fn default_secrets_folder() -> PathBuf {
    PathBuf::from("/run/secrets")
}

impl Config {
    /// Load configuration from the default file location and environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("passctrl.toml"))
    }

    /// Load configuration from a specific file path and environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PASSCTRL_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration-fatal constraints
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.port == 0 {
            return Err(Error::InvalidConfig("listen port must be non-zero".into()));
        }

        if self.server.rules.rules_folder.is_some() && self.server.rules.rules_file.is_some() {
            return Err(Error::InvalidConfig(
                "server.rules.rulesFolder and server.rules.rulesFile are mutually exclusive".into(),
            ));
        }

        match self.server.cache.backend.as_str() {
            "memory" => {}
            "redis" => {
                let has_url = self
                    .server
                    .cache
                    .redis
                    .as_ref()
                    .map(|r| !r.url.is_empty())
                    .unwrap_or(false);
                if !has_url {
                    return Err(Error::InvalidConfig(
                        "cache backend \"redis\" requires server.cache.redis.url".into(),
                    ));
                }
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown cache backend {other:?} (expected \"memory\" or \"redis\")"
                )));
            }
        }

        Ok(())
    }

    /// Backend fetch timeout as a [`Duration`]
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.server.backend.timeout)
    }

    /// Resolve `server.variables.environment` against the process environment
    ///
    /// A missing environment variable aborts startup.
    pub fn resolve_environment(&self) -> Result<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for (name, source) in &self.server.variables.environment {
            let env_name = source.as_deref().unwrap_or(name);
            match std::env::var(env_name) {
                Ok(value) => {
                    resolved.insert(name.clone(), value);
                }
                Err(_) => return Err(Error::MissingEnvVar(env_name.to_string())),
            }
        }
        Ok(resolved)
    }

    /// Resolve `server.variables.secrets` against the secrets folder
    ///
    /// Each secret is read from `<secretsFolder>/<name>` with one trailing
    /// newline stripped. A missing or unreadable file aborts startup.
    pub fn resolve_secrets(&self) -> Result<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        for (name, source) in &self.server.variables.secrets {
            let file_name = source.as_deref().unwrap_or(name);
            let path = self.server.variables.secrets_folder.join(file_name);
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::MissingSecret(format!("{}: {e}", path.display())))?;
            let value = raw.strip_suffix('\n').unwrap_or(&raw).to_string();
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listen.port, 8080);
        assert_eq!(config.server.cache.backend, "memory");
        assert_eq!(config.server.cache.ttl_seconds, 300);
        assert_eq!(config.server.backend.timeout, 10);
    }

    #[test]
    fn test_rules_sources_mutually_exclusive() {
        let mut config = Config::default();
        config.server.rules.rules_folder = Some(PathBuf::from("/etc/passctrl/rules"));
        config.server.rules.rules_file = Some(PathBuf::from("/etc/passctrl/rules.yaml"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_unknown_cache_backend_rejected() {
        let mut config = Config::default();
        config.server.cache.backend = "memcached".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let mut config = Config::default();
        config.server.cache.backend = "redis".to_string();
        assert!(config.validate().is_err());

        config.server.cache.redis = Some(RedisConfig {
            url: "redis://localhost:6379".to_string(),
            max_connections: default_redis_max_connections(),
            connection_timeout_secs: default_connection_timeout(),
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_environment_missing_var_fails() {
        let mut config = Config::default();
        config
            .server
            .variables
            .environment
            .insert("TIER".to_string(), Some("PASSCTRL_NO_SUCH_VAR".to_string()));
        let err = config.resolve_environment().unwrap_err();
        assert!(matches!(err, Error::MissingEnvVar(_)));
    }

    #[test]
    fn test_resolve_secrets_strips_trailing_newline() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("api-token")).unwrap();
        writeln!(f, "s3cr3t").unwrap();

        let mut config = Config::default();
        config.server.variables.secrets_folder = dir.path().to_path_buf();
        config
            .server
            .variables
            .secrets
            .insert("api-token".to_string(), None);

        let resolved = config.resolve_secrets().unwrap();
        assert_eq!(resolved.get("api-token").unwrap(), "s3cr3t");
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passctrl.toml");
        std::fs::write(
            &path,
            r#"
[server.listen]
port = 9000

[server.cache]
ttlSeconds = 60
keySalt = "pepper"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server.listen.port, 9000);
        assert_eq!(config.server.cache.ttl_seconds, 60);
        assert_eq!(config.server.cache.key_salt, "pepper");
    }
}
