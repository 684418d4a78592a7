use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;

use crate::{RelayError, Result};

/// Top-level configuration. Deserialized from TOML, then normalized and
/// validated with [`Config::validate`] before anything else touches it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub providers: HashMap<String, Provider>,
    #[serde(default)]
    pub models: HashMap<String, Model>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub include_error_body: bool,
}

impl LogConfig {
    /// Maps the configured level onto a tracing filter directive.
    /// Unknown levels fall back to `info`.
    pub fn level_filter(&self) -> &'static str {
        match self.level.to_lowercase().as_str() {
            "debug" => "debug",
            "warn" => "warn",
            "error" => "error",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_cycles: u32,
    #[serde(default)]
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub default_interval_ms: u64,
    #[serde(default)]
    pub exponential_backoff: bool,
}

/// An upstream API endpoint plus its credentials. Immutable once the
/// config has been validated; `parsed_url` is filled in at that point.
#[derive(Clone, Default, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub strip_version_prefix: bool,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(default)]
    pub aws_region: String,
    #[serde(default)]
    pub aws_access_key_id: String,
    #[serde(default)]
    pub aws_secret_access_key: String,
    #[serde(default)]
    pub aws_session_token: String,
    #[serde(skip)]
    pub parsed_url: Option<Url>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("strip_version_prefix", &self.strip_version_prefix)
            .field("interval_ms", &self.interval_ms)
            .field("aws_region", &self.aws_region)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field("aws_secret_access_key", &"<redacted>")
            .field("aws_session_token", &"<redacted>")
            .finish()
    }
}

/// Upstream API family. Determines which auth headers an attempt gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Openai,
    Anthropic,
    Bedrock,
}

impl Dialect {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "openai" => Some(Self::Openai),
            "anthropic" => Some(Self::Anthropic),
            "bedrock" => Some(Self::Bedrock),
            _ => None,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Openai => f.write_str("openai"),
            Self::Anthropic => f.write_str("anthropic"),
            Self::Bedrock => f.write_str("bedrock"),
        }
    }
}

/// Pairs a provider with an upstream model name and retry parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Model {
    /// Map key, injected during validation.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub interval_ms: u64,
    #[serde(skip)]
    pub dialect: Option<Dialect>,
}

impl Model {
    /// Per-attempt timeout: the model's own value, else the retry default.
    pub fn effective_timeout(&self, default_timeout_ms: u64) -> Duration {
        if self.timeout_ms > 0 {
            Duration::from_millis(self.timeout_ms)
        } else {
            Duration::from_millis(default_timeout_ms)
        }
    }

    /// Inter-attempt wait: model interval, else provider interval, else
    /// the retry default.
    pub fn effective_interval(&self, provider: Option<&Provider>, default_interval_ms: u64) -> Duration {
        if self.interval_ms > 0 {
            return Duration::from_millis(self.interval_ms);
        }
        if let Some(provider) = provider {
            if provider.interval_ms > 0 {
                return Duration::from_millis(provider.interval_ms);
            }
        }
        Duration::from_millis(default_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Listener {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub read_timeout_seconds: u64,
    #[serde(default)]
    pub write_timeout_seconds: u64,
    /// Ordered model ids forming the fallback chain.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(skip)]
    pub resolved_models: Vec<Model>,
    #[serde(skip)]
    pub dialect: Option<Dialect>,
}

impl Listener {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_seconds)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_seconds)
    }
}

fn invalid(entity: impl Into<String>, reason: impl Into<String>) -> RelayError {
    RelayError::ConfigInvalid {
        entity: entity.into(),
        reason: reason.into(),
    }
}

/// Resolves a `$NAME` reference against the process environment.
///
/// Only the exact-prefix form expands: the whole value must be `$` followed
/// by a variable name. A lone `$`, or `$` anywhere else in the string, is
/// returned unchanged, as is a reference to an unset or empty variable.
pub fn resolve_env(value: &str) -> String {
    if let Some(name) = value.strip_prefix('$') {
        // env::var panics on '=' or NUL in the name.
        if !name.is_empty() && !name.contains(['=', '\0']) {
            if let Ok(resolved) = std::env::var(name) {
                if !resolved.is_empty() {
                    return resolved;
                }
            }
        }
    }
    value.to_string()
}

impl Config {
    /// Reads, normalizes and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)
            .map_err(|err| invalid(path.display().to_string(), err.to_string()))?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fills in defaults for unset (zero) fields. Explicit non-zero values
    /// are never overridden.
    pub fn apply_defaults(&mut self) {
        if self.log.level.is_empty() {
            self.log.level = "info".to_string();
        }
        if self.retry.max_cycles == 0 {
            self.retry.max_cycles = 10;
        }
        if self.retry.default_timeout_ms == 0 {
            self.retry.default_timeout_ms = 30_000;
        }
        if self.retry.default_interval_ms == 0 {
            self.retry.default_interval_ms = 100;
        }
        for listener in &mut self.listeners {
            if listener.host.is_empty() {
                listener.host = "127.0.0.1".to_string();
            }
            if listener.read_timeout_seconds == 0 {
                listener.read_timeout_seconds = 60;
            }
            if listener.write_timeout_seconds == 0 {
                listener.write_timeout_seconds = 600;
            }
        }
    }

    /// Checks cross-references and value ranges, expands `$NAME` references
    /// and computes the derived fields (parsed URLs, resolved model chains,
    /// listener dialects). Errors name the offending entity.
    pub fn validate(&mut self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(invalid("providers", "at least one provider must be configured"));
        }

        for (name, provider) in &mut self.providers {
            provider.url = resolve_env(&provider.url);
            provider.api_key = resolve_env(&provider.api_key);
            provider.aws_region = resolve_env(&provider.aws_region);
            provider.aws_access_key_id = resolve_env(&provider.aws_access_key_id);
            provider.aws_secret_access_key = resolve_env(&provider.aws_secret_access_key);
            provider.aws_session_token = resolve_env(&provider.aws_session_token);

            let mut parsed = Url::parse(&provider.url)
                .map_err(|err| invalid(format!("provider {name:?}"), format!("invalid url {:?}: {err}", provider.url)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid(
                    format!("provider {name:?}"),
                    format!("unsupported scheme {:?} (supported: http, https)", parsed.scheme()),
                ));
            }
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(invalid(format!("provider {name:?}"), "url must include a host"));
            }
            let path = parsed.path().trim_end_matches('/').to_string();
            parsed.set_path(&path);
            provider.parsed_url = Some(parsed);
        }

        if self.models.is_empty() {
            return Err(invalid("models", "at least one model must be configured"));
        }

        let providers = &self.providers;
        for (id, model) in &mut self.models {
            model.id = id.clone();
            if model.provider.is_empty() {
                return Err(invalid(format!("model {id:?}"), "provider is required"));
            }
            let provider = providers
                .get(&model.provider)
                .ok_or_else(|| invalid(format!("model {id:?}"), format!("provider {:?} not found", model.provider)))?;
            if model.model.is_empty() {
                return Err(invalid(format!("model {id:?}"), "model is required"));
            }
            if model.model_type.is_empty() {
                return Err(invalid(format!("model {id:?}"), "type is required"));
            }
            let dialect = Dialect::parse(&model.model_type).ok_or_else(|| {
                invalid(
                    format!("model {id:?}"),
                    format!("unsupported type {:?} (supported: openai, anthropic, bedrock)", model.model_type),
                )
            })?;
            model.dialect = Some(dialect);
            if model.attempts == 0 {
                model.attempts = 1;
            }
            if model.timeout_ms == 0 {
                model.timeout_ms = self.retry.default_timeout_ms;
            }
            if dialect == Dialect::Bedrock {
                validate_bedrock_credentials(&model.provider, provider)
                    .map_err(|reason| invalid(format!("model {id:?}"), reason))?;
            }
        }

        if self.listeners.is_empty() {
            return Err(invalid("listeners", "at least one listener must be configured"));
        }

        let mut names: HashSet<String> = HashSet::new();
        let mut addrs: HashMap<String, String> = HashMap::new();

        for (index, listener) in self.listeners.iter_mut().enumerate() {
            if listener.name.is_empty() {
                return Err(invalid(format!("listener {index}"), "name is required"));
            }
            let name = listener.name.clone();
            if !names.insert(name.clone()) {
                return Err(invalid(format!("listener {name:?}"), "duplicate name"));
            }
            if listener.port == 0 {
                return Err(invalid(format!("listener {name:?}"), "port must be between 1 and 65535"));
            }
            let addr = format!("{}:{}", listener.host, listener.port);
            if let Some(other) = addrs.insert(addr.clone(), name.clone()) {
                return Err(invalid(
                    format!("listener {name:?}"),
                    format!("duplicate listen address {addr:?} (already used by listener {other:?})"),
                ));
            }
            if listener.models.is_empty() {
                return Err(invalid(format!("listener {name:?}"), "must reference at least one model"));
            }

            listener.resolved_models = Vec::with_capacity(listener.models.len());
            let mut listener_dialect: Option<Dialect> = None;
            for model_id in &listener.models {
                let model = self
                    .models
                    .get(model_id)
                    .ok_or_else(|| invalid(format!("listener {name:?}"), format!("model {model_id:?} not found")))?;
                match (listener_dialect, model.dialect) {
                    (None, dialect) => listener_dialect = dialect,
                    (Some(expected), Some(dialect)) if dialect != expected => {
                        return Err(invalid(
                            format!("listener {name:?}"),
                            format!(
                                "mixed model types are not allowed (expected {expected}, got {dialect} from model {model_id:?})"
                            ),
                        ));
                    }
                    _ => {}
                }
                listener.resolved_models.push(model.clone());
            }
            listener.dialect = listener_dialect;
        }

        Ok(())
    }
}

/// Bedrock needs the access key id and secret key together; a session
/// token additionally needs both. No credentials at all means requests
/// go out unsigned.
fn validate_bedrock_credentials(provider_name: &str, provider: &Provider) -> std::result::Result<(), String> {
    let has_access_key = !provider.aws_access_key_id.is_empty();
    let has_secret_key = !provider.aws_secret_access_key.is_empty();
    let has_session_token = !provider.aws_session_token.is_empty();

    if has_access_key != has_secret_key {
        return Err(format!(
            "provider {provider_name:?}: bedrock requires aws_access_key_id and aws_secret_access_key to be configured together"
        ));
    }
    if has_session_token && !has_access_key {
        return Err(format!(
            "provider {provider_name:?}: bedrock aws_session_token requires aws_access_key_id and aws_secret_access_key"
        ));
    }
    Ok(())
}
