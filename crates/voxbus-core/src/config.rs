//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::registry::{RuleError, RuleRegistry};
use crate::types::{Priority, SourceId};

/// Top-level voxbus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<BusConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    /// One entry per state key. Defaults to the built-in conversational rule set.
    #[serde(default = "default_rules")]
    pub rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: None,
            bus: None,
            logging: None,
            rules: default_rules(),
        }
    }
}

/// Write policy for a single key, as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub key: String,
    pub allowed_sources: Vec<SourceId>,
    #[serde(default)]
    pub min_priority: Priority,
    /// Only values equal to this one (text form, case-insensitive) are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_if: Option<serde_json::Value>,
}

impl RuleConfig {
    pub fn new(key: &str, allowed_sources: &[SourceId], min_priority: Priority) -> Self {
        Self {
            key: key.to_string(),
            allowed_sources: allowed_sources.to_vec(),
            min_priority,
            allow_if: None,
        }
    }
}

/// Rules for the conversational keys the voice pipeline uses.
pub fn default_rules() -> Vec<RuleConfig> {
    use SourceId::*;

    let front_ends = [Gui, Terminal, Web];
    let mut talk_sources = front_ends.to_vec();
    talk_sources.extend([Stt, Llm, ListeningController]);
    let mut pause_sources = front_ends.to_vec();
    // The listening controller resumes as `system` after a transcription.
    pause_sources.extend([ListeningController, System]);

    vec![
        RuleConfig::new("human_speaking", &[Stt], 0),
        RuleConfig::new("ai_speaking", &[Tts], 2),
        RuleConfig::new("ai_thinking", &[Llm], 0),
        RuleConfig::new("stt_ready", &[Stt], 0),
        RuleConfig::new("tts_ready", &[Llm, Tts], 0),
        RuleConfig::new("tts_text", &[Llm, Tts], 0),
        RuleConfig::new("interrupt_ai_speech", &[Stt, Tts, Llm], 10),
        RuleConfig::new("user_wants_to_talk", &talk_sources, 0),
        RuleConfig::new("listening_paused", &pause_sources, 0),
        RuleConfig::new("acknowledgment_playing", &[Llm, Tts], 0),
        RuleConfig::new("gui_listening_status", &[Llm], 0),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<GatewayAuthConfig>,

    /// Largest accepted WebSocket frame, in bytes.
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_port() -> u16 {
    6390
}

fn default_max_payload() -> usize {
    1_048_576
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayAuthConfig {
    /// Auth mode: "none" or "token". Default: "none".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl GatewayAuthConfig {
    /// Resolve the auth token from direct value or env var.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }

    /// Get the effective auth mode.
    pub fn effective_mode(&self) -> &str {
        self.mode.as_deref().unwrap_or("none")
    }
}

/// Tuning for the state store, notifier, and clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Notifier buffer per subscriber before it has to resync from the store.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Client-side bound on `propose`/`get` round trips.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Where to persist the store between restarts. Unset = memory only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<String>,

    #[serde(default = "default_snapshot_debounce_ms")]
    pub snapshot_debounce_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            request_timeout_ms: default_request_timeout_ms(),
            snapshot_path: None,
            snapshot_debounce_ms: default_snapshot_debounce_ms(),
        }
    }
}

impl BusConfig {
    /// Snapshot file with `~` expanded.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.snapshot_path.as_ref().map(|p| {
            let expanded = shellexpand::tilde(p);
            PathBuf::from(expanded.as_ref())
        })
    }
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_snapshot_debounce_ms() -> u64 {
    250
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "voxbus_state=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

static ENV_VAR_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("valid env-var pattern"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn parse(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted).map_err(|e| crate::error::VoxbusError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json5")
    }

    /// Gateway port.
    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or_else(default_port)
    }

    /// Gateway bind address.
    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    /// WebSocket URL clients use to reach the gateway.
    pub fn gateway_url(&self) -> String {
        let bind = self.gateway_bind();
        let host = if bind == "0.0.0.0" { "127.0.0.1".to_string() } else { bind };
        format!("ws://{host}:{}/ws", self.gateway_port())
    }

    pub fn max_payload(&self) -> usize {
        self.gateway
            .as_ref()
            .map(|g| g.max_payload)
            .unwrap_or_else(default_max_payload)
    }

    pub fn bus(&self) -> BusConfig {
        self.bus.clone().unwrap_or_default()
    }

    /// Auth token clients should present, if token auth is configured.
    pub fn auth_token(&self) -> Option<String> {
        self.gateway
            .as_ref()
            .and_then(|g| g.auth.as_ref())
            .filter(|a| a.effective_mode() == "token")
            .and_then(|a| a.resolve_token())
    }

    /// Build the rule registry. Fails on malformed rules.
    pub fn registry(&self) -> Result<RuleRegistry, RuleError> {
        RuleRegistry::from_rules(&self.rules)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Err(e) = self.registry() {
            errors.push(e.to_string());
        }
        if self.rules.is_empty() {
            warnings.push("No rules configured; every proposal will be rejected".to_string());
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if let Some(auth) = &gw.auth {
                match auth.effective_mode() {
                    "none" => {}
                    "token" => {
                        if auth.resolve_token().is_none() {
                            errors.push("Token auth enabled but no token configured".to_string());
                        }
                    }
                    other => errors.push(format!("Unknown auth mode: {other}")),
                }
            }
        }

        let bus = self.bus();
        if bus.channel_capacity == 0 {
            errors.push("bus.channel_capacity must be at least 1".to_string());
        }
        if bus.request_timeout_ms == 0 {
            warnings.push("bus.request_timeout_ms is 0; every request will time out".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for voxbus data: `~/.voxbus/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".voxbus")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_VB_TOKEN", "tok-123") };
        let input = r#"{"token": "${TEST_VB_TOKEN}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("tok-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_VB_TOKEN") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_VB_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway_port(), 6390);
        assert_eq!(config.gateway_url(), "ws://127.0.0.1:6390/ws");
        assert_eq!(config.bus().channel_capacity, 1024);
        let registry = config.registry().unwrap();
        assert!(registry.contains(&"ai_speaking".into()));
        assert!(registry.contains(&"interrupt_ai_speech".into()));
    }

    #[test]
    fn test_default_rules_let_system_resume_listening() {
        let registry = Config::default().registry().unwrap();
        let paused = registry.policy_for(&"listening_paused".into()).unwrap();
        assert!(paused.allows(SourceId::System));
        assert!(paused.allows(SourceId::ListeningController));
        assert!(paused.allows(SourceId::Gui));
        let speaking = registry.policy_for(&"ai_speaking".into()).unwrap();
        assert!(!speaking.allows(SourceId::System));
    }

    #[test]
    fn test_rules_parse_from_json5() {
        let config = Config::parse(
            r#"{
                // comments are fine in json5
                rules: [
                    { key: "ai_speaking", allowed_sources: ["tts"], min_priority: 2 },
                    { key: "listening_paused", allowed_sources: ["gui", "listening_controller"] },
                ],
            }"#,
        )
        .unwrap();
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[1].min_priority, 0);
        assert_eq!(config.registry().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_source_fails_to_load() {
        let err = Config::parse(r#"{ rules: [{ key: "ai_speaking", allowed_sources: ["speaker"] }] }"#)
            .unwrap_err();
        assert!(err.to_string().contains("speaker"), "got: {err}");
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = Config::parse(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_logging_config_filters() {
        let config = Config::parse(
            r#"{ "logging": { "format": "json", "filters": ["voxbus_gateway=debug", "voxbus_state=trace"] } }"#,
        )
        .unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.filters, vec!["voxbus_gateway=debug", "voxbus_state=trace"]);
    }

    #[test]
    fn test_validate_reports_duplicate_rule() {
        let config = Config {
            rules: vec![
                RuleConfig::new("tts_ready", &[SourceId::Llm], 0),
                RuleConfig::new("tts_ready", &[SourceId::Tts], 0),
            ],
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("tts_ready")),
            "Expected a duplicate-key error, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_token_mode_without_token() {
        let config = Config {
            gateway: Some(GatewayConfig {
                port: 6390,
                bind: None,
                auth: Some(GatewayAuthConfig {
                    mode: Some("token".into()),
                    token: None,
                    token_env: None,
                }),
                max_payload: default_max_payload(),
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("token")), "got: {errors:?}");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json5")).unwrap();
        assert_eq!(config.rules, default_rules());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json5");
        std::fs::write(
            &path,
            r#"{ gateway: { port: 7000 }, rules: [{ key: "stt_ready", allowed_sources: ["stt"] }] }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.gateway_port(), 7000);
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn test_snapshot_path_expands_tilde() {
        let bus = BusConfig {
            snapshot_path: Some("~/voxbus-state.json".into()),
            ..BusConfig::default()
        };
        let path = bus.snapshot_path().unwrap();
        assert!(!path.to_string_lossy().starts_with('~'));
    }
}
