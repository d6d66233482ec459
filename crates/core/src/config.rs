use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::execution::Budgets;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub reasoning: LlmConfig,
    pub negotiation: LlmConfig,
    pub engine: EngineConfig,
    pub store: StoreConfig,
    pub monitor: MonitorConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_steps: u32,
    pub max_wall_time_secs: u64,
    pub negotiation_max_rounds: u32,
    pub negotiation_parse_attempts: u32,
    pub detection_max_attempts: u32,
    pub max_nesting_depth: u32,
    pub negotiation_outage_policy: NegotiationOutagePolicy,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub root_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub log_every_polls: u32,
    pub max_outage_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub persona: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

/// What the engine does when the negotiation service is down while the
/// reasoning service is still reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationOutagePolicy {
    Wait,
    FallbackToReasoning,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub store_root_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub reasoning_provider: Option<LlmProvider>,
    pub reasoning_model: Option<String>,
    pub reasoning_base_url: Option<String>,
    pub negotiation_provider: Option<LlmProvider>,
    pub negotiation_model: Option<String>,
    pub negotiation_base_url: Option<String>,
    pub max_steps: Option<u32>,
    pub health_check_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            reasoning: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 120,
                max_tokens: 2048,
                temperature: 0.7,
            },
            negotiation: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.2:3b".to_string(),
                timeout_secs: 30,
                max_tokens: 512,
                temperature: 0.0,
            },
            engine: EngineConfig {
                max_steps: 25,
                max_wall_time_secs: 600,
                negotiation_max_rounds: 5,
                negotiation_parse_attempts: 3,
                detection_max_attempts: 3,
                max_nesting_depth: 4,
                negotiation_outage_policy: NegotiationOutagePolicy::Wait,
            },
            store: StoreConfig { root_dir: PathBuf::from("data") },
            monitor: MonitorConfig {
                probe_interval_ms: 5_000,
                probe_timeout_ms: 2_000,
                poll_interval_ms: 500,
                log_every_polls: 20,
                max_outage_secs: None,
            },
            agent: AgentConfig {
                persona: "You are a careful assistant. Work step by step and use the available \
                          capabilities by name when you want something done."
                    .to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for NegotiationOutagePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "fallback_to_reasoning" => Ok(Self::FallbackToReasoning),
            other => Err(ConfigError::Validation(format!(
                "unsupported negotiation outage policy `{other}` (expected wait|fallback_to_reasoning)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl EngineConfig {
    pub fn budgets(&self) -> Budgets {
        Budgets {
            max_steps: self.max_steps,
            max_wall_time: Duration::from_secs(self.max_wall_time_secs),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("ganglion.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(reasoning) = patch.reasoning {
            apply_llm_patch(&mut self.reasoning, reasoning);
        }
        if let Some(negotiation) = patch.negotiation {
            apply_llm_patch(&mut self.negotiation, negotiation);
        }

        if let Some(engine) = patch.engine {
            if let Some(max_steps) = engine.max_steps {
                self.engine.max_steps = max_steps;
            }
            if let Some(max_wall_time_secs) = engine.max_wall_time_secs {
                self.engine.max_wall_time_secs = max_wall_time_secs;
            }
            if let Some(rounds) = engine.negotiation_max_rounds {
                self.engine.negotiation_max_rounds = rounds;
            }
            if let Some(attempts) = engine.negotiation_parse_attempts {
                self.engine.negotiation_parse_attempts = attempts;
            }
            if let Some(attempts) = engine.detection_max_attempts {
                self.engine.detection_max_attempts = attempts;
            }
            if let Some(depth) = engine.max_nesting_depth {
                self.engine.max_nesting_depth = depth;
            }
            if let Some(policy) = engine.negotiation_outage_policy {
                self.engine.negotiation_outage_policy = policy;
            }
        }

        if let Some(store) = patch.store {
            if let Some(root_dir) = store.root_dir {
                self.store.root_dir = root_dir;
            }
        }

        if let Some(monitor) = patch.monitor {
            if let Some(probe_interval_ms) = monitor.probe_interval_ms {
                self.monitor.probe_interval_ms = probe_interval_ms;
            }
            if let Some(probe_timeout_ms) = monitor.probe_timeout_ms {
                self.monitor.probe_timeout_ms = probe_timeout_ms;
            }
            if let Some(poll_interval_ms) = monitor.poll_interval_ms {
                self.monitor.poll_interval_ms = poll_interval_ms;
            }
            if let Some(log_every_polls) = monitor.log_every_polls {
                self.monitor.log_every_polls = log_every_polls;
            }
            if let Some(max_outage_secs) = monitor.max_outage_secs {
                self.monitor.max_outage_secs = Some(max_outage_secs);
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(persona) = agent.persona {
                self.agent.persona = persona;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        apply_llm_env(&mut self.reasoning, "GANGLION_REASONING")?;
        apply_llm_env(&mut self.negotiation, "GANGLION_NEGOTIATION")?;

        if let Some(value) = read_env("GANGLION_ENGINE_MAX_STEPS") {
            self.engine.max_steps = parse_u32("GANGLION_ENGINE_MAX_STEPS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_ENGINE_MAX_WALL_TIME_SECS") {
            self.engine.max_wall_time_secs =
                parse_u64("GANGLION_ENGINE_MAX_WALL_TIME_SECS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_ENGINE_NEGOTIATION_MAX_ROUNDS") {
            self.engine.negotiation_max_rounds =
                parse_u32("GANGLION_ENGINE_NEGOTIATION_MAX_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_ENGINE_DETECTION_MAX_ATTEMPTS") {
            self.engine.detection_max_attempts =
                parse_u32("GANGLION_ENGINE_DETECTION_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_ENGINE_MAX_NESTING_DEPTH") {
            self.engine.max_nesting_depth =
                parse_u32("GANGLION_ENGINE_MAX_NESTING_DEPTH", &value)?;
        }
        if let Some(value) = read_env("GANGLION_ENGINE_NEGOTIATION_OUTAGE_POLICY") {
            self.engine.negotiation_outage_policy = value.parse()?;
        }

        if let Some(value) = read_env("GANGLION_STORE_ROOT_DIR") {
            self.store.root_dir = PathBuf::from(value);
        }

        if let Some(value) = read_env("GANGLION_MONITOR_PROBE_INTERVAL_MS") {
            self.monitor.probe_interval_ms =
                parse_u64("GANGLION_MONITOR_PROBE_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_MONITOR_POLL_INTERVAL_MS") {
            self.monitor.poll_interval_ms = parse_u64("GANGLION_MONITOR_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("GANGLION_MONITOR_MAX_OUTAGE_SECS") {
            self.monitor.max_outage_secs =
                Some(parse_u64("GANGLION_MONITOR_MAX_OUTAGE_SECS", &value)?);
        }

        if let Some(value) = read_env("GANGLION_AGENT_PERSONA") {
            self.agent.persona = value;
        }

        if let Some(value) = read_env("GANGLION_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("GANGLION_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("GANGLION_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("GANGLION_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("GANGLION_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("GANGLION_LOGGING_LEVEL").or_else(|| read_env("GANGLION_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("GANGLION_LOGGING_FORMAT").or_else(|| read_env("GANGLION_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(root_dir) = overrides.store_root_dir {
            self.store.root_dir = root_dir;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(provider) = overrides.reasoning_provider {
            self.reasoning.provider = provider;
        }
        if let Some(model) = overrides.reasoning_model {
            self.reasoning.model = model;
        }
        if let Some(base_url) = overrides.reasoning_base_url {
            self.reasoning.base_url = Some(base_url);
        }
        if let Some(provider) = overrides.negotiation_provider {
            self.negotiation.provider = provider;
        }
        if let Some(model) = overrides.negotiation_model {
            self.negotiation.model = model;
        }
        if let Some(base_url) = overrides.negotiation_base_url {
            self.negotiation.base_url = Some(base_url);
        }
        if let Some(max_steps) = overrides.max_steps {
            self.engine.max_steps = max_steps;
        }
        if let Some(port) = overrides.health_check_port {
            self.server.health_check_port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm("reasoning", &self.reasoning)?;
        validate_llm("negotiation", &self.negotiation)?;
        validate_engine(&self.engine)?;
        validate_store(&self.store)?;
        validate_monitor(&self.monitor)?;
        validate_agent(&self.agent)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn apply_llm_patch(target: &mut LlmConfig, patch: LlmPatch) {
    if let Some(provider) = patch.provider {
        target.provider = provider;
    }
    if let Some(api_key_value) = patch.api_key {
        target.api_key = Some(secret_value(api_key_value));
    }
    if let Some(base_url) = patch.base_url {
        target.base_url = Some(base_url);
    }
    if let Some(model) = patch.model {
        target.model = model;
    }
    if let Some(timeout_secs) = patch.timeout_secs {
        target.timeout_secs = timeout_secs;
    }
    if let Some(max_tokens) = patch.max_tokens {
        target.max_tokens = max_tokens;
    }
    if let Some(temperature) = patch.temperature {
        target.temperature = temperature;
    }
}

fn apply_llm_env(target: &mut LlmConfig, prefix: &str) -> Result<(), ConfigError> {
    if let Some(value) = read_env(&format!("{prefix}_PROVIDER")) {
        target.provider = value.parse()?;
    }
    if let Some(value) = read_env(&format!("{prefix}_API_KEY")) {
        target.api_key = Some(secret_value(value));
    }
    if let Some(value) = read_env(&format!("{prefix}_BASE_URL")) {
        target.base_url = Some(value);
    }
    if let Some(value) = read_env(&format!("{prefix}_MODEL")) {
        target.model = value;
    }
    let key = format!("{prefix}_TIMEOUT_SECS");
    if let Some(value) = read_env(&key) {
        target.timeout_secs = parse_u64(&key, &value)?;
    }
    let key = format!("{prefix}_MAX_TOKENS");
    if let Some(value) = read_env(&key) {
        target.max_tokens = parse_u32(&key, &value)?;
    }
    Ok(())
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("ganglion.toml"), PathBuf::from("config/ganglion.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(section: &str, llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(format!(
            "{section}.timeout_secs must be in range 1..=300"
        )));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{section}.model must not be empty")));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(format!(
            "{section}.temperature must be in range 0.0..=2.0"
        )));
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "{section}.base_url must start with http:// or https://"
            )));
        }
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(format!(
                    "{section}.api_key is required for openai/anthropic providers"
                )));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(format!(
                    "{section}.base_url is required for ollama provider"
                )));
            }
        }
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_steps == 0 {
        return Err(ConfigError::Validation(
            "engine.max_steps must be greater than zero".to_string(),
        ));
    }
    if engine.max_wall_time_secs == 0 {
        return Err(ConfigError::Validation(
            "engine.max_wall_time_secs must be greater than zero".to_string(),
        ));
    }
    if engine.negotiation_max_rounds == 0 || engine.negotiation_max_rounds > 20 {
        return Err(ConfigError::Validation(
            "engine.negotiation_max_rounds must be in range 1..=20".to_string(),
        ));
    }
    if engine.negotiation_parse_attempts == 0 || engine.detection_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "engine.negotiation_parse_attempts and engine.detection_max_attempts must be greater than zero"
                .to_string(),
        ));
    }
    if engine.max_nesting_depth == 0 {
        return Err(ConfigError::Validation(
            "engine.max_nesting_depth must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.root_dir.as_os_str().is_empty() {
        return Err(ConfigError::Validation("store.root_dir must not be empty".to_string()));
    }
    Ok(())
}

fn validate_monitor(monitor: &MonitorConfig) -> Result<(), ConfigError> {
    if monitor.probe_interval_ms == 0 || monitor.poll_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "monitor.probe_interval_ms and monitor.poll_interval_ms must be greater than zero"
                .to_string(),
        ));
    }
    if monitor.probe_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "monitor.probe_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if monitor.log_every_polls == 0 {
        return Err(ConfigError::Validation(
            "monitor.log_every_polls must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.persona.trim().is_empty() {
        return Err(ConfigError::Validation("agent.persona must not be empty".to_string()));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    reasoning: Option<LlmPatch>,
    negotiation: Option<LlmPatch>,
    engine: Option<EnginePatch>,
    store: Option<StorePatch>,
    monitor: Option<MonitorPatch>,
    agent: Option<AgentPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_steps: Option<u32>,
    max_wall_time_secs: Option<u64>,
    negotiation_max_rounds: Option<u32>,
    negotiation_parse_attempts: Option<u32>,
    detection_max_attempts: Option<u32>,
    max_nesting_depth: Option<u32>,
    negotiation_outage_policy: Option<NegotiationOutagePolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    root_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitorPatch {
    probe_interval_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    log_every_polls: Option<u32>,
    max_outage_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    persona: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
