use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub telephony: TelephonyConfig,
    pub conversation: ConversationConfig,
    pub geocoding: GeocodingConfig,
    pub businesses: BusinessesConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TelephonyConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<SecretString>,
    pub from_number: Option<String>,
    /// Fallback transfer target when a business profile has none.
    pub transfer_number: Option<String>,
    pub api_base_url: String,
    pub voice: String,
    pub language: String,
    pub gather_timeout_secs: u32,
    pub speech_timeout_secs: u32,
}

impl TelephonyConfig {
    /// SMS delivery needs all three credentials.
    pub fn sms_enabled(&self) -> bool {
        let present = |value: Option<&str>| value.map(|v| !v.trim().is_empty()).unwrap_or(false);
        present(self.account_sid.as_deref())
            && present(self.auth_token.as_ref().map(|token| token.expose_secret()))
            && present(self.from_number.as_deref())
    }
}

#[derive(Clone, Debug)]
pub struct ConversationConfig {
    pub history_turns: usize,
    pub stuck_loop_threshold: u32,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub agent_rollout_pct: u8,
    pub allow_session_reset: bool,
}

#[derive(Clone, Debug)]
pub struct GeocodingConfig {
    pub enabled: bool,
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BusinessesConfig {
    pub directory: PathBuf,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
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
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub server_port: Option<u16>,
    pub businesses_directory: Option<PathBuf>,
    pub agent_rollout_pct: Option<u8>,
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
            database: DatabaseConfig {
                url: "sqlite://callquote.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 8,
                max_tokens: 500,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8000,
                graceful_shutdown_secs: 15,
            },
            telephony: TelephonyConfig {
                account_sid: None,
                auth_token: None,
                from_number: None,
                transfer_number: None,
                api_base_url: "https://api.twilio.com".to_string(),
                voice: "Polly.Joanna".to_string(),
                language: "en-US".to_string(),
                gather_timeout_secs: 5,
                speech_timeout_secs: 3,
            },
            conversation: ConversationConfig {
                history_turns: 10,
                stuck_loop_threshold: 2,
                idle_timeout_secs: 900,
                sweep_interval_secs: 60,
                agent_rollout_pct: 100,
                allow_session_reset: false,
            },
            geocoding: GeocodingConfig {
                enabled: true,
                base_url: "https://nominatim.openstreetmap.org".to_string(),
                user_agent: "callquote/0.1".to_string(),
                timeout_secs: 5,
            },
            businesses: BusinessesConfig { directory: PathBuf::from("businesses") },
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

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("callquote.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(telephony) = patch.telephony {
            if let Some(account_sid) = telephony.account_sid {
                self.telephony.account_sid = Some(account_sid);
            }
            if let Some(auth_token) = telephony.auth_token {
                self.telephony.auth_token = Some(secret_value(auth_token));
            }
            if let Some(from_number) = telephony.from_number {
                self.telephony.from_number = Some(from_number);
            }
            if let Some(transfer_number) = telephony.transfer_number {
                self.telephony.transfer_number = Some(transfer_number);
            }
            if let Some(api_base_url) = telephony.api_base_url {
                self.telephony.api_base_url = api_base_url;
            }
            if let Some(voice) = telephony.voice {
                self.telephony.voice = voice;
            }
            if let Some(language) = telephony.language {
                self.telephony.language = language;
            }
            if let Some(gather_timeout_secs) = telephony.gather_timeout_secs {
                self.telephony.gather_timeout_secs = gather_timeout_secs;
            }
            if let Some(speech_timeout_secs) = telephony.speech_timeout_secs {
                self.telephony.speech_timeout_secs = speech_timeout_secs;
            }
        }

        if let Some(conversation) = patch.conversation {
            if let Some(history_turns) = conversation.history_turns {
                self.conversation.history_turns = history_turns;
            }
            if let Some(stuck_loop_threshold) = conversation.stuck_loop_threshold {
                self.conversation.stuck_loop_threshold = stuck_loop_threshold;
            }
            if let Some(idle_timeout_secs) = conversation.idle_timeout_secs {
                self.conversation.idle_timeout_secs = idle_timeout_secs;
            }
            if let Some(sweep_interval_secs) = conversation.sweep_interval_secs {
                self.conversation.sweep_interval_secs = sweep_interval_secs;
            }
            if let Some(agent_rollout_pct) = conversation.agent_rollout_pct {
                self.conversation.agent_rollout_pct = agent_rollout_pct;
            }
            if let Some(allow_session_reset) = conversation.allow_session_reset {
                self.conversation.allow_session_reset = allow_session_reset;
            }
        }

        if let Some(geocoding) = patch.geocoding {
            if let Some(enabled) = geocoding.enabled {
                self.geocoding.enabled = enabled;
            }
            if let Some(base_url) = geocoding.base_url {
                self.geocoding.base_url = base_url;
            }
            if let Some(user_agent) = geocoding.user_agent {
                self.geocoding.user_agent = user_agent;
            }
            if let Some(timeout_secs) = geocoding.timeout_secs {
                self.geocoding.timeout_secs = timeout_secs;
            }
        }

        if let Some(businesses) = patch.businesses {
            if let Some(directory) = businesses.directory {
                self.businesses.directory = directory;
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
        if let Some(value) = read_env("CALLQUOTE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CALLQUOTE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("CALLQUOTE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("CALLQUOTE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CALLQUOTE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CALLQUOTE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CALLQUOTE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CALLQUOTE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CALLQUOTE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("CALLQUOTE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_env("CALLQUOTE_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("CALLQUOTE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CALLQUOTE_SERVER_PORT") {
            self.server.port = parse_env("CALLQUOTE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("CALLQUOTE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_ACCOUNT_SID") {
            self.telephony.account_sid = Some(value);
        }
        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_AUTH_TOKEN") {
            self.telephony.auth_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_FROM_NUMBER") {
            self.telephony.from_number = Some(value);
        }
        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_TRANSFER_NUMBER") {
            self.telephony.transfer_number = Some(value);
        }
        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_API_BASE_URL") {
            self.telephony.api_base_url = value;
        }
        if let Some(value) = read_env("CALLQUOTE_TELEPHONY_VOICE") {
            self.telephony.voice = value;
        }

        if let Some(value) = read_env("CALLQUOTE_CONVERSATION_HISTORY_TURNS") {
            self.conversation.history_turns =
                parse_env("CALLQUOTE_CONVERSATION_HISTORY_TURNS", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_CONVERSATION_STUCK_LOOP_THRESHOLD") {
            self.conversation.stuck_loop_threshold =
                parse_env("CALLQUOTE_CONVERSATION_STUCK_LOOP_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_CONVERSATION_IDLE_TIMEOUT_SECS") {
            self.conversation.idle_timeout_secs =
                parse_env("CALLQUOTE_CONVERSATION_IDLE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_CONVERSATION_AGENT_ROLLOUT_PCT") {
            self.conversation.agent_rollout_pct =
                parse_env("CALLQUOTE_CONVERSATION_AGENT_ROLLOUT_PCT", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_CONVERSATION_ALLOW_SESSION_RESET") {
            self.conversation.allow_session_reset =
                parse_env("CALLQUOTE_CONVERSATION_ALLOW_SESSION_RESET", &value)?;
        }

        if let Some(value) = read_env("CALLQUOTE_GEOCODING_ENABLED") {
            self.geocoding.enabled = parse_env("CALLQUOTE_GEOCODING_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CALLQUOTE_GEOCODING_BASE_URL") {
            self.geocoding.base_url = value;
        }

        if let Some(value) = read_env("CALLQUOTE_BUSINESSES_DIRECTORY") {
            self.businesses.directory = PathBuf::from(value);
        }

        let log_level =
            read_env("CALLQUOTE_LOGGING_LEVEL").or_else(|| read_env("CALLQUOTE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CALLQUOTE_LOGGING_FORMAT").or_else(|| read_env("CALLQUOTE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(directory) = overrides.businesses_directory {
            self.businesses.directory = directory;
        }
        if let Some(agent_rollout_pct) = overrides.agent_rollout_pct {
            self.conversation.agent_rollout_pct = agent_rollout_pct;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm, &self.conversation)?;
        validate_server(&self.server)?;
        validate_telephony(&self.telephony)?;
        validate_conversation(&self.conversation)?;
        validate_geocoding(&self.geocoding)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("callquote.toml"), PathBuf::from("config/callquote.toml")]
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

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig, conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 60 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=60".to_string()));
    }

    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation("llm.max_tokens must be greater than zero".to_string()));
    }

    // With every call on the keyword strategy the extractor is never contacted.
    if conversation.agent_rollout_pct == 0 {
        return Ok(());
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers (or set conversation.agent_rollout_pct = 0)"
                        .to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_telephony(telephony: &TelephonyConfig) -> Result<(), ConfigError> {
    let base_url = telephony.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "telephony.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if telephony.voice.trim().is_empty() {
        return Err(ConfigError::Validation("telephony.voice must not be empty".to_string()));
    }

    if telephony.gather_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "telephony.gather_timeout_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_conversation(conversation: &ConversationConfig) -> Result<(), ConfigError> {
    if conversation.history_turns == 0 {
        return Err(ConfigError::Validation(
            "conversation.history_turns must be greater than zero".to_string(),
        ));
    }

    if conversation.stuck_loop_threshold < 2 {
        return Err(ConfigError::Validation(
            "conversation.stuck_loop_threshold must be at least 2".to_string(),
        ));
    }

    if conversation.idle_timeout_secs == 0 || conversation.sweep_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "conversation.idle_timeout_secs and conversation.sweep_interval_secs must be greater than zero"
                .to_string(),
        ));
    }

    if conversation.agent_rollout_pct > 100 {
        return Err(ConfigError::Validation(
            "conversation.agent_rollout_pct must be in range 0..=100".to_string(),
        ));
    }

    Ok(())
}

fn validate_geocoding(geocoding: &GeocodingConfig) -> Result<(), ConfigError> {
    if !geocoding.enabled {
        return Ok(());
    }

    if !geocoding.base_url.starts_with("http://") && !geocoding.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "geocoding.base_url must start with http:// or https://".to_string(),
        ));
    }

    if geocoding.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "geocoding.user_agent is required by the Nominatim usage policy".to_string(),
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

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    telephony: Option<TelephonyPatch>,
    conversation: Option<ConversationPatch>,
    geocoding: Option<GeocodingPatch>,
    businesses: Option<BusinessesPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TelephonyPatch {
    account_sid: Option<String>,
    auth_token: Option<String>,
    from_number: Option<String>,
    transfer_number: Option<String>,
    api_base_url: Option<String>,
    voice: Option<String>,
    language: Option<String>,
    gather_timeout_secs: Option<u32>,
    speech_timeout_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversationPatch {
    history_turns: Option<usize>,
    stuck_loop_threshold: Option<u32>,
    idle_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    agent_rollout_pct: Option<u8>,
    allow_session_reset: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct GeocodingPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    user_agent: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BusinessesPatch {
    directory: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_ANTHROPIC_KEY", "sk-ant-from-env");
        env::set_var("TEST_TWILIO_TOKEN", "twilio-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("callquote.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "anthropic"
api_key = "${TEST_ANTHROPIC_KEY}"
model = "claude-sonnet-4-20250514"

[telephony]
account_sid = "AC123"
auth_token = "${TEST_TWILIO_TOKEN}"
from_number = "+15550001111"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::Anthropic, "provider from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret())
                    == Some("sk-ant-from-env"),
                "api key should be loaded from environment",
            )?;
            ensure(config.telephony.sms_enabled(), "complete twilio credentials enable sms")?;
            Ok(())
        })();

        clear_vars(&["TEST_ANTHROPIC_KEY", "TEST_TWILIO_TOKEN"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["CALLQUOTE_TEST_UNSET_VAR"]);

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("callquote.toml");
        fs::write(&path, "[llm]\napi_key = \"${CALLQUOTE_TEST_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected interpolation failure".to_string()),
            Err(error) => error,
        };
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "CALLQUOTE_TEST_UNSET_VAR"),
            "error should name the missing variable",
        )
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CALLQUOTE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("CALLQUOTE_CONVERSATION_STUCK_LOOP_THRESHOLD", "3");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("callquote.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[conversation]
stuck_loop_threshold = 4
agent_rollout_pct = 50

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.conversation.stuck_loop_threshold == 3,
                "env threshold should win over file",
            )?;
            ensure(config.conversation.agent_rollout_pct == 50, "file rollout should apply")?;
            Ok(())
        })();

        clear_vars(&["CALLQUOTE_DATABASE_URL", "CALLQUOTE_CONVERSATION_STUCK_LOOP_THRESHOLD"]);
        result
    }

    #[test]
    fn anthropic_without_key_fails_unless_rollout_is_zero() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CALLQUOTE_LLM_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::Validation(ref message) if message.contains("llm.api_key")),
                "validation failure should mention llm.api_key",
            )?;

            let config = AppConfig::load(LoadOptions {
                overrides: ConfigOverrides {
                    agent_rollout_pct: Some(0),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.conversation.agent_rollout_pct == 0, "keyword-only config loads")
        })();

        clear_vars(&["CALLQUOTE_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CALLQUOTE_SERVER_PORT", "eighty");
        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("expected invalid override".to_string()),
            Err(error) => ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "CALLQUOTE_SERVER_PORT"),
                "error should name the env key",
            ),
        };

        clear_vars(&["CALLQUOTE_SERVER_PORT"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CALLQUOTE_LLM_API_KEY", "sk-secret-value");
        env::set_var("CALLQUOTE_TELEPHONY_AUTH_TOKEN", "twilio-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("twilio-secret-value"),
                "debug output should not contain auth token",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            ensure(!config.telephony.sms_enabled(), "sms stays disabled without account sid")?;
            Ok(())
        })();

        clear_vars(&["CALLQUOTE_LLM_API_KEY", "CALLQUOTE_TELEPHONY_AUTH_TOKEN"]);
        result
    }
}
