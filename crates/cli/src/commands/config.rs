use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use callquote_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    render(&config, config_file_doc.as_ref(), config_file_path.as_deref())
}

fn render(config: &AppConfig, doc: Option<&Value>, path: Option<&Path>) -> String {
    let telephony = &config.telephony;
    let conversation = &config.conversation;
    let entries: Vec<(&str, String, Option<&str>)> = vec![
        ("database.url", config.database.url.clone(), Some("CALLQUOTE_DATABASE_URL")),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            Some("CALLQUOTE_DATABASE_MAX_CONNECTIONS"),
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            Some("CALLQUOTE_DATABASE_TIMEOUT_SECS"),
        ),
        ("llm.provider", config.llm.provider.as_str().to_string(), Some("CALLQUOTE_LLM_PROVIDER")),
        ("llm.model", config.llm.model.clone(), Some("CALLQUOTE_LLM_MODEL")),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("CALLQUOTE_LLM_BASE_URL"),
        ),
        (
            "llm.api_key",
            redact_secret(config.llm.api_key.as_ref().map(|key| key.expose_secret())),
            Some("CALLQUOTE_LLM_API_KEY"),
        ),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), Some("CALLQUOTE_LLM_TIMEOUT_SECS")),
        ("server.bind_address", config.server.bind_address.clone(), Some("CALLQUOTE_SERVER_BIND_ADDRESS")),
        ("server.port", config.server.port.to_string(), Some("CALLQUOTE_SERVER_PORT")),
        (
            "telephony.account_sid",
            telephony.account_sid.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("CALLQUOTE_TELEPHONY_ACCOUNT_SID"),
        ),
        (
            "telephony.auth_token",
            redact_secret(telephony.auth_token.as_ref().map(|token| token.expose_secret())),
            Some("CALLQUOTE_TELEPHONY_AUTH_TOKEN"),
        ),
        (
            "telephony.from_number",
            telephony.from_number.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("CALLQUOTE_TELEPHONY_FROM_NUMBER"),
        ),
        (
            "telephony.transfer_number",
            telephony.transfer_number.clone().unwrap_or_else(|| "<unset>".to_string()),
            Some("CALLQUOTE_TELEPHONY_TRANSFER_NUMBER"),
        ),
        ("telephony.voice", telephony.voice.clone(), Some("CALLQUOTE_TELEPHONY_VOICE")),
        (
            "conversation.agent_rollout_pct",
            conversation.agent_rollout_pct.to_string(),
            Some("CALLQUOTE_CONVERSATION_AGENT_ROLLOUT_PCT"),
        ),
        (
            "conversation.stuck_loop_threshold",
            conversation.stuck_loop_threshold.to_string(),
            Some("CALLQUOTE_CONVERSATION_STUCK_LOOP_THRESHOLD"),
        ),
        (
            "conversation.idle_timeout_secs",
            conversation.idle_timeout_secs.to_string(),
            Some("CALLQUOTE_CONVERSATION_IDLE_TIMEOUT_SECS"),
        ),
        ("conversation.sweep_interval_secs", conversation.sweep_interval_secs.to_string(), None),
        ("geocoding.enabled", config.geocoding.enabled.to_string(), Some("CALLQUOTE_GEOCODING_ENABLED")),
        (
            "businesses.directory",
            config.businesses.directory.display().to_string(),
            Some("CALLQUOTE_BUSINESSES_DIRECTORY"),
        ),
        ("logging.level", config.logging.level.clone(), Some("CALLQUOTE_LOGGING_LEVEL")),
        ("logging.format", format!("{:?}", config.logging.format), Some("CALLQUOTE_LOGGING_FORMAT")),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_key) in entries {
        lines.push(render_line(key, &value, field_source(key, env_key, doc, path)));
    }
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("callquote.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/callquote.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: Option<&str>) -> String {
    match secret.map(str::trim) {
        None => "<unset>".to_string(),
        Some("") => "<empty>".to_string(),
        Some(value) if value.chars().count() > 8 => {
            format!("{}***", value.chars().take(4).collect::<String>())
        }
        Some(_) => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use callquote_core::config::AppConfig;

    use super::{redact_secret, render};

    #[test]
    fn secrets_are_never_printed_in_full() {
        assert_eq!(redact_secret(None), "<unset>");
        assert_eq!(redact_secret(Some("  ")), "<empty>");
        assert_eq!(redact_secret(Some("short")), "<redacted>");
        assert_eq!(redact_secret(Some("sk-ant-abcdefghijkl")), "sk-a***");
    }

    #[test]
    fn file_values_are_attributed_to_the_file() {
        let doc: toml::Value = "[llm]\nmodel = \"llama3.1\"\n".parse().expect("toml");
        let rendered = render(&AppConfig::default(), Some(&doc), Some(Path::new("callquote.toml")));

        assert!(rendered.contains("- llm.model = llama3.1 (source: file (callquote.toml))"));
        assert!(rendered.contains("- conversation.sweep_interval_secs = 60 (source: default)"));
    }
}
