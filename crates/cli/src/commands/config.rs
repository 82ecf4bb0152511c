use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use pricewise_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

struct Field {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key,
            Some(field.env_key),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let webhook_secret = config
        .signals
        .webhook_secret
        .as_ref()
        .map(|secret| redact_secret(secret.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let candidates = config
        .experiments
        .default_candidates
        .iter()
        .map(|price| price.to_string())
        .collect::<Vec<_>>()
        .join(",");

    vec![
        Field {
            key: "database.url",
            value: config.database.url.clone(),
            env_key: "PRICEWISE_DATABASE_URL",
        },
        Field {
            key: "database.max_connections",
            value: config.database.max_connections.to_string(),
            env_key: "PRICEWISE_DATABASE_MAX_CONNECTIONS",
        },
        Field {
            key: "database.timeout_secs",
            value: config.database.timeout_secs.to_string(),
            env_key: "PRICEWISE_DATABASE_TIMEOUT_SECS",
        },
        Field {
            key: "server.bind_address",
            value: config.server.bind_address.clone(),
            env_key: "PRICEWISE_SERVER_BIND_ADDRESS",
        },
        Field {
            key: "server.health_check_port",
            value: config.server.health_check_port.to_string(),
            env_key: "PRICEWISE_SERVER_HEALTH_CHECK_PORT",
        },
        Field {
            key: "experiments.store_timeout_ms",
            value: config.experiments.store_timeout_ms.to_string(),
            env_key: "PRICEWISE_EXPERIMENTS_STORE_TIMEOUT_MS",
        },
        Field {
            key: "experiments.default_event_limit",
            value: config.experiments.default_event_limit.to_string(),
            env_key: "PRICEWISE_EXPERIMENTS_DEFAULT_EVENT_LIMIT",
        },
        Field {
            key: "experiments.default_candidates",
            value: candidates,
            env_key: "PRICEWISE_EXPERIMENTS_DEFAULT_CANDIDATES",
        },
        Field {
            key: "signals.enabled",
            value: config.signals.enabled.to_string(),
            env_key: "PRICEWISE_SIGNALS_ENABLED",
        },
        Field {
            key: "signals.webhook_url",
            value: config.signals.webhook_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            env_key: "PRICEWISE_SIGNALS_WEBHOOK_URL",
        },
        Field {
            key: "signals.webhook_secret",
            value: webhook_secret,
            env_key: "PRICEWISE_SIGNALS_WEBHOOK_SECRET",
        },
        Field {
            key: "signals.max_retries",
            value: config.signals.max_retries.to_string(),
            env_key: "PRICEWISE_SIGNALS_MAX_RETRIES",
        },
        Field {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_key: "PRICEWISE_LOGGING_LEVEL",
        },
        Field {
            key: "logging.format",
            value: format!("{:?}", config.logging.format),
            env_key: "PRICEWISE_LOGGING_FORMAT",
        },
        Field {
            key: "environment",
            value: format!("{:?}", config.environment),
            env_key: "PRICEWISE_ENVIRONMENT",
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["pricewise.toml", "config/pricewise.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
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

fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('_').or_else(|| trimmed.split_once('-')) {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, redact_secret};

    #[test]
    fn secrets_keep_only_their_prefix() {
        assert_eq!(redact_secret("whsec-abc123"), "whsec-***");
        assert_eq!(redact_secret("opaque"), "<redacted>");
        assert_eq!(redact_secret("  "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_config_documents() {
        let doc: Value = "[signals]\nenabled = true\n".parse().expect("toml");

        assert!(contains_path(&doc, "signals.enabled"));
        assert!(!contains_path(&doc, "signals.webhook_url"));
    }
}
