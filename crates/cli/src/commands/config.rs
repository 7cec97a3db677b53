use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use claimflow_core::config::{AppConfig, LoadOptions};
use serde::Serialize;
use toml::Value;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct ConfigField {
    key: &'static str,
    value: String,
    source: String,
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let fields: Vec<ConfigField> = [
        ("database.url", redact_url(&config.database.url), &["CLAIMFLOW_DATABASE_URL"][..]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CLAIMFLOW_DATABASE_MAX_CONNECTIONS"][..],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["CLAIMFLOW_DATABASE_TIMEOUT_SECS"][..],
        ),
        (
            "approvals.decision_timeout_secs",
            config.approvals.decision_timeout_secs.to_string(),
            &["CLAIMFLOW_APPROVALS_DECISION_TIMEOUT_SECS"][..],
        ),
        (
            "approvals.max_conflict_retries",
            config.approvals.max_conflict_retries.to_string(),
            &["CLAIMFLOW_APPROVALS_MAX_CONFLICT_RETRIES"][..],
        ),
        (
            "approvals.default_base_currency",
            config.approvals.default_base_currency.clone(),
            &["CLAIMFLOW_APPROVALS_DEFAULT_BASE_CURRENCY"][..],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["CLAIMFLOW_LOGGING_LEVEL", "CLAIMFLOW_LOG_LEVEL"][..],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["CLAIMFLOW_LOGGING_FORMAT", "CLAIMFLOW_LOG_FORMAT"][..],
        ),
    ]
    .into_iter()
    .map(|(key, value, env_keys)| ConfigField {
        key,
        value,
        source: field_source(
            key,
            env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        ),
    })
    .collect();

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(fields.iter().map(render_line));

    CommandResult::success_with("config", lines.join("\n"), &fields)
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from("claimflow.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/claimflow.toml");
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
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|env_key| env::var_os(env_key).is_some()) {
        return format!("env ({env_key})");
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

fn render_line(field: &ConfigField) -> String {
    format!("- {} = {} (source: {})", field.key, field.value, field.source)
}

/// Hides credentials embedded in a database URL.
fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.split_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => url.to_string(),
    }
}
