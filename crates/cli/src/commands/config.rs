use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chatcart_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// `(key path, env override, rendered value)` for every reported setting.
fn entries(config: &AppConfig) -> Vec<(&'static str, &'static str, String)> {
    let shipping = if config.pricing.shipping_methods.is_empty() {
        "<none>".to_string()
    } else {
        config
            .pricing
            .shipping_methods
            .iter()
            .map(|method| {
                let state = if method.enabled { "" } else { " (disabled)" };
                format!("{:?}:{}{state}", method.kind, method.cost)
            })
            .collect::<Vec<_>>()
            .join(", ")
    };

    vec![
        ("database.url", "CHATCART_DATABASE_URL", config.database.url.clone()),
        (
            "database.max_connections",
            "CHATCART_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        (
            "database.timeout_secs",
            "CHATCART_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        ("cart.ttl_hours", "CHATCART_CART_TTL_HOURS", config.cart.ttl_hours.to_string()),
        (
            "cart.lock_timeout_secs",
            "CHATCART_CART_LOCK_TIMEOUT_SECS",
            config.cart.lock_timeout_secs.to_string(),
        ),
        (
            "cart.cleanup_batch_size",
            "CHATCART_CART_CLEANUP_BATCH_SIZE",
            config.cart.cleanup_batch_size.to_string(),
        ),
        (
            "cart.abandon_after_minutes",
            "CHATCART_CART_ABANDON_AFTER_MINUTES",
            config.cart.abandon_after_minutes.to_string(),
        ),
        ("pricing.currency", "CHATCART_PRICING_CURRENCY", config.pricing.currency.clone()),
        (
            "pricing.tax_enabled",
            "CHATCART_PRICING_TAX_ENABLED",
            config.pricing.tax_enabled.to_string(),
        ),
        ("pricing.tax_rate", "CHATCART_PRICING_TAX_RATE", config.pricing.tax_rate.to_string()),
        ("pricing.shipping_methods", "", shipping),
        ("logging.level", "CHATCART_LOGGING_LEVEL", config.logging.level.clone()),
        ("logging.format", "CHATCART_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_key, value) in entries(&config) {
        let env_key = (!env_key.is_empty()).then_some(env_key);
        let source =
            field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &value, source));
    }

    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    ["chatcart.toml", "config/chatcart.toml"]
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
