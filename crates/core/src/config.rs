use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commerce::pricing::{PricingPolicy, ShippingMethod};

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub cart: CartConfig,
    pub pricing: PricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CartConfig {
    pub ttl_hours: u32,
    pub lock_timeout_secs: u64,
    pub cleanup_batch_size: u32,
    pub abandon_after_minutes: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PricingConfig {
    pub currency: String,
    pub tax_enabled: bool,
    pub tax_rate: Decimal,
    pub shipping_methods: Vec<ShippingMethod>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
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
    pub cart_ttl_hours: Option<u32>,
    pub lock_timeout_secs: Option<u64>,
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
                url: "sqlite://chatcart.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            cart: CartConfig {
                ttl_hours: 72,
                lock_timeout_secs: 5,
                cleanup_batch_size: 500,
                abandon_after_minutes: 60,
            },
            pricing: PricingConfig {
                currency: "USD".to_string(),
                tax_enabled: false,
                tax_rate: Decimal::ZERO,
                shipping_methods: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
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

impl CartConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.ttl_hours))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn abandon_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.abandon_after_minutes))
    }
}

impl PricingConfig {
    pub fn policy(&self) -> PricingPolicy {
        PricingPolicy {
            tax_enabled: self.tax_enabled,
            tax_rate: self.tax_rate,
            shipping_methods: self.shipping_methods.clone(),
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("chatcart.toml"));
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

        if let Some(cart) = patch.cart {
            if let Some(ttl_hours) = cart.ttl_hours {
                self.cart.ttl_hours = ttl_hours;
            }
            if let Some(lock_timeout_secs) = cart.lock_timeout_secs {
                self.cart.lock_timeout_secs = lock_timeout_secs;
            }
            if let Some(cleanup_batch_size) = cart.cleanup_batch_size {
                self.cart.cleanup_batch_size = cleanup_batch_size;
            }
            if let Some(abandon_after_minutes) = cart.abandon_after_minutes {
                self.cart.abandon_after_minutes = abandon_after_minutes;
            }
        }

        if let Some(pricing) = patch.pricing {
            if let Some(currency) = pricing.currency {
                self.pricing.currency = currency;
            }
            if let Some(tax_enabled) = pricing.tax_enabled {
                self.pricing.tax_enabled = tax_enabled;
            }
            if let Some(tax_rate) = pricing.tax_rate {
                self.pricing.tax_rate = tax_rate;
            }
            if let Some(shipping_methods) = pricing.shipping_methods {
                self.pricing.shipping_methods = shipping_methods;
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
        if let Some(value) = read_env("CHATCART_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CHATCART_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("CHATCART_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CHATCART_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("CHATCART_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CHATCART_CART_TTL_HOURS") {
            self.cart.ttl_hours = parse_env("CHATCART_CART_TTL_HOURS", &value)?;
        }
        if let Some(value) = read_env("CHATCART_CART_LOCK_TIMEOUT_SECS") {
            self.cart.lock_timeout_secs = parse_env("CHATCART_CART_LOCK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CHATCART_CART_CLEANUP_BATCH_SIZE") {
            self.cart.cleanup_batch_size = parse_env("CHATCART_CART_CLEANUP_BATCH_SIZE", &value)?;
        }
        if let Some(value) = read_env("CHATCART_CART_ABANDON_AFTER_MINUTES") {
            self.cart.abandon_after_minutes =
                parse_env("CHATCART_CART_ABANDON_AFTER_MINUTES", &value)?;
        }

        if let Some(value) = read_env("CHATCART_PRICING_CURRENCY") {
            self.pricing.currency = value;
        }
        if let Some(value) = read_env("CHATCART_PRICING_TAX_ENABLED") {
            self.pricing.tax_enabled = parse_env("CHATCART_PRICING_TAX_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CHATCART_PRICING_TAX_RATE") {
            self.pricing.tax_rate = parse_env("CHATCART_PRICING_TAX_RATE", &value)?;
        }

        let log_level =
            read_env("CHATCART_LOGGING_LEVEL").or_else(|| read_env("CHATCART_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CHATCART_LOGGING_FORMAT").or_else(|| read_env("CHATCART_LOG_FORMAT"));
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
        if let Some(ttl_hours) = overrides.cart_ttl_hours {
            self.cart.ttl_hours = ttl_hours;
        }
        if let Some(lock_timeout_secs) = overrides.lock_timeout_secs {
            self.cart.lock_timeout_secs = lock_timeout_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_cart(&self.cart)?;
        validate_pricing(&self.pricing)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("chatcart.toml"), PathBuf::from("config/chatcart.toml")]
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

fn validate_cart(cart: &CartConfig) -> Result<(), ConfigError> {
    if cart.ttl_hours == 0 {
        return Err(ConfigError::Validation("cart.ttl_hours must be greater than zero".to_string()));
    }
    if cart.lock_timeout_secs == 0 || cart.lock_timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "cart.lock_timeout_secs must be in range 1..=60".to_string(),
        ));
    }
    if cart.cleanup_batch_size == 0 {
        return Err(ConfigError::Validation(
            "cart.cleanup_batch_size must be greater than zero".to_string(),
        ));
    }
    if cart.abandon_after_minutes == 0 {
        return Err(ConfigError::Validation(
            "cart.abandon_after_minutes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_pricing(pricing: &PricingConfig) -> Result<(), ConfigError> {
    let currency = pricing.currency.trim();
    if currency.len() != 3 || !currency.chars().all(|ch| ch.is_ascii_uppercase()) {
        return Err(ConfigError::Validation(
            "pricing.currency must be a three-letter ISO 4217 code such as `USD`".to_string(),
        ));
    }
    if pricing.tax_rate < Decimal::ZERO || pricing.tax_rate > Decimal::ONE_HUNDRED {
        return Err(ConfigError::Validation(
            "pricing.tax_rate must be a percentage in range 0..=100".to_string(),
        ));
    }
    if pricing.shipping_methods.iter().any(|method| method.cost < Decimal::ZERO) {
        return Err(ConfigError::Validation(
            "pricing.shipping_methods cost must not be negative".to_string(),
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

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    cart: Option<CartPatch>,
    pricing: Option<PricingPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CartPatch {
    ttl_hours: Option<u32>,
    lock_timeout_secs: Option<u64>,
    cleanup_batch_size: Option<u32>,
    abandon_after_minutes: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PricingPatch {
    currency: Option<String>,
    tax_enabled: Option<bool>,
    tax_rate: Option<Decimal>,
    shipping_methods: Option<Vec<ShippingMethod>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
