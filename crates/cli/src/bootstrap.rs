//! Wires config, storage, and the cart service for operator commands.

use std::sync::Arc;

use chatcart_core::commerce::memory::{
    InMemoryCouponCatalog, InMemoryCustomerResolver, InMemoryProductCatalog,
    RecordingReminderSink,
};
use chatcart_core::config::{AppConfig, ConfigError, LoadOptions};
use chatcart_core::lock::InProcessLockManager;
use chatcart_db::{
    connect_with_settings, migrations, CartCollaborators, CartService, CartSettings, DbPool,
};
use thiserror::Error;
use tokio::runtime::Runtime;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub cart_service: CartService,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to initialize async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

impl BootstrapError {
    /// Stable error class and exit code for the command envelope.
    pub fn classify(&self) -> (&'static str, u8) {
        match self {
            Self::Config(_) => ("config_validation", 2),
            Self::Runtime(_) => ("runtime_init", 3),
            Self::DatabaseConnect(_) => ("db_connectivity", 4),
            Self::Migration(_) => ("migration", 5),
        }
    }
}

pub fn runtime() -> Result<Runtime, BootstrapError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BootstrapError::Runtime)
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Operator commands only touch storage; catalog-facing collaborators are offline.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting cart store bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let collaborators = CartCollaborators {
        products: Arc::new(InMemoryProductCatalog::default()),
        coupons: Arc::new(InMemoryCouponCatalog::default()),
        customers: Arc::new(InMemoryCustomerResolver::default()),
        reminders: Arc::new(RecordingReminderSink::default()),
    };
    let cart_service = CartService::new(
        db_pool.clone(),
        Arc::new(InProcessLockManager::new()),
        collaborators,
        CartSettings::from(&config),
    );

    Ok(Application { config, db_pool, cart_service })
}
