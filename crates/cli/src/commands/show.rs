use anyhow::Context;
use chatcart_core::config::LoadOptions;
use chatcart_core::domain::cart::CustomerKey;
use chatcart_db::CartStore;

use crate::bootstrap;
use crate::commands::CommandResult;

/// Reads the stored cart without creating one; `get_cart` would insert an empty cart.
pub fn run(customer_key: &str) -> CommandResult {
    let key = match CustomerKey::parse(customer_key) {
        Ok(key) => key,
        Err(error) => {
            return CommandResult::failure("show", "invalid_argument", error.to_string(), 2)
        }
    };

    let runtime = match bootstrap::runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("show", &error),
    };

    runtime.block_on(async {
        let app = match bootstrap::bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return CommandResult::from_bootstrap("show", &error),
        };

        let outcome = app
            .cart_service
            .store()
            .find_active_by_customer(&key)
            .await
            .context("cart lookup failed")
            .and_then(|cart| Ok(cart.map(serde_json::to_value).transpose()?));
        app.db_pool.close().await;

        match outcome {
            Ok(Some(data)) => {
                CommandResult::success_with_data("show", "active cart found", Some(data))
            }
            Ok(None) => CommandResult::success("show", format!("no active cart for {key}")),
            Err(error) => CommandResult::failure("show", "query", format!("{error:#}"), 6),
        }
    })
}
