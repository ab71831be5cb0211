use anyhow::Context;
use chatcart_core::config::LoadOptions;
use serde_json::json;

use crate::bootstrap;
use crate::commands::CommandResult;

pub fn run() -> CommandResult {
    let runtime = match bootstrap::runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("sweep", &error),
    };

    runtime.block_on(async {
        let app = match bootstrap::bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return CommandResult::from_bootstrap("sweep", &error),
        };

        let outcome = app
            .cart_service
            .cleanup_expired_carts()
            .await
            .context("expired-cart sweep failed");
        app.db_pool.close().await;

        match outcome {
            Ok(expired) => CommandResult::success_with_data(
                "sweep",
                format!("expired {expired} cart(s)"),
                Some(json!({ "expired": expired })),
            ),
            Err(error) => CommandResult::failure("sweep", "sweep", format!("{error:#}"), 6),
        }
    })
}
