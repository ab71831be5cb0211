use anyhow::Context;
use chatcart_core::config::LoadOptions;
use chatcart_core::domain::cart::Cart;
use serde::Serialize;

use crate::bootstrap;
use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct AbandonedCartRow {
    cart_id: String,
    customer_key: String,
    status: &'static str,
    item_count: u32,
    total: String,
    reminder_stage: u8,
    updated_at: String,
}

impl From<&Cart> for AbandonedCartRow {
    fn from(cart: &Cart) -> Self {
        Self {
            cart_id: cart.id.0.clone(),
            customer_key: cart.customer_key.0.clone(),
            status: cart.status.as_str(),
            item_count: cart.item_count(),
            total: cart.total.to_string(),
            reminder_stage: cart.reminder_stage,
            updated_at: cart.updated_at.to_rfc3339(),
        }
    }
}

pub fn run(limit: u32) -> CommandResult {
    if limit == 0 {
        return CommandResult::failure(
            "abandoned",
            "invalid_argument",
            "--limit must be positive",
            2,
        );
    }

    let runtime = match bootstrap::runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("abandoned", &error),
    };

    runtime.block_on(async {
        let app = match bootstrap::bootstrap(LoadOptions::default()).await {
            Ok(app) => app,
            Err(error) => return CommandResult::from_bootstrap("abandoned", &error),
        };

        let outcome = app
            .cart_service
            .abandoned_candidates(limit)
            .await
            .context("abandoned-cart query failed")
            .and_then(|carts| {
                let rows: Vec<AbandonedCartRow> =
                    carts.iter().map(AbandonedCartRow::from).collect();
                let count = rows.len();
                Ok((count, serde_json::to_value(rows)?))
            });
        app.db_pool.close().await;

        match outcome {
            Ok((count, data)) => CommandResult::success_with_data(
                "abandoned",
                format!("{count} cart(s) eligible for reminders"),
                Some(data),
            ),
            Err(error) => CommandResult::failure("abandoned", "query", format!("{error:#}"), 6),
        }
    })
}
