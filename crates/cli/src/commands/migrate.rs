use crate::bootstrap::{self, BootstrapError};
use crate::commands::CommandResult;
use chatcart_core::config::LoadOptions;

pub fn run() -> CommandResult {
    let runtime = match bootstrap::runtime() {
        Ok(runtime) => runtime,
        Err(error) => return CommandResult::from_bootstrap("migrate", &error),
    };

    let result = runtime.block_on(async {
        let app = bootstrap::bootstrap(LoadOptions::default()).await?;
        app.db_pool.close().await;
        Ok::<(), BootstrapError>(())
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(error) => CommandResult::from_bootstrap("migrate", &error),
    }
}
