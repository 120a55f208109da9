//! # APIManager Operator
//!
//! Controller binary. Configuration is read from the environment; see
//! [`apimanager_operator::config`].

use anyhow::Result;
use apimanager_operator::runtime::initialization::initialize;
use apimanager_operator::runtime::watch_loop::run_watch_loop;

#[tokio::main]
async fn main() -> Result<()> {
    let init_result = initialize().await?;

    run_watch_loop(
        init_result.client,
        init_result.reconciler,
        init_result.server_state,
    )
    .await
}
