// Copyright (c) Lightnode, Inc.
// SPDX-License-Identifier: Apache-2.0

use lightnode::config::Options;
use lightnode::node::run_lightnode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = match Options::from_env() {
        Ok(options) => options,
        Err(err) => {
            error!("cannot parse options: {err}");
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            signal_cancel.cancel();
        }
    });

    if let Err(err) = run_lightnode(options, cancel).await {
        error!("startup failed: {err:#}");
        std::process::exit(1);
    }
}
