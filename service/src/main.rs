// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use clap::Parser;
use nodewarden_core::storage::Store;
use nodewarden_service::application::{AppState, Application, build_carver, build_logger};
use nodewarden_service::configuration::ServiceOptions;
use nodewarden_service::seed;
use tracing_subscriber::EnvFilter;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("[service] init");

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        // this needs to be set to remove duplicated information in the log.
        .with_current_span(false)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .init();

    // get configuration options from environment variables
    let options = ServiceOptions::parse();

    tracing::info!("[service] {:?}", &options);

    let store: Arc<dyn Store> = Arc::new(seed::load_store(options.seed_file.as_deref()).await?);
    let logger = build_logger(&options).await?;
    let carver = build_carver(&options, store.clone()).await?;

    let state = Arc::new(AppState::new(options.clone(), store, logger, carver)?);
    state.prime().await?;

    let tasks = if !options.skip_refresh {
        tracing::info!(
            "[service] refreshing environments every {:#?}",
            state.settings.refresh_envs_interval()
        );
        state.spawn_background()
    } else {
        tracing::warn!("[service] skipping background refresh");
        Vec::new()
    };

    let application = Application::build(state).await?;
    application.run_until_stopped().await?;

    for task in tasks {
        tracing::debug!("[service] stopping {}", task.name());
        task.stop().await;
    }
    Ok(())
}
