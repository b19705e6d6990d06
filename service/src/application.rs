// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use nodewarden_core::carvers::{CarveBackend, DbCarver, LocalCarver};
use nodewarden_core::carves::{CarveEngine, CarveSweeper};
use nodewarden_core::cache::PeriodicTask;
use nodewarden_core::environments::EnvironmentDirectory;
use nodewarden_core::errors::CoreError;
use nodewarden_core::logging::{FileLogger, Logger, NoneLogger, StdoutLogger};
use nodewarden_core::nodes::NodeRegistry;
use nodewarden_core::queries::QueryCoordinator;
use nodewarden_core::settings::SettingsCache;
use nodewarden_core::storage::Store;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::configuration::{CarverKind, LoggerKind, ServiceOptions};
use crate::constants::{MAX_BODY_SIZE, REQUEST_TIMEOUT};
use crate::errors::AppError;
use crate::metrics::ServiceMetrics;
use crate::routes;
use crate::s3::S3Carver;

pub struct AppState {
    pub options: ServiceOptions,
    pub settings: Arc<SettingsCache>,
    pub environments: Arc<EnvironmentDirectory>,
    pub nodes: Arc<NodeRegistry>,
    pub queries: Arc<QueryCoordinator>,
    pub carves: Arc<CarveEngine>,
    pub logger: Arc<dyn Logger>,
    pub metrics: ServiceMetrics,
}

impl AppState {
    pub fn new(
        options: ServiceOptions,
        store: Arc<dyn Store>,
        logger: Arc<dyn Logger>,
        carver: Arc<dyn CarveBackend>,
    ) -> Result<Self, AppError> {
        let settings = Arc::new(SettingsCache::new(store.clone()));
        let environments = Arc::new(EnvironmentDirectory::new(store.clone(), settings.clone()));
        let nodes = Arc::new(NodeRegistry::new(store.clone(), settings.clone()));
        let queries = Arc::new(QueryCoordinator::new(store.clone(), logger.clone()));
        let carves = Arc::new(
            CarveEngine::new(store, carver, options.carver_decompress)
                .with_inflate_limit(options.carver_max_inflated),
        );
        let metrics = ServiceMetrics::new().map_err(|e| AppError::ConfigError(e.to_string()))?;

        Ok(Self {
            options,
            settings,
            environments,
            nodes,
            queries,
            carves,
            logger,
            metrics,
        })
    }

    /// Writes missing default settings and loads the first snapshots so the
    /// first request does not see an empty directory.
    pub async fn prime(&self) -> Result<(), CoreError> {
        let inserted = self.settings.ensure_defaults().await?;
        if inserted > 0 {
            tracing::info!("[service] wrote {} default settings", inserted);
        }
        self.settings.refresh().await?;
        let environments = self.environments.refresh().await?;
        tracing::info!("[service] loaded {} environments", environments);
        Ok(())
    }

    /// Starts the environment refresh, settings refresh and carve sweep loops.
    pub fn spawn_background(&self) -> Vec<PeriodicTask> {
        vec![
            PeriodicTask::spawn(self.environments.clone()),
            PeriodicTask::spawn(self.settings.clone()),
            PeriodicTask::spawn(Arc::new(CarveSweeper::new(
                self.carves.clone(),
                self.settings.clone(),
            ))),
        ]
    }
}

pub async fn build_logger(options: &ServiceOptions) -> Result<Arc<dyn Logger>, AppError> {
    let logger: Arc<dyn Logger> = match options.logger {
        LoggerKind::None => Arc::new(NoneLogger),
        LoggerKind::Stdout => Arc::new(StdoutLogger),
        LoggerKind::File => Arc::new(
            FileLogger::open(&options.logger_file)
                .await
                .map_err(|e| AppError::ConfigError(e.to_string()))?,
        ),
    };
    Ok(logger)
}

pub async fn build_carver(
    options: &ServiceOptions,
    store: Arc<dyn Store>,
) -> Result<Arc<dyn CarveBackend>, AppError> {
    let carver: Arc<dyn CarveBackend> = match options.carver {
        CarverKind::Db => Arc::new(DbCarver::new(store)),
        CarverKind::Local => Arc::new(LocalCarver::new(options.carver_dir.clone())),
        CarverKind::S3 => Arc::new(S3Carver::from_options(options).await?),
    };
    tracing::info!("[service] using {} carver", carver.kind());
    Ok(carver)
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
}

impl Application {
    pub async fn build(state: Arc<AppState>) -> Result<Self, std::io::Error> {
        let address = format!("{}:{}", state.options.host, state.options.port);
        let listener = TcpListener::bind(address).await?;
        let port = listener.local_addr()?.port();

        tracing::info!(
            "[service] listening at http://{}:{}",
            state.options.host,
            port
        );

        let router = create_router(state);
        Ok(Self {
            port,
            listener,
            router,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serves until ctrl-c or SIGTERM.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/{environment}/{endpoint}", post(routes::node_endpoint))
        .route(
            "/{environment}/{secret_path}/{script}",
            get(routes::quick_script),
        )
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("[service] unable to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("[service] unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("[service] shutting down");
}
