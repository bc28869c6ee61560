//! Service lifecycle management.
//!
//! Builds the storage backends from configuration, wires the control plane
//! components together and runs each long-lived service in its own task.

use std::sync::Arc;
use std::time::Duration;

use launchpad_control::api::{self, AppState};
use launchpad_control::config::Backend;
use launchpad_control::{
    AdmissionController, ControlConfig, DeploymentStore, EventStore, EventStream,
    HttpTaskScheduler, IngestionPipeline, LogBroadcaster, MemoryEventStore, MemoryStore,
    MemoryStream, PostgresEventStore, PostgresStore, PostgresStream, ProjectService,
    StaleDeploymentReaper, TaskDispatcher, WebhookTrigger,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Storage backends shared by every service.
struct Backends {
    store: Arc<dyn DeploymentStore>,
    events: Arc<dyn EventStore>,
    stream: Arc<dyn EventStream>,
}

impl Backends {
    async fn build(config: &ControlConfig) -> anyhow::Result<Self> {
        let (store, events): (Arc<dyn DeploymentStore>, Arc<dyn EventStore>) =
            match config.storage.backend {
                Backend::Memory => {
                    warn!("using in-memory stores, state is lost on restart");
                    (
                        Arc::new(MemoryStore::new()),
                        Arc::new(MemoryEventStore::new()),
                    )
                }
                Backend::Postgres => {
                    let pool = config.database.connect(None).await?;
                    let store = PostgresStore::from_pool(pool.clone()).await?;
                    let events_pool = match config.events.url.as_deref() {
                        Some(url) => config.database.connect(Some(url)).await?,
                        None => pool,
                    };
                    let events = PostgresEventStore::from_pool(events_pool).await?;
                    info!("connected to PostgreSQL");
                    (Arc::new(store), Arc::new(events))
                }
            };

        let stream: Arc<dyn EventStream> = match config.stream.backend {
            Backend::Memory => Arc::new(MemoryStream::new(config.stream.partitions)),
            Backend::Postgres => {
                let pool = config
                    .database
                    .connect(config.stream.url.as_deref())
                    .await?;
                Arc::new(PostgresStream::from_pool(pool, config.stream.partitions).await?)
            }
        };

        Ok(Self {
            store,
            events,
            stream,
        })
    }
}

/// Manages the lifecycle of all launchpad services.
pub struct Services {
    cancel: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Services {
    /// Build the backends and start every enabled service.
    pub async fn start(config: ControlConfig) -> anyhow::Result<Self> {
        info!("starting launchpad services");

        let backends = Backends::build(&config).await?;
        let broadcaster = LogBroadcaster::new(config.events.broadcast_capacity);

        let scheduler = Arc::new(HttpTaskScheduler::new(&config.scheduler)?);
        let dispatcher = Arc::new(TaskDispatcher::new(
            scheduler,
            Arc::clone(&backends.store),
            config.scheduler.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&backends.store),
            dispatcher,
            config.admission,
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&backends.stream),
            Arc::clone(&backends.events),
            Arc::clone(&backends.store),
            broadcaster.clone(),
            config.ingestion.clone(),
            config.stream.consumer_group.clone(),
        ));

        let state = AppState {
            store: Arc::clone(&backends.store),
            events: Arc::clone(&backends.events),
            stream: Arc::clone(&backends.stream),
            broadcaster,
            admission: Arc::clone(&admission),
            projects: Arc::new(ProjectService::new(
                Arc::clone(&backends.store),
                config.admission,
            )),
            webhook: Arc::new(WebhookTrigger::new(
                config.webhook.secret.clone(),
                Arc::clone(&backends.store),
                admission,
            )),
            stats: pipeline.stats(),
            api: config.api,
        };

        let mut services = Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        };

        services.start_api(&config, state).await?;
        services.start_ingestion(&pipeline);
        if config.reaper.enabled {
            services.start_reaper(StaleDeploymentReaper::new(
                Arc::clone(&backends.store),
                &config.reaper,
            ));
        } else {
            warn!("stale-deployment reaper disabled");
        }

        info!(services = services.handles.len(), "all services started");
        Ok(services)
    }

    /// Get the cancellation token for external shutdown triggers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for shutdown to be requested or for any service to exit.
    pub async fn wait(&mut self) {
        let cancel = self.cancel.clone();

        tokio::select! {
            () = cancel.cancelled() => {
                info!("shutdown requested");
            }
            result = self.wait_for_any_exit() => {
                if let Some((name, result)) = result {
                    match result {
                        Ok(()) => warn!(service = %name, "service exited unexpectedly"),
                        Err(e) => error!(service = %name, error = %e, "service panicked"),
                    }
                }
            }
        }
    }

    /// Cancel every service and wait for them to stop.
    pub async fn shutdown(self) {
        info!("initiating graceful shutdown");
        self.cancel.cancel();

        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(service = %name, error = %e, "service panicked during shutdown");
            }
        }
    }

    async fn wait_for_any_exit(
        &mut self,
    ) -> Option<(String, Result<(), tokio::task::JoinError>)> {
        if self.handles.is_empty() {
            std::future::pending::<()>().await;
            return None;
        }

        loop {
            if let Some(i) = self.handles.iter().position(|(_, h)| h.is_finished()) {
                let (name, handle) = self.handles.remove(i);
                return Some((name, handle.await));
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn start_api(&mut self, config: &ControlConfig, state: AppState) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
        let app = api::router(state)
            .layer(TimeoutLayer::new(Duration::from_secs(
                config.server.request_timeout_secs,
            )))
            .layer(TraceLayer::new_for_http());
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!(error = %e, "API server failed");
            }
            info!("API server stopped");
        });

        self.handles.push(("api".to_owned(), handle));
        info!(listen = %config.server.listen, "API server listening");
        Ok(())
    }

    fn start_ingestion(&mut self, pipeline: &Arc<IngestionPipeline>) {
        for partition in 0..pipeline.partitions() {
            let pipeline = Arc::clone(pipeline);
            let cancel = self.cancel.clone();

            let handle = tokio::spawn(async move {
                if let Err(e) = pipeline.run_partition(partition, cancel).await {
                    error!(partition, error = %e, "ingestion consumer failed");
                }
            });
            self.handles.push((format!("ingest-{partition}"), handle));
        }
        info!(partitions = pipeline.partitions(), "ingestion consumers spawned");
    }

    fn start_reaper(&mut self, reaper: StaleDeploymentReaper) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { reaper.run(cancel).await });
        self.handles.push(("reaper".to_owned(), handle));
    }
}
