use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info};

use crate::api::{self, ApiServer, ApiState};
use crate::clock::{ReportingClock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::health::HealthMetrics;
use crate::ingest::Ingestor;
use crate::migrate::{ClickHouseMigrator, MigrationStatus, Migrator};
use crate::rollup::{AggregateRecord, Granularity, SeriesService};
use crate::store::Store;

/// Wires the store, services and servers together.
pub struct App {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Arc<dyn ReportingClock>,
    store: Option<Arc<Store>>,
    api: ApiServer,
}

impl App {
    /// Creates the application, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let api = ApiServer::new(&cfg.server.addr);

        Ok(Self {
            cfg,
            health,
            clock: Arc::new(SystemClock),
            store: None,
            api,
        })
    }

    /// Replaces the reporting clock.
    pub fn with_clock(mut self, clock: Arc<dyn ReportingClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Starts the health server, opens the store and starts the API server.
    /// Returns the address the API server is bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        // Health first so probes respond while the store connects.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let store = Arc::new(
            Store::open(&self.cfg.store, Some(Arc::clone(&self.health)))
                .await
                .context("opening event store")?,
        );

        let series = SeriesService::new(Arc::clone(&store), Arc::clone(&self.clock))
            .with_health(Arc::clone(&self.health));
        let ingestor = Ingestor::new(Arc::clone(&store), Arc::clone(&self.clock))
            .with_health(Arc::clone(&self.health));
        let state = ApiState::new(series, ingestor, self.cfg.report.clone());

        let addr = self
            .api
            .start(api::router(state))
            .await
            .context("starting API server")?;

        self.store = Some(store);

        info!(
            %addr,
            backend = self.cfg.store.backend.as_str(),
            window_days = self.cfg.report.window_days,
            "appstats started"
        );

        Ok(addr)
    }

    /// Gracefully stops the servers.
    pub async fn stop(&mut self) -> Result<()> {
        if let Err(e) = self.api.stop().await {
            error!(error = %e, "error stopping API server");
        }

        if let Some(store) = self.store.take() {
            self.health
                .store_connected
                .with_label_values(&[store.backend().as_str()])
                .set(0.0);
        }

        self.health.stop().await?;

        Ok(())
    }
}

/// Builds one series against the configured store without starting any
/// server.
pub async fn report(
    cfg: &Config,
    clock: Arc<dyn ReportingClock>,
    days: u32,
    granularity: Granularity,
) -> Result<Vec<AggregateRecord>> {
    if days > cfg.report.max_window_days {
        bail!(
            "window of {days} days exceeds report.max_window_days ({})",
            cfg.report.max_window_days
        );
    }

    let store = Arc::new(
        Store::open(&cfg.store, None)
            .await
            .context("opening event store")?,
    );

    SeriesService::new(store, clock)
        .get_series(days, granularity)
        .await
        .context("building series")
}

/// Schema migration operations exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateAction {
    Up,
    Down,
    Status,
}

/// Runs a migration action against the configured ClickHouse store.
pub async fn migrate(cfg: &Config, action: MigrateAction) -> Result<MigrationStatus> {
    if cfg.store.backend != StoreBackend::ClickHouse {
        bail!("migrations require store.backend: clickhouse");
    }

    let pool = clickhouse_rs::Pool::new(cfg.store.clickhouse.dsn());
    let migrator = ClickHouseMigrator::new(pool);

    match action {
        MigrateAction::Up => migrator
            .up()
            .await
            .context("applying ClickHouse migrations")?,
        MigrateAction::Down => migrator
            .down()
            .await
            .context("rolling back ClickHouse migration")?,
        MigrateAction::Status => {}
    }

    migrator.status().await.context("reading migration status")
}
