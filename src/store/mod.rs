pub mod clickhouse;
pub mod memory;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};

use crate::config::{StoreBackend, StoreConfig};
use crate::health::HealthMetrics;
use crate::rollup::{DayCategoryCounts, DayCounts, Dimension};

pub use self::clickhouse::ClickHouseStore;
pub use self::memory::MemoryStore;

/// One reported usage event. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub user_id: String,
    pub platform: String,
    pub region: String,
    /// Empty when the client did not report one. Stored, never aggregated.
    pub app_version: String,
    pub event_time: DateTime<Utc>,
}

impl RawEvent {
    /// Returns the raw value of the given dimension.
    pub fn dimension_value(&self, dimension: Dimension) -> &str {
        match dimension {
            Dimension::Platform => &self.platform,
            Dimension::Region => &self.region,
        }
    }
}

/// A user as tracked by the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    /// Set when the user is first recorded and never changed afterwards.
    pub first_seen: DateTime<Utc>,
    pub platform: String,
    pub region: String,
}

impl User {
    /// Creates a user from their first event.
    pub fn from_first_event(event: &RawEvent) -> Self {
        Self {
            user_id: event.user_id.clone(),
            first_seen: event.event_time,
            platform: event.platform.clone(),
            region: event.region.clone(),
        }
    }

    /// Applies a later event: platform and region are overwritten when the
    /// event carries a non-empty value that differs. Returns true when the
    /// user changed.
    pub fn apply(&mut self, event: &RawEvent) -> bool {
        let mut changed = false;

        if !event.platform.is_empty() && self.platform != event.platform {
            self.platform.clone_from(&event.platform);
            changed = true;
        }

        if !event.region.is_empty() && self.region != event.region {
            self.region.clone_from(&event.region);
            changed = true;
        }

        changed
    }
}

/// Result of recording one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// True when the event introduced a previously unseen user.
    pub new_user: bool,
}

/// Read side of the event store: sparse per-day counts from `since`
/// (inclusive, UTC) onwards.
pub trait EventStore: Send + Sync {
    /// Users keyed by the day they were first seen.
    fn count_new_users_by_day(
        &self,
        since: NaiveDate,
    ) -> impl Future<Output = Result<DayCounts>> + Send;

    /// Distinct users with at least one event, keyed by event day.
    fn count_distinct_active_users_by_day(
        &self,
        since: NaiveDate,
    ) -> impl Future<Output = Result<DayCounts>> + Send;

    /// Distinct active users keyed by event day and the raw value the event
    /// carried for `dimension`.
    fn count_distinct_active_users_by_day_and_dimension(
        &self,
        since: NaiveDate,
        dimension: Dimension,
    ) -> impl Future<Output = Result<DayCategoryCounts>> + Send;
}

/// Write side of the event store.
pub trait EventWriter: Send + Sync {
    /// Records an event and creates or updates its user.
    fn record_event(&self, event: RawEvent) -> impl Future<Output = Result<IngestOutcome>> + Send;
}

/// Event store backend selected by configuration.
pub enum Store {
    Memory(MemoryStore),
    ClickHouse(ClickHouseStore),
}

impl Store {
    /// Opens the configured backend. The ClickHouse backend connects and, if
    /// enabled, applies migrations before returning.
    pub async fn open(cfg: &StoreConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let store = match cfg.backend {
            StoreBackend::Memory => Self::Memory(MemoryStore::new()),
            StoreBackend::ClickHouse => {
                Self::ClickHouse(ClickHouseStore::connect(cfg.clickhouse.clone(), health.clone()).await?)
            }
        };

        if let Some(h) = &health {
            h.store_connected
                .with_label_values(&[cfg.backend.as_str()])
                .set(1.0);
        }

        tracing::info!(backend = cfg.backend.as_str(), "event store opened");

        Ok(store)
    }

    /// Returns the backend name.
    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Memory(_) => StoreBackend::Memory,
            Self::ClickHouse(_) => StoreBackend::ClickHouse,
        }
    }
}

impl EventStore for Store {
    async fn count_new_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        match self {
            Self::Memory(s) => s.count_new_users_by_day(since).await,
            Self::ClickHouse(s) => s.count_new_users_by_day(since).await,
        }
    }

    async fn count_distinct_active_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        match self {
            Self::Memory(s) => s.count_distinct_active_users_by_day(since).await,
            Self::ClickHouse(s) => s.count_distinct_active_users_by_day(since).await,
        }
    }

    async fn count_distinct_active_users_by_day_and_dimension(
        &self,
        since: NaiveDate,
        dimension: Dimension,
    ) -> Result<DayCategoryCounts> {
        match self {
            Self::Memory(s) => {
                s.count_distinct_active_users_by_day_and_dimension(since, dimension)
                    .await
            }
            Self::ClickHouse(s) => {
                s.count_distinct_active_users_by_day_and_dimension(since, dimension)
                    .await
            }
        }
    }
}

impl EventWriter for Store {
    async fn record_event(&self, event: RawEvent) -> Result<IngestOutcome> {
        match self {
            Self::Memory(s) => s.record_event(event).await,
            Self::ClickHouse(s) => s.record_event(event).await,
        }
    }
}
