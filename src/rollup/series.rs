use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;

use super::bucket::Granularity;
use super::category::Dimension;
use super::daily::{self, DailyCounts};
use super::error::RollupError;
use super::reaggregate::reaggregate;
use super::record::{AggregateRecord, CategoryCounts};
use super::topn::collapse;
use crate::clock::ReportingClock;
use crate::health::HealthMetrics;
use crate::store::EventStore;

/// Entry point for usage reports.
///
/// Runs the store queries for a window ending today, assembles the daily
/// series and reaggregates it. Store failures surface as
/// [`RollupError::EventStoreUnavailable`] and are never retried.
pub struct SeriesService<S> {
    store: Arc<S>,
    clock: Arc<dyn ReportingClock>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S> Clone for SeriesService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            health: self.health.clone(),
        }
    }
}

impl<S: EventStore> SeriesService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn ReportingClock>) -> Self {
        Self {
            store,
            clock,
            health: None,
        }
    }

    /// Attaches Prometheus metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the first day of a window of the given length ending today.
    pub fn window_start(&self, window_length_days: u32) -> Result<NaiveDate, RollupError> {
        daily::window_start(self.clock.today(), window_length_days)
    }

    /// Builds the usage series for the last `window_length_days` days.
    pub async fn get_series(
        &self,
        window_length_days: u32,
        granularity: Granularity,
    ) -> Result<Vec<AggregateRecord>, RollupError> {
        let start = self.window_start(window_length_days)?;

        if let Some(h) = &self.health {
            h.series_requests
                .with_label_values(&[granularity.as_str()])
                .inc();
        }

        tracing::debug!(
            days = window_length_days,
            granularity = %granularity,
            %start,
            "building series"
        );

        let counts = self.daily_counts(start).await?;

        let started = Instant::now();
        let daily = daily::build(start, window_length_days, &counts)?;
        let series = reaggregate(&daily, granularity)?;

        if let Some(h) = &self.health {
            h.series_build_duration
                .observe(started.elapsed().as_secs_f64());
        }

        Ok(series)
    }

    /// Collapses a category map to its `k` largest entries plus "other".
    pub fn get_top_n(&self, category_counts: &CategoryCounts, k: usize) -> Vec<(String, u64)> {
        collapse(
            category_counts
                .iter()
                .map(|(category, &count)| (category.as_str(), count)),
            k,
        )
    }

    /// Sums one dimension's daily breakdowns over the window and collapses
    /// the result to its top `k` categories.
    pub async fn breakdown_top_n(
        &self,
        window_length_days: u32,
        dimension: Dimension,
        k: usize,
    ) -> Result<Vec<(String, u64)>, RollupError> {
        let start = self.window_start(window_length_days)?;

        if let Some(h) = &self.health {
            h.breakdown_requests
                .with_label_values(&[dimension.as_str()])
                .inc();
        }

        let by_day = self
            .store
            .count_distinct_active_users_by_day_and_dimension(start, dimension)
            .await
            .map_err(RollupError::EventStoreUnavailable)?;

        let mut counts = DailyCounts::default();
        match dimension {
            Dimension::Platform => counts.platform_active = by_day,
            Dimension::Region => counts.region_active = by_day,
        }

        let daily = daily::build(start, window_length_days, &counts)?;
        let totals = window_totals(&daily, dimension);

        Ok(self.get_top_n(&totals, k))
    }

    /// Runs the four store queries concurrently. Assembly only starts once
    /// all of them have returned.
    async fn daily_counts(&self, since: NaiveDate) -> Result<DailyCounts, RollupError> {
        let store = self.store.as_ref();

        let (new_users, active_users, platform_active, region_active) = tokio::try_join!(
            store.count_new_users_by_day(since),
            store.count_distinct_active_users_by_day(since),
            store.count_distinct_active_users_by_day_and_dimension(since, Dimension::Platform),
            store.count_distinct_active_users_by_day_and_dimension(since, Dimension::Region),
        )
        .map_err(|e| {
            tracing::warn!(error = %e, %since, "event store query failed");
            RollupError::EventStoreUnavailable(e)
        })?;

        Ok(DailyCounts {
            new_users,
            active_users,
            platform_active,
            region_active,
        })
    }
}

/// Sums one dimension's breakdown across records.
pub fn window_totals(records: &[AggregateRecord], dimension: Dimension) -> CategoryCounts {
    let mut totals = CategoryCounts::new();

    for record in records {
        for (category, &count) in record.breakdown(dimension) {
            *totals.entry(category.clone()).or_insert(0) += count;
        }
    }

    totals
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::clock::FixedClock;
    use crate::rollup::{DayCategoryCounts, DayCounts};
    use crate::store::{EventWriter, MemoryStore, RawEvent};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, d, h, 0, 0)
            .single()
            .expect("valid instant")
    }

    fn event(user: &str, platform: &str, region: &str, time: DateTime<Utc>) -> RawEvent {
        RawEvent {
            user_id: user.to_string(),
            platform: platform.to_string(),
            region: region.to_string(),
            app_version: String::new(),
            event_time: time,
        }
    }

    fn service(store: MemoryStore) -> SeriesService<MemoryStore> {
        SeriesService::new(Arc::new(store), Arc::new(FixedClock::new(at(3, 18))))
    }

    struct FailingStore;

    impl EventStore for FailingStore {
        async fn count_new_users_by_day(&self, _since: NaiveDate) -> Result<DayCounts> {
            Ok(DayCounts::new())
        }

        async fn count_distinct_active_users_by_day(&self, _since: NaiveDate) -> Result<DayCounts> {
            Err(anyhow!("connection refused"))
        }

        async fn count_distinct_active_users_by_day_and_dimension(
            &self,
            _since: NaiveDate,
            _dimension: Dimension,
        ) -> Result<DayCategoryCounts> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_series_single_user_scenario() {
        let store = MemoryStore::new();
        store
            .record_event(event("u1", "ios", "", at(1, 10)))
            .await
            .expect("record");

        let svc = service(store);
        let series = svc.get_series(3, Granularity::Day).await.expect("series");

        assert_eq!(series.len(), 3);
        assert_eq!(series[0].bucket_key, "2024-06-01");
        assert_eq!(series[0].new_users, 1);
        assert_eq!(series[0].active_users, 1);
        assert_eq!(series[0].online_users, 1);
        assert_eq!(series[0].platform_active.get("ios"), Some(&1));
        assert_eq!(series[0].region_active.get("unknown"), Some(&1));
        assert!(series[1].is_zero());
        assert!(series[2].is_zero());
    }

    #[tokio::test]
    async fn test_series_month_totals() {
        let store = MemoryStore::new();
        for (user, day) in [("a", 1), ("b", 2), ("a", 3)] {
            store
                .record_event(event(user, "web", "eu", at(day, 9)))
                .await
                .expect("record");
        }

        let svc = service(store);
        let months = svc.get_series(3, Granularity::Month).await.expect("series");
        assert_eq!(months.len(), 1);
        assert_eq!(months[0].bucket_key, "2024-06");
        assert_eq!(months[0].new_users, 2);
        // Daily distinct users summed: a, b, a.
        assert_eq!(months[0].active_users, 3);
        assert_eq!(months[0].platform_active.get("web"), Some(&3));
    }

    #[tokio::test]
    async fn test_zero_window_rejected() {
        let svc = service(MemoryStore::new());
        let err = svc
            .get_series(0, Granularity::Day)
            .await
            .expect_err("should fail");
        assert!(matches!(err, RollupError::InvalidWindow { days: 0 }));
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let svc = SeriesService::new(
            Arc::new(FailingStore),
            Arc::new(FixedClock::new(at(3, 0))),
        );

        let err = svc
            .get_series(7, Granularity::Week)
            .await
            .expect_err("should fail");
        assert!(matches!(err, RollupError::EventStoreUnavailable(_)));
        assert!(!err.is_client_error());

        let err = svc
            .breakdown_top_n(7, Dimension::Region, 5)
            .await
            .expect_err("should fail");
        assert!(matches!(err, RollupError::EventStoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_breakdown_top_n_collapses_regions() {
        let store = MemoryStore::new();
        let regions = [("r1", 6), ("r2", 5), ("r3", 4), ("r4", 3), ("r5", 2), ("r6", 1), ("r7", 1)];
        for (region, users) in regions {
            for i in 0..users {
                store
                    .record_event(event(&format!("{region}-{i}"), "android", region, at(2, 12)))
                    .await
                    .expect("record");
            }
        }

        let svc = service(store);
        let top = svc
            .breakdown_top_n(7, Dimension::Region, 5)
            .await
            .expect("breakdown");

        assert_eq!(top.len(), 6);
        assert_eq!(top[0], ("r1".to_string(), 6));
        assert_eq!(top[4], ("r5".to_string(), 2));
        assert_eq!(top[5], ("other".to_string(), 2));
    }

    #[tokio::test]
    async fn test_breakdown_normalizes_platforms() {
        let store = MemoryStore::new();
        store
            .record_event(event("a", "IOS", "", at(1, 1)))
            .await
            .expect("record");
        store
            .record_event(event("b", "symbian", "", at(2, 1)))
            .await
            .expect("record");

        let svc = service(store);
        let top = svc
            .breakdown_top_n(3, Dimension::Platform, 5)
            .await
            .expect("breakdown");
        assert_eq!(top, vec![("ios".to_string(), 1), ("other".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_platform_breakdown_has_single_other_row() {
        let store = MemoryStore::new();
        let platforms = [
            ("symbian", 10),
            ("ios", 9),
            ("android", 8),
            ("web", 7),
            ("windows", 6),
            ("macos", 5),
        ];
        for (platform, users) in platforms {
            for i in 0..users {
                store
                    .record_event(event(&format!("{platform}-{i}"), platform, "", at(3, 12)))
                    .await
                    .expect("record");
            }
        }

        let svc = service(store);
        let top = svc
            .breakdown_top_n(1, Dimension::Platform, 5)
            .await
            .expect("breakdown");

        let others: Vec<u64> = top
            .iter()
            .filter(|(category, _)| category == "other")
            .map(|(_, count)| *count)
            .collect();
        assert_eq!(others, vec![15]);
        assert_eq!(top.len(), 5);
        assert_eq!(top.iter().map(|(_, count)| count).sum::<u64>(), 45);
    }

    #[test]
    fn test_get_top_n_delegates() {
        let svc = service(MemoryStore::new());
        let counts: CategoryCounts = [("a", 3u64), ("b", 1)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(svc.get_top_n(&counts, 1), vec![("a".to_string(), 3), ("other".to_string(), 1)]);
    }

    #[test]
    fn test_window_totals() {
        let mut a = AggregateRecord::empty("2024-06-01");
        a.add_category(Dimension::Region, "eu".to_string(), 2);
        let mut b = AggregateRecord::empty("2024-06-02");
        b.add_category(Dimension::Region, "eu".to_string(), 1);
        b.add_category(Dimension::Region, "us".to_string(), 4);

        let totals = window_totals(&[a, b], Dimension::Region);
        assert_eq!(totals.get("eu"), Some(&3));
        assert_eq!(totals.get("us"), Some(&4));
        assert!(window_totals(&[], Dimension::Platform).is_empty());
    }
}
