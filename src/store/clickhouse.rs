use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clickhouse_rs::types::{Block, Complex};
use clickhouse_rs::Pool;

use super::{EventStore, EventWriter, IngestOutcome, RawEvent, User};
use crate::config::ClickHouseConfig;
use crate::health::HealthMetrics;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::rollup::{DayCategoryCounts, DayCounts, Dimension, DAY_KEY_FORMAT};

/// Event store backed by ClickHouse over the native TCP protocol.
///
/// Events go to `user_events`; users live in a `ReplacingMergeTree` keyed
/// on `updated_at`, so every read of `users` uses `FINAL`.
pub struct ClickHouseStore {
    cfg: ClickHouseConfig,
    pool: Pool,
    health: Option<Arc<HealthMetrics>>,
}

impl ClickHouseStore {
    /// Opens the connection pool, verifies connectivity and applies pending
    /// migrations when enabled.
    pub async fn connect(cfg: ClickHouseConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let pool = Pool::new(cfg.dsn());

        let mut handle = pool
            .get_handle()
            .await
            .context("opening ClickHouse connection")?;

        handle.ping().await.context("pinging ClickHouse")?;

        tracing::info!(
            endpoint = %cfg.endpoint,
            database = %cfg.database,
            "ClickHouse store connected"
        );

        if cfg.migrations.enabled {
            ClickHouseMigrator::new(pool.clone())
                .up()
                .await
                .context("running ClickHouse migrations")?;
        }

        Ok(Self { cfg, pool, health })
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Runs `op` under the configured query timeout and records its
    /// duration and failures under `query`.
    async fn timed<T, F>(&self, query: &'static str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let timeout = self.cfg.query_timeout;

        let result = match tokio::time::timeout(timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("{query} timed out after {timeout:?}")),
        };

        if let Some(h) = &self.health {
            h.store_query_duration
                .with_label_values(&[query])
                .observe(started.elapsed().as_secs_f64());
            if result.is_err() {
                h.store_query_errors.with_label_values(&[query]).inc();
            }
        }

        if let Err(e) = &result {
            tracing::warn!(query, error = %e, "ClickHouse query failed");
        }

        result
    }

    async fn fetch(&self, query: &'static str, sql: String) -> Result<Block<Complex>> {
        self.timed(query, async {
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting ClickHouse handle")?;

            handle
                .query(sql.as_str())
                .fetch_all()
                .await
                .with_context(|| format!("running {query}"))
        })
        .await
    }

    async fn execute(&self, query: &'static str, sql: String) -> Result<()> {
        self.timed(query, async {
            let mut handle = self
                .pool
                .get_handle()
                .await
                .context("getting ClickHouse handle")?;

            handle
                .execute(sql.as_str())
                .await
                .with_context(|| format!("running {query}"))
        })
        .await
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        let block = self
            .fetch("find_user", find_user_sql(&self.cfg.database, user_id))
            .await?;

        let Some(row) = block.rows().next() else {
            return Ok(None);
        };

        let first_seen_ms: i64 = row.get("first_seen_ms").context("reading first_seen_ms")?;
        let platform: String = row.get("platform").context("reading platform")?;
        let region: String = row.get("region").context("reading region")?;
        let first_seen = DateTime::<Utc>::from_timestamp_millis(first_seen_ms)
            .with_context(|| format!("first_seen out of range: {first_seen_ms}"))?;

        Ok(Some(User {
            user_id: user_id.to_string(),
            first_seen,
            platform,
            region,
        }))
    }
}

impl EventStore for ClickHouseStore {
    async fn count_new_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        let block = self
            .fetch("new_users_by_day", new_users_sql(&self.cfg.database, since))
            .await?;

        let mut counts = DayCounts::new();
        for row in block.rows() {
            let day: String = row.get("day").context("reading day")?;
            let cnt: u64 = row.get("cnt").context("reading cnt")?;
            counts.insert(parse_day(&day)?, cnt);
        }

        Ok(counts)
    }

    async fn count_distinct_active_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        let block = self
            .fetch(
                "active_users_by_day",
                active_users_sql(&self.cfg.database, since),
            )
            .await?;

        let mut counts = DayCounts::new();
        for row in block.rows() {
            let day: String = row.get("day").context("reading day")?;
            let cnt: u64 = row.get("cnt").context("reading cnt")?;
            counts.insert(parse_day(&day)?, cnt);
        }

        Ok(counts)
    }

    async fn count_distinct_active_users_by_day_and_dimension(
        &self,
        since: NaiveDate,
        dimension: Dimension,
    ) -> Result<DayCategoryCounts> {
        let query = match dimension {
            Dimension::Platform => "active_users_by_platform",
            Dimension::Region => "active_users_by_region",
        };
        let block = self
            .fetch(
                query,
                active_users_by_dimension_sql(&self.cfg.database, since, dimension),
            )
            .await?;

        let mut counts = DayCategoryCounts::new();
        for row in block.rows() {
            let day: String = row.get("day").context("reading day")?;
            let category: String = row.get("category").context("reading category")?;
            let cnt: u64 = row.get("cnt").context("reading cnt")?;
            counts
                .entry(parse_day(&day)?)
                .or_default()
                .insert(category, cnt);
        }

        Ok(counts)
    }
}

impl EventWriter for ClickHouseStore {
    async fn record_event(&self, event: RawEvent) -> Result<IngestOutcome> {
        self.execute(
            "insert_event",
            insert_event_sql(&self.cfg.database, &event),
        )
        .await?;

        // Concurrent first events for one user may both insert; the
        // ReplacingMergeTree keeps a single row.
        let outcome = match self.find_user(&event.user_id).await? {
            None => {
                let user = User::from_first_event(&event);
                self.execute(
                    "upsert_user",
                    upsert_user_sql(&self.cfg.database, &user, Utc::now()),
                )
                .await?;
                IngestOutcome { new_user: true }
            }
            Some(mut user) => {
                if user.apply(&event) {
                    self.execute(
                        "upsert_user",
                        upsert_user_sql(&self.cfg.database, &user, Utc::now()),
                    )
                    .await?;
                }
                IngestOutcome { new_user: false }
            }
        };

        Ok(outcome)
    }
}

fn new_users_sql(database: &str, since: NaiveDate) -> String {
    format!(
        "SELECT toString(toDate(first_seen)) AS day, count() AS cnt \
         FROM {database}.users FINAL \
         WHERE first_seen >= {} \
         GROUP BY day ORDER BY day",
        since_literal(since)
    )
}

fn active_users_sql(database: &str, since: NaiveDate) -> String {
    format!(
        "SELECT toString(toDate(event_time)) AS day, uniqExact(user_id) AS cnt \
         FROM {database}.user_events \
         WHERE event_time >= {} \
         GROUP BY day ORDER BY day",
        since_literal(since)
    )
}

fn active_users_by_dimension_sql(database: &str, since: NaiveDate, dimension: Dimension) -> String {
    // Dimension names double as column names.
    let column = dimension.as_str();
    format!(
        "SELECT toString(toDate(event_time)) AS day, {column} AS category, uniqExact(user_id) AS cnt \
         FROM {database}.user_events \
         WHERE event_time >= {} \
         GROUP BY day, category ORDER BY day, category",
        since_literal(since)
    )
}

fn find_user_sql(database: &str, user_id: &str) -> String {
    format!(
        "SELECT toUnixTimestamp64Milli(first_seen) AS first_seen_ms, platform, region \
         FROM {database}.users FINAL \
         WHERE user_id = '{}' LIMIT 1",
        escape_sql(user_id)
    )
}

fn insert_event_sql(database: &str, event: &RawEvent) -> String {
    format!(
        "INSERT INTO {database}.user_events (user_id, platform, region, app_version, event_time) \
         VALUES ('{}', '{}', '{}', '{}', {})",
        escape_sql(&event.user_id),
        escape_sql(&event.platform),
        escape_sql(&event.region),
        escape_sql(&event.app_version),
        format_datetime(event.event_time),
    )
}

fn upsert_user_sql(database: &str, user: &User, updated_at: DateTime<Utc>) -> String {
    format!(
        "INSERT INTO {database}.users (user_id, first_seen, platform, region, updated_at) \
         VALUES ('{}', {}, '{}', '{}', {})",
        escape_sql(&user.user_id),
        format_datetime(user.first_seen),
        escape_sql(&user.platform),
        escape_sql(&user.region),
        format_datetime(updated_at),
    )
}

fn parse_day(day: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(day, DAY_KEY_FORMAT)
        .with_context(|| format!("parsing day returned by ClickHouse: {day}"))
}

fn since_literal(since: NaiveDate) -> String {
    format!("toDateTime64('{since} 00:00:00.000', 3, 'UTC')")
}

/// Formats an instant as a quoted ClickHouse DateTime64(3) literal.
fn format_datetime(t: DateTime<Utc>) -> String {
    format!("'{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

/// Escapes a string value for SQL insertion (single-quote escaping).
fn escape_sql(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
