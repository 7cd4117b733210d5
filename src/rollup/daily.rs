use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use super::bucket::{bucket_key_for_date, Granularity};
use super::category::{normalize_dimension, Dimension};
use super::error::RollupError;
use super::record::AggregateRecord;

/// Sparse per-day counts. Absent days are zero.
pub type DayCounts = BTreeMap<NaiveDate, u64>;

/// Sparse per-day counts keyed by raw (not yet normalized) category.
pub type DayCategoryCounts = BTreeMap<NaiveDate, BTreeMap<String, u64>>;

/// Results of the four event-store queries a daily series is built from.
///
/// All four must be fully collected before [`build`] runs.
#[derive(Debug, Clone, Default)]
pub struct DailyCounts {
    /// New users keyed by first-seen day.
    pub new_users: DayCounts,
    /// Distinct active users keyed by event day.
    pub active_users: DayCounts,
    /// Distinct active users keyed by event day and raw platform.
    pub platform_active: DayCategoryCounts,
    /// Distinct active users keyed by event day and raw region.
    pub region_active: DayCategoryCounts,
}

impl DailyCounts {
    fn category_counts(&self, dimension: Dimension) -> &DayCategoryCounts {
        match dimension {
            Dimension::Platform => &self.platform_active,
            Dimension::Region => &self.region_active,
        }
    }
}

/// Returns the first day of a window of `window_length_days` ending on
/// `today` (inclusive).
pub fn window_start(today: NaiveDate, window_length_days: u32) -> Result<NaiveDate, RollupError> {
    if window_length_days == 0 {
        return Err(RollupError::InvalidWindow { days: 0 });
    }

    today
        .checked_sub_days(Days::new(u64::from(window_length_days - 1)))
        .ok_or(RollupError::InvalidWindow {
            days: i64::from(window_length_days),
        })
}

/// Builds one record per day over `[window_start, window_start + window_length_days)`.
///
/// The result is ordered and contiguous: days the store has no data for get
/// an all-zero record with empty breakdowns. Raw categories are normalized
/// while assembling, so raw values that share a canonical category are
/// summed. `online_users` mirrors `active_users`.
pub fn build(
    window_start: NaiveDate,
    window_length_days: u32,
    counts: &DailyCounts,
) -> Result<Vec<AggregateRecord>, RollupError> {
    if window_length_days == 0 {
        return Err(RollupError::InvalidWindow { days: 0 });
    }

    let mut records = Vec::with_capacity(window_length_days as usize);

    for offset in 0..window_length_days {
        let day = window_start
            .checked_add_days(Days::new(u64::from(offset)))
            .ok_or(RollupError::InvalidWindow {
                days: i64::from(window_length_days),
            })?;

        let active_users = counts.active_users.get(&day).copied().unwrap_or(0);
        let mut record = AggregateRecord {
            bucket_key: bucket_key_for_date(day, Granularity::Day),
            new_users: counts.new_users.get(&day).copied().unwrap_or(0),
            active_users,
            online_users: active_users,
            ..Default::default()
        };

        for dimension in Dimension::ALL {
            let Some(raw) = counts.category_counts(dimension).get(&day) else {
                continue;
            };
            for (raw_category, &count) in raw {
                record.add_category(dimension, normalize_dimension(dimension, raw_category), count);
            }
        }

        records.push(record);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn categories(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_window_start_ends_on_today() {
        let today = date(2024, 6, 3);
        assert_eq!(window_start(today, 1).ok(), Some(today));
        assert_eq!(window_start(today, 3).ok(), Some(date(2024, 6, 1)));
        assert_eq!(window_start(today, 7).ok(), Some(date(2024, 5, 28)));
        assert_eq!(window_start(date(2024, 3, 1), 30).ok(), Some(date(2024, 1, 31)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(matches!(
            window_start(date(2024, 6, 3), 0),
            Err(RollupError::InvalidWindow { days: 0 })
        ));
        assert!(matches!(
            build(date(2024, 6, 3), 0, &DailyCounts::default()),
            Err(RollupError::InvalidWindow { days: 0 })
        ));
    }

    #[test]
    fn test_empty_store_is_gap_filled() {
        for len in [1u32, 2, 7, 30, 90] {
            let records = build(date(2023, 12, 20), len, &DailyCounts::default()).expect("build");
            assert_eq!(records.len(), len as usize);
            assert!(records.iter().all(AggregateRecord::is_zero));
            for pair in records.windows(2) {
                let a = pair[0].bucket_key.as_str();
                let b = pair[1].bucket_key.as_str();
                let next = NaiveDate::parse_from_str(a, "%Y-%m-%d")
                    .expect("day key")
                    .succ_opt()
                    .expect("next day");
                assert_eq!(b, next.format("%Y-%m-%d").to_string());
                assert!(a < b);
            }
        }
    }

    #[test]
    fn test_sparse_data_lands_on_its_day() {
        let mut counts = DailyCounts::default();
        counts.new_users.insert(date(2024, 6, 1), 1);
        counts.active_users.insert(date(2024, 6, 1), 1);
        counts
            .platform_active
            .insert(date(2024, 6, 1), categories(&[("ios", 1)]));

        let records = build(date(2024, 6, 1), 3, &counts).expect("build");
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].bucket_key, "2024-06-01");
        assert_eq!(records[0].new_users, 1);
        assert_eq!(records[0].active_users, 1);
        assert_eq!(records[0].online_users, 1);
        assert_eq!(records[0].platform_active, categories(&[("ios", 1)]));
        assert!(records[0].region_active.is_empty());

        assert_eq!(records[1].bucket_key, "2024-06-02");
        assert!(records[1].is_zero());
        assert_eq!(records[2].bucket_key, "2024-06-03");
        assert!(records[2].is_zero());
    }

    #[test]
    fn test_platform_normalization_pools_counts() {
        let mut counts = DailyCounts::default();
        counts.active_users.insert(date(2024, 6, 1), 9);
        counts.platform_active.insert(
            date(2024, 6, 1),
            categories(&[("IOS", 2), ("ios", 3), ("blackberry", 1), ("", 1), ("Web", 2)]),
        );

        let records = build(date(2024, 6, 1), 1, &counts).expect("build");
        assert_eq!(
            records[0].platform_active,
            categories(&[("ios", 5), ("other", 2), ("web", 2)])
        );
    }

    #[test]
    fn test_region_blank_becomes_unknown() {
        let mut counts = DailyCounts::default();
        counts
            .region_active
            .insert(date(2024, 6, 1), categories(&[("", 4), ("eu-west", 2)]));

        let records = build(date(2024, 6, 1), 1, &counts).expect("build");
        assert_eq!(
            records[0].region_active,
            categories(&[("eu-west", 2), ("unknown", 4)])
        );
    }

    #[test]
    fn test_zero_valued_categories_dropped() {
        let mut counts = DailyCounts::default();
        counts
            .region_active
            .insert(date(2024, 6, 1), categories(&[("eu-west", 0)]));

        let records = build(date(2024, 6, 1), 1, &counts).expect("build");
        assert!(records[0].region_active.is_empty());
    }

    #[test]
    fn test_data_outside_window_ignored() {
        let mut counts = DailyCounts::default();
        counts.active_users.insert(date(2024, 5, 31), 10);
        counts.active_users.insert(date(2024, 6, 2), 7);
        counts.active_users.insert(date(2024, 6, 4), 10);

        let records = build(date(2024, 6, 1), 3, &counts).expect("build");
        let active: Vec<u64> = records.iter().map(|r| r.active_users).collect();
        assert_eq!(active, vec![0, 7, 0]);
    }

    #[test]
    fn test_window_crosses_year_boundary() {
        let records = build(date(2024, 12, 30), 4, &DailyCounts::default()).expect("build");
        let keys: Vec<&str> = records.iter().map(|r| r.bucket_key.as_str()).collect();
        assert_eq!(keys, vec!["2024-12-30", "2024-12-31", "2025-01-01", "2025-01-02"]);
    }
}
