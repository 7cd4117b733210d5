//! Rollup engine: turns per-day store counts into gap-filled daily series,
//! merges them into week and month buckets and collapses long-tail
//! categories.
//!
//! Everything here except [`SeriesService`] is pure and synchronous.

pub mod bucket;
pub mod category;
pub mod daily;
pub mod error;
pub mod reaggregate;
pub mod record;
pub mod series;
pub mod topn;

pub use bucket::{bucket_key, bucket_key_for_date, parse_day_key, Granularity, DAY_KEY_FORMAT};
pub use category::{normalize, normalize_dimension, Dimension, Platform, OTHER, UNKNOWN};
pub use daily::{build, window_start, DailyCounts, DayCategoryCounts, DayCounts};
pub use error::RollupError;
pub use reaggregate::reaggregate;
pub use record::{AggregateRecord, CategoryCounts};
pub use series::{window_totals, SeriesService};
pub use topn::collapse;
