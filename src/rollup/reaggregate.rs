use std::collections::BTreeMap;

use super::bucket::{bucket_key_for_date, parse_day_key, Granularity};
use super::error::RollupError;
use super::record::AggregateRecord;

/// Merges daily records into coarser buckets.
///
/// Counts are summed and breakdown maps unioned per bucket; output is sorted
/// by bucket key. `Granularity::Day` returns the input unchanged. Users
/// active on several days of one bucket are counted once per day.
pub fn reaggregate(
    daily: &[AggregateRecord],
    granularity: Granularity,
) -> Result<Vec<AggregateRecord>, RollupError> {
    if granularity == Granularity::Day {
        return Ok(daily.to_vec());
    }

    let mut buckets: BTreeMap<String, AggregateRecord> = BTreeMap::new();

    for record in daily {
        let day = parse_day_key(&record.bucket_key)?;
        let key = bucket_key_for_date(day, granularity);

        buckets
            .entry(key)
            .or_insert_with_key(|key| AggregateRecord::empty(key.clone()))
            .absorb(record);
    }

    Ok(buckets.into_values().collect())
}
