use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::category::Dimension;

/// Canonical category -> count for one dimension.
pub type CategoryCounts = BTreeMap<String, u64>;

/// Usage summary for one time bucket.
///
/// Serializes with the bucket key under `date`; breakdown maps are omitted
/// when empty. Breakdown sums are distinct-user counts per category and are
/// not expected to add up to `active_users`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    #[serde(rename = "date")]
    pub bucket_key: String,
    #[serde(default)]
    pub new_users: u64,
    #[serde(default)]
    pub active_users: u64,
    /// Equal to `active_users`; there is no separate presence signal.
    #[serde(default)]
    pub online_users: u64,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub platform_active: CategoryCounts,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub region_active: CategoryCounts,
}

impl AggregateRecord {
    /// Creates an all-zero record for the given bucket.
    pub fn empty(bucket_key: impl Into<String>) -> Self {
        Self {
            bucket_key: bucket_key.into(),
            ..Default::default()
        }
    }

    /// Returns the breakdown map of a dimension.
    pub fn breakdown(&self, dimension: Dimension) -> &CategoryCounts {
        match dimension {
            Dimension::Platform => &self.platform_active,
            Dimension::Region => &self.region_active,
        }
    }

    pub fn breakdown_mut(&mut self, dimension: Dimension) -> &mut CategoryCounts {
        match dimension {
            Dimension::Platform => &mut self.platform_active,
            Dimension::Region => &mut self.region_active,
        }
    }

    /// Iterates over the non-empty dimension breakdowns.
    pub fn dimension_breakdowns(&self) -> impl Iterator<Item = (Dimension, &CategoryCounts)> {
        Dimension::ALL
            .into_iter()
            .map(move |d| (d, self.breakdown(d)))
            .filter(|(_, counts)| !counts.is_empty())
    }

    /// Adds `count` to a category, skipping zero counts so empty days keep
    /// empty maps.
    pub fn add_category(&mut self, dimension: Dimension, category: String, count: u64) {
        if count == 0 {
            return;
        }
        *self.breakdown_mut(dimension).entry(category).or_insert(0) += count;
    }

    /// Folds another record's counts into this one. The bucket key is kept.
    pub fn absorb(&mut self, other: &AggregateRecord) {
        self.new_users += other.new_users;
        self.active_users += other.active_users;
        self.online_users += other.online_users;

        for dimension in Dimension::ALL {
            for (category, &count) in other.breakdown(dimension) {
                self.add_category(dimension, category.clone(), count);
            }
        }
    }

    /// True when every count is zero and both breakdowns are empty.
    pub fn is_zero(&self) -> bool {
        self.new_users == 0
            && self.active_users == 0
            && self.online_users == 0
            && self.platform_active.is_empty()
            && self.region_active.is_empty()
    }
}

/// Older producers emit `null` for a day without breakdown data.
fn null_as_empty<'de, D>(deserializer: D) -> Result<CategoryCounts, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<CategoryCounts>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, new: u64, active: u64) -> AggregateRecord {
        AggregateRecord {
            bucket_key: key.to_string(),
            new_users: new,
            active_users: active,
            online_users: active,
            ..Default::default()
        }
    }

    #[test]
    fn test_absorb_sums_counts_and_merges_maps() {
        let mut a = record("2024-06", 1, 3);
        a.add_category(Dimension::Platform, "ios".to_string(), 2);
        a.add_category(Dimension::Region, "eu".to_string(), 3);

        let mut b = record("2024-06-02", 2, 5);
        b.add_category(Dimension::Platform, "ios".to_string(), 1);
        b.add_category(Dimension::Platform, "web".to_string(), 4);

        a.absorb(&b);

        assert_eq!(a.bucket_key, "2024-06");
        assert_eq!(a.new_users, 3);
        assert_eq!(a.active_users, 8);
        assert_eq!(a.online_users, 8);
        assert_eq!(a.platform_active.get("ios"), Some(&3));
        assert_eq!(a.platform_active.get("web"), Some(&4));
        assert_eq!(a.region_active.get("eu"), Some(&3));
    }

    #[test]
    fn test_add_category_skips_zero() {
        let mut r = AggregateRecord::empty("2024-06-01");
        r.add_category(Dimension::Region, "us".to_string(), 0);
        assert!(r.region_active.is_empty());
        assert!(r.is_zero());
    }

    #[test]
    fn test_serialization_shape() {
        let mut r = record("2024-06-01", 1, 1);
        r.add_category(Dimension::Platform, "ios".to_string(), 1);

        let value = serde_json::to_value(&r).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "date": "2024-06-01",
                "new_users": 1,
                "active_users": 1,
                "online_users": 1,
                "platform_active": {"ios": 1}
            })
        );
    }

    #[test]
    fn test_deserialize_minimal_record() {
        let r: AggregateRecord =
            serde_json::from_str(r#"{"date":"2024-06-02","active_users":4}"#).expect("parse");
        assert_eq!(r.bucket_key, "2024-06-02");
        assert_eq!(r.active_users, 4);
        assert_eq!(r.new_users, 0);
        assert!(r.platform_active.is_empty());
    }

    #[test]
    fn test_deserialize_null_breakdowns() {
        let r: AggregateRecord = serde_json::from_str(
            r#"{"date":"2024-06-03","new_users":0,"active_users":0,"online_users":0,"platform_active":null,"region_active":null}"#,
        )
        .expect("parse");
        assert!(r.is_zero());
    }

    #[test]
    fn test_dimension_breakdowns_skips_empty() {
        let mut r = AggregateRecord::empty("2024-06-01");
        assert_eq!(r.dimension_breakdowns().count(), 0);

        r.add_category(Dimension::Region, "apac".to_string(), 2);
        let dims: Vec<Dimension> = r.dimension_breakdowns().map(|(d, _)| d).collect();
        assert_eq!(dims, vec![Dimension::Region]);
    }
}
