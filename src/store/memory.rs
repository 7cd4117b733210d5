use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::{EventStore, EventWriter, IngestOutcome, RawEvent, User};
use crate::rollup::{DayCategoryCounts, DayCounts, Dimension};

/// In-process event store.
///
/// Users live in a sharded map keyed by user id; events are appended to a
/// single log. Nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, User>,
    events: RwLock<Vec<RawEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct users recorded.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Number of events recorded.
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Returns a copy of a user, if known.
    pub fn user(&self, user_id: &str) -> Option<User> {
        self.users.get(user_id).map(|u| u.value().clone())
    }

    fn new_users_by_day(&self, since: NaiveDate) -> DayCounts {
        let mut counts = DayCounts::new();

        for user in self.users.iter() {
            let day = user.first_seen.date_naive();
            if day >= since {
                *counts.entry(day).or_insert(0) += 1;
            }
        }

        counts
    }

    fn active_users_by_day(&self, since: NaiveDate) -> DayCounts {
        let events = self.events.read();
        let mut users: BTreeMap<NaiveDate, HashSet<&str>> = BTreeMap::new();

        for event in events.iter() {
            let day = event.event_time.date_naive();
            if day >= since {
                users.entry(day).or_default().insert(&event.user_id);
            }
        }

        users
            .into_iter()
            .map(|(day, ids)| (day, ids.len() as u64))
            .collect()
    }

    fn active_users_by_day_and_dimension(
        &self,
        since: NaiveDate,
        dimension: Dimension,
    ) -> DayCategoryCounts {
        let events = self.events.read();
        let mut users: BTreeMap<NaiveDate, BTreeMap<&str, HashSet<&str>>> = BTreeMap::new();

        for event in events.iter() {
            let day = event.event_time.date_naive();
            if day >= since {
                users
                    .entry(day)
                    .or_default()
                    .entry(event.dimension_value(dimension))
                    .or_default()
                    .insert(&event.user_id);
            }
        }

        users
            .into_iter()
            .map(|(day, by_category)| {
                let counts = by_category
                    .into_iter()
                    .map(|(category, ids)| (category.to_string(), ids.len() as u64))
                    .collect();
                (day, counts)
            })
            .collect()
    }
}

impl EventStore for MemoryStore {
    async fn count_new_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        Ok(self.new_users_by_day(since))
    }

    async fn count_distinct_active_users_by_day(&self, since: NaiveDate) -> Result<DayCounts> {
        Ok(self.active_users_by_day(since))
    }

    async fn count_distinct_active_users_by_day_and_dimension(
        &self,
        since: NaiveDate,
        dimension: Dimension,
    ) -> Result<DayCategoryCounts> {
        Ok(self.active_users_by_day_and_dimension(since, dimension))
    }
}

impl EventWriter for MemoryStore {
    async fn record_event(&self, event: RawEvent) -> Result<IngestOutcome> {
        let new_user = match self.users.entry(event.user_id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().apply(&event) {
                    tracing::debug!(user_id = %event.user_id, "user attributes updated");
                }
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(User::from_first_event(&event));
                true
            }
        };

        self.events.write().push(event);

        Ok(IngestOutcome { new_user })
    }
}
