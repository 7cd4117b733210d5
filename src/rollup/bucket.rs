use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Deserialize;

use super::error::RollupError;

/// Time bucket size for a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Granularity::Day, Granularity::Week, Granularity::Month];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, RollupError> {
        match name {
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            _ => Err(RollupError::UnknownGranularity {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Format of a day bucket key.
pub const DAY_KEY_FORMAT: &str = "%Y-%m-%d";

/// Returns the bucket key of an instant. All bucketing happens in UTC.
pub fn bucket_key(instant: DateTime<Utc>, granularity: Granularity) -> String {
    bucket_key_for_date(instant.date_naive(), granularity)
}

/// Returns the bucket key of a calendar date.
///
/// Week keys are `YYYY-Www` where weeks restart on January 1st of every
/// year, so a week never carries two different year labels. This is not
/// ISO-8601 week numbering.
pub fn bucket_key_for_date(date: NaiveDate, granularity: Granularity) -> String {
    match granularity {
        Granularity::Day => date.format(DAY_KEY_FORMAT).to_string(),
        Granularity::Week => format!("{:04}-W{:02}", date.year(), week_of_year(date)),
        Granularity::Month => format!("{:04}-{:02}", date.year(), date.month()),
    }
}

/// Parses a day bucket key back into its date.
pub fn parse_day_key(key: &str) -> Result<NaiveDate, RollupError> {
    NaiveDate::parse_from_str(key, DAY_KEY_FORMAT).map_err(|_| RollupError::InvalidBucketKey {
        key: key.to_string(),
    })
}

/// ceil((days since Jan 1 + weekday of Jan 1 + 1) / 7), weekday counted
/// from Sunday = 0.
fn week_of_year(date: NaiveDate) -> u32 {
    let jan1_weekday = NaiveDate::from_ymd_opt(date.year(), 1, 1)
        .map(|d| d.weekday().num_days_from_sunday())
        .unwrap_or(0);

    (date.ordinal0() + jan1_weekday + 1).div_ceil(7)
}
