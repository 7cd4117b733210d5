use std::fmt;
use std::str::FromStr;

use super::error::RollupError;

/// Overflow category for closed vocabularies and for collapsed long tails.
pub const OTHER: &str = "other";

/// Sentinel for an empty value in an open vocabulary.
pub const UNKNOWN: &str = "unknown";

/// Categorical dimension an active-user count can be broken down by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Platform,
    Region,
}

impl Dimension {
    /// All dimensions, in report order.
    pub const ALL: [Dimension; 2] = [Dimension::Platform, Dimension::Region];

    /// Returns the canonical dimension name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Platform => "platform",
            Self::Region => "region",
        }
    }

    /// Parses a dimension name. Matching is exact; names are lowercase.
    pub fn from_name(name: &str) -> Result<Self, RollupError> {
        match name {
            "platform" => Ok(Self::Platform),
            "region" => Ok(Self::Region),
            _ => Err(RollupError::UnknownDimension {
                name: name.to_string(),
            }),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

/// Canonical platform vocabulary.
///
/// Raw platform strings outside the named set are pooled into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Ios,
    Android,
    Web,
    Windows,
    MacOs,
    Linux,
    HarmonyOs,
    Other,
}

impl Platform {
    /// Named platforms in display order, excluding the overflow category.
    pub const NAMED: [Platform; 7] = [
        Platform::Ios,
        Platform::Android,
        Platform::Web,
        Platform::Windows,
        Platform::MacOs,
        Platform::Linux,
        Platform::HarmonyOs,
    ];

    /// Returns the canonical label used in breakdown maps.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Web => "web",
            Self::Windows => "windows",
            Self::MacOs => "macos",
            Self::Linux => "linux",
            Self::HarmonyOs => "harmonyos",
            Self::Other => OTHER,
        }
    }

    /// Maps a raw platform string onto the vocabulary, ignoring ASCII case
    /// and surrounding whitespace. Never fails.
    pub fn from_raw(raw: &str) -> Self {
        let raw = raw.trim();
        Self::NAMED
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(raw))
            .unwrap_or(Self::Other)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalizes a raw dimension value into its canonical category.
///
/// Dimensions without a vocabulary (region, or any name this crate does not
/// know) pass values through unchanged, with blank input mapped to
/// [`UNKNOWN`].
pub fn normalize(dimension_name: &str, raw_value: &str) -> String {
    match Dimension::from_name(dimension_name) {
        Ok(dimension) => normalize_dimension(dimension, raw_value),
        Err(_) => open_category(raw_value),
    }
}

/// Typed variant of [`normalize`].
pub fn normalize_dimension(dimension: Dimension, raw_value: &str) -> String {
    match dimension {
        Dimension::Platform => Platform::from_raw(raw_value).as_str().to_string(),
        Dimension::Region => open_category(raw_value),
    }
}

fn open_category(raw_value: &str) -> String {
    if raw_value.trim().is_empty() {
        UNKNOWN.to_string()
    } else {
        raw_value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_case_insensitive() {
        assert_eq!(normalize("platform", "IOS"), "ios");
        assert_eq!(normalize("platform", "Android"), "android");
        assert_eq!(normalize("platform", "  web "), "web");
        assert_eq!(normalize("platform", "HarmonyOS"), "harmonyos");
    }

    #[test]
    fn test_platform_unknown_pools_into_other() {
        assert_eq!(normalize("platform", "blackberry"), "other");
        assert_eq!(normalize("platform", ""), "other");
        assert_eq!(normalize("platform", "   "), "other");
        assert_eq!(normalize("platform", "OTHER"), "other");
    }

    #[test]
    fn test_region_is_identity() {
        assert_eq!(normalize("region", "CN-Shanghai"), "CN-Shanghai");
        assert_eq!(normalize("region", "us-east"), "us-east");
    }

    #[test]
    fn test_region_empty_is_unknown() {
        assert_eq!(normalize("region", ""), "unknown");
        assert_eq!(normalize("region", " \t"), "unknown");
    }

    #[test]
    fn test_unrecognized_dimension_uses_identity() {
        assert_eq!(normalize("app_version", "1.2.3"), "1.2.3");
        assert_eq!(normalize("app_version", ""), "unknown");
    }

    #[test]
    fn test_dimension_from_name() {
        assert_eq!(Dimension::from_name("platform").ok(), Some(Dimension::Platform));
        assert_eq!(Dimension::from_name("region").ok(), Some(Dimension::Region));
        assert!(matches!(
            Dimension::from_name("Platform"),
            Err(RollupError::UnknownDimension { .. })
        ));
        assert!(matches!(
            "country".parse::<Dimension>(),
            Err(RollupError::UnknownDimension { name }) if name == "country"
        ));
    }

    #[test]
    fn test_platform_vocabulary_labels_are_unique() {
        let mut labels: Vec<&str> = Platform::NAMED.iter().map(|p| p.as_str()).collect();
        labels.push(Platform::Other.as_str());
        let count = labels.len();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), count);
        assert_eq!(count, 8);
    }

    #[test]
    fn test_platform_round_trips_through_label() {
        for platform in Platform::NAMED {
            assert_eq!(Platform::from_raw(platform.as_str()), platform);
        }
        assert_eq!(Platform::from_raw("other"), Platform::Other);
    }
}
