//! Change identifiers
//!
//! A [`ChangeId`] is the server's version token for a view. On the wire it is a
//! colon-delimited list of numeric segments (`"12:3:40"`). Ordering compares
//! segments numerically from left to right, a shorter id that is a prefix of a
//! longer one sorts first, and the empty string is the minimum value used to
//! mean "no history".

use crate::errors::TetherError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Totally ordered version token for view changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId {
    segments: Vec<u64>,
}

impl ChangeId {
    /// The minimum change id, equivalent to `ChangeId::from_str("")`.
    pub fn min() -> Self {
        Self::default()
    }

    /// Build a change id from numeric segments.
    pub fn from_segments(segments: impl Into<Vec<u64>>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    /// Numeric segments of this id.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// True for the minimum ("no history") id.
    pub fn is_min(&self) -> bool {
        self.segments.is_empty()
    }
}

impl FromStr for ChangeId {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::min());
        }
        let segments = s
            .split(':')
            .map(|part| {
                part.parse::<u64>().map_err(|_| TetherError::InvalidChangeId {
                    input: s.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str(":")?;
            }
            write!(f, "{segment}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for ChangeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> ChangeId {
        s.parse().unwrap()
    }

    #[test]
    fn empty_string_is_minimum() {
        assert!(id("").is_min());
        assert!(id("") < id("0"));
        assert!(id("") < id("1:2"));
    }

    #[test]
    fn segments_compare_numerically() {
        assert!(id("9") < id("10"));
        assert!(id("1:9") < id("1:10"));
        assert!(id("2") > id("1:99"));
    }

    #[test]
    fn prefix_sorts_first() {
        assert!(id("1") < id("1:0"));
        assert!(id("1:2") < id("1:2:3"));
    }

    #[test]
    fn display_restores_wire_form() {
        assert_eq!(id("12:3:40").to_string(), "12:3:40");
        assert_eq!(ChangeId::min().to_string(), "");
    }

    #[test]
    fn rejects_non_numeric_segments() {
        assert!(matches!(
            "1:x".parse::<ChangeId>(),
            Err(TetherError::InvalidChangeId { .. })
        ));
        assert!("1::2".parse::<ChangeId>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&id("3:4")).unwrap();
        assert_eq!(json, "\"3:4\"");
        let back: ChangeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id("3:4"));
    }

    proptest! {
        #[test]
        fn ordering_matches_numeric_segments(
            a in proptest::collection::vec(0u64..1000, 0..4),
            b in proptest::collection::vec(0u64..1000, 0..4),
        ) {
            let left = ChangeId::from_segments(a.clone());
            let right = ChangeId::from_segments(b.clone());
            prop_assert_eq!(left.cmp(&right), a.cmp(&b));

            let reparsed: ChangeId = left.to_string().parse().unwrap();
            prop_assert_eq!(reparsed, left);
        }
    }
}
