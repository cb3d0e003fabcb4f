//! Partition identity.
//!
//! A partition is the unit of processing: one `(domain, week_ending, tier)`
//! triple, matching one weekly FINRA OTC transparency file. Partitions are
//! logically immutable units of work; re-processing is tracked per attempt,
//! never silently overwritten.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Domain string for the FINRA OTC transparency source.
pub const OTC_TRANSPARENCY_DOMAIN: &str = "finra.otc_transparency";

/// Market-data category of a weekly transparency file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// NMS Tier 1 (S&P 500 / Russell 1000 and selected ETPs).
    NmsTier1,
    /// NMS Tier 2 (remaining NMS stocks).
    NmsTier2,
    /// OTC equities (non-NMS).
    Otce,
}

impl Tier {
    /// All tiers in reporting order.
    pub const ALL: [Tier; 3] = [Tier::NmsTier1, Tier::NmsTier2, Tier::Otce];

    /// Stable storage/reporting label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NmsTier1 => "NMS_TIER_1",
            Self::NmsTier2 => "NMS_TIER_2",
            Self::Otce => "OTCE",
        }
    }

    /// Parse a storage label back into a tier.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "NMS_TIER_1" => Some(Self::NmsTier1),
            "NMS_TIER_2" => Some(Self::NmsTier2),
            "OTCE" => Some(Self::Otce),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Unit of processing keyed by `(domain, week_ending, tier)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub domain: String,
    pub week_ending: NaiveDate,
    pub tier: Tier,
}

impl Partition {
    pub fn new(domain: impl Into<String>, week_ending: NaiveDate, tier: Tier) -> Self {
        Self {
            domain: domain.into(),
            week_ending,
            tier,
        }
    }

    /// Partition for the default OTC transparency domain.
    pub fn otc(week_ending: NaiveDate, tier: Tier) -> Self {
        Self::new(OTC_TRANSPARENCY_DOMAIN, week_ending, tier)
    }

    /// External reporting key, `"{week}|{tier}"`.
    pub fn partition_key(&self) -> String {
        format!("{}|{}", self.week_ending, self.tier.label())
    }

    /// The partition for the week `n` weeks before this one, same tier.
    pub fn weeks_back(&self, n: u32) -> Self {
        Self {
            domain: self.domain.clone(),
            week_ending: self.week_ending - chrono::Duration::weeks(i64::from(n)),
            tier: self.tier,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.domain, self.partition_key())
    }
}

/// Week-ending dates in `[from, to]`, stepping back one week from `to`.
///
/// Anchored on `to` so the most recent reporting date defines the weekly grid.
pub fn weeks_in_range(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    let mut weeks = Vec::new();
    let mut cursor = to;
    while cursor >= from {
        weeks.push(cursor);
        cursor -= chrono::Duration::weeks(1);
    }
    weeks.reverse();
    weeks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_tier_labels_round_trip() {
        for tier in Tier::ALL {
            assert_eq!(Tier::parse(tier.label()), Some(tier));
        }
        assert_eq!(Tier::parse("NMS_TIER_3"), None);
    }

    #[test]
    fn test_partition_key_matches_reporting_convention() {
        let p = Partition::otc(d("2026-01-09"), Tier::NmsTier1);
        assert_eq!(p.partition_key(), "2026-01-09|NMS_TIER_1");
    }

    #[test]
    fn test_weeks_back() {
        let p = Partition::otc(d("2026-01-09"), Tier::Otce);
        assert_eq!(p.weeks_back(1).week_ending, d("2026-01-02"));
        assert_eq!(p.weeks_back(4).week_ending, d("2025-12-12"));
        assert_eq!(p.weeks_back(1).tier, Tier::Otce);
    }

    #[test]
    fn test_weeks_in_range_anchored_on_end() {
        let weeks = weeks_in_range(d("2026-01-01"), d("2026-01-23"));
        assert_eq!(weeks, vec![d("2026-01-02"), d("2026-01-09"), d("2026-01-16"), d("2026-01-23")]);
    }

    #[test]
    fn test_weeks_in_range_empty_when_reversed() {
        assert!(weeks_in_range(d("2026-01-23"), d("2026-01-01")).is_empty());
    }
}
