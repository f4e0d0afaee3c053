use std::fmt;
use std::str::FromStr;

use anyhow::bail;

/// Measurements backing the `icingachk` collection.
pub const HOSTALIVE_MEASUREMENTS: [&str; 3] = [
    "my-hostalive-icmp",
    "my-hostalive-tcp",
    "my-hostalive-http",
];

/// A named family of measurements sharing an aggregation recipe.
///
/// The set is closed: downsampling recipes, frontier filters and instance
/// discovery queries are all dispatched on this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    IfStats,
    IfTraffic,
    GenGauge,
    GenCounter,
    IcingaChk,
}

impl Collection {
    /// All collections, for iteration in tests and validation.
    pub fn all() -> [Collection; 5] {
        [
            Collection::IfStats,
            Collection::IfTraffic,
            Collection::GenGauge,
            Collection::GenCounter,
            Collection::IcingaChk,
        ]
    }

    /// Canonical configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::IfStats => "ifstats",
            Collection::IfTraffic => "iftraffic",
            Collection::GenGauge => "gengauge",
            Collection::GenCounter => "gencounter",
            Collection::IcingaChk => "icingachk",
        }
    }

    /// Tag identifying a logical producer within this collection.
    pub fn instance_tag(&self) -> &'static str {
        match self {
            Collection::IcingaChk => "hostname",
            _ => "agent_name",
        }
    }

    /// Whether instances are discovered through `schema.measurementTagValues`
    /// (telegraf collections) rather than a measurement-matching value scan.
    pub fn uses_tag_values_lookup(&self) -> bool {
        !matches!(self, Collection::IcingaChk)
    }

    /// Flux predicate locating this collection's primary-field series for a
    /// given instance. Used to detect the last written timestamp.
    ///
    /// On non-head tiers `gengauge`/`gencounter` constrain the stored
    /// `aggregate` label so the probe targets the canonical per-tier series.
    pub fn frontier_filter(&self, instance: &str, is_head: bool) -> String {
        match self {
            Collection::IfStats => format!(
                r#"r._measurement == "ifstats" and r["agent_name"] == "{instance}" and r._field == "ifAdminStatus""#
            ),
            Collection::IfTraffic => format!(
                r#"r._measurement == "iftraffic" and r["agent_name"] == "{instance}" and r._field == "ifOperStatus""#
            ),
            Collection::GenGauge => {
                let mut f = format!(
                    r#"r._measurement == "gengauge" and r["agent_name"] == "{instance}""#
                );
                if !is_head {
                    f.push_str(r#" and r["aggregate"] == "mean""#);
                }
                f
            }
            Collection::GenCounter => {
                let mut f = format!(
                    r#"r._measurement == "gencounter" and r["agent_name"] == "{instance}""#
                );
                if !is_head {
                    f.push_str(r#" and r["aggregate"] == "last""#);
                }
                f
            }
            Collection::IcingaChk => format!(
                r#"(r._measurement == "{}" or r._measurement == "{}" or r._measurement == "{}") and r["hostname"] == "{instance}" and r._field == "value""#,
                HOSTALIVE_MEASUREMENTS[0], HOSTALIVE_MEASUREMENTS[1], HOSTALIVE_MEASUREMENTS[2],
            ),
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ifstats" => Ok(Collection::IfStats),
            "iftraffic" => Ok(Collection::IfTraffic),
            "gengauge" => Ok(Collection::GenGauge),
            "gencounter" => Ok(Collection::GenCounter),
            "icingachk" => Ok(Collection::IcingaChk),
            other => bail!("unknown collection {other:?}"),
        }
    }
}

/// Instance weight class derived from series cardinality.
///
/// Group membership shards parallel workers and scales the chunk width the
/// tier walker uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardinalityGroup {
    Light,
    Medium,
    Heavy,
}

impl CardinalityGroup {
    pub fn all() -> [CardinalityGroup; 3] {
        [
            CardinalityGroup::Light,
            CardinalityGroup::Medium,
            CardinalityGroup::Heavy,
        ]
    }

    /// Group label as it appears in logs ("hevy" matches the original
    /// deployment's configuration spelling).
    pub fn as_str(&self) -> &'static str {
        match self {
            CardinalityGroup::Light => "light",
            CardinalityGroup::Medium => "medium",
            CardinalityGroup::Heavy => "hevy",
        }
    }

    /// Classify a series cardinality against the configured thresholds.
    pub fn classify(card: i64, card_medium: i64, card_hevy: i64) -> CardinalityGroup {
        if card < card_medium {
            CardinalityGroup::Light
        } else if card < card_hevy {
            CardinalityGroup::Medium
        } else {
            CardinalityGroup::Heavy
        }
    }
}

impl fmt::Display for CardinalityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
