use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bucket::BucketParams;
use crate::error::{Error, ErrorDetails};

pub const MIN_CAPACITY: u32 = 1;
pub const MAX_CAPACITY: u32 = 1000;
pub const MIN_REFILL_RATE: f64 = 0.1;
pub const MAX_REFILL_RATE: f64 = 100.0;

/// Priority tier a key belongs to. Stored as `priority` on the key record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    High,
    #[default]
    #[serde(alias = "medium")]
    Normal,
    Low,
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 3] = [PriorityTier::High, PriorityTier::Normal, PriorityTier::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::High => "high",
            PriorityTier::Normal => "normal",
            PriorityTier::Low => "low",
        }
    }

    /// Parses the `priority` column of a key record. Unknown values fall back to `normal`.
    pub fn from_record(priority: Option<&str>) -> Self {
        match priority {
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::debug!("Unknown key priority `{value}`, using `normal`");
                PriorityTier::Normal
            }),
            None => PriorityTier::Normal,
        }
    }
}

impl Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PriorityTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(PriorityTier::High),
            "normal" | "medium" => Ok(PriorityTier::Normal),
            "low" => Ok(PriorityTier::Low),
            _ => Err(Error::new_quiet(ErrorDetails::InvalidRequest {
                message: format!("Unknown priority tier `{s}` (expected `high`, `normal` or `low`)"),
            })),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    pub capacity: u32,
    /// Tokens added per second
    pub refill_rate: f64,
}

impl TierConfig {
    pub fn validate(&self, tier: PriorityTier) -> Result<(), Error> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.capacity) {
            return Err(Error::new(ErrorDetails::InvalidTierConfig {
                tier: tier.to_string(),
                message: format!(
                    "capacity must be between {MIN_CAPACITY} and {MAX_CAPACITY}, got {}",
                    self.capacity
                ),
            }));
        }
        if !self.refill_rate.is_finite()
            || !(MIN_REFILL_RATE..=MAX_REFILL_RATE).contains(&self.refill_rate)
        {
            return Err(Error::new(ErrorDetails::InvalidTierConfig {
                tier: tier.to_string(),
                message: format!(
                    "refill_rate must be between {MIN_REFILL_RATE} and {MAX_REFILL_RATE} tokens per second, got {}",
                    self.refill_rate
                ),
            }));
        }
        Ok(())
    }

    pub fn params(&self) -> BucketParams {
        BucketParams::new(self.capacity, self.refill_rate)
    }
}

/// Capacity and refill rate for every tier.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    #[serde(default = "default_high")]
    pub high: TierConfig,
    #[serde(default = "default_normal", alias = "medium")]
    pub normal: TierConfig,
    #[serde(default = "default_low")]
    pub low: TierConfig,
}

fn default_high() -> TierConfig {
    TierConfig {
        capacity: 20,
        refill_rate: 2.0,
    }
}

fn default_normal() -> TierConfig {
    TierConfig {
        capacity: 10,
        refill_rate: 1.0,
    }
}

fn default_low() -> TierConfig {
    TierConfig {
        capacity: 5,
        refill_rate: 0.5,
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            high: default_high(),
            normal: default_normal(),
            low: default_low(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: PriorityTier) -> &TierConfig {
        match tier {
            PriorityTier::High => &self.high,
            PriorityTier::Normal => &self.normal,
            PriorityTier::Low => &self.low,
        }
    }

    pub fn params(&self, tier: PriorityTier) -> BucketParams {
        self.get(tier).params()
    }

    /// Returns a copy of the table with one tier replaced.
    pub fn with_tier(&self, tier: PriorityTier, config: TierConfig) -> Result<Self, Error> {
        config.validate(tier)?;
        let mut table = self.clone();
        match tier {
            PriorityTier::High => table.high = config,
            PriorityTier::Normal => table.normal = config,
            PriorityTier::Low => table.low = config,
        }
        Ok(table)
    }

    pub fn validate(&self) -> Result<(), Error> {
        for tier in PriorityTier::ALL {
            self.get(tier).validate(tier)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_parsing() {
        assert_eq!("high".parse::<PriorityTier>().unwrap(), PriorityTier::High);
        assert_eq!(
            "medium".parse::<PriorityTier>().unwrap(),
            PriorityTier::Normal
        );
        assert_eq!("LOW".parse::<PriorityTier>().unwrap(), PriorityTier::Low);
        assert!("urgent".parse::<PriorityTier>().is_err());
        assert_eq!(PriorityTier::from_record(Some("urgent")), PriorityTier::Normal);
        assert_eq!(PriorityTier::from_record(None), PriorityTier::Normal);
    }

    #[test]
    fn test_default_table() {
        let table = TierTable::default();
        assert_eq!(table.params(PriorityTier::High), BucketParams::new(20, 2.0));
        assert_eq!(table.params(PriorityTier::Normal), BucketParams::new(10, 1.0));
        assert_eq!(table.params(PriorityTier::Low), BucketParams::new(5, 0.5));
        table.validate().unwrap();
    }

    #[test]
    fn test_with_tier_validates_ranges() {
        let table = TierTable::default();
        let err = table
            .with_tier(
                PriorityTier::Low,
                TierConfig {
                    capacity: 0,
                    refill_rate: 1.0,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidTierConfig { .. }
        ));

        let err = table
            .with_tier(
                PriorityTier::Low,
                TierConfig {
                    capacity: 10,
                    refill_rate: 250.0,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidTierConfig { .. }
        ));

        let updated = table
            .with_tier(
                PriorityTier::Low,
                TierConfig {
                    capacity: 7,
                    refill_rate: 0.7,
                },
            )
            .unwrap();
        assert_eq!(updated.low.capacity, 7);
        assert_eq!(updated.high, table.high);
    }

    #[test]
    fn test_table_deserialization_with_alias() {
        let toml_str = r"
            [high]
            capacity = 40
            refill_rate = 4.0

            [medium]
            capacity = 12
            refill_rate = 1.5
        ";
        let table: TierTable = toml::from_str(toml_str).unwrap();
        assert_eq!(table.high.capacity, 40);
        assert_eq!(table.normal.capacity, 12);
        assert_eq!(table.low, default_low());
    }
}
