//! Seasonal quoting. Stateless; never consulted by the allocator.

use chrono::{DateTime, Datelike, Utc};

use crate::model::Ms;

pub const SUMMER_RATE: u64 = 200;
pub const WINTER_RATE: u64 = 100;

/// Summer runs March through September inclusive.
const SUMMER_MONTHS: std::ops::RangeInclusive<u32> = 3..=9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeasonalPricing {
    pub summer_rate: u64,
    pub winter_rate: u64,
}

impl Default for SeasonalPricing {
    fn default() -> Self {
        Self {
            summer_rate: SUMMER_RATE,
            winter_rate: WINTER_RATE,
        }
    }
}

impl SeasonalPricing {
    pub fn new(summer_rate: u64, winter_rate: u64) -> Self {
        Self {
            summer_rate,
            winter_rate,
        }
    }

    /// Flat price for a reservation starting at `from` (month taken in UTC).
    /// Instants outside chrono's range fall back to the winter rate.
    pub fn price(&self, from: Ms) -> u64 {
        match DateTime::<Utc>::from_timestamp_millis(from) {
            Some(dt) if SUMMER_MONTHS.contains(&dt.month()) => self.summer_rate,
            _ => self.winter_rate,
        }
    }
}

/// Price with the default rates.
pub fn price(from: Ms) -> u64 {
    SeasonalPricing::default().price(from)
}
