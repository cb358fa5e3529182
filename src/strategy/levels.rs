//! Retracement levels between a swing's low (0%) and high (100%)

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::swing::Swing;
use crate::error::DataError;

/// Default ratios published with every level set
pub const DEFAULT_RATIOS: [f64; 12] = [
    0.0, 0.45, 0.50, 0.55, 0.60, 0.618, 0.69, 0.75, 0.786, 0.90, 1.00, 1.05,
];

/// Ratio to price map for one swing. Read-only once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSet {
    high: f64,
    low: f64,
    levels: BTreeMap<OrderedFloat<f64>, f64>,
}

impl LevelSet {
    /// Build levels for a swing, rejecting an empty or inverted range
    pub fn for_swing(swing: &Swing, ratios: &[f64]) -> Result<Self, DataError> {
        let (high, low) = (swing.high.price, swing.low.price);
        if !(high > low) || !low.is_finite() || !high.is_finite() {
            return Err(DataError::InvalidSwing { high, low });
        }
        Ok(Self::from_range(high, low, ratios))
    }

    /// Build levels from raw prices. The 0 and 1 anchors are always present.
    pub fn from_range(high: f64, low: f64, ratios: &[f64]) -> Self {
        let range = high - low;
        let levels = ratios
            .iter()
            .copied()
            .chain([0.0, 1.0])
            .map(|r| (OrderedFloat(r), low + r * range))
            .collect();

        Self { high, low, levels }
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// Price of any ratio, configured or not
    pub fn price_at(&self, ratio: f64) -> f64 {
        self.levels
            .get(&OrderedFloat(ratio))
            .copied()
            .unwrap_or_else(|| self.low + ratio * self.range())
    }

    /// Retracement ratio of a price inside this swing
    pub fn ratio_of(&self, price: f64) -> f64 {
        (price - self.low) / self.range()
    }

    /// Configured levels in increasing ratio order
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.levels.iter().map(|(r, p)| (r.0, *p))
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
