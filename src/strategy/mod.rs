//! Fibonacci retracement SHORT strategy
//!
//! Bars → swing → levels → case → [`EntryProposal`]. Everything here is pure;
//! proposals are handed to the order manager which decides whether to admit
//! them.

pub mod cases;
pub mod levels;
pub mod swing;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, TradingConfig};
use crate::error::SkipReason;
use crate::indicators;
use crate::{Candle, Symbol};

pub use cases::{Case, CasePlan, CaseTable, EntryPlan, ResolvedPlan};
pub use levels::LevelSet;
pub use swing::{Pivot, PivotKind, Swing, SwingDetector, ZigZagParams};

/// A classified setup ready for admission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryProposal {
    pub symbol: Symbol,
    pub case: Case,
    pub swing: Swing,
    /// Retracement ratio of `reference_price` at classification time
    pub ratio: f64,
    /// Last traded price used for classification and market entries
    pub reference_price: f64,
    pub plan: ResolvedPlan,
    pub primary_quantity: f64,
    pub secondary_quantity: Option<f64>,
    pub margin_per_order: f64,
    pub rsi: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl EntryProposal {
    /// Margin needed if every entry order of the plan fills
    pub fn required_margin(&self) -> f64 {
        let orders = if self.secondary_quantity.is_some() { 2.0 } else { 1.0 };
        self.margin_per_order * orders
    }

    pub fn is_market_entry(&self) -> bool {
        self.plan.primary_price.is_none()
    }
}

/// Stateless evaluator of one symbol's bar window
#[derive(Debug, Clone)]
pub struct FibShortStrategy {
    detector: SwingDetector,
    ratios: Vec<f64>,
    cases: CaseTable,
    rsi_threshold: f64,
    rsi_period: usize,
    sizing: TradingConfig,
}

impl FibShortStrategy {
    pub fn from_config(config: &Config) -> Self {
        let detector = SwingDetector::new(
            config.swing.params_for(config.scanner.timeframe),
            config.swing.min_bars,
        )
        .with_max_pivot_age(config.swing.max_pivot_age_bars)
        .with_invalidation_ratio(config.swing.invalidation_ratio);

        Self {
            detector,
            ratios: config.levels.ratios.clone(),
            cases: config.cases.clone(),
            rsi_threshold: config.scanner.rsi_threshold,
            rsi_period: config.scanner.rsi_period,
            sizing: config.trading.clone(),
        }
    }

    pub fn rsi_enabled(&self) -> bool {
        self.rsi_threshold > 0.0
    }

    /// Apply the RSI gate to the closes of the RSI timeframe
    ///
    /// Returns the RSI value when the gate is enabled and passes.
    pub fn check_rsi(&self, closes: &[f64]) -> Result<Option<f64>, SkipReason> {
        if !self.rsi_enabled() {
            return Ok(None);
        }
        // Without enough history the gate cannot pass
        let rsi = indicators::latest_rsi(closes, self.rsi_period).unwrap_or(0.0);
        if rsi < self.rsi_threshold {
            return Err(SkipReason::RsiBelowThreshold {
                rsi,
                threshold: self.rsi_threshold,
            });
        }
        Ok(Some(rsi))
    }

    /// Swing, levels and case for the current price, without sizing
    pub fn classify(
        &self,
        bars: &[Candle],
        price: f64,
    ) -> Result<(Swing, LevelSet, Case), SkipReason> {
        let swing = self.detector.detect(bars)?;
        let levels = LevelSet::for_swing(&swing, &self.ratios)?;
        let ratio = levels.ratio_of(price);
        let case = self
            .cases
            .classify(ratio)
            .ok_or(SkipReason::NoCase { ratio })?;
        Ok((swing, levels, case))
    }

    /// Full evaluation producing a sized proposal
    pub fn evaluate(
        &self,
        symbol: &Symbol,
        bars: &[Candle],
        price: f64,
        rsi: Option<f64>,
    ) -> Result<EntryProposal, SkipReason> {
        let (swing, levels, case) = self.classify(bars, price)?;
        let plan = self.cases.plan(case).resolve(&levels);
        let ratio = levels.ratio_of(price);

        // A short opened above its own stop would be closed on the next tick
        let entry = plan.primary_price.unwrap_or(price).max(price);
        if entry >= plan.stop_loss {
            return Err(SkipReason::BeyondStop {
                price: entry,
                stop: plan.stop_loss,
            });
        }

        let primary_quantity = self.sizing.quantity_for(plan.primary_price.unwrap_or(price));
        let secondary_quantity = plan.secondary_price.map(|p| self.sizing.quantity_for(p));

        Ok(EntryProposal {
            symbol: symbol.clone(),
            case,
            swing,
            ratio,
            reference_price: price,
            plan,
            primary_quantity,
            secondary_quantity,
            margin_per_order: self.sizing.margin_per_trade,
            rsi,
            created_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn bars(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new_unchecked(start + Duration::hours(i as i64), c, c, c, c, 10.0)
            })
            .collect()
    }

    /// Exact 100 → 200 → 100 swing followed by a flat tail at `tail`
    fn swing_window(tail: f64) -> Vec<Candle> {
        let mut closes: Vec<f64> = (0..=20).map(|i| 100.0 + 5.0 * i as f64).collect();
        closes.extend((21..=40).map(|i| 200.0 - 5.0 * (i - 20) as f64));
        closes.extend(std::iter::repeat(tail).take(10));
        bars(&closes)
    }

    fn strategy() -> FibShortStrategy {
        let mut config = Config::default();
        config.swing.min_bars = 40;
        config.swing.deviation_pct = Some(3.0);
        config.swing.depth = Some(5);
        config.scanner.rsi_threshold = 0.0;
        FibShortStrategy::from_config(&config)
    }

    #[test]
    fn test_case_1_proposal() {
        let proposal = strategy()
            .evaluate(&Symbol::new("SOLUSDT"), &swing_window(150.0), 155.0, None)
            .unwrap();

        assert_eq!(proposal.case, Case::Case1);
        assert_relative_eq!(proposal.swing.high.price, 200.0);
        assert_relative_eq!(proposal.swing.low.price, 100.0);
        assert_relative_eq!(proposal.plan.primary_price.unwrap(), 161.8, epsilon = 1e-9);
        assert_relative_eq!(proposal.plan.secondary_price.unwrap(), 178.6, epsilon = 1e-9);
        // 3 margin × 10 leverage / 161.8
        assert_relative_eq!(proposal.primary_quantity, 30.0 / 161.8, epsilon = 1e-12);
        assert_relative_eq!(proposal.required_margin(), 6.0);
        assert!(!proposal.is_market_entry());
    }

    #[test]
    fn test_below_half_is_no_case() {
        let result = strategy().evaluate(&Symbol::new("SOLUSDT"), &swing_window(120.0), 140.0, None);
        assert!(matches!(result, Err(SkipReason::NoCase { .. })));
    }

    #[test]
    fn test_case_4_is_market() {
        let proposal = strategy()
            .evaluate(&Symbol::new("SOLUSDT"), &swing_window(150.0), 202.0, None)
            .unwrap();
        assert_eq!(proposal.case, Case::Case4);
        assert!(proposal.is_market_entry());
        assert_relative_eq!(proposal.plan.take_profit, 160.0, epsilon = 1e-9);
        assert_relative_eq!(proposal.plan.stop_loss, 205.0, epsilon = 1e-9);
    }

    #[test]
    fn test_price_beyond_stop_is_skipped() {
        let result = strategy().evaluate(&Symbol::new("SOLUSDT"), &swing_window(150.0), 206.0, None);
        assert!(matches!(result, Err(SkipReason::BeyondStop { .. })));
    }

    #[test]
    fn test_case_4_at_default_stop_does_not_enter() {
        let sym = Symbol::new("SOLUSDT");
        match strategy().evaluate(&sym, &swing_window(150.0), 205.0, None) {
            Err(SkipReason::BeyondStop { price, stop }) => {
                assert_relative_eq!(price, 205.0);
                assert_relative_eq!(stop, 205.0, epsilon = 1e-9);
            }
            other => panic!("expected beyond stop, got {:?}", other.map(|p| p.case)),
        }
        assert_eq!(
            strategy().evaluate(&sym, &swing_window(150.0), 204.0, None).unwrap().case,
            Case::Case4
        );
    }

    #[test]
    fn test_rsi_gate() {
        let mut config = Config::default();
        config.scanner.rsi_threshold = 70.0;
        let strategy = FibShortStrategy::from_config(&config);

        let rising: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let falling: Vec<f64> = (0..40).map(|i| 140.0 - i as f64).collect();

        assert!(strategy.check_rsi(&rising).unwrap().unwrap() >= 70.0);
        assert!(matches!(
            strategy.check_rsi(&falling),
            Err(SkipReason::RsiBelowThreshold { .. })
        ));
        assert!(matches!(
            strategy.check_rsi(&[1.0, 2.0]),
            Err(SkipReason::RsiBelowThreshold { .. })
        ));
    }

    #[test]
    fn test_rsi_gate_disabled() {
        assert_eq!(strategy().check_rsi(&[]).unwrap(), None);
    }
}
