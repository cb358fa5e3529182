//! Zig-zag swing detection
//!
//! Pivots are confirmed with a deviation/depth zig-zag: once a high pivot is
//! established, a bar trading more than `deviation` below it, at least `depth`
//! bars later, confirms a low pivot at the lowest bar in between. A higher high
//! before that point extends the running high instead. The same rule applies
//! mirrored when looking for highs, so the resulting sequence alternates.
//!
//! For a SHORT setup only High→Low swings are of interest. The most recent
//! high that has a low after it wins, paired with the lowest of those lows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PivotKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pivot {
    /// Position of the bar inside the window it was detected from
    pub index: usize,
    pub datetime: DateTime<Utc>,
    pub price: f64,
    pub kind: PivotKind,
}

/// A High→Low swing: `high.index < low.index` and `high.price > low.price`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Swing {
    pub high: Pivot,
    pub low: Pivot,
}

impl Swing {
    pub fn range(&self) -> f64 {
        self.high.price - self.low.price
    }
}

/// Zig-zag sensitivity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZigZagParams {
    /// Minimum reversal, in percent of the last pivot price
    pub deviation_pct: f64,
    /// Minimum bars between two confirmed pivots
    pub depth: usize,
}

impl ZigZagParams {
    pub fn new(deviation_pct: f64, depth: usize) -> Self {
        Self {
            deviation_pct,
            depth,
        }
    }
}

/// Compute the alternating pivot sequence of a bar window
pub fn zigzag(bars: &[Candle], params: ZigZagParams) -> Vec<Pivot> {
    let depth = params.depth.max(1);
    let deviation = params.deviation_pct / 100.0;
    if bars.len() < depth * 2 {
        return Vec::new();
    }

    let pivot = |index: usize, kind: PivotKind| Pivot {
        index,
        datetime: bars[index].datetime,
        price: match kind {
            PivotKind::High => bars[index].high,
            PivotKind::Low => bars[index].low,
        },
        kind,
    };

    // Seed direction from the extremes of the opening window
    let window = &bars[..depth * 2];
    let max_index = extreme_index(window, |a, b| a.high > b.high);
    let min_index = extreme_index(window, |a, b| a.low < b.low);
    let mut pivots = vec![if max_index < min_index {
        pivot(max_index, PivotKind::High)
    } else {
        pivot(min_index, PivotKind::Low)
    }];

    let mut last = pivots[0];
    for i in (last.index + 1)..bars.len() {
        let bar = &bars[i];
        match last.kind {
            PivotKind::High => {
                if bar.low < last.price * (1.0 - deviation) {
                    if i - last.index >= depth {
                        let span = &bars[last.index + 1..=i];
                        let lowest = last.index + 1 + extreme_index(span, |a, b| a.low < b.low);
                        last = pivot(lowest, PivotKind::Low);
                        pivots.push(last);
                    }
                } else if bar.high > last.price {
                    last = pivot(i, PivotKind::High);
                    if let Some(tail) = pivots.last_mut() {
                        *tail = last;
                    }
                }
            }
            PivotKind::Low => {
                if bar.high > last.price * (1.0 + deviation) {
                    if i - last.index >= depth {
                        let span = &bars[last.index + 1..=i];
                        let highest = last.index + 1 + extreme_index(span, |a, b| a.high > b.high);
                        last = pivot(highest, PivotKind::High);
                        pivots.push(last);
                    }
                } else if bar.low < last.price {
                    last = pivot(i, PivotKind::Low);
                    if let Some(tail) = pivots.last_mut() {
                        *tail = last;
                    }
                }
            }
        }
    }

    pivots
}

/// Index of the first bar that beats every other under `better`
fn extreme_index(bars: &[Candle], better: impl Fn(&Candle, &Candle) -> bool) -> usize {
    let mut best = 0;
    for (i, bar) in bars.iter().enumerate().skip(1) {
        if better(bar, &bars[best]) {
            best = i;
        }
    }
    best
}

/// Pick the most recent High→Low swing from a pivot sequence
pub fn select_swing(pivots: &[Pivot]) -> Option<Swing> {
    let highs = pivots.iter().rev().filter(|p| p.kind == PivotKind::High);

    for high in highs {
        let lowest_after = pivots
            .iter()
            .filter(|p| p.kind == PivotKind::Low && p.index > high.index)
            .min_by(|a, b| a.price.total_cmp(&b.price));

        if let Some(low) = lowest_after {
            if high.price - low.price > 0.0 {
                return Some(Swing {
                    high: *high,
                    low: *low,
                });
            }
        }
    }
    None
}

/// Swing detector with its data-quality guards
#[derive(Debug, Clone)]
pub struct SwingDetector {
    params: ZigZagParams,
    min_bars: usize,
    max_pivot_age_bars: Option<usize>,
    invalidation_ratio: Option<f64>,
}

impl SwingDetector {
    pub fn new(params: ZigZagParams, min_bars: usize) -> Self {
        Self {
            params,
            min_bars,
            max_pivot_age_bars: None,
            invalidation_ratio: None,
        }
    }

    /// Reject swings whose high pivot is older than `bars` from the last bar
    pub fn with_max_pivot_age(mut self, bars: Option<usize>) -> Self {
        self.max_pivot_age_bars = bars;
        self
    }

    /// Skip a swing once any bar after its low traded at or above this ratio
    pub fn with_invalidation_ratio(mut self, ratio: Option<f64>) -> Self {
        self.invalidation_ratio = ratio;
        self
    }

    pub fn params(&self) -> ZigZagParams {
        self.params
    }

    /// Detect the swing to trade in a bar window
    pub fn detect(&self, bars: &[Candle]) -> Result<Swing, DataError> {
        if bars.len() < self.min_bars {
            return Err(DataError::InsufficientBars {
                have: bars.len(),
                need: self.min_bars,
            });
        }

        let pivots = zigzag(bars, self.params);
        if pivots.len() < 2 {
            return Err(DataError::NoSwing);
        }

        let swing = match self.invalidation_ratio {
            None => select_swing(&pivots),
            Some(ratio) => self.select_untouched(&pivots, bars, ratio),
        }
        .ok_or(DataError::NoSwing)?;

        if let Some(max_age) = self.max_pivot_age_bars {
            let age = bars.len() - 1 - swing.high.index;
            if age > max_age {
                return Err(DataError::StalePivot { age, max: max_age });
            }
        }

        Ok(swing)
    }

    /// Walk back through the highs until one whose retracement never reached `ratio`
    fn select_untouched(&self, pivots: &[Pivot], bars: &[Candle], ratio: f64) -> Option<Swing> {
        let mut candidates = pivots.to_vec();
        loop {
            let swing = select_swing(&candidates)?;
            let limit = swing.low.price + ratio * swing.range();
            let touched = bars[swing.low.index + 1..].iter().any(|b| b.high >= limit);
            if !touched {
                return Some(swing);
            }
            candidates.retain(|p| p.index < swing.high.index || p.kind == PivotKind::Low);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn bars_from_closes(closes: &[f64]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                Candle::new_unchecked(
                    start + Duration::hours(4 * i as i64),
                    c,
                    c * 1.001,
                    c * 0.999,
                    c,
                    1_000.0,
                )
            })
            .collect()
    }

    /// 100 → 200 over 20 bars, back to 100 by bar 40, bounce to 160 at bar 50
    fn rally_drop_bounce() -> Vec<Candle> {
        let mut closes: Vec<f64> = (0..=20).map(|i| 100.0 + 5.0 * i as f64).collect();
        closes.extend((21..=40).map(|i| 200.0 - 5.0 * (i - 20) as f64));
        closes.extend((41..=50).map(|i| 100.0 + 6.0 * (i - 40) as f64));
        bars_from_closes(&closes)
    }

    #[test]
    fn test_zigzag_pivots_alternate() {
        let pivots = zigzag(&rally_drop_bounce(), ZigZagParams::new(3.0, 5));
        assert!(pivots.len() >= 3);
        assert!(pivots.windows(2).all(|w| w[0].kind != w[1].kind));
        assert!(pivots.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn test_detects_most_recent_high_to_low() {
        let detector = SwingDetector::new(ZigZagParams::new(3.0, 5), 50);
        let swing = detector.detect(&rally_drop_bounce()).unwrap();

        assert_eq!(swing.high.index, 20);
        assert_eq!(swing.low.index, 40);
        assert_relative_eq!(swing.high.price, 200.2, epsilon = 1e-9);
        assert_relative_eq!(swing.low.price, 99.9, epsilon = 1e-9);
        assert!(swing.high.index < swing.low.index);
    }

    #[test]
    fn test_insufficient_bars() {
        let detector = SwingDetector::new(ZigZagParams::new(3.0, 5), 200);
        assert!(matches!(
            detector.detect(&rally_drop_bounce()),
            Err(DataError::InsufficientBars { have: 51, need: 200 })
        ));
    }

    #[test]
    fn test_stale_pivot_rejected() {
        let detector =
            SwingDetector::new(ZigZagParams::new(3.0, 5), 50).with_max_pivot_age(Some(10));
        assert!(matches!(
            detector.detect(&rally_drop_bounce()),
            Err(DataError::StalePivot { age: 30, max: 10 })
        ));
    }

    #[test]
    fn test_monotonic_rise_has_no_swing() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let detector = SwingDetector::new(ZigZagParams::new(3.0, 5), 50);
        assert!(matches!(
            detector.detect(&bars_from_closes(&closes)),
            Err(DataError::NoSwing)
        ));
    }

    #[test]
    fn test_invalidation_ratio_skips_touched_swing() {
        // Bounce to 160 is a 60% retracement of the 200 → 100 swing
        let detector = SwingDetector::new(ZigZagParams::new(3.0, 5), 50)
            .with_invalidation_ratio(Some(0.5));
        assert!(detector.detect(&rally_drop_bounce()).is_err());

        let lenient = SwingDetector::new(ZigZagParams::new(3.0, 5), 50)
            .with_invalidation_ratio(Some(0.9));
        assert!(lenient.detect(&rally_drop_bounce()).is_ok());
    }

    #[test]
    fn test_select_swing_requires_low_after_high() {
        let at = Utc::now();
        let pivots = vec![
            Pivot {
                index: 0,
                datetime: at,
                price: 90.0,
                kind: PivotKind::Low,
            },
            Pivot {
                index: 10,
                datetime: at,
                price: 120.0,
                kind: PivotKind::High,
            },
        ];
        assert!(select_swing(&pivots).is_none());
    }
}
