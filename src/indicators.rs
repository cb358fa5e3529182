//! Technical indicators backed by the `ta` crate

use ta::indicators::RelativeStrengthIndex;
use ta::Next;

/// RSI series aligned with `values`; the warm-up prefix is `None`
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match RelativeStrengthIndex::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let v = indicator.next(value);
            (i >= period).then_some(v)
        })
        .collect()
}

/// Most recent RSI value, `None` until `period + 1` closes are available
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() <= period {
        return None;
    }
    rsi(closes, period).last().copied().flatten()
}
