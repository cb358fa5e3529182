//! Performance metrics over closed trades

use itertools::Itertools;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

use crate::oms::TradeRecord;
use crate::strategy::Case;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaseStats {
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub net_pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub net_pnl: f64,
    pub gross_profit: f64,
    pub gross_loss: f64,
    pub total_commission: f64,
    pub profit_factor: f64,
    /// Mean net PnL per trade
    pub expectancy: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Peak-to-trough of cumulative net PnL, in quote currency
    pub max_drawdown: f64,
    /// Per-trade, not annualized
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub by_case: BTreeMap<Case, CaseStats>,
}

impl PerformanceMetrics {
    /// Trades are taken in closing order
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        if trades.is_empty() {
            return Self::default();
        }

        let (wins, losses): (Vec<&TradeRecord>, Vec<&TradeRecord>) =
            trades.iter().partition(|t| t.is_win());

        let gross_profit: f64 = wins.iter().map(|t| t.net_pnl).sum();
        let gross_loss: f64 = losses.iter().map(|t| t.net_pnl.abs()).sum();
        let net_pnl = gross_profit - gross_loss;

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if wins.is_empty() { 0.0 } else { gross_profit / wins.len() as f64 };
        let avg_loss = if losses.is_empty() { 0.0 } else { gross_loss / losses.len() as f64 };
        let largest_win = wins.iter().map(|t| t.net_pnl).fold(0.0, f64::max);
        let largest_loss = losses.iter().map(|t| t.net_pnl).fold(0.0, f64::min);

        let mut peak = 0.0_f64;
        let mut equity = 0.0;
        let mut max_drawdown = 0.0_f64;
        for trade in trades {
            equity += trade.net_pnl;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.max(peak - equity);
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct() / 100.0).collect();
        let (sharpe_ratio, sortino_ratio) = risk_ratios(&returns);

        let by_case = trades
            .iter()
            .into_group_map_by(|t| t.case)
            .into_iter()
            .map(|(case, group)| {
                let wins = group.iter().filter(|t| t.is_win()).count();
                let stats = CaseStats {
                    trades: group.len(),
                    wins,
                    win_rate: wins as f64 / group.len() as f64 * 100.0,
                    net_pnl: group.iter().map(|t| t.net_pnl).sum(),
                };
                (case, stats)
            })
            .collect();

        PerformanceMetrics {
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losses.len(),
            win_rate: wins.len() as f64 / trades.len() as f64 * 100.0,
            net_pnl,
            gross_profit,
            gross_loss,
            total_commission: trades.iter().map(|t| t.commission).sum(),
            profit_factor,
            expectancy: net_pnl / trades.len() as f64,
            avg_win,
            avg_loss,
            largest_win,
            largest_loss,
            max_drawdown,
            sharpe_ratio,
            sortino_ratio,
            by_case,
        }
    }
}

fn risk_ratios(returns: &[f64]) -> (f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0);
    }
    let mean = returns.iter().mean();
    let std_dev = returns.iter().std_dev();
    let sharpe = if std_dev > 0.0 { mean / std_dev } else { 0.0 };

    let downside: Vec<f64> = returns.iter().map(|r| r.min(0.0)).collect();
    let downside_dev = (downside.iter().map(|d| d * d).sum::<f64>() / returns.len() as f64).sqrt();
    let sortino = if downside_dev > 0.0 { mean / downside_dev } else { 0.0 };

    (sharpe, sortino)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::ExitReason;
    use crate::Symbol;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn trade(case: Case, net_pnl: f64) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            symbol: Symbol::new("SOLUSDT"),
            case,
            entries: Vec::new(),
            average_entry_price: 100.0,
            quantity: 1.0,
            exit_price: 100.0 - net_pnl,
            exit_reason: if net_pnl > 0.0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
            pnl: net_pnl,
            commission: 0.0,
            net_pnl,
            max_adverse_pnl: 0.0,
            max_favorable_pnl: 0.0,
            swing_high: 200.0,
            swing_low: 100.0,
            take_profit: 90.0,
            stop_loss: 110.0,
            opened_at: now,
            closed_at: now,
        }
    }

    #[test]
    fn test_empty() {
        let m = PerformanceMetrics::from_trades(&[]);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.profit_factor, 0.0);
    }

    #[test]
    fn test_totals_and_drawdown() {
        let trades = vec![
            trade(Case::Case1, 10.0),
            trade(Case::Case1, -4.0),
            trade(Case::Case3, -6.0),
            trade(Case::Case4, 5.0),
        ];
        let m = PerformanceMetrics::from_trades(&trades);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_relative_eq!(m.win_rate, 50.0);
        assert_relative_eq!(m.net_pnl, 5.0);
        assert_relative_eq!(m.profit_factor, 1.5);
        assert_relative_eq!(m.expectancy, 1.25);
        assert_relative_eq!(m.avg_win, 7.5);
        assert_relative_eq!(m.avg_loss, 5.0);
        assert_relative_eq!(m.largest_loss, -6.0);
        // Equity 10 → 6 → 0 → 5
        assert_relative_eq!(m.max_drawdown, 10.0);
        assert!(m.sharpe_ratio > 0.0);
        assert!(m.sortino_ratio > 0.0);
    }

    #[test]
    fn test_per_case_breakdown() {
        let trades = vec![
            trade(Case::Case1, 10.0),
            trade(Case::Case1, -4.0),
            trade(Case::Case3, -6.0),
        ];
        let m = PerformanceMetrics::from_trades(&trades);

        assert_eq!(m.by_case.len(), 2);
        let case_1 = &m.by_case[&Case::Case1];
        assert_eq!(case_1.trades, 2);
        assert_eq!(case_1.wins, 1);
        assert_relative_eq!(case_1.net_pnl, 6.0);
        assert!(!m.by_case.contains_key(&Case::Case2));
    }

    #[test]
    fn test_all_winners_profit_factor() {
        let m = PerformanceMetrics::from_trades(&[trade(Case::Case2, 3.0)]);
        assert!(m.profit_factor.is_infinite());
        assert_eq!(m.sharpe_ratio, 0.0);
    }
}
