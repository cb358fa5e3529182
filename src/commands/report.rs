//! Report command: performance of the persisted trade log

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fib_short::metrics::PerformanceMetrics;
use fib_short::oms::TradeRecord;
use fib_short::state_manager::create_state_manager;
use fib_short::Config;
use serde::Serialize;
use tracing::info;

/// One flat CSV line per closed trade
#[derive(Serialize)]
struct TradeRow<'a> {
    symbol: &'a str,
    case: &'static str,
    entries: usize,
    average_entry_price: f64,
    quantity: f64,
    exit_price: f64,
    exit_reason: &'static str,
    pnl: f64,
    commission: f64,
    net_pnl: f64,
    return_pct: f64,
    opened_at: DateTime<Utc>,
    closed_at: DateTime<Utc>,
}

impl<'a> From<&'a TradeRecord> for TradeRow<'a> {
    fn from(t: &'a TradeRecord) -> Self {
        TradeRow {
            symbol: t.symbol.as_str(),
            case: t.case.as_str(),
            entries: t.entries.len(),
            average_entry_price: t.average_entry_price,
            quantity: t.quantity,
            exit_price: t.exit_price,
            exit_reason: t.exit_reason.as_str(),
            pnl: t.pnl,
            commission: t.commission,
            net_pnl: t.net_pnl,
            return_pct: t.return_pct(),
            opened_at: t.opened_at,
            closed_at: t.closed_at,
        }
    }
}

fn write_csv(path: &str, trades: &[TradeRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file: {}", path))?;
    for trade in trades {
        writer.serialize(TradeRow::from(trade))?;
    }
    writer.flush()?;
    Ok(())
}

pub fn run(config_path: String, symbol: Option<String>, csv_path: Option<String>) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    let store = create_state_manager(&config.state.state_dir, false)?;
    let symbol = symbol.map(|s| s.to_uppercase());
    let trades = store.load_trades(symbol.as_deref())?;
    info!("Loaded {} trades from {}", trades.len(), config.state.state_dir.display());

    let m = PerformanceMetrics::from_trades(&trades);

    println!("\n{}", "=".repeat(60));
    println!("PERFORMANCE REPORT");
    println!("{}", "=".repeat(60));
    println!("Total Trades:       {}", m.total_trades);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Net PnL:            {:.4} USDT", m.net_pnl);
    println!("Commission:         {:.4} USDT", m.total_commission);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Expectancy:         {:.4} USDT", m.expectancy);
    println!("Avg Win:            {:.4} USDT", m.avg_win);
    println!("Avg Loss:           {:.4} USDT", m.avg_loss);
    println!("Largest Win:        {:.4} USDT", m.largest_win);
    println!("Largest Loss:       {:.4} USDT", m.largest_loss);
    println!("Max Drawdown:       {:.4} USDT", m.max_drawdown);
    println!("Sharpe (per trade): {:.2}", m.sharpe_ratio);
    println!("Sortino (per trade):{:.2}", m.sortino_ratio);

    if !m.by_case.is_empty() {
        println!("{}", "-".repeat(60));
        println!("{:<8} {:>7} {:>7} {:>9} {:>12}", "Case", "Trades", "Wins", "WinR%", "Net PnL");
        for (case, stats) in &m.by_case {
            println!(
                "{:<8} {:>7} {:>7} {:>9.2} {:>12.4}",
                case, stats.trades, stats.wins, stats.win_rate, stats.net_pnl
            );
        }
    }
    println!("{}", "=".repeat(60));

    if let Some(path) = csv_path {
        write_csv(&path, &trades)?;
        info!("Trades exported to {}", path);
    }
    Ok(())
}
