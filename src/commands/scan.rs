//! Scan command: one dry evaluation of the universe, no orders placed

use anyhow::Result;
use fib_short::binance::BinanceClient;
use fib_short::engine::{evaluate_symbol, select_universe};
use fib_short::market::BinanceMarketData;
use fib_short::strategy::FibShortStrategy;
use fib_short::Config;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn run(config_path: String, pairs: Option<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;
    if let Some(pairs) = pairs {
        config.trading.pairs = pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let client = Arc::new(BinanceClient::new(&config.exchange)?);
    let market = BinanceMarketData::new(client);
    let strategy = FibShortStrategy::from_config(&config);

    let universe = select_universe(&market, &config).await?;
    info!(
        "Scanning {} symbols on {} (RSI gate {})",
        universe.len(),
        config.scanner.timeframe,
        if strategy.rsi_enabled() { "on" } else { "off" }
    );

    let pb = ProgressBar::new(universe.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("🔍 {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}] {msg}")?
            .progress_chars("█░ "),
    );

    let mut proposals = Vec::new();
    let mut skipped: BTreeMap<&'static str, usize> = BTreeMap::new();
    for symbol in &universe {
        pb.set_message(symbol.to_string());
        match evaluate_symbol(&market, &strategy, &config.scanner, symbol).await {
            Ok(proposal) => proposals.push(proposal),
            Err(reason) => {
                debug!("[{}] skipped: {}", symbol, reason);
                *skipped.entry(reason.label()).or_default() += 1;
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message(format!("{} setups", proposals.len()));

    println!("\n{}", "=".repeat(100));
    println!("SCAN RESULTS ({} symbols, {} setups)", universe.len(), proposals.len());
    println!("{}", "=".repeat(100));
    if !proposals.is_empty() {
        println!(
            "{:<14} {:<7} {:>6} {:>12} {:>12} {:>12} {:>12} {:>12} {:>6}",
            "Symbol", "Case", "Ratio", "Price", "Entry", "Secondary", "TP", "SL", "RSI"
        );
        println!("{}", "-".repeat(100));
        let price_or = |v: Option<f64>, missing: &str| {
            v.map(|x| format!("{:.6}", x))
                .unwrap_or_else(|| missing.to_string())
        };
        for p in &proposals {
            println!(
                "{:<14} {:<7} {:>6.3} {:>12.6} {:>12} {:>12} {:>12.6} {:>12.6} {:>6}",
                p.symbol,
                p.case,
                p.ratio,
                p.reference_price,
                price_or(p.plan.primary_price, "market"),
                price_or(p.plan.secondary_price, "-"),
                p.plan.take_profit,
                p.plan.stop_loss,
                p.rsi.map(|r| format!("{:.1}", r)).unwrap_or_else(|| "-".into()),
            );
        }
    }

    if !skipped.is_empty() {
        println!("\nSkipped:");
        for (label, count) in &skipped {
            println!("  {:<22} {}", label, count);
        }
    }
    println!("{}", "=".repeat(100));
    Ok(())
}
