//! Persistence of trades, position snapshots and account checkpoints
//!
//! SQLite in WAL mode with an optional JSON export of the current state after
//! every write. Closed trades are append-only; positions are snapshotted per
//! symbol (latest wins); checkpoints record the account balance so a paper
//! session can resume where it stopped.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::oms::{Position, TradeRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub cycle_count: u64,
    /// Wallet balance (paper ledger or venue)
    pub balance: f64,
    pub available_margin: f64,
    pub open_positions: usize,
    pub paper_mode: bool,
}

/// Write side used by the order workers and the engine
pub trait StateStore: Send + Sync {
    fn record_trade(&self, trade: &TradeRecord) -> Result<()>;
    fn save_position(&self, position: &Position) -> Result<()>;
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
}

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: PathBuf,
    auto_backup: bool,
}

/// Surface a JSON column decode failure as a row error
fn json_column<T: serde::de::DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: P, auto_backup: bool) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: json_backup_path.as_ref().to_path_buf(),
            auto_backup,
        };
        manager.create_tables()?;
        info!("State database ready at {}", db_path.display());
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("state database lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                symbol TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                case_name TEXT NOT NULL,
                average_entry_price REAL NOT NULL,
                quantity REAL NOT NULL,
                take_profit REAL NOT NULL,
                stop_loss REAL NOT NULL,
                inconsistent INTEGER NOT NULL DEFAULT 0,
                snapshot TEXT NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                case_name TEXT NOT NULL,
                average_entry_price REAL NOT NULL,
                exit_price REAL NOT NULL,
                quantity REAL NOT NULL,
                exit_reason TEXT NOT NULL,
                pnl REAL NOT NULL,
                commission REAL NOT NULL,
                net_pnl REAL NOT NULL,
                opened_at TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                cycle_count INTEGER NOT NULL,
                balance REAL NOT NULL,
                available_margin REAL NOT NULL,
                open_positions INTEGER NOT NULL,
                paper_mode INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        conn.execute("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)", [])?;
        conn.execute("CREATE INDEX IF NOT EXISTS idx_positions_state ON positions(state)", [])?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn backup(&self) -> Result<()> {
        if self.auto_backup {
            self.export_json()?;
        }
        Ok(())
    }

    /// Latest snapshot per symbol; `open_only` drops terminal positions
    pub fn load_positions(&self, open_only: bool) -> Result<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT snapshot FROM positions ORDER BY symbol")?;
        let positions = stmt
            .query_map([], |row| json_column::<Position>(0, &row.get::<_, String>(0)?))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(positions
            .into_iter()
            .filter(|p| !open_only || !p.state.is_terminal())
            .collect())
    }

    /// Closed trades in close order, optionally for one symbol
    pub fn load_trades(&self, symbol: Option<&str>) -> Result<Vec<TradeRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record FROM trades WHERE (?1 IS NULL OR symbol = ?1) ORDER BY closed_at, id",
        )?;
        let trades = stmt
            .query_map(params![symbol], |row| {
                json_column::<TradeRecord>(0, &row.get::<_, String>(0)?)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let conn = self.conn()?;
        let checkpoint = conn
            .query_row(
                "SELECT timestamp, cycle_count, balance, available_margin, open_positions, paper_mode
                 FROM checkpoints ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    let timestamp: String = row.get(0)?;
                    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                        })?
                        .with_timezone(&Utc);
                    Ok(Checkpoint {
                        timestamp,
                        cycle_count: row.get::<_, i64>(1)?.max(0) as u64,
                        balance: row.get(2)?,
                        available_margin: row.get(3)?,
                        open_positions: row.get::<_, i64>(4)?.max(0) as usize,
                        paper_mode: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?;

        match &checkpoint {
            Some(c) => debug!("Loaded checkpoint: cycle={}, balance={:.4}", c.cycle_count, c.balance),
            None => debug!("No checkpoint found"),
        }
        Ok(checkpoint)
    }

    pub fn export_json(&self) -> Result<()> {
        let positions = self.load_positions(false)?;
        let checkpoint = self.load_checkpoint()?;

        let state = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "positions": positions,
            "checkpoint": checkpoint,
        });

        std::fs::write(&self.json_backup_path, serde_json::to_string_pretty(&state)?)
            .with_context(|| format!("Failed to write {}", self.json_backup_path.display()))?;
        debug!("State exported to: {}", self.json_backup_path.display());
        Ok(())
    }
}

impl StateStore for SqliteStateManager {
    fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        let record = serde_json::to_string(trade)?;
        self.conn()?.execute(
            "INSERT INTO trades
             (symbol, case_name, average_entry_price, exit_price, quantity, exit_reason,
              pnl, commission, net_pnl, opened_at, closed_at, record)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                trade.symbol.as_str(),
                trade.case.as_str(),
                trade.average_entry_price,
                trade.exit_price,
                trade.quantity,
                trade.exit_reason.as_str(),
                trade.pnl,
                trade.commission,
                trade.net_pnl,
                trade.opened_at.to_rfc3339(),
                trade.closed_at.to_rfc3339(),
                record,
            ],
        )?;

        info!(
            "Trade recorded: SHORT {} {} {:.6} @ {:.6} -> {:.6} | Net: {:+.4} ({:+.2}%) | {} | {}",
            trade.symbol,
            trade.case,
            trade.quantity,
            trade.average_entry_price,
            trade.exit_price,
            trade.net_pnl,
            trade.return_pct(),
            trade.exit_reason.as_str(),
            if trade.is_win() { "WIN" } else { "LOSS" }
        );
        Ok(())
    }

    fn save_position(&self, position: &Position) -> Result<()> {
        let snapshot = serde_json::to_string(position)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO positions
             (symbol, state, case_name, average_entry_price, quantity, take_profit,
              stop_loss, inconsistent, snapshot, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, CURRENT_TIMESTAMP)",
            params![
                position.symbol.as_str(),
                position.state.as_str(),
                position.case.as_str(),
                position.average_entry_price,
                position.total_quantity,
                position.take_profit_price,
                position.plan.stop_loss,
                position.inconsistent as i64,
                snapshot,
            ],
        )?;
        debug!(
            "Position saved: {} [{}] qty={:.6} @ {:.6}",
            position.symbol, position.state, position.total_quantity, position.average_entry_price
        );
        self.backup()
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO checkpoints
             (timestamp, cycle_count, balance, available_margin, open_positions, paper_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.timestamp.to_rfc3339(),
                checkpoint.cycle_count as i64,
                checkpoint.balance,
                checkpoint.available_margin,
                checkpoint.open_positions as i64,
                checkpoint.paper_mode as i64,
            ],
        )?;
        debug!(
            "Checkpoint saved: cycle={}, balance={:.4}",
            checkpoint.cycle_count, checkpoint.balance
        );
        self.backup()
    }
}

pub fn create_state_manager<P: AsRef<Path>>(state_dir: P, auto_backup: bool) -> Result<SqliteStateManager> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;

    let db_path = state_dir.join("fib_short.db");
    let json_path = state_dir.join("fib_short_state.json");

    SqliteStateManager::new(db_path, json_path, auto_backup)
}
