pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{AlertRecord, FactorInputs, RiskLevel, SignalSnapshot, SwapEvent};
use crate::error::StoreError;

const SNAPSHOT_COLUMNS: &str =
    "s.market_id, s.timestamp_ms, s.dex_score, s.whale_score, s.cex_score, s.total_score, s.risk_level, s.factors";

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database. Every write runs in one SQLite
/// transaction while holding the lock, so readers never see half a cycle.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `f` against the database on tokio's blocking pool, so async
    /// callers never hold a worker thread while SQLite works.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let shared = self.clone();
        tokio::task::spawn_blocking(move || f(&*shared.lock()?))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// Synchronous shortcuts for tests; runtime callers go through `blocking`.
#[cfg(test)]
impl SharedDatabase {
    /// Append a snapshot and refresh the latest-state row.
    pub fn append_snapshot(&self, snapshot: &SignalSnapshot) -> Result<i64, StoreError> {
        self.lock()?.append_snapshot(snapshot)
    }

    /// Append an alert record.
    pub fn append_alert(&self, alert: &AlertRecord) -> Result<i64, StoreError> {
        self.lock()?.append_alert(alert)
    }

    /// Append a snapshot and its alert (if any) in a single transaction.
    /// Returns the alert's row id.
    pub fn append_cycle(
        &self,
        snapshot: &SignalSnapshot,
        alert: Option<&AlertRecord>,
    ) -> Result<Option<i64>, StoreError> {
        self.lock()?.append_cycle(snapshot, alert)
    }

    /// Most recent snapshot for a market.
    pub fn latest(&self, market_id: &str) -> Result<Option<SignalSnapshot>, StoreError> {
        self.lock()?.latest(market_id)
    }

    /// Most recent snapshot of every market that has one.
    pub fn latest_all(&self) -> Result<Vec<SignalSnapshot>, StoreError> {
        self.lock()?.latest_all()
    }

    /// Snapshots for a market, oldest first.
    pub fn history(
        &self,
        market_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SignalSnapshot>, StoreError> {
        self.lock()?.history(market_id, since)
    }

    /// Alerts, newest first, optionally only one severity.
    pub fn alerts(&self, severity: Option<RiskLevel>, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        self.lock()?.alerts(severity, limit)
    }

    /// Insert swaps not already stored. Returns how many were new.
    pub fn append_swaps(&self, swaps: &[SwapEvent]) -> Result<usize, StoreError> {
        self.lock()?.append_swaps(swaps)
    }

    /// Latest swaps for a market, newest first.
    pub fn recent_swaps(&self, market_id: &str, limit: usize) -> Result<Vec<SwapEvent>, StoreError> {
        self.lock()?.recent_swaps(market_id, limit)
    }

    pub fn count_swaps_since(&self, since: DateTime<Utc>) -> Result<usize, StoreError> {
        self.lock()?.count_swaps_since(since)
    }

    pub fn count_alerts_since(&self, since: DateTime<Utc>, min_level: RiskLevel) -> Result<usize, StoreError> {
        self.lock()?.count_alerts_since(since, min_level)
    }

    /// Recompute the latest-state cache from snapshot history.
    pub fn rebuild_latest(&self) -> Result<usize, StoreError> {
        self.lock()?.rebuild_latest()
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        let db = Self { conn };
        let markets = db.rebuild_latest()?;
        tracing::debug!("Latest state rebuilt for {markets} markets");
        Ok(db)
    }

    #[cfg(test)]
    pub fn append_snapshot(&self, snapshot: &SignalSnapshot) -> Result<i64, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let id = insert_snapshot(&tx, snapshot)?;
        tx.commit()?;
        Ok(id)
    }

    #[cfg(test)]
    pub fn append_alert(&self, alert: &AlertRecord) -> Result<i64, StoreError> {
        insert_alert(&self.conn, alert)
    }

    pub fn append_cycle(
        &self,
        snapshot: &SignalSnapshot,
        alert: Option<&AlertRecord>,
    ) -> Result<Option<i64>, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        insert_snapshot(&tx, snapshot)?;
        let alert_id = match alert {
            Some(a) => Some(insert_alert(&tx, a)?),
            None => None,
        };
        tx.commit()?;
        Ok(alert_id)
    }

    pub fn latest(&self, market_id: &str) -> Result<Option<SignalSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM latest_state l JOIN snapshots s ON s.id = l.snapshot_id
             WHERE l.market_id = ?1"
        );
        let snapshot = self
            .conn
            .query_row(&sql, params![market_id], row_to_snapshot)
            .optional()?;
        Ok(snapshot)
    }

    pub fn latest_all(&self) -> Result<Vec<SignalSnapshot>, StoreError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM latest_state l JOIN snapshots s ON s.id = l.snapshot_id
             ORDER BY s.market_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn history(
        &self,
        market_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SignalSnapshot>, StoreError> {
        let since_ms = since.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM snapshots s
             WHERE s.market_id = ?1 AND s.timestamp_ms >= ?2
             ORDER BY s.timestamp_ms ASC, s.id ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![market_id, since_ms], row_to_snapshot)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn alerts(&self, severity: Option<RiskLevel>, limit: usize) -> Result<Vec<AlertRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, market_id, timestamp_ms, previous_level, new_level, severity, message
             FROM alerts WHERE (?1 IS NULL OR severity = ?1)
             ORDER BY timestamp_ms DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![severity.map(|s| s.as_str()), limit as i64],
            row_to_alert,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn append_swaps(&self, swaps: &[SwapEvent]) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO swap_events
                 (market_id, block_number, log_index, tx_hash, timestamp_ms, sender, recipient, amount_in, amount_out, token_in_is_base)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for s in swaps {
                inserted += stmt.execute(params![
                    s.market_id,
                    s.block_number as i64,
                    s.log_index as i64,
                    s.tx_hash,
                    s.timestamp.timestamp_millis(),
                    s.sender,
                    s.recipient,
                    s.amount_in.to_string(),
                    s.amount_out.to_string(),
                    s.token_in_is_base as i32,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn recent_swaps(&self, market_id: &str, limit: usize) -> Result<Vec<SwapEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT market_id, block_number, log_index, tx_hash, timestamp_ms, sender, recipient, amount_in, amount_out, token_in_is_base
             FROM swap_events WHERE market_id = ?1
             ORDER BY block_number DESC, log_index DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![market_id, limit as i64], row_to_swap)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count_swaps_since(&self, since: DateTime<Utc>) -> Result<usize, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM swap_events WHERE timestamp_ms >= ?1",
            params![since.timestamp_millis()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_alerts_since(&self, since: DateTime<Utc>, min_level: RiskLevel) -> Result<usize, StoreError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE timestamp_ms >= ?1 AND new_level >= ?2",
            params![since.timestamp_millis(), min_level.as_u8()],
            |row| row.get::<_, i64>(0),
        )?;
        Ok(count as usize)
    }

    pub fn rebuild_latest(&self) -> Result<usize, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM latest_state", [])?;
        let rebuilt = tx.execute(
            "INSERT INTO latest_state (market_id, snapshot_id)
             SELECT s.market_id, s.id FROM snapshots s
             WHERE s.timestamp_ms = (SELECT MAX(timestamp_ms) FROM snapshots WHERE market_id = s.market_id)",
            [],
        )?;
        tx.commit()?;
        Ok(rebuilt)
    }
}

fn insert_snapshot(conn: &Connection, s: &SignalSnapshot) -> Result<i64, StoreError> {
    let timestamp_ms = s.timestamp.timestamp_millis();
    let last_ms: Option<i64> = conn.query_row(
        "SELECT MAX(timestamp_ms) FROM snapshots WHERE market_id = ?1",
        params![s.market_id],
        |row| row.get(0),
    )?;
    if let Some(last_ms) = last_ms {
        if timestamp_ms <= last_ms {
            return Err(StoreError::NonMonotonic {
                market_id: s.market_id.clone(),
                timestamp_ms,
                last_ms,
            });
        }
    }

    let factors = serde_json::to_string(&s.factors).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    conn.execute(
        "INSERT INTO snapshots (market_id, timestamp_ms, dex_score, whale_score, cex_score, total_score, risk_level, factors)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            s.market_id,
            timestamp_ms,
            s.dex_activity_score,
            s.whale_pressure_score,
            s.cex_net_flow_score,
            s.total_score,
            s.risk_level.as_u8(),
            factors,
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "INSERT OR REPLACE INTO latest_state (market_id, snapshot_id) VALUES (?1, ?2)",
        params![s.market_id, id],
    )?;
    Ok(id)
}

fn insert_alert(conn: &Connection, a: &AlertRecord) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO alerts (market_id, timestamp_ms, previous_level, new_level, severity, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            a.market_id,
            a.timestamp.timestamp_millis(),
            a.previous_level.as_u8(),
            a.new_level.as_u8(),
            a.severity.as_str(),
            a.message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn get_time(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn get_level(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<RiskLevel> {
    let level: i64 = row.get(idx)?;
    u8::try_from(level)
        .ok()
        .and_then(RiskLevel::from_u8)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, level))
}

fn get_amount(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u128> {
    let text: String = row.get(idx)?;
    text.parse::<u128>().map_err(|e| conversion_error(idx, e))
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<SignalSnapshot> {
    let factors: FactorInputs = match row.get::<_, Option<String>>(7)? {
        Some(json) => serde_json::from_str(&json).map_err(|e| conversion_error(7, e))?,
        None => FactorInputs::default(),
    };
    Ok(SignalSnapshot {
        market_id: row.get(0)?,
        timestamp: get_time(row, 1)?,
        dex_activity_score: row.get(2)?,
        whale_pressure_score: row.get(3)?,
        cex_net_flow_score: row.get(4)?,
        total_score: row.get(5)?,
        risk_level: get_level(row, 6)?,
        factors,
    })
}

fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<AlertRecord> {
    let severity: String = row.get(5)?;
    let severity = RiskLevel::parse(&severity)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(5, "severity".into(), Type::Text))?;
    Ok(AlertRecord {
        id: Some(row.get(0)?),
        market_id: row.get(1)?,
        timestamp: get_time(row, 2)?,
        previous_level: get_level(row, 3)?,
        new_level: get_level(row, 4)?,
        severity,
        message: row.get(6)?,
    })
}

fn row_to_swap(row: &rusqlite::Row) -> rusqlite::Result<SwapEvent> {
    Ok(SwapEvent {
        market_id: row.get(0)?,
        block_number: row.get::<_, i64>(1)? as u64,
        log_index: row.get::<_, i64>(2)? as u64,
        tx_hash: row.get(3)?,
        timestamp: get_time(row, 4)?,
        sender: row.get(5)?,
        recipient: row.get(6)?,
        amount_in: get_amount(row, 7)?,
        amount_out: get_amount(row, 8)?,
        token_in_is_base: row.get::<_, i32>(9)? != 0,
    })
}
