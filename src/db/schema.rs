use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS snapshots (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            market_id    TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            dex_score    REAL NOT NULL,
            whale_score  REAL NOT NULL,
            cex_score    REAL NOT NULL,
            total_score  REAL NOT NULL,
            risk_level   INTEGER NOT NULL,
            factors      TEXT -- JSON
        );

        -- derived cache, rebuilt from snapshots on open
        CREATE TABLE IF NOT EXISTS latest_state (
            market_id   TEXT PRIMARY KEY,
            snapshot_id INTEGER NOT NULL REFERENCES snapshots(id)
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            market_id      TEXT NOT NULL,
            timestamp_ms   INTEGER NOT NULL,
            previous_level INTEGER NOT NULL,
            new_level      INTEGER NOT NULL,
            severity       TEXT NOT NULL,
            message        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS swap_events (
            market_id        TEXT NOT NULL,
            block_number     INTEGER NOT NULL,
            log_index        INTEGER NOT NULL,
            tx_hash          TEXT NOT NULL,
            timestamp_ms     INTEGER NOT NULL,
            sender           TEXT NOT NULL,
            recipient        TEXT NOT NULL,
            amount_in        TEXT NOT NULL, -- decimal u128
            amount_out       TEXT NOT NULL,
            token_in_is_base INTEGER NOT NULL,
            PRIMARY KEY (market_id, block_number, log_index)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_market_time ON snapshots(market_id, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_alerts_time ON alerts(timestamp_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity);
        CREATE INDEX IF NOT EXISTS idx_swaps_time ON swap_events(market_id, timestamp_ms DESC);
        ",
    )?;
    Ok(())
}
