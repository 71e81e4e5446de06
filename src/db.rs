use crate::models::{LevelSummary, TankRecord};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub struct HistoryStore {
    conn: Mutex<Connection>,
    max_records: usize,
}

impl HistoryStore {
    /// Opens (or creates) the database at `db_path`. `":memory:"` gives a private in-memory store.
    pub fn new(db_path: &str, max_records: usize) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_records,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initializes the database schema.
    pub fn initialize_db(&self) -> Result<()> {
        let conn = self.conn();

        info!("Initializing history schema...");

        match conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS tank_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tank_id TEXT NOT NULL,
            level REAL NOT NULL,
            timestamp INTEGER NOT NULL,
            readable_time TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tank_readings_tank_time
            ON tank_readings (tank_id, timestamp);
        "#,
        ) {
            Ok(_) => {
                info!("History schema initialized successfully.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to initialize history schema: {:?}", e);
                Err(e)
            }
        }
    }

    /// Stores a reading and trims the tank's history to `max_records`.
    pub fn insert_reading(&self, record: &TankRecord) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "INSERT INTO tank_readings (tank_id, level, timestamp, readable_time)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.tank_id, record.level as f64, record.timestamp, record.readable_time],
        )?;

        conn.execute(
            "DELETE FROM tank_readings
             WHERE id NOT IN (
                 SELECT id
                 FROM tank_readings
                 WHERE tank_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2
             ) AND tank_id = ?1",
            params![record.tank_id, self.max_records as i64],
        )?;
        Ok(())
    }

    /// Retrieves the last `limit` readings of a tank, newest first.
    pub fn recent_readings(&self, tank_id: &str, limit: usize) -> Result<Vec<TankRecord>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT tank_id, level, timestamp, readable_time FROM tank_readings
             WHERE tank_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tank_id, limit as i64], record_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        Ok(results)
    }

    pub fn latest_reading(&self, tank_id: &str) -> Result<Option<TankRecord>> {
        let conn = self.conn();

        conn.query_row(
            "SELECT tank_id, level, timestamp, readable_time FROM tank_readings
             WHERE tank_id = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT 1",
            params![tank_id],
            record_from_row,
        )
        .optional()
    }

    /// Count, min, max and mean level of a tank. `None` when nothing was recorded.
    pub fn summary(&self, tank_id: &str) -> Result<Option<LevelSummary>> {
        let conn = self.conn();

        let (count, min, max, average): (i64, Option<f64>, Option<f64>, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), MIN(level), MAX(level), AVG(level)
             FROM tank_readings WHERE tank_id = ?1",
            params![tank_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(match (min, max, average) {
            (Some(min), Some(max), Some(average)) if count > 0 => Some(LevelSummary {
                tank_id: tank_id.to_string(),
                count,
                min,
                max,
                average,
            }),
            _ => None,
        })
    }
}

fn record_from_row(row: &Row<'_>) -> Result<TankRecord> {
    let level: f64 = row.get(1)?;
    Ok(TankRecord {
        tank_id: row.get(0)?,
        level: level as f32,
        timestamp: row.get(2)?,
        readable_time: row.get(3)?,
    })
}
