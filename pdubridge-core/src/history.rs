//! Time-series sample store.
//!
//! Backed by SQLite in WAL mode: one dedicated writer thread owns the write
//! connection, readers open their own connections and proceed concurrently.
//! Poll batches are coalesced and committed every [`COALESCE_BATCHES`]
//! submissions or every [`COALESCE_WINDOW`], whichever comes first; a crash
//! loses at most the uncommitted tail.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone};
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};

use pdubridge_common::error::{Error, Result};
use pdubridge_common::model::{OutletState, Snapshot, current_timestamp_millis};

/// Commit after this many submitted batches.
const COALESCE_BATCHES: usize = 10;
/// Or after this long with a pending batch.
const COALESCE_WINDOW: Duration = Duration::from_millis(1000);
/// Consecutive write failures before the writer reopens its connection.
const RECONNECT_THRESHOLD: u64 = 5;

/// One bank reading at poll resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct BankSample {
    pub ts: i64,
    pub device_id: String,
    pub bank: u32,
    pub voltage: Option<f64>,
    pub current: f64,
    pub power: Option<f64>,
    pub apparent: Option<f64>,
    pub pf: Option<f64>,
}

/// One outlet reading at poll resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct OutletSample {
    pub ts: i64,
    pub device_id: String,
    pub outlet: u32,
    pub state: OutletState,
    pub current: Option<f64>,
    pub power: Option<f64>,
    pub energy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Bank(BankSample),
    Outlet(OutletSample),
}

/// Flatten one snapshot into history samples.
pub fn samples_from_snapshot(device_id: &str, snapshot: &Snapshot) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(snapshot.banks.len() + snapshot.outlets.len());

    for bank in &snapshot.banks {
        samples.push(Sample::Bank(BankSample {
            ts: snapshot.ts,
            device_id: device_id.to_string(),
            bank: bank.bank,
            voltage: bank.voltage,
            current: bank.current,
            power: bank.power,
            apparent: bank.apparent_power,
            pf: bank.power_factor,
        }));
    }

    for outlet in &snapshot.outlets {
        samples.push(Sample::Outlet(OutletSample {
            ts: snapshot.ts,
            device_id: device_id.to_string(),
            outlet: outlet.outlet,
            state: outlet.state,
            current: outlet.current,
            power: outlet.power,
            energy: outlet.energy,
        }));
    }

    samples
}

/// Downsampled bank point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankPoint {
    pub bucket: i64,
    pub bank: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    pub current: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pf: Option<f64>,
}

/// Downsampled outlet point. Numeric fields are bucket averages; the state is
/// the last value in the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletPoint {
    pub bucket: i64,
    pub outlet: u32,
    pub state: OutletState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
}

/// A stored weekly report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyReport {
    pub id: i64,
    pub device_id: String,
    /// Monday 00:00 local, epoch milliseconds.
    pub week_start: i64,
    /// Following Monday 00:00 local, epoch milliseconds (exclusive).
    pub week_end: i64,
    pub created_at: i64,
    pub payload: serde_json::Value,
}

/// Pick the §downsampling bucket width in seconds for a query range.
pub fn bucket_seconds(range_secs: i64) -> i64 {
    const HOUR: i64 = 3600;
    const DAY: i64 = 86_400;
    match range_secs {
        r if r <= HOUR => 1,
        r if r <= 6 * HOUR => 10,
        r if r <= DAY => 60,
        r if r <= 7 * DAY => 300,
        r if r <= 30 * DAY => 900,
        _ => 1800,
    }
}

enum WriterMsg {
    Batch(Vec<Sample>),
    Sweep { retention_days: u32 },
    GenerateReports { now_ms: i64, done: mpsc::Sender<Result<usize>> },
    Vacuum,
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Handle to the sample store. Cloneable; all writes funnel through the
/// single writer thread.
pub struct HistoryStore {
    path: PathBuf,
    tx: mpsc::Sender<WriterMsg>,
    write_errors: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

impl HistoryStore {
    /// Open (or create) the store and start the writer thread.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = open_writer(&path)?;
        create_schema(&conn)?;

        let write_errors = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();

        let writer_path = path.clone();
        let writer_errors = write_errors.clone();
        let writer = std::thread::Builder::new()
            .name("history-writer".to_string())
            .spawn(move || writer_loop(conn, writer_path, rx, writer_errors))
            .map_err(|e| Error::internal(format!("failed to start history writer: {}", e)))?;

        Ok(Self {
            path,
            tx,
            write_errors,
            writer: Some(writer),
        })
    }

    /// Submit one poll batch. Never blocks the poller.
    pub fn append(&self, samples: Vec<Sample>) {
        if samples.is_empty() {
            return;
        }
        if self.tx.send(WriterMsg::Batch(samples)).is_err() {
            self.write_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Delete rows older than the retention window.
    pub fn sweep(&self, retention_days: u32) {
        let _ = self.tx.send(WriterMsg::Sweep { retention_days });
    }

    /// Explicit compaction; never runs automatically.
    pub fn vacuum(&self) {
        let _ = self.tx.send(WriterMsg::Vacuum);
    }

    /// Block until every previously submitted batch is committed.
    pub fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(WriterMsg::Flush(done_tx))
            .map_err(|_| Error::HistoryWriteFailed("writer thread gone".into()))?;
        done_rx
            .recv_timeout(Duration::from_secs(10))
            .map_err(|_| Error::HistoryWriteFailed("flush timed out".into()))
    }

    /// Generate any missing weekly reports up to the last complete week.
    /// Returns the number of new reports.
    pub fn generate_weekly_reports(&self, now_ms: i64) -> Result<usize> {
        let (done_tx, done_rx) = mpsc::channel();
        self.tx
            .send(WriterMsg::GenerateReports { now_ms, done: done_tx })
            .map_err(|_| Error::HistoryWriteFailed("writer thread gone".into()))?;
        done_rx
            .recv_timeout(Duration::from_secs(60))
            .map_err(|_| Error::HistoryWriteFailed("report generation timed out".into()))?
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::SeqCst)
    }

    /// Downsampled bank series over `[start_ms, end_ms]`.
    pub fn query_banks(
        &self,
        device_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<BankPoint>> {
        let bucket_ms = bucket_seconds((end_ms - start_ms) / 1000) * 1000;
        let conn = self.reader()?;

        let mut stmt = conn
            .prepare(
                "SELECT (ts / ?1) * ?1 AS bucket, bank,
                        AVG(voltage), AVG(current), AVG(power), AVG(apparent), AVG(pf)
                 FROM bank_samples
                 WHERE device_id = ?2 AND ts >= ?3 AND ts <= ?4
                 GROUP BY bucket, bank
                 ORDER BY bucket, bank",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![bucket_ms, device_id, start_ms, end_ms], |row| {
                Ok(BankPoint {
                    bucket: row.get(0)?,
                    bank: row.get(1)?,
                    voltage: row.get(2)?,
                    current: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                    power: row.get(4)?,
                    apparent: row.get(5)?,
                    pf: row.get(6)?,
                })
            })
            .map_err(sql_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Downsampled outlet series over `[start_ms, end_ms]`.
    pub fn query_outlets(
        &self,
        device_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<OutletPoint>> {
        let bucket_ms = bucket_seconds((end_ms - start_ms) / 1000) * 1000;
        let conn = self.reader()?;

        // MAX(ts) makes the bare `state` column come from the newest row in
        // the bucket (SQLite's documented bare-column-with-max behaviour).
        let mut stmt = conn
            .prepare(
                "SELECT (ts / ?1) * ?1 AS bucket, outlet,
                        AVG(current), AVG(power), AVG(energy), MAX(ts), state
                 FROM outlet_samples
                 WHERE device_id = ?2 AND ts >= ?3 AND ts <= ?4
                 GROUP BY bucket, outlet
                 ORDER BY bucket, outlet",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![bucket_ms, device_id, start_ms, end_ms], |row| {
                let state: i64 = row.get(6)?;
                Ok(OutletPoint {
                    bucket: row.get(0)?,
                    outlet: row.get(1)?,
                    state: if state == 1 {
                        OutletState::On
                    } else {
                        OutletState::Off
                    },
                    current: row.get(2)?,
                    power: row.get(3)?,
                    energy: row.get(4)?,
                })
            })
            .map_err(sql_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    /// Stored reports, newest first, optionally scoped to one device.
    pub fn reports(&self, device_id: Option<&str>) -> Result<Vec<WeeklyReport>> {
        let conn = self.reader()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, device_id, week_start, week_end, created_at, payload
                 FROM energy_reports
                 WHERE (?1 IS NULL OR device_id = ?1)
                 ORDER BY week_start DESC, device_id",
            )
            .map_err(sql_err)?;

        let rows = stmt
            .query_map(params![device_id], report_from_row)
            .map_err(sql_err)?;

        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
    }

    pub fn report(&self, id: i64) -> Result<Option<WeeklyReport>> {
        let conn = self.reader()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, device_id, week_start, week_end, created_at, payload
                 FROM energy_reports WHERE id = ?1",
            )
            .map_err(sql_err)?;

        let mut rows = stmt.query_map(params![id], report_from_row).map_err(sql_err)?;
        match rows.next() {
            Some(row) => Ok(Some(row.map_err(sql_err)?)),
            None => Ok(None),
        }
    }

    fn reader(&self) -> Result<Connection> {
        Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::HistoryWriteFailed(format!("failed to open reader: {}", e)))
    }

    /// Flush and stop the writer thread.
    pub fn close(mut self) {
        let _ = self.flush();
        let _ = self.tx.send(WriterMsg::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterMsg::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn sql_err(e: rusqlite::Error) -> Error {
    Error::HistoryWriteFailed(e.to_string())
}

fn report_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WeeklyReport> {
    let payload: String = row.get(5)?;
    Ok(WeeklyReport {
        id: row.get(0)?,
        device_id: row.get(1)?,
        week_start: row.get(2)?,
        week_end: row.get(3)?,
        created_at: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
    })
}

fn open_writer(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .map_err(|e| Error::HistoryWriteFailed(format!("failed to open {}: {}", path.display(), e)))?;
    conn.pragma_update(None, "journal_mode", "WAL").map_err(sql_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(sql_err)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS bank_samples (
             ts        INTEGER NOT NULL,
             device_id TEXT NOT NULL,
             bank      INTEGER NOT NULL,
             voltage   REAL,
             current   REAL NOT NULL,
             power     REAL,
             apparent  REAL,
             pf        REAL
         );
         CREATE INDEX IF NOT EXISTS idx_bank_samples_device_ts
             ON bank_samples (device_id, ts);

         CREATE TABLE IF NOT EXISTS outlet_samples (
             ts        INTEGER NOT NULL,
             device_id TEXT NOT NULL,
             outlet    INTEGER NOT NULL,
             state     INTEGER NOT NULL,
             current   REAL,
             power     REAL,
             energy    REAL
         );
         CREATE INDEX IF NOT EXISTS idx_outlet_samples_device_ts
             ON outlet_samples (device_id, ts);

         CREATE TABLE IF NOT EXISTS energy_reports (
             id         INTEGER PRIMARY KEY AUTOINCREMENT,
             device_id  TEXT NOT NULL,
             week_start INTEGER NOT NULL,
             week_end   INTEGER NOT NULL,
             created_at INTEGER NOT NULL,
             payload    TEXT NOT NULL
         );
         CREATE UNIQUE INDEX IF NOT EXISTS idx_reports_device_week
             ON energy_reports (device_id, week_start);",
    )
    .map_err(sql_err)
}

fn writer_loop(
    mut conn: Connection,
    path: PathBuf,
    rx: mpsc::Receiver<WriterMsg>,
    write_errors: Arc<AtomicU64>,
) {
    let mut pending: Vec<Sample> = Vec::new();
    let mut pending_batches = 0usize;
    let mut first_pending: Option<Instant> = None;
    let mut consecutive_failures = 0u64;

    loop {
        let timeout = match first_pending {
            Some(first) => COALESCE_WINDOW.saturating_sub(first.elapsed()),
            None => Duration::from_secs(3600),
        };

        let msg = match rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };

        match msg {
            Some(WriterMsg::Batch(samples)) => {
                pending.extend(samples);
                pending_batches += 1;
                first_pending.get_or_insert_with(Instant::now);
            }
            Some(WriterMsg::Sweep { retention_days }) => {
                commit_pending(
                    &mut conn, &path, &mut pending, &mut pending_batches,
                    &mut first_pending, &write_errors, &mut consecutive_failures,
                );
                let cutoff = current_timestamp_millis() - retention_days as i64 * 86_400_000;
                let result = conn
                    .execute("DELETE FROM bank_samples WHERE ts < ?1", params![cutoff])
                    .and_then(|_| {
                        conn.execute("DELETE FROM outlet_samples WHERE ts < ?1", params![cutoff])
                    });
                match result {
                    Ok(deleted) => {
                        tracing::debug!(cutoff, deleted, "Retention sweep complete");
                    }
                    Err(e) => {
                        write_errors.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(error = %e, "Retention sweep failed");
                    }
                }
            }
            Some(WriterMsg::GenerateReports { now_ms, done }) => {
                commit_pending(
                    &mut conn, &path, &mut pending, &mut pending_batches,
                    &mut first_pending, &write_errors, &mut consecutive_failures,
                );
                let _ = done.send(generate_reports(&conn, now_ms));
            }
            Some(WriterMsg::Vacuum) => {
                if let Err(e) = conn.execute_batch("VACUUM") {
                    tracing::warn!(error = %e, "Vacuum failed");
                }
            }
            Some(WriterMsg::Flush(done)) => {
                commit_pending(
                    &mut conn, &path, &mut pending, &mut pending_batches,
                    &mut first_pending, &write_errors, &mut consecutive_failures,
                );
                let _ = done.send(());
            }
            Some(WriterMsg::Shutdown) => {
                commit_pending(
                    &mut conn, &path, &mut pending, &mut pending_batches,
                    &mut first_pending, &write_errors, &mut consecutive_failures,
                );
                break;
            }
            None => {
                // Coalesce window elapsed.
                commit_pending(
                    &mut conn, &path, &mut pending, &mut pending_batches,
                    &mut first_pending, &write_errors, &mut consecutive_failures,
                );
            }
        }

        if pending_batches >= COALESCE_BATCHES {
            commit_pending(
                &mut conn, &path, &mut pending, &mut pending_batches,
                &mut first_pending, &write_errors, &mut consecutive_failures,
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn commit_pending(
    conn: &mut Connection,
    path: &Path,
    pending: &mut Vec<Sample>,
    pending_batches: &mut usize,
    first_pending: &mut Option<Instant>,
    write_errors: &Arc<AtomicU64>,
    consecutive_failures: &mut u64,
) {
    if pending.is_empty() {
        *pending_batches = 0;
        *first_pending = None;
        return;
    }

    let result = (|| -> rusqlite::Result<()> {
        let tx = conn.transaction()?;
        {
            let mut bank_stmt = tx.prepare_cached(
                "INSERT INTO bank_samples (ts, device_id, bank, voltage, current, power, apparent, pf)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut outlet_stmt = tx.prepare_cached(
                "INSERT INTO outlet_samples (ts, device_id, outlet, state, current, power, energy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for sample in pending.iter() {
                match sample {
                    Sample::Bank(s) => {
                        bank_stmt.execute(params![
                            s.ts, s.device_id, s.bank, s.voltage, s.current, s.power,
                            s.apparent, s.pf
                        ])?;
                    }
                    Sample::Outlet(s) => {
                        outlet_stmt.execute(params![
                            s.ts,
                            s.device_id,
                            s.outlet,
                            if s.state == OutletState::On { 1 } else { 0 },
                            s.current,
                            s.power,
                            s.energy
                        ])?;
                    }
                }
            }
        }
        tx.commit()
    })();

    match result {
        Ok(()) => {
            *consecutive_failures = 0;
        }
        Err(e) => {
            // The failed batch is lost; the store is lossy on overload.
            write_errors.fetch_add(1, Ordering::SeqCst);
            *consecutive_failures += 1;
            tracing::warn!(
                error = %e,
                samples = pending.len(),
                failures = *consecutive_failures,
                "History batch commit failed, dropping batch"
            );

            if *consecutive_failures >= RECONNECT_THRESHOLD {
                match open_writer(path) {
                    Ok(fresh) => {
                        *conn = fresh;
                        *consecutive_failures = 0;
                        tracing::info!("History writer reconnected");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "History writer reconnect failed");
                    }
                }
            }
        }
    }

    pending.clear();
    *pending_batches = 0;
    *first_pending = None;
}

/// Monday 00:00 local time of the week containing `ts_ms`.
fn week_start_of(ts_ms: i64) -> DateTime<Local> {
    let dt = Local
        .timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Local::now);
    let monday = dt.date_naive() - ChronoDuration::days(dt.weekday().num_days_from_monday() as i64);
    Local
        .from_local_datetime(&monday.and_hms_opt(0, 0, 0).expect("midnight exists"))
        .single()
        .unwrap_or(dt)
}

fn generate_reports(conn: &Connection, now_ms: i64) -> Result<usize> {
    // Last complete Monday..Monday week before `now`.
    let this_week = week_start_of(now_ms);
    let week_start = this_week - ChronoDuration::days(7);
    let week_end = this_week;
    let (start_ms, end_ms) = (week_start.timestamp_millis(), week_end.timestamp_millis());

    let mut devices_stmt = conn
        .prepare(
            "SELECT DISTINCT device_id FROM bank_samples WHERE ts >= ?1 AND ts < ?2
             UNION
             SELECT DISTINCT device_id FROM outlet_samples WHERE ts >= ?1 AND ts < ?2",
        )
        .map_err(sql_err)?;
    let devices: Vec<String> = devices_stmt
        .query_map(params![start_ms, end_ms], |row| row.get(0))
        .map_err(sql_err)?
        .collect::<rusqlite::Result<_>>()
        .map_err(sql_err)?;

    let mut created = 0;
    for device_id in devices {
        let payload = build_report_payload(conn, &device_id, start_ms, end_ms)?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO energy_reports
                     (device_id, week_start, week_end, created_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    device_id,
                    start_ms,
                    end_ms,
                    current_timestamp_millis(),
                    payload.to_string()
                ],
            )
            .map_err(sql_err)?;
        created += inserted;
    }

    Ok(created)
}

fn build_report_payload(
    conn: &Connection,
    device_id: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<serde_json::Value> {
    let (sample_count, avg_power, peak_power): (i64, Option<f64>, Option<f64>) = conn
        .query_row(
            "SELECT COUNT(*), AVG(power), MAX(power)
             FROM bank_samples
             WHERE device_id = ?1 AND ts >= ?2 AND ts < ?3",
            params![device_id, start_ms, end_ms],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(sql_err)?;

    let hours = (end_ms - start_ms) as f64 / 3_600_000.0;
    let total_kwh = avg_power.map(|w| w * hours / 1000.0);

    let mut outlet_stmt = conn
        .prepare(
            "SELECT outlet, AVG(power), MAX(power)
             FROM outlet_samples
             WHERE device_id = ?1 AND ts >= ?2 AND ts < ?3
             GROUP BY outlet ORDER BY outlet",
        )
        .map_err(sql_err)?;
    let outlets: Vec<serde_json::Value> = outlet_stmt
        .query_map(params![device_id, start_ms, end_ms], |row| {
            let outlet: u32 = row.get(0)?;
            let avg: Option<f64> = row.get(1)?;
            let peak: Option<f64> = row.get(2)?;
            Ok(serde_json::json!({
                "outlet": outlet,
                "avg_power_w": avg,
                "peak_power_w": peak,
                "kwh": avg.map(|w| w * hours / 1000.0),
            }))
        })
        .map_err(sql_err)?
        .collect::<rusqlite::Result<_>>()
        .map_err(sql_err)?;

    let mut daily_stmt = conn
        .prepare(
            "SELECT (ts / 86400000) * 86400000 AS day, AVG(power)
             FROM bank_samples
             WHERE device_id = ?1 AND ts >= ?2 AND ts < ?3
             GROUP BY day ORDER BY day",
        )
        .map_err(sql_err)?;
    let daily: Vec<serde_json::Value> = daily_stmt
        .query_map(params![device_id, start_ms, end_ms], |row| {
            let day: i64 = row.get(0)?;
            let avg: Option<f64> = row.get(1)?;
            Ok(serde_json::json!({
                "day": day,
                "avg_power_w": avg,
                "kwh": avg.map(|w| w * 24.0 / 1000.0),
            }))
        })
        .map_err(sql_err)?
        .collect::<rusqlite::Result<_>>()
        .map_err(sql_err)?;

    Ok(serde_json::json!({
        "total_kwh": total_kwh,
        "avg_power_w": avg_power,
        "peak_power_w": peak_power,
        "sample_count": sample_count,
        "outlets": outlets,
        "daily": daily,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bank_sample(device: &str, ts: i64, power: f64) -> Sample {
        Sample::Bank(BankSample {
            ts,
            device_id: device.to_string(),
            bank: 1,
            voltage: Some(230.0),
            current: 5.0,
            power: Some(power),
            apparent: None,
            pf: Some(0.98),
        })
    }

    fn outlet_sample(device: &str, ts: i64, state: OutletState) -> Sample {
        Sample::Outlet(OutletSample {
            ts,
            device_id: device.to_string(),
            outlet: 3,
            state,
            current: Some(0.6),
            power: Some(138.0),
            energy: None,
        })
    }

    fn open_store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_bucket_table() {
        assert_eq!(bucket_seconds(3600), 1);
        assert_eq!(bucket_seconds(6 * 3600), 10);
        assert_eq!(bucket_seconds(24 * 3600), 60);
        assert_eq!(bucket_seconds(7 * 86_400), 300);
        assert_eq!(bucket_seconds(30 * 86_400), 900);
        assert_eq!(bucket_seconds(60 * 86_400), 1800);
    }

    #[test]
    fn test_append_and_raw_query() {
        let (_dir, store) = open_store();
        let base = 1_000_000_000_000i64;

        for i in 0..60 {
            store.append(vec![bank_sample("d1", base + i * 1000, 1000.0 + i as f64)]);
        }
        store.flush().unwrap();

        // One-hour range keeps raw resolution.
        let points = store.query_banks("d1", base, base + 3_599_000).unwrap();
        assert_eq!(points.len(), 60);
        assert_eq!(points[0].current, 5.0);
    }

    #[test]
    fn test_downsampling_buckets_and_cap() {
        let (_dir, store) = open_store();
        let base = 1_000_000_000_000i64;

        // Two hours of 1 Hz data queried over 24 h: 60 s buckets.
        let mut samples = Vec::new();
        for i in 0..7200 {
            samples.push(bank_sample("d1", base + i * 1000, 1000.0));
        }
        store.append(samples);
        store.flush().unwrap();

        let points = store
            .query_banks("d1", base, base + 24 * 3_600_000)
            .unwrap();
        assert_eq!(points.len(), 120);
        assert!(points.len() <= 1440);

        // Buckets span exactly 60 s.
        assert_eq!(points[1].bucket - points[0].bucket, 60_000);
        // Averages survive.
        assert_eq!(points[0].power, Some(1000.0));
    }

    #[test]
    fn test_outlet_state_is_last_in_bucket() {
        let (_dir, store) = open_store();
        let base = 1_000_000_000_000i64;

        // Within one 60 s bucket the outlet flips off at the end.
        let mut samples = Vec::new();
        for i in 0..50 {
            samples.push(outlet_sample("d1", base + i * 1000, OutletState::On));
        }
        samples.push(outlet_sample("d1", base + 50_000, OutletState::Off));
        store.append(samples);
        store.flush().unwrap();

        let points = store
            .query_outlets("d1", base, base + 24 * 3_600_000)
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].state, OutletState::Off);
    }

    #[test]
    fn test_retention_sweep_boundary() {
        let (_dir, store) = open_store();
        let now = current_timestamp_millis();
        let retention_ms = 60i64 * 86_400_000;

        store.append(vec![
            bank_sample("d1", now - retention_ms - 1000, 100.0),
            bank_sample("d1", now - retention_ms + 1000, 200.0),
        ]);
        store.flush().unwrap();

        store.sweep(60);
        store.flush().unwrap();

        let points = store.query_banks("d1", now - retention_ms * 2, now).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].power, Some(200.0));
    }

    #[test]
    fn test_weekly_report_idempotent() {
        let (_dir, store) = open_store();
        let now = current_timestamp_millis();

        // Samples in the middle of the previous week.
        let last_week = now - 7 * 86_400_000;
        store.append(vec![
            bank_sample("d1", last_week, 1000.0),
            bank_sample("d1", last_week + 1000, 2000.0),
        ]);
        store.flush().unwrap();

        let created = store.generate_weekly_reports(now).unwrap();
        assert_eq!(created, 1);

        // Second run creates nothing new.
        let created = store.generate_weekly_reports(now).unwrap();
        assert_eq!(created, 0);

        let reports = store.reports(Some("d1")).unwrap();
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.device_id, "d1");
        assert_eq!(report.payload["sample_count"], 2);
        assert_eq!(report.payload["avg_power_w"], 1500.0);

        let by_id = store.report(report.id).unwrap().unwrap();
        assert_eq!(by_id.week_start, report.week_start);
        assert!(store.report(9999).unwrap().is_none());
    }

    #[test]
    fn test_samples_from_snapshot() {
        use pdubridge_common::model::{BankMetrics, LoadState, OutletMetrics};

        let mut snap = Snapshot::empty();
        snap.banks.push(BankMetrics {
            bank: 1,
            current: 5.2,
            load_state: LoadState::Normal,
            voltage: Some(230.0),
            power: Some(1180.0),
            apparent_power: None,
            power_factor: Some(0.98),
            energy: None,
        });
        snap.outlets.push(OutletMetrics {
            outlet: 1,
            state: OutletState::On,
            name: "Router".to_string(),
            current: None,
            power: None,
            energy: None,
        });

        let samples = samples_from_snapshot("d1", &snap);
        assert_eq!(samples.len(), 2);
        assert!(matches!(&samples[0], Sample::Bank(b) if b.current == 5.2));
        assert!(matches!(&samples[1], Sample::Outlet(o) if o.state == OutletState::On));
    }
}
