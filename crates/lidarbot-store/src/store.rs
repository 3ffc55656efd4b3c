//! SQLite training log.
//!
//! One row per labelled frame. Rows are written in autocommit mode with
//! `synchronous=FULL`, so a record is on disk once `record` returns.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use lidarbot_core::{Action, ActionSet, FrameRecorder, RangeFrame, RangeSample, RecordOutcome, RecordingError};

use crate::error::StoreError;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS training_records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id    TEXT    NOT NULL,
    recorded_at   TEXT    NOT NULL,
    action        TEXT    NOT NULL,
    action_index  INTEGER NOT NULL,
    sample_count  INTEGER NOT NULL,
    frame_json    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_training_records_action ON training_records(action);
";

/// A stored, labelled frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingRecord {
    pub id: i64,
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub action: Action,
    pub action_index: usize,
    pub frame: RangeFrame,
}

/// Line shape consumed by the offline trainer.
#[derive(Serialize)]
struct ExportLine {
    frame: Vec<[f32; 2]>,
    action: usize,
}

pub struct TrainingStore {
    conn: Mutex<Connection>,
    actions: ActionSet,
    session_id: Uuid,
}

impl TrainingStore {
    pub fn open(path: impl AsRef<Path>, actions: ActionSet) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        let store = Self::init(conn, actions)?;
        info!("training log {} opened, session {}", path.display(), store.session_id);
        Ok(store)
    }

    pub fn open_in_memory(actions: ActionSet) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, actions)
    }

    fn init(conn: Connection, actions: ActionSet) -> Result<Self, StoreError> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Schema { found: version, supported: SCHEMA_VERSION });
        }
        conn.execute_batch(SCHEMA)?;
        if version < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(Self { conn: Mutex::new(conn), actions, session_id: Uuid::new_v4() })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn actions(&self) -> &ActionSet {
        &self.actions
    }

    /// Store the valid samples of `frame` labelled with `action`.
    pub fn insert(&self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        let index = self.actions.index_of(action).ok_or(RecordingError::UnmappedAction(action))?;
        let valid = frame.retain_valid();
        if valid.is_empty() {
            warn!("scan has no valid samples, {} not recorded", action);
            return Ok(RecordOutcome::SkippedEmpty);
        }
        let json = encode_frame(&valid).map_err(StoreError::from)?;
        self.conn()
            .execute(
                "INSERT INTO training_records
                    (session_id, recorded_at, action, action_index, sample_count, frame_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    self.session_id.to_string(),
                    Utc::now().to_rfc3339(),
                    action.name(),
                    index as i64,
                    valid.len() as i64,
                    json
                ],
            )
            .map_err(StoreError::from)?;
        debug!("stored {} samples as {}", valid.len(), action);
        Ok(RecordOutcome::Written)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self.conn().query_row("SELECT COUNT(*) FROM training_records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Records per action name.
    pub fn action_histogram(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT action, COUNT(*) FROM training_records GROUP BY action")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut hist = BTreeMap::new();
        for row in rows {
            let (action, n) = row?;
            hist.insert(action, n as u64);
        }
        Ok(hist)
    }

    /// Distinct capture sessions in the log.
    pub fn session_count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(DISTINCT session_id) FROM training_records", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub fn last_recorded_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(i64, String)> = self
            .conn()
            .query_row(
                "SELECT id, recorded_at FROM training_records ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(id, ts)| parse_timestamp(id, &ts)).transpose()
    }

    /// All records in insertion order.
    pub fn load_records(&self) -> Result<Vec<TrainingRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, recorded_at, action, action_index, frame_json
             FROM training_records ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session_id, recorded_at, action, action_index, frame_json) = row?;
            let action: Action =
                action.parse().map_err(|e: lidarbot_core::UnknownAction| StoreError::Corrupt {
                    id,
                    reason: e.to_string(),
                })?;
            let frame = decode_frame(&frame_json)
                .map_err(|e| StoreError::Corrupt { id, reason: format!("bad frame: {e}") })?;
            records.push(TrainingRecord {
                id,
                session_id,
                recorded_at: parse_timestamp(id, &recorded_at)?,
                action,
                action_index: action_index as usize,
                frame,
            });
        }
        Ok(records)
    }

    /// Write one `{"frame": [[angle, distance], ...], "action": index}` line per
    /// record. Returns the number of lines written.
    pub fn export_jsonl<W: Write>(&self, mut out: W) -> Result<u64, StoreError> {
        let mut lines = 0;
        for record in self.load_records()? {
            let line = ExportLine {
                frame: record.frame.iter().map(|s| [s.angle_deg, s.distance_mm]).collect(),
                action: record.action_index,
            };
            serde_json::to_writer(&mut out, &line)?;
            out.write_all(b"\n")?;
            lines += 1;
        }
        out.flush()?;
        Ok(lines)
    }
}

impl FrameRecorder for TrainingStore {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        self.insert(frame, action)
    }
}

impl FrameRecorder for &TrainingStore {
    fn record(&mut self, frame: &RangeFrame, action: Action) -> Result<RecordOutcome, RecordingError> {
        self.insert(frame, action)
    }
}

fn encode_frame(frame: &RangeFrame) -> serde_json::Result<String> {
    let rows: Vec<(u8, f32, f32)> = frame.iter().map(|s| (s.quality, s.angle_deg, s.distance_mm)).collect();
    serde_json::to_string(&rows)
}

fn decode_frame(json: &str) -> serde_json::Result<RangeFrame> {
    let rows: Vec<(u8, f32, f32)> = serde_json::from_str(json)?;
    Ok(rows.into_iter().map(|(q, a, d)| RangeSample::new(q, a, d)).collect())
}

fn parse_timestamp(id: i64, ts: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt { id, reason: format!("bad timestamp {ts:?}: {e}") })
}
