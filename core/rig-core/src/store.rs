//! SQLite persistence for the rig.
//!
//! One database holds the singleton lock record, the experiment registry and
//! the best-known stimulation parameters. Connections are opened per operation
//! so several operator processes can share the file; every lock transition is a
//! single conditional `UPDATE`, which makes the check and the write one step.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{store_err, Result, RigError};
use crate::stim::{
    check_electrode, FieldValue, StagedStim, StimField, StimParam, StimPolarity, StimShape,
};

/// Shared lock record. At most one owner is running at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRecord {
    pub running: bool,
    pub owner_token: Option<String>,
    pub maintenance: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub token: String,
    /// Booking identity (email) the experiment runs under.
    pub identity: String,
    pub name: String,
    pub electrodes: BTreeSet<u8>,
    pub can_run: bool,
}

/// Best stimulation found for an electrode by a previous experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestStimParam {
    pub electrode: u8,
    pub stim_shape: StimShape,
    pub polarity: StimPolarity,
    pub phase_duration1: f64,
    pub phase_duration2: f64,
    pub phase_amplitude1: f64,
    pub phase_amplitude2: f64,
    pub interphase_delay: f64,
    pub updated_at: DateTime<Utc>,
}

impl BestStimParam {
    /// Full parameter for the electrode: defaults overlaid with the stored values.
    pub fn to_stim_param(&self) -> Result<StimParam> {
        let mut param = StimParam::new(self.electrode)?;
        param.set(StimField::StimShape, FieldValue::Shape(self.stim_shape))?;
        param.set(StimField::Polarity, FieldValue::Polarity(self.polarity))?;
        param.set(StimField::PhaseDuration1, FieldValue::Float(self.phase_duration1))?;
        param.set(StimField::PhaseDuration2, FieldValue::Float(self.phase_duration2))?;
        param.set(StimField::PhaseAmplitude1, FieldValue::Float(self.phase_amplitude1))?;
        param.set(StimField::PhaseAmplitude2, FieldValue::Float(self.phase_amplitude2))?;
        param.set(StimField::InterphaseDelay, FieldValue::Float(self.interphase_delay))?;
        Ok(param)
    }
}

/// Conditional mutations of the lock record.
///
/// `try_acquire` and `release` return whether the guarded update matched. A
/// `false` leaves the record untouched; callers re-read it to find out why.
pub trait LockStore: Send + Sync {
    fn load(&self) -> Result<LockRecord>;
    fn try_acquire(&self, token: &str, at: DateTime<Utc>) -> Result<bool>;
    fn release(&self, token: &str, at: DateTime<Utc>) -> Result<bool>;
    fn set_maintenance(&self, maintenance: bool, at: DateTime<Utc>) -> Result<()>;
}

/// Experiment registry plus per-token state that outlives one operator process.
pub trait ExperimentDirectory: Send + Sync {
    fn experiment(&self, token: &str) -> Result<Option<ExperimentRecord>>;
    fn best_stim_param(&self, electrode: u8) -> Result<Option<BestStimParam>>;

    /// Stimulation parameters staged under `token`, ordered by electrode.
    fn staged_stim_params(&self, token: &str) -> Result<Vec<StagedStim>>;
    fn save_staged_stim_param(&self, token: &str, staged: &StagedStim) -> Result<()>;
    fn clear_staged_stim_params(&self, token: &str) -> Result<()>;
}

pub struct RigDb {
    path: PathBuf,
}

impl RigDb {
    pub fn new(path: PathBuf) -> Result<Self> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn upsert_experiment(&self, record: &ExperimentRecord) -> Result<()> {
        for electrode in &record.electrodes {
            check_electrode(*electrode)?;
        }
        let electrodes = serde_json::to_string(&record.electrodes)
            .map_err(|err| RigError::validation("electrodes", err.to_string()))?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO experiments (token, identity, name, electrodes, can_run) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(token) DO UPDATE SET \
                    identity = excluded.identity, \
                    name = excluded.name, \
                    electrodes = excluded.electrodes, \
                    can_run = excluded.can_run",
                params![
                    record.token,
                    record.identity,
                    record.name,
                    electrodes,
                    record.can_run
                ],
            )
            .map_err(store_err("Failed to upsert experiment"))?;
            Ok(())
        })
    }

    pub fn upsert_best_stim_param(&self, best: &BestStimParam) -> Result<()> {
        check_electrode(best.electrode)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO best_stim_params \
                    (electrode, stim_shape, polarity, phase_duration1, phase_duration2, \
                     phase_amplitude1, phase_amplitude2, interphase_delay, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(electrode) DO UPDATE SET \
                    stim_shape = excluded.stim_shape, \
                    polarity = excluded.polarity, \
                    phase_duration1 = excluded.phase_duration1, \
                    phase_duration2 = excluded.phase_duration2, \
                    phase_amplitude1 = excluded.phase_amplitude1, \
                    phase_amplitude2 = excluded.phase_amplitude2, \
                    interphase_delay = excluded.interphase_delay, \
                    updated_at = excluded.updated_at",
                params![
                    best.electrode,
                    best.stim_shape.name(),
                    best.polarity.name(),
                    best.phase_duration1,
                    best.phase_duration2,
                    best.phase_amplitude1,
                    best.phase_amplitude2,
                    best.interphase_delay,
                    best.updated_at.to_rfc3339()
                ],
            )
            .map_err(store_err("Failed to upsert best stimulation parameter"))?;
            Ok(())
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS rig_lock (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    running INTEGER NOT NULL DEFAULT 0,
                    owner_token TEXT,
                    maintenance INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT
                 );
                 INSERT OR IGNORE INTO rig_lock (id, running, owner_token, maintenance)
                    VALUES (1, 0, NULL, 0);
                 CREATE TABLE IF NOT EXISTS experiments (
                    token TEXT PRIMARY KEY,
                    identity TEXT NOT NULL,
                    name TEXT NOT NULL,
                    electrodes TEXT NOT NULL,
                    can_run INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS best_stim_params (
                    electrode INTEGER PRIMARY KEY,
                    stim_shape TEXT NOT NULL,
                    polarity TEXT NOT NULL,
                    phase_duration1 REAL NOT NULL,
                    phase_duration2 REAL NOT NULL,
                    phase_amplitude1 REAL NOT NULL,
                    phase_amplitude2 REAL NOT NULL,
                    interphase_delay REAL NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS staged_stim_params (
                    token TEXT NOT NULL,
                    electrode INTEGER NOT NULL,
                    staged TEXT NOT NULL,
                    PRIMARY KEY (token, electrode)
                 );
                 COMMIT;",
            )
            .map_err(store_err("Failed to initialize schema"))?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent).map_err(|source| RigError::Connection {
                target: parent.display().to_string(),
                source,
            })?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(store_err("Failed to open sqlite db"))?;

        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(store_err("Failed to set busy_timeout"))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(store_err("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(store_err("Failed to set synchronous"))?;

        Ok(conn)
    }
}

impl LockStore for RigDb {
    fn load(&self) -> Result<LockRecord> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT running, owner_token, maintenance, updated_at FROM rig_lock WHERE id = 1",
                [],
                |row| {
                    Ok(LockRecord {
                        running: row.get(0)?,
                        owner_token: row.get(1)?,
                        maintenance: row.get(2)?,
                        updated_at: row.get::<_, Option<String>>(3)?.and_then(parse_rfc3339),
                    })
                },
            )
            .map_err(store_err("Failed to read lock record"))
        })
    }

    fn try_acquire(&self, token: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE rig_lock SET running = 1, owner_token = ?1, updated_at = ?2 \
                     WHERE id = 1 AND running = 0 AND maintenance = 0",
                    params![token, at.to_rfc3339()],
                )
                .map_err(store_err("Failed to acquire lock"))?;
            Ok(changed == 1)
        })
    }

    fn release(&self, token: &str, at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE rig_lock SET running = 0, owner_token = NULL, updated_at = ?2 \
                     WHERE id = 1 AND running = 1 AND owner_token = ?1",
                    params![token, at.to_rfc3339()],
                )
                .map_err(store_err("Failed to release lock"))?;
            Ok(changed == 1)
        })
    }

    fn set_maintenance(&self, maintenance: bool, at: DateTime<Utc>) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE rig_lock SET maintenance = ?1, updated_at = ?2 WHERE id = 1",
                params![maintenance, at.to_rfc3339()],
            )
            .map_err(store_err("Failed to update maintenance flag"))?;
            Ok(())
        })
    }
}

impl ExperimentDirectory for RigDb {
    fn experiment(&self, token: &str) -> Result<Option<ExperimentRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT token, identity, name, electrodes, can_run FROM experiments WHERE token = ?1",
                params![token],
                |row| {
                    let electrodes: String = row.get(3)?;
                    let electrodes: BTreeSet<u8> = serde_json::from_str(&electrodes)
                        .map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(err))
                        })?;
                    Ok(ExperimentRecord {
                        token: row.get(0)?,
                        identity: row.get(1)?,
                        name: row.get(2)?,
                        electrodes,
                        can_run: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(store_err("Failed to read experiment"))
        })
    }

    fn best_stim_param(&self, electrode: u8) -> Result<Option<BestStimParam>> {
        check_electrode(electrode)?;
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT stim_shape, polarity, phase_duration1, phase_duration2, \
                        phase_amplitude1, phase_amplitude2, interphase_delay, updated_at \
                 FROM best_stim_params WHERE electrode = ?1",
                params![electrode],
                |row| {
                    let stim_shape: String = row.get(0)?;
                    let polarity: String = row.get(1)?;
                    let updated_at: String = row.get(7)?;
                    Ok(BestStimParam {
                        electrode,
                        stim_shape: stim_shape.parse().map_err(|err: RigError| {
                            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
                        })?,
                        polarity: polarity.parse().map_err(|err: RigError| {
                            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(err))
                        })?,
                        phase_duration1: row.get(2)?,
                        phase_duration2: row.get(3)?,
                        phase_amplitude1: row.get(4)?,
                        phase_amplitude2: row.get(5)?,
                        interphase_delay: row.get(6)?,
                        updated_at: parse_rfc3339(updated_at).ok_or_else(|| {
                            rusqlite::Error::InvalidColumnType(
                                7,
                                "updated_at".to_string(),
                                Type::Text,
                            )
                        })?,
                    })
                },
            )
            .optional()
            .map_err(store_err("Failed to read best stimulation parameter"))
        })
    }

    fn staged_stim_params(&self, token: &str) -> Result<Vec<StagedStim>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT staged FROM staged_stim_params WHERE token = ?1 ORDER BY electrode",
                )
                .map_err(store_err("Failed to prepare staged parameter query"))?;
            let rows = stmt
                .query_map(params![token], |row| {
                    let staged: String = row.get(0)?;
                    serde_json::from_str::<StagedStim>(&staged).map_err(|err| {
                        rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err))
                    })
                })
                .map_err(store_err("Failed to read staged parameters"))?;
            let staged = rows
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err("Failed to decode staged parameter"))?;
            Ok(staged)
        })
    }

    fn save_staged_stim_param(&self, token: &str, staged: &StagedStim) -> Result<()> {
        check_electrode(staged.electrode)?;
        let json = serde_json::to_string(staged)
            .map_err(|err| RigError::validation("staged parameter", err.to_string()))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO staged_stim_params (token, electrode, staged) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(token, electrode) DO UPDATE SET staged = excluded.staged",
                params![token, staged.electrode, json],
            )
            .map_err(store_err("Failed to save staged parameter"))?;
            Ok(())
        })
    }

    fn clear_staged_stim_params(&self, token: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM staged_stim_params WHERE token = ?1",
                params![token],
            )
            .map_err(store_err("Failed to clear staged parameters"))?;
            Ok(())
        })
    }
}

fn parse_rfc3339(value: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_db() -> (tempfile::TempDir, RigDb) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = RigDb::new(temp_dir.path().join("rig.db")).expect("db init");
        (temp_dir, db)
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn fresh_record_is_idle() {
        let (_dir, db) = test_db();
        let record = db.load().expect("load");
        assert!(!record.running);
        assert!(!record.maintenance);
        assert_eq!(record.owner_token, None);
        assert_eq!(record.updated_at, None);
    }

    #[test]
    fn schema_init_is_idempotent() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("rig.db");
        let first = RigDb::new(path.clone()).expect("first init");
        assert!(first.try_acquire("tok-1", at(0)).expect("acquire"));

        let second = RigDb::new(path).expect("second init");
        let record = second.load().expect("load");
        assert!(record.running);
        assert_eq!(record.owner_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn acquire_is_exclusive() {
        let (_dir, db) = test_db();
        assert!(db.try_acquire("tok-1", at(0)).expect("acquire"));
        assert!(!db.try_acquire("tok-2", at(1)).expect("second acquire"));

        let record = db.load().expect("load");
        assert_eq!(record.owner_token.as_deref(), Some("tok-1"));
        assert_eq!(record.updated_at, Some(at(0)));
    }

    #[test]
    fn maintenance_blocks_acquire() {
        let (_dir, db) = test_db();
        db.set_maintenance(true, at(0)).expect("maintenance on");
        assert!(!db.try_acquire("tok-1", at(1)).expect("acquire"));
        assert!(!db.load().expect("load").running);
    }

    #[test]
    fn release_requires_matching_owner() {
        let (_dir, db) = test_db();
        assert!(db.try_acquire("tok-1", at(0)).expect("acquire"));
        assert!(!db.release("tok-2", at(1)).expect("foreign release"));
        assert!(db.load().expect("load").running);

        assert!(db.release("tok-1", at(2)).expect("release"));
        let record = db.load().expect("load");
        assert!(!record.running);
        assert_eq!(record.owner_token, None);
    }

    #[test]
    fn experiments_round_trip_through_json_column() {
        let (_dir, db) = test_db();
        let record = ExperimentRecord {
            token: "tok-1".to_string(),
            identity: "ana@lab.org".to_string(),
            name: "retina-a".to_string(),
            electrodes: [3u8, 5, 9].into_iter().collect(),
            can_run: true,
        };
        db.upsert_experiment(&record).expect("upsert");
        assert_eq!(db.experiment("tok-1").expect("read"), Some(record));
        assert_eq!(db.experiment("tok-x").expect("read"), None);
    }

    #[test]
    fn best_stim_param_overlays_defaults() {
        let (_dir, db) = test_db();
        let best = BestStimParam {
            electrode: 12,
            stim_shape: StimShape::Triphasic,
            polarity: StimPolarity::PositiveFirst,
            phase_duration1: 200.0,
            phase_duration2: 150.0,
            phase_amplitude1: 3.5,
            phase_amplitude2: 3.5,
            interphase_delay: 20.0,
            updated_at: at(5),
        };
        db.upsert_best_stim_param(&best).expect("upsert");

        let stored = db
            .best_stim_param(12)
            .expect("read")
            .expect("row present");
        assert_eq!(stored, best);

        let param = stored.to_stim_param().expect("param");
        assert_eq!(param.get(StimField::StimShape), FieldValue::Shape(StimShape::Triphasic));
        assert_eq!(param.get(StimField::PulseTrainPeriod), FieldValue::Int(10_000));
        assert!(db.best_stim_param(13).expect("read").is_none());
    }

    #[test]
    fn staged_params_are_scoped_to_the_token() {
        let (_dir, db) = test_db();
        let mut param = StimParam::new(4).expect("param");
        param.take_changes();
        param.set(StimField::NbPulse, FieldValue::Int(3)).expect("edit");

        db.save_staged_stim_param("tok-1", &param.to_staged())
            .expect("save");
        param.take_changes();
        db.save_staged_stim_param("tok-1", &param.to_staged())
            .expect("overwrite");
        db.save_staged_stim_param("tok-2", &StimParam::new(9).expect("param").to_staged())
            .expect("save other token");

        let staged = db.staged_stim_params("tok-1").expect("read");
        assert_eq!(staged.len(), 1);
        assert!(staged[0].pending.is_empty());
        assert_eq!(staged[0].values[&StimField::NbPulse], FieldValue::Int(3));

        db.clear_staged_stim_params("tok-1").expect("clear");
        assert!(db.staged_stim_params("tok-1").expect("read").is_empty());
        assert_eq!(db.staged_stim_params("tok-2").expect("read").len(), 1);
    }
}
