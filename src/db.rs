//! Record store module
//!
//! A single SQLite file per archive root remembers every file a previous run
//! wrote, keyed by the identifier the portal puts in the file URL. Worker units
//! only ever read it, each through its own [`StoreHandle`]. Records produced by
//! the current run are buffered in memory and written by [`RecordStore::flush`]
//! once all work has finished, so they stay invisible to status queries for the
//! whole run.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use rusqlite::{Connection, OpenFlags, params};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::util::checksum_file;

pub const DATABASE_FILE_NAME: &str = "ninova_arsivci.db";

const CREATE_TABLE_QUERY: &str = "CREATE TABLE files (id INTEGER PRIMARY KEY, path TEXT UNIQUE, hash INTEGER, isDeleted INTEGER DEFAULT 0)";
const TABLE_INFO_QUERY: &str = "SELECT name FROM pragma_table_info('files') ORDER BY cid";
const SELECT_FILE_BY_ID_QUERY: &str = "SELECT isDeleted, id FROM files WHERE id = ?1";
// A soft-deleted row is revived by a fresh download; a live row is never overwritten.
const INSERT_FILE_QUERY: &str = "INSERT INTO files (id, path, hash) VALUES (?1, ?2, ?3) \
     ON CONFLICT(id) DO UPDATE SET path = excluded.path, hash = excluded.hash, isDeleted = 0 \
     WHERE files.isDeleted != 0";

// The portal may re-upload a file under a new id; the path then moves to the new row.
const DELETE_STALE_PATH_QUERY: &str = "DELETE FROM files WHERE path = ?1 AND id != ?2";

const EXPECTED_COLUMNS: [&str; 4] = ["id", "path", "hash", "isDeleted"];
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifier the portal assigns to a file, taken from its download URL
pub type FileId = i64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to open the record store at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("the record store at {0:?} does not have the expected schema")]
    Corrupt(PathBuf),

    #[error("asked the record store for file {expected} but got file {found}")]
    RecordMismatch { expected: FileId, found: FileId },

    #[error("file {id} is already recorded, refusing to record it again at {path:?}")]
    DuplicateRecord { id: FileId, path: PathBuf },

    #[error("failed to record {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Mutex lock error: {0}")]
    MutexError(String),
}

impl<T> From<PoisonError<MutexGuard<'_, T>>> for StoreError {
    fn from(err: PoisonError<MutexGuard<'_, T>>) -> Self {
        StoreError::MutexError(err.to_string())
    }
}

/// A file written by this program, waiting to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: FileId,
    pub path: PathBuf,
}

impl FileRecord {
    pub fn new(id: FileId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Never recorded
    New,
    /// Recorded and not marked deleted
    Exists,
    /// Recorded, but marked deleted by hand
    Deleted,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub recorded: usize,
    pub missing: usize,
}

pub struct RecordStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    pending: Mutex<BTreeMap<FileId, PathBuf>>,
    full_rescan: bool,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path)
            .field("full_rescan", &self.full_rescan)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open the store under `base_dir`, creating it empty when it does not exist
    /// yet or when `force_full_rescan` is set.
    #[tracing::instrument(level = "debug")]
    pub fn open(base_dir: &Path, force_full_rescan: bool) -> Result<Self, StoreError> {
        let path = base_dir.join(DATABASE_FILE_NAME);
        let full_rescan = force_full_rescan || !path.exists();

        if full_rescan && path.exists() {
            info!(path = ?path, "Removing the existing record store for a full rescan");
            std::fs::remove_file(&path)?;
        }

        let conn = Connection::open(&path).map_err(|source| StoreError::Connect {
            path: path.clone(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        if full_rescan {
            conn.execute(CREATE_TABLE_QUERY, [])?;
            info!(path = ?path, "Record store prepared for a full run");
        } else {
            verify_schema(&conn, &path)?;
            debug!(path = ?path, "Record store opened");
        }

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            pending: Mutex::new(BTreeMap::new()),
            full_rescan,
        })
    }

    /// True when nothing from previous runs may be trusted
    pub fn is_full_rescan(&self) -> bool {
        self.full_rescan
    }

    /// A read-only connection for one worker unit
    pub fn handle(&self) -> Result<StoreHandle, StoreError> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StoreError::Connect {
            path: self.path.clone(),
            source,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(StoreHandle {
            conn: Mutex::new(conn),
        })
    }

    /// Queue a record for the end-of-run flush.
    ///
    /// The first path queued for an identifier wins; later ones are only logged.
    pub fn enqueue(&self, record: FileRecord) -> Result<(), StoreError> {
        let mut pending = self.pending.lock()?;
        match pending.get(&record.id) {
            Some(existing) if *existing == record.path => {}
            Some(existing) => {
                warn!(
                    id = record.id,
                    queued = ?existing,
                    ignored = ?record.path,
                    "File was written twice in this run, only the first copy is recorded"
                );
            }
            None => {
                debug!(id = record.id, path = ?record.path, "Queued file record");
                pending.insert(record.id, record.path);
            }
        }
        Ok(())
    }

    /// Persist every queued record whose file is still on disk.
    ///
    /// Must run once, after every worker unit has finished.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<FlushReport, StoreError> {
        let pending = std::mem::take(&mut *self.pending.lock()?);
        let mut report = FlushReport::default();

        let mut conn = self.conn.lock()?;
        let tx = conn.transaction()?;
        for (id, path) in pending {
            if !path.exists() {
                warn!(path = ?path, "Queued file no longer exists, it will not be recorded");
                report.missing += 1;
                continue;
            }
            let hash = checksum_file(&path)?;
            insert_record(&tx, &FileRecord { id, path }, hash)?;
            report.recorded += 1;
        }
        tx.commit()?;

        info!(
            recorded = report.recorded,
            missing = report.missing,
            "Record store flushed"
        );
        Ok(report)
    }
}

/// One unit's own connection. The lock is never contended; it only lets the
/// handle be borrowed across await points.
#[derive(Debug)]
pub struct StoreHandle {
    conn: Mutex<Connection>,
}

impl StoreHandle {
    pub fn status(&self, id: FileId) -> Result<FileStatus, StoreError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn.prepare_cached(SELECT_FILE_BY_ID_QUERY)?;
        let mut rows = stmt.query(params![id])?;

        let Some(row) = rows.next()? else {
            return Ok(FileStatus::New);
        };

        let deleted: Option<i64> = row.get(0)?;
        let found: FileId = row.get(1)?;
        if found != id {
            return Err(StoreError::RecordMismatch {
                expected: id,
                found,
            });
        }

        Ok(match deleted {
            Some(flag) if flag != 0 => FileStatus::Deleted,
            _ => FileStatus::Exists,
        })
    }
}

fn verify_schema(conn: &Connection, path: &Path) -> Result<(), StoreError> {
    let columns: Result<Vec<String>, rusqlite::Error> = conn
        .prepare(TABLE_INFO_QUERY)
        .and_then(|mut stmt| {
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect()
        });

    match columns {
        Ok(columns) if columns == EXPECTED_COLUMNS => Ok(()),
        Ok(columns) => {
            warn!(found = ?columns, "Unexpected record store columns");
            Err(StoreError::Corrupt(path.to_path_buf()))
        }
        Err(e) => {
            warn!(error = %e, "Record store schema could not be read");
            Err(StoreError::Corrupt(path.to_path_buf()))
        }
    }
}

fn insert_record(conn: &Connection, record: &FileRecord, hash: u32) -> Result<(), StoreError> {
    let path = record.path.to_string_lossy().into_owned();
    let persist_error = |source: rusqlite::Error| StoreError::Persist {
        path: record.path.clone(),
        source,
    };

    let stale = conn
        .execute(DELETE_STALE_PATH_QUERY, params![path, record.id])
        .map_err(persist_error)?;
    if stale > 0 {
        warn!(
            id = record.id,
            path = ?record.path,
            "Path was recorded under another identifier, replacing the old record"
        );
    }

    let changed = conn
        .execute(INSERT_FILE_QUERY, params![record.id, path, i64::from(hash)])
        .map_err(persist_error)?;

    if changed == 0 {
        return Err(StoreError::DuplicateRecord {
            id: record.id,
            path: record.path.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
impl RecordStore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Record a single file right away. Fails when the identifier is already recorded.
    pub fn insert(&self, record: &FileRecord, hash: u32) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        insert_record(&conn, record, hash)
    }
}
