//! Experiment store - the SQLite database behind one experiment
//!
//! Each experiment owns one database file. Writers (ingestion) and readers
//! (command handlers) open their own connections; concurrency between them is
//! left to SQLite's transactions.
//!
//! ## Schema
//!
//! ```text
//! Threads(id, host, pid, posix_tid?, mpi_rank?)
//! Files(id, path)
//! LinkedObjects(id, addr_begin, addr_end, file, is_executable)
//! Functions(id, linked_object, name)
//! FunctionRanges(function, addr_begin, addr_end, valid_bitmap)
//! Statements(id, linked_object, file, line, column)
//! StatementRanges(statement, addr_begin, addr_end, valid_bitmap)
//! AddressSpaces(thread, time_begin, time_end, addr_begin, addr_end, linked_object)
//! Data(id, collector, thread, time_begin, time_end, addr_begin, addr_end, interval)
//! DataSamples(data, pc, count)
//! ```
//!
//! Addresses and times are unsigned 64-bit values stored bit-for-bit in
//! SQLite's signed integers; see [`encode`] and [`decode`]. An address space
//! that is still mapped has `time_end == OPEN_END`.

use std::fs::OpenOptions;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags};
use tracing::debug;

use super::ExperimentId;
use crate::{Error, Result};

/// Time-end sentinel of an address space that has not been unmapped yet.
pub const OPEN_END: u64 = u64::MAX;

/// Number of candidate names tried for a scratch database.
const MAX_SCRATCH_CANDIDATES: u32 = 1_000;

const SCHEMA_VERSION: i64 = 1;

/// Store a `u64` in an SQLite integer column.
#[must_use]
pub const fn encode(value: u64) -> i64 {
    i64::from_ne_bytes(value.to_ne_bytes())
}

/// Inverse of [`encode`].
#[must_use]
pub const fn decode(value: i64) -> u64 {
    u64::from_ne_bytes(value.to_ne_bytes())
}

/// A monitored thread as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Row id.
    pub id: i64,
    /// Host name.
    pub host: String,
    /// Process id.
    pub pid: i64,
    /// POSIX thread id, once known.
    pub posix_tid: Option<u64>,
    /// MPI rank, for MPI jobs.
    pub mpi_rank: Option<i64>,
}

/// A linked object as recorded in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedObjectRecord {
    /// Row id.
    pub id: i64,
    /// File path.
    pub path: PathBuf,
    /// Size of the object's address range.
    pub size: u64,
    /// True for the main executable.
    pub is_executable: bool,
}

/// Handle to one experiment database file.
#[derive(Debug)]
pub struct ExperimentStore {
    path: PathBuf,
    scratch: bool,
    busy_timeout: Duration,
}

impl ExperimentStore {
    /// Create a scratch database `X<id>.<n>.openss` in `dir`, trying
    /// successive `n` until an unused name is found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if no name is free, the file cannot
    /// be created, or the schema cannot be applied.
    pub fn create_scratch(dir: &Path, id: ExperimentId, busy_timeout: Duration) -> Result<Self> {
        for candidate in 0..MAX_SCRATCH_CANDIDATES {
            let path = dir.join(format!("X{id}.{candidate}.openss"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    let store = Self {
                        path,
                        scratch: true,
                        busy_timeout,
                    };
                    if let Err(err) = store.initialize() {
                        let _ = std::fs::remove_file(&store.path);
                        return Err(err);
                    }
                    return Ok(store);
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => {}
                Err(err) => {
                    return Err(Error::StoreUnavailable(format!(
                        "cannot create {}: {err}",
                        path.display()
                    )));
                }
            }
        }
        Err(Error::StoreUnavailable(format!(
            "no unused database name for experiment {id} in {}",
            dir.display()
        )))
    }

    /// Open (creating if needed) a named database. Named databases are never
    /// removed on close.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub fn open(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<Self> {
        let store = Self {
            path: path.into(),
            scratch: false,
            busy_timeout,
        };
        store.initialize()?;
        Ok(store)
    }

    /// Database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True for generated scratch databases.
    #[must_use]
    pub const fn is_scratch(&self) -> bool {
        self.scratch
    }

    /// Open a new read-write connection with the store's pragmas applied.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot open the file.
    pub fn connect(&self) -> Result<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(&self.path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = wal;")?;
        connection.execute_batch("PRAGMA synchronous = normal;")?;
        connection.busy_timeout(self.busy_timeout)?;
        Ok(connection)
    }

    fn initialize(&self) -> Result<()> {
        let unavailable =
            |err: rusqlite::Error| Error::StoreUnavailable(format!("{}: {err}", self.path.display()));
        let mut connection = self.connect().map_err(|err| match err {
            Error::Store(inner) => unavailable(inner),
            other => other,
        })?;
        initialize_schema(&mut connection).map_err(unavailable)?;
        debug!(path = %self.path.display(), "experiment store ready");
        Ok(())
    }

    /// Copy the database to `destination` using SQLite's online backup.
    ///
    /// # Errors
    ///
    /// Returns an error if either database cannot be opened or the copy fails.
    pub fn save_as(&self, destination: &Path) -> Result<()> {
        let source = self.connect()?;
        let mut target = Connection::open(destination)?;
        let backup = Backup::new(&source, &mut target)?;
        backup.run_to_completion(256, Duration::from_millis(5), None)?;
        Ok(())
    }

    /// Delete the database file and its WAL side files.
    ///
    /// # Errors
    ///
    /// Returns an error if the main file exists but cannot be removed.
    pub fn remove(&self) -> Result<()> {
        for suffix in ["-wal", "-shm"] {
            let mut side = self.path.clone().into_os_string();
            side.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(side));
        }
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != IoErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Read-only lookups
    // ========================================================================

    /// Every monitored thread, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn threads(&self) -> Result<Vec<ThreadRecord>> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare("SELECT id, host, pid, posix_tid, mpi_rank FROM Threads ORDER BY id")?;
        let rows = statement.query_map(params![], |row| {
            Ok(ThreadRecord {
                id: row.get(0)?,
                host: row.get(1)?,
                pid: row.get(2)?,
                posix_tid: row.get::<_, Option<i64>>(3)?.map(decode),
                mpi_rank: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every linked object, ordered by path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn linked_objects(&self) -> Result<Vec<LinkedObjectRecord>> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(
            "SELECT l.id, f.path, l.addr_begin, l.addr_end, l.is_executable
             FROM LinkedObjects l JOIN Files f ON l.file = f.id
             ORDER BY f.path",
        )?;
        let rows = statement.query_map(params![], |row| {
            let begin: i64 = row.get(2)?;
            let end: i64 = row.get(3)?;
            Ok(LinkedObjectRecord {
                id: row.get(0)?,
                path: PathBuf::from(row.get::<_, String>(1)?),
                size: decode(end).wrapping_sub(decode(begin)),
                is_executable: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Names of collectors that delivered data.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn collectors_with_data(&self) -> Result<Vec<String>> {
        let connection = self.connect()?;
        let mut statement =
            connection.prepare("SELECT DISTINCT collector FROM Data ORDER BY collector")?;
        let rows = statement.query_map(params![], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Create all tables in one transaction.
fn initialize_schema(connection: &mut Connection) -> rusqlite::Result<()> {
    let tx = connection.transaction()?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS Threads (
            id INTEGER PRIMARY KEY,
            host TEXT NOT NULL,
            pid INTEGER NOT NULL,
            posix_tid INTEGER,
            mpi_rank INTEGER
        );
        CREATE TABLE IF NOT EXISTS Files (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS LinkedObjects (
            id INTEGER PRIMARY KEY,
            addr_begin INTEGER NOT NULL,
            addr_end INTEGER NOT NULL,
            file INTEGER NOT NULL REFERENCES Files(id),
            is_executable INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS Functions (
            id INTEGER PRIMARY KEY,
            linked_object INTEGER NOT NULL REFERENCES LinkedObjects(id),
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS FunctionRanges (
            function INTEGER NOT NULL REFERENCES Functions(id),
            addr_begin INTEGER NOT NULL,
            addr_end INTEGER NOT NULL,
            valid_bitmap BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS Statements (
            id INTEGER PRIMARY KEY,
            linked_object INTEGER NOT NULL REFERENCES LinkedObjects(id),
            file INTEGER NOT NULL REFERENCES Files(id),
            line INTEGER NOT NULL,
            \"column\" INTEGER
        );
        CREATE TABLE IF NOT EXISTS StatementRanges (
            statement INTEGER NOT NULL REFERENCES Statements(id),
            addr_begin INTEGER NOT NULL,
            addr_end INTEGER NOT NULL,
            valid_bitmap BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS AddressSpaces (
            thread INTEGER NOT NULL REFERENCES Threads(id),
            time_begin INTEGER NOT NULL,
            time_end INTEGER NOT NULL,
            addr_begin INTEGER NOT NULL,
            addr_end INTEGER NOT NULL,
            linked_object INTEGER NOT NULL REFERENCES LinkedObjects(id)
        );
        CREATE TABLE IF NOT EXISTS Data (
            id INTEGER PRIMARY KEY,
            collector TEXT NOT NULL,
            thread INTEGER NOT NULL REFERENCES Threads(id),
            time_begin INTEGER NOT NULL,
            time_end INTEGER NOT NULL,
            addr_begin INTEGER NOT NULL,
            addr_end INTEGER NOT NULL,
            interval INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS DataSamples (
            data INTEGER NOT NULL REFERENCES Data(id),
            pc INTEGER NOT NULL,
            count INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_threads_host_pid ON Threads (host, pid);
        CREATE INDEX IF NOT EXISTS idx_files_path ON Files (path);
        CREATE INDEX IF NOT EXISTS idx_address_spaces_thread ON AddressSpaces (thread);
        CREATE INDEX IF NOT EXISTS idx_functions_linked_object ON Functions (linked_object);
        CREATE INDEX IF NOT EXISTS idx_statements_linked_object ON Statements (linked_object);
        CREATE INDEX IF NOT EXISTS idx_data_samples_data ON DataSamples (data);",
    )?;
    let version: i64 = tx.query_row("SELECT COUNT(*) FROM store_meta", params![], |row| row.get(0))?;
    if version == 0 {
        tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
    }
    tx.commit()
}
