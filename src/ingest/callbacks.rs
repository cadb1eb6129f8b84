//! Store writes for backend events
//!
//! Every entry point runs in one immediate write transaction and looks rows
//! up by their natural key before inserting, so replaying an event leaves the
//! store unchanged.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::events::{LinkedObjectInfo, PerformanceBlob, SymbolTable, ThreadName};
use crate::experiment::{decode, encode, OPEN_END};
use crate::Result;

fn write<T, F>(connection: &mut Connection, body: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = body(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Threads
// ============================================================================

/// Row of the thread named exactly `name`. A name without a thread id matches
/// the process placeholder first, then the oldest thread of that process.
fn find_thread(connection: &Connection, name: &ThreadName) -> Result<Option<i64>> {
    let id = match name.posix_tid {
        Some(tid) => connection
            .query_row(
                "SELECT id FROM Threads WHERE host = ?1 AND pid = ?2 AND posix_tid = ?3",
                params![name.host, name.pid, encode(tid)],
                |row| row.get(0),
            )
            .optional()?,
        None => connection
            .query_row(
                "SELECT id FROM Threads WHERE host = ?1 AND pid = ?2
                 ORDER BY posix_tid IS NOT NULL, id LIMIT 1",
                params![name.host, name.pid],
                |row| row.get(0),
            )
            .optional()?,
    };
    Ok(id)
}

fn resolve_thread(connection: &Connection, name: &ThreadName) -> Result<i64> {
    if let Some(id) = find_thread(connection, name)? {
        if name.mpi_rank.is_some() {
            connection.execute(
                "UPDATE Threads SET mpi_rank = ?1 WHERE id = ?2",
                params![name.mpi_rank, id],
            )?;
        }
        return Ok(id);
    }

    // A placeholder for the whole process takes the first thread id reported.
    let placeholder: Option<i64> = connection
        .query_row(
            "SELECT id FROM Threads WHERE host = ?1 AND pid = ?2 AND posix_tid IS NULL",
            params![name.host, name.pid],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = placeholder {
        connection.execute(
            "UPDATE Threads SET posix_tid = ?1, mpi_rank = COALESCE(?2, mpi_rank) WHERE id = ?3",
            params![name.posix_tid.map(encode), name.mpi_rank, id],
        )?;
        return Ok(id);
    }

    connection.execute(
        "INSERT INTO Threads (host, pid, posix_tid, mpi_rank) VALUES (?1, ?2, ?3, ?4)",
        params![name.host, name.pid, name.posix_tid.map(encode), name.mpi_rank],
    )?;
    let id = connection.last_insert_rowid();
    debug!(thread = id, host = %name.host, pid = name.pid, "thread recorded");
    Ok(id)
}

/// Record attached threads, returning their row ids in input order.
///
/// # Errors
///
/// Returns an error if a statement fails; nothing is written in that case.
pub fn threads_attached(connection: &mut Connection, threads: &[ThreadName]) -> Result<Vec<i64>> {
    write(connection, |tx| {
        threads.iter().map(|name| resolve_thread(tx, name)).collect()
    })
}

/// Move a process placeholder to the pid the process was actually created
/// with, or record the created process if there is no placeholder.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn process_created(
    connection: &mut Connection,
    original: &ThreadName,
    created: &ThreadName,
) -> Result<i64> {
    write(connection, |tx| {
        let placeholder: Option<i64> = tx
            .query_row(
                "SELECT id FROM Threads WHERE host = ?1 AND pid = ?2 AND posix_tid IS NULL",
                params![original.host, original.pid],
                |row| row.get(0),
            )
            .optional()?;
        match placeholder {
            Some(id) => {
                tx.execute(
                    "UPDATE Threads SET host = ?1, pid = ?2 WHERE id = ?3",
                    params![created.host, created.pid, id],
                )?;
                Ok(id)
            }
            None => resolve_thread(tx, created),
        }
    })
}

// ============================================================================
// Linked objects and address spaces
// ============================================================================

fn find_file(connection: &Connection, path: &Path) -> Result<Option<i64>> {
    Ok(connection
        .query_row(
            "SELECT id FROM Files WHERE path = ?1",
            params![path_text(path)],
            |row| row.get(0),
        )
        .optional()?)
}

fn resolve_file(connection: &Connection, path: &Path) -> Result<i64> {
    if let Some(id) = find_file(connection, path)? {
        return Ok(id);
    }
    connection.execute("INSERT INTO Files (path) VALUES (?1)", params![path_text(path)])?;
    Ok(connection.last_insert_rowid())
}

fn find_linked_object(connection: &Connection, path: &Path) -> Result<Option<i64>> {
    Ok(connection
        .query_row(
            "SELECT l.id FROM LinkedObjects l JOIN Files f ON l.file = f.id WHERE f.path = ?1",
            params![path_text(path)],
            |row| row.get(0),
        )
        .optional()?)
}

/// Linked objects are stored relative to their load address: `[0, size)`.
fn resolve_linked_object(connection: &Connection, object: &LinkedObjectInfo) -> Result<i64> {
    if let Some(id) = find_linked_object(connection, &object.path)? {
        return Ok(id);
    }
    let file = resolve_file(connection, &object.path)?;
    connection.execute(
        "INSERT INTO LinkedObjects (addr_begin, addr_end, file, is_executable)
         VALUES (0, ?1, ?2, ?3)",
        params![encode(object.range.size()), file, object.is_executable],
    )?;
    Ok(connection.last_insert_rowid())
}

struct SpaceRow {
    rowid: i64,
    time_begin: u64,
    time_end: u64,
    addr_begin: u64,
    addr_end: u64,
    linked_object: i64,
}

fn spaces_of(connection: &Connection, thread: i64) -> Result<Vec<SpaceRow>> {
    let mut statement = connection.prepare(
        "SELECT rowid, time_begin, time_end, addr_begin, addr_end, linked_object
         FROM AddressSpaces WHERE thread = ?1",
    )?;
    let rows = statement.query_map(params![thread], |row| {
        Ok(SpaceRow {
            rowid: row.get(0)?,
            time_begin: decode(row.get(1)?),
            time_end: decode(row.get(2)?),
            addr_begin: decode(row.get(3)?),
            addr_end: decode(row.get(4)?),
            linked_object: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Map `object` into `thread` at `time`. Open mappings it overlaps end at
/// `time`. Returns false if this exact mapping is already recorded.
fn map_object(
    connection: &Connection,
    thread: i64,
    time: u64,
    object: &LinkedObjectInfo,
) -> Result<bool> {
    let linked_object = resolve_linked_object(connection, object)?;
    let spaces = spaces_of(connection, thread)?;
    let duplicate = spaces.iter().any(|s| {
        s.linked_object == linked_object
            && s.time_begin == time
            && s.addr_begin == object.range.begin
            && s.addr_end == object.range.end
    });
    if duplicate {
        return Ok(false);
    }

    for space in spaces.iter().filter(|s| {
        s.time_end == OPEN_END
            && s.time_begin <= time
            && s.addr_begin < object.range.end
            && object.range.begin < s.addr_end
    }) {
        connection.execute(
            "UPDATE AddressSpaces SET time_end = ?1 WHERE rowid = ?2",
            params![encode(time), space.rowid],
        )?;
    }

    connection.execute(
        "INSERT INTO AddressSpaces
         (thread, time_begin, time_end, addr_begin, addr_end, linked_object)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            thread,
            encode(time),
            encode(OPEN_END),
            encode(object.range.begin),
            encode(object.range.end),
            linked_object
        ],
    )?;
    Ok(true)
}

/// Record `object` as loaded into each of `threads` at `time`.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn linked_object_loaded(
    connection: &mut Connection,
    threads: &[ThreadName],
    time: u64,
    object: &LinkedObjectInfo,
) -> Result<()> {
    write(connection, |tx| {
        for name in threads {
            let thread = resolve_thread(tx, name)?;
            if map_object(tx, thread, time, object)? {
                debug!(thread, object = %object.path.display(), "linked object mapped");
            }
        }
        Ok(())
    })
}

/// Record a thread's initial set of linked objects.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn linked_object_group_loaded(
    connection: &mut Connection,
    thread: &ThreadName,
    time: u64,
    objects: &[LinkedObjectInfo],
) -> Result<()> {
    write(connection, |tx| {
        let thread = resolve_thread(tx, thread)?;
        for object in objects {
            map_object(tx, thread, time, object)?;
        }
        debug!(thread, count = objects.len(), "linked object group mapped");
        Ok(())
    })
}

/// Close the open mappings of `path` in `threads` at `time`. Unknown threads
/// and objects are skipped.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn linked_object_unloaded(
    connection: &mut Connection,
    threads: &[ThreadName],
    time: u64,
    path: &Path,
) -> Result<()> {
    write(connection, |tx| {
        let Some(linked_object) = find_linked_object(tx, path)? else {
            warn!(object = %path.display(), "unload of unknown linked object");
            return Ok(());
        };
        for name in threads {
            let Some(thread) = find_thread(tx, name)? else {
                warn!(host = %name.host, pid = name.pid, "unload in unknown thread");
                continue;
            };
            tx.execute(
                "UPDATE AddressSpaces SET time_end = ?1
                 WHERE thread = ?2 AND linked_object = ?3 AND time_end = ?4",
                params![encode(time), thread, linked_object, encode(OPEN_END)],
            )?;
        }
        Ok(())
    })
}

// ============================================================================
// Symbols
// ============================================================================

fn count_rows(connection: &Connection, table: &str, linked_object: i64) -> Result<i64> {
    Ok(connection.query_row(
        &format!("SELECT COUNT(*) FROM {table} WHERE linked_object = ?1"),
        params![linked_object],
        |row| row.get(0),
    )?)
}

/// Store a symbol table. Functions and statements already present for the
/// linked object are kept as they are. Returns false if the linked object is
/// unknown.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn symbol_table_delivered(connection: &mut Connection, table: &SymbolTable) -> Result<bool> {
    write(connection, |tx| {
        let Some(linked_object) = find_linked_object(tx, &table.linked_object)? else {
            warn!(object = %table.linked_object.display(), "symbols for unknown linked object");
            return Ok(false);
        };

        if count_rows(tx, "Functions", linked_object)? == 0 {
            let mut insert_function =
                tx.prepare("INSERT INTO Functions (linked_object, name) VALUES (?1, ?2)")?;
            let mut insert_range = tx.prepare(
                "INSERT INTO FunctionRanges (function, addr_begin, addr_end, valid_bitmap)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for function in &table.functions {
                let id = insert_function.insert(params![linked_object, function.name])?;
                for range in &function.ranges {
                    insert_range.execute(params![
                        id,
                        encode(range.range.begin),
                        encode(range.range.end),
                        range.bitmap
                    ])?;
                }
            }
        }

        if count_rows(tx, "Statements", linked_object)? == 0 {
            let mut insert_statement = tx.prepare(
                "INSERT INTO Statements (linked_object, file, line, \"column\")
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let mut insert_range = tx.prepare(
                "INSERT INTO StatementRanges (statement, addr_begin, addr_end, valid_bitmap)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for statement in &table.statements {
                let file = resolve_file(tx, &statement.path)?;
                let id = insert_statement.insert(params![
                    linked_object,
                    file,
                    statement.line,
                    statement.column
                ])?;
                for range in &statement.ranges {
                    insert_range.execute(params![
                        id,
                        encode(range.range.begin),
                        encode(range.range.end),
                        range.bitmap
                    ])?;
                }
            }
        }

        debug!(
            linked_object,
            functions = table.functions.len(),
            statements = table.statements.len(),
            "symbols stored"
        );
        Ok(true)
    })
}

// ============================================================================
// Performance data
// ============================================================================

/// Store a block of samples. Returns the linked objects that contain at least
/// one sampled address and have no symbols yet.
///
/// # Errors
///
/// Returns an error if a statement fails.
pub fn performance_data_delivered(
    connection: &mut Connection,
    blob: &PerformanceBlob,
) -> Result<Vec<PathBuf>> {
    write(connection, |tx| {
        let thread = resolve_thread(tx, &blob.thread)?;
        let addr_begin = blob.samples.iter().map(|&(pc, _)| pc).min().unwrap_or(0);
        let addr_end = blob
            .samples
            .iter()
            .map(|&(pc, _)| pc.saturating_add(1))
            .max()
            .unwrap_or(0);
        tx.execute(
            "INSERT INTO Data
             (collector, thread, time_begin, time_end, addr_begin, addr_end, interval)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                blob.collector,
                thread,
                encode(blob.time_begin),
                encode(blob.time_end),
                encode(addr_begin),
                encode(addr_end),
                encode(blob.interval)
            ],
        )?;
        let data = tx.last_insert_rowid();
        let mut insert_sample =
            tx.prepare("INSERT INTO DataSamples (data, pc, count) VALUES (?1, ?2, ?3)")?;
        for &(pc, count) in &blob.samples {
            insert_sample.execute(params![data, encode(pc), encode(count)])?;
        }
        debug!(
            thread,
            collector = %blob.collector,
            buckets = blob.samples.len(),
            "performance data stored"
        );

        let spaces = spaces_of(tx, thread)?;
        let sampled: FxHashSet<i64> = blob
            .samples
            .iter()
            .filter_map(|&(pc, _)| {
                spaces
                    .iter()
                    .find(|s| {
                        s.time_begin <= blob.time_begin
                            && blob.time_begin < s.time_end
                            && s.addr_begin <= pc
                            && pc < s.addr_end
                    })
                    .map(|s| s.linked_object)
            })
            .collect();

        let mut unresolved = Vec::new();
        for linked_object in sampled {
            if count_rows(tx, "Functions", linked_object)? == 0 {
                let path: String = tx.query_row(
                    "SELECT f.path FROM LinkedObjects l JOIN Files f ON l.file = f.id
                     WHERE l.id = ?1",
                    params![linked_object],
                    |row| row.get(0),
                )?;
                unresolved.push(PathBuf::from(path));
            }
        }
        unresolved.sort();
        Ok(unresolved)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentStore;
    use crate::ingest::events::{AddressBitmap, AddressRange, FunctionEntry};
    use std::time::Duration;

    fn store(dir: &Path) -> ExperimentStore {
        ExperimentStore::create_scratch(dir, 1, Duration::from_millis(500)).unwrap()
    }

    fn count(connection: &Connection, table: &str) -> i64 {
        connection
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn libc() -> LinkedObjectInfo {
        LinkedObjectInfo {
            path: PathBuf::from("/lib/libc.so.6"),
            range: AddressRange::new(0x7000_0000, 0x7010_0000),
            is_executable: false,
        }
    }

    #[test]
    fn test_placeholder_takes_first_tid() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let process = ThreadName::process("node1", 100);
        let ids = threads_attached(&mut conn, &[process.clone()]).unwrap();
        let first = threads_attached(&mut conn, &[process.clone().with_tid(1)]).unwrap();
        let second = threads_attached(&mut conn, &[process.with_tid(2)]).unwrap();
        assert_eq!(ids, first);
        assert_ne!(first, second);
        assert_eq!(count(&conn, "Threads"), 2);
    }

    #[test]
    fn test_threads_attached_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let thread = ThreadName::process("node1", 100).with_tid(9).with_rank(3);
        let a = threads_attached(&mut conn, &[thread.clone()]).unwrap();
        let b = threads_attached(&mut conn, &[thread]).unwrap();
        assert_eq!(a, b);
        assert_eq!(count(&conn, "Threads"), 1);
    }

    #[test]
    fn test_process_created_rebinds_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut conn = s.connect().unwrap();
        let placeholder = ThreadName::process("node1", -1);
        threads_attached(&mut conn, &[placeholder.clone()]).unwrap();
        process_created(&mut conn, &placeholder, &ThreadName::process("node1", 4242)).unwrap();
        let threads = s.threads().unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].pid, 4242);
    }

    #[test]
    fn test_load_supersedes_overlapping_open_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let thread = ThreadName::process("node1", 100);
        linked_object_loaded(&mut conn, &[thread.clone()], 10, &libc()).unwrap();
        let replacement = LinkedObjectInfo {
            path: PathBuf::from("/lib/libm.so.6"),
            range: AddressRange::new(0x7008_0000, 0x7020_0000),
            is_executable: false,
        };
        linked_object_loaded(&mut conn, &[thread], 50, &replacement).unwrap();

        let ends: Vec<i64> = conn
            .prepare("SELECT time_end FROM AddressSpaces ORDER BY time_begin")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ends, vec![50, encode(OPEN_END)]);
    }

    #[test]
    fn test_unload_closes_open_space() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let thread = ThreadName::process("node1", 100);
        linked_object_loaded(&mut conn, &[thread.clone()], 10, &libc()).unwrap();
        linked_object_unloaded(&mut conn, &[thread], 99, Path::new("/lib/libc.so.6")).unwrap();
        let end: i64 = conn
            .query_row("SELECT time_end FROM AddressSpaces", [], |row| row.get(0))
            .unwrap();
        assert_eq!(end, 99);
    }

    #[test]
    fn test_symbols_for_unknown_object_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let table = SymbolTable {
            linked_object: PathBuf::from("/nowhere.so"),
            ..SymbolTable::default()
        };
        assert!(!symbol_table_delivered(&mut conn, &table).unwrap());
    }

    #[test]
    fn test_symbols_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        linked_object_loaded(&mut conn, &[ThreadName::process("n", 1)], 0, &libc()).unwrap();
        let table = SymbolTable {
            linked_object: PathBuf::from("/lib/libc.so.6"),
            functions: vec![FunctionEntry {
                name: "memcpy".into(),
                ranges: vec![AddressBitmap::full(AddressRange::new(0x100, 0x200))],
            }],
            statements: vec![],
        };
        assert!(symbol_table_delivered(&mut conn, &table).unwrap());
        assert!(symbol_table_delivered(&mut conn, &table).unwrap());
        assert_eq!(count(&conn, "Functions"), 1);
        assert_eq!(count(&conn, "FunctionRanges"), 1);
    }

    #[test]
    fn test_performance_data_reports_unresolved_objects() {
        let dir = tempfile::tempdir().unwrap();
        let mut conn = store(dir.path()).connect().unwrap();
        let thread = ThreadName::process("node1", 100);
        linked_object_loaded(&mut conn, &[thread.clone()], 0, &libc()).unwrap();
        let blob = PerformanceBlob {
            collector: "pcsamp".into(),
            thread,
            time_begin: 5,
            time_end: 10,
            interval: 10_000_000,
            samples: vec![(0x7000_0150, 3), (0x1234, 1)],
        };
        let unresolved = performance_data_delivered(&mut conn, &blob).unwrap();
        assert_eq!(unresolved, vec![PathBuf::from("/lib/libc.so.6")]);
        assert_eq!(count(&conn, "Data"), 1);
        assert_eq!(count(&conn, "DataSamples"), 2);
    }
}
