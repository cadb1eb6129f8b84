//! Ingestion tests: backend events flowing into stores and out through views

use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use perfex::command::{
    CommandContext, CommandHandler, CommandKind, CommandObject, CommandStatus, HandlerTable,
};
use perfex::experiment::{ExperimentStore, Granularity};
use perfex::ingest::{
    callbacks, AddressBitmap, AddressRange, BackendEvent, FunctionEntry, LinkedObjectInfo,
    OfflineBackend, PerformanceBlob, StatementEntry, SymbolTable, ThreadName,
};
use perfex::result::{ResultValue, Row};
use perfex::view::{find_view, Cancellation, SUMMARY_LABEL};
use perfex::{Config, Session};
use tempfile::TempDir;

const APP: &str = "/opt/bench/bin/app";
const LOAD_ADDRESS: u64 = 0x1000;
const INTERVAL_NS: u64 = 10_000_000;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn app_object() -> LinkedObjectInfo {
    LinkedObjectInfo {
        path: PathBuf::from(APP),
        range: AddressRange::new(LOAD_ADDRESS, LOAD_ADDRESS + 0x1000),
        is_executable: true,
    }
}

fn app_symbols() -> SymbolTable {
    SymbolTable {
        linked_object: PathBuf::from(APP),
        functions: vec![
            FunctionEntry {
                name: "main".into(),
                ranges: vec![AddressBitmap::full(AddressRange::new(0x0, 0x100))],
            },
            FunctionEntry {
                name: "solve".into(),
                ranges: vec![AddressBitmap::full(AddressRange::new(0x400, 0x600))],
            },
        ],
        statements: vec![
            StatementEntry {
                path: PathBuf::from("/src/main.c"),
                line: 12,
                column: None,
                ranges: vec![AddressBitmap::full(AddressRange::new(0x0, 0x100))],
            },
            StatementEntry {
                path: PathBuf::from("/src/solve.c"),
                line: 40,
                column: Some(5),
                ranges: vec![AddressBitmap::full(AddressRange::new(0x400, 0x600))],
            },
        ],
    }
}

fn thread(pid: i64) -> ThreadName {
    ThreadName::process("node1", pid)
}

fn blob(thread: ThreadName, samples: Vec<(u64, u64)>) -> PerformanceBlob {
    PerformanceBlob {
        collector: "pcsamp".into(),
        thread,
        time_begin: 10,
        time_end: 20,
        interval: INTERVAL_NS,
        samples,
    }
}

fn session_with(dir: &TempDir, handlers: HandlerTable) -> Session {
    Session::builder()
        .config(Config {
            database_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        })
        .backend(Arc::new(OfflineBackend::new().with_symbols(app_symbols())))
        .handlers(handlers)
        .build()
        .unwrap()
}

fn session(dir: &TempDir) -> Session {
    session_with(dir, HandlerTable::builtin())
}

/// Create experiment 1, attach to pid 100 and deliver one block of samples.
fn profile(session: &Session) {
    session.execute_and_wait("expCreate pcsamp").unwrap();
    session
        .execute_and_wait("expAttach -x 1 -p 100 -h node1 pcsamp")
        .unwrap();

    let sink = session.ingest().sink();
    sink.emit(BackendEvent::LinkedObjectLoaded {
        experiment: 1,
        threads: vec![thread(100)],
        time: 0,
        object: app_object(),
    })
    .unwrap();
    sink.emit(BackendEvent::PerformanceDataDelivered {
        experiment: 1,
        blob: blob(
            thread(100),
            vec![(LOAD_ADDRESS + 0x10, 30), (LOAD_ADDRESS + 0x500, 10)],
        ),
    })
    .unwrap();
    session.ingest().flush().unwrap();
}

fn profiled_session(dir: &TempDir) -> Session {
    let session = session(dir);
    profile(&session);
    session
}

fn rows(results: &[ResultValue]) -> Vec<&Row> {
    results
        .iter()
        .filter_map(|value| match value {
            ResultValue::ColumnRow(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn float(value: &ResultValue) -> f64 {
    value.as_f64().unwrap()
}

fn address_space_count(store: &ExperimentStore) -> i64 {
    store
        .connect()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM AddressSpaces", [], |row| row.get(0))
        .unwrap()
}

// ============================================================================
// Callbacks
// ============================================================================

#[test]
fn test_linked_object_loaded_twice_is_stored_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperimentStore::create_scratch(dir.path(), 1, BUSY_TIMEOUT).unwrap();
    let mut connection = store.connect().unwrap();

    callbacks::threads_attached(&mut connection, &[thread(100)]).unwrap();
    for _ in 0..2 {
        callbacks::linked_object_loaded(&mut connection, &[thread(100)], 0, &app_object())
            .unwrap();
    }

    assert_eq!(address_space_count(&store), 1);
    assert_eq!(store.linked_objects().unwrap().len(), 1);
    assert_eq!(store.threads().unwrap().len(), 1);
}

#[test]
fn test_threads_attached_fills_in_tid_and_rank() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperimentStore::create_scratch(dir.path(), 1, BUSY_TIMEOUT).unwrap();
    let mut connection = store.connect().unwrap();

    callbacks::threads_attached(&mut connection, &[thread(100)]).unwrap();
    callbacks::threads_attached(&mut connection, &[thread(100).with_tid(7).with_rank(3)])
        .unwrap();

    let threads = store.threads().unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].posix_tid, Some(7));
    assert_eq!(threads[0].mpi_rank, Some(3));
}

#[test]
fn test_samples_after_unload_are_not_attributed() {
    let dir = tempfile::tempdir().unwrap();
    let store = ExperimentStore::create_scratch(dir.path(), 1, BUSY_TIMEOUT).unwrap();
    let mut connection = store.connect().unwrap();

    callbacks::linked_object_loaded(&mut connection, &[thread(100)], 0, &app_object()).unwrap();
    callbacks::linked_object_unloaded(&mut connection, &[thread(100)], 5, &PathBuf::from(APP))
        .unwrap();
    callbacks::performance_data_delivered(
        &mut connection,
        &blob(thread(100), vec![(LOAD_ADDRESS + 0x10, 30)]),
    )
    .unwrap();

    let buckets = store
        .sample_buckets("pcsamp", Granularity::LinkedObjects)
        .unwrap();
    assert!(buckets.is_empty());
}

// ============================================================================
// Service
// ============================================================================

#[test]
fn test_symbols_are_fetched_for_sampled_objects() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);

    let experiment = session.registry().find(1).unwrap();
    let buckets = experiment
        .store()
        .sample_buckets("pcsamp", Granularity::Functions)
        .unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(experiment.collectors(), vec!["pcsamp".to_string()]);
}

#[test]
fn test_events_after_close_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let session = session(&dir);
    session.execute_and_wait("expCreate pcsamp").unwrap();
    session.execute_and_wait("expClose -x 1").unwrap();

    session
        .ingest()
        .sink()
        .emit(BackendEvent::ThreadsAttached {
            experiment: 1,
            threads: vec![thread(1)],
        })
        .unwrap();
    session.ingest().flush().unwrap();
    assert!(session.registry().is_empty());
}

// ============================================================================
// Views over ingested data
// ============================================================================

#[test]
fn test_pcsamp_view_by_function() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);

    let view = session
        .execute_and_wait("expView -x 1 -v functions pcsamp")
        .unwrap();
    assert_eq!(view.status(), CommandStatus::Complete);
    let results = view.results();
    assert!(matches!(results[0], ResultValue::HeaderRow(_)));

    let rows = rows(&results);
    assert_eq!(rows.len(), 2);
    let main = rows[0].cells();
    assert!((float(&main[0]) - 0.3).abs() < 1e-9);
    assert!((float(&main[1]) - 75.0).abs() < 1e-9);
    assert_eq!(main[2], ResultValue::UnsignedInt(30));
    match &main[3] {
        ResultValue::FunctionRef(function) => {
            assert_eq!(function.name(), "main");
            assert_eq!(function.definitions()[0].line, 12);
        }
        other => panic!("expected a function key, got {other:?}"),
    }

    let ResultValue::SummaryRow(summary) = results.last().unwrap() else {
        panic!("missing summary row");
    };
    let summary = summary.cells();
    assert!((float(&summary[0]) - 0.4).abs() < 1e-9);
    assert!((float(&summary[1]) - 100.0).abs() < 1e-9);
    assert_eq!(summary[2], ResultValue::UnsignedInt(40));
    assert_eq!(summary[3], ResultValue::from(SUMMARY_LABEL));
}

#[test]
fn test_pcsamp_view_by_statement_and_object() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);

    let statements = session
        .execute_and_wait("expView -x 1 -v statements")
        .unwrap();
    let results = statements.results();
    let rows = rows(&results);
    match &rows[1].cells()[3] {
        ResultValue::StatementRef(statement) => {
            assert_eq!(statement.line(), 40);
            assert_eq!(statement.column(), Some(5));
        }
        other => panic!("expected a statement key, got {other:?}"),
    }

    let objects = session
        .execute_and_wait("expView -x 1 -v linkedobjects")
        .unwrap();
    let results = objects.results();
    let rows = self::rows(&results);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].cells()[2], ResultValue::UnsignedInt(40));
}

#[test]
fn test_loadbalance_across_threads() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);
    let sink = session.ingest().sink();
    sink.emit(BackendEvent::LinkedObjectLoaded {
        experiment: 1,
        threads: vec![thread(200)],
        time: 0,
        object: app_object(),
    })
    .unwrap();
    sink.emit(BackendEvent::PerformanceDataDelivered {
        experiment: 1,
        blob: blob(thread(200), vec![(LOAD_ADDRESS + 0x20, 10)]),
    })
    .unwrap();
    session.ingest().flush().unwrap();

    let view = session
        .execute_and_wait("expView -x 1 loadbalance")
        .unwrap();
    let results = view.results();
    let rows = rows(&results);
    // main: 0.3 s in pid 100 and 0.1 s in pid 200
    let main = rows[0].cells();
    assert!((float(&main[0]) - 0.2).abs() < 1e-9);
    assert!((float(&main[1]) - 0.1).abs() < 1e-9);
    assert!((float(&main[2]) - 0.1).abs() < 1e-9);
    assert!((float(&main[3]) - 0.3).abs() < 1e-9);
    assert!((float(&main[4]) - 0.4).abs() < 1e-9);
    assert!((float(&main[5]) - 80.0).abs() < 1e-9);
}

#[test]
fn test_list_commands_after_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);

    let threads = session.execute_and_wait("listThreads -x 1").unwrap();
    assert_eq!(threads.results(), vec![ResultValue::String("node1:100".into())]);

    let objects = session.execute_and_wait("listObj -x 1").unwrap();
    assert_eq!(objects.results(), vec![ResultValue::String(APP.into())]);
}

// ============================================================================
// Cancellation
// ============================================================================

/// Fires once it has been polled `rows` times.
struct CancelAfter {
    rows: usize,
    polls: Cell<usize>,
}

impl Cancellation for CancelAfter {
    fn is_cancelled(&self) -> bool {
        let polls = self.polls.get();
        self.polls.set(polls + 1);
        polls >= self.rows
    }
}

#[test]
fn test_cancelled_view_keeps_header_and_completed_rows() {
    let dir = tempfile::tempdir().unwrap();
    let session = profiled_session(&dir);
    let experiment = session.registry().find(1).unwrap();
    let view = find_view("pcsamp").unwrap();

    let cancel = CancelAfter {
        rows: 1,
        polls: Cell::new(0),
    };
    let results = view
        .generate(experiment.store(), Granularity::Functions, &cancel)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0], ResultValue::HeaderRow(_)));
    assert!(matches!(results[1], ResultValue::ColumnRow(_)));

    let cancel = CancelAfter {
        rows: 0,
        polls: Cell::new(0),
    };
    let results = view
        .generate(experiment.store(), Granularity::Functions, &cancel)
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_view_aborted_before_first_row_reports_abort() {
    let dir = tempfile::tempdir().unwrap();
    let builtin = HandlerTable::builtin();
    let mut handlers = HandlerTable::builtin();
    handlers.register(
        CommandKind::ExpView,
        move |ctx: &CommandContext<'_>, command: &CommandObject| {
            command.abort();
            builtin
                .get(CommandKind::ExpView)
                .unwrap()
                .execute(ctx, command)
        },
    );
    let session = session_with(&dir, handlers);
    profile(&session);

    let view = session.execute_and_wait("expView -x 1 pcsamp").unwrap();
    assert_eq!(view.status(), CommandStatus::Aborted);
    assert_eq!(
        view.results(),
        vec![ResultValue::RawString("Command aborted".into())]
    );
}
