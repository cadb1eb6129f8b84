//! Profiling Session Example
//!
//! Drives a session the way an interactive front end would: create an
//! experiment, attach to a process, feed the sampled data the backend
//! would deliver, then print a few reports.
//!
//! Run with: cargo run --example profile_session

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use perfex::command::CommandStatus;
use perfex::ingest::{
    AddressBitmap, AddressRange, BackendEvent, FunctionEntry, LinkedObjectInfo, OfflineBackend,
    PerformanceBlob, StatementEntry, SymbolTable, ThreadName,
};
use perfex::{Config, Session};

const APP: &str = "/opt/solver/bin/solver";
const LOAD_ADDRESS: u64 = 0x40_0000;

fn symbols() -> SymbolTable {
    let function = |name: &str, begin: u64, end: u64| FunctionEntry {
        name: name.to_string(),
        ranges: vec![AddressBitmap::full(AddressRange::new(begin, end))],
    };
    let statement = |file: &str, line: u32, begin: u64, end: u64| StatementEntry {
        path: PathBuf::from(file),
        line,
        column: None,
        ranges: vec![AddressBitmap::full(AddressRange::new(begin, end))],
    };
    SymbolTable {
        linked_object: PathBuf::from(APP),
        functions: vec![
            function("main", 0x000, 0x100),
            function("assemble", 0x100, 0x400),
            function("solve", 0x400, 0x900),
        ],
        statements: vec![
            statement("/src/solver/main.c", 18, 0x000, 0x100),
            statement("/src/solver/assemble.c", 72, 0x100, 0x400),
            statement("/src/solver/solve.c", 131, 0x400, 0x900),
        ],
    }
}

fn run(session: &Session, line: &str) -> Result<()> {
    println!("> {line}");
    let command = session.execute_and_wait(line)?;
    let mut stdout = std::io::stdout();
    command
        .print_results(&mut stdout, "  ", "\n")
        .context("writing results")?;
    if command.status() != CommandStatus::Complete {
        bail!("`{line}` finished with status {:?}", command.status());
    }
    println!();
    Ok(())
}

fn main() -> Result<()> {
    perfex::telemetry::init();

    println!("=== perfex Profiling Session ===\n");

    let scratch = tempfile::tempdir().context("creating scratch directory")?;
    let session = Session::builder()
        .config(Config {
            database_dir: Some(scratch.path().to_path_buf()),
            ..Config::default()
        })
        .backend(Arc::new(OfflineBackend::new().with_symbols(symbols())))
        .build()?;

    // -------------------------------------------------------------------------
    // 1. Create an experiment and attach to a running process
    // -------------------------------------------------------------------------
    run(&session, "expCreate pcsamp")?;
    run(&session, "expAttach -x 1 -p 4242 -h node7 pcsamp")?;

    // -------------------------------------------------------------------------
    // 2. Deliver the data a sampling collector would report
    // -------------------------------------------------------------------------
    let sink = session.ingest().sink();
    let threads: Vec<ThreadName> = (0..2)
        .map(|tid| ThreadName::process("node7", 4242).with_tid(tid))
        .collect();
    sink.emit(BackendEvent::ThreadsAttached {
        experiment: 1,
        threads: threads.clone(),
    })?;
    sink.emit(BackendEvent::LinkedObjectLoaded {
        experiment: 1,
        threads: threads.clone(),
        time: 0,
        object: LinkedObjectInfo {
            path: PathBuf::from(APP),
            range: AddressRange::new(LOAD_ADDRESS, LOAD_ADDRESS + 0x1000),
            is_executable: true,
        },
    })?;
    for (thread, weights) in threads.iter().zip([[4, 25, 71], [2, 40, 58]]) {
        let samples = [0x040, 0x200, 0x600]
            .into_iter()
            .zip(weights)
            .map(|(offset, count)| (LOAD_ADDRESS + offset, count))
            .collect();
        sink.emit(BackendEvent::PerformanceDataDelivered {
            experiment: 1,
            blob: PerformanceBlob {
                collector: "pcsamp".to_string(),
                thread: thread.clone(),
                time_begin: 0,
                time_end: 2_000_000_000,
                interval: 10_000_000,
                samples,
            },
        })?;
    }
    session.ingest().flush()?;

    // -------------------------------------------------------------------------
    // 3. Reports
    // -------------------------------------------------------------------------
    run(&session, "listThreads -x 1")?;
    run(&session, "expView -x 1 -v functions pcsamp")?;
    run(&session, "expView -x 1 -v statements pcsamp")?;
    run(&session, "expView -x 1 loadbalance")?;
    run(&session, "expStatus")?;

    // -------------------------------------------------------------------------
    // 4. Save and shut down
    // -------------------------------------------------------------------------
    let saved = scratch.path().join("solver.openss");
    run(&session, &format!("expSave -x 1 -f {}", saved.display()))?;
    run(&session, "exit")?;

    println!("=== Session saved to {} ===", saved.display());
    Ok(())
}
