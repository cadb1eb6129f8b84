//! Messages delivered by instrumentation backends

use std::path::PathBuf;
use std::sync::mpsc::SyncSender;

use serde::{Deserialize, Serialize};

use crate::experiment::ExperimentId;

/// Natural key of a monitored thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadName {
    /// Host the process runs on.
    pub host: String,
    /// Process id.
    pub pid: i64,
    /// POSIX thread id, when known.
    pub posix_tid: Option<u64>,
    /// MPI rank, for MPI jobs.
    pub mpi_rank: Option<i64>,
}

impl ThreadName {
    /// A whole process, before its threads are known.
    pub fn process(host: impl Into<String>, pid: i64) -> Self {
        Self {
            host: host.into(),
            pid,
            posix_tid: None,
            mpi_rank: None,
        }
    }

    /// Set the POSIX thread id.
    #[must_use]
    pub fn with_tid(mut self, posix_tid: u64) -> Self {
        self.posix_tid = Some(posix_tid);
        self
    }

    /// Set the MPI rank.
    #[must_use]
    pub fn with_rank(mut self, rank: i64) -> Self {
        self.mpi_rank = Some(rank);
        self
    }
}

/// Half-open address range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    /// First address.
    pub begin: u64,
    /// One past the last address.
    pub end: u64,
}

impl AddressRange {
    /// Range `[begin, end)`.
    #[must_use]
    pub const fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// True if `address` lies inside the range.
    #[must_use]
    pub const fn contains(&self, address: u64) -> bool {
        self.begin <= address && address < self.end
    }

    /// True if the two ranges share at least one address.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Number of addresses covered.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }
}

/// An executable or library mapped into a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedObjectInfo {
    /// File path.
    pub path: PathBuf,
    /// Absolute range it is mapped at.
    pub range: AddressRange,
    /// True for the main executable.
    pub is_executable: bool,
}

/// Address range with a validity bitmap, one bit per address (LSB first).
/// Ranges in a symbol table are relative to the linked object's load address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBitmap {
    /// Covered range.
    pub range: AddressRange,
    /// Validity bits; empty means every address is valid.
    pub bitmap: Vec<u8>,
}

impl AddressBitmap {
    /// A range with every address valid.
    #[must_use]
    pub const fn full(range: AddressRange) -> Self {
        Self {
            range,
            bitmap: Vec::new(),
        }
    }
}

/// A function symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionEntry {
    /// Demangled name.
    pub name: String,
    /// Code ranges.
    pub ranges: Vec<AddressBitmap>,
}

/// A source statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementEntry {
    /// Source file.
    pub path: PathBuf,
    /// Line number.
    pub line: u32,
    /// Column, when known.
    pub column: Option<u32>,
    /// Code ranges.
    pub ranges: Vec<AddressBitmap>,
}

/// Symbols of one linked object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Linked object the symbols belong to.
    pub linked_object: PathBuf,
    /// Functions.
    pub functions: Vec<FunctionEntry>,
    /// Statements.
    pub statements: Vec<StatementEntry>,
}

/// One block of sampled data from a collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceBlob {
    /// Collector that produced the samples, for example `pcsamp`.
    pub collector: String,
    /// Thread that was sampled.
    pub thread: ThreadName,
    /// Start of the sampling period (ns).
    pub time_begin: u64,
    /// End of the sampling period (ns).
    pub time_end: u64,
    /// Sampling interval (ns).
    pub interval: u64,
    /// `(pc, count)` buckets.
    pub samples: Vec<(u64, u64)>,
}

/// Event emitted by an instrumentation backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEvent {
    /// The backend attached to these threads.
    ThreadsAttached {
        /// Target experiment.
        experiment: ExperimentId,
        /// Attached threads.
        threads: Vec<ThreadName>,
    },
    /// A process launched under the tool got its real pid.
    ProcessCreated {
        /// Target experiment.
        experiment: ExperimentId,
        /// Placeholder the tool registered before launch.
        original: ThreadName,
        /// The created process.
        created: ThreadName,
    },
    /// A linked object was mapped into some threads.
    LinkedObjectLoaded {
        /// Target experiment.
        experiment: ExperimentId,
        /// Threads that mapped it.
        threads: Vec<ThreadName>,
        /// Load time (ns).
        time: u64,
        /// The object.
        object: LinkedObjectInfo,
    },
    /// A thread's initial set of linked objects.
    LinkedObjectGroupLoaded {
        /// Target experiment.
        experiment: ExperimentId,
        /// Thread that mapped them.
        thread: ThreadName,
        /// Load time (ns).
        time: u64,
        /// The objects.
        objects: Vec<LinkedObjectInfo>,
    },
    /// A linked object was unmapped.
    LinkedObjectUnloaded {
        /// Target experiment.
        experiment: ExperimentId,
        /// Threads that unmapped it.
        threads: Vec<ThreadName>,
        /// Unload time (ns).
        time: u64,
        /// Object path.
        path: PathBuf,
    },
    /// Symbols for one linked object.
    SymbolTableDelivered {
        /// Target experiment.
        experiment: ExperimentId,
        /// The symbols.
        table: SymbolTable,
    },
    /// Sampled performance data.
    PerformanceDataDelivered {
        /// Target experiment.
        experiment: ExperimentId,
        /// The data.
        blob: PerformanceBlob,
    },
}

impl BackendEvent {
    /// Experiment the event is addressed to.
    #[must_use]
    pub const fn experiment(&self) -> ExperimentId {
        match self {
            Self::ThreadsAttached { experiment, .. }
            | Self::ProcessCreated { experiment, .. }
            | Self::LinkedObjectLoaded { experiment, .. }
            | Self::LinkedObjectGroupLoaded { experiment, .. }
            | Self::LinkedObjectUnloaded { experiment, .. }
            | Self::SymbolTableDelivered { experiment, .. }
            | Self::PerformanceDataDelivered { experiment, .. } => *experiment,
        }
    }

    /// Short name used in logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ThreadsAttached { .. } => "threadsAttached",
            Self::ProcessCreated { .. } => "processCreated",
            Self::LinkedObjectLoaded { .. } => "linkedObjectLoaded",
            Self::LinkedObjectGroupLoaded { .. } => "linkedObjectGroupLoaded",
            Self::LinkedObjectUnloaded { .. } => "linkedObjectUnloaded",
            Self::SymbolTableDelivered { .. } => "symbolTableDelivered",
            Self::PerformanceDataDelivered { .. } => "performanceDataDelivered",
        }
    }
}

/// What travels on the delivery queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Event(Box<BackendEvent>),
    Flush(SyncSender<()>),
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_overlap() {
        let a = AddressRange::new(0x1000, 0x2000);
        assert!(a.contains(0x1000));
        assert!(!a.contains(0x2000));
        assert!(a.overlaps(&AddressRange::new(0x1fff, 0x3000)));
        assert!(!a.overlaps(&AddressRange::new(0x2000, 0x3000)));
        assert_eq!(a.size(), 0x1000);
    }

    #[test]
    fn test_event_serializes() {
        let event = BackendEvent::ThreadsAttached {
            experiment: 3,
            threads: vec![ThreadName::process("node1", 42).with_tid(7)],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: BackendEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.experiment(), 3);
        assert_eq!(back.name(), "threadsAttached");
    }
}
