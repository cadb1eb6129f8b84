//! Built-in views over sampled data

use rustc_hash::FxHashMap;

use super::engine::{Cancellation, ViewEngine, ViewItem};
use super::instruction::{ViewInstruction, ViewOpCode};
use crate::experiment::{ExperimentStore, Granularity, SampleBucket};
use crate::result::{RenderOptions, ResultValue, Row};
use crate::{Error, Result};

// Temp slots filled per row key.
const TIME: usize = 0;
const SAMPLES: usize = 1;
const THREADS: usize = 2;
const TIME_SQUARES: usize = 3;
const MIN_TIME: usize = 4;
const MAX_TIME: usize = 5;

// Grand totals.
const TOTAL_TIME: usize = 0;

/// A named report over one collector's data.
#[derive(Debug, Clone, Copy)]
pub struct ViewDefinition {
    /// Name used on the `expView` command line.
    pub name: &'static str,
    /// Collector whose data the view reads.
    pub collector: &'static str,
    /// One-line description for `listViews`.
    pub description: &'static str,
    headers: &'static [&'static str],
    program: fn() -> Vec<ViewInstruction>,
}

/// Every view the tool can build.
pub const VIEWS: &[ViewDefinition] = &[
    ViewDefinition {
        name: "pcsamp",
        collector: "pcsamp",
        description: "Exclusive CPU time per function, statement or linked object",
        headers: &["Exclusive CPU time in seconds.", "% of CPU Time", "Samples"],
        program: pcsamp_program,
    },
    ViewDefinition {
        name: "loadbalance",
        collector: "pcsamp",
        description: "Spread of exclusive CPU time across threads",
        headers: &[
            "Average Exclusive Time Across Threads(s)",
            "Standard Deviation Across Threads(s)",
            "Min Exclusive Time Across Threads(s)",
            "Max Exclusive Time Across Threads(s)",
            "Exclusive Time(s)",
            "% of Total Time",
        ],
        program: loadbalance_program,
    },
];

/// Metrics a collector records, as `(name, description)`.
#[must_use]
pub fn collector_metrics(collector: &str) -> &'static [(&'static str, &'static str)] {
    match collector {
        "pcsamp" => &[
            ("time", "CPU time in seconds"),
            ("samples", "Program counter samples"),
        ],
        _ => &[],
    }
}

/// Look up a view by name.
#[must_use]
pub fn find_view(name: &str) -> Option<&'static ViewDefinition> {
    VIEWS.iter().find(|view| view.name.eq_ignore_ascii_case(name))
}

fn pcsamp_program() -> Vec<ViewInstruction> {
    vec![
        ViewInstruction::display_tmp(0, TIME),
        ViewInstruction::display_percent_of_tmp(1, TIME, TOTAL_TIME),
        ViewInstruction::display_tmp(2, SAMPLES),
        ViewInstruction::accumulate(ViewOpCode::Add, TIME),
        ViewInstruction::accumulate(ViewOpCode::Add, SAMPLES),
        ViewInstruction::display_summary(),
    ]
}

fn loadbalance_program() -> Vec<ViewInstruction> {
    vec![
        ViewInstruction::display_average_of_tmp(0, TIME, THREADS),
        ViewInstruction::display_std_deviation_of_tmp(1, TIME, TIME_SQUARES, THREADS),
        ViewInstruction::display_tmp(2, MIN_TIME),
        ViewInstruction::display_tmp(3, MAX_TIME),
        ViewInstruction::display_tmp(4, TIME),
        ViewInstruction::display_percent_of_column(5, 4, TOTAL_TIME),
        ViewInstruction::accumulate(ViewOpCode::Add, TIME),
        ViewInstruction::accumulate(ViewOpCode::Add, THREADS),
        ViewInstruction::accumulate(ViewOpCode::Add, TIME_SQUARES),
        ViewInstruction::accumulate(ViewOpCode::Min, MIN_TIME),
        ViewInstruction::accumulate(ViewOpCode::Max, MAX_TIME),
        ViewInstruction::display_summary(),
    ]
}

#[derive(Default)]
struct KeyTotals {
    time: f64,
    samples: u64,
    threads: u64,
    time_squares: f64,
    min: f64,
    max: f64,
}

/// Fold per-thread buckets into one temp vector per key, ordered by time
/// descending. Also returns the grand totals `[time, samples]`.
#[must_use]
pub fn items_from_buckets(buckets: &[SampleBucket]) -> (Vec<ViewItem>, Vec<ResultValue>) {
    let mut order: Vec<ResultValue> = Vec::new();
    let mut by_key: FxHashMap<String, KeyTotals> = FxHashMap::default();
    let opts = RenderOptions {
        full_path: true,
        ..RenderOptions::default()
    };
    let mut total_time = 0.0;
    let mut total_samples = 0_u64;

    for bucket in buckets {
        let id = bucket.key.form(&opts);
        let totals = by_key.entry(id).or_insert_with(|| {
            order.push(bucket.key.clone());
            KeyTotals {
                min: f64::INFINITY,
                ..KeyTotals::default()
            }
        });
        totals.time += bucket.seconds;
        totals.samples += bucket.samples;
        totals.threads += 1;
        totals.time_squares += bucket.seconds * bucket.seconds;
        totals.min = totals.min.min(bucket.seconds);
        totals.max = totals.max.max(bucket.seconds);
        total_time += bucket.seconds;
        total_samples += bucket.samples;
    }

    let mut items: Vec<ViewItem> = order
        .into_iter()
        .map(|key| {
            let totals = &by_key[&key.form(&opts)];
            let temps = vec![
                ResultValue::Float(totals.time),
                ResultValue::UnsignedInt(totals.samples),
                ResultValue::UnsignedInt(totals.threads),
                ResultValue::Float(totals.time_squares),
                ResultValue::Float(totals.min),
                ResultValue::Float(totals.max),
            ];
            (key, temps)
        })
        .collect();
    items.sort_by(|(a_key, a), (b_key, b)| {
        b[TIME]
            .compare(&a[TIME])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a_key.form(&opts).cmp(&b_key.form(&opts)))
    });

    (
        items,
        vec![
            ResultValue::Float(total_time),
            ResultValue::UnsignedInt(total_samples),
        ],
    )
}

impl ViewDefinition {
    /// The view's instruction program.
    #[must_use]
    pub fn program(&self) -> Vec<ViewInstruction> {
        (self.program)()
    }

    /// Heading row for `granularity`.
    #[must_use]
    pub fn header(&self, granularity: Granularity) -> ResultValue {
        let mut row: Row = self.headers.iter().map(|h| ResultValue::from(*h)).collect();
        row.push(ResultValue::from(granularity.key_title()));
        ResultValue::HeaderRow(row)
    }

    /// Build the report from `store`.
    ///
    /// The output is a header row followed by the engine's rows, or the
    /// single no-data row when the collector delivered nothing. A pass
    /// cancelled before its first row yields nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn generate<C>(
        &self,
        store: &ExperimentStore,
        granularity: Granularity,
        cancel: &C,
    ) -> Result<Vec<ResultValue>>
    where
        C: Cancellation + ?Sized,
    {
        let buckets = store.sample_buckets(self.collector, granularity)?;
        let (items, totals) = items_from_buckets(&buckets);
        let engine = ViewEngine::new(self.program());
        let rows = engine.construct(&items, &totals, cancel);
        if items.is_empty() || rows.is_empty() {
            return Ok(rows);
        }
        let mut output = Vec::with_capacity(rows.len() + 1);
        output.push(self.header(granularity));
        output.extend(rows);
        Ok(output)
    }
}

/// Resolve a view name, with a user-facing error for unknown names.
///
/// # Errors
///
/// Returns [`Error::InvalidOperand`] if no view has this name.
pub fn view_named(name: &str) -> Result<&'static ViewDefinition> {
    find_view(name).ok_or_else(|| Error::InvalidOperand(format!("unknown view '{name}'")))
}
