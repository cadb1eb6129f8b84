//! View construction
//!
//! Runs a [`ViewInstruction`] program over per-row temporary vectors and
//! produces the report's [`ResultValue::ColumnRow`]s, optionally followed by a
//! [`ResultValue::SummaryRow`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::result::{average, percent_of, std_deviation, Row, ResultValue};

use super::instruction::{ViewInstruction, ViewOpCode};

/// Text of the single row produced when a view has no input rows.
pub const NO_DATA_MESSAGE: &str = "There were no data samples for this experiment execution.\n\
Possible reasons for this could be:\n   \
The executable being run didn't run long enough to record performance data.\n   \
The experiment query may not have found a sample for a specified function or thread.\n   \
The type of performance data being gathered may not be present in the executable being executed.\n   \
The executable was not compiled with debug symbols enabled (-g option or variant).\n";

/// Key column text of the summary row.
pub const SUMMARY_LABEL: &str = "Report Summary";

/// One input row: its key (function, statement, ...) and its temporaries.
pub type ViewItem = (ResultValue, Vec<ResultValue>);

/// Polled between rows; a `true` answer stops the pass.
pub trait Cancellation {
    /// True once the owning work has been cancelled.
    fn is_cancelled(&self) -> bool;
}

impl Cancellation for AtomicBool {
    fn is_cancelled(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// A [`Cancellation`] that never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancelled;

impl Cancellation for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Executes one view program.
#[derive(Debug, Clone)]
pub struct ViewEngine {
    program: Vec<ViewInstruction>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Pass {
    Row,
    Summary,
}

/// The program reorganized for lookup by column and by temp slot.
struct Layout<'a> {
    columns: Vec<Option<&'a ViewInstruction>>,
    accumulate: Vec<Option<ViewOpCode>>,
    summary: bool,
    percent_basis: Option<usize>,
}

impl<'a> Layout<'a> {
    fn new(program: &'a [ViewInstruction], num_temps: usize, have_totals: bool) -> Self {
        let num_columns = program
            .iter()
            .filter(|inst| inst.op().is_display())
            .map(|inst| inst.column() + 1)
            .max()
            .unwrap_or(0);

        let mut columns = vec![None; num_columns];
        let mut accumulate = vec![None; num_temps];
        let mut summary = false;
        for inst in program {
            match inst.op() {
                op if op.is_display() => columns[inst.column()] = Some(inst),
                op if op.is_accumulate() => {
                    if let Some(slot) = accumulate.get_mut(inst.tmp1()) {
                        *slot = Some(op);
                    }
                }
                ViewOpCode::DisplaySummary => summary = num_temps != 0,
                _ => {}
            }
        }

        // Only one basis column is supported; the first one wins.
        let percent_basis = if have_totals {
            program
                .iter()
                .find(|inst| inst.op() == ViewOpCode::DisplayPercentOfColumn)
                .map(ViewInstruction::tmp1)
        } else {
            None
        };

        Self {
            columns,
            accumulate,
            summary,
            percent_basis,
        }
    }
}

impl ViewEngine {
    /// Wrap a program.
    #[must_use]
    pub fn new(program: Vec<ViewInstruction>) -> Self {
        Self { program }
    }

    /// The instructions this engine runs.
    #[must_use]
    pub fn program(&self) -> &[ViewInstruction] {
        &self.program
    }

    /// Build the report rows.
    ///
    /// Every input row yields one `ColumnRow`: one cell per display column,
    /// then the row key. When the program holds a `DisplaySummary`, a
    /// `SummaryRow` labelled [`SUMMARY_LABEL`] follows. An empty `items` list
    /// yields exactly one `ColumnRow` holding [`NO_DATA_MESSAGE`].
    ///
    /// `cancel` is polled before each row. Once it fires, the rows already
    /// built are returned and no summary is produced.
    ///
    /// # Arguments
    ///
    /// * `items` - `(key, temps)` pairs; every `temps` should have the same length
    /// * `totals` - grand totals for percent columns; empty disables percent-of-column
    /// * `cancel` - cooperative cancellation flag
    #[must_use]
    pub fn construct<C>(
        &self,
        items: &[ViewItem],
        totals: &[ResultValue],
        cancel: &C,
    ) -> Vec<ResultValue>
    where
        C: Cancellation + ?Sized,
    {
        let Some((_, first_temps)) = items.first() else {
            return vec![no_data_row()];
        };

        let layout = Layout::new(&self.program, first_temps.len(), !totals.is_empty());
        let mut output = Vec::with_capacity(items.len() + 1);
        let mut summary: Vec<ResultValue> = Vec::new();

        for (index, (key, temps)) in items.iter().enumerate() {
            if cancel.is_cancelled() {
                return output;
            }

            let mut row = Self::build_cells(&layout, Pass::Row, temps, totals);
            row.push(key.clone());
            output.push(ResultValue::ColumnRow(row));

            if layout.summary {
                if index == 0 {
                    summary.clone_from(temps);
                } else {
                    accumulate_temps(&layout.accumulate, &mut summary, temps);
                }
            }
        }

        if layout.summary {
            let mut row = Self::build_cells(&layout, Pass::Summary, &summary, totals);
            row.push(ResultValue::from(SUMMARY_LABEL));
            output.push(ResultValue::SummaryRow(row));
        }
        output
    }

    fn build_cells(
        layout: &Layout<'_>,
        pass: Pass,
        temps: &[ResultValue],
        totals: &[ResultValue],
    ) -> Row {
        let mut row = Row::new();
        let mut basis_value: Option<ResultValue> = None;
        for (column, inst) in layout.columns.iter().enumerate() {
            let cell = inst
                .and_then(|inst| {
                    Self::cell(layout, pass, inst, column, temps, totals, basis_value.as_ref())
                })
                .unwrap_or_else(|| ResultValue::from(""));
            if layout.percent_basis == Some(column) {
                basis_value = Some(cell.clone());
            }
            row.push(cell);
        }
        row
    }

    fn cell(
        layout: &Layout<'_>,
        pass: Pass,
        inst: &ViewInstruction,
        column: usize,
        temps: &[ResultValue],
        totals: &[ResultValue],
        basis_value: Option<&ResultValue>,
    ) -> Option<ResultValue> {
        let present = |slot: usize| temps.get(slot).filter(|v| !v.is_null());
        match inst.op() {
            ViewOpCode::DisplayMetric => match pass {
                Pass::Row => temps.get(column).cloned(),
                Pass::Summary => None,
            },
            ViewOpCode::DisplayTmp => {
                if pass == Pass::Summary
                    && layout.accumulate.get(inst.tmp1()).copied().flatten().is_none()
                {
                    return None;
                }
                present(inst.tmp1()).cloned()
            }
            ViewOpCode::DisplayPercentOfColumn => {
                // Columns at or left of the basis are never filled in.
                let basis = layout.percent_basis?;
                if column <= basis {
                    return None;
                }
                let part = basis_value.filter(|v| !v.is_null())?;
                percent_of(part, totals.get(inst.tmp2())?)
            }
            ViewOpCode::DisplayPercentOfTmp => {
                let part = match pass {
                    Pass::Row => present(inst.tmp1())?,
                    Pass::Summary => temps.get(inst.tmp1())?,
                };
                percent_of(part, totals.get(inst.tmp2())?)
            }
            ViewOpCode::DisplayAverageOfTmp => {
                average(present(inst.tmp1())?, temps.get(inst.tmp2())?)
            }
            ViewOpCode::DisplayStdDeviationOfTmp => std_deviation(
                temps.get(inst.tmp1())?,
                temps.get(inst.tmp2())?,
                temps.get(inst.tmp3())?,
            ),
            ViewOpCode::Add
            | ViewOpCode::Min
            | ViewOpCode::Max
            | ViewOpCode::SummaryMax
            | ViewOpCode::DisplaySummary => None,
        }
    }
}

fn accumulate_temps(
    instructions: &[Option<ViewOpCode>],
    summary: &mut [ResultValue],
    temps: &[ResultValue],
) {
    for ((slot, op), incoming) in summary.iter_mut().zip(instructions).zip(temps) {
        let Some(op) = op else { continue };
        if incoming.is_null() {
            continue;
        }
        if slot.is_null() {
            *slot = incoming.clone();
            continue;
        }
        match op {
            ViewOpCode::Add => slot.accumulate(incoming),
            ViewOpCode::Min => slot.accumulate_min(incoming),
            ViewOpCode::Max | ViewOpCode::SummaryMax => slot.accumulate_max(incoming),
            _ => {}
        }
    }
}

fn no_data_row() -> ResultValue {
    ResultValue::ColumnRow(vec![ResultValue::from(NO_DATA_MESSAGE)].into())
}
