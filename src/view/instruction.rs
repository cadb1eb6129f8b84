//! View instruction programs
//!
//! A view is described by a flat list of [`ViewInstruction`]s. Display
//! instructions name an output column and the temporary slots they read;
//! accumulation instructions name the temporary slot they merge into the
//! summary.

use serde::{Deserialize, Serialize};

/// Operation performed by one view instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewOpCode {
    /// Display temp `column` (the temp index equals the column index).
    DisplayMetric,
    /// Display temp `tmp1`.
    DisplayTmp,
    /// Percent of the basis column's value (`tmp1` = basis column) against
    /// total `tmp2`.
    DisplayPercentOfColumn,
    /// Percent of temp `tmp1` against total `tmp2`.
    DisplayPercentOfTmp,
    /// `temp[tmp1] / temp[tmp2]`.
    DisplayAverageOfTmp,
    /// Standard deviation from sum `tmp1`, sum of squares `tmp2`, count `tmp3`.
    DisplayStdDeviationOfTmp,
    /// Summary: add temp `tmp1` across rows.
    Add,
    /// Summary: minimum of temp `tmp1` across rows.
    Min,
    /// Summary: maximum of temp `tmp1` across rows.
    Max,
    /// Summary: maximum of temp `tmp1`, used for per-row maxima reported once.
    SummaryMax,
    /// Request a summary row.
    DisplaySummary,
}

impl ViewOpCode {
    /// True for op-codes that produce an output column.
    #[must_use]
    pub const fn is_display(self) -> bool {
        matches!(
            self,
            Self::DisplayMetric
                | Self::DisplayTmp
                | Self::DisplayPercentOfColumn
                | Self::DisplayPercentOfTmp
                | Self::DisplayAverageOfTmp
                | Self::DisplayStdDeviationOfTmp
        )
    }

    /// True for op-codes that merge a temp into the summary accumulators.
    #[must_use]
    pub const fn is_accumulate(self) -> bool {
        matches!(self, Self::Add | Self::Min | Self::Max | Self::SummaryMax)
    }
}

/// One instruction of a view program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInstruction {
    op: ViewOpCode,
    column: usize,
    tmp1: usize,
    tmp2: usize,
    tmp3: usize,
}

impl ViewInstruction {
    /// Raw constructor.
    #[must_use]
    pub const fn new(op: ViewOpCode, column: usize, tmp1: usize, tmp2: usize, tmp3: usize) -> Self {
        Self {
            op,
            column,
            tmp1,
            tmp2,
            tmp3,
        }
    }

    /// Show metric `column` in column `column`.
    #[must_use]
    pub const fn display_metric(column: usize) -> Self {
        Self::new(ViewOpCode::DisplayMetric, column, column, 0, 0)
    }

    /// Show temp `tmp` in `column`.
    #[must_use]
    pub const fn display_tmp(column: usize, tmp: usize) -> Self {
        Self::new(ViewOpCode::DisplayTmp, column, tmp, 0, 0)
    }

    /// Show the basis column's value as a percent of total `total`.
    #[must_use]
    pub const fn display_percent_of_column(column: usize, basis: usize, total: usize) -> Self {
        Self::new(ViewOpCode::DisplayPercentOfColumn, column, basis, total, 0)
    }

    /// Show temp `tmp` as a percent of total `total`.
    #[must_use]
    pub const fn display_percent_of_tmp(column: usize, tmp: usize, total: usize) -> Self {
        Self::new(ViewOpCode::DisplayPercentOfTmp, column, tmp, total, 0)
    }

    /// Show `temp[sum] / temp[count]`.
    #[must_use]
    pub const fn display_average_of_tmp(column: usize, sum: usize, count: usize) -> Self {
        Self::new(ViewOpCode::DisplayAverageOfTmp, column, sum, count, 0)
    }

    /// Show the standard deviation derived from three running sums.
    #[must_use]
    pub const fn display_std_deviation_of_tmp(
        column: usize,
        sum: usize,
        sum_squares: usize,
        count: usize,
    ) -> Self {
        Self::new(
            ViewOpCode::DisplayStdDeviationOfTmp,
            column,
            sum,
            sum_squares,
            count,
        )
    }

    /// Summary accumulation of temp `tmp` with `op` (`Add`, `Min`, `Max`,
    /// `SummaryMax`).
    #[must_use]
    pub const fn accumulate(op: ViewOpCode, tmp: usize) -> Self {
        Self::new(op, 0, tmp, 0, 0)
    }

    /// Request a summary row.
    #[must_use]
    pub const fn display_summary() -> Self {
        Self::new(ViewOpCode::DisplaySummary, 0, 0, 0, 0)
    }

    /// Operation.
    #[must_use]
    pub const fn op(&self) -> ViewOpCode {
        self.op
    }

    /// Output column for display instructions.
    #[must_use]
    pub const fn column(&self) -> usize {
        self.column
    }

    /// First operand slot.
    #[must_use]
    pub const fn tmp1(&self) -> usize {
        self.tmp1
    }

    /// Second operand slot.
    #[must_use]
    pub const fn tmp2(&self) -> usize {
        self.tmp2
    }

    /// Third operand slot.
    #[must_use]
    pub const fn tmp3(&self) -> usize {
        self.tmp3
    }
}
