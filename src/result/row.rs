//! Table rows: ordered cell collections rendered on one line.

use serde::{Deserialize, Serialize};

use super::{RenderOptions, ResultValue};

/// Separator placed between rendered cells.
pub const CELL_SEPARATOR: &str = "  ";

/// An ordered collection of cells forming one printable line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<ResultValue>,
}

impl Row {
    /// Create an empty row.
    #[must_use]
    pub const fn new() -> Self {
        Self { cells: Vec::new() }
    }

    /// Append a cell.
    pub fn push(&mut self, cell: ResultValue) {
        self.cells.push(cell);
    }

    /// Cells in display order.
    #[must_use]
    pub fn cells(&self) -> &[ResultValue] {
        &self.cells
    }

    /// Number of cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True when the row has no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Render every cell right-justified in `opts.field_width`, except the
    /// last, which is left-justified. Trailing padding is dropped.
    #[must_use]
    pub fn render(&self, opts: &RenderOptions) -> String {
        self.render_separated(opts, CELL_SEPARATOR)
    }

    /// Like [`Row::render`] with a custom column separator.
    #[must_use]
    pub fn render_separated(&self, opts: &RenderOptions, separator: &str) -> String {
        let last = self.cells.len().saturating_sub(1);
        let line = self
            .cells
            .iter()
            .enumerate()
            .map(|(i, cell)| cell.render_with(opts.field_width, i == last, opts))
            .collect::<Vec<_>>()
            .join(separator);
        line.trim_end_matches(' ').to_string()
    }
}

impl FromIterator<ResultValue> for Row {
    fn from_iter<I: IntoIterator<Item = ResultValue>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

impl From<Vec<ResultValue>> for Row {
    fn from(cells: Vec<ResultValue>) -> Self {
        Self { cells }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_render_last_column_left() {
        let row: Row = vec![
            ResultValue::Float(1.5),
            ResultValue::UnsignedInt(12),
            ResultValue::String("main".into()),
        ]
        .into();
        let opts = RenderOptions {
            field_width: 8,
            precision: 2,
            full_path: false,
        };
        assert_eq!(row.render(&opts), "    1.50        12  main");
    }

    #[test]
    fn test_empty_row_renders_empty() {
        assert_eq!(Row::new().render(&RenderOptions::default()), "");
    }
}
