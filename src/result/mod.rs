//! Typed report cells
//!
//! [`ResultValue`] is the closed set of values a command can attach to its
//! result list. Every variant knows how to render itself as fixed-width text;
//! numeric and string variants also accumulate in place, which is how the
//! view engine builds summary rows.
//!
//! ```rust
//! use perfex::result::{percent_of, ResultValue};
//!
//! let mut total = ResultValue::UnsignedInt(30);
//! total.accumulate(&ResultValue::UnsignedInt(12));
//! assert_eq!(total, ResultValue::UnsignedInt(42));
//!
//! assert_eq!(percent_of(&ResultValue::UnsignedInt(30), &ResultValue::UnsignedInt(0)), None);
//! ```

mod numeric;
mod row;
mod source;

use std::cmp::Ordering;
use std::mem::discriminant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{Config, DEFAULT_VIEW_FIELD_SIZE, DEFAULT_VIEW_PRECISION};

pub use numeric::{average, percent_of, std_deviation};
pub use row::{Row, CELL_SEPARATOR};
pub use source::{FunctionRef, LinkedObjectRef, SourceLocation, StatementRef};

/// Formatting knobs shared by every cell of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    /// Column width.
    pub field_width: usize,
    /// Digits after the decimal point for floats.
    pub precision: usize,
    /// Print full paths instead of basenames.
    pub full_path: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            field_width: DEFAULT_VIEW_FIELD_SIZE,
            precision: DEFAULT_VIEW_PRECISION,
            full_path: false,
        }
    }
}

impl From<&Config> for RenderOptions {
    fn from(config: &Config) -> Self {
        Self {
            field_width: config.view_field_size,
            precision: config.view_precision,
            full_path: config.view_full_path,
        }
    }
}

/// One report cell (or one whole row, for the row variants).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ResultValue {
    /// No value; renders as `(none)`.
    Null,
    /// Unsigned integer.
    UnsignedInt(u64),
    /// Signed integer.
    SignedInt(i64),
    /// Floating point, printed with the configured precision.
    Float(f64),
    /// Text subject to width and justification.
    String(String),
    /// Text printed verbatim.
    RawString(String),
    /// A function with its linked object and definition sites.
    FunctionRef(FunctionRef),
    /// A source statement.
    StatementRef(StatementRef),
    /// An executable or library.
    LinkedObjectRef(LinkedObjectRef),
    /// A report title, printed verbatim.
    Title(String),
    /// Column headings.
    HeaderRow(Row),
    /// One data row.
    ColumnRow(Row),
    /// The summary line under a report.
    SummaryRow(Row),
}

impl ResultValue {
    /// True for numeric variants.
    #[must_use]
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::UnsignedInt(_) | Self::SignedInt(_) | Self::Float(_)
        )
    }

    /// True for `Null` and for empty text cells.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) | Self::RawString(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Numeric value widened to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::UnsignedInt(v) => Some(*v as f64),
            Self::SignedInt(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Unjustified text form of a single cell.
    ///
    /// Row variants join their cells as [`Row::render`] does.
    #[must_use]
    pub fn form(&self, opts: &RenderOptions) -> String {
        match self {
            Self::Null => "(none)".to_string(),
            Self::UnsignedInt(v) => v.to_string(),
            Self::SignedInt(v) => v.to_string(),
            Self::Float(v) => format!("{v:.prec$}", prec = opts.precision),
            Self::String(s) | Self::RawString(s) | Self::Title(s) => s.clone(),
            Self::FunctionRef(f) => f.form(opts.full_path),
            Self::StatementRef(s) => s.form(opts.full_path),
            Self::LinkedObjectRef(l) => l.form(opts.full_path),
            Self::HeaderRow(row) | Self::ColumnRow(row) | Self::SummaryRow(row) => {
                row.render(opts)
            }
        }
    }

    /// Render in `field_width` with default precision and basename paths.
    #[must_use]
    pub fn render(&self, field_width: usize, left_justified: bool) -> String {
        self.render_with(field_width, left_justified, &RenderOptions::default())
    }

    /// Render in `field_width`.
    ///
    /// Right-justified text is truncated to the field. Left-justified text is
    /// never truncated and is padded unless it ends in a newline. Numbers are
    /// padded but never truncated. Raw strings, titles and rows ignore width
    /// and justification.
    #[must_use]
    pub fn render_with(
        &self,
        field_width: usize,
        left_justified: bool,
        opts: &RenderOptions,
    ) -> String {
        let text = self.form(opts);
        match self {
            Self::RawString(_)
            | Self::Title(_)
            | Self::HeaderRow(_)
            | Self::ColumnRow(_)
            | Self::SummaryRow(_) => text,
            Self::UnsignedInt(_) | Self::SignedInt(_) | Self::Float(_) => {
                if left_justified {
                    format!("{text:<field_width$}")
                } else {
                    format!("{text:>field_width$}")
                }
            }
            Self::Null
            | Self::String(_)
            | Self::FunctionRef(_)
            | Self::StatementRef(_)
            | Self::LinkedObjectRef(_) => {
                if left_justified {
                    if text.ends_with('\n') {
                        text
                    } else {
                        format!("{text:<field_width$}")
                    }
                } else {
                    let clipped: String = text.chars().take(field_width).collect();
                    format!("{clipped:>field_width$}")
                }
            }
        }
    }

    /// Merge `other` into `self`: numbers add, strings concatenate, every
    /// other variant is left unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the two values are different variants.
    pub fn accumulate(&mut self, other: &Self) {
        match (&mut *self, other) {
            (Self::UnsignedInt(a), Self::UnsignedInt(b)) => *a = a.wrapping_add(*b),
            (Self::SignedInt(a), Self::SignedInt(b)) => *a = a.wrapping_add(*b),
            (Self::Float(a), Self::Float(b)) => *a += *b,
            (Self::String(a), Self::String(b)) | (Self::RawString(a), Self::RawString(b)) => {
                a.push_str(b);
            }
            (a, b) => assert_same_variant(a, b, "accumulate"),
        }
    }

    /// Keep the smaller of two numeric values; no-op for other variants.
    ///
    /// # Panics
    ///
    /// Panics if the two values are different variants.
    pub fn accumulate_min(&mut self, other: &Self) {
        if self.compare(other) == Some(Ordering::Greater) {
            *self = other.clone();
        } else {
            assert_same_variant(self, other, "accumulate_min");
        }
    }

    /// Keep the larger of two numeric values; no-op for other variants.
    ///
    /// # Panics
    ///
    /// Panics if the two values are different variants.
    pub fn accumulate_max(&mut self, other: &Self) {
        if self.compare(other) == Some(Ordering::Less) {
            *self = other.clone();
        } else {
            assert_same_variant(self, other, "accumulate_max");
        }
    }

    /// Order two values of the same numeric variant. `None` otherwise.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::UnsignedInt(a), Self::UnsignedInt(b)) => Some(a.cmp(b)),
            (Self::SignedInt(a), Self::SignedInt(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// Plain JSON for scripting consumers: numbers stay numbers, rows become
    /// arrays, source references become their text form.
    #[must_use]
    pub fn to_json(&self, opts: &RenderOptions) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::UnsignedInt(v) => json!(v),
            Self::SignedInt(v) => json!(v),
            Self::Float(v) => json!(v),
            Self::String(s) | Self::RawString(s) | Self::Title(s) => json!(s),
            Self::FunctionRef(_) | Self::StatementRef(_) | Self::LinkedObjectRef(_) => {
                json!(self.form(opts))
            }
            Self::HeaderRow(row) | Self::ColumnRow(row) | Self::SummaryRow(row) => {
                Value::Array(row.cells().iter().map(|c| c.to_json(opts)).collect())
            }
        }
    }
}

fn assert_same_variant(a: &ResultValue, b: &ResultValue, op: &str) {
    assert!(
        discriminant(a) == discriminant(b),
        "{op} on mismatched result variants: {a:?} vs {b:?}"
    );
}

impl From<u64> for ResultValue {
    fn from(v: u64) -> Self {
        Self::UnsignedInt(v)
    }
}

impl From<i64> for ResultValue {
    fn from(v: i64) -> Self {
        Self::SignedInt(v)
    }
}

impl From<f64> for ResultValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ResultValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ResultValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_right_truncates_text() {
        let v = ResultValue::String("abcdefghij".into());
        assert_eq!(v.render(4, false), "abcd");
        assert_eq!(v.render(12, false), "  abcdefghij");
    }

    #[test]
    fn test_render_left_pads_unless_newline() {
        assert_eq!(ResultValue::from("ab").render(5, true), "ab   ");
        assert_eq!(ResultValue::from("ab\n").render(5, true), "ab\n");
        assert_eq!(ResultValue::from("abcdefg").render(3, true), "abcdefg");
    }

    #[test]
    fn test_raw_string_ignores_width() {
        let v = ResultValue::RawString("verbatim text".into());
        assert_eq!(v.render(4, false), "verbatim text");
        assert_eq!(v.render(40, true), "verbatim text");
    }

    #[test]
    fn test_numbers_never_truncated() {
        assert_eq!(ResultValue::UnsignedInt(123_456).render(3, false), "123456");
        assert_eq!(ResultValue::SignedInt(-7).render(4, false), "  -7");
        assert_eq!(ResultValue::Float(2.5).render(8, true), "2.5000  ");
    }

    #[test]
    fn test_null_renders_none() {
        assert_eq!(ResultValue::Null.render(8, false), "  (none)");
    }

    #[test]
    fn test_accumulate_numeric_and_string() {
        let mut v = ResultValue::Float(1.25);
        v.accumulate(&ResultValue::Float(0.75));
        assert_eq!(v, ResultValue::Float(2.0));

        let mut s = ResultValue::from("ab");
        s.accumulate(&ResultValue::from("cd"));
        assert_eq!(s, ResultValue::from("abcd"));
    }

    #[test]
    fn test_accumulate_source_refs_is_noop() {
        let f = ResultValue::FunctionRef(FunctionRef::new("main", "a.out"));
        let mut g = f.clone();
        g.accumulate(&ResultValue::FunctionRef(FunctionRef::new("other", "b.out")));
        assert_eq!(g, f);
    }

    #[test]
    #[should_panic(expected = "mismatched result variants")]
    fn test_accumulate_mismatch_panics() {
        let mut v = ResultValue::UnsignedInt(1);
        v.accumulate(&ResultValue::Float(1.0));
    }

    #[test]
    fn test_min_max() {
        let mut lo = ResultValue::SignedInt(5);
        lo.accumulate_min(&ResultValue::SignedInt(-3));
        lo.accumulate_min(&ResultValue::SignedInt(4));
        assert_eq!(lo, ResultValue::SignedInt(-3));

        let mut hi = ResultValue::Float(1.0);
        hi.accumulate_max(&ResultValue::Float(9.5));
        hi.accumulate_max(&ResultValue::Float(2.0));
        assert_eq!(hi, ResultValue::Float(9.5));
    }

    #[test]
    fn test_compare_only_numeric() {
        assert_eq!(
            ResultValue::UnsignedInt(1).compare(&ResultValue::UnsignedInt(2)),
            Some(Ordering::Less)
        );
        assert_eq!(ResultValue::from("a").compare(&ResultValue::from("b")), None);
        assert_eq!(
            ResultValue::UnsignedInt(1).compare(&ResultValue::SignedInt(2)),
            None
        );
    }

    #[test]
    fn test_to_json() {
        let opts = RenderOptions::default();
        let row = ResultValue::ColumnRow(
            vec![ResultValue::Float(0.5), ResultValue::from("main")].into(),
        );
        assert_eq!(row.to_json(&opts), json!([0.5, "main"]));
        assert_eq!(ResultValue::Null.to_json(&opts), Value::Null);
    }
}
