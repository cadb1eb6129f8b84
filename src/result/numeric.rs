//! Derived-metric arithmetic over report cells.
//!
//! All helpers return `None` where the result is undefined (zero or negative
//! denominators, non-numeric inputs). Callers render `None` as an empty cell.

use super::ResultValue;

/// `part * 100 / whole`, clamped below at zero.
///
/// Returns `None` when `whole` is null, non-numeric, or `<= 0`. A null `part`
/// counts as zero. There is no upper clamp: a part larger than the whole
/// yields more than 100%.
#[must_use]
pub fn percent_of(part: &ResultValue, whole: &ResultValue) -> Option<ResultValue> {
    let whole = whole.as_f64()?;
    if whole <= 0.0 {
        return None;
    }
    if part.is_null() {
        return Some(ResultValue::Float(0.0));
    }
    let part = part.as_f64()?;
    Some(ResultValue::Float((part * 100.0 / whole).max(0.0)))
}

/// `sum / count`; `None` when `count <= 0`.
#[must_use]
pub fn average(sum: &ResultValue, count: &ResultValue) -> Option<ResultValue> {
    let count = count.as_f64()?;
    if count <= 0.0 {
        return None;
    }
    if sum.is_null() {
        return Some(ResultValue::Float(0.0));
    }
    Some(ResultValue::Float(sum.as_f64()? / count))
}

/// Population standard deviation from running sums:
/// `sqrt(max(0, sum_squares/count - (sum/count)^2))`.
#[must_use]
pub fn std_deviation(
    sum: &ResultValue,
    sum_squares: &ResultValue,
    count: &ResultValue,
) -> Option<ResultValue> {
    let count = count.as_f64()?;
    if count <= 0.0 {
        return None;
    }
    let mean = sum.as_f64()? / count;
    let variance = sum_squares.as_f64()?.mul_add(1.0 / count, -(mean * mean));
    Some(ResultValue::Float(variance.max(0.0).sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_zero_whole_is_none() {
        assert_eq!(
            percent_of(&ResultValue::UnsignedInt(30), &ResultValue::UnsignedInt(0)),
            None
        );
        assert_eq!(
            percent_of(&ResultValue::Float(1.0), &ResultValue::Float(-2.0)),
            None
        );
    }

    #[test]
    fn test_percent_null_part_is_zero() {
        assert_eq!(
            percent_of(&ResultValue::Null, &ResultValue::Float(10.0)),
            Some(ResultValue::Float(0.0))
        );
    }

    #[test]
    fn test_percent_mixed_numeric_variants() {
        assert_eq!(
            percent_of(&ResultValue::SignedInt(25), &ResultValue::UnsignedInt(50)),
            Some(ResultValue::Float(50.0))
        );
    }

    #[test]
    fn test_percent_non_numeric_is_none() {
        assert_eq!(
            percent_of(&ResultValue::String("x".into()), &ResultValue::Float(10.0)),
            None
        );
    }

    #[test]
    fn test_average() {
        assert_eq!(
            average(&ResultValue::Float(9.0), &ResultValue::UnsignedInt(3)),
            Some(ResultValue::Float(3.0))
        );
        assert_eq!(
            average(&ResultValue::Float(9.0), &ResultValue::UnsignedInt(0)),
            None
        );
    }

    #[test]
    fn test_std_deviation() {
        // Values 2, 4, 4, 4, 5, 5, 7, 9: sum 40, sum of squares 232, sd 2.
        let sd = std_deviation(
            &ResultValue::Float(40.0),
            &ResultValue::Float(232.0),
            &ResultValue::UnsignedInt(8),
        );
        assert_eq!(sd, Some(ResultValue::Float(2.0)));
    }

    #[test]
    fn test_std_deviation_never_negative_variance() {
        // Rounding can push the variance slightly below zero.
        let sd = std_deviation(
            &ResultValue::Float(0.3),
            &ResultValue::Float(0.03),
            &ResultValue::UnsignedInt(3),
        );
        let Some(ResultValue::Float(value)) = sd else {
            panic!("expected a float");
        };
        assert!(value >= 0.0);
        assert!(value < 1e-6);
    }
}
