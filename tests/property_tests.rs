//! Property-based tests for perfex
//!
//! - Test arithmetic invariants of result cells
//! - Test status monotonicity and view row shape
//! - Run with ProptestConfig::with_cases(100)

use proptest::prelude::*;

use perfex::command::{CommandObject, CommandStatus, ParsedCommand};
use perfex::result::{percent_of, RenderOptions, ResultValue};
use perfex::view::{NeverCancelled, ViewEngine, ViewInstruction, ViewItem, ViewOpCode};

// ============================================================================
// Property Test Generators (Strategies)
// ============================================================================

fn arb_status() -> impl Strategy<Value = CommandStatus> {
    prop_oneof![
        Just(CommandStatus::Parsed),
        Just(CommandStatus::Executing),
        Just(CommandStatus::Complete),
        Just(CommandStatus::Error),
        Just(CommandStatus::Aborted),
    ]
}

fn stage(status: CommandStatus) -> u8 {
    match status {
        CommandStatus::Parsed => 0,
        CommandStatus::Executing => 1,
        _ => 2,
    }
}

/// Items with `[time, samples]` temps.
fn arb_items(max: usize) -> impl Strategy<Value = Vec<ViewItem>> {
    proptest::collection::vec((0.0f64..100.0, 0u64..10_000), 0..max).prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (time, samples))| {
                (
                    ResultValue::from(format!("f{i}")),
                    vec![ResultValue::Float(time), ResultValue::UnsignedInt(samples)],
                )
            })
            .collect()
    })
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Accumulating unsigned cells equals the integer sum
    #[test]
    fn prop_accumulate_matches_sum(values in proptest::collection::vec(0u64..1_000_000, 1..50)) {
        let mut total = ResultValue::UnsignedInt(values[0]);
        for v in &values[1..] {
            total.accumulate(&ResultValue::UnsignedInt(*v));
        }
        prop_assert_eq!(total, ResultValue::UnsignedInt(values.iter().sum()));
    }

    /// Percentages are defined exactly for positive wholes and never negative
    #[test]
    fn prop_percent_defined_and_non_negative(part in -1e6f64..1e6, whole in -1e6f64..1e6) {
        let result = percent_of(&ResultValue::Float(part), &ResultValue::Float(whole));
        if whole > 0.0 {
            let value = result.and_then(|v| v.as_f64());
            prop_assert!(value.is_some_and(|v| v >= 0.0));
        } else {
            prop_assert!(result.is_none());
        }
    }

    /// Right-justified text always fills exactly the field
    #[test]
    fn prop_right_justified_text_fills_field(text in "[a-z_]{0,60}", width in 1usize..40) {
        let rendered = ResultValue::from(text.as_str()).render(width, false);
        prop_assert_eq!(rendered.chars().count(), width);
    }

    /// Numbers are never truncated, whatever the width
    #[test]
    fn prop_numbers_never_truncated(value in any::<u64>(), width in 0usize..10) {
        let rendered = ResultValue::UnsignedInt(value).render(width, false);
        prop_assert_eq!(rendered.trim_start(), value.to_string());
    }

    /// Command status only moves forward
    #[test]
    fn prop_status_is_monotonic(steps in proptest::collection::vec(arb_status(), 1..20)) {
        let command = CommandObject::new(1, ParsedCommand::new("expGo"));
        let mut last = stage(command.status());
        for step in steps {
            command.set_status(step);
            let now = stage(command.status());
            prop_assert!(now >= last);
            last = now;
        }
    }

    /// One row per item plus one summary row, or the single no-data row
    #[test]
    fn prop_view_row_count(items in arb_items(30)) {
        let engine = ViewEngine::new(vec![
            ViewInstruction::display_tmp(0, 0),
            ViewInstruction::display_percent_of_tmp(1, 0, 0),
            ViewInstruction::display_tmp(2, 1),
            ViewInstruction::accumulate(ViewOpCode::Add, 0),
            ViewInstruction::accumulate(ViewOpCode::Add, 1),
            ViewInstruction::display_summary(),
        ]);
        let total: f64 = items.iter().filter_map(|(_, t)| t[0].as_f64()).sum();
        let rows = engine.construct(&items, &[ResultValue::Float(total)], &NeverCancelled);
        let expected = if items.is_empty() { 1 } else { items.len() + 1 };
        prop_assert_eq!(rows.len(), expected);
    }

    /// Parsed operands survive printing and parsing again
    #[test]
    fn prop_descriptor_display_parses_back(
        id in 1u64..1000,
        view in "[a-z]{1,12}",
        granularity in prop_oneof![Just("functions"), Just("statements")],
    ) {
        let command = ParsedCommand::new("expView")
            .with_experiment(id)
            .with_option("v", granularity)
            .with_positional(view);
        let reparsed = ParsedCommand::parse(&command.to_string()).unwrap();
        prop_assert_eq!(reparsed, command);
    }
}

#[test]
fn test_float_render_uses_precision() {
    let opts = RenderOptions {
        precision: 2,
        ..RenderOptions::default()
    };
    assert_eq!(ResultValue::Float(1.0 / 3.0).form(&opts), "0.33");
}
