//! Objective answer comparison and the percent-to-band lookup table.

use serde_json::Value;

/// Band thresholds, highest first. Kept as an explicit table so boundary
/// percentages map exactly instead of drifting through float arithmetic.
const BAND_TABLE: [(u32, f64); 11] = [
    (100, 9.0),
    (90, 8.5),
    (80, 8.0),
    (70, 7.5),
    (60, 7.0),
    (50, 6.5),
    (40, 6.0),
    (30, 5.5),
    (20, 5.0),
    (10, 4.5),
    (0, 4.0),
];

pub fn percent_correct(correct: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    ((correct * 100) / total) as u32
}

pub fn band_for_percent(percent: u32) -> f64 {
    for (threshold, band) in BAND_TABLE {
        if percent >= threshold {
            return band;
        }
    }
    4.0
}

/// Snaps an externally produced 0–9 score onto the half-band scale used by
/// the objective table.
pub fn clamp_half_band(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let clamped = score.clamp(0.0, 9.0);
    ((clamped * 2.0).round() as i64) as f64 / 2.0
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn element_repr(value: &Value) -> String {
    match value {
        Value::String(raw) => normalize(raw),
        other => other.to_string(),
    }
}

/// Type-aware equality between a stored answer key and a submitted value.
///
/// Strings compare case-insensitively after trimming. Arrays compare as sets:
/// same cardinality, order-independent, every required value present. Booleans
/// accept a native bool or its lowercase string form. Anything else is judged
/// incorrect; this function never fails.
pub fn answer_matches(expected: &Value, submitted: &Value) -> bool {
    match expected {
        Value::String(want) => match submitted {
            Value::String(got) => normalize(got) == normalize(want),
            _ => false,
        },
        Value::Array(want) => {
            let Value::Array(got) = submitted else {
                return false;
            };
            if want.len() != got.len() {
                return false;
            }
            let mut want: Vec<String> = want.iter().map(element_repr).collect();
            let mut got: Vec<String> = got.iter().map(element_repr).collect();
            want.sort();
            got.sort();
            want == got
        }
        Value::Bool(want) => match submitted {
            Value::Bool(got) => got == want,
            Value::String(got) => got.trim() == if *want { "true" } else { "false" },
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strings_compare_trimmed_case_insensitive() {
        assert!(answer_matches(&json!("Paris"), &json!("  paris ")));
        assert!(!answer_matches(&json!("Paris"), &json!("pariss")));
    }

    #[test]
    fn arrays_compare_as_sets() {
        // Gap-fill: different order and case still counts as correct.
        let expected = json!(["paris", "france"]);
        assert!(answer_matches(&expected, &json!(["France", "Paris"])));
        assert!(!answer_matches(&expected, &json!(["France"])));
        assert!(!answer_matches(&expected, &json!(["France", "Paris", "Lyon"])));
        assert!(!answer_matches(&expected, &json!("France, Paris")));
    }

    #[test]
    fn booleans_accept_native_and_lowercase_string() {
        assert!(answer_matches(&json!(true), &json!(true)));
        assert!(answer_matches(&json!(true), &json!("true")));
        assert!(answer_matches(&json!(false), &json!("false")));
        assert!(!answer_matches(&json!(true), &json!("TRUE")));
        assert!(!answer_matches(&json!(true), &json!(1)));
    }

    #[test]
    fn unexpected_shapes_are_incorrect_not_errors() {
        assert!(!answer_matches(&json!({"a": 1}), &json!({"a": 1})));
        assert!(!answer_matches(&json!("x"), &json!(null)));
        assert!(!answer_matches(&json!(42), &json!(42)));
    }

    #[test]
    fn band_table_is_exact_at_boundaries() {
        assert_eq!(band_for_percent(100), 9.0);
        assert_eq!(band_for_percent(99), 8.5);
        assert_eq!(band_for_percent(90), 8.5);
        assert_eq!(band_for_percent(75), 7.5);
        assert_eq!(band_for_percent(70), 7.5);
        assert_eq!(band_for_percent(10), 4.5);
        assert_eq!(band_for_percent(9), 4.0);
        assert_eq!(band_for_percent(1), 4.0);
        assert_eq!(band_for_percent(0), 4.0);
    }

    #[test]
    fn percent_is_integer_arithmetic() {
        assert_eq!(percent_correct(3, 4), 75);
        assert_eq!(percent_correct(1, 3), 33);
        assert_eq!(percent_correct(0, 0), 0);
        assert_eq!(percent_correct(4, 4), 100);
    }

    #[test]
    fn half_band_clamp() {
        assert_eq!(clamp_half_band(6.74), 6.5);
        assert_eq!(clamp_half_band(6.75), 7.0);
        assert_eq!(clamp_half_band(11.0), 9.0);
        assert_eq!(clamp_half_band(-2.0), 0.0);
        assert_eq!(clamp_half_band(f64::NAN), 0.0);
    }
}
