//! Percentage extraction from loosely shaped usage payloads.
//!
//! The provider has used several layouts for the usage response. Each layout
//! gets one extractor; they are tried in order and the first match wins.

use serde_json::Value;

use crate::models::UsageSnapshot;

type Extractor = fn(&Value) -> Option<f64>;

const EXTRACTORS: &[Extractor] = &[
    top_level_percentage,
    nested_usage_data_percentage,
    top_level_ratio,
    nested_usage_percentage,
    nested_usage_ratio,
];

/// Usage percentage in `[0, 100]`, or 0 when no known layout matches
pub fn extract_percentage(payload: &Value) -> f64 {
    try_extract_percentage(payload).unwrap_or(0.0)
}

/// Like [`extract_percentage`] but reports an unrecognized layout as `None`
pub fn try_extract_percentage(payload: &Value) -> Option<f64> {
    EXTRACTORS
        .iter()
        .find_map(|extract| extract(payload))
        .map(|pct| if pct.is_finite() { pct.clamp(0.0, 100.0) } else { 0.0 })
}

fn top_level_percentage(payload: &Value) -> Option<f64> {
    payload.get("usage_percentage")?.as_f64()
}

fn nested_usage_data_percentage(payload: &Value) -> Option<f64> {
    payload.get("usage_data")?.get("percentage")?.as_f64()
}

fn top_level_ratio(payload: &Value) -> Option<f64> {
    ratio(payload)
}

fn nested_usage_percentage(payload: &Value) -> Option<f64> {
    payload.get("usage")?.get("percentage")?.as_f64()
}

fn nested_usage_ratio(payload: &Value) -> Option<f64> {
    ratio(payload.get("usage")?)
}

/// `current / limit * 100`; a non-positive limit still matches but reads as 0
fn ratio(obj: &Value) -> Option<f64> {
    let current = obj.get("current")?.as_f64()?;
    let limit = obj.get("limit")?.as_f64()?;
    if limit > 0.0 {
        Some(current / limit * 100.0)
    } else {
        Some(0.0)
    }
}

/// Bar color bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn from_percentage(pct: f64) -> Self {
        if pct >= 90.0 {
            Severity::Critical
        } else if pct >= 70.0 {
            Severity::Warning
        } else {
            Severity::Normal
        }
    }
}

/// What the overlay shows for a snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct Readout {
    pub percentage: f64,
    pub text: String,
    pub severity: Severity,
}

impl Readout {
    pub fn from_snapshot(snapshot: &UsageSnapshot) -> Self {
        match try_extract_percentage(&snapshot.payload) {
            Some(pct) => Self {
                percentage: pct,
                text: format!("{pct:.1}% of limit used"),
                severity: Severity::from_percentage(pct),
            },
            None => Self::connected(),
        }
    }

    /// Neutral state for a payload with no recognizable percentage
    pub fn connected() -> Self {
        Self {
            percentage: 0.0,
            text: "Connected".to_string(),
            severity: Severity::Normal,
        }
    }

    pub fn placeholder(text: &str) -> Self {
        Self {
            percentage: 0.0,
            text: text.to_string(),
            severity: Severity::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_top_level_percentage() {
        assert_eq!(extract_percentage(&json!({"usage_percentage": 42.5})), 42.5);
    }

    #[test]
    fn test_nested_usage_data_percentage() {
        assert_eq!(
            extract_percentage(&json!({"usage_data": {"percentage": 12}})),
            12.0
        );
    }

    #[test]
    fn test_top_level_ratio() {
        assert_eq!(
            extract_percentage(&json!({"current": 25, "limit": 200})),
            12.5
        );
    }

    #[test]
    fn test_nested_usage_percentage() {
        assert_eq!(extract_percentage(&json!({"usage": {"percentage": 77}})), 77.0);
    }

    #[test]
    fn test_nested_usage_ratio() {
        assert_eq!(
            extract_percentage(&json!({"usage": {"current": 3, "limit": 4}})),
            75.0
        );
    }

    #[test]
    fn test_zero_limit_is_guarded() {
        assert_eq!(extract_percentage(&json!({"current": 50, "limit": 0})), 0.0);
        assert_eq!(
            extract_percentage(&json!({"usage": {"current": 50, "limit": 0}})),
            0.0
        );
    }

    #[test]
    fn test_unknown_shape_is_zero() {
        assert_eq!(extract_percentage(&json!({"five_hour": {"utilization": 3}})), 0.0);
        assert_eq!(extract_percentage(&json!([])), 0.0);
        assert_eq!(extract_percentage(&Value::Null), 0.0);
        assert_eq!(try_extract_percentage(&json!({"other": 1})), None);
    }

    #[test]
    fn test_order_prefers_top_level() {
        let payload = json!({
            "usage_percentage": 10,
            "usage_data": {"percentage": 20},
            "usage": {"percentage": 30}
        });
        assert_eq!(extract_percentage(&payload), 10.0);
    }

    #[test]
    fn test_non_numeric_falls_through() {
        let payload = json!({"usage_percentage": "high", "usage": {"percentage": 55}});
        assert_eq!(extract_percentage(&payload), 55.0);
    }

    #[test]
    fn test_clamped_to_range() {
        assert_eq!(extract_percentage(&json!({"current": 300, "limit": 100})), 100.0);
        assert_eq!(extract_percentage(&json!({"usage_percentage": -4})), 0.0);
    }

    #[test]
    fn test_severity_thresholds() {
        assert_eq!(Severity::from_percentage(0.0), Severity::Normal);
        assert_eq!(Severity::from_percentage(69.9), Severity::Normal);
        assert_eq!(Severity::from_percentage(70.0), Severity::Warning);
        assert_eq!(Severity::from_percentage(89.9), Severity::Warning);
        assert_eq!(Severity::from_percentage(90.0), Severity::Critical);
    }

    #[test]
    fn test_readout_text() {
        let readout = Readout::from_snapshot(&UsageSnapshot::new(json!({"usage_percentage": 91.3})));
        assert_eq!(readout.text, "91.3% of limit used");
        assert_eq!(readout.severity, Severity::Critical);

        let readout = Readout::from_snapshot(&UsageSnapshot::new(json!({"foo": 1})));
        assert_eq!(readout, Readout::connected());
    }
}
