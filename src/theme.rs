use crate::usage::Severity;

/// Overlay palette (always dark)
pub const BACKGROUND: &str = "#1A1A1A";
pub const HEADER: &str = "#2A2A2A";
pub const TRACK: &str = "#2A2A2A";
pub const TEXT: &str = "#CCCCCC";
pub const MUTED: &str = "#888888";
pub const BRAND: &str = "#CC785C";
pub const WARNING: &str = "#FFAA44";
pub const CRITICAL: &str = "#FF4444";

/// Progress bar fill for a usage level
pub fn bar_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Normal => BRAND,
        Severity::Warning => WARNING,
        Severity::Critical => CRITICAL,
    }
}
