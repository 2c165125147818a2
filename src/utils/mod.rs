//! Utilities module for logging, errors, and helper functions
//!
//! This module provides:
//! - Structured logging with tracing
//! - The error taxonomy shared by every stage
//! - Small formatting helpers for console output

pub mod error;
pub mod logging;

// Re-export main types for convenience
pub use error::{Result, TrainerError};
pub use logging::init_logging;

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

/// Render a class map the way the console reports it: `{"a": 0, "b": 1}`
pub fn format_class_indices<'a, I>(classes: I) -> String
where
    I: IntoIterator<Item = (&'a str, usize)>,
{
    let entries: Vec<String> = classes
        .into_iter()
        .map(|(name, idx)| format!("{:?}: {}", name, idx))
        .collect();
    format!("{{{}}}", entries.join(", "))
}
