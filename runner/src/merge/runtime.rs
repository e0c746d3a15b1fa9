use crate::{
    arrays::{ArrayError, ArrayTool},
    status::{RUNTIME_VARIABLE, STATUS_VARIABLE},
};
use std::{fmt, path::Path};
use tracing::warn;

/// factor converting a value in `units` to seconds, no units means integer seconds
pub fn seconds_per_unit(units: Option<&str>) -> Option<f64> {
    let units = match units {
        None => return Some(1.0),
        Some(units) => units.trim().to_lowercase(),
    };
    // CF style units carry a reference time, e.g. "seconds since 1970-01-01"
    let unit = units.split_whitespace().next().unwrap_or_default();

    match unit {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => Some(1.0),
        "ms" | "millisecond" | "milliseconds" => Some(1e-3),
        "us" | "microsecond" | "microseconds" => Some(1e-6),
        "ns" | "nanosecond" | "nanoseconds" => Some(1e-9),
        "min" | "mins" | "minute" | "minutes" => Some(60.0),
        "h" | "hr" | "hour" | "hours" => Some(3600.0),
        "d" | "day" | "days" => Some(86400.0),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuntimeReport {
    pub mean_seconds: Option<f64>,
    pub used: usize,
    pub total: usize,
}

impl fmt::Display for RuntimeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean_seconds {
            Some(mean) => write!(
                f,
                "Mean runtime {mean:.2} s over {} of {} cells",
                self.used, self.total
            ),
            None => write!(f, "No valid runtime in any of the {} cells", self.total),
        }
    }
}

/// Mean `total_runtime` over cells with a valid, positive runtime
pub fn mean_runtime(tool: &dyn ArrayTool, path: &Path) -> Result<RuntimeReport, ArrayError> {
    let dataset = tool.read(path)?;
    let runtime = dataset.variable(RUNTIME_VARIABLE)?;
    let total = match dataset.variable(STATUS_VARIABLE) {
        Ok(status) => status.data.len(),
        Err(_) => runtime.data.len(),
    };

    let Some(factor) = seconds_per_unit(runtime.units()) else {
        warn!(units = ?runtime.units(), "Unknown runtime units, not reporting a mean");
        return Ok(RuntimeReport {
            mean_seconds: None,
            used: 0,
            total,
        });
    };

    let (sum, used) = runtime
        .data
        .iter()
        .filter(|value| value.is_finite() && **value > 0.0 && !runtime.is_fill(**value))
        .fold((0.0, 0), |(sum, used), value| (sum + value * factor, used + 1));

    Ok(RuntimeReport {
        mean_seconds: (used > 0).then(|| sum / used as f64),
        used,
        total,
    })
}
