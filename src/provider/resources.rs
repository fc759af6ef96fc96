//! Resource quantity parsing shared by every provider.
//!
//! Templates carry cpu, memory, and storage requests as strings. All
//! providers parse them through this module so that a template means the
//! same thing no matter which backend materializes it.
//!
//! Grammar:
//!
//! - cpu: `"500m"` (millicores), `"250000n"` (nanocores, rounded to the
//!   nearest millicore), `"2"` / `"0.5"` (cores)
//! - memory/storage: plain bytes, binary suffixes `Ki`/`Mi`/`Gi`/`Ti`, or
//!   decimal suffixes `k`/`M`/`G`/`T`

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing a resource quantity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    /// The string is not a recognizable quantity.
    #[error("Invalid quantity '{value}': {reason}")]
    Invalid { value: String, reason: String },

    /// The parsed quantity is not positive where a positive one is required.
    #[error("Quantity '{value}' must be positive")]
    NotPositive { value: String },
}

fn invalid(value: &str, reason: impl Into<String>) -> QuantityError {
    QuantityError::Invalid {
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Parses a cpu quantity into millicores.
///
/// `"500m"` is 500 millicores, `"2"` is 2000, and nanocore values round to
/// the nearest millicore, so `"1000n"` is 0.
pub fn parse_cpu_millis(value: &str) -> Result<u64, QuantityError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(value, "empty string"));
    }

    if let Some(nanos) = trimmed.strip_suffix('n') {
        let nanos: u64 = nanos
            .parse()
            .map_err(|_| invalid(value, "nanocore count must be an integer"))?;
        return Ok((nanos + 500_000) / 1_000_000);
    }

    if let Some(millis) = trimmed.strip_suffix('m') {
        return millis
            .parse()
            .map_err(|_| invalid(value, "millicore count must be an integer"));
    }

    let cores: f64 = trimmed
        .parse()
        .map_err(|_| invalid(value, "core count must be numeric"))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(invalid(value, "core count must be a non-negative number"));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Formats millicores canonically: whole cores without a suffix, otherwise
/// the `m` form. `parse_cpu_millis(format_cpu_millis(x)) == x` for all `x`.
pub fn format_cpu_millis(millis: u64) -> String {
    if millis % 1000 == 0 {
        format!("{}", millis / 1000)
    } else {
        format!("{millis}m")
    }
}

const KI: u64 = 1024;
const MI: u64 = 1024 * KI;
const GI: u64 = 1024 * MI;
const TI: u64 = 1024 * GI;

/// Parses a memory or storage quantity into bytes.
///
/// Binary suffixes are powers of two (`"256Mi"` is 256·2²⁰); decimal
/// suffixes are powers of ten (`"2G"` is 2·10⁹); a bare number is bytes.
pub fn parse_memory_bytes(value: &str) -> Result<u64, QuantityError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(value, "empty string"));
    }

    let (number, multiplier): (&str, u64) = if let Some(n) = trimmed.strip_suffix("Ki") {
        (n, KI)
    } else if let Some(n) = trimmed.strip_suffix("Mi") {
        (n, MI)
    } else if let Some(n) = trimmed.strip_suffix("Gi") {
        (n, GI)
    } else if let Some(n) = trimmed.strip_suffix("Ti") {
        (n, TI)
    } else if let Some(n) = trimmed.strip_suffix('k') {
        (n, 1_000)
    } else if let Some(n) = trimmed.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = trimmed.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = trimmed.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (trimmed, 1)
    };

    let count: u64 = number
        .parse()
        .map_err(|_| invalid(value, "byte count must be an integer"))?;
    count
        .checked_mul(multiplier)
        .ok_or_else(|| invalid(value, "quantity overflows u64"))
}

/// Formats bytes canonically with the largest exact binary suffix.
/// `parse_memory_bytes(format_memory_bytes(x)) == x` for all `x`.
pub fn format_memory_bytes(bytes: u64) -> String {
    if bytes > 0 && bytes % TI == 0 {
        format!("{}Ti", bytes / TI)
    } else if bytes > 0 && bytes % GI == 0 {
        format!("{}Gi", bytes / GI)
    } else if bytes > 0 && bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else if bytes > 0 && bytes % KI == 0 {
        format!("{}Ki", bytes / KI)
    } else {
        format!("{bytes}")
    }
}

/// Raw resource requests as written in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequests {
    /// CPU request (e.g. `"500m"`, `"2"`).
    pub cpu: String,
    /// Memory request (e.g. `"512Mi"`).
    pub memory: String,
    /// Storage request (e.g. `"10Gi"`).
    pub storage: String,
}

impl Default for ResourceRequests {
    fn default() -> Self {
        Self {
            cpu: "1".to_string(),
            memory: "1Gi".to_string(),
            storage: "10Gi".to_string(),
        }
    }
}

impl ResourceRequests {
    /// Parses all three quantities, requiring each to be positive.
    pub fn parse(&self) -> Result<ParsedResources, QuantityError> {
        let cpu_millis = parse_cpu_millis(&self.cpu)?;
        if cpu_millis == 0 {
            return Err(QuantityError::NotPositive {
                value: self.cpu.clone(),
            });
        }
        let memory_bytes = parse_memory_bytes(&self.memory)?;
        if memory_bytes == 0 {
            return Err(QuantityError::NotPositive {
                value: self.memory.clone(),
            });
        }
        let storage_bytes = parse_memory_bytes(&self.storage)?;
        if storage_bytes == 0 {
            return Err(QuantityError::NotPositive {
                value: self.storage.clone(),
            });
        }
        Ok(ParsedResources {
            cpu_millis,
            memory_bytes,
            storage_bytes,
        })
    }
}

/// Resource requests resolved to exact machine quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedResources {
    /// CPU in millicores.
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Storage in bytes.
    pub storage_bytes: u64,
}
