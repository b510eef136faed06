//! Shared CLI argument parsers.

use embervm::lifecycle::validate_name;
use embervm_protocol::{MAX_VCPUS, MIN_MEMORY_MIB};
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a VM name.
pub fn parse_name(s: &str) -> Result<String, String> {
    validate_name(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

/// Parse a vCPU count.
pub fn parse_cpus(s: &str) -> Result<u8, String> {
    let cpus: u8 = s.parse().map_err(|_| format!("invalid cpu count: {}", s))?;
    if cpus == 0 || cpus > MAX_VCPUS {
        return Err(format!("cpus must be between 1 and {}", MAX_VCPUS));
    }
    Ok(cpus)
}

/// Parse a memory size in MiB, with an optional `M`/`G` suffix.
pub fn parse_memory(s: &str) -> Result<u32, String> {
    let lower = s.trim().to_ascii_lowercase();
    let (digits, factor) = if let Some(n) = lower.strip_suffix('g') {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix('m') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };
    let value: u32 = digits
        .parse()
        .map_err(|_| format!("invalid memory size: {}", s))?;
    let mib = value
        .checked_mul(factor)
        .ok_or_else(|| format!("memory size too large: {}", s))?;
    if mib < MIN_MEMORY_MIB {
        return Err(format!("memory must be at least {} MiB", MIN_MEMORY_MIB));
    }
    Ok(mib)
}
