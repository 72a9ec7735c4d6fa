//! Byte count helpers: human-readable formatting and memory size parsing.

use std::fmt;
use std::fs;

const MEMINFO_PATH: &str = "/proc/meminfo";
const FALLBACK_SYSTEM_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Format a byte count into IEC units (KiB, MiB, GiB, TiB) with trimmed precision.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit_index = 0;

    while value >= 1024.0 && unit_index < UNITS.len() - 1 {
        value /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        return format!("{bytes} {}", UNITS[unit_index]);
    }

    let mut value_str = if value >= 10.0 {
        format!("{value:.1}")
    } else {
        format!("{value:.2}")
    };

    if value_str.contains('.') {
        while value_str.ends_with('0') {
            value_str.pop();
        }
        if value_str.ends_with('.') {
            value_str.pop();
        }
    }

    format!("{value_str} {}", UNITS[unit_index])
}

/// A memory bound given either absolutely or relative to a reference amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemorySize {
    Bytes(u64),
    Percent(f64),
}

impl MemorySize {
    /// Resolve against `reference` bytes (only used for percentages).
    pub fn resolve(self, reference: u64) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Percent(percent) => (reference as f64 * percent / 100.0) as u64,
        }
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(bytes) => f.write_str(&format_bytes(*bytes)),
            Self::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}

/// Parse `"1%"`, `"512mb"`, `"2gb"`, `"4096"` and similar.
///
/// Suffixes are binary multiples and case-insensitive.
pub fn parse_memory_size(input: &str) -> Result<MemorySize, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("value is empty".to_string());
    }

    if let Some(number) = trimmed.strip_suffix('%') {
        let percent: f64 = number
            .trim()
            .parse()
            .map_err(|err| format!("invalid percentage `{trimmed}`: {err}"))?;
        if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
            return Err(format!("percentage `{trimmed}` must be in (0, 100]"));
        }
        return Ok(MemorySize::Percent(percent));
    }

    let lower = trimmed.to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|err| format!("invalid size `{trimmed}`: {err}"))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        other => return Err(format!("unknown size unit `{other}` in `{trimmed}`")),
    };

    value
        .checked_mul(multiplier)
        .map(MemorySize::Bytes)
        .ok_or_else(|| format!("size `{trimmed}` overflows"))
}

/// Total physical memory of the host, from `/proc/meminfo` when available.
pub fn system_memory_bytes() -> u64 {
    fs::read_to_string(MEMINFO_PATH)
        .ok()
        .and_then(|content| parse_meminfo_total(&content))
        .unwrap_or(FALLBACK_SYSTEM_MEMORY_BYTES)
}

fn parse_meminfo_total(content: &str) -> Option<u64> {
    let line = content.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line
        .trim_start_matches("MemTotal:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    kib.checked_mul(1024)
}
