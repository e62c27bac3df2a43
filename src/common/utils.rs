//! Utility functions shared by the controllers

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

/// vPool names end up in service names, mountpoints and namespace prefixes
static VPOOL_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-z][\-a-z0-9]{1,20}[a-z0-9]$").expect("static regex is valid")
});

/// Byte count with a binary unit, as printed in the installer logs
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_idx])
}

/// Milliseconds since the Unix epoch
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Validate a vPool name
pub fn validate_vpool_name(name: &str) -> crate::Result<()> {
    if !VPOOL_NAME_REGEX.is_match(name) {
        return Err(crate::Error::InvalidParameter(format!(
            "invalid vPool name '{}': expected 3-22 lowercase alphanumerics or dashes",
            name
        )));
    }
    Ok(())
}

/// Validate a dotted IPv4 address
pub fn validate_ipv4(ip: &str) -> crate::Result<Ipv4Addr> {
    ip.parse::<Ipv4Addr>()
        .map_err(|_| crate::Error::InvalidParameter(format!("invalid IPv4 address '{}'", ip)))
}

/// Round to 5 decimals, the precision MDS loads are compared at
pub fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}
