//! Parsers for user-supplied VM options.
//!
//! Each parser takes the raw string form (as received from a CLI flag or an
//! HTTP body) and returns a typed value or a [`CoreError`] naming the
//! offending flag. `None` inputs fall back to the documented default.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::CoreError;
use crate::network::{Cidr, NetworkPolicy};
use crate::record::VmRecord;

/// Default vCPU count.
pub const DEFAULT_VCPUS: u32 = 1;
/// Default guest memory.
pub const DEFAULT_MEMORY_MIB: u32 = 128;
/// Default root disk size.
pub const DEFAULT_DISK_GB: u32 = 10;

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

fn parse_integer_flag(
    flag: &'static str,
    value: Option<&str>,
    fallback: u32,
    min: u32,
    max: u32,
    unit: &'static str,
) -> Result<u32, CoreError> {
    let Some(raw) = value else {
        return Ok(fallback);
    };
    match raw.trim().parse::<u32>() {
        Ok(n) if (min..=max).contains(&n) => Ok(n),
        _ => Err(CoreError::InvalidInteger {
            flag,
            value: raw.to_owned(),
            min: u64::from(min),
            max: u64::from(max),
            unit,
        }),
    }
}

/// vCPU count in `1..=32`, default 1.
///
/// # Errors
/// Returns [`CoreError::InvalidInteger`] for non-integers or out-of-range values.
pub fn parse_vcpu_count(value: Option<&str>) -> Result<u32, CoreError> {
    parse_integer_flag("vcpus", value, DEFAULT_VCPUS, 1, 32, "")
}

/// Guest memory in `128..=32768` MiB, default 128.
///
/// # Errors
/// Returns [`CoreError::InvalidInteger`] for non-integers or out-of-range values.
pub fn parse_memory_mib(value: Option<&str>) -> Result<u32, CoreError> {
    parse_integer_flag("memory", value, DEFAULT_MEMORY_MIB, 128, 32_768, " MiB")
}

/// Splits a trailing alphabetic unit off a number, case-insensitively.
fn split_unit(raw: &str) -> (&str, String) {
    let idx = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    (&raw[..idx], raw[idx..].to_ascii_lowercase())
}

/// Disk size in GB (`10`, `10g`, `10gb`, `10gib`), `1..=1024`, default 10.
///
/// # Errors
/// Returns [`CoreError::InvalidDiskSize`] on malformed or out-of-range input.
pub fn parse_disk_size_gb(value: Option<&str>) -> Result<u32, CoreError> {
    let Some(raw) = value else {
        return Ok(DEFAULT_DISK_GB);
    };
    let invalid = || CoreError::InvalidDiskSize { value: raw.to_owned() };
    let (digits, unit) = split_unit(raw.trim());
    if digits.is_empty() || !matches!(unit.as_str(), "" | "gb" | "g" | "gib") {
        return Err(invalid());
    }
    match digits.parse::<u32>() {
        Ok(n) if (1..=1024).contains(&n) => Ok(n),
        _ => Err(invalid()),
    }
}

/// Optional egress bandwidth (`100`, `100m`, `100mbit`) in `1..=1000`.
///
/// # Errors
/// Returns [`CoreError::InvalidInteger`] on malformed or out-of-range input.
pub fn parse_bandwidth(value: Option<&str>) -> Result<Option<u32>, CoreError> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let invalid = || CoreError::InvalidInteger {
        flag: "bandwidth",
        value: raw.to_owned(),
        min: 1,
        max: 1000,
        unit: " mbit",
    };
    let (digits, unit) = split_unit(raw.trim());
    if digits.is_empty() || !matches!(unit.as_str(), "" | "m" | "mbit") {
        return Err(invalid());
    }
    match digits.parse::<u32>() {
        Ok(n) if (1..=1000).contains(&n) => Ok(Some(n)),
        _ => Err(invalid()),
    }
}

/// Validates a single published port.
///
/// # Errors
/// Returns [`CoreError::InvalidPort`] unless `1 <= port <= 65535`.
pub fn validate_port(port: u32) -> Result<u16, CoreError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| CoreError::InvalidPort { value: port.to_string() })
}

/// Comma-separated list of published ports.
///
/// # Errors
/// Returns [`CoreError::InvalidPort`] for the first invalid entry.
pub fn parse_published_ports(value: Option<&str>) -> Result<Vec<u16>, CoreError> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(|p| {
            let p = p.trim();
            p.parse::<u32>()
                .map_err(|_| CoreError::InvalidPort { value: p.to_owned() })
                .and_then(validate_port)
        })
        .collect()
}

/// Network policy name, default `allow-all`.
///
/// # Errors
/// Returns [`CoreError::InvalidNetworkPolicy`] for unknown names.
pub fn parse_network_policy(value: Option<&str>) -> Result<NetworkPolicy, CoreError> {
    match value.filter(|v| !v.is_empty()) {
        None => Ok(NetworkPolicy::AllowAll),
        Some(v) => v.parse(),
    }
}

fn is_valid_label(label: &str) -> bool {
    let bytes = label.as_bytes();
    let Some((&first, &last)) = bytes.first().zip(bytes.last()) else {
        return false;
    };
    label.len() <= MAX_LABEL_LEN
        && first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

/// Validates and lowercases one domain pattern.
///
/// A single leading `*.` wildcard is allowed; every label must follow
/// hostname rules and the zone may not exceed 253 characters.
///
/// # Errors
/// Returns [`CoreError::InvalidDomain`] describing the first violation.
pub fn validate_domain_pattern(domain: &str) -> Result<String, CoreError> {
    let invalid = |detail: &str| CoreError::InvalidDomain {
        domain: domain.to_owned(),
        detail: if detail.is_empty() { String::new() } else { format!(". {detail}") },
    };

    if domain.chars().any(char::is_whitespace) {
        return Err(invalid(""));
    }

    let normalized = domain.to_ascii_lowercase();
    let wildcards = normalized.matches('*').count();
    if wildcards > 0 && !normalized.starts_with("*.") {
        return Err(invalid("Wildcards are only supported as a leading \"*.\" prefix."));
    }
    if wildcards > 1 {
        return Err(invalid(""));
    }

    let zone = normalized.strip_prefix("*.").unwrap_or(&normalized);
    if zone.is_empty() || zone.len() > MAX_DOMAIN_LEN || !zone.split('.').all(is_valid_label) {
        return Err(invalid(""));
    }

    Ok(normalized)
}

/// Comma-separated domain patterns; empty entries are dropped.
///
/// # Errors
/// Returns [`CoreError::InvalidDomain`] for the first invalid entry.
pub fn parse_domains(value: Option<&str>) -> Result<Vec<String>, CoreError> {
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(validate_domain_pattern)
        .collect()
}

/// Comma-separated CIDR list; empty entries are dropped.
///
/// # Errors
/// Returns [`CoreError::InvalidCidr`] for the first invalid entry.
pub fn parse_cidr_list(value: Option<&str>) -> Result<Vec<Cidr>, CoreError> {
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::parse)
        .collect()
}

/// Parses a timeout such as `30m`, `1h30m`, `2d`, `45s` or a bare number of
/// minutes.
///
/// # Errors
/// Returns [`CoreError::InvalidDuration`] if no `<number><unit>` component is
/// present or any other text remains.
pub fn parse_duration(input: &str) -> Result<Duration, CoreError> {
    let invalid = || CoreError::InvalidDuration { input: input.to_owned() };

    if let Ok(minutes) = input.parse::<u64>() {
        return Ok(Duration::from_secs(minutes.saturating_mul(60)));
    }

    let mut total: u64 = 0;
    let mut matched = false;
    let mut rest = input.trim();
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        rest = rest[digits_end..].trim_start();
        let mut chars = rest.chars();
        let secs_per_unit = match chars.next().map(|c| c.to_ascii_lowercase()) {
            Some('d') => 86_400,
            Some('h') => 3_600,
            Some('m') => 60,
            Some('s') => 1,
            _ => return Err(invalid()),
        };
        total = total.saturating_add(value.saturating_mul(secs_per_unit));
        matched = true;
        rest = chars.as_str().trim_start();
    }

    if matched {
        Ok(Duration::from_secs(total))
    } else {
        Err(invalid())
    }
}

/// Rejects `requested` ports already published by a creating or running VM.
///
/// # Errors
/// Returns [`CoreError::PortConflict`] listing every collision as
/// `port (in use by id, id)`.
pub fn check_port_conflicts<'a>(
    requested: &[u16],
    existing: impl IntoIterator<Item = &'a VmRecord>,
) -> Result<(), CoreError> {
    if requested.is_empty() {
        return Ok(());
    }

    let mut collisions: BTreeMap<u16, Vec<&str>> = BTreeMap::new();
    for record in existing.into_iter().filter(|r| r.status.holds_slot()) {
        for port in &record.network.published_ports {
            if requested.contains(port) {
                collisions.entry(*port).or_default().push(record.id.as_str());
            }
        }
    }

    if collisions.is_empty() {
        return Ok(());
    }

    let summary = collisions
        .iter()
        .map(|(port, ids)| format!("{port} (in use by {})", ids.join(", ")))
        .collect::<Vec<_>>()
        .join(", ");
    Err(CoreError::PortConflict { summary })
}
