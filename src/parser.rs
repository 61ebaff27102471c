use crate::health::Classification;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

const FOOTER_MARKER: &str = "unused devices";
const NAME_MARKER: &str = " : ";
const CHUNK_SEPARATOR: &str = "\n\n";
const RECOVERY_MARKER: &str = "recovery =";
const EXPLICIT_FAILURE_MARKERS: [&str; 3] = ["inactive", "(F)", "(E)"];
const ZERO_REDUNDANCY_MARKERS: [&str; 2] = ["raid0", "linear"];

// Heuristic: any "_" inside a bracketed sync-status group such as [UU_U] or [_].
// The [n/m] member counts are not compared.
static DEGRADED_MEMBERS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[U_]*_[U_]*\]").unwrap());

static RECOVERY_PERCENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"recovery\s*=\s*([0-9]+(?:\.[0-9]+)?)%").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ExplicitFlag,
    DegradedMembers,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub personality: Option<String>,
    pub failed: bool,
    pub reason: Option<FailureReason>,
    pub recovering: bool,
    pub recovery_percent: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub devices: Vec<DeviceStatus>,
}

impl Report {
    pub fn classification(&self) -> Classification {
        if self.devices.is_empty() {
            return Classification::Missing;
        }
        let failed = self
            .devices
            .iter()
            .filter(|d| d.failed)
            .map(|d| d.name.clone())
            .collect();
        Classification::from_failed(failed)
    }

    pub fn failed_count(&self) -> usize {
        self.devices.iter().filter(|d| d.failed).count()
    }
}

pub fn parse(raw: &str) -> Classification {
    parse_report(raw).classification()
}

pub fn parse_report(raw: &str) -> Report {
    let body = strip_footer(strip_header(raw));
    let devices = body
        .split(CHUNK_SEPARATOR)
        .filter(|chunk| !chunk.trim().is_empty())
        .filter_map(parse_chunk)
        .collect();
    Report { devices }
}

fn strip_header(raw: &str) -> &str {
    match raw.find('\n') {
        Some(idx) => &raw[idx + 1..],
        None => "",
    }
}

fn strip_footer(body: &str) -> &str {
    let footer_at = body
        .match_indices(FOOTER_MARKER)
        .map(|(idx, _)| idx)
        .find(|&idx| idx == 0 || body[..idx].ends_with('\n'));
    match footer_at {
        Some(idx) => &body[..idx],
        None => body,
    }
}

fn parse_chunk(chunk: &str) -> Option<DeviceStatus> {
    let chunk = chunk.trim_start_matches('\n');
    // Without a usable name the first line stands in for it so flags are still seen.
    let (name, rest) = match chunk.split_once(NAME_MARKER) {
        Some((name, rest)) if !name.trim().is_empty() => (name.trim(), rest),
        _ => (chunk.lines().map(str::trim).find(|l| !l.is_empty())?, ""),
    };

    let recovering = chunk.contains(RECOVERY_MARKER);
    let reason = failure_reason(chunk, recovering);
    let recovery_percent = if recovering {
        recovery_percent(chunk)
    } else {
        None
    };

    Some(DeviceStatus {
        name: name.to_string(),
        personality: personality(rest),
        failed: reason.is_some(),
        reason,
        recovering,
        recovery_percent,
    })
}

fn failure_reason(chunk: &str, recovering: bool) -> Option<FailureReason> {
    if EXPLICIT_FAILURE_MARKERS.iter().any(|m| chunk.contains(m)) {
        return Some(FailureReason::ExplicitFlag);
    }

    let zero_redundancy = ZERO_REDUNDANCY_MARKERS.iter().any(|m| chunk.contains(m));
    // A rebuilding array always shows down members; that is expected, not an alarm.
    if !zero_redundancy && !recovering && DEGRADED_MEMBERS_REGEX.is_match(chunk) {
        return Some(FailureReason::DegradedMembers);
    }

    None
}

fn personality(rest: &str) -> Option<String> {
    rest.lines()
        .next()?
        .split_whitespace()
        .find(|t| !matches!(*t, "active" | "inactive") && !t.starts_with('('))
        .filter(|t| !t.contains('['))
        .map(str::to_string)
}

fn recovery_percent(chunk: &str) -> Option<f64> {
    RECOVERY_PERCENT_REGEX
        .captures(chunk)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}
