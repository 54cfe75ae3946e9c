/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/timeout.rs
*
* Duration parsing and timeout arithmetic.
*
* A phase is timed out when strictly more than the configured timeout has
* elapsed since the `lastTransitionTime` of the condition that marks its
* start. Exactly the timeout is not yet a timeout.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{condition_transition_time, Condition, ConditionType};
use crate::errors::Error;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::warn;

/// Parses durations such as `30s`, `5m`, `2h`, `1h30m` or `500ms`.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let input = s.trim();
    if input.is_empty() {
        return Err(Error::InvalidDuration(s.to_string()));
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(Error::InvalidDuration(s.to_string()));
        }
        let value = rest[..digits]
            .parse::<u64>()
            .map_err(|_| Error::InvalidDuration(s.to_string()))?;
        rest = &rest[digits..];

        let (unit, len) = if rest.starts_with("ms") {
            (Duration::from_millis(1), 2)
        } else if rest.starts_with('h') {
            (Duration::from_secs(3600), 1)
        } else if rest.starts_with('m') {
            (Duration::from_secs(60), 1)
        } else if rest.starts_with('s') {
            (Duration::from_secs(1), 1)
        } else {
            return Err(Error::InvalidDuration(s.to_string()));
        };
        rest = &rest[len..];
        total += unit * u32::try_from(value).map_err(|_| Error::InvalidDuration(s.to_string()))?;
    }
    Ok(total)
}

/// Inverse of `parse_duration` for whole seconds, e.g. `1h30m` or `45s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 {
        out.push_str(&format!("{}m", m));
    }
    if s > 0 {
        out.push_str(&format!("{}s", s));
    }
    out
}

pub fn is_timeout(started_at: DateTime<Utc>, timeout: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => now.signed_duration_since(started_at) > timeout,
        Err(_) => false,
    }
}

/// Whether the phase started by condition `type_` has run longer than
/// `timeout`. A phase that never started cannot time out.
pub fn is_timeout_from_config<T: ConditionType>(
    conditions: &[Condition],
    type_: T,
    timeout: Duration,
    now: DateTime<Utc>,
) -> bool {
    condition_transition_time(conditions, type_).is_some_and(|started| is_timeout(started, timeout, now))
}

/// Team override when present, valid and non-zero, else the global default.
pub fn override_duration(team: Option<&str>, default: Duration) -> Duration {
    match team.map(parse_duration) {
        Some(Ok(d)) if !d.is_zero() => d,
        Some(Err(e)) => {
            warn!(error = %e, "Ignoring invalid duration override.");
            default
        }
        _ => default,
    }
}

pub fn override_count(team: Option<u32>, default: u32) -> u32 {
    match team {
        Some(n) if n > 0 => n,
        _ => default,
    }
}

/// Serde adapter for `Duration` fields written as duration strings.
pub mod duration_str {
    use super::{format_duration, parse_duration};
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(de::Error::custom)
    }
}
