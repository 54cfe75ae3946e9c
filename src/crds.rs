/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds.rs
*
* This file defines the Rust data structures that correspond to the Samsahai
* Custom Resource Definitions (CRDs). By using the `kube::CustomResource`
* derive macro, we create a strongly-typed representation of our custom APIs,
* enabling safe and idiomatic interaction with the Kubernetes API server.
*
* Architecture:
* - Each resource kind lives in its own submodule (`active_promotion`,
*   `pull_request`, `queue`, `history`, `team`, `config`) and is re-exported
*   here so controllers can simply `use crate::crds::...`.
* - This module holds the pieces shared by every kind: the condition list
*   (used both as an audit log and as the source of phase start times), the
*   queue component unit, image references, the waiting/running admission
*   labels, and RFC 3339 timestamp helpers.
* - Timestamps are stored as RFC 3339 strings to align with Kubernetes API
*   conventions for status fields.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod active_promotion;
pub mod config;
pub mod history;
pub mod pull_request;
pub mod queue;
pub mod team;

pub use active_promotion::*;
pub use config::*;
pub use history::*;
pub use pull_request::*;
pub use queue::*;
pub use team::*;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group shared by every Samsahai resource.
pub const GROUP: &str = "env.samsahai.io";

/// Label mirroring the coarse queue state, used only for admission listing.
pub const STATE_LABEL: &str = "state";
pub const STATE_WAITING: &str = "waiting";
pub const STATE_RUNNING: &str = "running";

/// Label carrying the owning team on histories and PR queues.
pub const TEAM_LABEL: &str = "samsahai.io/teamname";

// --- Timestamps ---

/// Formats a timestamp the way every status field stores it.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a stored status timestamp. Malformed values read as absent.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Converts into the apimachinery `Time` through its RFC 3339 wire form.
pub fn to_k8s_time(t: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(
        t.to_rfc3339_opts(SecondsFormat::Secs, true),
    ))
    .ok()
}

pub fn from_k8s_time(t: &Time) -> Option<DateTime<Utc>> {
    serde_json::to_value(t)
        .ok()
        .and_then(|v| v.as_str().and_then(parse_time))
}

/// Creation time of any object, as recorded by the store.
pub fn creation_time<K: kube::Resource>(obj: &K) -> Option<DateTime<Utc>> {
    obj.meta().creation_timestamp.as_ref().and_then(from_k8s_time)
}

// --- Conditions ---

/// Implemented by the per-resource condition enums so the shared list helpers
/// stay typed at the call site.
pub trait ConditionType: Copy {
    fn as_str(&self) -> &'static str;
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: bool,
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Appends a condition or updates it in place by type.
///
/// `lastTransitionTime` only moves when the condition is new or its status
/// flips, which keeps it usable as the start time of the phase it marks.
pub fn set_condition<T: ConditionType>(
    conditions: &mut Vec<Condition>,
    type_: T,
    status: bool,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_.as_str()) {
        if existing.status != status {
            existing.last_transition_time = format_time(now);
        }
        existing.status = status;
        existing.message = message;
        return;
    }
    conditions.push(Condition {
        type_: type_.as_str().to_string(),
        status,
        last_transition_time: format_time(now),
        message,
    });
}

pub fn find_condition<T: ConditionType>(conditions: &[Condition], type_: T) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_str())
}

pub fn is_condition_true<T: ConditionType>(conditions: &[Condition], type_: T) -> bool {
    find_condition(conditions, type_).is_some_and(|c| c.status)
}

/// When the phase marked by `type_` started, if it ever did.
pub fn condition_transition_time<T: ConditionType>(
    conditions: &[Condition],
    type_: T,
) -> Option<DateTime<Utc>> {
    find_condition(conditions, type_).and_then(|c| parse_time(&c.last_transition_time))
}

// --- Deployment units ---

/// An immutable deployment unit carried by every queue.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct QueueComponent {
    pub name: String,
    pub repository: String,
    pub version: String,
}

impl QueueComponent {
    pub fn new(name: impl Into<String>, repository: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repository: repository.into(),
            version: version.into(),
        }
    }

    pub fn image(&self) -> Image {
        Image {
            repository: self.repository.clone(),
            tag: self.version.clone(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub repository: String,
    #[serde(default)]
    pub tag: String,
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Sample;
    impl ConditionType for Sample {
        fn as_str(&self) -> &'static str {
            "Sample"
        }
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_is_unchanged() {
        let t0 = parse_time("2024-01-01T00:00:00Z").unwrap();
        let t1 = parse_time("2024-01-01T00:05:00Z").unwrap();
        let mut conditions = Vec::new();

        set_condition(&mut conditions, Sample, true, "first", t0);
        set_condition(&mut conditions, Sample, true, "second", t1);

        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "second");
        assert_eq!(condition_transition_time(&conditions, Sample), Some(t0));
    }

    #[test]
    fn test_set_condition_moves_transition_time_on_flip() {
        let t0 = parse_time("2024-01-01T00:00:00Z").unwrap();
        let t1 = parse_time("2024-01-01T00:05:00Z").unwrap();
        let mut conditions = Vec::new();

        set_condition(&mut conditions, Sample, true, "", t0);
        set_condition(&mut conditions, Sample, false, "", t1);

        assert!(!is_condition_true(&conditions, Sample));
        assert_eq!(condition_transition_time(&conditions, Sample), Some(t1));
    }
}
