/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/team.rs
*
* The `Team` resource owns the record of which namespace currently plays
* which role (staging, pre-active, active, previous active, pull requests).
* Promotion swaps are expressed as writes to `status.namespace`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{Condition, ConditionType};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Prefix of every namespace created for a team.
pub const NAMESPACE_PREFIX: &str = "s2h-";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "Team",
    status = "TeamStatus",
    printcolumn = r#"{"name":"Staging", "type":"string", "jsonPath":".status.namespace.staging"}"#,
    printcolumn = r#"{"name":"Active", "type":"string", "jsonPath":".status.namespace.active"}"#,
    shortname = "tm"
)]
#[serde(rename_all = "camelCase")]
pub struct TeamSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owners: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamNamespace {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub staging: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pre_active: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous_active: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pull_requests: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeamStatus {
    #[serde(default)]
    pub namespace: TeamNamespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_promoted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamCondition {
    PreActiveEnvironmentCreated,
    ActiveEnvironmentPromoted,
}

impl ConditionType for TeamCondition {
    fn as_str(&self) -> &'static str {
        match self {
            TeamCondition::PreActiveEnvironmentCreated => "PreActiveEnvironmentCreated",
            TeamCondition::ActiveEnvironmentPromoted => "ActiveEnvironmentPromoted",
        }
    }
}

impl Team {
    pub fn namespaces(&self) -> TeamNamespace {
        self.status
            .as_ref()
            .map(|s| s.namespace.clone())
            .unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut TeamStatus {
        self.status.get_or_insert_with(TeamStatus::default)
    }

    /// The staging namespace, falling back to the `s2h-<team>` convention.
    pub fn staging_namespace(&self, team_name: &str) -> String {
        let recorded = self.namespaces().staging;
        if !recorded.is_empty() {
            return recorded;
        }
        self.spec
            .staging_namespace
            .clone()
            .unwrap_or_else(|| format!("{}{}", NAMESPACE_PREFIX, team_name))
    }
}
