/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/history.rs
*
* Append-only archives of terminal promotions and pull-request queues. Each
* record embeds a deep copy of the archived resource's spec and status at the
* time it was written and carries the team label used for pruning.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{ActivePromotionSpec, ActivePromotionStatus, PullRequestQueueSpec, PullRequestQueueStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionSnapshot {
    pub spec: ActivePromotionSpec,
    #[serde(default)]
    pub status: ActivePromotionStatus,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "ActivePromotionHistory",
    printcolumn = r#"{"name":"Team", "type":"string", "jsonPath":".spec.teamName"}"#,
    printcolumn = r#"{"name":"Success", "type":"boolean", "jsonPath":".spec.isSuccess"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "atph"
)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionHistorySpec {
    pub team_name: String,
    pub active_promotion: ActivePromotionSnapshot,
    #[serde(default)]
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestQueueSnapshot {
    pub spec: PullRequestQueueSpec,
    #[serde(default)]
    pub status: PullRequestQueueStatus,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "PullRequestQueueHistory",
    namespaced,
    printcolumn = r#"{"name":"Success", "type":"boolean", "jsonPath":".spec.isSuccess"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "prqh"
)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestQueueHistorySpec {
    pub team_name: String,
    pub pull_request_queue: PullRequestQueueSnapshot,
    #[serde(default)]
    pub is_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}
