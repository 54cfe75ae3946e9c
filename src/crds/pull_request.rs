/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/pull_request.rs
*
* Pull-request resources.
*
* - `PullRequestTrigger` is created per pushed commit and polls the image
*   registry until every image of the PR bundle is available (or it gives up).
* - `PullRequestQueue` is the ephemeral environment itself, keyed by
*   `<bundle>-<prNumber>` in the team's staging namespace. While waiting it
*   buffers re-submissions in the `upcoming*` fields; they only replace the
*   running `components`/`commitSHA` when the queue is admitted.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{Condition, ConditionType, Image, QueueComponent, QueueStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const PULL_REQUEST_QUEUE_FINALIZER: &str = "samsahai.io/pull-request-queue";

/// `<bundle>-<prNumber>`, shared by the trigger and the queue of one PR.
pub fn pull_request_key(bundle_name: &str, pr_number: &str) -> String {
    format!("{}-{}", bundle_name, pr_number)
}

// --- PullRequestQueue ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "PullRequestQueue",
    namespaced,
    status = "PullRequestQueueStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Order", "type":"integer", "jsonPath":".spec.noOfOrder"}"#,
    printcolumn = r#"{"name":"Commit", "type":"string", "jsonPath":".spec.commitSHA"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "prq"
)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestQueueSpec {
    pub team_name: String,
    pub bundle_name: String,
    pub pr_number: String,
    #[serde(rename = "commitSHA", default)]
    pub commit_sha: String,
    #[serde(rename = "upcomingCommitSHA", default)]
    pub upcoming_commit_sha: String,
    #[serde(default)]
    pub components: Vec<QueueComponent>,
    #[serde(default)]
    pub upcoming_components: Vec<QueueComponent>,
    #[serde(default)]
    pub no_of_retry: u32,
    #[serde(default)]
    pub no_of_order: i32,
    #[serde(
        rename = "isPRTriggerFailed",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub is_pr_trigger_failed: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PullRequestQueueState {
    Waiting,
    EnvCreating,
    Deploying,
    Testing,
    Collecting,
    EnvDestroying,
    Finished,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum PullRequestQueueResult {
    #[default]
    Unknown,
    Success,
    Failure,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullRequestQueueCondition {
    Started,
    EnvCreated,
    DependenciesUpdated,
    Deployed,
    Tested,
    ResultCollected,
    EnvDestroyed,
}

impl ConditionType for PullRequestQueueCondition {
    fn as_str(&self) -> &'static str {
        match self {
            PullRequestQueueCondition::Started => "PullRequestQueueStarted",
            PullRequestQueueCondition::EnvCreated => "PullRequestEnvCreated",
            PullRequestQueueCondition::DependenciesUpdated => "PullRequestDependenciesUpdated",
            PullRequestQueueCondition::Deployed => "PullRequestDeployed",
            PullRequestQueueCondition::Tested => "PullRequestTested",
            PullRequestQueueCondition::ResultCollected => "PullRequestResultCollected",
            PullRequestQueueCondition::EnvDestroyed => "PullRequestEnvDestroyed",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestQueueStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PullRequestQueueState>,
    #[serde(default)]
    pub result: PullRequestQueueResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pr_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroyed_time: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pull_request_queue_history_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_queue: Option<QueueStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_missing_list: Vec<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl PullRequestQueue {
    pub fn state(&self) -> Option<PullRequestQueueState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn result(&self) -> PullRequestQueueResult {
        self.status.as_ref().map(|s| s.result).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut PullRequestQueueStatus {
        self.status.get_or_insert_with(PullRequestQueueStatus::default)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    pub fn is_trigger_failed(&self) -> bool {
        self.spec.is_pr_trigger_failed == Some(true)
    }

    pub fn is_commit_changed(&self) -> bool {
        !self.spec.upcoming_commit_sha.is_empty()
            && self.spec.commit_sha != self.spec.upcoming_commit_sha
    }
}

// --- PullRequestTrigger ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "PullRequestTrigger",
    namespaced,
    status = "PullRequestTriggerStatus",
    printcolumn = r#"{"name":"Result", "type":"string", "jsonPath":".status.result"}"#,
    printcolumn = r#"{"name":"Retries", "type":"integer", "jsonPath":".status.noOfRetry"}"#,
    shortname = "prt"
)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTriggerSpec {
    pub team_name: String,
    pub bundle_name: String,
    pub pr_number: String,
    #[serde(rename = "commitSHA", default)]
    pub commit_sha: String,
    /// Per-component image overrides. Unlisted components use the bundle config.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<QueueComponent>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PullRequestTriggerResult {
    Success,
    Failure,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTriggerStatus {
    #[serde(default)]
    pub no_of_retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_processed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PullRequestTriggerResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_missing_list: Vec<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PullRequestTriggerCondition {
    Started,
    Finished,
}

impl ConditionType for PullRequestTriggerCondition {
    fn as_str(&self) -> &'static str {
        match self {
            PullRequestTriggerCondition::Started => "PullRequestTriggerStarted",
            PullRequestTriggerCondition::Finished => "PullRequestTriggerFinished",
        }
    }
}

impl PullRequestTrigger {
    pub fn status_mut(&mut self) -> &mut PullRequestTriggerStatus {
        self.status.get_or_insert_with(PullRequestTriggerStatus::default)
    }
}
