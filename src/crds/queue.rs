/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/queue.rs
*
* Deployment queues and stable component snapshots.
*
* A `Queue` is the unit of work handed to the deploy engine: an ordered list of
* components to install into one namespace, tagged with the purpose of the
* deployment (`pre-active`, `promote-to-active`, ...). The promotion and
* pull-request state machines only create queues and poll their status; the
* queue controller drives each queue through detection, deployment, testing
* and collection.
*
* A `StableComponent` records the version of a component that is currently
* considered good in a namespace. New pre-active environments are seeded from
* the staging namespace's stable components.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{Condition, ConditionType, Image, QueueComponent};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueType {
    #[default]
    Upgrade,
    PreActive,
    PromoteToActive,
    DemoteFromActive,
    PullRequest,
    Reverify,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Upgrade => "upgrade",
            QueueType::PreActive => "pre-active",
            QueueType::PromoteToActive => "promote-to-active",
            QueueType::DemoteFromActive => "demote-from-active",
            QueueType::PullRequest => "pull-request",
            QueueType::Reverify => "reverify",
        }
    }
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum QueueState {
    Waiting,
    DetectingImageMissing,
    Creating,
    Testing,
    Collecting,
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueCondition {
    ImageMissingDetected,
    DeployStarted,
    Deployed,
    TestStarted,
    Tested,
    Finished,
}

impl ConditionType for QueueCondition {
    fn as_str(&self) -> &'static str {
        match self {
            QueueCondition::ImageMissingDetected => "QueueImageMissingDetected",
            QueueCondition::DeployStarted => "QueueDeployStarted",
            QueueCondition::Deployed => "QueueDeployed",
            QueueCondition::TestStarted => "QueueTestStarted",
            QueueCondition::Tested => "QueueTested",
            QueueCondition::Finished => "QueueFinished",
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "Queue",
    namespaced,
    status = "QueueStatus",
    printcolumn = r#"{"name":"Type", "type":"string", "jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "q"
)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub team_name: String,
    #[serde(rename = "type")]
    pub type_: QueueType,
    pub components: Vec<QueueComponent>,
    #[serde(default)]
    pub skip_test_runner: bool,
    #[serde(default)]
    pub no_of_retry: u32,
    #[serde(default)]
    pub no_of_order: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit_sha: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pr_number: String,
}

/// Also used as the snapshot of a deployment that promotions and PR queues
/// copy into their own status.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<QueueState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_deploy_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_missing_list: Vec<Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl QueueStatus {
    pub fn is_finished(&self) -> bool {
        self.state == Some(QueueState::Finished)
    }

    /// The engine has been invoked for this queue, successfully or not.
    pub fn is_deploy_attempted(&self) -> bool {
        self.is_finished()
            || (self.state != Some(QueueState::Creating) && self.start_deploy_time.is_some())
    }

    pub fn is_deploy_success(&self) -> bool {
        self.deploy_result == Some(true)
    }

    /// Deployed and, unless testing was skipped, tested successfully.
    pub fn is_success(&self) -> bool {
        self.is_deploy_success() && self.test_result != Some(false)
    }
}

impl Queue {
    pub fn state(&self) -> Option<QueueState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn status_or_default(&self) -> QueueStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut QueueStatus {
        self.status.get_or_insert_with(QueueStatus::default)
    }
}

// --- StableComponent ---

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "StableComponent",
    namespaced,
    printcolumn = r#"{"name":"Repository", "type":"string", "jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    shortname = "stbc"
)]
#[serde(rename_all = "camelCase")]
pub struct StableComponentSpec {
    pub name: String,
    pub repository: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl StableComponent {
    pub fn to_queue_component(&self) -> QueueComponent {
        QueueComponent::new(&self.spec.name, &self.spec.repository, &self.spec.version)
    }
}
