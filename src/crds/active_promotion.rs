/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/active_promotion.rs
*
* The `ActivePromotion` resource: one per team, named after the team, driving a
* blue/green swap of the team's pre-active namespace into the active slot.
*
* All cross-step state of the promotion lives in `status` so the controller can
* resume from whatever was last written after a restart. Conditions double as
* the phase timer: timeouts read the `lastTransitionTime` of the condition that
* marks the start of the phase being timed.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{Condition, ConditionType, QueueStatus};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const ACTIVE_PROMOTION_FINALIZER: &str = "samsahai.io/active-promotion";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "ActivePromotion",
    status = "ActivePromotionStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Result", "type":"string", "jsonPath":".status.result"}"#,
    printcolumn = r#"{"name":"Target", "type":"string", "jsonPath":".status.targetNamespace"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#,
    shortname = "atp"
)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promoted_by: Option<String>,
    #[serde(default)]
    pub no_of_retry: u32,
    /// Grace period before the previous active namespace is destroyed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tear_down_duration: Option<String>,
    #[serde(default)]
    pub skip_test_runner: bool,
    #[serde(default)]
    pub no_downtime_guarantee: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum PromotionState {
    Waiting,
    CreatingPreActive,
    DeployingComponents,
    TestingPreActive,
    CollectingPreActiveResult,
    Demoting,
    ActiveEnvironment,
    DestroyingPreviousActive,
    DestroyingPreActive,
    Rollback,
    Finished,
}

impl PromotionState {
    /// States in which deletion and the promotion timeout are ignored.
    pub fn is_uncancellable(&self) -> bool {
        matches!(
            self,
            PromotionState::Waiting
                | PromotionState::DestroyingPreviousActive
                | PromotionState::DestroyingPreActive
                | PromotionState::Finished
                | PromotionState::Rollback
        )
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
pub enum PromotionResult {
    #[default]
    Unknown,
    Success,
    Failure,
    Canceled,
}

/// Outcome of a demotion or a rollback.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PromotionCondition {
    Started,
    PreActiveCreated,
    Verified,
    ResultCollected,
    ActiveDemotionStarted,
    ActiveDemoted,
    ActivePromoted,
    RollbackStarted,
    PreviousActiveDestroyed,
    PreActiveDestroyed,
    Finished,
}

impl ConditionType for PromotionCondition {
    fn as_str(&self) -> &'static str {
        match self {
            PromotionCondition::Started => "ActivePromotionStarted",
            PromotionCondition::PreActiveCreated => "PreActiveCreated",
            PromotionCondition::Verified => "PreActiveVerified",
            PromotionCondition::ResultCollected => "ResultCollected",
            PromotionCondition::ActiveDemotionStarted => "ActiveDemotionStarted",
            PromotionCondition::ActiveDemoted => "ActiveDemoted",
            PromotionCondition::ActivePromoted => "ActivePromoted",
            PromotionCondition::RollbackStarted => "RollbackStarted",
            PromotionCondition::PreviousActiveDestroyed => "PreviousActiveDestroyed",
            PromotionCondition::PreActiveDestroyed => "PreActiveDestroyed",
            PromotionCondition::Finished => "Finished",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PromotionState>,
    #[serde(default)]
    pub result: PromotionResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub previous_active_namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destroyed_time: Option<String>,
    #[serde(default)]
    pub is_timeout: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demotion_status: Option<OutcomeStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_status: Option<OutcomeStatus>,
    /// Set once the terminal history record exists. Gates history and report
    /// emission so replays never duplicate them.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub active_promotion_history_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_active_queue: Option<QueueStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ActivePromotion {
    pub fn state(&self) -> Option<PromotionState> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn result(&self) -> PromotionResult {
        self.status.as_ref().map(|s| s.result).unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut ActivePromotionStatus {
        self.status.get_or_insert_with(ActivePromotionStatus::default)
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }
}
