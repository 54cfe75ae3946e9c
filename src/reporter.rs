/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/reporter.rs
*
* Outbound notifications about promotions, pull requests and deployments.
*
* Architecture:
* - `Reporter` has one method per event, each defaulting to a no-op. A
*   reporter overrides only the events it supports, so sending an event to a
*   reporter that does not handle it is silently ignored.
* - Reporters are built from a closed registry by name (`log`, `rest`).
* - Sending is fire-and-forget from the state machines' point of view:
*   `broadcast_*` helpers log failures and never fail the reconcile.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod log;
pub mod rest;

pub use self::log::LogReporter;
pub use rest::RestReporter;

use crate::crds::{
    ConfigSpec, Image, OutcomeStatus, PromotionResult, PromotionState, PullRequestQueueResult,
    PullRequestTriggerResult, QueueComponent, QueueType,
};
use crate::settings::Settings;
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpgradeReport {
    pub team_name: String,
    pub namespace: String,
    pub queue_type: QueueType,
    pub components: Vec<QueueComponent>,
    pub is_success: bool,
    pub no_of_retry: u32,
    pub image_missing_list: Vec<Image>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionReport {
    pub team_name: String,
    pub result: PromotionResult,
    pub state: Option<PromotionState>,
    pub promoted_by: Option<String>,
    pub target_namespace: String,
    pub previous_active_namespace: String,
    pub current_active_namespace: String,
    pub is_timeout: bool,
    pub demotion_status: Option<OutcomeStatus>,
    pub rollback_status: Option<OutcomeStatus>,
    pub no_of_retry: u32,
    pub image_missing_list: Vec<Image>,
    pub history_name: String,
    pub message: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageMissingReport {
    pub team_name: String,
    pub namespace: String,
    pub images: Vec<Image>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestQueueReport {
    pub team_name: String,
    pub bundle_name: String,
    pub pr_number: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    pub result: PullRequestQueueResult,
    pub pr_namespace: String,
    pub components: Vec<QueueComponent>,
    pub image_missing_list: Vec<Image>,
    pub no_of_retry: u32,
    pub max_retry: u32,
    pub history_name: String,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTriggerReport {
    pub team_name: String,
    pub bundle_name: String,
    pub pr_number: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    pub result: PullRequestTriggerResult,
    pub no_of_retry: u32,
    pub image_missing_list: Vec<Image>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEnvironmentDeletedReport {
    pub team_name: String,
    pub active_namespace: String,
    pub deleted_by: String,
    pub deleted_at: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send_component_upgrade(&self, _config: &ConfigSpec, _report: &ComponentUpgradeReport) -> Result<()> {
        Ok(())
    }

    async fn send_active_promotion_status(
        &self,
        _config: &ConfigSpec,
        _report: &ActivePromotionReport,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_image_missing(&self, _config: &ConfigSpec, _report: &ImageMissingReport) -> Result<()> {
        Ok(())
    }

    async fn send_pull_request_queue(&self, _config: &ConfigSpec, _report: &PullRequestQueueReport) -> Result<()> {
        Ok(())
    }

    async fn send_pull_request_trigger_result(
        &self,
        _config: &ConfigSpec,
        _report: &PullRequestTriggerReport,
    ) -> Result<()> {
        Ok(())
    }

    async fn send_active_environment_deleted(
        &self,
        _config: &ConfigSpec,
        _report: &ActiveEnvironmentDeletedReport,
    ) -> Result<()> {
        Ok(())
    }
}

/// Builds the reporters named in `names`.
pub fn build_reporters(names: &[String], settings: &Settings) -> Result<Vec<Arc<dyn Reporter>>> {
    names
        .iter()
        .map(|name| -> Result<Arc<dyn Reporter>> {
            match name.as_str() {
                "log" => Ok(Arc::new(LogReporter)),
                "rest" => Ok(Arc::new(RestReporter::new(settings.rest_endpoints.clone()))),
                other => bail!("Unknown reporter '{}'", other),
            }
        })
        .collect()
}

/// The reporters a team has enabled; all of them when it names none.
fn enabled_for<'a>(
    reporters: &'a [Arc<dyn Reporter>],
    config: &'a ConfigSpec,
) -> impl Iterator<Item = &'a Arc<dyn Reporter>> + 'a {
    let enabled = config
        .reporter
        .as_ref()
        .map(|r| r.enabled.as_slice())
        .unwrap_or(&[]);
    reporters
        .iter()
        .filter(move |r| enabled.is_empty() || enabled.iter().any(|e| e == r.name()))
}

fn log_failure(reporter: &dyn Reporter, event: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(reporter = reporter.name(), event, error = %format!("{:#}", e), "Failed to send report.");
    }
}

pub async fn broadcast_component_upgrade(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &ComponentUpgradeReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(r.as_ref(), "component-upgrade", r.send_component_upgrade(config, report).await);
    }
}

pub async fn broadcast_active_promotion_status(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &ActivePromotionReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(
            r.as_ref(),
            "active-promotion",
            r.send_active_promotion_status(config, report).await,
        );
    }
}

pub async fn broadcast_image_missing(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &ImageMissingReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(r.as_ref(), "image-missing", r.send_image_missing(config, report).await);
    }
}

pub async fn broadcast_pull_request_queue(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &PullRequestQueueReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(
            r.as_ref(),
            "pull-request-queue",
            r.send_pull_request_queue(config, report).await,
        );
    }
}

pub async fn broadcast_pull_request_trigger_result(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &PullRequestTriggerReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(
            r.as_ref(),
            "pull-request-trigger",
            r.send_pull_request_trigger_result(config, report).await,
        );
    }
}

pub async fn broadcast_active_environment_deleted(
    reporters: &[Arc<dyn Reporter>],
    config: &ConfigSpec,
    report: &ActiveEnvironmentDeletedReport,
) {
    for r in enabled_for(reporters, config) {
        log_failure(
            r.as_ref(),
            "active-environment-deleted",
            r.send_active_environment_deleted(config, report).await,
        );
    }
}
