/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/reporter/log.rs
*
* Reporter that writes every event to the structured log.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{
    ActiveEnvironmentDeletedReport, ActivePromotionReport, ComponentUpgradeReport,
    ImageMissingReport, PullRequestQueueReport, PullRequestTriggerReport, Reporter,
};
use crate::crds::ConfigSpec;
use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send_component_upgrade(&self, _config: &ConfigSpec, report: &ComponentUpgradeReport) -> Result<()> {
        info!(
            team = %report.team_name,
            namespace = %report.namespace,
            queue_type = %report.queue_type,
            success = report.is_success,
            components = report.components.len(),
            "Component upgrade finished."
        );
        Ok(())
    }

    async fn send_active_promotion_status(&self, _config: &ConfigSpec, report: &ActivePromotionReport) -> Result<()> {
        info!(
            team = %report.team_name,
            result = ?report.result,
            target = %report.target_namespace,
            active = %report.current_active_namespace,
            timeout = report.is_timeout,
            history = %report.history_name,
            "Active promotion finished."
        );
        Ok(())
    }

    async fn send_image_missing(&self, _config: &ConfigSpec, report: &ImageMissingReport) -> Result<()> {
        let images: Vec<String> = report.images.iter().map(ToString::to_string).collect();
        info!(team = %report.team_name, namespace = %report.namespace, ?images, "Images missing.");
        Ok(())
    }

    async fn send_pull_request_queue(&self, _config: &ConfigSpec, report: &PullRequestQueueReport) -> Result<()> {
        info!(
            team = %report.team_name,
            bundle = %report.bundle_name,
            pr = %report.pr_number,
            commit = %report.commit_sha,
            result = ?report.result,
            retry = report.no_of_retry,
            "Pull request queue finished."
        );
        Ok(())
    }

    async fn send_pull_request_trigger_result(
        &self,
        _config: &ConfigSpec,
        report: &PullRequestTriggerReport,
    ) -> Result<()> {
        info!(
            team = %report.team_name,
            bundle = %report.bundle_name,
            pr = %report.pr_number,
            result = ?report.result,
            "Pull request trigger finished."
        );
        Ok(())
    }

    async fn send_active_environment_deleted(
        &self,
        _config: &ConfigSpec,
        report: &ActiveEnvironmentDeletedReport,
    ) -> Result<()> {
        info!(
            team = %report.team_name,
            namespace = %report.active_namespace,
            by = %report.deleted_by,
            "Active environment deleted."
        );
        Ok(())
    }
}
