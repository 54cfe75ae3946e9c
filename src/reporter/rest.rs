/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/reporter/rest.rs
*
* Reporter that POSTs events as JSON to a list of HTTP endpoints. The team's
* `reporter.rest.endpoints` replaces the global endpoints when set. Component
* upgrades are not reported over REST.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{
    ActiveEnvironmentDeletedReport, ActivePromotionReport, ImageMissingReport,
    PullRequestQueueReport, PullRequestTriggerReport, Reporter,
};
use crate::crds::ConfigSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

pub struct RestReporter {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    event: &'a str,
    payload: &'a T,
}

impl RestReporter {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
        }
    }

    fn endpoints<'a>(&'a self, config: &'a ConfigSpec) -> &'a [String] {
        match config.reporter.as_ref().and_then(|r| r.rest.as_ref()) {
            Some(rest) if !rest.endpoints.is_empty() => &rest.endpoints,
            _ => &self.endpoints,
        }
    }

    async fn post<T: Serialize + Sync>(&self, config: &ConfigSpec, event: &str, payload: &T) -> Result<()> {
        for endpoint in self.endpoints(config) {
            debug!(endpoint = %endpoint, event, "Posting report.");
            self.client
                .post(endpoint)
                .json(&Envelope { event, payload })
                .send()
                .await
                .with_context(|| format!("Failed to send '{}' report to {}", event, endpoint))?
                .error_for_status()
                .with_context(|| format!("Endpoint {} rejected '{}' report", endpoint, event))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reporter for RestReporter {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn send_active_promotion_status(&self, config: &ConfigSpec, report: &ActivePromotionReport) -> Result<()> {
        self.post(config, "active-promotion", report).await
    }

    async fn send_image_missing(&self, config: &ConfigSpec, report: &ImageMissingReport) -> Result<()> {
        self.post(config, "image-missing", report).await
    }

    async fn send_pull_request_queue(&self, config: &ConfigSpec, report: &PullRequestQueueReport) -> Result<()> {
        self.post(config, "pull-request-queue", report).await
    }

    async fn send_pull_request_trigger_result(
        &self,
        config: &ConfigSpec,
        report: &PullRequestTriggerReport,
    ) -> Result<()> {
        self.post(config, "pull-request-trigger", report).await
    }

    async fn send_active_environment_deleted(
        &self,
        config: &ConfigSpec,
        report: &ActiveEnvironmentDeletedReport,
    ) -> Result<()> {
        self.post(config, "active-environment-deleted", report).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ReporterConfig, RestReporterConfig};

    #[test]
    fn test_team_endpoints_replace_global_ones() {
        let reporter = RestReporter::new(vec!["http://global/hook".into()]);
        assert_eq!(reporter.endpoints(&ConfigSpec::default()), ["http://global/hook"]);

        let config = ConfigSpec {
            reporter: Some(ReporterConfig {
                enabled: vec![],
                rest: Some(RestReporterConfig {
                    endpoints: vec!["http://team/hook".into()],
                }),
            }),
            ..Default::default()
        };
        assert_eq!(reporter.endpoints(&config), ["http://team/hook"]);
    }

    #[test]
    fn test_envelope_shape() {
        let payload = serde_json::json!({"teamName": "alpha"});
        let body = serde_json::to_value(Envelope {
            event: "image-missing",
            payload: &payload,
        })
        .unwrap();
        assert_eq!(body["event"], "image-missing");
        assert_eq!(body["payload"]["teamName"], "alpha");
    }
}
