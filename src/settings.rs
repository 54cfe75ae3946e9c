/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/settings.rs
*
* Process-wide defaults and the team-level override resolution on top of them.
*
* `Settings` is read once at startup from the YAML file named by
* `SAMSAHAI_CONFIG` (defaults when unset), then a few fields can be overridden
* from the environment. Every numeric or duration knob a team may also set in
* its `Config` resource is resolved through `PromotionPolicy` or
* `PullRequestPolicy`: the team value wins when present and non-zero.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{ConfigSpec, TearDownCriteria};
use crate::timeout::{duration_str, override_count, override_duration, parse_duration};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "SAMSAHAI_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivePromotionSettings {
    /// Promotions allowed to run at once across all teams.
    pub concurrences: usize,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    #[serde(with = "duration_str")]
    pub demotion_timeout: Duration,
    #[serde(with = "duration_str")]
    pub rollback_timeout: Duration,
    pub max_retry: u32,
    pub max_histories: u32,
    #[serde(with = "duration_str")]
    pub tear_down_duration: Duration,
}

impl Default for ActivePromotionSettings {
    fn default() -> Self {
        Self {
            concurrences: 1,
            timeout: Duration::from_secs(30 * 60),
            demotion_timeout: Duration::from_secs(3 * 60),
            rollback_timeout: Duration::from_secs(5 * 60),
            max_retry: 0,
            max_histories: 7,
            tear_down_duration: Duration::from_secs(20 * 60),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PullRequestSettings {
    /// Pull request queues allowed to run at once per staging namespace.
    pub concurrences: u32,
    pub max_retry: u32,
    pub max_history_days: u32,
    #[serde(with = "duration_str")]
    pub tear_down_duration: Duration,
    pub tear_down_criteria: TearDownCriteria,
    #[serde(with = "duration_str")]
    pub trigger_polling_time: Duration,
    pub trigger_max_retry: u32,
}

impl Default for PullRequestSettings {
    fn default() -> Self {
        Self {
            concurrences: 2,
            max_retry: 0,
            max_history_days: 7,
            tear_down_duration: Duration::ZERO,
            tear_down_criteria: TearDownCriteria::Both,
            trigger_polling_time: Duration::from_secs(5 * 60),
            trigger_max_retry: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub active_promotion: ActivePromotionSettings,
    pub pull_request: PullRequestSettings,
    /// Deploy engine used when the team config does not pick one.
    pub deploy_engine: String,
    #[serde(with = "duration_str")]
    pub deploy_timeout: Duration,
    pub reporters: Vec<String>,
    pub rest_endpoints: Vec<String>,
    pub image_checker: String,
    pub test_runner: String,
    /// Concurrent reconciles per controller.
    pub workers: u16,
    pub metrics_port: u16,
    pub service_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_promotion: ActivePromotionSettings::default(),
            pull_request: PullRequestSettings::default(),
            deploy_engine: "helm".to_string(),
            deploy_timeout: Duration::from_secs(30 * 60),
            reporters: vec!["log".to_string()],
            rest_endpoints: Vec::new(),
            image_checker: "registry".to_string(),
            test_runner: "none".to_string(),
            workers: 4,
            metrics_port: 9090,
            service_name: "samsahai-operator".to_string(),
        }
    }
}

impl Settings {
    /// Loads the settings file named by `SAMSAHAI_CONFIG` and applies
    /// environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut settings = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read settings file '{}'", path))?;
                Self::from_yaml(&raw).with_context(|| format!("Failed to parse settings file '{}'", path))?
            }
            Err(_) => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(engine) = lookup("SAMSAHAI_DEPLOY_ENGINE") {
            self.deploy_engine = engine;
        }
        if let Some(endpoints) = lookup("SAMSAHAI_REST_ENDPOINTS") {
            self.rest_endpoints = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(workers) = lookup("SAMSAHAI_WORKERS") {
            self.workers = workers
                .parse()
                .with_context(|| format!("Invalid SAMSAHAI_WORKERS '{}'", workers))?;
        }
        if let Some(port) = lookup("SAMSAHAI_METRICS_PORT") {
            self.metrics_port = port
                .parse()
                .with_context(|| format!("Invalid SAMSAHAI_METRICS_PORT '{}'", port))?;
        }
        if let Some(timeout) = lookup("SAMSAHAI_ACTIVE_PROMOTION_TIMEOUT") {
            self.active_promotion.timeout = parse_duration(&timeout)?;
        }
        Ok(())
    }
}

/// Effective promotion knobs for one team.
#[derive(Clone, Debug, PartialEq)]
pub struct PromotionPolicy {
    pub timeout: Duration,
    pub demotion_timeout: Duration,
    pub rollback_timeout: Duration,
    pub max_retry: u32,
    pub max_histories: u32,
    pub tear_down_duration: Duration,
}

impl PromotionPolicy {
    pub fn resolve(settings: &Settings, config: Option<&ConfigSpec>) -> Self {
        let global = &settings.active_promotion;
        let team = config.and_then(|c| c.active_promotion.as_ref());
        Self {
            timeout: override_duration(team.and_then(|t| t.timeout.as_deref()), global.timeout),
            demotion_timeout: override_duration(
                team.and_then(|t| t.demotion_timeout.as_deref()),
                global.demotion_timeout,
            ),
            rollback_timeout: override_duration(
                team.and_then(|t| t.rollback_timeout.as_deref()),
                global.rollback_timeout,
            ),
            max_retry: override_count(team.and_then(|t| t.max_retry), global.max_retry),
            max_histories: override_count(team.and_then(|t| t.max_histories), global.max_histories),
            tear_down_duration: override_duration(
                team.and_then(|t| t.tear_down_duration.as_deref()),
                global.tear_down_duration,
            ),
        }
    }
}

/// Effective pull request knobs for one team.
#[derive(Clone, Debug, PartialEq)]
pub struct PullRequestPolicy {
    pub concurrences: u32,
    pub max_retry: u32,
    pub max_history_days: u32,
    pub tear_down_duration: Duration,
    pub tear_down_criteria: TearDownCriteria,
    pub trigger_polling_time: Duration,
    pub trigger_max_retry: u32,
}

impl PullRequestPolicy {
    pub fn resolve(settings: &Settings, config: Option<&ConfigSpec>) -> Self {
        let global = &settings.pull_request;
        let team = config.and_then(|c| c.pull_request.as_ref());
        let tear_down = team.and_then(|t| t.tear_down_duration.as_ref());
        let trigger = team.and_then(|t| t.trigger.as_ref());
        Self {
            concurrences: override_count(team.and_then(|t| t.concurrences), global.concurrences),
            max_retry: override_count(team.and_then(|t| t.max_retry), global.max_retry),
            max_history_days: override_count(
                team.and_then(|t| t.max_history_days),
                global.max_history_days,
            ),
            tear_down_duration: override_duration(
                tear_down.map(|t| t.duration.as_str()),
                global.tear_down_duration,
            ),
            tear_down_criteria: tear_down
                .map(|t| t.criteria)
                .unwrap_or(global.tear_down_criteria),
            trigger_polling_time: override_duration(
                trigger.and_then(|t| t.polling_time.as_deref()),
                global.trigger_polling_time,
            ),
            trigger_max_retry: override_count(
                trigger.and_then(|t| t.max_retry),
                global.trigger_max_retry,
            ),
        }
    }
}
