/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/crds/config.rs
*
* The per-team `Config` resource (named after the team). It declares the
* team's components and bundles, and carries the team-level overrides of the
* global settings for promotions and pull requests.
*
* A config may name a `template` config to inherit from; the resolved result
* of that merge is written to `status.used` and is what every consumer reads.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::Image;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "env.samsahai.io",
    version = "v1",
    kind = "Config",
    status = "ConfigStatus",
    printcolumn = r#"{"name":"Template", "type":"string", "jsonPath":".spec.template"}"#,
    shortname = "cfg"
)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentConfig>,
    /// Bundle name to the names of the components deployed together.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bundles: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub priority_queues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging: Option<StagingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_promotion: Option<ActivePromotionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<ReporterConfig>,
    /// Name of another `Config` to inherit unset fields from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<ConfigSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_uid: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub repository: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    pub name: String,
    #[serde(default)]
    pub chart: ChartConfig,
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
    /// Components installed as part of this one (e.g. its database).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyConfig {
    pub name: String,
    #[serde(default)]
    pub chart: ChartConfig,
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_runner: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StagingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivePromotionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demotion_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_histories: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tear_down_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestComponentConfig {
    pub name: String,
    /// Overrides the component image; the tag may use `{{ .PRNumber }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestBundleConfig {
    pub name: String,
    #[serde(default)]
    pub components: Vec<PullRequestComponentConfig>,
    /// Names of components installed alongside the bundle at their active
    /// (or configured) versions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TearDownCriteria {
    #[default]
    Both,
    Failure,
    Success,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTearDownDuration {
    pub duration: String,
    #[serde(default)]
    pub criteria: TearDownCriteria,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bundles: Vec<PullRequestBundleConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<PullRequestTriggerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrences: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tear_down_duration: Option<PullRequestTearDownDuration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestReporterConfig {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReporterConfig {
    /// Reporter names from the reporter registry. Empty means the global default.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rest: Option<RestReporterConfig>,
}
