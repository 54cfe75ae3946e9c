/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/deploy_engine.rs
*
* The deploy engine contract and its closed registry.
*
* An engine is bound to one namespace and manages releases in it. Engines are
* picked by name from a fixed set (`helm`, `mock`); an unknown name is a
* configuration error rather than a runtime lookup failure deep inside a
* reconcile.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod helm;
pub mod mock;

pub use helm::HelmEngine;
pub use mock::{MockEngine, MockEngineState};

use crate::crds::{ChartConfig, QueueComponent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Kubernetes caps release-derived resource names; keep the distinctive end.
pub const MAX_RELEASE_NAME_LEN: usize = 53;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown deploy engine '{0}'")]
    UnknownEngine(String),

    #[error("Release '{0}' not found")]
    ReleaseNotFound(String),

    #[error("Deployment of release '{release}' failed: {message}")]
    DeployFailed { release: String, message: String },

    #[error("Engine command failed: {0:#}")]
    Command(#[from] anyhow::Error),

    #[error("Failed to parse engine output: {0}")]
    Parse(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub revision: u32,
    pub status: String,
    #[serde(default)]
    pub chart: String,
    #[serde(default)]
    pub app_version: String,
}

/// One component installation.
#[derive(Clone, Debug, PartialEq)]
pub struct DeployRequest {
    pub component: QueueComponent,
    /// The bundle or parent component this one is installed as part of.
    pub parent_component: Option<String>,
    pub chart: ChartConfig,
    pub values: serde_json::Value,
    pub timeout: Duration,
}

#[async_trait]
pub trait DeployEngine: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, release: &str, request: &DeployRequest) -> Result<(), EngineError>;

    async fn rollback(&self, release: &str, revision: u32) -> Result<(), EngineError>;

    /// Uninstalls a release. Deleting a missing release succeeds.
    async fn delete(&self, release: &str) -> Result<(), EngineError>;

    /// Uninstalls without running hooks.
    async fn force_delete(&self, release: &str) -> Result<(), EngineError>;

    async fn get_histories(&self, release: &str) -> Result<Vec<Release>, EngineError>;

    async fn get_releases(&self) -> Result<Vec<Release>, EngineError>;

    fn get_label_selectors(&self, release: &str) -> BTreeMap<String, String>;

    fn is_mocked(&self) -> bool;
}

/// `namespace-component`, truncated from the left to fit a release name.
pub fn release_name(namespace: &str, component: &str) -> String {
    truncate_keep_suffix(&format!("{}-{}", namespace, component), MAX_RELEASE_NAME_LEN)
}

pub fn truncate_keep_suffix(s: &str, max: usize) -> String {
    let len = s.chars().count();
    if len <= max {
        return s.to_string();
    }
    s.chars().skip(len - max).collect()
}

/// Closed set of engines, resolved by name for a namespace.
#[derive(Clone)]
pub struct EngineRegistry {
    helm_binary: String,
    mock_state: Arc<MockEngineState>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new("helm")
    }
}

impl EngineRegistry {
    pub fn new(helm_binary: impl Into<String>) -> Self {
        Self {
            helm_binary: helm_binary.into(),
            mock_state: Arc::new(MockEngineState::default()),
        }
    }

    /// Shares `state` between every mock engine the registry hands out.
    pub fn with_mock_state(mut self, state: Arc<MockEngineState>) -> Self {
        self.mock_state = state;
        self
    }

    pub fn mock_state(&self) -> Arc<MockEngineState> {
        self.mock_state.clone()
    }

    pub fn engine(&self, name: &str, namespace: &str) -> Result<Arc<dyn DeployEngine>, EngineError> {
        match name {
            "helm" | "helm3" => Ok(Arc::new(HelmEngine::new(&self.helm_binary, namespace))),
            "mock" => Ok(Arc::new(MockEngine::new(namespace, self.mock_state.clone()))),
            other => Err(EngineError::UnknownEngine(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_name_keeps_suffix() {
        assert_eq!(release_name("s2h-alpha", "redis"), "s2h-alpha-redis");

        let long_ns = "s2h-a-very-long-team-name-for-the-pre-active-namespace";
        let name = release_name(long_ns, "mariadb");
        assert_eq!(name.len(), MAX_RELEASE_NAME_LEN);
        assert!(name.ends_with("-mariadb"));
    }

    #[test]
    fn test_registry_rejects_unknown_engine() {
        let registry = EngineRegistry::default();
        assert!(registry.engine("mock", "s2h-alpha").unwrap().is_mocked());
        assert!(!registry.engine("helm", "s2h-alpha").unwrap().is_mocked());
        assert!(matches!(
            registry.engine("flux", "s2h-alpha"),
            Err(EngineError::UnknownEngine(name)) if name == "flux"
        ));
    }
}
