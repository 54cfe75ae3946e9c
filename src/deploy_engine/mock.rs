/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/deploy_engine/mock.rs
*
* In-process deploy engine. Releases are kept in a state object shared by all
* namespaces so a whole promotion can be observed from one place. Components
* can be marked as failing to exercise the deploy-failure paths.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{DeployEngine, DeployRequest, EngineError, Release};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockEngineState {
    releases: Mutex<BTreeMap<(String, String), Release>>,
    failing_components: Mutex<BTreeSet<String>>,
    failing_namespaces: Mutex<BTreeSet<String>>,
}

impl MockEngineState {
    /// Makes every later deployment of `component` fail.
    pub fn fail_component(&self, component: &str) {
        if let Ok(mut failing) = self.failing_components.lock() {
            failing.insert(component.to_string());
        }
    }

    /// Makes every later deployment into `namespace` fail.
    pub fn fail_namespace(&self, namespace: &str) {
        if let Ok(mut failing) = self.failing_namespaces.lock() {
            failing.insert(namespace.to_string());
        }
    }

    pub fn releases_in(&self, namespace: &str) -> Vec<Release> {
        self.releases
            .lock()
            .map(|r| r.values().filter(|r| r.namespace == namespace).cloned().collect())
            .unwrap_or_default()
    }

    fn should_fail(&self, namespace: &str, component: &str) -> bool {
        let by_component = self
            .failing_components
            .lock()
            .map(|f| f.contains(component))
            .unwrap_or(false);
        let by_namespace = self
            .failing_namespaces
            .lock()
            .map(|f| f.contains(namespace))
            .unwrap_or(false);
        by_component || by_namespace
    }
}

pub struct MockEngine {
    namespace: String,
    state: Arc<MockEngineState>,
}

impl MockEngine {
    pub fn new(namespace: &str, state: Arc<MockEngineState>) -> Self {
        Self {
            namespace: namespace.to_string(),
            state,
        }
    }

    fn with_releases<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<(String, String), Release>) -> T,
    ) -> Result<T, EngineError> {
        let mut releases = self
            .state
            .releases
            .lock()
            .map_err(|_| EngineError::Parse("mock engine state poisoned".to_string()))?;
        Ok(f(&mut releases))
    }
}

#[async_trait]
impl DeployEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, release: &str, request: &DeployRequest) -> Result<(), EngineError> {
        if self.state.should_fail(&self.namespace, &request.component.name) {
            return Err(EngineError::DeployFailed {
                release: release.to_string(),
                message: "mock failure".to_string(),
            });
        }
        let namespace = self.namespace.clone();
        self.with_releases(|releases| {
            let key = (namespace.clone(), release.to_string());
            let revision = releases.get(&key).map(|r| r.revision + 1).unwrap_or(1);
            releases.insert(
                key,
                Release {
                    name: release.to_string(),
                    namespace,
                    revision,
                    status: "deployed".to_string(),
                    chart: request.chart.name.clone(),
                    app_version: request.component.version.clone(),
                },
            );
        })
    }

    async fn rollback(&self, release: &str, revision: u32) -> Result<(), EngineError> {
        let key = (self.namespace.clone(), release.to_string());
        self.with_releases(|releases| match releases.get_mut(&key) {
            Some(r) => {
                r.revision = revision;
                Ok(())
            }
            None => Err(EngineError::ReleaseNotFound(release.to_string())),
        })?
    }

    async fn delete(&self, release: &str) -> Result<(), EngineError> {
        let key = (self.namespace.clone(), release.to_string());
        self.with_releases(|releases| {
            releases.remove(&key);
        })
    }

    async fn force_delete(&self, release: &str) -> Result<(), EngineError> {
        self.delete(release).await
    }

    async fn get_histories(&self, release: &str) -> Result<Vec<Release>, EngineError> {
        let key = (self.namespace.clone(), release.to_string());
        self.with_releases(|releases| releases.get(&key).cloned().into_iter().collect())
    }

    async fn get_releases(&self) -> Result<Vec<Release>, EngineError> {
        Ok(self.state.releases_in(&self.namespace))
    }

    fn get_label_selectors(&self, release: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("release".to_string(), release.to_string())])
    }

    fn is_mocked(&self) -> bool {
        true
    }
}
