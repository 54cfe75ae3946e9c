/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/config_controller.rs
*
* Read access to team configuration, with template inheritance.
*
* Core Logic:
* - `get` returns the resolved configuration of a team: its own `Config`
*   spec layered over the spec of the template it names (recursively).
*   Objects merge field by field, components merge by name, every other
*   value set by the team replaces the template's.
* - `ensure_config_template_changed` recomputes that resolution and writes it
*   to `status.used` when it differs from what was last recorded.
* - The narrower getters (`get_components`, `get_bundles`, ...) are derived
*   from `get` so any implementation only has to provide the four basics.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{ComponentConfig, Config, ConfigSpec, PullRequestBundleConfig, PullRequestConfig};
use crate::errors::Error;
use crate::store::{ignore_not_found, Store};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Templates referencing templates are followed at most this deep.
const MAX_TEMPLATE_DEPTH: usize = 5;

#[async_trait]
pub trait ConfigController: Send + Sync {
    /// Resolved configuration of `config_name`.
    async fn get(&self, config_name: &str) -> Result<ConfigSpec, Error>;

    async fn update(&self, config: &Config) -> Result<(), Error>;

    async fn delete(&self, config_name: &str) -> Result<(), Error>;

    async fn ensure_config_template_changed(&self, config_name: &str) -> Result<(), Error>;

    /// Every deployable component by name, dependencies included.
    async fn get_components(&self, config_name: &str) -> Result<BTreeMap<String, ComponentConfig>, Error> {
        let spec = self.get(config_name).await?;
        let mut out = BTreeMap::new();
        for parent in spec.components {
            for dep in &parent.dependencies {
                out.insert(
                    dep.name.clone(),
                    ComponentConfig {
                        name: dep.name.clone(),
                        chart: dep.chart.clone(),
                        image: dep.image.clone(),
                        values: dep.values.clone(),
                        dependencies: Vec::new(),
                    },
                );
            }
            out.insert(parent.name.clone(), parent);
        }
        Ok(out)
    }

    /// Top-level components only.
    async fn get_parent_components(&self, config_name: &str) -> Result<BTreeMap<String, ComponentConfig>, Error> {
        let spec = self.get(config_name).await?;
        Ok(spec
            .components
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect())
    }

    async fn get_bundles(&self, config_name: &str) -> Result<BTreeMap<String, Vec<String>>, Error> {
        Ok(self.get(config_name).await?.bundles)
    }

    async fn get_priority_queues(&self, config_name: &str) -> Result<Vec<String>, Error> {
        Ok(self.get(config_name).await?.priority_queues)
    }

    async fn get_pull_request_config(&self, config_name: &str) -> Result<Option<PullRequestConfig>, Error> {
        Ok(self.get(config_name).await?.pull_request)
    }

    async fn get_pull_request_bundle(
        &self,
        config_name: &str,
        bundle_name: &str,
    ) -> Result<Option<PullRequestBundleConfig>, Error> {
        Ok(self
            .get_pull_request_config(config_name)
            .await?
            .and_then(|pr| pr.bundles.into_iter().find(|b| b.name == bundle_name)))
    }

    /// Components of a pull request bundle, with their base configuration.
    async fn get_pull_request_components(
        &self,
        config_name: &str,
        bundle_name: &str,
    ) -> Result<Vec<ComponentConfig>, Error> {
        let Some(bundle) = self.get_pull_request_bundle(config_name, bundle_name).await? else {
            return Ok(Vec::new());
        };
        let components = self.get_components(config_name).await?;
        Ok(bundle
            .components
            .iter()
            .filter_map(|c| {
                let mut base = components.get(&c.name).cloned()?;
                if let Some(image) = &c.image {
                    base.image = image.clone();
                }
                Some(base)
            })
            .collect())
    }

    async fn get_pull_request_bundle_dependencies(
        &self,
        config_name: &str,
        bundle_name: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .get_pull_request_bundle(config_name, bundle_name)
            .await?
            .map(|b| b.dependencies)
            .unwrap_or_default())
    }
}

/// `ConfigController` over the `Config` resources in a store.
pub struct StoreConfigController {
    store: Arc<dyn Store<Config>>,
}

impl StoreConfigController {
    pub fn new(store: Arc<dyn Store<Config>>) -> Self {
        Self { store }
    }

    async fn load(&self, config_name: &str) -> Result<Config, Error> {
        match self.store.find(None, config_name).await? {
            Some(config) => Ok(config),
            None => Err(Error::LoadingConfiguration(config_name.to_string())),
        }
    }

    async fn resolve(&self, config: &Config) -> Result<ConfigSpec, Error> {
        let mut chain = vec![config.spec.clone()];
        let mut next = config.spec.template.clone();
        while let Some(template_name) = next {
            if chain.len() > MAX_TEMPLATE_DEPTH {
                return Err(Error::Config(format!(
                    "template chain of '{}' is deeper than {}",
                    config.metadata.name.as_deref().unwrap_or_default(),
                    MAX_TEMPLATE_DEPTH
                )));
            }
            let template = self.load(&template_name).await?;
            next = template.spec.template.clone();
            chain.push(template.spec);
        }

        // Fold from the outermost template inwards.
        let mut resolved = chain.pop().unwrap_or_default();
        while let Some(layer) = chain.pop() {
            resolved = merge_config(&resolved, &layer)?;
        }
        Ok(resolved)
    }
}

#[async_trait]
impl ConfigController for StoreConfigController {
    async fn get(&self, config_name: &str) -> Result<ConfigSpec, Error> {
        let config = self.load(config_name).await?;
        if config.spec.template.is_none() {
            return Ok(config.spec);
        }
        self.resolve(&config).await
    }

    async fn update(&self, config: &Config) -> Result<(), Error> {
        self.store.update(config).await?;
        Ok(())
    }

    async fn delete(&self, config_name: &str) -> Result<(), Error> {
        ignore_not_found(self.store.delete(None, config_name).await)?;
        Ok(())
    }

    async fn ensure_config_template_changed(&self, config_name: &str) -> Result<(), Error> {
        let mut config = self.load(config_name).await?;
        let resolved = self.resolve(&config).await?;
        let status = config.status.get_or_insert_with(Default::default);
        if status.used.as_ref() == Some(&resolved) {
            return Ok(());
        }
        debug!(config = config_name, "Recording resolved configuration.");
        status.used = Some(resolved);
        match self.store.update(&config).await {
            Err(e) if e.is_conflict() => {
                warn!(config = config_name, "Config changed while resolving; will retry on next read.");
                Ok(())
            }
            other => other.map(|_| ()).map_err(Error::from),
        }
    }
}

/// Layers `team` over `template`.
pub fn merge_config(template: &ConfigSpec, team: &ConfigSpec) -> Result<ConfigSpec, Error> {
    let mut base = serde_json::to_value(template)?;
    let overlay = serde_json::to_value(team)?;
    merge_json(&mut base, overlay);
    let mut merged: ConfigSpec = serde_json::from_value(base)?;

    let mut components = template.components.clone();
    for component in &team.components {
        match components.iter_mut().find(|c| c.name == component.name) {
            Some(existing) => *existing = component.clone(),
            None => components.push(component.clone()),
        }
    }
    merged.components = components;
    merged.template = team.template.clone();
    Ok(merged)
}

/// Recursive object merge; anything that is not an object on both sides is
/// replaced by the overlay.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (k, v) in overlay {
                match base.get_mut(&k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
