/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/deploy_engine/helm.rs
*
* Deploy engine that shells out to the `helm` CLI.
*
* Values are written to a temporary YAML file passed with `-f`; the image of
* the component being deployed is always forced with `--set` so the queue's
* version wins over chart defaults. History and release listings are read
* back with `-o json`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{DeployEngine, DeployRequest, EngineError, Release};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use tokio::process::Command;
use tracing::{debug, info};

pub struct HelmEngine {
    binary: String,
    namespace: String,
}

#[derive(Deserialize)]
struct HelmHistoryEntry {
    revision: u32,
    status: String,
    #[serde(default)]
    chart: String,
    #[serde(default)]
    app_version: String,
}

#[derive(Deserialize)]
struct HelmListEntry {
    name: String,
    namespace: String,
    // `helm list` prints the revision as a string.
    revision: String,
    status: String,
    #[serde(default)]
    chart: String,
    #[serde(default)]
    app_version: String,
}

impl HelmEngine {
    pub fn new(binary: &str, namespace: &str) -> Self {
        Self {
            binary: binary.to_string(),
            namespace: namespace.to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> anyhow::Result<String> {
        debug!(binary = %self.binary, ?args, "Running helm.");
        let output = Command::new(&self.binary)
            .args(args)
            .arg("--namespace")
            .arg(&self.namespace)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'", self.binary))?;

        if !output.status.success() {
            return Err(anyhow!(
                "helm {} exited with {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn uninstall(&self, release: &str, extra: &[&str]) -> Result<(), EngineError> {
        let mut args = vec!["uninstall".to_string(), release.to_string()];
        args.extend(extra.iter().map(|s| s.to_string()));
        match self.run(&args).await {
            Ok(_) => {
                info!(release, namespace = %self.namespace, "Release uninstalled.");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(EngineError::Command(e)),
        }
    }
}

fn is_not_found(e: &anyhow::Error) -> bool {
    format!("{:#}", e).contains("not found")
}

/// Arguments of `helm upgrade --install` for a request.
fn install_args(release: &str, request: &DeployRequest, values_file: &str) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        release.to_string(),
        request.chart.name.clone(),
        "--repo".to_string(),
        request.chart.repository.clone(),
        "-f".to_string(),
        values_file.to_string(),
        "--set".to_string(),
        format!("image.repository={}", request.component.repository),
        "--set".to_string(),
        format!("image.tag={}", request.component.version),
        "--wait".to_string(),
        "--timeout".to_string(),
        format!("{}s", request.timeout.as_secs()),
    ];
    if let Some(version) = &request.chart.version {
        args.push("--version".to_string());
        args.push(version.clone());
    }
    if let Some(parent) = &request.parent_component {
        args.push("--labels".to_string());
        args.push(format!("samsahai.io/parent={}", parent));
    }
    args
}

#[async_trait]
impl DeployEngine for HelmEngine {
    fn name(&self) -> &'static str {
        "helm"
    }

    async fn create(&self, release: &str, request: &DeployRequest) -> Result<(), EngineError> {
        let values = serde_yaml::to_string(&request.values)
            .map_err(|e| EngineError::Parse(e.to_string()))?;
        let mut values_file = tempfile::NamedTempFile::new()
            .context("Failed to create values file")
            .map_err(EngineError::Command)?;
        values_file
            .write_all(values.as_bytes())
            .context("Failed to write values file")
            .map_err(EngineError::Command)?;
        let path = values_file.path().to_string_lossy().into_owned();

        info!(release, namespace = %self.namespace, component = %request.component.name, "Installing release.");
        self.run(&install_args(release, request, &path))
            .await
            .map_err(|e| EngineError::DeployFailed {
                release: release.to_string(),
                message: format!("{:#}", e),
            })?;
        Ok(())
    }

    async fn rollback(&self, release: &str, revision: u32) -> Result<(), EngineError> {
        self.run(&["rollback".to_string(), release.to_string(), revision.to_string()])
            .await?;
        Ok(())
    }

    async fn delete(&self, release: &str) -> Result<(), EngineError> {
        self.uninstall(release, &[]).await
    }

    async fn force_delete(&self, release: &str) -> Result<(), EngineError> {
        self.uninstall(release, &["--no-hooks"]).await
    }

    async fn get_histories(&self, release: &str) -> Result<Vec<Release>, EngineError> {
        let out = match self
            .run(&["history".to_string(), release.to_string(), "-o".to_string(), "json".to_string()])
            .await
        {
            Ok(out) => out,
            Err(e) if is_not_found(&e) => return Err(EngineError::ReleaseNotFound(release.to_string())),
            Err(e) => return Err(EngineError::Command(e)),
        };
        let entries: Vec<HelmHistoryEntry> =
            serde_json::from_str(&out).map_err(|e| EngineError::Parse(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|h| Release {
                name: release.to_string(),
                namespace: self.namespace.clone(),
                revision: h.revision,
                status: h.status,
                chart: h.chart,
                app_version: h.app_version,
            })
            .collect())
    }

    async fn get_releases(&self) -> Result<Vec<Release>, EngineError> {
        let out = self
            .run(&["list".to_string(), "-a".to_string(), "-o".to_string(), "json".to_string()])
            .await?;
        parse_release_list(&out)
    }

    fn get_label_selectors(&self, release: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("app.kubernetes.io/instance".to_string(), release.to_string())])
    }

    fn is_mocked(&self) -> bool {
        false
    }
}

fn parse_release_list(out: &str) -> Result<Vec<Release>, EngineError> {
    let entries: Vec<HelmListEntry> =
        serde_json::from_str(out).map_err(|e| EngineError::Parse(e.to_string()))?;
    entries
        .into_iter()
        .map(|r| {
            let revision = r
                .revision
                .parse()
                .map_err(|_| EngineError::Parse(format!("revision '{}'", r.revision)))?;
            Ok(Release {
                name: r.name,
                namespace: r.namespace,
                revision,
                status: r.status,
                chart: r.chart,
                app_version: r.app_version,
            })
        })
        .collect()
}
