/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/image_checker.rs
*
* Checks whether a container image tag has been published.
*
* The `registry` checker asks the registry directly: Docker Hub images go
* through the Hub tags API, every other registry through a HEAD on the v2
* manifest endpoint. The `mock` checker answers from an in-memory list of
* missing images.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::Image;
use crate::errors::Error;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

const DOCKER_HUB_API: &str = "https://hub.docker.com/v2/repositories";
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

#[async_trait]
pub trait ImageChecker: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(false)` when the registry answers that the tag does not exist.
    async fn exists(&self, image: &Image) -> Result<bool, Error>;
}

pub fn build_image_checker(name: &str) -> Result<Arc<dyn ImageChecker>, Error> {
    match name {
        "registry" => Ok(Arc::new(RegistryImageChecker::new())),
        "mock" => Ok(Arc::new(MockImageChecker::default())),
        other => Err(Error::Config(format!("unknown image checker '{}'", other))),
    }
}

pub struct RegistryImageChecker {
    client: reqwest::Client,
}

impl Default for RegistryImageChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryImageChecker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

/// Where to look up an image: Docker Hub or a v2 registry host.
#[derive(Debug, PartialEq, Eq)]
enum Lookup {
    DockerHub { repository: String },
    Registry { host: String, repository: String },
}

fn lookup_for(repository: &str) -> Lookup {
    match repository.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            Lookup::Registry {
                host: first.to_string(),
                repository: rest.to_string(),
            }
        }
        Some(_) => Lookup::DockerHub {
            repository: repository.to_string(),
        },
        None => Lookup::DockerHub {
            repository: format!("library/{}", repository),
        },
    }
}

#[async_trait]
impl ImageChecker for RegistryImageChecker {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn exists(&self, image: &Image) -> Result<bool, Error> {
        let request = match lookup_for(&image.repository) {
            Lookup::DockerHub { repository } => self
                .client
                .get(format!("{}/{}/tags/{}", DOCKER_HUB_API, repository, image.tag)),
            Lookup::Registry { host, repository } => self
                .client
                .head(format!("https://{}/v2/{}/manifests/{}", host, repository, image.tag))
                .header(reqwest::header::ACCEPT, MANIFEST_ACCEPT),
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::ImageChecker(format!("{}: {}", image, e)))?;
        debug!(%image, status = %response.status(), "Checked image.");
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::ImageChecker(format!("{}: registry answered {}", image, s))),
        }
    }
}

/// Reports images listed with `set_missing` as absent and everything else as
/// present.
#[derive(Default)]
pub struct MockImageChecker {
    missing: Mutex<BTreeSet<String>>,
}

impl MockImageChecker {
    pub fn set_missing(&self, image: &Image) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.insert(image.to_string());
        }
    }

    pub fn set_present(&self, image: &Image) {
        if let Ok(mut missing) = self.missing.lock() {
            missing.remove(&image.to_string());
        }
    }
}

#[async_trait]
impl ImageChecker for MockImageChecker {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn exists(&self, image: &Image) -> Result<bool, Error> {
        let missing = self
            .missing
            .lock()
            .map_err(|_| Error::ImageChecker("mock state poisoned".to_string()))?;
        Ok(!missing.contains(&image.to_string()))
    }
}
