/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/context.rs
*
* The shared state handed to every reconciler.
*
* `Context` is built once in `main` (or by the test harness) and passed to
* each `Controller` behind an `Arc`. It owns one typed store per resource kind
* and every external collaborator. Nothing in the reconcilers reaches for
* process-global state; the clock in particular is injected so timeouts can be
* driven deterministically.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clock::{Clock, SystemClock};
use crate::config_controller::{ConfigController, StoreConfigController};
use crate::crds::{
    ActivePromotion, ActivePromotionHistory, Config, ConfigSpec, DeploymentConfig, PullRequestQueue,
    PullRequestQueueHistory, PullRequestTrigger, Queue, QueueType, StableComponent, Team,
};
use crate::deploy_engine::{DeployEngine, EngineRegistry};
use crate::environment::{EnvironmentController, StoreEnvironment};
use crate::errors::Error;
use crate::image_checker::{build_image_checker, ImageChecker};
use crate::reporter::{build_reporters, Reporter};
use crate::settings::Settings;
use crate::store::{KubeStore, MemoryStore, Store};
use crate::test_runner::{build_test_runner, TestRunner};
use crate::timeout::override_duration;
use k8s_openapi::api::core::v1::Namespace;
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// One store per resource kind.
#[derive(Clone)]
pub struct Stores {
    pub active_promotions: Arc<dyn Store<ActivePromotion>>,
    pub active_promotion_histories: Arc<dyn Store<ActivePromotionHistory>>,
    pub pull_request_queues: Arc<dyn Store<PullRequestQueue>>,
    pub pull_request_queue_histories: Arc<dyn Store<PullRequestQueueHistory>>,
    pub pull_request_triggers: Arc<dyn Store<PullRequestTrigger>>,
    pub queues: Arc<dyn Store<Queue>>,
    pub stable_components: Arc<dyn Store<StableComponent>>,
    pub teams: Arc<dyn Store<Team>>,
    pub configs: Arc<dyn Store<Config>>,
    pub namespaces: Arc<dyn Store<Namespace>>,
}

impl Stores {
    pub fn kube(client: Client) -> Self {
        Self {
            active_promotions: Arc::new(KubeStore::<ActivePromotion>::cluster(client.clone())),
            active_promotion_histories: Arc::new(KubeStore::<ActivePromotionHistory>::cluster(client.clone())),
            pull_request_queues: Arc::new(KubeStore::<PullRequestQueue>::namespaced(client.clone())),
            pull_request_queue_histories: Arc::new(KubeStore::<PullRequestQueueHistory>::namespaced(client.clone())),
            pull_request_triggers: Arc::new(KubeStore::<PullRequestTrigger>::namespaced(client.clone())),
            queues: Arc::new(KubeStore::<Queue>::namespaced(client.clone())),
            stable_components: Arc::new(KubeStore::<StableComponent>::namespaced(client.clone())),
            teams: Arc::new(KubeStore::<Team>::cluster(client.clone())),
            configs: Arc::new(KubeStore::<Config>::cluster(client.clone())),
            namespaces: Arc::new(KubeStore::<Namespace>::cluster(client)),
        }
    }

    pub fn memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            active_promotions: Arc::new(MemoryStore::new(clock.clone())),
            active_promotion_histories: Arc::new(MemoryStore::new(clock.clone())),
            pull_request_queues: Arc::new(MemoryStore::new(clock.clone())),
            pull_request_queue_histories: Arc::new(MemoryStore::new(clock.clone())),
            pull_request_triggers: Arc::new(MemoryStore::new(clock.clone())),
            queues: Arc::new(MemoryStore::new(clock.clone())),
            stable_components: Arc::new(MemoryStore::new(clock.clone())),
            teams: Arc::new(MemoryStore::new(clock.clone())),
            configs: Arc::new(MemoryStore::new(clock.clone())),
            namespaces: Arc::new(MemoryStore::new(clock)),
        }
    }
}

pub struct Context {
    pub stores: Stores,
    pub engines: EngineRegistry,
    pub reporters: Vec<Arc<dyn Reporter>>,
    pub config: Arc<dyn ConfigController>,
    pub environment: Arc<dyn EnvironmentController>,
    pub image_checker: Arc<dyn ImageChecker>,
    pub test_runner: Arc<dyn TestRunner>,
    pub settings: Settings,
    pub clock: Arc<dyn Clock>,
    /// Serializes admission within this process so two workers never admit
    /// past the concurrency limit from the same stale listing.
    pub admission_lock: Mutex<()>,
}

impl Context {
    /// Wires the config controller and the environment facade over `stores`.
    pub fn new(
        stores: Stores,
        settings: Settings,
        clock: Arc<dyn Clock>,
        engines: EngineRegistry,
        reporters: Vec<Arc<dyn Reporter>>,
        image_checker: Arc<dyn ImageChecker>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Self {
        let config = Arc::new(StoreConfigController::new(stores.configs.clone()));
        let environment = Arc::new(StoreEnvironment::new(
            stores.teams.clone(),
            stores.namespaces.clone(),
            clock.clone(),
        ));
        Self {
            stores,
            engines,
            reporters,
            config,
            environment,
            image_checker,
            test_runner,
            settings,
            clock,
            admission_lock: Mutex::new(()),
        }
    }

    /// Production wiring against a live cluster.
    pub fn from_client(client: Client, settings: Settings) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let reporters = build_reporters(&settings.reporters, &settings)?;
        let image_checker = build_image_checker(&settings.image_checker)?;
        let test_runner = build_test_runner(&settings.test_runner)?;
        Ok(Self::new(
            Stores::kube(client),
            settings,
            clock,
            EngineRegistry::default(),
            reporters,
            image_checker,
            test_runner,
        ))
    }

    /// Deployment settings that apply to a queue of `queue_type`.
    pub fn deployment_for<'a>(
        &self,
        config: &'a ConfigSpec,
        queue_type: QueueType,
        bundle: &str,
    ) -> Option<&'a DeploymentConfig> {
        match queue_type {
            QueueType::PreActive | QueueType::PromoteToActive | QueueType::DemoteFromActive => config
                .active_promotion
                .as_ref()
                .and_then(|a| a.deployment.as_ref()),
            QueueType::PullRequest => config
                .pull_request
                .as_ref()
                .and_then(|p| p.bundles.iter().find(|b| b.name == bundle))
                .and_then(|b| b.deployment.as_ref()),
            QueueType::Upgrade | QueueType::Reverify => {
                config.staging.as_ref().and_then(|s| s.deployment.as_ref())
            }
        }
    }

    /// The namespace's deploy engine, as configured for `deployment`.
    pub fn engine_for(
        &self,
        deployment: Option<&DeploymentConfig>,
        namespace: &str,
    ) -> Result<Arc<dyn DeployEngine>, Error> {
        let name = deployment
            .and_then(|d| d.engine.as_deref())
            .filter(|e| !e.is_empty())
            .unwrap_or(&self.settings.deploy_engine);
        Ok(self.engines.engine(name, namespace)?)
    }

    pub fn deploy_timeout(&self, deployment: Option<&DeploymentConfig>) -> Duration {
        override_duration(
            deployment.and_then(|d| d.timeout.as_deref()),
            self.settings.deploy_timeout,
        )
    }
}
