/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/testing.rs
*
* In-process harness for the state machine tests. `TestEnv` wires a `Context`
* over memory stores, a manual clock and the mock collaborators, and `step`
* plays the part of the controller runtime: every object of every kind gets
* one reconcile pass, then the clock moves forward by a second.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::clock::{Clock, ManualClock};
use crate::context::{Context, Stores};
use crate::controllers::active_promotion_controller::reconcile_active_promotion;
use crate::controllers::pull_request_queue_controller::reconcile_pull_request_queue;
use crate::controllers::pull_request_trigger_controller::reconcile_pull_request_trigger;
use crate::controllers::queue_controller::reconcile_queue;
use crate::controllers::utils::into_action;
use crate::crds::{
    parse_time, ActivePromotion, ChartConfig, ComponentConfig, Config, ConfigSpec, Image, PullRequestBundleConfig,
    PullRequestComponentConfig, PullRequestConfig, PullRequestQueue, QueueComponent, StableComponent,
    StableComponentSpec, Team, TeamSpec, TeamStatus,
};
use crate::deploy_engine::{EngineRegistry, MockEngineState};
use crate::errors::Error;
use crate::image_checker::MockImageChecker;
use crate::reporter::{
    ActiveEnvironmentDeletedReport, ActivePromotionReport, ComponentUpgradeReport, ImageMissingReport,
    PullRequestQueueReport, PullRequestTriggerReport, Reporter,
};
use crate::settings::Settings;
use crate::store::MemoryStore;
use crate::test_runner::MockTestRunner;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEAM: &str = "alpha";
pub const STAGING: &str = "s2h-alpha";
pub const OLD_ACTIVE: &str = "s2h-alpha-old";
pub const BUNDLE: &str = "wordpress";

/// One report as a reporter received it.
#[derive(Clone, Debug, PartialEq)]
pub struct Sent {
    pub event: &'static str,
    pub team: String,
    /// The field a test usually wants to look at: a result, a commit or a
    /// namespace, depending on the event.
    pub detail: String,
}

#[derive(Default)]
pub struct RecordingReporter {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingReporter {
    fn push(&self, event: &'static str, team: &str, detail: String) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Sent {
                event,
                team: team.to_string(),
                detail,
            });
        }
    }

    pub fn sent(&self, event: &str) -> Vec<Sent> {
        self.sent
            .lock()
            .map(|s| s.iter().filter(|e| e.event == event).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send_component_upgrade(&self, _config: &ConfigSpec, report: &ComponentUpgradeReport) -> anyhow::Result<()> {
        self.push("component-upgrade", &report.team_name, report.is_success.to_string());
        Ok(())
    }

    async fn send_active_promotion_status(
        &self,
        _config: &ConfigSpec,
        report: &ActivePromotionReport,
    ) -> anyhow::Result<()> {
        self.push("active-promotion", &report.team_name, format!("{:?}", report.result));
        Ok(())
    }

    async fn send_image_missing(&self, _config: &ConfigSpec, report: &ImageMissingReport) -> anyhow::Result<()> {
        self.push("image-missing", &report.team_name, report.namespace.clone());
        Ok(())
    }

    async fn send_pull_request_queue(&self, _config: &ConfigSpec, report: &PullRequestQueueReport) -> anyhow::Result<()> {
        self.push("pull-request-queue", &report.team_name, report.commit_sha.clone());
        Ok(())
    }

    async fn send_pull_request_trigger_result(
        &self,
        _config: &ConfigSpec,
        report: &PullRequestTriggerReport,
    ) -> anyhow::Result<()> {
        self.push("pull-request-trigger", &report.team_name, format!("{:?}", report.result));
        Ok(())
    }

    async fn send_active_environment_deleted(
        &self,
        _config: &ConfigSpec,
        report: &ActiveEnvironmentDeletedReport,
    ) -> anyhow::Result<()> {
        self.push("active-environment-deleted", &report.team_name, report.active_namespace.clone());
        Ok(())
    }
}

pub struct TestEnv {
    pub ctx: Arc<Context>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<MockEngineState>,
    pub reporter: Arc<RecordingReporter>,
    pub images: Arc<MockImageChecker>,
    pub tests: Arc<MockTestRunner>,
    /// The stores behind `ctx` for the kinds whose writes tests interrupt.
    pub promotions: Arc<MemoryStore<ActivePromotion>>,
    pub pull_request_queues: Arc<MemoryStore<PullRequestQueue>>,
}

/// Settings every scenario starts from: mock collaborators and no teardown
/// grace period.
pub fn test_settings() -> Settings {
    let mut settings = Settings {
        deploy_engine: "mock".to_string(),
        image_checker: "mock".to_string(),
        test_runner: "mock".to_string(),
        reporters: Vec::new(),
        ..Default::default()
    };
    settings.active_promotion.tear_down_duration = Duration::ZERO;
    settings.pull_request.tear_down_duration = Duration::ZERO;
    settings.pull_request.trigger_polling_time = Duration::from_secs(1);
    settings
}

pub fn component(name: &str, repository: &str, tag: &str) -> ComponentConfig {
    ComponentConfig {
        name: name.to_string(),
        chart: ChartConfig {
            repository: "https://charts.example.com".to_string(),
            name: name.to_string(),
            version: None,
        },
        image: Image {
            repository: repository.to_string(),
            tag: tag.to_string(),
        },
        ..Default::default()
    }
}

/// Components `wordpress`, `mariadb` and `redis`, with a `wordpress` pull
/// request bundle that brings the other two along as dependencies.
pub fn pull_request_config() -> ConfigSpec {
    ConfigSpec {
        components: vec![
            component("wordpress", "bitnami/wordpress", "5.7"),
            component("mariadb", "bitnami/mariadb", "latest"),
            component("redis", "bitnami/redis", "latest"),
        ],
        pull_request: Some(PullRequestConfig {
            bundles: vec![PullRequestBundleConfig {
                name: BUNDLE.to_string(),
                components: vec![PullRequestComponentConfig {
                    name: "wordpress".to_string(),
                    image: Some(Image {
                        repository: "bitnami/wordpress".to_string(),
                        tag: "pr-{{ .PRNumber }}".to_string(),
                    }),
                }],
                dependencies: vec!["mariadb".to_string(), "redis".to_string()],
                deployment: None,
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(adjust: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = test_settings();
        adjust(&mut settings);

        let clock = Arc::new(ManualClock::new(
            parse_time("2024-03-01T10:00:00Z").expect("valid start time"),
        ));
        let engine = Arc::new(MockEngineState::default());
        let reporter = Arc::new(RecordingReporter::default());
        let images = Arc::new(MockImageChecker::default());
        let tests = Arc::new(MockTestRunner::default());
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let promotions = Arc::new(MemoryStore::new(shared_clock.clone()));
        let pull_request_queues = Arc::new(MemoryStore::new(shared_clock.clone()));
        let stores = Stores {
            active_promotions: promotions.clone(),
            pull_request_queues: pull_request_queues.clone(),
            ..Stores::memory(shared_clock.clone())
        };
        let ctx = Context::new(
            stores,
            settings,
            shared_clock,
            EngineRegistry::default().with_mock_state(engine.clone()),
            vec![reporter.clone() as Arc<dyn Reporter>],
            images.clone(),
            tests.clone(),
        );
        Self {
            ctx: Arc::new(ctx),
            clock,
            engine,
            reporter,
            images,
            tests,
            promotions,
            pull_request_queues,
        }
    }

    /// Team `alpha` with its staging namespace and, when `active` is set, an
    /// active namespace.
    pub async fn add_team(&self, active: Option<&str>) {
        let mut team = Team::new(TEAM, TeamSpec::default());
        team.status = Some(TeamStatus::default());
        let ns = &mut team.status_mut().namespace;
        ns.staging = STAGING.to_string();
        ns.active = active.unwrap_or_default().to_string();
        self.ctx.stores.teams.create(&team).await.expect("team created");

        self.add_namespace(STAGING).await;
        if let Some(active) = active {
            self.add_namespace(active).await;
        }
    }

    pub async fn add_namespace(&self, name: &str) {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.ctx.stores.namespaces.create(&ns).await.expect("namespace created");
    }

    pub async fn add_config(&self, spec: ConfigSpec) {
        let config = Config::new(TEAM, spec);
        self.ctx.stores.configs.create(&config).await.expect("config created");
    }

    pub async fn add_stable(&self, namespace: &str, name: &str, repository: &str, version: &str) {
        let mut stable = StableComponent::new(
            name,
            StableComponentSpec {
                name: name.to_string(),
                repository: repository.to_string(),
                version: version.to_string(),
                updated_by: None,
            },
        );
        stable.metadata.namespace = Some(namespace.to_string());
        self.ctx
            .stores
            .stable_components
            .create(&stable)
            .await
            .expect("stable component created");
    }

    pub async fn stable(&self, namespace: &str) -> Vec<QueueComponent> {
        crate::deploy_queue::stable_components(self.ctx.stores.stable_components.as_ref(), namespace)
            .await
            .expect("stable components listed")
    }

    pub async fn namespace_exists(&self, name: &str) -> bool {
        self.ctx
            .stores
            .namespaces
            .find(None, name)
            .await
            .expect("namespace lookup")
            .is_some()
    }

    pub async fn team(&self) -> Team {
        self.ctx.stores.teams.get(None, TEAM).await.expect("team exists")
    }

    /// One reconcile pass over every object, then one second of time.
    pub async fn step(&self) -> Result<(), Error> {
        let stores = &self.ctx.stores;
        let all = Default::default();

        for atp in stores.active_promotions.list(None, &all).await? {
            into_action(reconcile_active_promotion(&atp.name_any(), self.ctx.clone()).await)?;
        }
        for trigger in stores.pull_request_triggers.list(None, &all).await? {
            let namespace = trigger.namespace().unwrap_or_default();
            into_action(reconcile_pull_request_trigger(&namespace, &trigger.name_any(), &self.ctx).await)?;
        }
        for prq in stores.pull_request_queues.list(None, &all).await? {
            let namespace = prq.namespace().unwrap_or_default();
            into_action(reconcile_pull_request_queue(&namespace, &prq.name_any(), &self.ctx).await)?;
        }
        for queue in stores.queues.list(None, &all).await? {
            let namespace = queue.namespace().unwrap_or_default();
            into_action(reconcile_queue(&namespace, &queue.name_any(), &self.ctx).await)?;
        }

        self.clock.advance(Duration::from_secs(1));
        Ok(())
    }

    /// Runs `steps` passes. Finished objects are deleted, so running past
    /// the end of a scenario is harmless.
    pub async fn run(&self, steps: usize) {
        for _ in 0..steps {
            self.step().await.expect("reconcile pass");
        }
    }
}
