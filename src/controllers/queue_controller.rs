/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/queue_controller.rs
*
* This file implements the reconciliation logic for the `Queue` custom
* resource: the unit of work that actually deploys a set of components into
* one namespace.
*
* Core Logic & State Transitions:
* - **Waiting**: first pass records `createdAt` and moves on.
* - **DetectingImageMissing**: every component image is looked up through the
*   image checker. Missing images fail the queue before anything is deployed.
* - **Creating**: `startDeployTime` is written when the state is entered; the
*   next pass deploys each component in order through the namespace's deploy
*   engine. The first engine error marks the deployment failed.
* - **Testing**: the test runner is triggered once and then polled, unless
*   testing is skipped or the deployment failed.
* - **Collecting**: upgrade and reverify queues report their outcome and a
*   successful upgrade records its components as stable.
* - **Finished**: terminal; the owning state machine reads the status and
*   eventually deletes the queue.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{into_action, is_deleting, on_error, reconcile_span, STEP_REQUEUE};
use crate::context::Context;
use crate::crds::{
    format_time, is_condition_true, set_condition, ComponentConfig, ConfigSpec, Image, Queue, QueueCondition,
    QueueState, QueueType,
};
use crate::deploy_engine::{release_name, DeployRequest};
use crate::deploy_queue::upsert_stable_component;
use crate::errors::{Error, ResultExt};
use crate::metrics;
use crate::reporter::{broadcast_component_upgrade, broadcast_image_missing, ComponentUpgradeReport, ImageMissingReport};
use crate::test_runner::TestVerdict;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const TEST_POLL_REQUEUE: Duration = Duration::from_secs(5);

/// Main reconciliation function for the `Queue` resource.
pub async fn reconcile(queue: Arc<Queue>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = reconcile_span("queue", queue.as_ref());
    let Some(namespace) = queue.namespace() else {
        return Err(Error::MissingObjectKey(".metadata.namespace"));
    };
    into_action(
        reconcile_queue(&namespace, &queue.name_any(), &ctx)
            .instrument(span)
            .await,
    )
}

pub fn error_policy(queue: Arc<Queue>, error: &Error, _ctx: Arc<Context>) -> Action {
    on_error("queue", queue.as_ref(), error)
}

/// One pass over the queue `namespace/name`, from a fresh read.
pub async fn reconcile_queue(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(mut queue) = ctx.stores.queues.find(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };
    if is_deleting(&queue) {
        return Ok(Action::await_change());
    }
    let now = ctx.clock.now();

    let mut next = Action::requeue(STEP_REQUEUE);
    match queue.state() {
        None => {
            let status = queue.status_mut();
            status.state = Some(QueueState::Waiting);
            status.created_at = Some(format_time(now));
        }
        Some(QueueState::Waiting) => {
            queue.status_mut().state = Some(QueueState::DetectingImageMissing);
        }
        Some(QueueState::DetectingImageMissing) => detect_image_missing(ctx, &mut queue).await?,
        Some(QueueState::Creating) => deploy_components(ctx, &mut queue).await?,
        Some(QueueState::Testing) => {
            if !run_tests(ctx, &mut queue).await? {
                next = Action::requeue(TEST_POLL_REQUEUE);
            }
        }
        Some(QueueState::Collecting) => collect(ctx, &mut queue).await?,
        Some(QueueState::Finished) => return Ok(Action::await_change()),
    }

    queue.status_mut().updated_at = Some(format_time(now));
    ctx.stores
        .queues
        .update(&queue)
        .await
        .context(|| format!("updating queue '{}/{}'", namespace, name))?;
    Ok(next)
}

async fn detect_image_missing(ctx: &Context, queue: &mut Queue) -> Result<(), Error> {
    let mut missing: Vec<Image> = Vec::new();
    for component in &queue.spec.components {
        let image = component.image();
        if !ctx.image_checker.exists(&image).await? {
            missing.push(image);
        }
    }
    let now = ctx.clock.now();
    if !missing.is_empty() {
        warn!(queue = %queue.name_any(), missing = missing.len(), "Images are missing; skipping deployment.");
    }

    let status = queue.status_mut();
    status.start_deploy_time = Some(format_time(now));
    if missing.is_empty() {
        set_condition(&mut status.conditions, QueueCondition::DeployStarted, true, "", now);
        status.state = Some(QueueState::Creating);
        return Ok(());
    }
    set_condition(
        &mut status.conditions,
        QueueCondition::ImageMissingDetected,
        true,
        format!("{} image(s) missing", missing.len()),
        now,
    );
    status.image_missing_list = missing;
    status.deploy_result = Some(false);
    status.state = Some(QueueState::Collecting);
    Ok(())
}

async fn deploy_components(ctx: &Context, queue: &mut Queue) -> Result<(), Error> {
    let namespace = queue.namespace().unwrap_or_default();
    let config = ctx.config.get(&queue.spec.team_name).await?;
    let deployment = ctx.deployment_for(&config, queue.spec.type_, &queue.spec.bundle);
    let engine = ctx.engine_for(deployment, &namespace)?;
    let timeout = ctx.deploy_timeout(deployment);
    let components = ctx.config.get_components(&queue.spec.team_name).await?;
    let parents = parent_index(&config);

    let mut failure = None;
    for component in &queue.spec.components {
        let base = components.get(&component.name).cloned().unwrap_or_else(|| ComponentConfig {
            name: component.name.clone(),
            ..Default::default()
        });
        let request = DeployRequest {
            component: component.clone(),
            parent_component: parents.get(&component.name).cloned(),
            chart: base.chart,
            values: base.values.unwrap_or_default(),
            timeout,
        };
        let release = release_name(&namespace, &component.name);
        if let Err(e) = engine.create(&release, &request).await {
            warn!(release = %release, error = %e, "Deployment failed.");
            failure = Some(format!("{}: {}", component.name, e));
            break;
        }
    }

    let now = ctx.clock.now();
    let skip_tests = queue.spec.skip_test_runner;
    let status = queue.status_mut();
    let success = failure.is_none();
    status.deploy_result = Some(success);
    set_condition(
        &mut status.conditions,
        QueueCondition::Deployed,
        success,
        failure.unwrap_or_default(),
        now,
    );
    status.state = Some(if success && !skip_tests {
        QueueState::Testing
    } else {
        QueueState::Collecting
    });
    info!(namespace = %namespace, success, "Components deployed.");
    Ok(())
}

/// Dependency name to the name of the component that declares it.
fn parent_index(config: &ConfigSpec) -> BTreeMap<String, String> {
    config
        .components
        .iter()
        .flat_map(|parent| {
            parent
                .dependencies
                .iter()
                .map(move |dep| (dep.name.clone(), parent.name.clone()))
        })
        .collect()
}

/// Returns `false` while the test run is still going.
async fn run_tests(ctx: &Context, queue: &mut Queue) -> Result<bool, Error> {
    let namespace = queue.namespace().unwrap_or_default();
    let now = ctx.clock.now();
    let started = queue
        .status
        .as_ref()
        .is_some_and(|s| is_condition_true(&s.conditions, QueueCondition::TestStarted));
    if !started {
        ctx.test_runner.trigger(&namespace, queue).await?;
        let runner = ctx.test_runner.name();
        set_condition(&mut queue.status_mut().conditions, QueueCondition::TestStarted, true, runner, now);
    }

    let passed = match ctx.test_runner.verdict(&namespace, queue).await? {
        TestVerdict::Running => return Ok(false),
        TestVerdict::Passed => true,
        TestVerdict::Failed => false,
    };
    debug!(namespace = %namespace, passed, "Test run finished.");
    let status = queue.status_mut();
    status.test_result = Some(passed);
    set_condition(&mut status.conditions, QueueCondition::Tested, passed, "", now);
    status.state = Some(QueueState::Collecting);
    Ok(true)
}

async fn collect(ctx: &Context, queue: &mut Queue) -> Result<(), Error> {
    let namespace = queue.namespace().unwrap_or_default();
    let now = ctx.clock.now();
    let status = queue.status_or_default();
    let success = status.is_success();

    if matches!(queue.spec.type_, QueueType::Upgrade | QueueType::Reverify) {
        let config = ctx.config.get(&queue.spec.team_name).await?;
        if queue.spec.type_ == QueueType::Upgrade && success {
            for component in &queue.spec.components {
                upsert_stable_component(ctx.stores.stable_components.as_ref(), &namespace, component, Some("upgrade"))
                    .await?;
            }
        }
        broadcast_component_upgrade(
            &ctx.reporters,
            &config,
            &ComponentUpgradeReport {
                team_name: queue.spec.team_name.clone(),
                namespace: namespace.clone(),
                queue_type: queue.spec.type_,
                components: queue.spec.components.clone(),
                is_success: success,
                no_of_retry: queue.spec.no_of_retry,
                image_missing_list: status.image_missing_list.clone(),
            },
        )
        .await;
        if !status.image_missing_list.is_empty() {
            broadcast_image_missing(
                &ctx.reporters,
                &config,
                &ImageMissingReport {
                    team_name: queue.spec.team_name.clone(),
                    namespace: namespace.clone(),
                    images: status.image_missing_list.clone(),
                },
            )
            .await;
        }
    }

    metrics::QUEUE_DEPLOYMENTS_TOTAL
        .with_label_values(&[queue.spec.type_.as_str(), if success { "success" } else { "failure" }])
        .inc();

    let status = queue.status_mut();
    if !is_condition_true(&status.conditions, QueueCondition::Finished) {
        set_condition(&mut status.conditions, QueueCondition::Finished, true, "", now);
    }
    status.state = Some(QueueState::Finished);
    info!(queue = %queue.name_any(), namespace = %namespace, success, "Queue finished.");
    Ok(())
}
