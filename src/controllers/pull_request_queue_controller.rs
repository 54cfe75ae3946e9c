/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/pull_request_queue_controller.rs
*
* This file implements the reconciliation logic for the `PullRequestQueue`
* custom resource: one ephemeral environment per pull request of a bundle.
*
* Core Logic & State Transitions:
* - Queues wait in their namespace until admitted. Admission copies the
*   upcoming commit and components into the running spec, so a busy pull
*   request only ever restarts with its newest commit.
* - **EnvCreating**: create the pull request namespace.
* - **Deploying**: overlay the bundle's dependencies once, then deploy through
*   a `pull-request` queue.
* - **Testing**: wait for the queue's verdict.
* - **Collecting**: archive and report the attempt, then schedule teardown
*   according to the team's criteria.
* - **EnvDestroying**: restart on a newer commit, retry a failed deployment
*   whose images were all present, or destroy the namespace.
* - **Finished**: delete the queue.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{
    add_finalizer, has_finalizer, into_action, is_deleting, on_error, reconcile_span, remove_finalizer,
    STEP_REQUEUE, WAITING_REQUEUE,
};
use crate::admission::{
    admit, reset_pull_request_queue_order, resume_interrupted_requeue, set_state_label, AdmissionQueue,
};
use crate::context::Context;
use crate::crds::{
    format_time, is_condition_true, parse_time, set_condition, ConfigSpec, PullRequestQueue, PullRequestQueueCondition,
    PullRequestQueueResult, PullRequestQueueSpec, PullRequestQueueState, Queue,
    QueueComponent, QueueSpec, QueueType, TearDownCriteria, NAMESPACE_PREFIX, PULL_REQUEST_QUEUE_FINALIZER,
    STATE_LABEL, STATE_WAITING, TEAM_LABEL,
};
use crate::deploy_engine::truncate_keep_suffix;
use crate::deploy_queue::{delete_queue, ensure_queue, stable_components};
use crate::errors::{Error, ResultExt};
use crate::history::{archive_pull_request_queue, refresh_pull_request_queue_history};
use crate::metrics;
use crate::reporter::{broadcast_image_missing, broadcast_pull_request_queue, ImageMissingReport, PullRequestQueueReport};
use crate::settings::PullRequestPolicy;
use crate::store::ignore_not_found;
use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Instrument};

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_TEARDOWN_POLL: Duration = Duration::from_secs(30);

/// Main reconciliation function for the `PullRequestQueue` resource.
pub async fn reconcile(prq: Arc<PullRequestQueue>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = reconcile_span("pull_request_queue", prq.as_ref());
    let Some(namespace) = prq.namespace() else {
        return Err(Error::MissingObjectKey(".metadata.namespace"));
    };
    into_action(
        reconcile_pull_request_queue(&namespace, &prq.name_any(), &ctx)
            .instrument(span)
            .await,
    )
}

pub fn error_policy(prq: Arc<PullRequestQueue>, error: &Error, _ctx: Arc<Context>) -> Action {
    on_error("pull_request_queue", prq.as_ref(), error)
}

enum Step {
    Persist,
    Wait(Duration),
}

pub async fn reconcile_pull_request_queue(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(mut prq) = ctx.stores.pull_request_queues.find(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };
    let now = ctx.clock.now();

    if is_deleting(&prq) && matches!(prq.state(), None | Some(PullRequestQueueState::Waiting)) {
        if has_finalizer(&prq, PULL_REQUEST_QUEUE_FINALIZER) {
            remove_finalizer(&mut prq, PULL_REQUEST_QUEUE_FINALIZER);
            save(ctx, &mut prq, now).await?;
        }
        return Ok(Action::await_change());
    }

    if !is_deleting(&prq) && resume_interrupted_requeue(&mut prq, now) {
        info!(queue = name, namespace, no_of_retry = prq.spec.no_of_retry, "Resumed interrupted rerun.");
        save(ctx, &mut prq, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    let team = prq.spec.team_name.clone();
    let config = ctx
        .config
        .get(&team)
        .await
        .context(|| format!("loading configuration of team '{}'", team))?;
    let policy = PullRequestPolicy::resolve(&ctx.settings, Some(&config));

    if !is_deleting(&prq) && !has_finalizer(&prq, PULL_REQUEST_QUEUE_FINALIZER) {
        add_finalizer(&mut prq, PULL_REQUEST_QUEUE_FINALIZER);
        save(ctx, &mut prq, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    if apply_cancellation(&mut prq) {
        info!(queue = name, namespace, "Pull request queue canceled.");
        save(ctx, &mut prq, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    {
        let _guard = ctx.admission_lock.lock().await;
        reset_pull_request_queue_order(ctx.stores.pull_request_queues.as_ref(), namespace).await?;
        let admission = admit(
            ctx.stores.pull_request_queues.as_ref(),
            Some(namespace),
            policy.concurrences as usize,
            &prq,
            now,
        )
        .await?;
        if admission.is_current() {
            return Ok(Action::requeue(STEP_REQUEUE));
        }
    }
    // Order renumbering may have bumped the resource version.
    let Some(mut prq) = ctx.stores.pull_request_queues.find(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };

    let pass = Pass {
        ctx,
        config,
        policy,
        now,
    };
    let step = match prq.state() {
        None => {
            let status = prq.status_mut();
            status.state = Some(PullRequestQueueState::Waiting);
            status.created_at = Some(format_time(now));
            set_state_label(&mut prq, STATE_WAITING);
            Step::Persist
        }
        Some(PullRequestQueueState::Waiting) => Step::Wait(WAITING_REQUEUE),
        Some(PullRequestQueueState::EnvCreating) => pass.create_environment(&mut prq).await?,
        Some(PullRequestQueueState::Deploying) => pass.deploy(&mut prq).await?,
        Some(PullRequestQueueState::Testing) => pass.test(&mut prq).await?,
        Some(PullRequestQueueState::Collecting) => pass.collect(&mut prq).await?,
        Some(PullRequestQueueState::EnvDestroying) => pass.destroy_environment(&mut prq).await?,
        Some(PullRequestQueueState::Finished) => return pass.finish(&mut prq).await,
    };

    match step {
        Step::Persist => {
            save(ctx, &mut prq, now).await?;
            Ok(Action::requeue(STEP_REQUEUE))
        }
        Step::Wait(after) => Ok(Action::requeue(after)),
    }
}

async fn save(ctx: &Context, prq: &mut PullRequestQueue, now: DateTime<Utc>) -> Result<(), Error> {
    let name = prq.name_any();
    if prq.status.is_some() {
        prq.status_mut().updated_at = Some(format_time(now));
    }
    *prq = ctx
        .stores
        .pull_request_queues
        .update(prq)
        .await
        .context(|| format!("updating pull request queue '{}'", name))?;
    Ok(())
}

/// Routes a deleted, in-flight queue to result collection.
pub fn apply_cancellation(prq: &mut PullRequestQueue) -> bool {
    let in_flight = matches!(
        prq.state(),
        Some(PullRequestQueueState::EnvCreating | PullRequestQueueState::Deploying | PullRequestQueueState::Testing)
    );
    if !is_deleting(prq) || !in_flight || prq.result() == PullRequestQueueResult::Canceled {
        return false;
    }
    let status = prq.status_mut();
    status.result = PullRequestQueueResult::Canceled;
    status.state = Some(PullRequestQueueState::Collecting);
    true
}

/// `s2h-<team>-<bundle>-<pr>`, trimmed from the left to fit a namespace name.
pub fn pull_request_namespace(team: &str, bundle: &str, pr_number: &str) -> String {
    truncate_keep_suffix(
        &format!("{}{}-{}-{}", NAMESPACE_PREFIX, team, bundle, pr_number),
        MAX_NAMESPACE_LEN,
    )
}

/// Whether a finished attempt keeps its namespace for the teardown duration.
pub fn matches_tear_down_criteria(criteria: TearDownCriteria, result: PullRequestQueueResult) -> bool {
    match result {
        PullRequestQueueResult::Success => matches!(criteria, TearDownCriteria::Both | TearDownCriteria::Success),
        PullRequestQueueResult::Failure => matches!(criteria, TearDownCriteria::Both | TearDownCriteria::Failure),
        PullRequestQueueResult::Canceled | PullRequestQueueResult::Unknown => false,
    }
}

/// Puts the queue back in line with a fresh status for its next attempt.
pub fn reset_for_rerun(prq: &mut PullRequestQueue, no_of_retry: u32, now: DateTime<Utc>) {
    if !prq.spec.upcoming_commit_sha.is_empty() {
        prq.spec.commit_sha = prq.spec.upcoming_commit_sha.clone();
    }
    if !prq.spec.upcoming_components.is_empty() {
        prq.spec.components = prq.spec.upcoming_components.clone();
    }
    prq.spec.no_of_retry = no_of_retry;
    prq.reset_status(now);
    set_state_label(prq, STATE_WAITING);
}

/// Overlays `dependencies` onto `components`: same-named entries are
/// replaced, the rest appended.
pub fn overlay_dependencies(components: &mut Vec<QueueComponent>, dependencies: Vec<QueueComponent>) {
    for dep in dependencies {
        match components.iter_mut().find(|c| c.name == dep.name) {
            Some(existing) => *existing = dep,
            None => components.push(dep),
        }
    }
}

struct Pass<'a> {
    ctx: &'a Context,
    config: ConfigSpec,
    policy: PullRequestPolicy,
    now: DateTime<Utc>,
}

impl Pass<'_> {
    fn queue_spec(&self, prq: &PullRequestQueue) -> QueueSpec {
        QueueSpec {
            team_name: prq.spec.team_name.clone(),
            type_: QueueType::PullRequest,
            components: prq.spec.components.clone(),
            skip_test_runner: false,
            no_of_retry: prq.spec.no_of_retry,
            no_of_order: prq.spec.no_of_order,
            commit_sha: prq.spec.commit_sha.clone(),
            bundle: prq.spec.bundle_name.clone(),
            pr_number: prq.spec.pr_number.clone(),
        }
    }

    async fn deployment_queue(&self, prq: &PullRequestQueue) -> Result<Queue, Error> {
        let namespace = prq.status.as_ref().map(|s| s.pr_namespace.clone()).unwrap_or_default();
        ensure_queue(self.ctx.stores.queues.as_ref(), &namespace, self.queue_spec(prq)).await
    }

    async fn create_environment(&self, prq: &mut PullRequestQueue) -> Result<Step, Error> {
        if prq.is_trigger_failed() {
            debug!(queue = %prq.name_any(), "Images were never found; skipping deployment.");
            prq.status_mut().state = Some(PullRequestQueueState::Collecting);
            return Ok(Step::Persist);
        }

        let team = prq.spec.team_name.clone();
        let namespace = pull_request_namespace(&team, &prq.spec.bundle_name, &prq.spec.pr_number);
        self.ctx
            .environment
            .create_pull_request_environment(&team, &namespace)
            .await?;
        if !self.ctx.environment.namespace_exists(&namespace).await? {
            return Err(Error::TeamNamespaceStillCreating(namespace));
        }

        let status = prq.status_mut();
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::EnvCreated,
            true,
            format!("Pull request environment '{}' has been created", namespace),
            self.now,
        );
        status.pr_namespace = namespace;
        status.state = Some(PullRequestQueueState::Deploying);
        Ok(Step::Persist)
    }

    /// Versions of the bundle's dependencies: the team's active stable
    /// component when there is one, else the configured image.
    async fn resolve_dependencies(&self, prq: &PullRequestQueue) -> Result<Vec<QueueComponent>, Error> {
        let team = &prq.spec.team_name;
        let names = self
            .ctx
            .config
            .get_pull_request_bundle_dependencies(team, &prq.spec.bundle_name)
            .await?;
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let active = self.ctx.environment.get_team(team).await?.namespaces().active;
        let stable: BTreeMap<String, QueueComponent> = if active.is_empty() {
            BTreeMap::new()
        } else {
            stable_components(self.ctx.stores.stable_components.as_ref(), &active)
                .await?
                .into_iter()
                .map(|c| (c.name.clone(), c))
                .collect()
        };
        let configured = self.ctx.config.get_components(team).await?;

        Ok(names
            .iter()
            .filter_map(|name| {
                stable.get(name).cloned().or_else(|| {
                    configured
                        .get(name)
                        .map(|c| QueueComponent::new(name.clone(), c.image.repository.clone(), c.image.tag.clone()))
                })
            })
            .collect())
    }

    async fn deploy(&self, prq: &mut PullRequestQueue) -> Result<Step, Error> {
        if !is_condition_true(prq.conditions(), PullRequestQueueCondition::DependenciesUpdated) {
            let dependencies = self.resolve_dependencies(prq).await?;
            let added = dependencies.len();
            overlay_dependencies(&mut prq.spec.components, dependencies);
            set_condition(
                &mut prq.status_mut().conditions,
                PullRequestQueueCondition::DependenciesUpdated,
                true,
                format!("{} dependencies resolved", added),
                self.now,
            );
            return Ok(Step::Persist);
        }

        let queue = self.deployment_queue(prq).await?;
        let queue_status = queue.status_or_default();
        if !queue_status.is_deploy_attempted() {
            return Err(Error::EnsureComponentDeployed);
        }

        let status = prq.status_mut();
        let deployed = queue_status.is_deploy_success();
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::Deployed,
            deployed,
            if deployed { "Components have been deployed" } else { "Components could not be deployed" },
            self.now,
        );
        if deployed {
            status.state = Some(PullRequestQueueState::Testing);
        } else {
            status.result = PullRequestQueueResult::Failure;
            status.state = Some(PullRequestQueueState::Collecting);
        }
        Ok(Step::Persist)
    }

    async fn test(&self, prq: &mut PullRequestQueue) -> Result<Step, Error> {
        let queue = self.deployment_queue(prq).await?;
        let queue_status = queue.status_or_default();
        if !queue_status.is_finished() {
            return Err(Error::EnsureComponentTested);
        }

        let status = prq.status_mut();
        let passed = queue_status.is_success();
        status.result = if passed {
            PullRequestQueueResult::Success
        } else {
            PullRequestQueueResult::Failure
        };
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::Tested,
            passed,
            if passed { "Components have been tested" } else { "Components failed testing" },
            self.now,
        );
        status.state = Some(PullRequestQueueState::Collecting);
        Ok(Step::Persist)
    }

    async fn collect(&self, prq: &mut PullRequestQueue) -> Result<Step, Error> {
        let namespace = prq.status.as_ref().map(|s| s.pr_namespace.clone()).unwrap_or_default();
        if !namespace.is_empty() {
            let queue = self
                .ctx
                .stores
                .queues
                .find(Some(&namespace), QueueType::PullRequest.as_str())
                .await?;
            if let Some(queue) = queue {
                let queue_status = queue.status_or_default();
                let status = prq.status_mut();
                status.image_missing_list = queue_status.image_missing_list.clone();
                status.deployment_queue = Some(queue_status);
            }
        }
        if prq.result() == PullRequestQueueResult::Unknown {
            prq.status_mut().result = PullRequestQueueResult::Failure;
        }

        self.record_outcome(prq).await?;

        let deploy_attempted = prq
            .status
            .as_ref()
            .and_then(|s| s.deployment_queue.as_ref())
            .is_some_and(|q| q.is_deploy_attempted());
        let keep = !prq.is_trigger_failed()
            && deploy_attempted
            && matches_tear_down_criteria(self.policy.tear_down_criteria, prq.result());
        let destroy_at = if keep {
            self.now + chrono::Duration::from_std(self.policy.tear_down_duration).unwrap_or_else(|_| chrono::Duration::zero())
        } else {
            self.now
        };

        let status = prq.status_mut();
        status.destroyed_time = Some(format_time(destroy_at));
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::ResultCollected,
            true,
            format!("Result {:?} has been collected", status.result),
            self.now,
        );
        status.state = Some(PullRequestQueueState::EnvDestroying);
        Ok(Step::Persist)
    }

    /// Archives and reports the attempt once.
    async fn record_outcome(&self, prq: &mut PullRequestQueue) -> Result<(), Error> {
        let histories = self.ctx.stores.pull_request_queue_histories.as_ref();
        let recorded = prq.status_mut().pull_request_queue_history_name.clone();
        if !recorded.is_empty() {
            return refresh_pull_request_queue_history(histories, &recorded, prq).await;
        }

        let history_name = archive_pull_request_queue(histories, prq, self.policy.max_history_days, self.now).await?;
        prq.status_mut().pull_request_queue_history_name = history_name.clone();

        let status = prq.status.clone().unwrap_or_default();
        broadcast_pull_request_queue(
            &self.ctx.reporters,
            &self.config,
            &PullRequestQueueReport {
                team_name: prq.spec.team_name.clone(),
                bundle_name: prq.spec.bundle_name.clone(),
                pr_number: prq.spec.pr_number.clone(),
                commit_sha: prq.spec.commit_sha.clone(),
                result: status.result,
                pr_namespace: status.pr_namespace.clone(),
                components: prq.spec.components.clone(),
                image_missing_list: status.image_missing_list.clone(),
                no_of_retry: prq.spec.no_of_retry,
                max_retry: self.policy.max_retry,
                history_name: history_name.clone(),
            },
        )
        .await;
        if !status.image_missing_list.is_empty() {
            broadcast_image_missing(
                &self.ctx.reporters,
                &self.config,
                &ImageMissingReport {
                    team_name: prq.spec.team_name.clone(),
                    namespace: status.pr_namespace.clone(),
                    images: status.image_missing_list.clone(),
                },
            )
            .await;
        }

        let result = format!("{:?}", status.result);
        metrics::PULL_REQUEST_QUEUES_TOTAL
            .with_label_values(&[result.as_str()])
            .inc();
        info!(queue = %prq.name_any(), history = %history_name, result = %result, "Pull request queue recorded.");
        Ok(())
    }

    async fn destroy_environment(&self, prq: &mut PullRequestQueue) -> Result<Step, Error> {
        let namespace = prq.status.as_ref().map(|s| s.pr_namespace.clone()).unwrap_or_default();
        if !is_deleting(prq) {
            let rerun = if prq.is_commit_changed() {
                Some(0)
            } else if prq.spec.is_pr_trigger_failed == Some(false)
                && prq.result() == PullRequestQueueResult::Failure
                && prq.spec.no_of_retry < self.policy.max_retry
            {
                Some(prq.spec.no_of_retry + 1)
            } else {
                None
            };
            if let Some(no_of_retry) = rerun {
                delete_queue(self.ctx.stores.queues.as_ref(), &namespace, QueueType::PullRequest).await?;
                reset_for_rerun(prq, no_of_retry, self.now);
                info!(queue = %prq.name_any(), no_of_retry, "Pull request queue is running again.");
                return Ok(Step::Persist);
            }
        }

        let destroy_at = prq
            .status
            .as_ref()
            .and_then(|s| s.destroyed_time.as_deref())
            .and_then(parse_time);
        if let Some(at) = destroy_at {
            if at > self.now {
                let remaining = (at - self.now).to_std().unwrap_or_default();
                return Ok(Step::Wait(remaining.min(MAX_TEARDOWN_POLL)));
            }
        }

        if !namespace.is_empty() {
            delete_queue(self.ctx.stores.queues.as_ref(), &namespace, QueueType::PullRequest).await?;
            self.ctx
                .environment
                .destroy_pull_request_environment(&prq.spec.team_name, &namespace)
                .await?;
            if self.ctx.environment.namespace_exists(&namespace).await? {
                return Err(Error::EnsureNamespaceDestroyed(namespace));
            }
        }

        let status = prq.status_mut();
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::EnvDestroyed,
            true,
            "Pull request environment has been destroyed",
            self.now,
        );
        status.state = Some(PullRequestQueueState::Finished);
        Ok(Step::Persist)
    }

    async fn finish(&self, prq: &mut PullRequestQueue) -> Result<Action, Error> {
        let name = prq.name_any();
        let namespace = prq.namespace().unwrap_or_default();
        if is_deleting(prq) {
            remove_finalizer(prq, PULL_REQUEST_QUEUE_FINALIZER);
            save(self.ctx, prq, self.now).await?;
        } else {
            ignore_not_found(self.ctx.stores.pull_request_queues.delete(Some(&namespace), &name).await)
                .context(|| format!("deleting pull request queue '{}/{}'", namespace, name))?;
        }
        info!(queue = %name, namespace = %namespace, "Pull request queue finished.");
        Ok(Action::await_change())
    }
}

/// Everything needed to enqueue one commit of a pull request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PullRequestQueueRequest {
    pub team_name: String,
    pub bundle_name: String,
    pub pr_number: String,
    pub commit_sha: String,
    pub components: Vec<QueueComponent>,
    pub is_trigger_failed: bool,
}

/// Enqueues a pull request commit in `namespace`.
///
/// A new key is appended after every existing queue. An existing queue keeps
/// its running spec and only buffers the commit as upcoming; the buffer is
/// picked up when the queue is next admitted or restarted.
pub async fn add_pull_request_queue(
    ctx: &Context,
    namespace: &str,
    request: PullRequestQueueRequest,
) -> Result<PullRequestQueue, Error> {
    let store = ctx.stores.pull_request_queues.as_ref();
    let name = crate::crds::pull_request_key(&request.bundle_name, &request.pr_number);
    let _guard = ctx.admission_lock.lock().await;

    let saved = match store.find(Some(namespace), &name).await? {
        Some(existing) if existing.state() == Some(PullRequestQueueState::Finished) => {
            return Err(Error::PullRequestQueueFinishing(name));
        }
        Some(mut existing) => {
            existing.spec.upcoming_commit_sha = request.commit_sha;
            existing.spec.upcoming_components = request.components;
            if matches!(existing.state(), None | Some(PullRequestQueueState::Waiting)) {
                existing.spec.is_pr_trigger_failed = Some(request.is_trigger_failed);
            }
            debug!(queue = %name, namespace, "Buffered upcoming commit.");
            store
                .update(&existing)
                .await
                .context(|| format!("updating pull request queue '{}/{}'", namespace, name))?
        }
        None => {
            let last_order = store
                .list(Some(namespace), &Default::default())
                .await?
                .iter()
                .map(|q| q.spec.no_of_order)
                .max()
                .unwrap_or(0);
            let mut labels = BTreeMap::new();
            labels.insert(TEAM_LABEL.to_string(), request.team_name.clone());
            labels.insert(STATE_LABEL.to_string(), STATE_WAITING.to_string());
            let prq = PullRequestQueue {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.to_string()),
                    labels: Some(labels),
                    finalizers: Some(vec![PULL_REQUEST_QUEUE_FINALIZER.to_string()]),
                    ..Default::default()
                },
                spec: PullRequestQueueSpec {
                    team_name: request.team_name,
                    bundle_name: request.bundle_name,
                    pr_number: request.pr_number,
                    commit_sha: request.commit_sha.clone(),
                    upcoming_commit_sha: request.commit_sha,
                    components: request.components.clone(),
                    upcoming_components: request.components,
                    no_of_retry: 0,
                    no_of_order: last_order + 1,
                    is_pr_trigger_failed: Some(request.is_trigger_failed),
                },
                status: None,
            };
            info!(queue = %name, namespace, "Pull request queue added.");
            store
                .create(&prq)
                .await
                .context(|| format!("creating pull request queue '{}/{}'", namespace, name))?
        }
    };

    reset_pull_request_queue_order(store, namespace).await?;
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{QueueComponent, STATE_RUNNING};
    use crate::settings::Settings;
    use crate::store::label;
    use crate::testing::{pull_request_config, TestEnv, BUNDLE, OLD_ACTIVE, STAGING, TEAM};

    const PR_NAMESPACE: &str = "s2h-alpha-wordpress-7";

    #[test]
    fn test_overlay_replaces_by_name_and_appends_the_rest() {
        let mut components = vec![
            QueueComponent::new("wordpress", "repo/wordpress", "pr-7"),
            QueueComponent::new("redis", "bitnami/redis", "5"),
        ];
        overlay_dependencies(
            &mut components,
            vec![
                QueueComponent::new("redis", "bitnami/redis", "6"),
                QueueComponent::new("mariadb", "bitnami/mariadb", "latest"),
            ],
        );
        assert_eq!(
            components,
            vec![
                QueueComponent::new("wordpress", "repo/wordpress", "pr-7"),
                QueueComponent::new("redis", "bitnami/redis", "6"),
                QueueComponent::new("mariadb", "bitnami/mariadb", "latest"),
            ]
        );
    }

    #[test]
    fn test_tear_down_criteria() {
        use PullRequestQueueResult::*;
        assert!(matches_tear_down_criteria(TearDownCriteria::Both, Success));
        assert!(matches_tear_down_criteria(TearDownCriteria::Both, Failure));
        assert!(matches_tear_down_criteria(TearDownCriteria::Failure, Failure));
        assert!(!matches_tear_down_criteria(TearDownCriteria::Failure, Success));
        assert!(matches_tear_down_criteria(TearDownCriteria::Success, Success));
        assert!(!matches_tear_down_criteria(TearDownCriteria::Both, Canceled));
    }

    #[test]
    fn test_rerun_takes_upcoming_commit() {
        let mut prq = PullRequestQueue::new(
            "wordpress-7",
            PullRequestQueueSpec {
                commit_sha: "aaa".into(),
                upcoming_commit_sha: "bbb".into(),
                components: vec![QueueComponent::new("wordpress", "repo/wordpress", "aaa")],
                upcoming_components: vec![QueueComponent::new("wordpress", "repo/wordpress", "bbb")],
                no_of_retry: 2,
                ..Default::default()
            },
        );
        prq.status_mut().state = Some(PullRequestQueueState::EnvDestroying);
        prq.status_mut().created_at = Some("2024-03-01T10:00:00Z".into());
        assert!(prq.is_commit_changed());

        reset_for_rerun(&mut prq, 0, parse_time("2024-03-01T11:00:00Z").unwrap());
        assert_eq!(prq.spec.commit_sha, "bbb");
        assert_eq!(prq.spec.components[0].version, "bbb");
        assert_eq!(prq.spec.no_of_retry, 0);
        assert_eq!(prq.state(), Some(PullRequestQueueState::Waiting));
        assert_eq!(prq.status.as_ref().unwrap().created_at.as_deref(), Some("2024-03-01T10:00:00Z"));
        assert!(!prq.is_commit_changed());
    }

    #[test]
    fn test_pull_request_namespace_fits() {
        assert_eq!(pull_request_namespace("alpha", "wordpress", "7"), "s2h-alpha-wordpress-7");
        assert_eq!(pull_request_namespace(&"x".repeat(70), "wordpress", "7").len(), MAX_NAMESPACE_LEN);
    }

    async fn pull_request_env(adjust: impl FnOnce(&mut Settings)) -> TestEnv {
        let env = TestEnv::with_settings(adjust);
        env.add_team(Some(OLD_ACTIVE)).await;
        env.add_config(pull_request_config()).await;
        env.add_stable(OLD_ACTIVE, "mariadb", "bitnami/mariadb", "10.3.22").await;
        env
    }

    fn request(pr_number: &str, commit: &str) -> PullRequestQueueRequest {
        PullRequestQueueRequest {
            team_name: TEAM.into(),
            bundle_name: BUNDLE.into(),
            pr_number: pr_number.into(),
            commit_sha: commit.into(),
            components: vec![QueueComponent::new(
                "wordpress",
                "bitnami/wordpress",
                format!("pr-{}", pr_number),
            )],
            is_trigger_failed: false,
        }
    }

    async fn pull_request(env: &TestEnv) -> Option<PullRequestQueue> {
        env.ctx
            .stores
            .pull_request_queues
            .find(Some(STAGING), "wordpress-7")
            .await
            .unwrap()
    }

    async fn step_until(env: &TestEnv, state: PullRequestQueueState) -> PullRequestQueue {
        for _ in 0..30 {
            if let Some(prq) = pull_request(env).await {
                if prq.state() == Some(state) {
                    return prq;
                }
            }
            env.step().await.unwrap();
        }
        panic!("pull request queue never reached {:?}", state);
    }

    async fn histories(env: &TestEnv) -> Vec<crate::crds::PullRequestQueueHistory> {
        env.ctx
            .stores
            .pull_request_queue_histories
            .list(Some(STAGING), &Default::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dependencies_come_from_active_then_config() {
        let env = pull_request_env(|_| {}).await;
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        let prq = step_until(&env, PullRequestQueueState::Testing).await;

        let expected = vec![
            QueueComponent::new("wordpress", "bitnami/wordpress", "pr-7"),
            QueueComponent::new("mariadb", "bitnami/mariadb", "10.3.22"),
            QueueComponent::new("redis", "bitnami/redis", "latest"),
        ];
        assert_eq!(prq.spec.components, expected);
        let queue = env
            .ctx
            .stores
            .queues
            .get(Some(PR_NAMESPACE), QueueType::PullRequest.as_str())
            .await
            .unwrap();
        assert_eq!(queue.spec.components, expected);
        assert_eq!(queue.spec.commit_sha, "aaa");
    }

    #[tokio::test]
    async fn test_new_commit_is_buffered_and_restarts_the_queue() {
        let env = pull_request_env(|_| {}).await;
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        step_until(&env, PullRequestQueueState::Deploying).await;

        add_pull_request_queue(&env.ctx, STAGING, request("7", "bbb")).await.unwrap();
        let prq = pull_request(&env).await.unwrap();
        assert_eq!(prq.spec.commit_sha, "aaa");
        assert_eq!(prq.spec.upcoming_commit_sha, "bbb");
        assert_eq!(prq.state(), Some(PullRequestQueueState::Deploying));

        env.run(80).await;
        assert!(pull_request(&env).await.is_none());
        let commits: Vec<String> = env
            .reporter
            .sent("pull-request-queue")
            .into_iter()
            .map(|r| r.detail)
            .collect();
        assert_eq!(commits, vec!["aaa".to_string(), "bbb".to_string()]);
        assert_eq!(histories(&env).await.len(), 2);
        assert!(!env.namespace_exists(PR_NAMESPACE).await);
        assert!(env.team().await.namespaces().pull_requests.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_failure_skips_the_environment() {
        let env = pull_request_env(|_| {}).await;
        let mut failed = request("7", "aaa");
        failed.is_trigger_failed = true;
        add_pull_request_queue(&env.ctx, STAGING, failed).await.unwrap();
        env.run(20).await;

        assert!(pull_request(&env).await.is_none());
        assert!(!env.namespace_exists(PR_NAMESPACE).await);
        assert!(env.engine.releases_in(PR_NAMESPACE).is_empty());
        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        assert!(!records[0].spec.is_success);
        assert_eq!(records[0].spec.pull_request_queue.spec.is_pr_trigger_failed, Some(true));
        assert_eq!(
            records[0].spec.pull_request_queue.status.result,
            PullRequestQueueResult::Failure
        );
    }

    #[tokio::test]
    async fn test_failed_deployment_is_retried_up_to_max_retry() {
        let env = pull_request_env(|s| s.pull_request.max_retry = 1).await;
        env.engine.fail_component("wordpress");
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        env.run(80).await;

        assert!(pull_request(&env).await.is_none());
        let records = histories(&env).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|h| !h.spec.is_success));
        let mut retries: Vec<u32> = records
            .iter()
            .map(|h| h.spec.pull_request_queue.spec.no_of_retry)
            .collect();
        retries.sort();
        assert_eq!(retries, vec![0, 1]);
        assert_eq!(env.reporter.sent("pull-request-queue").len(), 2);
    }

    #[tokio::test]
    async fn test_admission_runs_one_pull_request_at_a_time() {
        let env = pull_request_env(|s| s.pull_request.concurrences = 1).await;
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        add_pull_request_queue(&env.ctx, STAGING, request("8", "ccc")).await.unwrap();

        for _ in 0..80 {
            let running = env
                .ctx
                .stores
                .pull_request_queues
                .list(Some(STAGING), &label(STATE_LABEL, STATE_RUNNING))
                .await
                .unwrap();
            assert!(running.len() <= 1);
            env.step().await.unwrap();
        }
        let remaining = env
            .ctx
            .stores
            .pull_request_queues
            .list(Some(STAGING), &Default::default())
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(env.reporter.sent("pull-request-queue").len(), 2);
    }

    #[tokio::test]
    async fn test_deleting_a_running_queue_cancels_it() {
        let env = pull_request_env(|_| {}).await;
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        step_until(&env, PullRequestQueueState::Deploying).await;

        env.ctx
            .stores
            .pull_request_queues
            .delete(Some(STAGING), "wordpress-7")
            .await
            .unwrap();
        env.run(30).await;

        assert!(pull_request(&env).await.is_none());
        assert!(!env.namespace_exists(PR_NAMESPACE).await);
        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].spec.pull_request_queue.status.result,
            PullRequestQueueResult::Canceled
        );
    }

    #[tokio::test]
    async fn test_commit_for_a_waiting_queue_is_only_buffered() {
        let env = pull_request_env(|s| s.pull_request.concurrences = 1).await;
        add_pull_request_queue(&env.ctx, STAGING, request("8", "ccc")).await.unwrap();
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        step_until(&env, PullRequestQueueState::Waiting).await;

        add_pull_request_queue(&env.ctx, STAGING, request("7", "bbb")).await.unwrap();
        let prq = pull_request(&env).await.unwrap();
        assert_eq!(prq.spec.commit_sha, "aaa");
        assert_eq!(prq.spec.upcoming_commit_sha, "bbb");
        assert_eq!(prq.spec.no_of_order, 2);
        assert_eq!(prq.state(), Some(PullRequestQueueState::Waiting));

        env.run(100).await;
        assert!(pull_request(&env).await.is_none());
        let commits: Vec<String> = env
            .reporter
            .sent("pull-request-queue")
            .into_iter()
            .map(|r| r.detail)
            .collect();
        assert_eq!(commits, vec!["ccc".to_string(), "bbb".to_string()]);
    }

    #[tokio::test]
    async fn test_collecting_again_records_the_outcome_once() {
        let env = pull_request_env(|_| {}).await;
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        let mut prq = step_until(&env, PullRequestQueueState::EnvDestroying).await;
        assert!(!prq.status.as_ref().unwrap().pull_request_queue_history_name.is_empty());

        prq.status_mut().state = Some(PullRequestQueueState::Collecting);
        env.ctx.stores.pull_request_queues.update(&prq).await.unwrap();
        env.run(30).await;

        assert!(pull_request(&env).await.is_none());
        assert_eq!(histories(&env).await.len(), 1);
        assert_eq!(env.reporter.sent("pull-request-queue").len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_rerun_write_runs_the_retry_once() {
        let env = pull_request_env(|s| s.pull_request.max_retry = 1).await;
        env.engine.fail_component("wordpress");
        add_pull_request_queue(&env.ctx, STAGING, request("7", "aaa")).await.unwrap();
        step_until(&env, PullRequestQueueState::EnvDestroying).await;

        env.pull_request_queues.interrupt_next_update();
        assert!(env.step().await.is_err());
        let stored = pull_request(&env).await.unwrap();
        assert_eq!(stored.spec.no_of_retry, 1);
        assert_eq!(stored.labels().get(STATE_LABEL).map(String::as_str), Some(STATE_WAITING));
        assert_eq!(stored.state(), Some(PullRequestQueueState::EnvDestroying));

        env.run(80).await;
        assert!(pull_request(&env).await.is_none());
        let mut retries: Vec<u32> = histories(&env)
            .await
            .iter()
            .map(|h| h.spec.pull_request_queue.spec.no_of_retry)
            .collect();
        retries.sort();
        assert_eq!(retries, vec![0, 1]);
        assert_eq!(env.reporter.sent("pull-request-queue").len(), 2);
    }
}
