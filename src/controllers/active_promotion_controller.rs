/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/active_promotion_controller.rs
*
* This file implements the reconciliation logic for the `ActivePromotion`
* custom resource. An ActivePromotion is named after its team and moves the
* team's stable components from staging into a freshly built namespace, then
* swaps that namespace in as the team's active environment.
*
* Core Logic & State Transitions:
* - Every pass starts from a fresh read and runs, in order: the retry check,
*   the finalizer, cancellation, the promotion timeout, admission, and then
*   one step of the state machine.
* - **CreatingPreActive → DeployingComponents → TestingPreActive**: build the
*   target namespace, copy the staging stable components into it, deploy and
*   verify them through a `pre-active` queue.
* - **CollectingPreActiveResult**: snapshot the verification outcome. A failed
*   or canceled promotion tears the target down (`DestroyingPreActive`); a
*   verified one demotes the current active namespace (`Demoting`).
* - **Demoting → ActiveEnvironment → DestroyingPreviousActive**: the order of
*   the last two depends on `noDowntimeGuarantee`.
* - **Rollback**: restores the team's active namespace after a failure past
*   verification.
* - **Finished**: terminal. Failed promotions with retries left start over;
*   anything else is torn down and deleted.
*
* Cancellation and the promotion timeout share one branch: past verification
* they roll back, before it they collect the partial result. The history
* record and the report are written once per attempt, guarded by
* `status.activePromotionHistoryName`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::utils::{
    add_finalizer, has_finalizer, into_action, is_deleting, on_error, reconcile_span, remove_finalizer,
    STEP_REQUEUE, WAITING_REQUEUE,
};
use crate::admission::{admit, resume_interrupted_requeue, set_state_label, AdmissionQueue};
use crate::context::Context;
use crate::crds::{
    format_time, is_condition_true, parse_time, set_condition, ActivePromotion, ConfigSpec,
    OutcomeStatus, PromotionCondition, PromotionResult, PromotionState, Queue, QueueComponent, QueueSpec, QueueType,
    ACTIVE_PROMOTION_FINALIZER, NAMESPACE_PREFIX, STATE_WAITING,
};
use crate::deploy_engine::truncate_keep_suffix;
use crate::deploy_queue::{copy_stable_components, delete_queue, ensure_queue, finished_status, stable_components};
use crate::errors::{Error, ResultExt};
use crate::history::{archive_active_promotion, refresh_active_promotion_history};
use crate::metrics;
use crate::reporter::{
    broadcast_active_environment_deleted, broadcast_active_promotion_status, broadcast_image_missing,
    ActiveEnvironmentDeletedReport, ActivePromotionReport, ImageMissingReport,
};
use crate::settings::PromotionPolicy;
use crate::store::ignore_not_found;
use crate::timeout::{format_duration, is_timeout_from_config, override_duration};
use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const MAX_NAMESPACE_LEN: usize = 63;
/// Longest wait between checks of `destroyedTime`.
const MAX_TEARDOWN_POLL: Duration = Duration::from_secs(30);

/// Main reconciliation function for the `ActivePromotion` resource.
pub async fn reconcile(atp: Arc<ActivePromotion>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = reconcile_span("active_promotion", atp.as_ref());
    into_action(
        reconcile_active_promotion(&atp.name_any(), ctx)
            .instrument(span)
            .await,
    )
}

pub fn error_policy(atp: Arc<ActivePromotion>, error: &Error, _ctx: Arc<Context>) -> Action {
    on_error("active_promotion", atp.as_ref(), error)
}

/// What a state handler leaves for the end of the pass.
enum Step {
    /// The status changed; write it and come back shortly.
    Persist,
    /// Nothing to write yet.
    Wait(Duration),
}

/// One pass over the promotion of team `name`.
pub async fn reconcile_active_promotion(name: &str, ctx: Arc<Context>) -> Result<Action, Error> {
    let Some(mut atp) = ctx.stores.active_promotions.find(None, name).await? else {
        return Ok(Action::await_change());
    };
    let now = ctx.clock.now();

    // Nothing was built for a promotion that never started.
    if is_deleting(&atp) && matches!(atp.state(), None | Some(PromotionState::Waiting)) {
        if has_finalizer(&atp, ACTIVE_PROMOTION_FINALIZER) {
            remove_finalizer(&mut atp, ACTIVE_PROMOTION_FINALIZER);
            save(&ctx, &mut atp, now).await?;
        }
        return Ok(Action::await_change());
    }

    if !is_deleting(&atp) && resume_interrupted_requeue(&mut atp, now) {
        info!(team = name, retry = atp.spec.no_of_retry, "Resumed interrupted requeue of active promotion.");
        save(&ctx, &mut atp, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    let config = ctx
        .config
        .get(name)
        .await
        .context(|| format!("loading configuration of team '{}'", name))?;
    let policy = PromotionPolicy::resolve(&ctx.settings, Some(&config));

    if should_retry(&atp, policy.max_retry) {
        reset_for_retry(&mut atp, now);
        info!(team = name, retry = atp.spec.no_of_retry, "Retrying failed active promotion.");
        save(&ctx, &mut atp, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    if !is_deleting(&atp) && !has_finalizer(&atp, ACTIVE_PROMOTION_FINALIZER) {
        add_finalizer(&mut atp, ACTIVE_PROMOTION_FINALIZER);
        save(&ctx, &mut atp, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    if apply_cancellation(&mut atp, now) {
        info!(team = name, state = ?atp.state(), "Active promotion canceled.");
        save(&ctx, &mut atp, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    if apply_promotion_timeout(&mut atp, policy.timeout, now) {
        warn!(team = name, timeout = %format_duration(policy.timeout), "Active promotion timed out.");
        save(&ctx, &mut atp, now).await?;
        return Err(Error::ActivePromotionTimeout);
    }

    {
        let _guard = ctx.admission_lock.lock().await;
        let admission = admit(
            ctx.stores.active_promotions.as_ref(),
            None,
            ctx.settings.active_promotion.concurrences,
            &atp,
            now,
        )
        .await?;
        if admission.is_current() {
            return Ok(Action::requeue(STEP_REQUEUE));
        }
    }

    let pass = Pass {
        ctx: &ctx,
        config,
        policy,
        team: name.to_string(),
        now,
    };
    let step = match atp.state() {
        None => pass.initialize(&mut atp),
        Some(PromotionState::Waiting) => Step::Wait(WAITING_REQUEUE),
        Some(PromotionState::CreatingPreActive) => pass.create_pre_active(&mut atp).await?,
        Some(PromotionState::DeployingComponents) => pass.deploy_components(&mut atp).await?,
        Some(PromotionState::TestingPreActive) => pass.test_pre_active(&mut atp).await?,
        Some(PromotionState::CollectingPreActiveResult) => pass.collect_result(&mut atp).await?,
        Some(PromotionState::Demoting) => pass.demote_active(&mut atp).await?,
        Some(PromotionState::ActiveEnvironment) => pass.promote_active(&mut atp).await?,
        Some(PromotionState::DestroyingPreviousActive) => pass.destroy_previous_active(&mut atp).await?,
        Some(PromotionState::DestroyingPreActive) => pass.destroy_pre_active(&mut atp).await?,
        Some(PromotionState::Rollback) => pass.rollback(&mut atp).await?,
        Some(PromotionState::Finished) => return pass.finish(&mut atp).await,
    };

    match step {
        Step::Persist => {
            save(&ctx, &mut atp, now).await?;
            Ok(Action::requeue(STEP_REQUEUE))
        }
        Step::Wait(after) => Ok(Action::requeue(after)),
    }
}

async fn save(ctx: &Context, atp: &mut ActivePromotion, now: DateTime<Utc>) -> Result<(), Error> {
    let name = atp.name_any();
    if atp.status.is_some() {
        atp.status_mut().updated_at = Some(format_time(now));
    }
    *atp = ctx
        .stores
        .active_promotions
        .update(atp)
        .await
        .context(|| format!("updating active promotion '{}'", name))?;
    Ok(())
}

pub fn should_retry(atp: &ActivePromotion, max_retry: u32) -> bool {
    !is_deleting(atp)
        && atp.state() == Some(PromotionState::Finished)
        && atp.result() == PromotionResult::Failure
        && atp.spec.no_of_retry < max_retry
}

/// Starts the promotion over from scratch as its next attempt.
pub fn reset_for_retry(atp: &mut ActivePromotion, now: DateTime<Utc>) {
    atp.reset_status(now);
    atp.spec.no_of_retry += 1;
    set_state_label(atp, STATE_WAITING);
}

/// Past verification an aborted promotion rolls back; before it, the partial
/// result is collected.
fn branch_after_abort(atp: &mut ActivePromotion, now: DateTime<Utc>) {
    let verified = is_condition_true(atp.conditions(), PromotionCondition::Verified);
    let status = atp.status_mut();
    if verified {
        status.state = Some(PromotionState::Rollback);
        set_condition(
            &mut status.conditions,
            PromotionCondition::RollbackStarted,
            true,
            "Rolling back the active environment",
            now,
        );
    } else {
        status.state = Some(PromotionState::CollectingPreActiveResult);
    }
}

fn is_abortable(atp: &ActivePromotion) -> bool {
    atp.state().is_some_and(|s| !s.is_uncancellable()) && atp.result() != PromotionResult::Canceled
}

/// Marks a promotion whose deletion was requested as canceled. Returns
/// whether the status changed.
pub fn apply_cancellation(atp: &mut ActivePromotion, now: DateTime<Utc>) -> bool {
    if !is_deleting(atp) || !is_abortable(atp) {
        return false;
    }
    let status = atp.status_mut();
    status.result = PromotionResult::Canceled;
    status.message = "Active promotion has been canceled".to_string();
    branch_after_abort(atp, now);
    true
}

/// Fails a promotion that has been running for longer than `timeout`.
/// Returns whether the status changed.
pub fn apply_promotion_timeout(atp: &mut ActivePromotion, timeout: Duration, now: DateTime<Utc>) -> bool {
    if !is_abortable(atp) || atp.status.as_ref().is_some_and(|s| s.is_timeout) {
        return false;
    }
    if !is_timeout_from_config(atp.conditions(), PromotionCondition::Started, timeout, now) {
        return false;
    }
    let status = atp.status_mut();
    status.is_timeout = true;
    status.result = PromotionResult::Failure;
    status.message = "Active promotion has timed out".to_string();
    branch_after_abort(atp, now);
    true
}

/// `s2h-<team>-<stamp>`, trimmed from the left to fit a namespace name.
pub fn target_namespace(team: &str, now: DateTime<Utc>) -> String {
    let name = format!("{}{}-{}", NAMESPACE_PREFIX, team, now.format("%y%m%d-%H%M%S"));
    if name.len() <= MAX_NAMESPACE_LEN {
        return name;
    }
    truncate_keep_suffix(&name, MAX_NAMESPACE_LEN)
}

/// Everything one pass of a state handler needs.
struct Pass<'a> {
    ctx: &'a Arc<Context>,
    config: ConfigSpec,
    policy: PromotionPolicy,
    team: String,
    now: DateTime<Utc>,
}

impl Pass<'_> {
    fn initialize(&self, atp: &mut ActivePromotion) -> Step {
        if atp.spec.tear_down_duration.is_none() {
            atp.spec.tear_down_duration = Some(format_duration(self.policy.tear_down_duration));
        }
        set_state_label(atp, STATE_WAITING);
        let status = atp.status_mut();
        status.state = Some(PromotionState::Waiting);
        if status.started_at.is_none() {
            status.started_at = Some(format_time(self.now));
        }
        info!(team = %self.team, "Active promotion is waiting.");
        Step::Persist
    }

    fn queue_spec(&self, atp: &ActivePromotion, queue_type: QueueType, components: Vec<QueueComponent>) -> QueueSpec {
        QueueSpec {
            team_name: self.team.clone(),
            type_: queue_type,
            components,
            skip_test_runner: queue_type != QueueType::PreActive || atp.spec.skip_test_runner,
            no_of_retry: atp.spec.no_of_retry,
            ..Default::default()
        }
    }

    async fn ensure_queue_in(
        &self,
        atp: &ActivePromotion,
        namespace: &str,
        queue_type: QueueType,
    ) -> Result<Queue, Error> {
        let components = stable_components(self.ctx.stores.stable_components.as_ref(), namespace).await?;
        ensure_queue(
            self.ctx.stores.queues.as_ref(),
            namespace,
            self.queue_spec(atp, queue_type, components),
        )
        .await
    }

    async fn create_pre_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        if atp.status_mut().target_namespace.is_empty() {
            let team = self.ctx.environment.get_team(&self.team).await?;
            let status = atp.status_mut();
            status.target_namespace = target_namespace(&self.team, self.now);
            status.previous_active_namespace = team.namespaces().active;
            info!(team = %self.team, target = %status.target_namespace, "Target namespace chosen.");
            return Ok(Step::Persist);
        }

        let target = atp.status_mut().target_namespace.clone();
        self.ctx
            .environment
            .create_pre_active_environment(&self.team, &target)
            .await?;
        let team = self.ctx.environment.get_team(&self.team).await?;
        if team.namespaces().pre_active != target {
            return Err(Error::TeamNamespaceStillCreating(target));
        }

        let staging = team.staging_namespace(&self.team);
        let copied = copy_stable_components(self.ctx.stores.stable_components.as_ref(), &staging, &target)
            .await
            .context(|| format!("copying stable components from '{}'", staging))?;
        debug!(team = %self.team, copied, "Stable components copied into the target namespace.");

        let status = atp.status_mut();
        set_condition(
            &mut status.conditions,
            PromotionCondition::PreActiveCreated,
            true,
            format!("Pre-active environment '{}' has been created", target),
            self.now,
        );
        status.state = Some(PromotionState::DeployingComponents);
        Ok(Step::Persist)
    }

    async fn deploy_components(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let target = atp.status_mut().target_namespace.clone();
        let queue = self.ensure_queue_in(atp, &target, QueueType::PreActive).await?;
        let queue_status = queue.status_or_default();
        if !queue_status.is_deploy_attempted() {
            return Err(Error::EnsureComponentDeployed);
        }

        let status = atp.status_mut();
        if queue_status.is_deploy_success() {
            status.state = Some(PromotionState::TestingPreActive);
        } else {
            status.result = PromotionResult::Failure;
            set_condition(
                &mut status.conditions,
                PromotionCondition::Verified,
                true,
                "Components could not be deployed into the pre-active environment",
                self.now,
            );
            status.state = Some(PromotionState::CollectingPreActiveResult);
        }
        Ok(Step::Persist)
    }

    async fn test_pre_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let target = atp.status_mut().target_namespace.clone();
        let queue = self.ensure_queue_in(atp, &target, QueueType::PreActive).await?;
        let queue_status = queue.status_or_default();
        if !queue_status.is_finished() {
            return Err(Error::EnsureComponentTested);
        }

        let status = atp.status_mut();
        let message = if queue_status.is_success() {
            "Pre-active environment has been verified"
        } else {
            status.result = PromotionResult::Failure;
            "Pre-active environment failed verification"
        };
        set_condition(&mut status.conditions, PromotionCondition::Verified, true, message, self.now);
        status.state = Some(PromotionState::CollectingPreActiveResult);
        Ok(Step::Persist)
    }

    async fn collect_result(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let target = atp.status_mut().target_namespace.clone();
        if !target.is_empty() {
            let queue = self
                .ctx
                .stores
                .queues
                .find(Some(&target), QueueType::PreActive.as_str())
                .await?;
            if let Some(queue) = queue {
                atp.status_mut().pre_active_queue = Some(queue.status_or_default());
            }
        }

        let status = atp.status_mut();
        match status.result {
            PromotionResult::Failure | PromotionResult::Canceled => {
                let reason = if status.result == PromotionResult::Canceled {
                    "Active promotion has been canceled"
                } else if status.is_timeout {
                    "Active promotion has timed out"
                } else if status
                    .pre_active_queue
                    .as_ref()
                    .is_some_and(|q| !q.image_missing_list.is_empty())
                {
                    "Some images are missing"
                } else {
                    "Pre-active environment failed verification"
                };
                set_condition(&mut status.conditions, PromotionCondition::ResultCollected, true, reason, self.now);
                set_condition(&mut status.conditions, PromotionCondition::ActivePromoted, false, reason, self.now);
                status.state = Some(PromotionState::DestroyingPreActive);
            }
            _ => {
                set_condition(
                    &mut status.conditions,
                    PromotionCondition::ActiveDemotionStarted,
                    true,
                    "Demoting the active environment",
                    self.now,
                );
                status.state = Some(PromotionState::Demoting);
            }
        }
        Ok(Step::Persist)
    }

    fn branch_after_demotion(&self, atp: &mut ActivePromotion) {
        let no_downtime = atp.spec.no_downtime_guarantee;
        atp.status_mut().state = Some(if no_downtime {
            PromotionState::DestroyingPreviousActive
        } else {
            PromotionState::ActiveEnvironment
        });
    }

    /// Destroys the still active namespace outright after a failed demotion.
    async fn force_destroy_active(&self, atp: &mut ActivePromotion, reason: &str) -> Result<(), Error> {
        let previous = atp.status_mut().previous_active_namespace.clone();
        warn!(team = %self.team, namespace = %previous, reason, "Force deleting the active environment.");
        self.ctx
            .environment
            .destroy_active_environment(&self.team, &previous)
            .await?;
        broadcast_active_environment_deleted(
            &self.ctx.reporters,
            &self.config,
            &ActiveEnvironmentDeletedReport {
                team_name: self.team.clone(),
                active_namespace: previous,
                deleted_by: "samsahai".to_string(),
                deleted_at: format_time(self.now),
            },
        )
        .await;

        let status = atp.status_mut();
        status.demotion_status = Some(OutcomeStatus::Failure);
        set_condition(&mut status.conditions, PromotionCondition::ActiveDemoted, false, reason, self.now);
        self.branch_after_demotion(atp);
        Ok(())
    }

    async fn demote_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let previous = atp.status_mut().previous_active_namespace.clone();
        if previous.is_empty() {
            let status = atp.status_mut();
            status.demotion_status = Some(OutcomeStatus::Success);
            set_condition(
                &mut status.conditions,
                PromotionCondition::ActiveDemoted,
                true,
                "There is no active environment to demote",
                self.now,
            );
            self.branch_after_demotion(atp);
            return Ok(Step::Persist);
        }

        if is_timeout_from_config(
            atp.conditions(),
            PromotionCondition::ActiveDemotionStarted,
            self.policy.demotion_timeout,
            self.now,
        ) {
            self.force_destroy_active(atp, "Demoting the active environment has timed out")
                .await?;
            save(self.ctx, atp, self.now).await?;
            return Err(Error::ActiveDemotionTimeout);
        }

        let queue = self.ensure_queue_in(atp, &previous, QueueType::DemoteFromActive).await?;
        match finished_status(&queue, || Error::EnsureActiveDemoted) {
            Ok(_) => {
                let status = atp.status_mut();
                status.demotion_status = Some(OutcomeStatus::Success);
                set_condition(
                    &mut status.conditions,
                    PromotionCondition::ActiveDemoted,
                    true,
                    "Active environment has been demoted",
                    self.now,
                );
                self.branch_after_demotion(atp);
            }
            Err(e) if e.is_release_failed() => {
                self.force_destroy_active(atp, "Demoting the active environment has failed")
                    .await?;
            }
            Err(e) => return Err(e),
        }
        Ok(Step::Persist)
    }

    async fn promote_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let target = atp.status_mut().target_namespace.clone();
        delete_queue(self.ctx.stores.queues.as_ref(), &target, QueueType::PreActive).await?;

        let queue = self.ensure_queue_in(atp, &target, QueueType::PromoteToActive).await?;
        if let Err(e) = finished_status(&queue, || Error::EnsureComponentDeployed) {
            if !e.is_release_failed() {
                return Err(e);
            }
            let status = atp.status_mut();
            status.result = PromotionResult::Failure;
            status.message = "Components could not be promoted to active".to_string();
            set_condition(
                &mut status.conditions,
                PromotionCondition::RollbackStarted,
                true,
                "Promoting the active environment has failed",
                self.now,
            );
            status.state = Some(PromotionState::Rollback);
            return Ok(Step::Persist);
        }

        self.ctx
            .environment
            .promote_active_environment(&self.team, &target, atp.spec.promoted_by.as_deref())
            .await?;
        let team = self.ctx.environment.get_team(&self.team).await?;
        if team.namespaces().active != target {
            return Err(Error::EnsureActivePromoted);
        }

        let previous_destroyed = is_condition_true(atp.conditions(), PromotionCondition::PreviousActiveDestroyed);
        if previous_destroyed && !team.namespaces().previous_active.is_empty() {
            self.ctx
                .environment
                .set_previous_active_namespace(&self.team, "")
                .await?;
        }

        let tear_down = override_duration(atp.spec.tear_down_duration.as_deref(), self.policy.tear_down_duration);
        let status = atp.status_mut();
        if !status.previous_active_namespace.is_empty() && status.destroyed_time.is_none() && !previous_destroyed {
            let at = self.now + chrono::Duration::from_std(tear_down).unwrap_or_else(|_| chrono::Duration::zero());
            status.destroyed_time = Some(format_time(at));
        }
        status.result = PromotionResult::Success;
        status.message = format!("'{}' is the active environment", target);
        set_condition(
            &mut status.conditions,
            PromotionCondition::ResultCollected,
            true,
            "Active promotion has succeeded",
            self.now,
        );
        set_condition(
            &mut status.conditions,
            PromotionCondition::ActivePromoted,
            true,
            "Active environment has been promoted",
            self.now,
        );
        info!(team = %self.team, active = %target, "Active environment promoted.");

        if previous_destroyed {
            self.finish_with(atp, true, "Active promotion has finished").await?;
        } else {
            atp.status_mut().state = Some(PromotionState::DestroyingPreviousActive);
            self.record_outcome(atp).await?;
        }
        Ok(Step::Persist)
    }

    /// Deletes every release left in `namespace`. Fails until none remain.
    async fn delete_releases(&self, namespace: &str) -> Result<(), Error> {
        let deployment = self.ctx.deployment_for(&self.config, QueueType::PromoteToActive, "");
        let engine = self.ctx.engine_for(deployment, namespace)?;
        let releases = engine.get_releases().await?;
        if releases.is_empty() {
            return Ok(());
        }
        for release in &releases {
            engine.delete(&release.name).await?;
        }
        Err(Error::DeletingReleases(namespace.to_string()))
    }

    async fn destroy_previous_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let promoted = is_condition_true(atp.conditions(), PromotionCondition::ActivePromoted);
        let status = atp.status_mut();
        let previous = status.previous_active_namespace.clone();
        let already_destroyed = is_condition_true(&status.conditions, PromotionCondition::PreviousActiveDestroyed);

        if !previous.is_empty() && !already_destroyed {
            if promoted {
                let destroy_at = status.destroyed_time.as_deref().and_then(parse_time);
                if let Some(at) = destroy_at {
                    if at > self.now {
                        let remaining = (at - self.now).to_std().unwrap_or_default();
                        return Ok(Step::Wait(remaining.min(MAX_TEARDOWN_POLL)));
                    }
                }
            }

            self.delete_releases(&previous).await?;
            if promoted {
                self.ctx
                    .environment
                    .destroy_previous_active_environment(&self.team, &previous)
                    .await?;
            } else {
                self.ctx
                    .environment
                    .destroy_active_environment(&self.team, &previous)
                    .await?;
            }
            if self.ctx.environment.namespace_exists(&previous).await? {
                return Err(Error::EnsureNamespaceDestroyed(previous));
            }
        }

        let status = atp.status_mut();
        set_condition(
            &mut status.conditions,
            PromotionCondition::PreviousActiveDestroyed,
            true,
            "Previous active environment has been destroyed",
            self.now,
        );
        if promoted {
            self.finish_with(atp, true, "Active promotion has finished").await?;
        } else {
            status.state = Some(PromotionState::ActiveEnvironment);
        }
        Ok(Step::Persist)
    }

    async fn destroy_pre_active(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        let target = atp.status_mut().target_namespace.clone();
        if !target.is_empty() {
            self.delete_releases(&target).await?;
            self.ctx
                .environment
                .destroy_pre_active_environment(&self.team, &target)
                .await?;
            if self.ctx.environment.namespace_exists(&target).await? {
                return Err(Error::EnsureNamespaceDestroyed(target));
            }
        }

        set_condition(
            &mut atp.status_mut().conditions,
            PromotionCondition::PreActiveDestroyed,
            true,
            "Pre-active environment has been destroyed",
            self.now,
        );
        self.finish_with(atp, true, "Active promotion has finished").await?;
        Ok(Step::Persist)
    }

    async fn rollback(&self, atp: &mut ActivePromotion) -> Result<Step, Error> {
        if is_timeout_from_config(
            atp.conditions(),
            PromotionCondition::RollbackStarted,
            self.policy.rollback_timeout,
            self.now,
        ) {
            atp.status_mut().rollback_status = Some(OutcomeStatus::Failure);
            self.finish_with(atp, false, "Rollback has timed out").await?;
            save(self.ctx, atp, self.now).await?;
            return Err(Error::RollbackActivePromotionTimeout);
        }

        let status = atp.status_mut();
        let target = status.target_namespace.clone();
        let previous = status.previous_active_namespace.clone();

        let restore = tokio::spawn(restore_active(self.ctx.clone(), self.team.clone(), target.clone(), previous));
        let destroy = tokio::spawn(destroy_target(self.ctx.clone(), self.team.clone(), target));
        tokio::try_join!(flatten(restore), flatten(destroy))?;

        let team = self.ctx.environment.get_team(&self.team).await?;
        let active = team.namespaces().active;
        if active.is_empty() {
            atp.status_mut().rollback_status = Some(OutcomeStatus::Success);
            self.finish_with(atp, true, "Rollback has finished").await?;
            return Ok(Step::Persist);
        }

        if !self.ctx.environment.namespace_exists(&active).await? {
            warn!(team = %self.team, namespace = %active, "Active namespace is gone; recreating it from staging.");
            self.ctx
                .environment
                .promote_active_environment(&self.team, &active, atp.spec.promoted_by.as_deref())
                .await?;
            copy_stable_components(
                self.ctx.stores.stable_components.as_ref(),
                &team.staging_namespace(&self.team),
                &active,
            )
            .await?;
        }

        let queue = self.ensure_queue_in(atp, &active, QueueType::PromoteToActive).await?;
        let succeeded = match finished_status(&queue, || Error::EnsureComponentDeployed) {
            Ok(_) => true,
            Err(e) if e.is_release_failed() => false,
            Err(e) => return Err(e),
        };
        atp.status_mut().rollback_status = Some(if succeeded {
            OutcomeStatus::Success
        } else {
            OutcomeStatus::Failure
        });
        let message = if succeeded {
            "Rollback has finished"
        } else {
            "Rollback could not redeploy the active environment"
        };
        self.finish_with(atp, succeeded, message).await?;
        Ok(Step::Persist)
    }

    /// Moves into `Finished`, writing the history record and the report
    /// first.
    async fn finish_with(&self, atp: &mut ActivePromotion, finished: bool, message: &str) -> Result<(), Error> {
        let status = atp.status_mut();
        set_condition(&mut status.conditions, PromotionCondition::Finished, finished, message, self.now);
        status.state = Some(PromotionState::Finished);
        self.record_outcome(atp).await
    }

    /// Archives the attempt and reports it, once. Later calls only refresh the
    /// archived snapshot.
    async fn record_outcome(&self, atp: &mut ActivePromotion) -> Result<(), Error> {
        let histories = self.ctx.stores.active_promotion_histories.as_ref();
        let recorded = atp.status_mut().active_promotion_history_name.clone();
        if !recorded.is_empty() {
            return refresh_active_promotion_history(histories, &recorded, atp).await;
        }

        let history_name = archive_active_promotion(histories, atp, self.policy.max_histories, self.now).await?;
        atp.status_mut().active_promotion_history_name = history_name.clone();

        let current_active = self.ctx.environment.get_team(&self.team).await?.namespaces().active;
        let status = atp.status.clone().unwrap_or_default();
        let image_missing_list = status
            .pre_active_queue
            .as_ref()
            .map(|q| q.image_missing_list.clone())
            .unwrap_or_default();
        broadcast_active_promotion_status(
            &self.ctx.reporters,
            &self.config,
            &ActivePromotionReport {
                team_name: self.team.clone(),
                result: status.result,
                state: status.state,
                promoted_by: atp.spec.promoted_by.clone(),
                target_namespace: status.target_namespace.clone(),
                previous_active_namespace: status.previous_active_namespace.clone(),
                current_active_namespace: current_active,
                is_timeout: status.is_timeout,
                demotion_status: status.demotion_status,
                rollback_status: status.rollback_status,
                no_of_retry: atp.spec.no_of_retry,
                image_missing_list: image_missing_list.clone(),
                history_name: history_name.clone(),
                message: status.message.clone(),
            },
        )
        .await;
        if !image_missing_list.is_empty() {
            broadcast_image_missing(
                &self.ctx.reporters,
                &self.config,
                &ImageMissingReport {
                    team_name: self.team.clone(),
                    namespace: status.target_namespace.clone(),
                    images: image_missing_list,
                },
            )
            .await;
        }

        let result = format!("{:?}", status.result);
        metrics::ACTIVE_PROMOTIONS_TOTAL
            .with_label_values(&[result.as_str()])
            .inc();
        if let Some(started) = status.started_at.as_deref().and_then(parse_time) {
            let elapsed = (self.now - started).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::ACTIVE_PROMOTION_DURATION_SECONDS.observe(elapsed);
        }
        info!(team = %self.team, history = %history_name, result = ?status.result, "Active promotion recorded.");
        Ok(())
    }

    /// Removes the transient queues, then the promotion itself.
    async fn finish(&self, atp: &mut ActivePromotion) -> Result<Action, Error> {
        let status = atp.status_mut();
        let namespaces = [status.target_namespace.clone(), status.previous_active_namespace.clone()];
        for namespace in &namespaces {
            for queue_type in [QueueType::PreActive, QueueType::PromoteToActive, QueueType::DemoteFromActive] {
                delete_queue(self.ctx.stores.queues.as_ref(), namespace, queue_type).await?;
            }
        }

        if is_deleting(atp) {
            remove_finalizer(atp, ACTIVE_PROMOTION_FINALIZER);
            save(self.ctx, atp, self.now).await?;
        } else {
            ignore_not_found(self.ctx.stores.active_promotions.delete(None, &self.team).await)
                .context(|| format!("deleting active promotion '{}'", self.team))?;
        }
        info!(team = %self.team, "Active promotion finished.");
        Ok(Action::await_change())
    }
}

async fn flatten(handle: tokio::task::JoinHandle<Result<(), Error>>) -> Result<(), Error> {
    handle.await?
}

/// Hands the active namespace back to `previous` and clears what the failed
/// attempt deployed into `target`.
async fn restore_active(ctx: Arc<Context>, team: String, target: String, previous: String) -> Result<(), Error> {
    let record = ctx.environment.get_team(&team).await?;
    if !target.is_empty() && record.namespaces().active == target {
        ctx.environment.set_active_namespace(&team, &previous).await?;
    }
    if target.is_empty() {
        return Ok(());
    }
    for queue_type in [QueueType::PreActive, QueueType::PromoteToActive] {
        delete_queue(ctx.stores.queues.as_ref(), &target, queue_type).await?;
    }
    let config = ctx.config.get(&team).await?;
    let engine = ctx.engine_for(ctx.deployment_for(&config, QueueType::PromoteToActive, ""), &target)?;
    for release in engine.get_releases().await? {
        engine.delete(&release.name).await?;
    }
    Ok(())
}

async fn destroy_target(ctx: Arc<Context>, team: String, target: String) -> Result<(), Error> {
    if target.is_empty() {
        return Ok(());
    }
    ctx.environment.destroy_pre_active_environment(&team, &target).await?;
    if ctx.environment.namespace_exists(&target).await? {
        return Err(Error::TeamNamespaceStillExists(target));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        find_condition, parse_time, ActivePromotionHistory, ActivePromotionSpec, ActivePromotionStatus, Image, STATE_LABEL,
    };
    use crate::settings::Settings;
    use crate::testing::{component, TestEnv, OLD_ACTIVE, STAGING, TEAM};

    fn at(s: &str) -> DateTime<Utc> {
        parse_time(s).unwrap()
    }

    fn running(state: PromotionState, verified: bool, started: DateTime<Utc>) -> ActivePromotion {
        let mut atp = ActivePromotion::new("alpha", ActivePromotionSpec::default());
        let status = atp.status_mut();
        status.state = Some(state);
        set_condition(&mut status.conditions, PromotionCondition::Started, true, "", started);
        if verified {
            set_condition(&mut status.conditions, PromotionCondition::Verified, true, "", started);
        }
        atp
    }

    #[test]
    fn test_cancel_and_timeout_take_the_same_branch() {
        let start = at("2024-03-01T10:00:00Z");
        let later = start + chrono::Duration::minutes(31);
        for (verified, expected) in [
            (true, PromotionState::Rollback),
            (false, PromotionState::CollectingPreActiveResult),
        ] {
            let mut canceled = running(PromotionState::Demoting, verified, start);
            canceled.metadata.deletion_timestamp = crate::crds::to_k8s_time(later);
            assert!(apply_cancellation(&mut canceled, later));
            assert_eq!(canceled.state(), Some(expected));
            assert_eq!(canceled.result(), PromotionResult::Canceled);

            let mut timed_out = running(PromotionState::Demoting, verified, start);
            assert!(apply_promotion_timeout(&mut timed_out, Duration::from_secs(30 * 60), later));
            assert_eq!(timed_out.state(), Some(expected));
            assert_eq!(timed_out.result(), PromotionResult::Failure);
            assert!(timed_out.status.as_ref().unwrap().is_timeout);
        }
    }

    #[test]
    fn test_abort_fires_once_and_skips_uncancellable_states() {
        let start = at("2024-03-01T10:00:00Z");
        let later = start + chrono::Duration::hours(2);
        let mut atp = running(PromotionState::DeployingComponents, false, start);
        assert!(apply_promotion_timeout(&mut atp, Duration::from_secs(60), later));
        assert!(!apply_promotion_timeout(&mut atp, Duration::from_secs(60), later));

        let mut rollback = running(PromotionState::Rollback, true, start);
        rollback.metadata.deletion_timestamp = crate::crds::to_k8s_time(later);
        assert!(!apply_cancellation(&mut rollback, later));
        assert!(!apply_promotion_timeout(&mut rollback, Duration::from_secs(60), later));
    }

    #[test]
    fn test_retry_is_bounded_by_max_retry() {
        let now = at("2024-03-01T10:00:00Z");
        let mut atp = running(PromotionState::Finished, true, now);
        atp.status_mut().result = PromotionResult::Failure;
        atp.spec.no_of_retry = 1;
        assert!(should_retry(&atp, 2));
        reset_for_retry(&mut atp, now);
        assert_eq!(atp.spec.no_of_retry, 2);
        assert_eq!(atp.state(), None);
        assert!(atp.conditions().is_empty());
        assert_eq!(atp.labels().get(STATE_LABEL).map(String::as_str), Some(STATE_WAITING));

        let mut exhausted = running(PromotionState::Finished, true, now);
        exhausted.status_mut().result = PromotionResult::Failure;
        exhausted.spec.no_of_retry = 2;
        assert!(!should_retry(&exhausted, 2));
    }

    #[test]
    fn test_target_namespace_fits_namespace_limit() {
        let now = at("2024-03-01T10:00:00Z");
        assert_eq!(target_namespace("alpha", now), "s2h-alpha-240301-100000");
        let long = "a".repeat(80);
        assert_eq!(target_namespace(&long, now).len(), MAX_NAMESPACE_LEN);
    }

    async fn promotion_env(adjust: impl FnOnce(&mut Settings)) -> TestEnv {
        let env = TestEnv::with_settings(adjust);
        env.add_team(Some(OLD_ACTIVE)).await;
        env.add_config(ConfigSpec {
            components: vec![
                component("redis", "bitnami/redis", "5"),
                component("wordpress", "bitnami/wordpress", "5.7"),
            ],
            ..Default::default()
        })
        .await;
        env.add_stable(STAGING, "redis", "bitnami/redis", "5.0.7").await;
        env.add_stable(STAGING, "wordpress", "bitnami/wordpress", "5.7.2").await;
        env.add_stable(OLD_ACTIVE, "redis", "bitnami/redis", "5.0.5").await;
        env
    }

    async fn start_promotion(env: &TestEnv, spec: ActivePromotionSpec) {
        let atp = ActivePromotion::new(TEAM, spec);
        env.ctx.stores.active_promotions.create(&atp).await.unwrap();
    }

    async fn promotion(env: &TestEnv) -> Option<ActivePromotion> {
        env.ctx.stores.active_promotions.find(None, TEAM).await.unwrap()
    }

    async fn histories(env: &TestEnv) -> Vec<ActivePromotionHistory> {
        env.ctx
            .stores
            .active_promotion_histories
            .list(None, &Default::default())
            .await
            .unwrap()
    }

    async fn step_until(env: &TestEnv, state: PromotionState) -> ActivePromotion {
        for _ in 0..60 {
            let atp = promotion(env).await.unwrap();
            if atp.state() == Some(state) {
                return atp;
            }
            env.step().await.unwrap();
        }
        panic!("promotion never reached {:?}", state);
    }

    /// Runs a promotion until it is about to demote the active namespace,
    /// then makes every deployment into its target namespace fail.
    async fn fail_promotion_to_active(env: &TestEnv) -> String {
        start_promotion(env, ActivePromotionSpec::default()).await;
        let target = step_until(env, PromotionState::Demoting).await.status.unwrap().target_namespace;
        env.engine.fail_namespace(&target);
        target
    }

    fn recorded_status(record: &ActivePromotionHistory) -> &ActivePromotionStatus {
        &record.spec.active_promotion.status
    }

    #[tokio::test]
    async fn test_promotion_swaps_active_and_keeps_bounded_history() {
        let env = promotion_env(|s| s.active_promotion.max_histories = 2).await;
        let mut previous = OLD_ACTIVE.to_string();
        for _ in 0..3 {
            start_promotion(&env, ActivePromotionSpec::default()).await;
            env.run(80).await;
            assert!(promotion(&env).await.is_none());

            let active = env.team().await.namespaces().active;
            assert_ne!(active, previous);
            assert!(active.starts_with("s2h-alpha-"));
            assert!(env.namespace_exists(&active).await);
            assert!(!env.namespace_exists(&previous).await);
            assert!(env.engine.releases_in(&previous).is_empty());
            assert_eq!(env.stable(&active).await, env.stable(STAGING).await);
            previous = active;
        }

        let records = histories(&env).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|h| h.spec.is_success));
        let reports = env.reporter.sent("active-promotion");
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.detail == "Success"));
    }

    #[tokio::test]
    async fn test_demotion_timeout_destroys_active_and_still_promotes() {
        let env = promotion_env(|s| s.active_promotion.demotion_timeout = Duration::ZERO).await;
        start_promotion(
            &env,
            ActivePromotionSpec {
                no_downtime_guarantee: true,
                ..Default::default()
            },
        )
        .await;
        env.run(80).await;
        assert!(promotion(&env).await.is_none());

        let namespaces = env.team().await.namespaces();
        assert!(namespaces.active.starts_with("s2h-alpha-"));
        assert_ne!(namespaces.active, OLD_ACTIVE);
        assert!(namespaces.previous_active.is_empty());
        assert!(!env.namespace_exists(OLD_ACTIVE).await);

        let deleted = env.reporter.sent("active-environment-deleted");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].detail, OLD_ACTIVE);

        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        let status = &records[0].spec.active_promotion.status;
        assert_eq!(status.result, PromotionResult::Success);
        assert_eq!(status.demotion_status, Some(OutcomeStatus::Failure));
    }

    #[tokio::test]
    async fn test_cancel_before_verification_destroys_target_only() {
        let env = promotion_env(|_| {}).await;
        start_promotion(&env, ActivePromotionSpec::default()).await;
        for _ in 0..20 {
            if promotion(&env).await.unwrap().state() == Some(PromotionState::DeployingComponents) {
                break;
            }
            env.step().await.unwrap();
        }
        let target = promotion(&env).await.unwrap().status.unwrap().target_namespace;
        assert!(env.namespace_exists(&target).await);

        env.ctx.stores.active_promotions.delete(None, TEAM).await.unwrap();
        env.run(40).await;

        assert!(promotion(&env).await.is_none());
        assert!(!env.namespace_exists(&target).await);
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        assert!(env.namespace_exists(OLD_ACTIVE).await);
        let reports = env.reporter.sent("active-promotion");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].detail, "Canceled");
    }

    #[tokio::test]
    async fn test_failed_promotion_retries_once_then_gives_up() {
        let env = promotion_env(|s| s.active_promotion.max_retry = 1).await;
        env.images.set_missing(&crate::crds::Image {
            repository: "bitnami/redis".into(),
            tag: "5.0.7".into(),
        });
        start_promotion(&env, ActivePromotionSpec::default()).await;
        env.run(120).await;

        assert!(promotion(&env).await.is_none());
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        let records = histories(&env).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|h| !h.spec.is_success));
        let retries: Vec<u32> = records.iter().map(|h| h.spec.active_promotion.spec.no_of_retry).collect();
        assert!(retries.contains(&0) && retries.contains(&1));
        assert_eq!(env.reporter.sent("active-promotion").len(), 2);
        assert_eq!(env.reporter.sent("image-missing").len(), 2);
    }

    #[tokio::test]
    async fn test_interrupted_retry_write_runs_the_retry_once() {
        let env = promotion_env(|s| s.active_promotion.max_retry = 1).await;
        env.images.set_missing(&Image {
            repository: "bitnami/redis".into(),
            tag: "5.0.7".into(),
        });
        start_promotion(&env, ActivePromotionSpec::default()).await;
        step_until(&env, PromotionState::Finished).await;

        env.promotions.interrupt_next_update();
        assert!(env.step().await.is_err());
        let stored = promotion(&env).await.unwrap();
        assert_eq!(stored.spec.no_of_retry, 1);
        assert_eq!(stored.labels().get(STATE_LABEL).map(String::as_str), Some(STATE_WAITING));
        assert_eq!(stored.state(), Some(PromotionState::Finished));

        env.run(120).await;
        assert!(promotion(&env).await.is_none());
        let mut retries: Vec<u32> = histories(&env)
            .await
            .iter()
            .map(|h| h.spec.active_promotion.spec.no_of_retry)
            .collect();
        retries.sort();
        assert_eq!(retries, vec![0, 1]);
        assert_eq!(env.reporter.sent("active-promotion").len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_after_verification_rolls_back() {
        let env = promotion_env(|_| {}).await;
        start_promotion(&env, ActivePromotionSpec::default()).await;
        let atp = step_until(&env, PromotionState::Demoting).await;
        assert!(is_condition_true(atp.conditions(), PromotionCondition::Verified));
        let target = atp.status.unwrap().target_namespace;

        env.ctx.stores.active_promotions.delete(None, TEAM).await.unwrap();
        env.step().await.unwrap();
        assert_eq!(promotion(&env).await.unwrap().state(), Some(PromotionState::Rollback));
        env.run(60).await;

        assert!(promotion(&env).await.is_none());
        assert!(!env.namespace_exists(&target).await);
        assert!(env.engine.releases_in(&target).is_empty());
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        assert!(env.namespace_exists(OLD_ACTIVE).await);

        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        let status = recorded_status(&records[0]);
        assert_eq!(status.result, PromotionResult::Canceled);
        assert_eq!(status.rollback_status, Some(OutcomeStatus::Success));
        let reports = env.reporter.sent("active-promotion");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].detail, "Canceled");
    }

    #[tokio::test]
    async fn test_failed_promotion_to_active_rolls_back() {
        let env = promotion_env(|_| {}).await;
        let target = fail_promotion_to_active(&env).await;
        env.run(80).await;

        assert!(promotion(&env).await.is_none());
        assert!(!env.namespace_exists(&target).await);
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        assert!(!env.engine.releases_in(OLD_ACTIVE).is_empty());

        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        let status = recorded_status(&records[0]);
        assert_eq!(status.result, PromotionResult::Failure);
        assert_eq!(status.rollback_status, Some(OutcomeStatus::Success));
        assert!(is_condition_true(&status.conditions, PromotionCondition::Finished));
        assert_eq!(env.reporter.sent("active-promotion")[0].detail, "Failure");
    }

    #[tokio::test]
    async fn test_rollback_timeout_finishes_unsuccessfully() {
        let env = promotion_env(|s| s.active_promotion.rollback_timeout = Duration::ZERO).await;
        fail_promotion_to_active(&env).await;
        env.run(80).await;

        assert!(promotion(&env).await.is_none());
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        let status = recorded_status(&records[0]);
        assert_eq!(status.result, PromotionResult::Failure);
        assert_eq!(status.rollback_status, Some(OutcomeStatus::Failure));
        let finished = find_condition(&status.conditions, PromotionCondition::Finished).unwrap();
        assert!(!finished.status);
        assert_eq!(finished.message, "Rollback has timed out");
    }

    #[tokio::test]
    async fn test_rollback_recreates_force_destroyed_active() {
        let env = promotion_env(|s| s.active_promotion.demotion_timeout = Duration::ZERO).await;
        let target = fail_promotion_to_active(&env).await;
        env.run(80).await;

        assert!(promotion(&env).await.is_none());
        assert!(!env.namespace_exists(&target).await);
        assert_eq!(env.team().await.namespaces().active, OLD_ACTIVE);
        assert!(env.namespace_exists(OLD_ACTIVE).await);
        assert_eq!(env.stable(OLD_ACTIVE).await, env.stable(STAGING).await);
        assert_eq!(env.engine.releases_in(OLD_ACTIVE).len(), 2);

        let deleted = env.reporter.sent("active-environment-deleted");
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].detail, OLD_ACTIVE);
        let records = histories(&env).await;
        assert_eq!(records.len(), 1);
        let status = recorded_status(&records[0]);
        assert_eq!(status.demotion_status, Some(OutcomeStatus::Failure));
        assert_eq!(status.rollback_status, Some(OutcomeStatus::Success));
    }
}
