/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/pull_request_trigger_controller.rs
*
* This file implements the reconciliation logic for the `PullRequestTrigger`
* custom resource. A trigger waits until every image of a pull request
* bundle has been published, polling the registry on a fixed interval, and
* then hands the commit to the pull request queue.
*
* A trigger that runs out of retries still enqueues its commit, flagged as
* failed, so the queue reports the missing images back to the pull request.
* The trigger is deleted once its commit has been enqueued.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::pull_request_queue_controller::{add_pull_request_queue, PullRequestQueueRequest};
use super::utils::{into_action, is_deleting, on_error, reconcile_span, STEP_REQUEUE};
use crate::context::Context;
use crate::crds::{
    format_time, is_condition_true, parse_time, set_condition, Image, PullRequestTrigger, PullRequestTriggerCondition,
    PullRequestTriggerResult, QueueComponent,
};
use crate::errors::{Error, ResultExt};
use crate::reporter::{broadcast_pull_request_trigger_result, PullRequestTriggerReport};
use crate::settings::PullRequestPolicy;
use crate::store::ignore_not_found;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

const PR_NUMBER_TEMPLATES: [&str; 2] = ["{{ .PRNumber }}", "{{.PRNumber}}"];

/// Main reconciliation function for the `PullRequestTrigger` resource.
pub async fn reconcile(trigger: Arc<PullRequestTrigger>, ctx: Arc<Context>) -> Result<Action, Error> {
    let span = reconcile_span("pull_request_trigger", trigger.as_ref());
    let Some(namespace) = trigger.namespace() else {
        return Err(Error::MissingObjectKey(".metadata.namespace"));
    };
    into_action(
        reconcile_pull_request_trigger(&namespace, &trigger.name_any(), &ctx)
            .instrument(span)
            .await,
    )
}

pub fn error_policy(trigger: Arc<PullRequestTrigger>, error: &Error, _ctx: Arc<Context>) -> Action {
    on_error("pull_request_trigger", trigger.as_ref(), error)
}

/// Substitutes the pull request number into an image tag template.
pub fn render_tag(tag: &str, pr_number: &str) -> String {
    PR_NUMBER_TEMPLATES
        .iter()
        .fold(tag.to_string(), |tag, template| tag.replace(template, pr_number))
}

/// The bundle's components with their pull request images. Components named
/// in the trigger override the configured image.
pub async fn resolve_components(ctx: &Context, trigger: &PullRequestTrigger) -> Result<Vec<QueueComponent>, Error> {
    let spec = &trigger.spec;
    let configured = ctx
        .config
        .get_pull_request_components(&spec.team_name, &spec.bundle_name)
        .await?;
    Ok(configured
        .iter()
        .map(|c| {
            spec.components
                .iter()
                .find(|o| o.name == c.name)
                .cloned()
                .unwrap_or_else(|| {
                    QueueComponent::new(
                        c.name.clone(),
                        c.image.repository.clone(),
                        render_tag(&c.image.tag, &spec.pr_number),
                    )
                })
        })
        .collect())
}

async fn missing_images(ctx: &Context, components: &[QueueComponent]) -> Result<Vec<Image>, Error> {
    let mut missing = Vec::new();
    for component in components {
        let image = component.image();
        if !ctx.image_checker.exists(&image).await? {
            missing.push(image);
        }
    }
    Ok(missing)
}

pub async fn reconcile_pull_request_trigger(namespace: &str, name: &str, ctx: &Context) -> Result<Action, Error> {
    let Some(mut trigger) = ctx.stores.pull_request_triggers.find(Some(namespace), name).await? else {
        return Ok(Action::await_change());
    };
    if is_deleting(&trigger) {
        return Ok(Action::await_change());
    }
    let now = ctx.clock.now();
    let team = trigger.spec.team_name.clone();
    let config = ctx
        .config
        .get(&team)
        .await
        .context(|| format!("loading configuration of team '{}'", team))?;
    let policy = PullRequestPolicy::resolve(&ctx.settings, Some(&config));

    if trigger.status.is_none() {
        let status = trigger.status_mut();
        status.created_at = Some(format_time(now));
        status.next_processed_at = Some(format_time(now));
        set_condition(
            &mut status.conditions,
            PullRequestTriggerCondition::Started,
            true,
            "Waiting for pull request images",
            now,
        );
        save(ctx, &mut trigger, now).await?;
        return Ok(Action::requeue(STEP_REQUEUE));
    }

    if let Some(result) = trigger.status.as_ref().and_then(|s| s.result) {
        let components = resolve_components(ctx, &trigger).await?;
        let status = trigger.status.clone().unwrap_or_default();
        if !is_condition_true(&status.conditions, PullRequestTriggerCondition::Finished) {
            let report = PullRequestTriggerReport {
                team_name: team.clone(),
                bundle_name: trigger.spec.bundle_name.clone(),
                pr_number: trigger.spec.pr_number.clone(),
                commit_sha: trigger.spec.commit_sha.clone(),
                result,
                no_of_retry: status.no_of_retry,
                image_missing_list: status.image_missing_list,
            };
            set_condition(
                &mut trigger.status_mut().conditions,
                PullRequestTriggerCondition::Finished,
                true,
                format!("Pull request trigger finished with {:?}", result),
                now,
            );
            save(ctx, &mut trigger, now).await?;
            broadcast_pull_request_trigger_result(&ctx.reporters, &config, &report).await;
        }

        add_pull_request_queue(
            ctx,
            namespace,
            PullRequestQueueRequest {
                team_name: team,
                bundle_name: trigger.spec.bundle_name.clone(),
                pr_number: trigger.spec.pr_number.clone(),
                commit_sha: trigger.spec.commit_sha.clone(),
                components,
                is_trigger_failed: result == PullRequestTriggerResult::Failure,
            },
        )
        .await?;
        ignore_not_found(ctx.stores.pull_request_triggers.delete(Some(namespace), name).await)
            .context(|| format!("deleting pull request trigger '{}/{}'", namespace, name))?;
        info!(trigger = name, namespace, result = ?result, "Pull request commit enqueued.");
        return Ok(Action::await_change());
    }

    let next = trigger
        .status
        .as_ref()
        .and_then(|s| s.next_processed_at.as_deref())
        .and_then(parse_time);
    if let Some(at) = next {
        if at > now {
            return Ok(Action::requeue((at - now).to_std().unwrap_or_default()));
        }
    }

    let components = resolve_components(ctx, &trigger).await?;
    let missing = missing_images(ctx, &components).await?;
    let status = trigger.status_mut();
    if missing.is_empty() {
        status.result = Some(PullRequestTriggerResult::Success);
        status.image_missing_list.clear();
    } else if status.no_of_retry >= policy.trigger_max_retry {
        warn!(trigger = name, missing = missing.len(), "Images are still missing; giving up.");
        status.result = Some(PullRequestTriggerResult::Failure);
        status.image_missing_list = missing;
    } else {
        status.no_of_retry += 1;
        let polling = chrono::Duration::from_std(policy.trigger_polling_time).unwrap_or_else(|_| chrono::Duration::zero());
        status.next_processed_at = Some(format_time(now + polling));
        status.image_missing_list = missing;
    }
    let done = status.result.is_some();
    save(ctx, &mut trigger, now).await?;
    Ok(Action::requeue(if done {
        STEP_REQUEUE
    } else {
        policy.trigger_polling_time
    }))
}

async fn save(ctx: &Context, trigger: &mut PullRequestTrigger, now: chrono::DateTime<chrono::Utc>) -> Result<(), Error> {
    let name = trigger.name_any();
    trigger.status_mut().updated_at = Some(format_time(now));
    *trigger = ctx
        .stores
        .pull_request_triggers
        .update(trigger)
        .await
        .context(|| format!("updating pull request trigger '{}'", name))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{pull_request_key, PullRequestQueue, PullRequestTriggerSpec};
    use crate::testing::{pull_request_config, TestEnv, BUNDLE, OLD_ACTIVE, STAGING, TEAM};

    async fn trigger_env(adjust: impl FnOnce(&mut crate::settings::Settings)) -> TestEnv {
        let env = TestEnv::with_settings(adjust);
        env.add_team(Some(OLD_ACTIVE)).await;
        env.add_config(pull_request_config()).await;
        env
    }

    async fn create_trigger(env: &TestEnv, pr_number: &str, commit: &str) {
        let mut trigger = PullRequestTrigger::new(
            &pull_request_key(BUNDLE, pr_number),
            PullRequestTriggerSpec {
                team_name: TEAM.into(),
                bundle_name: BUNDLE.into(),
                pr_number: pr_number.into(),
                commit_sha: commit.into(),
                components: Vec::new(),
            },
        );
        trigger.metadata.namespace = Some(STAGING.to_string());
        env.ctx.stores.pull_request_triggers.create(&trigger).await.unwrap();
    }

    async fn trigger(env: &TestEnv) -> Option<PullRequestTrigger> {
        env.ctx
            .stores
            .pull_request_triggers
            .find(Some(STAGING), "wordpress-7")
            .await
            .unwrap()
    }

    async fn queue(env: &TestEnv) -> Option<PullRequestQueue> {
        env.ctx
            .stores
            .pull_request_queues
            .find(Some(STAGING), "wordpress-7")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_published_images_enqueue_the_commit() {
        let env = trigger_env(|_| {}).await;
        create_trigger(&env, "7", "aaa").await;
        env.run(3).await;

        assert!(trigger(&env).await.is_none());
        let prq = queue(&env).await.unwrap();
        assert_eq!(prq.spec.commit_sha, "aaa");
        assert_eq!(prq.spec.is_pr_trigger_failed, Some(false));
        assert_eq!(
            prq.spec.components,
            vec![QueueComponent::new("wordpress", "bitnami/wordpress", "pr-7")]
        );
        let reports = env.reporter.sent("pull-request-trigger");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].detail, "Success");
    }

    #[tokio::test]
    async fn test_missing_images_give_up_after_max_retry() {
        let env = trigger_env(|s| s.pull_request.trigger_max_retry = 2).await;
        env.images.set_missing(&Image {
            repository: "bitnami/wordpress".into(),
            tag: "pr-7".into(),
        });
        create_trigger(&env, "7", "aaa").await;

        env.run(3).await;
        let status = trigger(&env).await.unwrap().status.unwrap();
        assert_eq!(status.result, None);
        assert_eq!(status.no_of_retry, 2);
        assert_eq!(status.image_missing_list.len(), 1);

        env.run(20).await;
        assert!(trigger(&env).await.is_none());
        let reports = env.reporter.sent("pull-request-trigger");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].detail, "Failure");
        assert_eq!(env.reporter.sent("pull-request-queue").len(), 1);
        assert!(!env.namespace_exists("s2h-alpha-wordpress-7").await);
    }

    #[test]
    fn test_render_tag_substitutes_pr_number() {
        assert_eq!(render_tag("pr-{{ .PRNumber }}", "42"), "pr-42");
        assert_eq!(render_tag("{{.PRNumber}}-rc", "7"), "7-rc");
        assert_eq!(render_tag("latest", "7"), "latest");
    }
}
