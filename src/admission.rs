/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/admission.rs
*
* Waiting/running admission shared by promotions and pull request queues.
*
* Core Logic:
* - Count the objects labelled `state=running` in the scope. At capacity,
*   nothing happens.
* - Otherwise pick the first `state=waiting` object by the kind's order,
*   relabel it `running`, let the kind mark it started, and persist it.
* - Report back whether the admitted object is the one the caller is
*   reconciling; its in-memory copy is stale after that write.
*
* Admission may write an object other than the one being reconciled. This is
* the only cross-object write in the operator.
*
* The state label and the status are written by two requests against the API
* server. The label is written first, so a lost status write shows up as a
* label that disagrees with the status:
* - `running` over a waiting status: an admission lost its start. `admit`
*   starts it again before looking at capacity.
* - `waiting` over a status that moved on: a retry or restart lost its status
*   reset. `resume_interrupted_requeue` finishes it without touching the spec.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{
    format_time, set_condition, ActivePromotion, ActivePromotionStatus, PromotionCondition, PromotionState,
    PullRequestQueue, PullRequestQueueCondition, PullRequestQueueState, PullRequestQueueStatus, STATE_LABEL,
    STATE_RUNNING, STATE_WAITING,
};
use crate::errors::{Error, ResultExt};
use crate::ordering::{compare_promotions, compare_pull_request_queues, reset_queue_order};
use crate::store::{label, Store, StoredObject};
use chrono::{DateTime, Utc};
use kube::{Resource, ResourceExt};
use std::cmp::Ordering;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    NotTriggered,
    Admitted { name: String, is_current: bool },
}

impl Admission {
    /// True when the caller must stop its pass.
    pub fn is_current(&self) -> bool {
        matches!(self, Admission::Admitted { is_current: true, .. })
    }
}

/// A kind that is admitted through the waiting/running labels.
pub trait AdmissionQueue: StoredObject {
    fn admission_order(a: &Self, b: &Self) -> Ordering;

    /// Moves an admitted object into its first working state.
    fn start(&mut self, now: DateTime<Utc>);

    /// Whether the status has not been started yet.
    fn is_waiting(&self) -> bool;

    /// Gives the object a fresh status for another run through the queue.
    fn reset_status(&mut self, now: DateTime<Utc>);
}

impl AdmissionQueue for ActivePromotion {
    fn admission_order(a: &Self, b: &Self) -> Ordering {
        compare_promotions(a, b)
    }

    fn start(&mut self, now: DateTime<Utc>) {
        let status = self.status_mut();
        status.state = Some(PromotionState::CreatingPreActive);
        status.updated_at = Some(format_time(now));
        set_condition(
            &mut status.conditions,
            PromotionCondition::Started,
            true,
            "Active promotion has been started",
            now,
        );
    }

    fn is_waiting(&self) -> bool {
        matches!(self.state(), None | Some(PromotionState::Waiting))
    }

    fn reset_status(&mut self, now: DateTime<Utc>) {
        let started_at = format_time(now);
        self.status = Some(ActivePromotionStatus {
            started_at: Some(started_at.clone()),
            updated_at: Some(started_at),
            ..Default::default()
        });
    }
}

impl AdmissionQueue for PullRequestQueue {
    fn admission_order(a: &Self, b: &Self) -> Ordering {
        compare_pull_request_queues(a, b)
    }

    fn start(&mut self, now: DateTime<Utc>) {
        if !self.spec.upcoming_commit_sha.is_empty() {
            self.spec.commit_sha = self.spec.upcoming_commit_sha.clone();
        }
        if !self.spec.upcoming_components.is_empty() {
            self.spec.components = self.spec.upcoming_components.clone();
        }
        let created_at = self.status.as_ref().and_then(|s| s.created_at.clone());
        let mut status = PullRequestQueueStatus {
            state: Some(PullRequestQueueState::EnvCreating),
            created_at: created_at.or_else(|| Some(format_time(now))),
            updated_at: Some(format_time(now)),
            ..Default::default()
        };
        set_condition(
            &mut status.conditions,
            PullRequestQueueCondition::Started,
            true,
            "Pull request queue has been started",
            now,
        );
        self.status = Some(status);
    }

    fn is_waiting(&self) -> bool {
        matches!(self.state(), None | Some(PullRequestQueueState::Waiting))
    }

    fn reset_status(&mut self, now: DateTime<Utc>) {
        let created_at = self.status.as_ref().and_then(|s| s.created_at.clone());
        self.status = Some(PullRequestQueueStatus {
            state: Some(PullRequestQueueState::Waiting),
            created_at: created_at.or_else(|| Some(format_time(now))),
            ..Default::default()
        });
    }
}

pub fn set_state_label<K: Resource>(obj: &mut K, value: &str) {
    obj.labels_mut()
        .insert(STATE_LABEL.to_string(), value.to_string());
}

fn has_state_label<K: Resource>(obj: &K, value: &str) -> bool {
    obj.labels().get(STATE_LABEL).is_some_and(|v| v == value)
}

/// Finishes a retry or restart whose status reset was lost: the object is
/// labelled `waiting` but its status is past waiting. Returns whether `obj`
/// changed and needs to be written.
pub fn resume_interrupted_requeue<K: AdmissionQueue>(obj: &mut K, now: DateTime<Utc>) -> bool {
    if !has_state_label(obj, STATE_WAITING) || obj.is_waiting() {
        return false;
    }
    obj.reset_status(now);
    true
}

fn admitted<K: Resource>(admitted: &K, current: &K) -> Admission {
    let name = admitted.name_any();
    let is_current = name == current.name_any() && admitted.namespace() == current.namespace();
    Admission::Admitted { name, is_current }
}

/// Admits at most one waiting object of `scope` (all namespaces when `None`).
pub async fn admit<K: AdmissionQueue>(
    store: &dyn Store<K>,
    scope: Option<&str>,
    concurrency: usize,
    current: &K,
    now: DateTime<Utc>,
) -> Result<Admission, Error> {
    let running = store
        .list(scope, &label(STATE_LABEL, STATE_RUNNING))
        .await
        .context(|| "listing running queues".to_string())?;

    let stalled = running
        .iter()
        .find(|r| r.is_waiting() && r.meta().deletion_timestamp.is_none())
        .cloned();
    if let Some(mut stalled) = stalled {
        stalled.start(now);
        let resumed = store.update(&stalled).await?;
        info!(name = %resumed.name_any(), namespace = ?resumed.namespace(), "Resumed interrupted admission.");
        return Ok(admitted(&resumed, current));
    }

    if running.len() >= concurrency {
        return Ok(Admission::NotTriggered);
    }

    let mut waiting = store
        .list(scope, &label(STATE_LABEL, STATE_WAITING))
        .await
        .context(|| "listing waiting queues".to_string())?;
    waiting.retain(|w| w.meta().deletion_timestamp.is_none());
    waiting.sort_by(K::admission_order);
    let Some(mut next) = waiting.into_iter().next() else {
        return Ok(Admission::NotTriggered);
    };

    next.start(now);
    set_state_label(&mut next, STATE_RUNNING);
    let saved = store.update(&next).await?;
    info!(name = %saved.name_any(), namespace = ?saved.namespace(), "Admitted waiting queue.");
    Ok(admitted(&saved, current))
}

/// Renumbers every pull request queue of `namespace` and writes back the ones
/// whose order changed.
pub async fn reset_pull_request_queue_order(
    store: &dyn Store<PullRequestQueue>,
    namespace: &str,
) -> Result<(), Error> {
    let mut queues = store
        .list(Some(namespace), &Default::default())
        .await
        .context(|| format!("listing pull request queues in '{}'", namespace))?;
    queues.retain(|q| q.meta().deletion_timestamp.is_none());
    for i in reset_queue_order(&mut queues) {
        match store.update(&queues[i]).await {
            Ok(_) => {}
            // Someone else touched it; the next reset picks it up.
            Err(e) if e.is_conflict() || e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::crds::{parse_time, ActivePromotionSpec, PullRequestQueueSpec, QueueComponent};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(parse_time("2024-03-01T10:00:00Z").unwrap()))
    }

    async fn waiting_promotion(store: &MemoryStore<ActivePromotion>, name: &str) -> ActivePromotion {
        let mut atp = ActivePromotion::new(name, ActivePromotionSpec::default());
        set_state_label(&mut atp, STATE_WAITING);
        atp.status_mut().state = Some(PromotionState::Waiting);
        store.create(&atp).await.unwrap()
    }

    async fn count_running<K: AdmissionQueue>(store: &MemoryStore<K>, scope: Option<&str>) -> usize {
        store
            .list(scope, &label(STATE_LABEL, STATE_RUNNING))
            .await
            .unwrap()
            .len()
    }

    #[tokio::test]
    async fn test_admission_never_exceeds_concurrency() {
        let clock = clock();
        let store = MemoryStore::<ActivePromotion>::new(clock.clone());
        let mut all = Vec::new();
        for name in ["alpha", "beta", "gamma", "delta"] {
            all.push(waiting_promotion(&store, name).await);
            clock.advance(Duration::from_secs(1));
        }

        for concurrency in [1usize, 2] {
            for _ in 0..6 {
                for current in &all {
                    admit(&store, None, concurrency, current, clock.now()).await.unwrap();
                    assert!(count_running(&store, None).await <= concurrency);
                }
            }
            assert_eq!(count_running(&store, None).await, concurrency);
        }
    }

    #[tokio::test]
    async fn test_admission_picks_oldest_and_flags_current() {
        let clock = clock();
        let store = MemoryStore::<ActivePromotion>::new(clock.clone());
        let alpha = waiting_promotion(&store, "alpha").await;
        clock.advance(Duration::from_secs(1));
        let beta = waiting_promotion(&store, "beta").await;

        let result = admit(&store, None, 1, &beta, clock.now()).await.unwrap();
        assert_eq!(
            result,
            Admission::Admitted {
                name: "alpha".into(),
                is_current: false
            }
        );

        let admitted = store.get(None, "alpha").await.unwrap();
        assert_eq!(admitted.state(), Some(PromotionState::CreatingPreActive));
        assert!(crate::crds::is_condition_true(admitted.conditions(), PromotionCondition::Started));
        assert_eq!(admit(&store, None, 1, &alpha, clock.now()).await.unwrap(), Admission::NotTriggered);
    }

    #[tokio::test]
    async fn test_lost_start_is_resumed_before_anything_else_is_admitted() {
        let clock = clock();
        let store = MemoryStore::<ActivePromotion>::new(clock.clone());
        let alpha = waiting_promotion(&store, "alpha").await;
        clock.advance(Duration::from_secs(1));
        let beta = waiting_promotion(&store, "beta").await;

        store.interrupt_next_update();
        assert!(admit(&store, None, 1, &beta, clock.now()).await.is_err());
        let stalled = store.get(None, "alpha").await.unwrap();
        assert!(has_state_label(&stalled, STATE_RUNNING));
        assert_eq!(stalled.state(), Some(PromotionState::Waiting));

        let result = admit(&store, None, 1, &beta, clock.now()).await.unwrap();
        assert_eq!(
            result,
            Admission::Admitted {
                name: "alpha".into(),
                is_current: false
            }
        );
        let resumed = store.get(None, "alpha").await.unwrap();
        assert_eq!(resumed.state(), Some(PromotionState::CreatingPreActive));
        assert_eq!(count_running(&store, None).await, 1);
        assert_eq!(admit(&store, None, 1, &alpha, clock.now()).await.unwrap(), Admission::NotTriggered);
        assert!(has_state_label(&store.get(None, "beta").await.unwrap(), STATE_WAITING));
    }

    #[test]
    fn test_lost_status_reset_is_finished_from_the_label() {
        let now = parse_time("2024-03-01T10:00:00Z").unwrap();
        let mut atp = ActivePromotion::new("alpha", ActivePromotionSpec { no_of_retry: 1, ..Default::default() });
        atp.status_mut().state = Some(PromotionState::Finished);
        assert!(!resume_interrupted_requeue(&mut atp, now));

        set_state_label(&mut atp, STATE_WAITING);
        assert!(resume_interrupted_requeue(&mut atp, now));
        assert_eq!(atp.state(), None);
        assert_eq!(atp.spec.no_of_retry, 1);
        assert!(!resume_interrupted_requeue(&mut atp, now));

        let mut prq = PullRequestQueue::new("wordpress-7", PullRequestQueueSpec::default());
        set_state_label(&mut prq, STATE_WAITING);
        prq.status_mut().state = Some(PullRequestQueueState::EnvDestroying);
        prq.status_mut().created_at = Some("2024-03-01T09:00:00Z".into());
        assert!(resume_interrupted_requeue(&mut prq, now));
        assert_eq!(prq.state(), Some(PullRequestQueueState::Waiting));
        assert_eq!(prq.status.unwrap().created_at.as_deref(), Some("2024-03-01T09:00:00Z"));
    }

    #[tokio::test]
    async fn test_pull_request_admission_copies_upcoming_fields() {
        let clock = clock();
        let store = MemoryStore::<PullRequestQueue>::new(clock.clone());
        let mut prq = PullRequestQueue::new(
            "wordpress-7",
            PullRequestQueueSpec {
                commit_sha: "old".into(),
                upcoming_commit_sha: "new".into(),
                upcoming_components: vec![QueueComponent::new("wordpress", "repo/wp", "pr-7")],
                no_of_order: 1,
                ..Default::default()
            },
        );
        prq.metadata.namespace = Some("s2h-alpha".into());
        set_state_label(&mut prq, STATE_WAITING);
        let prq = store.create(&prq).await.unwrap();

        let result = admit(&store, Some("s2h-alpha"), 2, &prq, clock.now()).await.unwrap();
        assert!(result.is_current());
        let admitted = store.get(Some("s2h-alpha"), "wordpress-7").await.unwrap();
        assert_eq!(admitted.spec.commit_sha, "new");
        assert_eq!(admitted.spec.components.len(), 1);
        assert_eq!(admitted.state(), Some(PullRequestQueueState::EnvCreating));
        assert_eq!(count_running(&store, Some("s2h-alpha")).await, 1);
    }
}
