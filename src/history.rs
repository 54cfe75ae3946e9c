/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/history.rs
*
* Archival of finished promotions and pull request queues.
*
* A history record is an immutable deep copy of the object's spec and status
* at the time its result was collected. Records are named after the team (or
* bundle and PR) plus a `YYYYMMDD-HHMMSS` stamp and labelled with the team so
* they can be listed for pruning.
*
* Pruning comes in two shapes:
* - by count (promotions): newest first, keep `max - 1` so the record about to
*   be archived still fits within `max`;
* - by age (pull requests): oldest first, delete until a record is young
*   enough.
* A record deleted by someone else in the meantime counts as deleted.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{
    creation_time, format_time, ActivePromotion, ActivePromotionHistory, ActivePromotionHistorySpec,
    ActivePromotionSnapshot, PromotionResult, PullRequestQueue, PullRequestQueueHistory,
    PullRequestQueueHistorySpec, PullRequestQueueResult, PullRequestQueueSnapshot, TEAM_LABEL,
};
use crate::errors::{Error, ResultExt};
use crate::store::{ignore_not_found, label, Store, StoredObject};
use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use std::time::Duration;
use tracing::{debug, info};

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

pub fn history_name(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, now.format(STAMP_FORMAT))
}

/// Creates `record`, treating an existing record of the same name as
/// success. Returns the record's name.
async fn create_tolerant<K: StoredObject>(store: &dyn Store<K>, record: &K) -> Result<String, Error> {
    let name = record.name_any();
    match store.create(record).await {
        Ok(_) => {
            info!(history = %name, "History archived.");
            Ok(name)
        }
        Err(e) if e.is_already_exists() => {
            debug!(history = %name, "History already archived.");
            Ok(name)
        }
        Err(e) => Err(e).context(|| format!("archiving history '{}'", name)),
    }
}

/// Newest records first; name breaks ties so the order is stable.
fn sort_newest_first<K: StoredObject>(records: &mut [K]) {
    records.sort_by(|a, b| {
        creation_time(b)
            .cmp(&creation_time(a))
            .then_with(|| b.name_any().cmp(&a.name_any()))
    });
}

async fn delete_all<K: StoredObject>(store: &dyn Store<K>, records: &[K]) -> Result<usize, Error> {
    let mut deleted = 0;
    for record in records {
        let name = record.name_any();
        ignore_not_found(store.delete(record.namespace().as_deref(), &name).await)
            .context(|| format!("pruning history '{}'", name))?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Keeps the `keep` newest records of `team` in `namespace` and deletes the rest.
pub async fn prune_by_count<K: StoredObject>(
    store: &dyn Store<K>,
    namespace: Option<&str>,
    team: &str,
    keep: usize,
) -> Result<usize, Error> {
    let mut records = store.list(namespace, &label(TEAM_LABEL, team)).await?;
    sort_newest_first(&mut records);
    if records.len() <= keep {
        return Ok(0);
    }
    let deleted = delete_all(store, &records[keep..]).await?;
    debug!(team, deleted, "Pruned histories by count.");
    Ok(deleted)
}

/// Deletes records of `team` in `namespace` older than `max_age`.
pub async fn prune_by_age<K: StoredObject>(
    store: &dyn Store<K>,
    namespace: Option<&str>,
    team: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<usize, Error> {
    let Ok(max_age) = chrono::Duration::from_std(max_age) else {
        return Ok(0);
    };
    let mut records = store.list(namespace, &label(TEAM_LABEL, team)).await?;
    sort_newest_first(&mut records);
    records.reverse();
    let expired = records
        .iter()
        .take_while(|r| creation_time(*r).is_some_and(|t| now.signed_duration_since(t) > max_age))
        .count();
    let deleted = delete_all(store, &records[..expired]).await?;
    if deleted > 0 {
        debug!(team, deleted, "Pruned histories by age.");
    }
    Ok(deleted)
}

// --- Active promotions ---

fn promotion_snapshot(atp: &ActivePromotion) -> ActivePromotionSnapshot {
    ActivePromotionSnapshot {
        spec: atp.spec.clone(),
        status: atp.status.clone().unwrap_or_default(),
    }
}

/// Prunes the team's promotion histories down to `max_histories - 1`, then
/// archives `atp`. Returns the new record's name.
pub async fn archive_active_promotion(
    store: &dyn Store<ActivePromotionHistory>,
    atp: &ActivePromotion,
    max_histories: u32,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let team = atp.name_any();
    let keep = (max_histories as usize).saturating_sub(1);
    prune_by_count(store, None, &team, keep).await?;

    let record = ActivePromotionHistory {
        metadata: ObjectMeta {
            name: Some(history_name(&team, now)),
            labels: Some(label(TEAM_LABEL, &team)),
            ..Default::default()
        },
        spec: ActivePromotionHistorySpec {
            team_name: team.clone(),
            active_promotion: promotion_snapshot(atp),
            is_success: atp.result() == PromotionResult::Success,
            created_at: Some(format_time(now)),
        },
    };
    create_tolerant(store, &record).await
}

/// Rewrites the snapshot held by an existing record.
pub async fn refresh_active_promotion_history(
    store: &dyn Store<ActivePromotionHistory>,
    name: &str,
    atp: &ActivePromotion,
) -> Result<(), Error> {
    let Some(mut record) = store.find(None, name).await? else {
        return Ok(());
    };
    let snapshot = promotion_snapshot(atp);
    if record.spec.active_promotion == snapshot {
        return Ok(());
    }
    record.spec.is_success = atp.result() == PromotionResult::Success;
    record.spec.active_promotion = snapshot;
    match store.update(&record).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map(|_| ()).context(|| format!("refreshing history '{}'", name)),
    }
}

// --- Pull request queues ---

fn pull_request_snapshot(prq: &PullRequestQueue) -> PullRequestQueueSnapshot {
    PullRequestQueueSnapshot {
        spec: prq.spec.clone(),
        status: prq.status.clone().unwrap_or_default(),
    }
}

/// Prunes histories older than `max_history_days`, then archives `prq` next
/// to it. Returns the new record's name.
pub async fn archive_pull_request_queue(
    store: &dyn Store<PullRequestQueueHistory>,
    prq: &PullRequestQueue,
    max_history_days: u32,
    now: DateTime<Utc>,
) -> Result<String, Error> {
    let namespace = prq.namespace().ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let team = &prq.spec.team_name;
    let max_age = Duration::from_secs(u64::from(max_history_days) * 24 * 60 * 60);
    prune_by_age(store, Some(&namespace), team, max_age, now).await?;

    let record = PullRequestQueueHistory {
        metadata: ObjectMeta {
            name: Some(history_name(&prq.name_any(), now)),
            namespace: Some(namespace),
            labels: Some(label(TEAM_LABEL, team)),
            ..Default::default()
        },
        spec: PullRequestQueueHistorySpec {
            team_name: team.clone(),
            pull_request_queue: pull_request_snapshot(prq),
            is_success: prq.result() == PullRequestQueueResult::Success,
            created_at: Some(format_time(now)),
        },
    };
    create_tolerant(store, &record).await
}

pub async fn refresh_pull_request_queue_history(
    store: &dyn Store<PullRequestQueueHistory>,
    name: &str,
    prq: &PullRequestQueue,
) -> Result<(), Error> {
    let Some(mut record) = store.find(prq.namespace().as_deref(), name).await? else {
        return Ok(());
    };
    let snapshot = pull_request_snapshot(prq);
    if record.spec.pull_request_queue == snapshot {
        return Ok(());
    }
    record.spec.is_success = prq.result() == PullRequestQueueResult::Success;
    record.spec.pull_request_queue = snapshot;
    match store.update(&record).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other.map(|_| ()).context(|| format!("refreshing history '{}'", name)),
    }
}
