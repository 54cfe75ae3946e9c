/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/ordering.rs
*
* Total orders used to pick the next queue to admit.
*
* - Promotions: oldest first by creation time, ties broken by name.
* - Pull request queues: ascending `noOfOrder`, ties broken by name.
*
* `reset_queue_order` renumbers pull request queues densely from 1 with the
* running ones first, so later additions always land at the back.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{creation_time, ActivePromotion, PullRequestQueue, STATE_LABEL, STATE_RUNNING};
use kube::ResourceExt;
use std::cmp::Ordering;

pub fn compare_promotions(a: &ActivePromotion, b: &ActivePromotion) -> Ordering {
    creation_time(a)
        .cmp(&creation_time(b))
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

pub fn compare_pull_request_queues(a: &PullRequestQueue, b: &PullRequestQueue) -> Ordering {
    a.spec
        .no_of_order
        .cmp(&b.spec.no_of_order)
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

pub fn is_running<K: ResourceExt>(obj: &K) -> bool {
    obj.labels().get(STATE_LABEL).map(String::as_str) == Some(STATE_RUNNING)
}

/// Sorts running queues first, then by `(noOfOrder, name)`, and renumbers
/// `noOfOrder` from 1. Returns the indices (after sorting) whose number
/// changed and therefore need to be written back.
pub fn reset_queue_order(queues: &mut [PullRequestQueue]) -> Vec<usize> {
    queues.sort_by(|a, b| {
        is_running(b)
            .cmp(&is_running(a))
            .then_with(|| compare_pull_request_queues(a, b))
    });
    let mut changed = Vec::new();
    for (i, queue) in queues.iter_mut().enumerate() {
        let order = i as i32 + 1;
        if queue.spec.no_of_order != order {
            queue.spec.no_of_order = order;
            changed.push(i);
        }
    }
    changed
}
