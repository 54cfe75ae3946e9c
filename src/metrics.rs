/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the custom Prometheus metrics that the
* samsahai-operator exposes. These metrics provide insights into the outcome
* of promotions and pull request environments and into reconcile failures.
*
* Using `lazy_static`, we ensure that the metrics are created only once and are
* available globally and safely across all concurrent reconciliation loops and
* web server threads.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Histogram, IntCounterVec, Registry,
};

// --- Metric Definitions ---

lazy_static! {
    /// Finished active promotions, labeled by result.
    pub static ref ACTIVE_PROMOTIONS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "samsahai_active_promotions_total",
            "Total number of finished active promotions.",
            &["result"]
        ).expect("metric samsahai_active_promotions_total can be registered");

    /// Finished pull request queues, labeled by result.
    pub static ref PULL_REQUEST_QUEUES_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "samsahai_pull_request_queues_total",
            "Total number of finished pull request queues.",
            &["result"]
        ).expect("metric samsahai_pull_request_queues_total can be registered");

    /// Finished deployment queues, labeled by queue type and result.
    pub static ref QUEUE_DEPLOYMENTS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "samsahai_queue_deployments_total",
            "Total number of finished deployment queues.",
            &["type", "result"]
        ).expect("metric samsahai_queue_deployments_total can be registered");

    /// Reconcile passes that reached the error policy.
    pub static ref RECONCILE_ERRORS_TOTAL: IntCounterVec =
        register_int_counter_vec!(
            "samsahai_reconcile_errors_total",
            "Total number of failed reconciliations.",
            &["controller", "reason"]
        ).expect("metric samsahai_reconcile_errors_total can be registered");

    /// Wall time from admission to the end of a promotion.
    /// Buckets in seconds: 1m, 5m, 10m, 20m, 30m, 1h, 2h
    pub static ref ACTIVE_PROMOTION_DURATION_SECONDS: Histogram =
        register_histogram!(
            "samsahai_active_promotion_duration_seconds",
            "Duration of active promotions from start to finish.",
            vec![60.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0]
        ).expect("metric samsahai_active_promotion_duration_seconds can be registered");
}

/// Creates a new Prometheus registry and registers all custom metrics.
///
/// This function is intended to be called once at operator startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(ACTIVE_PROMOTIONS_TOTAL.clone()))?;
    r.register(Box::new(PULL_REQUEST_QUEUES_TOTAL.clone()))?;
    r.register(Box::new(QUEUE_DEPLOYMENTS_TOTAL.clone()))?;
    r.register(Box::new(RECONCILE_ERRORS_TOTAL.clone()))?;
    r.register(Box::new(ACTIVE_PROMOTION_DURATION_SECONDS.clone()))?;
    Ok(r)
}
