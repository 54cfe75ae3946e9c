/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/controllers/utils.rs
*
* This file contains common utility functions shared across the controllers.
* Consolidating reusable logic here keeps the individual controller files
* focused on their state machines.
*
* Functions:
* - `reconcile_span`: a span for one reconcile pass, parented to the trace
*   context carried in the object's annotations.
* - `into_action`: turns expected "not ready yet" errors into a requeue.
* - `on_error`: the shared body of every controller's error policy.
* - finalizer helpers.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::errors::Error;
use crate::metrics;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info_span, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Requeue after a step that moved the object forward.
pub const STEP_REQUEUE: Duration = Duration::from_secs(1);
/// Requeue while an object waits for admission.
pub const WAITING_REQUEUE: Duration = Duration::from_secs(2);
/// Requeue after the error policy.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(15);

// Helper struct to extract trace context from Kubernetes annotations.
struct AnnotationExtractor<'a>(&'a BTreeMap<String, String>);

impl<'a> Extractor for AnnotationExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

pub fn reconcile_span<K: Resource>(name: &'static str, obj: &K) -> Span {
    let propagator = TraceContextPropagator::new();
    let parent_context = propagator.extract(&AnnotationExtractor(obj.annotations()));
    let span = info_span!(
        "reconcile",
        "samsahai.kind" = name,
        "samsahai.name" = obj.name_any().as_str(),
        "samsahai.namespace" = obj.namespace().unwrap_or_default().as_str(),
    );
    span.set_parent(parent_context);
    span
}

/// Expected, non-failure errors become a requeue; the rest go to the error
/// policy.
pub fn into_action(result: Result<Action, Error>) -> Result<Action, Error> {
    match result {
        Err(e) => match e.requeue_after() {
            Some(after) => {
                debug!(reason = %e, "Not ready yet; requeueing.");
                Ok(Action::requeue(after))
            }
            None => Err(e),
        },
        ok => ok,
    }
}

pub fn on_error<K: Resource>(controller: &'static str, obj: &K, error: &Error) -> Action {
    error!(
        controller,
        name = %obj.name_any(),
        namespace = ?obj.namespace(),
        error = %error,
        "Reconciliation failed."
    );
    metrics::RECONCILE_ERRORS_TOTAL
        .with_label_values(&[controller, error.metric_label()])
        .inc();
    Action::requeue(ERROR_REQUEUE)
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

pub fn add_finalizer<K: Resource>(obj: &mut K, finalizer: &str) {
    if !has_finalizer(obj, finalizer) {
        obj.finalizers_mut().push(finalizer.to_string());
    }
}

pub fn remove_finalizer<K: Resource>(obj: &mut K, finalizer: &str) {
    obj.finalizers_mut().retain(|f| f != finalizer);
}

pub fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ActivePromotion, ActivePromotionSpec, ACTIVE_PROMOTION_FINALIZER};

    #[test]
    fn test_into_action_requeues_retryable_errors_only() {
        assert!(into_action(Err(Error::EnsureComponentDeployed)).is_ok());
        assert!(into_action(Err(Error::ActiveDemotionTimeout)).is_ok());
        assert!(into_action(Err(Error::Config("broken".into()))).is_err());
    }

    #[test]
    fn test_finalizer_helpers_are_idempotent() {
        let mut atp = ActivePromotion::new("alpha", ActivePromotionSpec::default());
        add_finalizer(&mut atp, ACTIVE_PROMOTION_FINALIZER);
        add_finalizer(&mut atp, ACTIVE_PROMOTION_FINALIZER);
        assert_eq!(atp.finalizers().len(), 1);
        remove_finalizer(&mut atp, ACTIVE_PROMOTION_FINALIZER);
        assert!(!has_finalizer(&atp, ACTIVE_PROMOTION_FINALIZER));
    }
}
