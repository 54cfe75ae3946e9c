/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/errors.rs
*
* The error taxonomy shared by every reconciler.
*
* Errors fall into four groups:
* - Retryable: a precondition is not met yet (a queue still deploying, a
*   namespace still terminating). The reconciler requeues after a short delay
*   without treating the pass as failed.
* - Timeout: raised only after the compensating state change has been
*   persisted, so the next pass picks up the new state immediately.
* - `ReleaseFailed`: a queue finished but its deployment failed. State
*   machines branch on it instead of retrying.
* - Everything else is unexpected and goes to the controller's error policy.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::QueueType;
use crate::deploy_engine::EngineError;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

pub const RETRYABLE_REQUEUE: Duration = Duration::from_secs(2);
pub const TIMEOUT_REQUEUE: Duration = Duration::from_secs(1);
pub const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum Error {
    #[error("components have not been deployed yet")]
    EnsureComponentDeployed,

    #[error("components have not been tested yet")]
    EnsureComponentTested,

    #[error("active environment has not been demoted yet")]
    EnsureActiveDemoted,

    #[error("active environment has not been promoted yet")]
    EnsureActivePromoted,

    #[error("namespace '{0}' has not been destroyed yet")]
    EnsureNamespaceDestroyed(String),

    #[error("releases in namespace '{0}' are still being deleted")]
    DeletingReleases(String),

    #[error("configuration of team '{0}' is not loaded yet")]
    LoadingConfiguration(String),

    #[error("namespace '{0}' is still being created")]
    TeamNamespaceStillCreating(String),

    #[error("namespace '{0}' still exists")]
    TeamNamespaceStillExists(String),

    #[error("pull request queue '{0}' is finishing")]
    PullRequestQueueFinishing(String),

    #[error("active promotion timeout")]
    ActivePromotionTimeout,

    #[error("active demotion timeout")]
    ActiveDemotionTimeout,

    #[error("rollback active promotion timeout")]
    RollbackActivePromotionTimeout,

    #[error("release failed: {queue} queue in namespace '{namespace}'")]
    ReleaseFailed { queue: QueueType, namespace: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Deploy engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Image checker error: {0}")]
    ImageChecker(String),

    #[error("Test runner error: {0}")]
    TestRunner(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid duration format: {0}")]
    InvalidDuration(String),

    #[error("Object is missing {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// The innermost error, looking through added context.
    pub fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            Error::EnsureComponentDeployed
                | Error::EnsureComponentTested
                | Error::EnsureActiveDemoted
                | Error::EnsureActivePromoted
                | Error::EnsureNamespaceDestroyed(_)
                | Error::DeletingReleases(_)
                | Error::LoadingConfiguration(_)
                | Error::TeamNamespaceStillCreating(_)
                | Error::TeamNamespaceStillExists(_)
                | Error::PullRequestQueueFinishing(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Error::ActivePromotionTimeout
                | Error::ActiveDemotionTimeout
                | Error::RollbackActivePromotionTimeout
        )
    }

    pub fn is_release_failed(&self) -> bool {
        matches!(self.root(), Error::ReleaseFailed { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::Store(e) if e.is_not_found())
    }

    /// Delay before the next pass for expected, non-failure outcomes.
    pub fn requeue_after(&self) -> Option<Duration> {
        if self.is_retryable() {
            return Some(RETRYABLE_REQUEUE);
        }
        if self.is_timeout() {
            return Some(TIMEOUT_REQUEUE);
        }
        match self.root() {
            Error::Store(e) if e.is_conflict() => Some(CONFLICT_REQUEUE),
            _ => None,
        }
    }

    /// Short reason for metric labels.
    pub fn metric_label(&self) -> &'static str {
        match self.root() {
            Error::Store(_) => "store",
            Error::Engine(_) => "engine",
            Error::Config(_) | Error::LoadingConfiguration(_) => "config",
            Error::Join(_) => "join",
            Error::Serialization(_) => "serialization",
            e if e.is_timeout() => "timeout",
            e if e.is_retryable() => "retryable",
            _ => "other",
        }
    }
}

/// Attaches the object being worked on to an error.
pub trait ResultExt<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, Error>;
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T, Error> {
        self.map_err(|e| Error::Context {
            context: context(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_looks_through_context() {
        let err: Result<(), Error> = Err(Error::EnsureActivePromoted);
        let wrapped = err.context(|| "team alpha".to_string()).unwrap_err();
        assert!(wrapped.is_retryable());
        assert_eq!(wrapped.requeue_after(), Some(RETRYABLE_REQUEUE));
        assert!(wrapped.to_string().starts_with("team alpha: "));
    }

    #[test]
    fn test_conflicts_requeue_quickly_and_others_do_not() {
        let conflict = Error::Store(StoreError::Conflict {
            kind: "ActivePromotion".into(),
            name: "alpha".into(),
        });
        assert_eq!(conflict.requeue_after(), Some(CONFLICT_REQUEUE));
        assert_eq!(Error::ActiveDemotionTimeout.requeue_after(), Some(TIMEOUT_REQUEUE));
        assert_eq!(Error::Config("bad".into()).requeue_after(), None);
    }
}
