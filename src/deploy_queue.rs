/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/deploy_queue.rs
*
* Helpers the state machines use to drive deployment `Queue` objects and the
* stable component snapshots they deploy.
*
* A namespace holds at most one queue per type, named after the type. The
* state machines never deploy anything themselves: they ensure the queue they
* need exists with the spec they want, then poll its status on later passes
* while the queue controller does the work.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{Queue, QueueComponent, QueueSpec, QueueStatus, QueueType, StableComponent, StableComponentSpec, TEAM_LABEL};
use crate::errors::{Error, ResultExt};
use crate::store::{ignore_not_found, label, Store};
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

pub fn queue_name(queue_type: QueueType) -> &'static str {
    queue_type.as_str()
}

/// Returns the queue of `spec.type_` in `namespace`, creating it, or
/// replacing it when it was created for a different spec.
pub async fn ensure_queue(store: &dyn Store<Queue>, namespace: &str, spec: QueueSpec) -> Result<Queue, Error> {
    let name = queue_name(spec.type_);
    if let Some(existing) = store.find(Some(namespace), name).await? {
        if existing.spec == spec {
            return Ok(existing);
        }
        info!(queue = name, namespace, "Queue spec changed; recreating.");
        ignore_not_found(store.delete(Some(namespace), name).await)?;
    }

    let queue = Queue {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(label(TEAM_LABEL, &spec.team_name)),
            ..Default::default()
        },
        spec,
        status: None,
    };
    match store.create(&queue).await {
        Ok(created) => {
            debug!(queue = name, namespace, "Queue created.");
            Ok(created)
        }
        // The replaced queue is still terminating.
        Err(e) if e.is_already_exists() => Err(Error::EnsureComponentDeployed),
        Err(e) => Err(e).context(|| format!("creating queue '{}/{}'", namespace, name)),
    }
}

pub async fn delete_queue(store: &dyn Store<Queue>, namespace: &str, queue_type: QueueType) -> Result<(), Error> {
    if namespace.is_empty() {
        return Ok(());
    }
    ignore_not_found(store.delete(Some(namespace), queue_name(queue_type)).await)
        .context(|| format!("deleting queue '{}/{}'", namespace, queue_type))
}

/// The queue's status once it has finished with a successful deployment.
///
/// A queue still in flight yields `not_ready()`; a finished queue whose
/// deployment failed yields `ReleaseFailed`.
pub fn finished_status(queue: &Queue, not_ready: impl FnOnce() -> Error) -> Result<QueueStatus, Error> {
    let status = queue.status_or_default();
    if !status.is_finished() {
        return Err(not_ready());
    }
    if !status.is_deploy_success() {
        return Err(Error::ReleaseFailed {
            queue: queue.spec.type_,
            namespace: queue.namespace().unwrap_or_default(),
        });
    }
    Ok(status)
}

/// Stable components of `namespace`, sorted by name.
pub async fn stable_components(
    store: &dyn Store<StableComponent>,
    namespace: &str,
) -> Result<Vec<QueueComponent>, Error> {
    let mut components: Vec<_> = store
        .list(Some(namespace), &Default::default())
        .await
        .context(|| format!("listing stable components in '{}'", namespace))?
        .iter()
        .filter(|s| s.meta().deletion_timestamp.is_none())
        .map(StableComponent::to_queue_component)
        .collect();
    components.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(components)
}

/// Creates or updates `component` as a stable component of `namespace`.
pub async fn upsert_stable_component(
    store: &dyn Store<StableComponent>,
    namespace: &str,
    component: &QueueComponent,
    updated_by: Option<&str>,
) -> Result<(), Error> {
    let spec = StableComponentSpec {
        name: component.name.clone(),
        repository: component.repository.clone(),
        version: component.version.clone(),
        updated_by: updated_by.map(String::from),
    };
    match store.find(Some(namespace), &component.name).await? {
        Some(existing) if existing.spec == spec => Ok(()),
        Some(mut existing) => {
            existing.spec = spec;
            store.update(&existing).await?;
            Ok(())
        }
        None => {
            let stable = StableComponent {
                metadata: ObjectMeta {
                    name: Some(component.name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec,
            };
            store.create(&stable).await?;
            Ok(())
        }
    }
}

/// Copies every stable component of `from` into `to`, by name.
pub async fn copy_stable_components(
    store: &dyn Store<StableComponent>,
    from: &str,
    to: &str,
) -> Result<usize, Error> {
    let components = stable_components(store, from).await?;
    for component in &components {
        upsert_stable_component(store, to, component, None)
            .await
            .context(|| format!("copying stable component '{}' into '{}'", component.name, to))?;
    }
    Ok(components.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crds::QueueState;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn spec(components: Vec<QueueComponent>) -> QueueSpec {
        QueueSpec {
            team_name: "alpha".into(),
            type_: QueueType::PreActive,
            components,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ensure_queue_is_idempotent_and_replaces_on_change() {
        let store = MemoryStore::<Queue>::new(Arc::new(SystemClock));
        let redis = QueueComponent::new("redis", "bitnami/redis", "5.0");

        let first = ensure_queue(&store, "s2h-alpha-x", spec(vec![redis.clone()])).await.unwrap();
        let again = ensure_queue(&store, "s2h-alpha-x", spec(vec![redis])).await.unwrap();
        assert_eq!(first.resource_version(), again.resource_version());
        assert_eq!(first.name_any(), "pre-active");

        let newer = QueueComponent::new("redis", "bitnami/redis", "6.0");
        let replaced = ensure_queue(&store, "s2h-alpha-x", spec(vec![newer.clone()])).await.unwrap();
        assert_eq!(replaced.spec.components, vec![newer]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_finished_status_classifies_queue() {
        let mut queue = Queue::new("pre-active", spec(vec![]));
        queue.metadata.namespace = Some("s2h-alpha-x".into());
        let not_ready = finished_status(&queue, || Error::EnsureComponentDeployed).unwrap_err();
        assert!(not_ready.is_retryable());

        let status = queue.status_mut();
        status.state = Some(QueueState::Finished);
        status.deploy_result = Some(false);
        assert!(finished_status(&queue, || Error::EnsureComponentDeployed)
            .unwrap_err()
            .is_release_failed());

        queue.status_mut().deploy_result = Some(true);
        assert!(finished_status(&queue, || Error::EnsureComponentDeployed).is_ok());
    }

    #[tokio::test]
    async fn test_copy_stable_components_creates_and_updates() {
        let store = MemoryStore::<StableComponent>::new(Arc::new(SystemClock));
        upsert_stable_component(&store, "s2h-alpha", &QueueComponent::new("redis", "bitnami/redis", "6.0"), None)
            .await
            .unwrap();
        upsert_stable_component(&store, "s2h-alpha", &QueueComponent::new("mariadb", "bitnami/mariadb", "10"), None)
            .await
            .unwrap();
        upsert_stable_component(&store, "s2h-alpha-x", &QueueComponent::new("redis", "bitnami/redis", "5.0"), None)
            .await
            .unwrap();

        assert_eq!(copy_stable_components(&store, "s2h-alpha", "s2h-alpha-x").await.unwrap(), 2);
        let copied = stable_components(&store, "s2h-alpha-x").await.unwrap();
        assert_eq!(
            copied,
            vec![
                QueueComponent::new("mariadb", "bitnami/mariadb", "10"),
                QueueComponent::new("redis", "bitnami/redis", "6.0"),
            ]
        );
    }
}
