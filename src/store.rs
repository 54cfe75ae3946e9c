/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/store.rs
*
* Typed object store used by every reconciler.
*
* Architecture:
* - `Store<K>` is the narrow persistence contract: get, list by label
*   selector, create, update with optimistic concurrency, and delete with
*   finalizer-based two-phase removal.
* - `KubeStore` implements it against the Kubernetes API server.
* - `MemoryStore` implements the same semantics in process. It enforces
*   `resourceVersion` preconditions and finalizers exactly like the API server
*   so the state machines can be exercised without a cluster.
*
* Callers never retry a conflicting write themselves: a `Conflict` aborts the
* reconcile pass, which is then re-run from a fresh read.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod kube_store;
pub mod memory;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

use crate::crds::{
    ActivePromotion, ActivePromotionHistory, Config, PullRequestQueue, PullRequestQueueHistory,
    PullRequestTrigger, Queue, StableComponent, Team,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("{kind} '{name}' was modified concurrently")]
    Conflict { kind: String, name: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store failure: {0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Treats a missing object as already handled.
pub fn ignore_not_found<T: Default>(result: Result<T, StoreError>) -> Result<T, StoreError> {
    match result {
        Err(e) if e.is_not_found() => Ok(T::default()),
        other => other,
    }
}

/// Kinds the stores can hold.
pub trait StoredObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Serialized status for kinds written through the status subresource.
    fn status_value(&self) -> Option<serde_json::Value> {
        None
    }

    /// Replaces the status with the one of `stored`.
    fn keep_status_of(&mut self, _stored: &Self) {}
}

macro_rules! stored_with_status {
    ($($kind:ty),* $(,)?) => {
        $(
            impl StoredObject for $kind {
                fn status_value(&self) -> Option<serde_json::Value> {
                    self.status.as_ref().and_then(|s| serde_json::to_value(s).ok())
                }

                fn keep_status_of(&mut self, stored: &Self) {
                    self.status = stored.status.clone();
                }
            }
        )*
    };
}

stored_with_status!(ActivePromotion, PullRequestQueue, PullRequestTrigger, Queue, Team, Config);

impl StoredObject for ActivePromotionHistory {}
impl StoredObject for PullRequestQueueHistory {}
impl StoredObject for StableComponent {}
impl StoredObject for Namespace {}

#[async_trait]
pub trait Store<K: StoredObject>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError>;

    /// Lists objects in `namespace` (all namespaces when `None`) whose labels
    /// contain every entry of `labels`.
    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError>;

    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Writes metadata, spec and status. Fails with `Conflict` when the stored
    /// `resourceVersion` differs from the one carried by `obj`.
    ///
    /// Not atomic for kinds with a status subresource: metadata and spec can
    /// land while the status write fails. Controllers recover from that on
    /// their next pass (see `admission::resume_interrupted_requeue`).
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Requests deletion. Objects with finalizers only get their deletion
    /// timestamp set; they disappear once an update clears the finalizers.
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;

    async fn find(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub fn kind_of<K: StoredObject>() -> String {
    K::kind(&()).to_string()
}

/// Single-entry label selector.
pub fn label(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}

pub fn has_labels<K: Resource>(obj: &K, selector: &BTreeMap<String, String>) -> bool {
    let labels = obj.meta().labels.as_ref();
    selector
        .iter()
        .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}
