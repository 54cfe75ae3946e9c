/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/store/memory.rs
*
* In-process `Store` with the same semantics as the API server: monotonically
* increasing `resourceVersion` checked on every update, creation and deletion
* timestamps taken from the injected clock, and finalizer-based two-phase
* deletion. It keeps no history and is not shared across processes.
*
* `interrupt_next_update` reproduces the one partial write the API server can
* produce: the main object is replaced but the status subresource write after
* it fails.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{has_labels, kind_of, Store, StoreError, StoredObject};
use crate::clock::Clock;
use crate::crds::to_k8s_time;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type Key = (String, String);

pub struct MemoryStore<K> {
    objects: RwLock<BTreeMap<Key, K>>,
    version: AtomicU64,
    interrupt_next: AtomicBool,
    clock: Arc<dyn Clock>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Other("memory store lock poisoned".to_string())
}

fn key(namespace: Option<&str>, name: &str) -> Key {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

impl<K: StoredObject> MemoryStore<K> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            interrupt_next: AtomicBool::new(false),
            clock,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn not_found(name: &str) -> StoreError {
        StoreError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        }
    }

    /// Makes the next `update` persist metadata and spec, keep the stored
    /// status and then fail.
    pub fn interrupt_next_update(&self) {
        self.interrupt_next.store(true, Ordering::SeqCst);
    }

    /// Number of stored objects, including ones pending deletion.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<K: StoredObject> Store<K> for MemoryStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError> {
        let objects = self.objects.read().map_err(poison_err)?;
        objects
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| ns.as_str() == wanted))
            .filter(|(_, obj)| has_labels(*obj, labels))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| StoreError::Other(format!("{} without a name", kind_of::<K>())))?;
        let k = key(obj.namespace().as_deref(), &name);

        let mut objects = self.objects.write().map_err(poison_err)?;
        if objects.contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                name,
            });
        }
        let mut stored = obj.clone();
        let meta = stored.meta_mut();
        meta.resource_version = Some(self.next_version());
        meta.creation_timestamp = to_k8s_time(self.clock.now());
        meta.deletion_timestamp = None;
        objects.insert(k, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj.name_any();
        let k = key(obj.namespace().as_deref(), &name);

        let mut objects = self.objects.write().map_err(poison_err)?;
        let current = objects.get(&k).ok_or_else(|| Self::not_found(&name))?;
        if current.resource_version() != obj.resource_version() {
            return Err(StoreError::Conflict {
                kind: kind_of::<K>(),
                name,
            });
        }

        let interrupted = self.interrupt_next.swap(false, Ordering::SeqCst);
        let mut stored = obj.clone();
        if interrupted {
            stored.keep_status_of(current);
        }
        let creation = current.meta().creation_timestamp.clone();
        let deletion = current.meta().deletion_timestamp.clone();
        let meta = stored.meta_mut();
        meta.creation_timestamp = creation;
        meta.deletion_timestamp = deletion;
        meta.resource_version = Some(self.next_version());

        if stored.meta().deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            objects.remove(&k);
        } else {
            objects.insert(k, stored.clone());
        }
        if interrupted {
            return Err(StoreError::Other(format!(
                "status write of {} '{}' was interrupted",
                kind_of::<K>(),
                name
            )));
        }
        Ok(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let k = key(namespace, name);
        let mut objects = self.objects.write().map_err(poison_err)?;
        let Some(current) = objects.get_mut(&k) else {
            return Err(Self::not_found(name));
        };
        if current.finalizers().is_empty() {
            objects.remove(&k);
            return Ok(());
        }
        if current.meta().deletion_timestamp.is_none() {
            let now = to_k8s_time(self.clock.now());
            let version = self.next_version();
            let meta = current.meta_mut();
            meta.deletion_timestamp = now;
            meta.resource_version = Some(version);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crds::{ActivePromotion, ActivePromotionSpec, StableComponent, StableComponentSpec};
    use crate::store::label;

    fn store<K: StoredObject>() -> MemoryStore<K> {
        MemoryStore::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_update_with_stale_version_conflicts() {
        let store = store::<ActivePromotion>();
        let created = store
            .create(&ActivePromotion::new("alpha", ActivePromotionSpec::default()))
            .await
            .unwrap();

        let mut first = created.clone();
        first.spec.no_of_retry = 1;
        store.update(&first).await.unwrap();

        let mut stale = created;
        stale.spec.no_of_retry = 2;
        let err = store.update(&stale).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(None, "alpha").await.unwrap().spec.no_of_retry, 1);
    }

    #[tokio::test]
    async fn test_delete_with_finalizer_is_two_phase() {
        let store = store::<ActivePromotion>();
        let mut obj = ActivePromotion::new("alpha", ActivePromotionSpec::default());
        obj.metadata.finalizers = Some(vec!["samsahai.io/active-promotion".into()]);
        store.create(&obj).await.unwrap();

        store.delete(None, "alpha").await.unwrap();
        let mut marked = store.get(None, "alpha").await.unwrap();
        assert!(marked.metadata.deletion_timestamp.is_some());

        marked.metadata.finalizers = Some(vec![]);
        store.update(&marked).await.unwrap();
        assert!(store.get(None, "alpha").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_by_namespace_and_labels() {
        let store = store::<StableComponent>();
        for (ns, name, team) in [("s2h-a", "redis", "a"), ("s2h-a", "mariadb", "b"), ("s2h-b", "redis", "a")] {
            let mut obj = StableComponent::new(name, StableComponentSpec::default());
            obj.metadata.namespace = Some(ns.into());
            obj.metadata.labels = Some(label("samsahai.io/teamname", team));
            store.create(&obj).await.unwrap();
        }

        let found = store
            .list(Some("s2h-a"), &label("samsahai.io/teamname", "a"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name_any(), "redis");

        let everywhere = store.list(None, &BTreeMap::new()).await.unwrap();
        assert_eq!(everywhere.len(), 3);
    }

    #[tokio::test]
    async fn test_interrupted_update_keeps_the_stored_status() {
        let store = store::<ActivePromotion>();
        let mut atp = store
            .create(&ActivePromotion::new("alpha", ActivePromotionSpec::default()))
            .await
            .unwrap();
        atp.spec.no_of_retry = 1;
        atp.status_mut().message = "first".into();
        let atp = store.update(&atp).await.unwrap();

        let mut next = atp.clone();
        next.spec.no_of_retry = 2;
        next.status_mut().message = "second".into();
        store.interrupt_next_update();
        assert!(store.update(&next).await.is_err());

        let stored = store.get(None, "alpha").await.unwrap();
        assert_eq!(stored.spec.no_of_retry, 2);
        assert_eq!(stored.status.unwrap().message, "first");
        assert_ne!(stored.metadata.resource_version, atp.metadata.resource_version);

        let mut again = store.get(None, "alpha").await.unwrap();
        again.status_mut().message = "third".into();
        store.update(&again).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let store = store::<ActivePromotion>();
        let obj = ActivePromotion::new("alpha", ActivePromotionSpec::default());
        store.create(&obj).await.unwrap();
        assert!(store.create(&obj).await.unwrap_err().is_already_exists());
    }
}
