/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/store/kube_store.rs
*
* `Store` backed by the Kubernetes API server.
*
* Spec and metadata are written with `replace`, which carries the object's
* `resourceVersion` and therefore fails with 409 on concurrent modification.
* Status is written through the status subresource with a server-side apply
* patch that pins the `resourceVersion` returned by the replace, so the two
* halves of an update cannot interleave with another writer unnoticed.
*
* The two requests are not one transaction. When the status patch fails, the
* replaced metadata and spec stay written. Status-only steps lose nothing in
* that case; the steps that also move labels or spec (admission, retry and
* restart) are resumed from the label by the admission helpers.
*
* SPDX-License-Identifier: Apache-2.0
*/

use super::{kind_of, Store, StoreError, StoredObject};
use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client, Error as KubeError, Resource, ResourceExt,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use tracing::debug;

const FIELD_MANAGER: &str = "samsahai-operator";

pub struct KubeStore<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
    _kind: PhantomData<fn() -> K>,
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    Api::all(client)
}

impl<K> KubeStore<K>
where
    K: StoredObject + Resource<Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: namespaced_api::<K>,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: StoredObject + Resource<Scope = ClusterResourceScope>,
{
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: cluster_api::<K>,
            _kind: PhantomData,
        }
    }
}

impl<K: StoredObject> KubeStore<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    async fn patch_status(&self, obj: &K, name: &str, status: serde_json::Value) -> Result<K, StoreError> {
        let patch = Patch::Apply(json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "metadata": {
                "name": name,
                "resourceVersion": obj.resource_version(),
            },
            "status": status,
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        self.api(obj.namespace().as_deref())
            .patch_status(name, &ps, &patch)
            .await
            .map_err(|e| map_kube_error::<K>(e, name))
    }
}

fn object_name<K: StoredObject>(obj: &K) -> Result<String, StoreError> {
    obj.meta()
        .name
        .clone()
        .ok_or_else(|| StoreError::Other(format!("{} without a name", kind_of::<K>())))
}

fn map_kube_error<K: StoredObject>(e: KubeError, name: &str) -> StoreError {
    match e {
        KubeError::Api(ae) if ae.code == 404 => StoreError::NotFound {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        KubeError::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            StoreError::AlreadyExists {
                kind: kind_of::<K>(),
                name: name.to_string(),
            }
        }
        KubeError::Api(ae) if ae.code == 409 => StoreError::Conflict {
            kind: kind_of::<K>(),
            name: name.to_string(),
        },
        other => StoreError::Kube(other),
    }
}

fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl<K: StoredObject> Store<K> for KubeStore<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, StoreError> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| map_kube_error::<K>(e, name))
    }

    async fn list(
        &self,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, StoreError> {
        let lp = ListParams::default().labels(&selector_string(labels));
        let list = self.api(namespace).list(&lp).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let name = object_name(obj)?;
        let created = self
            .api(obj.namespace().as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error::<K>(e, &name))?;
        debug!(kind = %kind_of::<K>(), %name, "Created object.");

        // Status is dropped on create for kinds with a status subresource.
        match obj.status_value() {
            Some(status) => self.patch_status(&created, &name, status).await,
            None => Ok(created),
        }
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let name = object_name(obj)?;
        let replaced = self
            .api(obj.namespace().as_deref())
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error::<K>(e, &name))?;

        let Some(status) = obj.status_value() else {
            return Ok(replaced);
        };
        match self.patch_status(&replaced, &name, status).await {
            // Clearing the last finalizer of a deleting object removes it.
            Err(e) if e.is_not_found() && replaced.finalizers().is_empty() => Ok(replaced),
            other => other,
        }
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error::<K>(e, name))?;
        debug!(kind = %kind_of::<K>(), %name, "Requested deletion.");
        Ok(())
    }
}
