use crate::resources::status::StatusResource;
use crate::{Error, Result};
use async_trait::async_trait;
use kube::{
    Resource,
    api::{Api, ListParams, Patch, PatchParams, PostParams, ResourceExt},
    client::Client as KubeClient,
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::json;
use std::fmt::Debug;

static FIELD_MANAGER: &str = "pg-provisioner";

/// Typed storage of declarations keyed by namespace and name.
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn list(&self, namespace: &str) -> Result<Vec<K>>;

    /// Replace the whole object, returning the stored version.
    async fn update(&self, resource: &K) -> Result<K>;

    /// Write the status subresource only.
    async fn update_status(&self, resource: &K) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: KubeClient,
}

impl KubeStore {
    pub fn new(client: KubeClient) -> Self {
        KubeStore { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn key<K: ResourceExt>(resource: &K) -> Result<(String, String)> {
    let namespace = resource.namespace().ok_or(Error::IllegalDocument)?;
    Ok((namespace, resource.name_any()))
}

#[async_trait]
impl<K> ResourceStore<K> for KubeStore
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + StatusResource
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::KubeError)?;
        Ok(list.items)
    }

    async fn update(&self, resource: &K) -> Result<K> {
        let (namespace, name) = key(resource)?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), resource)
            .await
            .map_err(Error::KubeError)
    }

    async fn update_status(&self, resource: &K) -> Result<()> {
        let (namespace, name) = key(resource)?;
        let new_status = Patch::Apply(json!({
            "apiVersion": K::api_version(&()),
            "kind": K::kind(&()),
            "status": resource.status(),
        }));
        let ps = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<K>(&namespace)
            .patch_status(&name, &ps, &new_status)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}
