use crate::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{Api, client::Client as KubeClient};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::*;

/// A value given either inline or by reference to a key of a Secret or ConfigMap
/// in the namespace of the declaring resource.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceValue {
    /// Literal value. Takes precedence over `valueFrom`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Source to read the value from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueSource>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    /// Selects a key of a Secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
    /// Selects a key of a ConfigMap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct KeySelector {
    #[serde(default)]
    pub name: String,
    pub key: String,
}

impl ResourceValue {
    pub fn literal(value: impl Into<String>) -> Self {
        ResourceValue {
            value: value.into(),
            value_from: None,
        }
    }

    pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
        ResourceValue {
            value: String::new(),
            value_from: Some(ValueSource {
                secret_key_ref: Some(KeySelector {
                    name: name.into(),
                    key: key.into(),
                }),
                config_map_key_ref: None,
            }),
        }
    }

    pub fn config_map(name: impl Into<String>, key: impl Into<String>) -> Self {
        ResourceValue {
            value: String::new(),
            value_from: Some(ValueSource {
                secret_key_ref: None,
                config_map_key_ref: Some(KeySelector {
                    name: name.into(),
                    key: key.into(),
                }),
            }),
        }
    }

    /// The reference that would be followed, if any.
    fn reference(&self) -> Option<(SourceKind, &KeySelector)> {
        let source = self.value_from.as_ref()?;
        if let Some(selector) = source.secret_key_ref.as_ref().filter(|s| !s.key.is_empty()) {
            return Some((SourceKind::Secret, selector));
        }
        source
            .config_map_key_ref
            .as_ref()
            .filter(|s| !s.key.is_empty())
            .map(|selector| (SourceKind::ConfigMap, selector))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Secret,
    ConfigMap,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Secret => f.write_str("secret"),
            SourceKind::ConfigMap => f.write_str("config map"),
        }
    }
}

/// Read access to Secrets and ConfigMaps. `Ok(None)` means the object does not exist.
#[async_trait]
pub trait KeyValueSource: Send + Sync {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;
}

pub struct KubeValueSource {
    client: KubeClient,
}

impl KubeValueSource {
    pub fn new(client: KubeClient) -> Self {
        KubeValueSource { client }
    }
}

#[async_trait]
impl KeyValueSource for KubeValueSource {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get_opt(name).await.map_err(Error::KubeError)?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.0))
                .collect()
        }))
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let config_map = config_maps.get_opt(name).await.map_err(Error::KubeError)?;
        Ok(config_map.map(|c| c.data.unwrap_or_default()))
    }
}

/// Turns a [`ResourceValue`] into the string it stands for.
#[derive(Clone)]
pub struct ValueResolver {
    source: Arc<dyn KeyValueSource>,
}

impl ValueResolver {
    pub fn new(source: Arc<dyn KeyValueSource>) -> Self {
        ValueResolver { source }
    }

    /// Resolve `value` within `namespace`.
    ///
    /// A missing object or key is retryable since it can be created out of band.
    /// A value with neither a literal nor a usable reference is [`Error::NoValue`].
    pub async fn resolve(&self, value: &ResourceValue, namespace: &str) -> Result<String> {
        if !value.value.is_empty() {
            return Ok(value.value.clone());
        }

        let Some((kind, selector)) = value.reference() else {
            return Err(Error::NoValue);
        };
        debug!(%kind, name = %selector.name, key = %selector.key, "Resolving reference");

        let not_found = || Error::ValueNotFound {
            kind,
            namespace: namespace.to_string(),
            name: selector.name.clone(),
        };
        let unknown_key = || Error::UnknownKey {
            kind,
            namespace: namespace.to_string(),
            name: selector.name.clone(),
            key: selector.key.clone(),
        };

        match kind {
            SourceKind::Secret => {
                let mut data = self
                    .source
                    .secret_data(namespace, &selector.name)
                    .await
                    .map_err(Error::temporary)?
                    .ok_or_else(not_found)?;
                let bytes = data.remove(&selector.key).ok_or_else(unknown_key)?;
                String::from_utf8(bytes).map_err(|_| Error::NonUtf8Value {
                    kind,
                    namespace: namespace.to_string(),
                    name: selector.name.clone(),
                    key: selector.key.clone(),
                })
            }
            SourceKind::ConfigMap => {
                let mut data = self
                    .source
                    .config_map_data(namespace, &selector.name)
                    .await
                    .map_err(Error::temporary)?
                    .ok_or_else(not_found)?;
                data.remove(&selector.key).ok_or_else(unknown_key)
            }
        }
    }
}
