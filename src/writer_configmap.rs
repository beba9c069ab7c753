//! ConfigMap output: one data key per discovery source inside a shared
//! Kubernetes ConfigMap.
//!
//! Several adapters may update the same object concurrently. Every write is
//! a full get → modify → update cycle carrying the observed resource
//! version, and a stale version comes back as [`WriteError::Conflict`],
//! which [`retry_on_conflict`] absorbs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::WriteError;
use crate::retry::{retry_on_conflict, Backoff};
use crate::writer::OutputWriter;

/// The parts of a ConfigMap the writer cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigObject {
    pub resource_version: Option<String>,
    pub data: BTreeMap<String, String>,
}

/// Minimal ConfigMap client surface.
#[async_trait]
pub trait ConfigMapApi: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, name: &str) -> Result<Option<ConfigObject>, WriteError>;

    /// Stores `object.data`, failing with a conflict when
    /// `object.resource_version` is no longer current.
    async fn update(&self, name: &str, object: &ConfigObject) -> Result<(), WriteError>;

    /// Creates the object. An already existing object is a conflict.
    async fn create(&self, name: &str, object: &ConfigObject) -> Result<(), WriteError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Kubernetes client
// ═══════════════════════════════════════════════════════════════════════

pub struct KubeConfigMaps {
    api: Api<ConfigMap>,
}

impl KubeConfigMaps {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    /// Connects with the in-cluster or kubeconfig credentials.
    pub async fn connect(namespace: &str) -> Result<Self, WriteError> {
        let client = Client::try_default().await.map_err(map_kube_error)?;
        Ok(Self::new(client, namespace))
    }
}

fn map_kube_error(e: kube::Error) -> WriteError {
    match e {
        kube::Error::Api(response) if response.code == 409 => WriteError::Conflict(response.message),
        kube::Error::Api(response) if response.code == 404 => WriteError::NotFound(response.message),
        other => WriteError::Api(other.to_string()),
    }
}

#[async_trait]
impl ConfigMapApi for KubeConfigMaps {
    async fn get(&self, name: &str) -> Result<Option<ConfigObject>, WriteError> {
        let found = self.api.get_opt(name).await.map_err(map_kube_error)?;
        Ok(found.map(|cm| ConfigObject {
            resource_version: cm.metadata.resource_version,
            data: cm.data.unwrap_or_default(),
        }))
    }

    async fn update(&self, name: &str, object: &ConfigObject) -> Result<(), WriteError> {
        // A merge patch leaves labels and unrelated keys alone; the resource
        // version makes the API server reject stale updates with 409.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": object.resource_version },
            "data": object.data,
        });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn create(&self, name: &str, object: &ConfigObject) -> Result<(), WriteError> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(object.data.clone()),
            ..Default::default()
        };
        self.api
            .create(&PostParams::default(), &cm)
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Writer
// ═══════════════════════════════════════════════════════════════════════

pub struct ConfigMapWriter {
    api: Arc<dyn ConfigMapApi>,
    name: String,
    backoff: Backoff,
}

impl ConfigMapWriter {
    pub fn new(api: Arc<dyn ConfigMapApi>, name: impl Into<String>) -> Self {
        Self {
            api,
            name: name.into(),
            backoff: Backoff::DEFAULT,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    async fn write_once(&self, key: &str, payload: &str) -> Result<(), WriteError> {
        match self.api.get(&self.name).await? {
            Some(mut object) => {
                if object.data.get(key).map(String::as_str) == Some(payload) {
                    return Ok(());
                }
                object.data.insert(key.to_string(), payload.to_string());
                self.api.update(&self.name, &object).await
            }
            None => {
                debug!(configmap = %self.name, "config object missing, creating it");
                let mut object = ConfigObject::default();
                object.data.insert(key.to_string(), payload.to_string());
                self.api.create(&self.name, &object).await
            }
        }
    }
}

#[async_trait]
impl OutputWriter for ConfigMapWriter {
    fn describe(&self) -> String {
        format!("configmap:{}", self.name)
    }

    async fn write(&self, key: &str, payload: &str) -> Result<(), WriteError> {
        retry_on_conflict(self.backoff, || self.write_once(key, payload)).await
    }

    async fn read(&self, key: &str) -> Result<String, WriteError> {
        let object = self.api.get(&self.name).await?;
        Ok(object
            .and_then(|mut o| o.data.remove(key))
            .unwrap_or_default())
    }
}
