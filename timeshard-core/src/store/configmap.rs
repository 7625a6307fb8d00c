//! ConfigMap-backed configuration record
//!
//! The ConfigMap's `resourceVersion` is the concurrency token: `replace`
//! carries it and the API server rejects stale writes with 409 Conflict.

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ConfigStore, StoredDocument};
use crate::document::DOCUMENT_KEY;
use crate::error::{Result, TimeshardError};
use crate::runtime::ShutdownSignal;

/// One namespaced ConfigMap
#[derive(Clone)]
pub struct ConfigMapStore {
    api: Api<ConfigMap>,
    name: String,
    namespace: String,
}

impl ConfigMapStore {
    pub fn new(client: Client, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            namespace: namespace.to_string(),
        }
    }

    fn to_stored(config_map: &ConfigMap) -> Option<StoredDocument> {
        let version = config_map.metadata.resource_version.clone()?;
        let body = config_map
            .data
            .as_ref()
            .and_then(|data| data.get(DOCUMENT_KEY))
            .cloned()
            .unwrap_or_default();
        Some(StoredDocument { body, version })
    }

    fn map_error(&self, err: kube::Error, expected: Option<&str>) -> TimeshardError {
        match err {
            kube::Error::Api(response) if response.code == 409 => TimeshardError::WriteConflict {
                name: self.name.clone(),
                expected: expected.map(str::to_string),
                actual: None,
            },
            other => TimeshardError::transient(format!(
                "configmap {}/{}: {}",
                self.namespace, self.name, other
            )),
        }
    }

    fn build(&self, body: String, resource_version: Option<&str>) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: resource_version.map(str::to_string),
                ..ObjectMeta::default()
            },
            data: Some(BTreeMap::from([(DOCUMENT_KEY.to_string(), body)])),
            ..ConfigMap::default()
        }
    }

    /// Forward one watch event; deletions keep the last document
    fn publish(tx: &watch::Sender<Option<StoredDocument>>, name: &str, event: watcher::Event<ConfigMap>) {
        match event {
            watcher::Event::Apply(cm) | watcher::Event::InitApply(cm) => {
                let Some(stored) = Self::to_stored(&cm) else {
                    return;
                };
                let changed = tx.send_if_modified(|current| {
                    if current
                        .as_ref()
                        .is_some_and(|d: &StoredDocument| d.version == stored.version)
                    {
                        return false;
                    }
                    *current = Some(stored.clone());
                    true
                });
                if changed {
                    debug!("Configmap {} at version {}", name, stored.version);
                }
            }
            watcher::Event::Delete(_) => warn!("Configmap {} deleted", name),
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Follow the ConfigMap until shutdown
    ///
    /// Watch errors are retried with the watcher's default backoff.
    pub fn watch(&self, shutdown: ShutdownSignal) -> watch::Receiver<Option<StoredDocument>> {
        let (tx, rx) = watch::channel(None);
        let api = self.api.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
            let mut events = watcher(api, config).default_backoff().boxed();
            let mut stop = shutdown.subscribe();
            info!("Watching configmap {}", name);

            loop {
                let event = tokio::select! {
                    _ = stop.recv() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(Ok(event)) => Self::publish(&tx, &name, event),
                    Some(Err(e)) => warn!("Watch on {} failed: {}", name, e),
                    None => break,
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!("Stopped watching configmap {}", name);
        });
        rx
    }
}

#[async_trait]
impl ConfigStore for ConfigMapStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> Result<Option<StoredDocument>> {
        let found = self
            .api
            .get_opt(&self.name)
            .await
            .map_err(|e| self.map_error(e, None))?;
        Ok(found.as_ref().and_then(Self::to_stored))
    }

    async fn put_if_version(&self, body: String, expected: Option<&str>) -> Result<String> {
        let params = PostParams::default();
        let written = match expected {
            None => self
                .api
                .create(&params, &self.build(body, None))
                .await
                .map_err(|e| self.map_error(e, None))?,
            Some(version) => self
                .api
                .replace(&self.name, &params, &self.build(body, Some(version)))
                .await
                .map_err(|e| self.map_error(e, expected))?,
        };

        written.metadata.resource_version.ok_or_else(|| TimeshardError::Internal {
            message: format!("configmap {} returned without resourceVersion", self.name),
        })
    }
}
