use crate::resources::postgresql::{Outcome, Provisioner, Requeue};
use crate::resources::status::Phase;
use crate::{Backoff, Diagnostics, Error, Metrics, Result, Settings};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::{Client as KubeClient, Resource, ResourceExt};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub kube_client: KubeClient,
    /// Event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// Settings
    pub settings: Arc<Settings>,
    /// Reconcilers
    pub provisioner: Provisioner,
    /// Retry delays of failing objects
    pub backoff: Arc<Backoff>,
}

fn backoff_key<K: Resource<DynamicType = ()>>(resource: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        resource.namespace().unwrap_or_default(),
        resource.name_any()
    )
}

impl Context {
    /// Turn an [`Outcome`] into what the controller expects. Failures that should be
    /// retried under backoff are returned as errors and end up in [`Context::retry`].
    pub async fn finish<K>(&self, resource: &K, outcome: Outcome) -> Result<Action>
    where
        K: Resource<DynamicType = ()>,
    {
        if let (true, Some(phase)) = (outcome.status_written, outcome.phase) {
            self.publish_phase(resource, phase, outcome.error.as_ref())
                .await;
        }

        let key = backoff_key(resource);
        match outcome.requeue {
            Requeue::Immediately => match outcome.error {
                Some(error) => Err(error),
                None => Ok(Action::requeue(self.backoff.next(&key))),
            },
            Requeue::After(delay) => {
                self.settled(resource, &key, outcome.error.as_ref());
                Ok(Action::requeue(delay))
            }
            Requeue::Never => {
                self.settled(resource, &key, outcome.error.as_ref());
                Ok(Action::requeue(self.settings.resync_interval()))
            }
        }
    }

    fn settled<K>(&self, resource: &K, key: &str, error: Option<&Error>)
    where
        K: Resource<DynamicType = ()>,
    {
        self.backoff.reset(key);
        if let Some(error) = error {
            warn!("reconcile failed: {error}");
            self.metrics.reconcile.set_failure(resource, error);
        }
    }

    pub fn retry<K>(&self, resource: &K, error: &Error) -> Action
    where
        K: Resource<DynamicType = ()>,
    {
        warn!("reconcile failed: {:?}", error);
        self.metrics.reconcile.set_failure(resource, error);
        Action::requeue(self.backoff.next(&backoff_key(resource)))
    }

    async fn publish_phase<K>(&self, resource: &K, phase: Phase, error: Option<&Error>)
    where
        K: Resource<DynamicType = ()>,
    {
        let (type_, note) = match (phase, error) {
            (Phase::Available, _) => (EventType::Normal, format!("{} is available", K::kind(&()))),
            (_, Some(error)) => (EventType::Warning, error.to_string()),
            (other, None) => (EventType::Warning, other.to_string()),
        };
        let event = Event {
            type_,
            reason: "PhaseChanged".into(),
            note: Some(note),
            action: phase.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &resource.object_ref(&())).await {
            warn!("failed to publish event: {e}");
        }
    }
}
