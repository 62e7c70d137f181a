use crate::resources::store::ResourceStore;
use crate::{Error, ErrorClass, Result};
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::*;

/// Coarse outcome of the last reconcile.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Not reconciled yet.
    #[default]
    Pending,
    /// Reconciled and available.
    Available,
    /// The declaration is invalid and has to be fixed.
    Invalid,
    /// Reconciling failed and will be retried.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Phase::Pending => "Pending",
            Phase::Available => "Available",
            Phase::Invalid => "Invalid",
            Phase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Status subresource shared by HostCredential, Database and User
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_updated: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A declaration carrying a [`ResourceStatus`].
pub trait StatusResource {
    fn status(&self) -> Option<&ResourceStatus>;
    fn set_status(&mut self, status: ResourceStatus);
}

static READY: &str = "Ready";

impl ResourceStatus {
    /// Status after moving to `phase` with `error`, keeping timestamps that did not change.
    fn transition(&self, phase: Phase, error: String) -> ResourceStatus {
        let now = Utc::now().to_rfc3339();
        let phase_updated = if self.phase != phase || self.phase_updated.is_none() {
            Some(now.clone())
        } else {
            self.phase_updated.clone()
        };

        let ready = if phase == Phase::Available { "True" } else { "False" };
        let previous = self.conditions.iter().find(|c| c.type_ == READY);
        let last_transition_time = match previous {
            Some(c) if c.status == ready => c.last_transition_time.clone(),
            _ => Some(now),
        };
        let mut conditions: Vec<Condition> = self
            .conditions
            .iter()
            .filter(|c| c.type_ != READY)
            .cloned()
            .collect();
        conditions.push(Condition {
            type_: READY.to_string(),
            status: ready.to_string(),
            reason: Some(phase.to_string()),
            message: (!error.is_empty()).then(|| error.clone()),
            last_transition_time,
        });

        ResourceStatus {
            phase,
            phase_updated,
            error,
            conditions,
        }
    }
}

/// Phase and error text for the outcome of a reconcile pass.
pub fn derive(result: &Result<()>) -> (Phase, String) {
    match result {
        Ok(()) => (Phase::Available, String::new()),
        Err(err) => match err.class() {
            ErrorClass::Temporary => (Phase::Failed, err.to_string()),
            ErrorClass::Invalid | ErrorClass::Unclassified => (Phase::Invalid, err.to_string()),
        },
    }
}

/// Whether the scheduler should be asked to retry, judged from the phase alone.
pub fn is_requeue(phase: Phase) -> bool {
    phase == Phase::Failed
}

/// Writes derived phases back to the store.
pub struct StatusManager<'a, K> {
    store: &'a dyn ResourceStore<K>,
}

impl<'a, K> StatusManager<'a, K>
where
    K: StatusResource + Send + Sync,
{
    pub fn new(store: &'a dyn ResourceStore<K>) -> Self {
        StatusManager { store }
    }

    /// Record `result` on `resource`. The store is only written when phase or error
    /// text differ from what is stored. Returns the phase and whether it was written.
    pub async fn persist(&self, resource: &mut K, result: &Result<()>) -> Result<(Phase, bool)> {
        let (phase, error) = derive(result);
        let current = resource.status().cloned().unwrap_or_default();

        if current.phase == phase && current.error == error {
            debug!(%phase, "Skipping status update, phase and error unchanged");
            return Ok((phase, false));
        }

        let next = current.transition(phase, error);
        resource.set_status(next);
        self.store
            .update_status(resource)
            .await
            .map_err(Error::temporary)?;
        info!(from = %current.phase, to = %phase, "Phase changed");
        Ok((phase, true))
    }
}
