use super::{ConnectionString, Outcome, Provisioner, Requeue, settle};
use crate::resources::status::{Phase, ResourceStatus, StatusResource, is_requeue};
use crate::resources::value::{ResourceValue, ValueResolver};
use crate::{Context, Error, Result, telemetry};
use chrono::Utc;
use futures::StreamExt;
use kube::{
    CustomResource,
    api::{Api, ListParams, ResourceExt},
    client::Client as KubeClient,
    runtime::{
        controller::{self, Action, Controller},
        watcher::Config,
    },
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::*;

/// Admin access to one Postgresql server
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "HostCredential",
    group = "postgresql.tjo.cloud",
    version = "v1",
    namespaced,
    shortname = "pghc",
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PhaseUpdated", "type":"date", "jsonPath":".status.phaseUpdated"}"#,
    printcolumn = r#"{"name":"Error", "type":"string", "jsonPath":".status.error"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HostCredentialSpec {
    /// `host` or `host:port` of the server.
    pub host: ResourceValue,
    /// Admin user. Manages the roles and databases on the server.
    pub user: ResourceValue,
    /// Password of the admin user.
    pub password: ResourceValue,
    /// Connection parameters, e.g. `sslmode=require`, separated by spaces or `&`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
}

impl StatusResource for HostCredential {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = Some(status);
    }
}

impl HostCredential {
    /// Resolve the admin credential into a connection to `database`.
    pub async fn connection_string(
        &self,
        resolver: &ValueResolver,
        database: &str,
    ) -> Result<ConnectionString> {
        let namespace = self.namespace().unwrap_or_default();
        Ok(ConnectionString {
            host: resolver.resolve(&self.spec.host, &namespace).await?,
            user: resolver.resolve(&self.spec.user, &namespace).await?,
            password: resolver.resolve(&self.spec.password, &namespace).await?,
            database: database.to_string(),
            params: self.spec.params.clone(),
        })
    }
}

/// Host credentials are probed on a fixed interval unless they cannot work as written.
fn probe_policy(probe_interval: std::time::Duration) -> impl Fn(Phase) -> Requeue {
    move |phase| {
        if is_requeue(phase) || phase == Phase::Available {
            Requeue::After(probe_interval)
        } else {
            Requeue::Never
        }
    }
}

impl Provisioner {
    pub async fn reconcile_host_credential(&self, namespace: &str, name: &str) -> Outcome {
        let mut credential = match self.host_credentials.get(namespace, name).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("HostCredential is gone");
                return Outcome::done();
            }
            Err(e) => return Outcome::failed(Error::temporary(e)),
        };

        let result = self.probe(&credential).await;
        settle(
            self.host_credentials.as_ref(),
            &mut credential,
            result,
            probe_policy(self.probe_interval),
        )
        .await
    }

    async fn probe(&self, credential: &HostCredential) -> Result<()> {
        let connection = credential
            .connection_string(&self.resolver, &self.bootstrap_database)
            .await
            .map_err(Error::invalid)?;

        let client = self.connector.connect(&connection).await?;
        client.ping().await?;
        info!(host = %connection.host, "Host is reachable");
        Ok(())
    }
}

#[instrument(skip(ctx, credential), fields(trace_id))]
async fn reconcile(credential: Arc<HostCredential>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx
        .metrics
        .reconcile
        .count_and_measure(credential.as_ref(), &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = credential.namespace().ok_or(Error::IllegalDocument)?;

    info!(
        "Reconciling HostCredential \"{}\" in {}",
        credential.name_any(),
        namespace
    );
    let outcome = ctx
        .provisioner
        .reconcile_host_credential(&namespace, &credential.name_any())
        .await;
    ctx.finish(credential.as_ref(), outcome).await
}

fn error_policy(credential: Arc<HostCredential>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.retry(credential.as_ref(), error)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(context: Arc<Context>, kube_client: KubeClient) -> Result<(), Error> {
    let credentials = Api::<HostCredential>::all(kube_client);
    if credentials
        .list(&ListParams::default().limit(1))
        .await
        .is_err()
    {
        return Err(Error::MissingCrds);
    }

    info!("Starting HostCredential controller");

    let concurrency = context.settings.controller.host_credential_concurrency;
    Controller::new(credentials, Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
