use super::{
    ConnectionString, Outcome, Provisioner, add_finalizer, backoff_on_failure, has_finalizer,
    is_deleting, remove_finalizer, settle,
};
use crate::resources::status::{ResourceStatus, StatusResource};
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

/// Database on a Postgresql server, with its `<name>_readonly` and `<name>_readwrite` roles
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "Database",
    group = "postgresql.tjo.cloud",
    version = "v1",
    namespaced,
    shortname = "pgdb",
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PhaseUpdated", "type":"date", "jsonPath":".status.phaseUpdated"}"#,
    printcolumn = r#"{"name":"Error", "type":"string", "jsonPath":".status.error"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Name of the HostCredential in the same namespace.
    pub host_credential: String,
    #[schemars(length(min = 1, max = 53))]
    pub name: String,
}

impl StatusResource for Database {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = Some(status);
    }
}

impl Provisioner {
    pub async fn reconcile_database(&self, namespace: &str, name: &str) -> Outcome {
        let mut database = match self.databases.get(namespace, name).await {
            Ok(Some(database)) => database,
            Ok(None) => {
                debug!("Database is gone");
                return Outcome::done();
            }
            Err(e) => return Outcome::failed(Error::temporary(e)),
        };

        if is_deleting(&database) {
            return self.finalize_database(database).await;
        }

        // Persisted before anything exists on the server.
        if !has_finalizer(&database) {
            match add_finalizer(self.databases.as_ref(), &database).await {
                Ok(stored) => database = stored,
                Err(e) => {
                    return settle(
                        self.databases.as_ref(),
                        &mut database,
                        Err(e),
                        backoff_on_failure,
                    )
                    .await;
                }
            }
        }

        let result = self.provision_database(namespace, &database.spec).await;
        settle(
            self.databases.as_ref(),
            &mut database,
            result,
            backoff_on_failure,
        )
        .await
    }

    async fn provision_database(&self, namespace: &str, spec: &DatabaseSpec) -> Result<()> {
        let bootstrap = self
            .admin_connection(namespace, &spec.host_credential, &self.bootstrap_database)
            .await?;
        {
            let client = self
                .connector
                .connect(&bootstrap)
                .await
                .map_err(Error::temporary)?;
            client.ensure_database(&spec.name).await?;
        }

        let target = ConnectionString {
            database: spec.name.clone(),
            ..bootstrap
        };
        let client = self
            .connector
            .connect(&target)
            .await
            .map_err(Error::temporary)?;
        client.ensure_database_access_roles(&spec.name).await
    }

    async fn finalize_database(&self, database: Database) -> Outcome {
        if !has_finalizer(&database) {
            debug!("Database already finalized");
            return Outcome::done();
        }
        if let Err(e) = self.release_database(&database).await {
            return Outcome::failed(e);
        }
        match remove_finalizer(self.databases.as_ref(), database).await {
            Ok(()) => Outcome::done(),
            Err(e) => Outcome::failed(e),
        }
    }

    /// The database and its roles stay on the server. Users still pointing at it are reported.
    async fn release_database(&self, database: &Database) -> Result<()> {
        let namespace = database.namespace().unwrap_or_default();
        let users = self
            .users
            .list(&namespace)
            .await
            .map_err(Error::temporary)?;

        let referencing: Vec<String> = users
            .iter()
            .filter(|user| {
                user.spec.access_specs.iter().any(|access| {
                    access.host_credential == database.spec.host_credential
                        && access.database == database.spec.name
                })
            })
            .map(|user| user.name_any())
            .collect();
        if !referencing.is_empty() {
            warn!(users = ?referencing, "Database deleted while users still reference it");
        }

        info!(database = %database.spec.name, "Database deleted, keeping it on the server");
        Ok(())
    }
}

#[instrument(skip(ctx, database), fields(trace_id))]
async fn reconcile(database: Arc<Database>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(database.as_ref(), &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = database.namespace().ok_or(Error::IllegalDocument)?;

    info!("Reconciling Database \"{}\" in {}", database.name_any(), namespace);
    let outcome = ctx
        .provisioner
        .reconcile_database(&namespace, &database.name_any())
        .await;
    ctx.finish(database.as_ref(), outcome).await
}

fn error_policy(database: Arc<Database>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.retry(database.as_ref(), error)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(context: Arc<Context>, kube_client: KubeClient) -> Result<(), Error> {
    let databases = Api::<Database>::all(kube_client);
    if databases
        .list(&ListParams::default().limit(1))
        .await
        .is_err()
    {
        return Err(Error::MissingCrds);
    }

    info!("Starting Database controller");

    // Databases share access roles, one reconcile at a time.
    Controller::new(databases, Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
