use super::catalog::{quote_identifier, readonly_role, readwrite_role};
use super::{
    CatalogClient, Outcome, Provisioner, add_finalizer, backoff_on_failure, has_finalizer,
    is_deleting, remove_finalizer, settle,
};
use crate::resources::status::{ResourceStatus, StatusResource};
use crate::resources::value::ResourceValue;
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
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;
use tracing::*;

/// Login role on one or more Postgresql servers
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    kind = "User",
    group = "postgresql.tjo.cloud",
    version = "v1",
    namespaced,
    shortname = "pgu",
    status = "ResourceStatus",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"PhaseUpdated", "type":"date", "jsonPath":".status.phaseUpdated"}"#,
    printcolumn = r#"{"name":"Error", "type":"string", "jsonPath":".status.error"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    pub name: ResourceValue,
    #[serde(default)]
    pub password: ResourceValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_specs: Vec<AccessSpec>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Readonly,
    Readwrite,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Readonly => f.write_str("readonly"),
            Permission::Readwrite => f.write_str("readwrite"),
        }
    }
}

/// Access of the user to one database.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessSpec {
    /// Name of the HostCredential in the same namespace.
    pub host_credential: String,
    /// Name of the database on the server.
    pub database: String,
    /// Schema whose new tables stay readable by `<database>_readonly`. Defaults to `public`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<ResourceValue>,
    /// Why the access was granted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub permission: Permission,
}

impl StatusResource for User {
    fn status(&self) -> Option<&ResourceStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ResourceStatus) {
        self.status = Some(status);
    }
}

impl Provisioner {
    pub async fn reconcile_user(&self, namespace: &str, name: &str) -> Outcome {
        let mut user = match self.users.get(namespace, name).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!("User is gone");
                return Outcome::done();
            }
            Err(e) => return Outcome::failed(Error::temporary(e)),
        };

        if is_deleting(&user) {
            return self.finalize_user(user).await;
        }

        if !has_finalizer(&user) {
            match add_finalizer(self.users.as_ref(), &user).await {
                Ok(stored) => user = stored,
                Err(e) => {
                    return settle(self.users.as_ref(), &mut user, Err(e), backoff_on_failure)
                        .await;
                }
            }
        }

        let result = self.provision_user(namespace, &user.spec).await;
        settle(self.users.as_ref(), &mut user, result, backoff_on_failure).await
    }

    /// Stops at the first access spec that fails, the next pass starts over.
    async fn provision_user(&self, namespace: &str, spec: &UserSpec) -> Result<()> {
        let username = self
            .resolver
            .resolve(&spec.name, namespace)
            .await
            .map_err(Error::invalid)?;
        quote_identifier(&username).map_err(Error::invalid)?;
        let password = self
            .resolver
            .resolve(&spec.password, namespace)
            .await
            .map_err(Error::invalid)?;

        // keyed by connection url, dropped with this pass
        let mut clients: HashMap<String, CatalogClient> = HashMap::new();

        for access in &spec.access_specs {
            // checked before the name reaches a connection url
            for name in [
                access.database.clone(),
                readonly_role(&access.database),
                readwrite_role(&access.database),
            ] {
                quote_identifier(&name).map_err(Error::invalid)?;
            }
            let schema = match access
                .schema
                .as_ref()
                .filter(|schema| **schema != ResourceValue::default())
            {
                Some(schema) => Some(
                    self.resolver
                        .resolve(schema, namespace)
                        .await
                        .map_err(Error::invalid)?,
                ),
                None => None,
            };

            let connection = self
                .admin_connection(namespace, &access.host_credential, &access.database)
                .await?;
            let key = connection.to_url().map_err(Error::temporary)?;
            let client = match clients.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let client = self
                        .connector
                        .connect(&connection)
                        .await
                        .map_err(Error::temporary)?;
                    entry.insert(client)
                }
            };

            info!(
                user = %username,
                database = %access.database,
                permission = %access.permission,
                reason = access.reason.as_deref().unwrap_or_default(),
                "Granting access"
            );
            client.ensure_user(&username, &password).await?;
            match access.permission {
                Permission::Readonly => {
                    client
                        .ensure_readonly_role_to_user(&access.database, &username)
                        .await?
                }
                Permission::Readwrite => {
                    client
                        .ensure_readwrite_role_to_user(
                            &access.database,
                            &username,
                            schema.as_deref(),
                        )
                        .await?
                }
            }
        }

        Ok(())
    }

    async fn finalize_user(&self, user: User) -> Outcome {
        if !has_finalizer(&user) {
            debug!("User already finalized");
            return Outcome::done();
        }
        // The role and its grants stay on the servers.
        info!(user = %user.name_any(), "User deleted, keeping its role");
        match remove_finalizer(self.users.as_ref(), user).await {
            Ok(()) => Outcome::done(),
            Err(e) => Outcome::failed(e),
        }
    }
}

#[instrument(skip(ctx, user), fields(trace_id))]
async fn reconcile(user: Arc<User>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.reconcile.count_and_measure(user.as_ref(), &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();
    let namespace = user.namespace().ok_or(Error::IllegalDocument)?;

    info!("Reconciling User \"{}\" in {}", user.name_any(), namespace);
    let outcome = ctx
        .provisioner
        .reconcile_user(&namespace, &user.name_any())
        .await;
    ctx.finish(user.as_ref(), outcome).await
}

fn error_policy(user: Arc<User>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.retry(user.as_ref(), error)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(context: Arc<Context>, kube_client: KubeClient) -> Result<(), Error> {
    let users = Api::<User>::all(kube_client);
    if users.list(&ListParams::default().limit(1)).await.is_err() {
        return Err(Error::MissingCrds);
    }

    info!("Starting User controller");

    // Users are granted shared access roles, one reconcile at a time.
    Controller::new(users, Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(1))
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}
