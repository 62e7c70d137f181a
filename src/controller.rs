use crate::resources::postgresql::{
    PostgresqlConnector, Provisioner, database, host_credential, user,
};
use crate::resources::store::KubeStore;
use crate::resources::value::{KubeValueSource, ValueResolver};
use crate::{Error, State};
use kube::client::Client;
use std::sync::Arc;

pub static FINALIZER: &str = "postgresql.tjo.cloud/finalizer";

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) -> Result<(), Error> {
    let kube_client = Client::try_default().await.map_err(Error::KubeError)?;
    let settings = state.settings();

    let provisioner = Provisioner {
        host_credentials: Arc::new(KubeStore::new(kube_client.clone())),
        databases: Arc::new(KubeStore::new(kube_client.clone())),
        users: Arc::new(KubeStore::new(kube_client.clone())),
        resolver: ValueResolver::new(Arc::new(KubeValueSource::new(kube_client.clone()))),
        connector: Arc::new(PostgresqlConnector::new(
            settings.postgresql.accept_invalid_certs,
        )?),
        bootstrap_database: settings.postgresql.bootstrap_database.clone(),
        probe_interval: settings.probe_interval(),
    };

    tokio::try_join!(
        host_credential::run(
            state
                .to_context(kube_client.clone(), provisioner.clone())
                .await,
            kube_client.clone(),
        ),
        database::run(
            state
                .to_context(kube_client.clone(), provisioner.clone())
                .await,
            kube_client.clone(),
        ),
        user::run(
            state.to_context(kube_client.clone(), provisioner).await,
            kube_client.clone(),
        ),
    )?;

    Ok(())
}
