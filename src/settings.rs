use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tokio::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Controller {
    /// Seconds between probes of a HostCredential.
    pub probe_interval_seconds: u64,
    /// Seconds after which a settled resource is reconciled again.
    pub resync_interval_seconds: u64,
    /// Parallel HostCredential reconciles, 0 for unbounded.
    pub host_credential_concurrency: u16,
    pub backoff_base_millis: u64,
    pub backoff_max_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct Postgresql {
    /// Database connected to for server wide statements.
    pub bootstrap_database: String,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    pub bind: String,
}

/// Read from `PROVISIONER__SECTION__KEY` environment variables, `settings.*`
/// and `/etc/pg-provisioner/settings.*`.
#[derive(Debug, Deserialize)]
pub struct Settings {
    pub controller: Controller,
    pub postgresql: Postgresql,
    pub server: Server,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .set_default("controller.probe_interval_seconds", 10)?
            .set_default("controller.resync_interval_seconds", 300)?
            .set_default("controller.host_credential_concurrency", 0)?
            .set_default("controller.backoff_base_millis", 5)?
            .set_default("controller.backoff_max_seconds", 100)?
            .set_default("postgresql.bootstrap_database", "postgres")?
            .set_default("postgresql.accept_invalid_certs", false)?
            .set_default("server.bind", "0.0.0.0:8080")?
            .add_source(
                Environment::with_prefix("PROVISIONER")
                    .separator("__")
                    .try_parsing(true),
            )
            .add_source(File::with_name("settings").required(false))
            .add_source(File::with_name("/etc/pg-provisioner/settings").required(false))
            .build()?;

        settings.try_deserialize()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.controller.probe_interval_seconds)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.controller.resync_interval_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.controller.backoff_base_millis)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.controller.backoff_max_seconds)
    }
}
