//! In-memory stand-ins for the Kubernetes API and Postgresql, used by unit tests.

use crate::resources::postgresql::catalog::{CatalogClient, Session};
use crate::resources::postgresql::database::{Database, DatabaseSpec};
use crate::resources::postgresql::host_credential::{HostCredential, HostCredentialSpec};
use crate::resources::postgresql::user::{User, UserSpec};
use crate::resources::postgresql::{ConnectionString, Connector, Provisioner};
use crate::resources::status::StatusResource;
use crate::resources::store::ResourceStore;
use crate::resources::value::{KeyValueSource, ResourceValue, ValueResolver};
use crate::{Error, FINALIZER, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn io_error(message: impl Into<String>) -> Error {
    Error::temporary(Error::StdIoError(io::Error::other(message.into())))
}

#[derive(Default)]
struct Values {
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    config_maps: HashMap<(String, String), BTreeMap<String, String>>,
    lookups: usize,
}

/// Secrets and config maps held in memory.
#[derive(Default)]
pub struct MemoryValueSource {
    values: Mutex<Values>,
}

impl MemoryValueSource {
    pub fn insert_secret(&self, namespace: &str, name: &str, data: &[(&str, &[u8])]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect();
        lock(&self.values)
            .secrets
            .insert((namespace.into(), name.into()), data);
    }

    pub fn insert_config_map(&self, namespace: &str, name: &str, data: &[(&str, &str)]) {
        let data = data
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        lock(&self.values)
            .config_maps
            .insert((namespace.into(), name.into()), data);
    }

    pub fn lookups(&self) -> usize {
        lock(&self.values).lookups
    }
}

#[async_trait]
impl KeyValueSource for MemoryValueSource {
    async fn secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let mut values = lock(&self.values);
        values.lookups += 1;
        Ok(values
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let mut values = lock(&self.values);
        values.lookups += 1;
        Ok(values
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

struct Objects<K> {
    objects: BTreeMap<(String, String), K>,
    updates: Vec<K>,
    status_updates: usize,
    lists: usize,
    fail_updates: bool,
}

/// Resource store that behaves like the API server for replace and status writes.
pub struct MemoryStore<K> {
    inner: Mutex<Objects<K>>,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        MemoryStore {
            inner: Mutex::new(Objects {
                objects: BTreeMap::new(),
                updates: Vec::new(),
                status_updates: 0,
                lists: 0,
                fail_updates: false,
            }),
        }
    }
}

fn key_of<K: ResourceExt>(resource: &K) -> (String, String) {
    (resource.namespace().unwrap_or_default(), resource.name_any())
}

impl<K> MemoryStore<K>
where
    K: ResourceExt + StatusResource + Clone,
{
    pub fn insert(&self, resource: K) {
        lock(&self.inner).objects.insert(key_of(&resource), resource);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.inner)
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Objects passed to `update`, in call order.
    pub fn updates(&self) -> Vec<K> {
        lock(&self.inner).updates.clone()
    }

    pub fn status_updates(&self) -> usize {
        lock(&self.inner).status_updates
    }

    pub fn lists(&self) -> usize {
        lock(&self.inner).lists
    }

    pub fn fail_updates(&self, fail: bool) {
        lock(&self.inner).fail_updates = fail;
    }

    /// Mark the stored object as deleted by a user.
    pub fn delete(&self, namespace: &str, name: &str) {
        let mut inner = lock(&self.inner);
        if let Some(resource) = inner
            .objects
            .get_mut(&(namespace.to_string(), name.to_string()))
        {
            let now: Time = serde_json::from_value(serde_json::json!("2024-01-01T00:00:00Z"))
                .unwrap_or_else(|e| panic!("timestamp: {e}"));
            resource.meta_mut().deletion_timestamp = Some(now);
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: ResourceExt + StatusResource + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.stored(namespace, name))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        let mut inner = lock(&self.inner);
        inner.lists += 1;
        Ok(inner
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    async fn update(&self, resource: &K) -> Result<K> {
        let mut inner = lock(&self.inner);
        inner.updates.push(resource.clone());
        if inner.fail_updates {
            return Err(io_error("the object has been modified"));
        }

        let key = key_of(resource);
        let Some(existing) = inner.objects.get(&key) else {
            return Err(io_error(format!("{}/{} not found", key.0, key.1)));
        };

        // replace does not touch the status subresource
        let mut stored = resource.clone();
        if let Some(status) = existing.status() {
            stored.set_status(status.clone());
        }

        if stored.meta().deletion_timestamp.is_some() && stored.finalizers().is_empty() {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, resource: &K) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.status_updates += 1;
        let key = key_of(resource);
        let Some(existing) = inner.objects.get_mut(&key) else {
            return Err(io_error(format!("{}/{} not found", key.0, key.1)));
        };
        if let Some(status) = resource.status() {
            existing.set_status(status.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct Role {
    login: bool,
    password: Option<String>,
    members: BTreeSet<String>,
}

#[derive(Default)]
struct Catalog {
    roles: BTreeMap<String, Role>,
    databases: BTreeSet<String>,
    statements: Vec<String>,
    failing: Vec<String>,
    refusing: bool,
    open: usize,
}

/// Simulated Postgresql server. Understands the statements [`CatalogClient`] emits.
#[derive(Clone)]
pub struct FakeServer {
    admin: String,
    catalog: Arc<Mutex<Catalog>>,
}

/// Double-quoted identifiers of `statement`, unescaped.
fn identifiers(statement: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut chars = statement.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '"' {
            continue;
        }
        let mut ident = String::new();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    ident.push('"');
                } else {
                    break;
                }
            } else {
                ident.push(c);
            }
        }
        found.push(ident);
    }
    found
}

impl Catalog {
    fn require_role(&self, name: &str) -> Result<()> {
        if self.roles.contains_key(name) {
            Ok(())
        } else {
            Err(io_error(format!("role \"{name}\" does not exist")))
        }
    }

    fn apply(&mut self, statement: &str) -> Result<()> {
        if statement.starts_with("ALTER ROLE ") {
            let (head, password) = statement
                .split_once(" WITH PASSWORD ")
                .ok_or_else(|| io_error("syntax error"))?;
            let name = identifiers(head).remove(0);
            let role = self
                .roles
                .get_mut(&name)
                .ok_or_else(|| io_error(format!("role \"{name}\" does not exist")))?;
            role.password = Some(password.to_string());
            return Ok(());
        }

        let idents = identifiers(statement);
        if statement.starts_with("CREATE DATABASE ") {
            if !self.databases.insert(idents[0].clone()) {
                return Err(io_error(format!("database \"{}\" already exists", idents[0])));
            }
        } else if statement.starts_with("CREATE ROLE ") {
            if self.roles.contains_key(&idents[0]) {
                return Err(io_error(format!("role \"{}\" already exists", idents[0])));
            }
            let role = Role {
                login: statement.contains(" WITH LOGIN "),
                ..Role::default()
            };
            self.roles.insert(idents[0].clone(), role);
        } else if statement.starts_with("ALTER DEFAULT PRIVILEGES ") {
            self.require_role(&idents[0])?;
            self.require_role(&idents[2])?;
        } else if statement.starts_with("GRANT CONNECT ON DATABASE ") {
            if !self.databases.contains(&idents[0]) {
                return Err(io_error(format!("database \"{}\" does not exist", idents[0])));
            }
            self.require_role(&idents[1])?;
        } else if statement.starts_with("GRANT \"") {
            self.require_role(&idents[1])?;
            let role = self
                .roles
                .get_mut(&idents[0])
                .ok_or_else(|| io_error(format!("role \"{}\" does not exist", idents[0])))?;
            role.members.insert(idents[1].clone());
        } else if statement.starts_with("GRANT ") && statement.contains(" SCHEMA ") {
            let grantee = idents.last().ok_or_else(|| io_error("syntax error"))?;
            self.require_role(grantee)?;
        } else {
            return Err(io_error(format!("unsupported statement {statement}")));
        }
        Ok(())
    }
}

impl FakeServer {
    /// Server with a `postgres` database and the login role `admin`.
    pub fn new(admin: &str) -> Self {
        let server = FakeServer {
            admin: admin.to_string(),
            catalog: Arc::default(),
        };
        server.add_user(admin);
        server.add_database("postgres");
        server
    }

    /// Client connected as the admin.
    pub fn client(&self) -> CatalogClient {
        let admin = self.admin.clone();
        CatalogClient::new(Box::new(self.session(admin)))
    }

    fn session(&self, user: String) -> FakeSession {
        lock(&self.catalog).open += 1;
        FakeSession {
            server: self.clone(),
            user,
        }
    }

    pub fn add_role(&self, name: &str) {
        lock(&self.catalog)
            .roles
            .entry(name.to_string())
            .or_default();
    }

    pub fn add_user(&self, name: &str) {
        lock(&self.catalog)
            .roles
            .entry(name.to_string())
            .or_default()
            .login = true;
    }

    pub fn add_database(&self, name: &str) {
        lock(&self.catalog).databases.insert(name.to_string());
    }

    pub fn role_count(&self, name: &str) -> usize {
        usize::from(lock(&self.catalog).roles.contains_key(name))
    }

    pub fn has_database(&self, name: &str) -> bool {
        lock(&self.catalog).databases.contains(name)
    }

    pub fn is_member(&self, role: &str, member: &str) -> bool {
        lock(&self.catalog)
            .roles
            .get(role)
            .is_some_and(|r| r.members.contains(member))
    }

    /// Password literal last set on `role`.
    pub fn password(&self, role: &str) -> Option<String> {
        lock(&self.catalog)
            .roles
            .get(role)
            .and_then(|r| r.password.clone())
    }

    /// Executed statements in order, including failed ones.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.catalog).statements.clone()
    }

    pub fn statements_matching(&self, prefix: &str) -> usize {
        lock(&self.catalog)
            .statements
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }

    /// Fail every statement or query starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        lock(&self.catalog).failing.push(prefix.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.catalog).failing.clear();
    }

    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.catalog).refusing = refuse;
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.catalog).open
    }
}

struct FakeSession {
    server: FakeServer,
    user: String,
}

impl FakeSession {
    fn check(&self, catalog: &Catalog, sql: &str) -> Result<()> {
        if catalog.failing.iter().any(|prefix| sql.starts_with(prefix)) {
            return Err(io_error(format!("injected failure for {sql}")));
        }
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        let mut catalog = lock(&self.server.catalog);
        catalog.open = catalog.open.saturating_sub(1);
    }
}

#[async_trait]
impl Session for FakeSession {
    fn user(&self) -> &str {
        &self.user
    }

    async fn ping(&self) -> Result<()> {
        let catalog = lock(&self.server.catalog);
        self.check(&catalog, "SELECT 1")
    }

    async fn exists(&self, query: &str, name: &str) -> Result<bool> {
        let catalog = lock(&self.server.catalog);
        self.check(&catalog, query)?;
        let found = if query.contains("pg_database") {
            catalog.databases.contains(name)
        } else if query.contains("pg_user") {
            catalog.roles.get(name).is_some_and(|r| r.login)
        } else if query.contains("pg_roles") {
            catalog.roles.contains_key(name)
        } else {
            return Err(io_error(format!("unsupported query {query}")));
        };
        Ok(found)
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        let mut catalog = lock(&self.server.catalog);
        catalog.statements.push(statement.to_string());
        self.check(&catalog, statement)?;
        catalog.apply(statement)
    }
}

#[derive(Default)]
struct Dialed {
    servers: HashMap<String, FakeServer>,
    connections: Vec<ConnectionString>,
}

/// Connects to [`FakeServer`]s by host.
#[derive(Clone, Default)]
pub struct FakeConnector {
    inner: Arc<Mutex<Dialed>>,
}

impl FakeConnector {
    pub fn serve(&self, host: &str, server: &FakeServer) {
        lock(&self.inner)
            .servers
            .insert(host.to_string(), server.clone());
    }

    /// Every connection attempt in order.
    pub fn connections(&self) -> Vec<ConnectionString> {
        lock(&self.inner).connections.clone()
    }

    /// Target databases of every connection attempt in order.
    pub fn databases(&self) -> Vec<String> {
        self.connections().into_iter().map(|c| c.database).collect()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, connection: &ConnectionString) -> Result<CatalogClient> {
        connection.to_url()?;
        let server = {
            let mut dialed = lock(&self.inner);
            dialed.connections.push(connection.clone());
            dialed.servers.get(&connection.host).cloned()
        };
        let Some(server) = server else {
            return Err(io_error(format!("could not translate host name {:?}", connection.host)));
        };
        {
            let catalog = lock(&server.catalog);
            if catalog.refusing {
                return Err(io_error("connection refused"));
            }
            if !catalog.databases.contains(&connection.database) {
                return Err(io_error(format!(
                    "database \"{}\" does not exist",
                    connection.database
                )));
            }
        }
        Ok(CatalogClient::new(Box::new(
            server.session(connection.user.clone()),
        )))
    }
}

pub static NAMESPACE: &str = "apps";
pub static HOST: &str = "pg.internal:5432";

/// A [`Provisioner`] wired to in-memory collaborators, with a reachable host
/// credential `main` in namespace `apps`.
pub struct Harness {
    pub provisioner: Provisioner,
    pub host_credentials: Arc<MemoryStore<HostCredential>>,
    pub databases: Arc<MemoryStore<Database>>,
    pub users: Arc<MemoryStore<User>>,
    pub values: Arc<MemoryValueSource>,
    pub connector: FakeConnector,
    pub server: FakeServer,
}

impl Harness {
    pub fn new() -> Self {
        let host_credentials = Arc::new(MemoryStore::default());
        let databases = Arc::new(MemoryStore::default());
        let users = Arc::new(MemoryStore::default());
        let values = Arc::new(MemoryValueSource::default());
        let connector = FakeConnector::default();
        let server = FakeServer::new("admin");
        connector.serve(HOST, &server);

        values.insert_secret(NAMESPACE, "db-admin", &[("password", b"hunter2".as_slice())]);
        host_credentials.insert(host_credential(
            "main",
            HostCredentialSpec {
                host: ResourceValue::literal(HOST),
                user: ResourceValue::literal("admin"),
                password: ResourceValue::secret("db-admin", "password"),
                params: String::new(),
            },
        ));

        let provisioner = Provisioner {
            host_credentials: host_credentials.clone(),
            databases: databases.clone(),
            users: users.clone(),
            resolver: ValueResolver::new(values.clone()),
            connector: Arc::new(connector.clone()),
            bootstrap_database: "postgres".into(),
            probe_interval: Duration::from_secs(10),
        };

        Harness {
            provisioner,
            host_credentials,
            databases,
            users,
            values,
            connector,
            server,
        }
    }
}

pub fn host_credential(name: &str, spec: HostCredentialSpec) -> HostCredential {
    let mut credential = HostCredential::new(name, spec);
    credential.metadata.namespace = Some(NAMESPACE.into());
    credential
}

pub fn database(name: &str, spec: DatabaseSpec) -> Database {
    let mut database = Database::new(name, spec);
    database.metadata.namespace = Some(NAMESPACE.into());
    database
}

pub fn user(name: &str, spec: UserSpec) -> User {
    let mut user = User::new(name, spec);
    user.metadata.namespace = Some(NAMESPACE.into());
    user
}

/// `resource` as if a previous pass had already added the finalizer.
pub fn finalized<K: ResourceExt>(mut resource: K) -> K {
    resource.finalizers_mut().push(FINALIZER.to_string());
    resource
}
