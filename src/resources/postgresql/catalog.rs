use crate::{Error, Result};
use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::*;

/// Longest identifier Postgresql keeps without truncating (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

static READONLY_SUFFIX: &str = "_readonly";
static READWRITE_SUFFIX: &str = "_readwrite";
static DEFAULT_SCHEMA: &str = "public";

pub fn readonly_role(database: &str) -> String {
    format!("{database}{READONLY_SUFFIX}")
}

pub fn readwrite_role(database: &str) -> String {
    format!("{database}{READWRITE_SUFFIX}")
}

/// Validate `name` and return it double-quoted for use in a statement.
pub fn quote_identifier(name: &str) -> Result<String> {
    let illegal = |reason| Error::PostgresqlIllegalIdentifier {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(illegal("empty"));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(illegal("longer than 63 bytes"));
    }
    if name.starts_with("pg_") {
        return Err(illegal("the pg_ prefix is reserved"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(illegal("only ascii letters, digits, '_', '-' and '.' are allowed"));
    }
    Ok(escape_identifier(name))
}

/// Double-quote `name` without validating it, for names taken from the connection itself.
fn escape_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote `value` as a string literal the way Postgresql's `quote_literal` does.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

static DATABASE_EXISTS: &str = "SELECT datname FROM pg_catalog.pg_database WHERE datname = $1";
static ROLE_EXISTS: &str = "SELECT rolname FROM pg_catalog.pg_roles WHERE rolname = $1";
static USER_EXISTS: &str = "SELECT usename FROM pg_catalog.pg_user WHERE usename = $1";

/// Statements against one live connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Role the connection is authenticated as.
    fn user(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Whether `query` returns a row for the single text parameter `name`.
    async fn exists(&self, query: &str, name: &str) -> Result<bool>;

    /// Run a statement without bind parameters, outside any transaction block.
    async fn execute(&self, statement: &str) -> Result<()>;
}

/// [`Session`] over a tokio-postgres client. The connection closes when dropped.
pub struct PgSession {
    client: Client,
    user: String,
}

impl PgSession {
    pub fn new(client: Client, user: String) -> Self {
        PgSession { client, user }
    }
}

#[async_trait]
impl Session for PgSession {
    fn user(&self) -> &str {
        &self.user
    }

    async fn ping(&self) -> Result<()> {
        self.client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn exists(&self, query: &str, name: &str) -> Result<bool> {
        Ok(self.client.query_opt(query, &[&name]).await?.is_some())
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        // simple query protocol, CREATE DATABASE refuses to run in an implicit transaction
        self.client.batch_execute(statement).await?;
        Ok(())
    }
}

/// Idempotent provisioning of roles, users, databases and grants on one server.
/// Every operation checks the catalog before creating and never drops anything.
pub struct CatalogClient {
    session: Box<dyn Session>,
}

impl CatalogClient {
    pub fn new(session: Box<dyn Session>) -> Self {
        CatalogClient { session }
    }

    pub async fn ping(&self) -> Result<()> {
        self.session.ping().await
    }

    pub async fn ensure_database(&self, name: &str) -> Result<()> {
        let quoted = quote_identifier(name)?;
        if self.session.exists(DATABASE_EXISTS, name).await? {
            info!(database = name, "Found database");
            return Ok(());
        }

        info!(database = name, "No database found, creating");
        self.session
            .execute(&format!("CREATE DATABASE {quoted}"))
            .await?;
        info!(database = name, "Created database");
        Ok(())
    }

    pub async fn ensure_role(&self, name: &str) -> Result<()> {
        let quoted = quote_identifier(name)?;
        if self.session.exists(ROLE_EXISTS, name).await? {
            debug!(role = name, "Found role");
            return Ok(());
        }

        info!(role = name, "No role found, creating");
        self.session
            .execute(&format!("CREATE ROLE {quoted} WITH NOLOGIN NOSUPERUSER"))
            .await?;
        info!(role = name, "Created role");
        Ok(())
    }

    /// Ensure the `<database>_readonly` and `<database>_readwrite` roles and their grants.
    /// Grants on tables are schema local, so the session has to target `database`.
    pub async fn ensure_database_access_roles(&self, database: &str) -> Result<()> {
        let database_ident = quote_identifier(database)?;
        let schema = quote_identifier(DEFAULT_SCHEMA)?;

        let readonly = readonly_role(database);
        let readonly_ident = quote_identifier(&readonly)?;
        self.ensure_role(&readonly).await?;
        for statement in [
            format!("GRANT CONNECT ON DATABASE {database_ident} TO {readonly_ident}"),
            format!("GRANT USAGE ON SCHEMA {schema} TO {readonly_ident}"),
            format!("GRANT SELECT ON ALL TABLES IN SCHEMA {schema} TO {readonly_ident}"),
        ] {
            self.session.execute(&statement).await?;
        }
        info!(role = readonly, "Granted readonly privileges");

        let readwrite = readwrite_role(database);
        let readwrite_ident = quote_identifier(&readwrite)?;
        self.ensure_role(&readwrite).await?;
        for statement in [
            format!("GRANT CONNECT ON DATABASE {database_ident} TO {readwrite_ident}"),
            format!("GRANT ALL ON SCHEMA {schema} TO {readwrite_ident}"),
            format!(
                "GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA {schema} TO {readwrite_ident}"
            ),
        ] {
            self.session.execute(&statement).await?;
        }
        info!(role = readwrite, "Granted readwrite privileges");

        Ok(())
    }

    /// Ensure a login role `name` whose password is always reset to `password`.
    pub async fn ensure_user(&self, name: &str, password: &str) -> Result<()> {
        let quoted = quote_identifier(name)?;

        if self.session.exists(USER_EXISTS, name).await? {
            debug!(user = name, "Found user");
        } else {
            info!(user = name, "No user found, creating");
            self.session
                .execute(&format!(
                    "CREATE ROLE {quoted} WITH LOGIN NOSUPERUSER NOCREATEDB NOCREATEROLE INHERIT NOREPLICATION CONNECTION LIMIT -1"
                ))
                .await?;
            info!(user = name, "Created user");
        }

        self.session
            .execute(&format!(
                "ALTER ROLE {quoted} WITH PASSWORD {}",
                quote_literal(password)
            ))
            .await?;
        debug!(user = name, "Set password");

        // Managed servers (RDS, Cloud SQL) have no superuser, the admin has to be a
        // member of the user to manage what it owns.
        let admin = self.session.user();
        if admin != name {
            let admin_ident = escape_identifier(admin);
            self.session
                .execute(&format!("GRANT {quoted} TO {admin_ident}"))
                .await?;
            debug!(user = name, admin, "Granted user role to admin");
        }

        Ok(())
    }

    pub async fn ensure_readonly_role_to_user(&self, database: &str, user: &str) -> Result<()> {
        let role = quote_identifier(&readonly_role(database))?;
        let user_ident = quote_identifier(user)?;
        self.session
            .execute(&format!("GRANT {role} TO {user_ident}"))
            .await?;
        info!(user, database, "Granted readonly role");
        Ok(())
    }

    /// Grant `<database>_readwrite` to `user` and make tables `user` creates in `schema`
    /// readable by `<database>_readonly`.
    pub async fn ensure_readwrite_role_to_user(
        &self,
        database: &str,
        user: &str,
        schema: Option<&str>,
    ) -> Result<()> {
        let readwrite = quote_identifier(&readwrite_role(database))?;
        let readonly = quote_identifier(&readonly_role(database))?;
        let user_ident = quote_identifier(user)?;
        let schema = quote_identifier(schema.unwrap_or(DEFAULT_SCHEMA))?;

        self.session
            .execute(&format!("GRANT {readwrite} TO {user_ident}"))
            .await?;
        self.session
            .execute(&format!(
                "ALTER DEFAULT PRIVILEGES FOR ROLE {user_ident} IN SCHEMA {schema} GRANT SELECT ON TABLES TO {readonly}"
            ))
            .await?;
        info!(user, database, "Granted readwrite role");
        Ok(())
    }
}
