use thiserror::Error;

use crate::resources::value::SourceKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("CRDS are not installed in cluster")]
    MissingCrds,

    #[error("IllegalDocument")]
    IllegalDocument,

    #[error("postgresql client error: {0}")]
    PostgresqlClientError(#[from] tokio_postgres::Error),

    #[error("invalid connection string: {0}")]
    PostgresqlConnectionString(#[source] tokio_postgres::Error),

    #[error("invalid connection url: {0}")]
    ConnectionUrl(#[from] url::ParseError),

    #[error("invalid connection user {0:?}")]
    ConnectionUser(String),

    #[error("tls error: {0}")]
    TlsError(#[from] native_tls::Error),

    #[error("illegal identifier {name:?}: {reason}")]
    PostgresqlIllegalIdentifier { name: String, reason: &'static str },

    #[error("host credential {0} not found")]
    HostCredentialNotFound(String),

    #[error("{kind} {namespace}/{name} not found")]
    ValueNotFound {
        kind: SourceKind,
        namespace: String,
        name: String,
    },

    #[error("{kind} {namespace}/{name} has no key {key:?}")]
    UnknownKey {
        kind: SourceKind,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("{kind} {namespace}/{name} key {key:?} is not valid utf-8")]
    NonUtf8Value {
        kind: SourceKind,
        namespace: String,
        name: String,
        key: String,
    },

    #[error("no value")]
    NoValue,

    /// Raised by the in-memory test doubles.
    #[cfg(test)]
    #[error("StdIoError: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("{0}")]
    Temporary(#[source] Box<Error>),

    #[error("{0}")]
    Invalid(#[source] Box<Error>),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failure should be treated by the reconcile loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retryable, the phase becomes `Failed`.
    Temporary,
    /// The declaration cannot be satisfied as written, the phase becomes `Invalid`.
    Invalid,
    /// Nobody tagged it. Treated like `Invalid`.
    Unclassified,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Temporary => "temporary",
            ErrorClass::Invalid => "invalid",
            ErrorClass::Unclassified => "unclassified",
        }
    }
}

impl Error {
    /// Tag an error as retryable.
    pub fn temporary(error: Error) -> Self {
        match error {
            Error::Temporary(_) => error,
            other => Error::Temporary(Box::new(other)),
        }
    }

    /// Tag an error as a defect of the declaration. A retryable cause stays retryable.
    pub fn invalid(error: Error) -> Self {
        match error {
            Error::Invalid(_) => error,
            other => Error::Invalid(Box::new(other)),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Temporary(_) => ErrorClass::Temporary,
            Error::Invalid(inner) => match inner.class() {
                ErrorClass::Temporary => ErrorClass::Temporary,
                _ => ErrorClass::Invalid,
            },
            Error::ValueNotFound { .. }
            | Error::UnknownKey { .. }
            | Error::HostCredentialNotFound(_)
            | Error::PostgresqlClientError(_) => ErrorClass::Temporary,
            Error::NoValue
            | Error::NonUtf8Value { .. }
            | Error::PostgresqlIllegalIdentifier { .. }
            | Error::PostgresqlConnectionString(_)
            | Error::ConnectionUrl(_)
            | Error::ConnectionUser(_)
            | Error::IllegalDocument => ErrorClass::Invalid,
            Error::KubeError(_) | Error::MissingCrds | Error::TlsError(_) => {
                ErrorClass::Unclassified
            }
            #[cfg(test)]
            Error::StdIoError(_) => ErrorClass::Unclassified,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::Temporary(inner) | Error::Invalid(inner) => inner.metric_label(),
            other => {
                let debug = format!("{other:?}");
                debug
                    .split(|c: char| !c.is_alphanumeric())
                    .next()
                    .unwrap_or_default()
                    .to_lowercase()
            }
        }
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;

/// Per-object retry delays
mod backoff;
pub use backoff::Backoff;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Resources
pub mod resources;

/// Settings
mod settings;
pub use settings::Settings;

/// State
mod state;
pub use state::*;

/// Context
mod context;
pub use context::*;

#[cfg(test)]
pub(crate) mod testing;
