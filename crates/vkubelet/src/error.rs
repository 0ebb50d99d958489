//! Error taxonomy shared by every component of the core.
//!
//! Components return [`anyhow::Result`] at their boundaries. Callers that need
//! to decide between retrying, forgetting or aborting use [`classify`] to map
//! an error onto an [`ErrorKind`].
use kube::error::ErrorResponse;
use thiserror::Error;

use crate::provider::{NotImplementedError, ProviderError};

/// The kinds of failure the core distinguishes between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Configuration or input that can never be reconciled.
    InvalidInput,
    /// A referenced entity does not exist.
    NotFound,
    /// Network, timeout or server-side failure. Worth retrying.
    Transient,
    /// The provider refused the request and will keep refusing it.
    PermanentProviderFailure,
    /// An optional provider capability is absent.
    CapabilityUnsupported,
    /// The process cannot continue.
    Fatal,
}

impl ErrorKind {
    /// Whether an operation failing with this kind should be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Maps an error onto the taxonomy by inspecting its concrete type.
///
/// Anything unrecognised is considered transient.
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    if let Some(e) = error.downcast_ref::<ProviderError>() {
        return match e {
            ProviderError::PodNotFound { .. } | ProviderError::ContainerNotFound { .. } => {
                ErrorKind::NotFound
            }
            ProviderError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProviderError::Permanent(_) => ErrorKind::PermanentProviderFailure,
            ProviderError::Transient(_) => ErrorKind::Transient,
        };
    }
    if error.is::<NotImplementedError>() {
        return ErrorKind::CapabilityUnsupported;
    }
    if let Some(e) = error.downcast_ref::<kube::Error>() {
        return classify_kube(e);
    }
    if error.is::<tokio::time::error::Elapsed>() {
        return ErrorKind::Transient;
    }
    if let Some(e) = error.downcast_ref::<StartupError>() {
        return match e {
            StartupError::Config(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Fatal,
        };
    }
    if error.is::<ConfigError>() {
        return ErrorKind::InvalidInput;
    }
    ErrorKind::Transient
}

fn classify_kube(error: &kube::Error) -> ErrorKind {
    match error {
        kube::Error::Api(ErrorResponse { code: 404, .. }) => ErrorKind::NotFound,
        kube::Error::Api(ErrorResponse { code, .. }) if *code >= 500 || *code == 429 => {
            ErrorKind::Transient
        }
        kube::Error::Api(ErrorResponse { code, .. }) if *code >= 400 => {
            ErrorKind::PermanentProviderFailure
        }
        _ => ErrorKind::Transient,
    }
}

/// Whether an error is a Kubernetes API `NotFound`.
pub fn is_not_found(error: &anyhow::Error) -> bool {
    classify(error) == ErrorKind::NotFound
}

/// Whether an error is a Kubernetes API `AlreadyExists` conflict.
pub fn is_already_exists(error: &anyhow::Error) -> bool {
    matches!(
        error.downcast_ref::<kube::Error>(),
        Some(kube::Error::Api(ErrorResponse { code: 409, .. }))
    )
}

/// Configuration that cannot be reconciled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The taint effect is not one Kubernetes knows about.
    #[error("invalid taint effect {0:?}, expected one of NoSchedule, NoExecute, PreferNoSchedule")]
    InvalidTaintEffect(String),
    /// The operating system is not supported.
    #[error("operating system {0:?} not supported, valid options are: Linux | Windows")]
    InvalidOperatingSystem(String),
    /// The worker pool cannot be empty.
    #[error("the number of pod sync workers must be greater than zero")]
    NoWorkers,
    /// A duration flag could not be parsed.
    #[error("invalid duration {0:?}")]
    InvalidDuration(String),
    /// A `key=value` pair was malformed or repeated.
    #[error("invalid key=value pair {0:?}")]
    InvalidKeyValue(String),
    /// A trace tag collides with a tag the core sets itself.
    #[error("trace tag {0:?} is reserved")]
    ReservedTraceTag(String),
    /// The trace sample rate is not `always`, `never` or a percentage.
    #[error("unsupported trace sample rate {0:?}, supported values: always, never, or number 0-100")]
    InvalidSampleRate(String),
    /// The log level is not known.
    #[error("log level {0:?} is not supported")]
    InvalidLogLevel(String),
    /// No provider was named.
    #[error("a provider must be supplied with --provider")]
    MissingProvider,
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration was refused.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The provider could not be built.
    #[error(transparent)]
    Registry(#[from] crate::provider::registry::RegistryError),
    /// The node could not be registered with the cluster.
    #[error("error registering node with kubernetes: {0}")]
    NodeRegistration(#[source] anyhow::Error),
    /// The initial pod list did not arrive in time.
    #[error("timed out after {0:?} waiting for the initial pod list")]
    CacheSyncTimeout(std::time::Duration),
    /// Shutdown was requested before startup completed.
    #[error("startup cancelled")]
    Cancelled,
}
