//! Error types for the local volume provider
//!
//! Errors are structured with fields naming the object, field, or step that
//! failed. Every public workflow wraps failures with [`StepContext::step`] so
//! the final message reads as a breadcrumb chain from the outermost step to
//! the root cause.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for local volume provider operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API or transport failure
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A user-supplied option is missing or malformed
    #[error("invalid config [{field}]: {message}")]
    InvalidConfig {
        /// The config key that failed validation (e.g., "path", "storageSize")
        field: String,
        /// Description of what's invalid
        message: String,
    },

    /// The plugin was registered for a volume type this crate does not know
    #[error("unrecognized volume type: {0}")]
    UnrecognizedVolumeType(String),

    /// A pod security context option is not an integer
    #[error("invalid security context value for {field}: {value:?}")]
    InvalidSecurityContextValue {
        /// Option name (runAsUser, runAsGroup, fsGroup)
        field: String,
        /// The raw value that failed to parse
        value: String,
    },

    /// More than one ConfigMap matched the plugin label selector
    #[error("found more than one ConfigMap matching label selector {selector:?}: {names:?}")]
    AmbiguousConfig {
        /// The label selector used for the lookup
        selector: String,
        /// Names of every matching ConfigMap
        names: Vec<String>,
    },

    /// The primary (velero) deployment does not exist
    #[error("primary workload not found: deployment {name}")]
    PrimaryWorkloadNotFound {
        /// Deployment name that was looked up
        name: String,
    },

    /// A container with a reserved name is missing from a workload
    #[error("container {container} not found in {workload}")]
    ContainerNotFound {
        /// Workload the container was expected in
        workload: String,
        /// Container name (or index description) that was looked up
        container: String,
    },

    /// A create call found the object already present
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (Secret, PersistentVolumeClaim)
        kind: String,
        /// Resource name
        name: String,
    },

    /// The signing key could not be read or persisted
    #[error("signing key store unavailable: {source}")]
    KeyStoreUnavailable {
        /// What went wrong talking to the key store
        #[source]
        source: Box<Error>,
    },

    /// The signing key secret exists but is unusable
    #[error("signing key secret {name} is invalid: {message}")]
    InvalidSigningKey {
        /// Secret name
        name: String,
        /// Description of what's wrong with it
        message: String,
    },

    /// A URL could not be parsed
    #[error("invalid url {url:?}: {message}")]
    InvalidUrl {
        /// The raw URL
        url: String,
        /// Parser message
        message: String,
    },

    /// The `expires` query parameter is present but not in the expiry layout
    #[error("malformed expiry {value:?}: {message}")]
    MalformedExpiry {
        /// The raw expiry value
        value: String,
        /// Parser message
        message: String,
    },

    /// The `signature` query parameter is not valid base64url
    #[error("malformed signature: {message}")]
    MalformedSignature {
        /// Decoder message
        message: String,
    },

    /// Local filesystem failure
    #[error("filesystem error at {}: {source}", .path.display())]
    Filesystem {
        /// Path being operated on
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// A named workflow step failed
    #[error("{step}: {source}")]
    Step {
        /// Name of the step that failed
        step: String,
        /// The error raised inside the step
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an invalid config error for a field
    pub fn invalid_config(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-key config error
    pub fn missing_config(field: impl Into<String>) -> Self {
        let field = field.into();
        let message = format!("config is missing {}", field);
        Self::InvalidConfig { field, message }
    }

    /// Create a container-not-found error
    pub fn container_not_found(workload: impl Into<String>, container: impl Into<String>) -> Self {
        Self::ContainerNotFound {
            workload: workload.into(),
            container: container.into(),
        }
    }

    /// Create a filesystem error for a path
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error as a key store failure
    pub fn key_store(source: Error) -> Self {
        Self::KeyStoreUnavailable {
            source: Box::new(source),
        }
    }

    /// Innermost error of a step chain
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } | Error::KeyStoreUnavailable { source } => source.root(),
            other => other,
        }
    }

    /// Names of the steps this error passed through, outermost first
    pub fn steps(&self) -> Vec<&str> {
        let mut steps = Vec::new();
        let mut current = self;
        while let Error::Step { step, source } = current {
            steps.push(step.as_str());
            current = source.as_ref();
        }
        steps
    }

    /// Whether the failure was caused by the caller's input rather than the system
    ///
    /// Used by the file server to choose between a 4xx and a 5xx response.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.root(),
            Error::InvalidUrl { .. } | Error::MalformedExpiry { .. } | Error::MalformedSignature { .. }
        )
    }
}

/// Extension for attaching the failing step's name to an error
pub trait StepContext<T> {
    /// Wrap the error, if any, with the given step name
    fn step(self, step: impl Into<String>) -> Result<T, Error>;
}

impl<T, E: Into<Error>> StepContext<T> for Result<T, E> {
    fn step(self, step: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::Step {
            step: step.into(),
            source: Box::new(e.into()),
        })
    }
}
