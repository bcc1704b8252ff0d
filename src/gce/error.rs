//! Error types for the GCE backend.

use thiserror::Error;

use crate::context::CtxError;

use super::api::OperationError;

/// Errors raised while constructing the provider from configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when a required option is absent.
    #[error("missing {0} config key")]
    MissingOption(&'static str),
    /// Raised when an option fails to parse as its stated type.
    #[error("invalid {name}: {message}")]
    InvalidOption {
        /// Option name as it appears in the configuration.
        name: &'static str,
        /// Parser error message.
        message: String,
    },
    /// Raised when `IMAGE_SELECTOR_TYPE` is not one of the known literals.
    #[error("invalid image selector type {0:?}")]
    InvalidSelectorType(String),
    /// Raised when the ssh key file holds no PEM data.
    #[error("ssh key does not contain a valid PEM block")]
    InvalidPemBlock,
    /// Raised when the ssh key cannot be decrypted or parsed.
    #[error("failed to decrypt ssh key: {0}")]
    KeyDecrypt(String),
    /// Raised when a key or account file cannot be read.
    #[error("failed to read {path}: {message}")]
    FileRead {
        /// Path that could not be read.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the service account JSON is malformed.
    #[error("invalid account JSON: {0}")]
    AccountJson(String),
}

/// Errors raised by provider and instance operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GceError {
    /// Raised when `start` is called before `setup` resolved references.
    #[error("provider is not set up")]
    NotSetUp,
    /// Raised when a cloud operation completes with an error payload.
    #[error("{0}")]
    Operation(String),
    /// Raised when the compute API rejects a request.
    #[error("compute API error: status {status}: {message}")]
    Api {
        /// HTTP status code returned by the API.
        status: u16,
        /// Response body, as returned.
        message: String,
    },
    /// Raised when a compute API request fails in transit.
    #[error("compute API transport error: {0}")]
    Transport(String),
    /// Raised when an image filter matches nothing.
    #[error("no image found with filter {0}")]
    NoImageFound(String),
    /// Raised when the external image selector misbehaves.
    #[error("image selector error: {0}")]
    ImageSelector(String),
    /// Raised when a booted instance exposes no NAT address.
    #[error("no IP address found")]
    MissingIpAddress,
    /// Sentinel raised when the executor already holds a build script. The
    /// instance has been used before and must be discarded by the caller.
    #[error("stale vm: build script already present")]
    StaleVm,
    /// Raised when the SSH transport or session fails.
    #[error("ssh error: {0}")]
    Ssh(String),
    /// Raised when the job context expired or was cancelled.
    #[error(transparent)]
    Context(#[from] CtxError),
}

impl GceError {
    /// Formats a terminal operation error, one `code=… location=… message=…`
    /// triple per entry, comma separated.
    #[must_use]
    pub fn from_operation_error(err: &OperationError) -> Self {
        let rendered = err
            .errors
            .iter()
            .map(|entry| {
                format!(
                    "code={} location={} message={}",
                    entry.code, entry.location, entry.message
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        Self::Operation(rendered)
    }
}
