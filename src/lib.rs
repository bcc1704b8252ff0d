//! Build-executor backends for a CI worker.
//!
//! The crate exposes a backend abstraction for provisioning one ephemeral
//! executor per job and a Google Compute Engine implementation covering
//! the full lifecycle: image selection, instance insert, readiness
//! polling, optional instance-group membership, script upload over SFTP,
//! PTY execution with live output, and tear-down. Deadlines and
//! cancellation propagate from the worker's [`context::JobContext`]
//! through every remote call.

pub mod backend;
pub mod config;
pub mod context;
pub mod gce;
pub mod metrics;
pub mod registry;

pub use backend::{
    Instance, OutputSink, Provider, RunResult, StartAttributes, buffer_sink,
};
pub use config::ProviderConfig;
pub use context::{CancelHandle, CtxError, JobContext};
pub use gce::{
    ConfigError, GceError, GceInstance, GceProvider, GceServices, ScriptChannel, Ssh2Channel,
};
pub use metrics::{MetricsSink, NullMetrics};
pub use registry::{PROVIDERS, ProviderRegistration, lookup};
