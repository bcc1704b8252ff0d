//! Backend abstraction for provisioning per-job build executors.
//!
//! A [`Provider`] turns job attributes into a running [`Instance`]; the
//! instance uploads the build script, runs it while streaming output, and
//! is destroyed afterwards. Backends are driven by the worker through
//! these traits only.

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::context::JobContext;

/// Job attributes a backend may consult when selecting a boot image.
///
/// All fields are optional; an empty string means the attribute was not
/// supplied with the job.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StartAttributes {
    /// Primary language of the job (for example `ruby`).
    pub language: String,
    /// Requested macOS image name, when targeting osx workers.
    pub osx_image: String,
    /// Requested distribution (for example `trusty`).
    pub dist: String,
    /// Image group label (for example `stable`).
    pub group: String,
    /// Operating system family (for example `linux`).
    pub os: String,
}

/// Outcome of running the build script to completion.
///
/// A value is only produced when the remote script actually finished, in
/// which case `exit_code` is authoritative. Transport or session failures
/// surface as errors instead: the outcome is unknown and the worker may
/// requeue the job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunResult {
    /// Whether the remote script ran to completion.
    pub completed: bool,
    /// Exit code reported by the remote shell.
    pub exit_code: u8,
}

/// Shared writer receiving live build output.
pub type OutputSink = Arc<Mutex<dyn Write + Send>>;

/// Builds a memory-backed [`OutputSink`] plus a handle for reading it back.
#[must_use]
pub fn buffer_sink() -> (OutputSink, Arc<Mutex<Vec<u8>>>) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    (buffer.clone(), buffer)
}

/// Compute backend able to provision one executor per job.
#[async_trait]
pub trait Provider {
    /// Instance handle type returned by [`Provider::start`].
    type Instance: Instance;
    /// Backend specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Resolves remote references once, after construction and before the
    /// first [`Provider::start`]. Failure is fatal for this provider.
    async fn setup(&mut self) -> Result<(), Self::Error>;

    /// Provisions a fresh executor for a job.
    async fn start(
        &self,
        ctx: &JobContext,
        attrs: &StartAttributes,
    ) -> Result<Self::Instance, Self::Error>;
}

/// A provisioned executor bound to one job.
#[async_trait]
pub trait Instance: Send + Sync {
    /// Backend specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Uploads the build script to the executor.
    async fn upload_script(&self, ctx: &JobContext, script: &[u8]) -> Result<(), Self::Error>;

    /// Runs the uploaded script, streaming combined output into `output`.
    async fn run_script(
        &self,
        ctx: &JobContext,
        output: OutputSink,
    ) -> Result<RunResult, Self::Error>;

    /// Destroys the executor.
    async fn stop(&self, ctx: &JobContext) -> Result<(), Self::Error>;

    /// Stable identifier for logs and job records.
    fn id(&self) -> String;
}
