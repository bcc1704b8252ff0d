//! Google Compute Engine build-executor provider.
//!
//! One instance is booted per job: image selection, insert, readiness
//! polling, optional instance-group membership, script upload over SFTP,
//! PTY execution, and deletion, with the job context as the single
//! cancellation authority throughout.

pub mod api;
pub mod auth;
mod error;
mod image;
mod lifecycle;
mod settings;
mod ssh;
mod startup;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{Instance, OutputSink, Provider, RunResult, StartAttributes};
use crate::config::ProviderConfig;
use crate::context::JobContext;
use crate::metrics::{MetricsSink, NullMetrics};

use api::{ComputeService, MachineType, Network, RestComputeService, Zone};
use image::{ApiSelector, EnvSelector, ImageResolver};
use settings::{GceSettings, InstanceConfig, SelectorType};

pub use error::{ConfigError, GceError};
pub use ssh::{ScriptChannel, Ssh2Channel};

const AUTH_USER: &str = "travis";
const METRIC_BOOT: &str = "worker.vm.provider.gce.boot";
const METRIC_BOOT_TIMEOUT: &str = "worker.vm.provider.gce.boot.timeout";

/// Remote references resolved once during [`Provider::setup`].
#[derive(Clone, Debug)]
pub(crate) struct ResolvedTargets {
    pub zone: Zone,
    pub machine_type: MachineType,
    pub network: Network,
    pub disk_type: String,
}

/// Collaborating services injected into the provider.
///
/// Production wiring comes from [`GceProvider::new`]; tests construct this
/// directly with scripted fakes instead of overriding a transport.
pub struct GceServices {
    /// Compute control-plane client.
    pub compute: Arc<dyn ComputeService>,
    /// Script transport to booted executors.
    pub channel: Arc<dyn ScriptChannel>,
    /// Metrics pipeline supplied by the worker.
    pub metrics: Arc<dyn MetricsSink>,
}

/// Provider booting one preemptible GCE instance per job.
pub struct GceProvider {
    compute: Arc<dyn ComputeService>,
    channel: Arc<dyn ScriptChannel>,
    metrics: Arc<dyn MetricsSink>,
    cfg: ProviderConfig,
    settings: GceSettings,
    instance_config: InstanceConfig,
    resolver: ImageResolver,
    resolved: Option<ResolvedTargets>,
}

impl GceProvider {
    /// Builds a provider with production wiring: an authenticated REST
    /// compute client and an ssh2 script channel.
    ///
    /// Resolved `ZONE`, `MACHINE_TYPE`, and `NETWORK` values are written
    /// back onto `cfg`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a required option is missing, an
    /// option fails to parse, or key material cannot be loaded.
    pub fn new(cfg: &mut ProviderConfig) -> Result<Self, ConfigError> {
        let account_source = cfg
            .get("ACCOUNT_JSON")
            .ok_or(ConfigError::MissingOption("ACCOUNT_JSON"))?
            .to_owned();
        let account = auth::load_account_json(&account_source)?;

        let (gce_settings, instance_config) = settings::resolve(cfg)?;
        let compute = RestComputeService::new(account, gce_settings.project_id.clone())?;
        let channel = Ssh2Channel::new(
            AUTH_USER,
            instance_config.ssh_key_pem.clone(),
            instance_config.ssh_pub_key.clone(),
        );

        Self::assemble(
            cfg.clone(),
            gce_settings,
            instance_config,
            GceServices {
                compute: Arc::new(compute),
                channel: Arc::new(channel),
                metrics: Arc::new(NullMetrics),
            },
        )
    }

    /// Builds a provider around injected services.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when option resolution fails.
    pub fn with_services(
        cfg: &mut ProviderConfig,
        services: GceServices,
    ) -> Result<Self, ConfigError> {
        let (gce_settings, instance_config) = settings::resolve(cfg)?;
        Self::assemble(cfg.clone(), gce_settings, instance_config, services)
    }

    fn assemble(
        cfg: ProviderConfig,
        gce_settings: GceSettings,
        instance_config: InstanceConfig,
        services: GceServices,
    ) -> Result<Self, ConfigError> {
        let resolver = match gce_settings.image_selector {
            SelectorType::Legacy => ImageResolver::Legacy,
            SelectorType::Env => ImageResolver::Env(EnvSelector::new(cfg.clone())),
            SelectorType::Api => {
                let url = gce_settings
                    .image_selector_url
                    .clone()
                    .ok_or(ConfigError::MissingOption("IMAGE_SELECTOR_URL"))?;
                ImageResolver::Api(ApiSelector::new(url))
            }
        };

        Ok(Self {
            compute: services.compute,
            channel: services.channel,
            metrics: services.metrics,
            cfg,
            settings: gce_settings,
            instance_config,
            resolver,
            resolved: None,
        })
    }
}

impl fmt::Debug for GceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GceProvider")
            .field("project_id", &self.settings.project_id)
            .field("zone", &self.settings.zone_name)
            .field("set_up", &self.resolved.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Provider for GceProvider {
    type Instance = GceInstance;
    type Error = GceError;

    async fn setup(&mut self) -> Result<(), GceError> {
        let zone = self.compute.get_zone(&self.settings.zone_name).await?;
        let disk_type = format!("zones/{}/diskTypes/pd-ssd", zone.name);
        let machine_type = self
            .compute
            .get_machine_type(&zone.name, &self.settings.machine_type_name)
            .await?;
        let network = self.compute.get_network(&self.settings.network_name).await?;

        self.resolved = Some(ResolvedTargets {
            zone,
            machine_type,
            network,
            disk_type,
        });
        Ok(())
    }

    async fn start(
        &self,
        ctx: &JobContext,
        attrs: &StartAttributes,
    ) -> Result<GceInstance, GceError> {
        self.launch(ctx, attrs).await
    }
}

/// Handle to one booted executor.
pub struct GceInstance {
    compute: Arc<dyn ComputeService>,
    channel: Arc<dyn ScriptChannel>,
    zone_name: String,
    name: String,
    image_name: String,
    instance: Mutex<api::Instance>,
    boot_poll_sleep: Duration,
    upload_retries: u32,
    upload_retry_sleep: Duration,
}

impl fmt::Debug for GceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GceInstance")
            .field("name", &self.name)
            .field("image_name", &self.image_name)
            .finish_non_exhaustive()
    }
}

impl GceInstance {
    /// Re-reads the instance record from the control plane.
    async fn refresh(&self) -> Result<(), GceError> {
        let fresh = self.compute.get_instance(&self.zone_name, &self.name).await?;
        *self.instance.lock().await = fresh;
        Ok(())
    }

    /// Refreshes the record and extracts the executor's NAT address.
    async fn current_ip(&self) -> Result<String, GceError> {
        self.refresh().await?;
        let instance = self.instance.lock().await;
        instance
            .nat_ip()
            .map(ToOwned::to_owned)
            .ok_or(GceError::MissingIpAddress)
    }

    async fn upload_attempt(&self, script: &[u8]) -> Result<(), GceError> {
        let ip = self.current_ip().await?;
        self.channel.upload(&ip, script).await
    }
}

#[async_trait]
impl Instance for GceInstance {
    type Error = GceError;

    async fn upload_script(&self, ctx: &JobContext, script: &[u8]) -> Result<(), GceError> {
        let attempts = async {
            let mut failures: u32 = 0;
            loop {
                ctx.check()?;
                match self.upload_attempt(script).await {
                    Ok(()) => return Ok(()),
                    // A stale VM must be discarded, not retried.
                    Err(GceError::StaleVm) => return Err(GceError::StaleVm),
                    Err(err) => {
                        failures += 1;
                        if failures > self.upload_retries {
                            return Err(err);
                        }
                        debug!(failures, error = %err, "retrying script upload");
                        tokio::time::sleep(self.upload_retry_sleep).await;
                    }
                }
            }
        };

        tokio::select! {
            outcome = attempts => outcome,
            ctx_err = ctx.done() => Err(ctx_err.into()),
        }
    }

    async fn run_script(
        &self,
        ctx: &JobContext,
        output: OutputSink,
    ) -> Result<RunResult, GceError> {
        let run = async {
            let ip = self.current_ip().await?;
            self.channel.run(&ip, output).await
        };

        tokio::select! {
            outcome = run => outcome,
            ctx_err = ctx.done() => Err(ctx_err.into()),
        }
    }

    async fn stop(&self, ctx: &JobContext) -> Result<(), GceError> {
        let op = self
            .compute
            .delete_instance(&self.zone_name, &self.name)
            .await?;
        let deleted = lifecycle::spawn_operation_poller(
            Arc::clone(&self.compute),
            ctx.clone(),
            self.zone_name.clone(),
            op.name,
            "instance delete",
            self.boot_poll_sleep,
        );

        tokio::select! {
            outcome = deleted => outcome.unwrap_or_else(|_| {
                Err(GceError::Transport(String::from("operation poller dropped")))
            }),
            ctx_err = ctx.done() => Err(ctx_err.into()),
        }
    }

    fn id(&self) -> String {
        format!("{}:{}", self.name, self.image_name)
    }
}
