//! Boot orchestration: insert, poll, optional group join, abandon.
//!
//! Every cloud operation is watched by its own poller task. Pollers report
//! over a oneshot channel (a send after the caller gave up never blocks)
//! and check the job context at each iteration, so an abandoned poller
//! exits within one poll interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error};

use crate::backend::StartAttributes;
use crate::context::{CtxError, JobContext};

use super::api::{self, ComputeService, OPERATION_DONE};
use super::error::GceError;
use super::{GceInstance, GceProvider, METRIC_BOOT, METRIC_BOOT_TIMEOUT, ResolvedTargets};
use super::{image, startup};

/// Spawns a poller following `op_name` to its terminal state.
pub(super) fn spawn_operation_poller(
    compute: Arc<dyn ComputeService>,
    ctx: JobContext,
    zone: String,
    op_name: String,
    what: &'static str,
    interval: Duration,
) -> oneshot::Receiver<Result<(), GceError>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let outcome = poll_operation(compute.as_ref(), &ctx, &zone, &op_name, what, interval).await;
        // The receiver is gone when the boot was abandoned; nothing to do.
        let _ = tx.send(outcome);
    });
    rx
}

async fn poll_operation(
    compute: &dyn ComputeService,
    ctx: &JobContext,
    zone: &str,
    op_name: &str,
    what: &'static str,
    interval: Duration,
) -> Result<(), GceError> {
    loop {
        ctx.check()?;

        let op = compute.get_zone_operation(zone, op_name).await?;
        if op.status == OPERATION_DONE {
            if let Some(op_error) = op.error {
                return Err(GceError::from_operation_error(&op_error));
            }
            debug!(status = %op.status, name = %op_name, what, "operation is done");
            return Ok(());
        }

        // An error payload on a non-terminal operation is terminal for us.
        if let Some(op_error) = op.error {
            error!(name = %op_name, what, "error while waiting for operation");
            return Err(GceError::from_operation_error(&op_error));
        }

        debug!(status = %op.status, name = %op_name, what, "sleeping before polling operation");
        tokio::time::sleep(interval).await;
    }
}

impl GceProvider {
    /// Provisions one instance for a job and waits until it is usable.
    ///
    /// Exactly one of three terminations: the (possibly refreshed)
    /// instance is delivered; an operation or transport error surfaces; or
    /// the job context fires. On every non-delivery exit after the insert
    /// was issued, a best-effort delete is sent so the project never
    /// accumulates orphaned instances.
    pub(super) async fn launch(
        &self,
        ctx: &JobContext,
        attrs: &StartAttributes,
    ) -> Result<GceInstance, GceError> {
        let targets = self.resolved.as_ref().ok_or(GceError::NotSetUp)?;

        let image = image::select_image(
            self.compute.as_ref(),
            &self.cfg,
            &self.settings,
            &self.resolver,
            attrs,
        )
        .await?;

        let script = startup::render_startup_script(&self.instance_config);
        let spec = startup::build_instance_spec(
            &self.instance_config,
            targets,
            attrs,
            &image.self_link,
            script,
        );

        debug!(instance = %spec.name, image = %image.name, "inserting instance");
        let insert_op = self.compute.insert_instance(&targets.zone.name, &spec).await?;
        let boot_started = Instant::now();

        match self.wait_for_boot(ctx, targets, &spec, insert_op).await {
            Ok(instance) => {
                self.metrics.time_since(METRIC_BOOT, boot_started);
                Ok(GceInstance {
                    compute: Arc::clone(&self.compute),
                    channel: Arc::clone(&self.channel),
                    zone_name: targets.zone.name.clone(),
                    name: spec.name,
                    image_name: image.name,
                    instance: Mutex::new(instance),
                    boot_poll_sleep: self.settings.boot_poll_sleep,
                    upload_retries: self.settings.upload_retries,
                    upload_retry_sleep: self.settings.upload_retry_sleep,
                })
            }
            Err(err) => {
                let _ = self
                    .compute
                    .delete_instance(&targets.zone.name, &spec.name)
                    .await;
                Err(err)
            }
        }
    }

    async fn wait_for_boot(
        &self,
        ctx: &JobContext,
        targets: &ResolvedTargets,
        spec: &api::Instance,
        insert_op: api::Operation,
    ) -> Result<api::Instance, GceError> {
        let insert_done = spawn_operation_poller(
            Arc::clone(&self.compute),
            ctx.clone(),
            targets.zone.name.clone(),
            insert_op.name,
            "instance insert",
            self.settings.boot_poll_sleep,
        );
        self.await_operation(ctx, insert_done).await?;

        let Some(group) = self.settings.instance_group.as_deref() else {
            return Ok(spec.clone());
        };

        // Refresh for the definitive self link before joining the group.
        let instance = self
            .compute
            .get_instance(&targets.zone.name, &spec.name)
            .await?;
        debug!(
            instance = %instance.name,
            instance_group = %group,
            self_link = %instance.self_link,
            "adding instance to group"
        );
        let group_op = self
            .compute
            .add_to_instance_group(&targets.zone.name, group, &instance.self_link)
            .await?;

        let group_done = spawn_operation_poller(
            Arc::clone(&self.compute),
            ctx.clone(),
            targets.zone.name.clone(),
            group_op.name,
            "instance group addition",
            self.settings.boot_poll_sleep,
        );
        self.await_operation(ctx, group_done).await?;

        Ok(instance)
    }

    async fn await_operation(
        &self,
        ctx: &JobContext,
        done: oneshot::Receiver<Result<(), GceError>>,
    ) -> Result<(), GceError> {
        let outcome = tokio::select! {
            polled = done => polled.unwrap_or_else(|_| {
                Err(GceError::Transport(String::from("operation poller dropped")))
            }),
            ctx_err = ctx.done() => Err(GceError::Context(ctx_err)),
        };

        if matches!(outcome, Err(GceError::Context(CtxError::DeadlineExceeded))) {
            self.metrics.mark(METRIC_BOOT_TIMEOUT);
        }
        outcome
    }
}
