//! Script upload and execution scenarios.

mod common;

use std::time::Duration;

use tempfile::TempDir;

use common::{Harness, INSERT_OP, op, ready_harness};
use drover::{
    CtxError, GceError, GceInstance, Instance, JobContext, Provider, RunResult, StartAttributes,
    buffer_sink,
};

const MINIMAL_FILTER: &str = "name eq ^travis-ci-minimal.+";
const SCRIPT: &[u8] = b"#!/bin/bash\necho hello\n";

async fn booted_instance(harness: &Harness) -> GceInstance {
    harness
        .compute
        .stock_images(MINIMAL_FILTER, &["travis-ci-minimal-20150101"]);
    harness
        .compute
        .script_operation(INSERT_OP, vec![op(INSERT_OP, "DONE")]);

    let attrs = StartAttributes {
        language: String::from("minimal"),
        ..StartAttributes::default()
    };
    harness
        .provider
        .start(&JobContext::background(), &attrs)
        .await
        .unwrap_or_else(|err| panic!("start: {err}"))
}

#[tokio::test]
async fn upload_succeeds_first_try_and_run_streams_output() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    instance
        .upload_script(&JobContext::background(), SCRIPT)
        .await
        .unwrap_or_else(|err| panic!("upload: {err}"));
    assert_eq!(harness.channel.upload_attempts(), 1);
    assert_eq!(harness.channel.uploaded_scripts(), vec![SCRIPT.to_vec()]);

    harness.channel.script_run(
        Ok(RunResult {
            completed: true,
            exit_code: 0,
        }),
        b"Hello from the VM\n",
    );
    let (sink, buffer) = buffer_sink();
    let result = instance
        .run_script(&JobContext::background(), sink)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(
        result,
        RunResult {
            completed: true,
            exit_code: 0
        }
    );
    let output = buffer.lock().unwrap_or_else(|err| panic!("buffer: {err}"));
    assert_eq!(output.as_slice(), b"Hello from the VM\n");
}

#[tokio::test]
async fn stale_vm_surfaces_the_sentinel_without_retry_or_write() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    cfg.set("UPLOAD_RETRIES", "5");
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness.channel.script_uploads(vec![Err(GceError::StaleVm)]);
    let err = instance
        .upload_script(&JobContext::background(), SCRIPT)
        .await
        .expect_err("stale VM should surface");

    assert_eq!(err, GceError::StaleVm);
    assert_eq!(harness.channel.upload_attempts(), 1, "stale is never retried");
    assert!(harness.channel.uploaded_scripts().is_empty(), "no write");
}

#[tokio::test]
async fn transient_upload_errors_are_retried_until_success() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    cfg.set("UPLOAD_RETRIES", "2");
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness.channel.script_uploads(vec![
        Err(GceError::Ssh(String::from("connection reset"))),
        Err(GceError::Ssh(String::from("connection reset"))),
        Ok(()),
    ]);

    instance
        .upload_script(&JobContext::background(), SCRIPT)
        .await
        .unwrap_or_else(|err| panic!("upload should recover: {err}"));
    assert_eq!(harness.channel.upload_attempts(), 3);
}

#[tokio::test]
async fn upload_retry_budget_is_retries_plus_one_attempts() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    cfg.set("UPLOAD_RETRIES", "3");
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness.channel.script_uploads(vec![
        Err(GceError::Ssh(String::from("boom"))),
        Err(GceError::Ssh(String::from("boom"))),
        Err(GceError::Ssh(String::from("boom"))),
        Err(GceError::Ssh(String::from("boom"))),
        Ok(()),
    ]);

    let err = instance
        .upload_script(&JobContext::background(), SCRIPT)
        .await
        .expect_err("upload should exhaust its retries");

    assert_eq!(err, GceError::Ssh(String::from("boom")));
    assert_eq!(harness.channel.upload_attempts(), 4);
}

#[tokio::test]
async fn upload_respects_context_cancellation() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    cfg.set("UPLOAD_RETRY_SLEEP", "10s");
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness
        .channel
        .script_uploads(vec![Err(GceError::Ssh(String::from("not up yet")))]);

    let (ctx, handle) = JobContext::cancellable(None);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
    });

    let err = instance
        .upload_script(&ctx, SCRIPT)
        .await
        .expect_err("cancelled upload should stop");
    assert_eq!(err, GceError::Context(CtxError::Cancelled));
}

#[tokio::test]
async fn remote_exit_code_is_reported_as_a_completed_run() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness.channel.script_run(
        Ok(RunResult {
            completed: true,
            exit_code: 7,
        }),
        b"",
    );
    let (sink, _buffer) = buffer_sink();
    let result = instance
        .run_script(&JobContext::background(), sink)
        .await
        .unwrap_or_else(|err| panic!("run: {err}"));

    assert_eq!(
        result,
        RunResult {
            completed: true,
            exit_code: 7
        }
    );
}

#[tokio::test]
async fn transport_failure_during_run_is_an_unknown_outcome() {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let mut cfg = common::base_config(&dir);
    let harness = ready_harness(&mut cfg).await;
    let instance = booted_instance(&harness).await;

    harness
        .channel
        .script_run(Err(GceError::Ssh(String::from("connection refused"))), b"");
    let (sink, _buffer) = buffer_sink();
    let err = instance
        .run_script(&JobContext::background(), sink)
        .await
        .expect_err("dial failure should surface");

    assert_eq!(err, GceError::Ssh(String::from("connection refused")));
}
