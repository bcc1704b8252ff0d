//! Scripted doubles and fixtures shared by the backend scenario tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use openssl::rsa::Rsa;
use openssl::symm::Cipher;
use tempfile::TempDir;

use drover::gce::api::{
    AccessConfig, ComputeService, Image, Instance, MachineType, Network, NetworkInterface,
    Operation, OperationError, OperationErrorItem, Zone,
};
use drover::{
    GceError, GceProvider, GceServices, MetricsSink, OutputSink, Provider, ProviderConfig,
    RunResult, ScriptChannel,
};

pub const PASSPHRASE: &str = "winter-moth";
pub const INSERT_OP: &str = "op-insert";
pub const GROUP_OP: &str = "op-group";
pub const DELETE_OP: &str = "op-delete";
pub const NAT_IP: &str = "203.0.113.10";

/// Writes an encrypted RSA key pair into `dir` and returns a configuration
/// with every required option plus fast polling intervals.
pub fn base_config(dir: &TempDir) -> ProviderConfig {
    let rsa = Rsa::generate(2048).unwrap_or_else(|err| panic!("rsa generate: {err}"));
    let key_pem = rsa
        .private_key_to_pem_passphrase(Cipher::aes_128_cbc(), PASSPHRASE.as_bytes())
        .unwrap_or_else(|err| panic!("encrypt key: {err}"));

    let key_path = dir.path().join("id_rsa");
    let pub_path = dir.path().join("id_rsa.pub");
    std::fs::write(&key_path, key_pem).unwrap_or_else(|err| panic!("write key: {err}"));
    std::fs::write(&pub_path, "ssh-rsa AAA worker@host\n")
        .unwrap_or_else(|err| panic!("write pub key: {err}"));

    ProviderConfig::from_pairs([
        ("PROJECT_ID", String::from("ci-project")),
        ("ACCOUNT_JSON", String::from("{\"client_email\": \"x\", \"private_key\": \"y\"}")),
        (
            "SSH_KEY_PATH",
            key_path.to_str().expect("utf8 path").to_owned(),
        ),
        (
            "SSH_PUB_KEY_PATH",
            pub_path.to_str().expect("utf8 path").to_owned(),
        ),
        ("SSH_KEY_PASSPHRASE", String::from(PASSPHRASE)),
        ("BOOT_POLL_SLEEP", String::from("1ms")),
        ("UPLOAD_RETRY_SLEEP", String::from("0s")),
    ])
}

pub fn op(name: &str, status: &str) -> Operation {
    Operation {
        name: name.to_owned(),
        status: status.to_owned(),
        error: None,
    }
}

pub fn failed_op(name: &str, code: &str, location: &str, message: &str) -> Operation {
    Operation {
        name: name.to_owned(),
        status: String::from("DONE"),
        error: Some(OperationError {
            errors: vec![OperationErrorItem {
                code: code.to_owned(),
                location: location.to_owned(),
                message: message.to_owned(),
            }],
        }),
    }
}

#[derive(Default)]
struct ComputeState {
    images: HashMap<String, Vec<Image>>,
    op_polls: HashMap<String, VecDeque<Operation>>,
    inserted: Vec<Instance>,
    deleted: Vec<String>,
    group_adds: Vec<(String, String)>,
}

/// Compute control-plane double with scripted operation polls.
///
/// Operation polls pop from a per-operation queue; an exhausted queue
/// reports `PENDING` forever, which is how boot-timeout scenarios hold an
/// operation open.
#[derive(Default)]
pub struct FakeCompute {
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stock_images(&self, filter: &str, names: &[&str]) {
        let images = names
            .iter()
            .map(|name| Image {
                name: (*name).to_owned(),
                self_link: format!("link/images/{name}"),
            })
            .collect();
        self.lock().images.insert(filter.to_owned(), images);
    }

    pub fn script_operation(&self, name: &str, polls: Vec<Operation>) {
        self.lock().op_polls.insert(name.to_owned(), polls.into());
    }

    pub fn inserted_names(&self) -> Vec<String> {
        self.lock()
            .inserted
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    pub fn group_adds(&self) -> Vec<(String, String)> {
        self.lock().group_adds.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ComputeState> {
        self.state.lock().unwrap_or_else(|err| panic!("state lock: {err}"))
    }

    fn self_link_for(name: &str) -> String {
        format!("link/instances/{name}")
    }
}

#[async_trait]
impl ComputeService for FakeCompute {
    async fn get_zone(&self, zone: &str) -> Result<Zone, GceError> {
        Ok(Zone {
            name: zone.to_owned(),
            self_link: format!("link/zones/{zone}"),
        })
    }

    async fn get_machine_type(&self, zone: &str, name: &str) -> Result<MachineType, GceError> {
        Ok(MachineType {
            name: name.to_owned(),
            self_link: format!("link/zones/{zone}/machineTypes/{name}"),
        })
    }

    async fn get_network(&self, name: &str) -> Result<Network, GceError> {
        Ok(Network {
            name: name.to_owned(),
            self_link: format!("link/networks/{name}"),
        })
    }

    async fn list_images(&self, filter: &str) -> Result<Vec<Image>, GceError> {
        Ok(self.lock().images.get(filter).cloned().unwrap_or_default())
    }

    async fn insert_instance(&self, _zone: &str, spec: &Instance) -> Result<Operation, GceError> {
        self.lock().inserted.push(spec.clone());
        Ok(op(INSERT_OP, "PENDING"))
    }

    async fn get_instance(&self, _zone: &str, name: &str) -> Result<Instance, GceError> {
        let state = self.lock();
        let spec = state
            .inserted
            .iter()
            .find(|spec| spec.name == name)
            .ok_or(GceError::Api {
                status: 404,
                message: format!("instance {name} not found"),
            })?;

        let mut refreshed = spec.clone();
        refreshed.self_link = Self::self_link_for(name);
        refreshed.network_interfaces = vec![NetworkInterface {
            network: String::from("link/networks/default"),
            access_configs: vec![AccessConfig {
                name: String::from("External NAT"),
                config_type: String::from("ONE_TO_ONE_NAT"),
                nat_ip: String::from(NAT_IP),
            }],
        }];
        Ok(refreshed)
    }

    async fn delete_instance(&self, _zone: &str, name: &str) -> Result<Operation, GceError> {
        self.lock().deleted.push(name.to_owned());
        Ok(op(DELETE_OP, "PENDING"))
    }

    async fn add_to_instance_group(
        &self,
        _zone: &str,
        group: &str,
        instance_link: &str,
    ) -> Result<Operation, GceError> {
        self.lock()
            .group_adds
            .push((group.to_owned(), instance_link.to_owned()));
        Ok(op(GROUP_OP, "PENDING"))
    }

    async fn get_zone_operation(&self, _zone: &str, name: &str) -> Result<Operation, GceError> {
        let mut state = self.lock();
        let next = state
            .op_polls
            .get_mut(name)
            .and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| op(name, "PENDING")))
    }
}

#[derive(Default)]
struct ChannelState {
    upload_outcomes: VecDeque<Result<(), GceError>>,
    upload_attempts: u32,
    uploaded_scripts: Vec<Vec<u8>>,
    run_outcome: Option<Result<RunResult, GceError>>,
    run_output: Vec<u8>,
}

/// Script channel double with scripted upload attempts and run outcome.
#[derive(Default)]
pub struct FakeChannel {
    state: Mutex<ChannelState>,
}

impl FakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues attempt outcomes; once exhausted further attempts succeed.
    pub fn script_uploads(&self, outcomes: Vec<Result<(), GceError>>) {
        self.lock().upload_outcomes = outcomes.into();
    }

    pub fn script_run(&self, outcome: Result<RunResult, GceError>, output: &[u8]) {
        let mut state = self.lock();
        state.run_outcome = Some(outcome);
        state.run_output = output.to_vec();
    }

    pub fn upload_attempts(&self) -> u32 {
        self.lock().upload_attempts
    }

    pub fn uploaded_scripts(&self) -> Vec<Vec<u8>> {
        self.lock().uploaded_scripts.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|err| panic!("state lock: {err}"))
    }
}

#[async_trait]
impl ScriptChannel for FakeChannel {
    async fn upload(&self, _ip: &str, script: &[u8]) -> Result<(), GceError> {
        let mut state = self.lock();
        state.upload_attempts += 1;
        let outcome = state.upload_outcomes.pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            state.uploaded_scripts.push(script.to_vec());
        }
        outcome
    }

    async fn run(&self, _ip: &str, output: OutputSink) -> Result<RunResult, GceError> {
        let (outcome, bytes) = {
            let state = self.lock();
            (
                state
                    .run_outcome
                    .clone()
                    .unwrap_or(Ok(RunResult {
                        completed: true,
                        exit_code: 0,
                    })),
                state.run_output.clone(),
            )
        };

        if !bytes.is_empty() {
            let mut sink = output.lock().unwrap_or_else(|err| panic!("sink lock: {err}"));
            sink.write_all(&bytes)
                .unwrap_or_else(|err| panic!("sink write: {err}"));
        }
        outcome
    }
}

/// Metrics sink recording every mark and timer by name.
#[derive(Default)]
pub struct RecordingMetrics {
    marks: Mutex<Vec<String>>,
    timers: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn marks(&self) -> Vec<String> {
        self.marks
            .lock()
            .unwrap_or_else(|err| panic!("marks lock: {err}"))
            .clone()
    }

    pub fn timers(&self) -> Vec<String> {
        self.timers
            .lock()
            .unwrap_or_else(|err| panic!("timers lock: {err}"))
            .clone()
    }
}

impl MetricsSink for RecordingMetrics {
    fn mark(&self, name: &str) {
        self.marks
            .lock()
            .unwrap_or_else(|err| panic!("marks lock: {err}"))
            .push(name.to_owned());
    }

    fn time_since(&self, name: &str, _started: Instant) {
        self.timers
            .lock()
            .unwrap_or_else(|err| panic!("timers lock: {err}"))
            .push(name.to_owned());
    }
}

/// Everything a scenario needs: the provider plus handles to its doubles.
pub struct Harness {
    pub provider: GceProvider,
    pub compute: Arc<FakeCompute>,
    pub channel: Arc<FakeChannel>,
    pub metrics: Arc<RecordingMetrics>,
}

/// Builds a provider around fresh doubles and runs `setup`.
pub async fn ready_harness(cfg: &mut ProviderConfig) -> Harness {
    let compute = FakeCompute::new();
    let channel = FakeChannel::new();
    let metrics = RecordingMetrics::new();

    let mut provider = GceProvider::with_services(
        cfg,
        GceServices {
            compute: compute.clone(),
            channel: channel.clone(),
            metrics: metrics.clone(),
        },
    )
    .unwrap_or_else(|err| panic!("provider construction: {err}"));
    provider
        .setup()
        .await
        .unwrap_or_else(|err| panic!("provider setup: {err}"));

    Harness {
        provider,
        compute,
        channel,
        metrics,
    }
}
