//! SSH/SFTP channel to a booted executor.
//!
//! Each call opens its own session and closes it on every exit path (the
//! ssh2 handles close on drop). Host keys are not verified: instances are
//! single-use and generate their keys at first boot, so there is nothing
//! to pin them against.

use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use async_trait::async_trait;
use ssh2::Session;
use tokio::task;
use tracing::debug;

use crate::backend::{OutputSink, RunResult};

use super::error::GceError;

const SSH_PORT: u16 = 22;
const BUILD_SCRIPT: &str = "build.sh";
const RUN_COMMAND: &str = "bash ~/build.sh";

/// Script transport to one executor, addressed by public IP.
///
/// `upload` performs a single attempt; the retry policy lives with the
/// caller. Both methods are seams for scripted fakes in tests.
#[async_trait]
pub trait ScriptChannel: Send + Sync {
    /// Uploads the build script once, failing with [`GceError::StaleVm`]
    /// when the executor already holds one.
    async fn upload(&self, ip: &str, script: &[u8]) -> Result<(), GceError>;

    /// Runs the uploaded script under a PTY, streaming combined output
    /// into `output`, and reports the remote exit code.
    async fn run(&self, ip: &str, output: OutputSink) -> Result<RunResult, GceError>;
}

/// ssh2-backed [`ScriptChannel`] authenticating with an in-memory key.
#[derive(Clone)]
pub struct Ssh2Channel {
    user: String,
    key_pem: String,
    pub_key: String,
}

impl fmt::Debug for Ssh2Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ssh2Channel")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl Ssh2Channel {
    pub(super) fn new(
        user: impl Into<String>,
        key_pem: impl Into<String>,
        pub_key: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            key_pem: key_pem.into(),
            pub_key: pub_key.into(),
        }
    }

    fn connect(&self, ip: &str) -> Result<Session, GceError> {
        self.connect_to_port(ip, SSH_PORT)
    }

    fn connect_to_port(&self, ip: &str, port: u16) -> Result<Session, GceError> {
        debug!(user = %self.user, ip = %ip, "dialing executor");
        let tcp = TcpStream::connect((ip, port))
            .map_err(|err| GceError::Ssh(format!("connect {ip}:{port}: {err}")))?;

        let mut session =
            Session::new().map_err(|err| GceError::Ssh(format!("session: {err}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| GceError::Ssh(format!("handshake: {err}")))?;

        session
            .userauth_pubkey_memory(&self.user, Some(&self.pub_key), &self.key_pem, None)
            .map_err(|err| GceError::Ssh(format!("public key auth: {err}")))?;
        if !session.authenticated() {
            return Err(GceError::Ssh(String::from("authentication failed")));
        }

        Ok(session)
    }

    fn upload_blocking(&self, ip: &str, script: &[u8]) -> Result<(), GceError> {
        let session = self.connect(ip)?;
        let sftp = session
            .sftp()
            .map_err(|err| GceError::Ssh(format!("sftp: {err}")))?;

        // The stale check must precede any write so a reused VM is detected
        // without clobbering its previous script.
        if sftp.lstat(Path::new(BUILD_SCRIPT)).is_ok() {
            return Err(GceError::StaleVm);
        }

        let mut file = sftp
            .create(Path::new(BUILD_SCRIPT))
            .map_err(|err| GceError::Ssh(format!("create {BUILD_SCRIPT}: {err}")))?;
        file.write_all(script)
            .map_err(|err| GceError::Ssh(format!("write {BUILD_SCRIPT}: {err}")))?;
        Ok(())
    }

    fn run_blocking(&self, ip: &str, output: &OutputSink) -> Result<RunResult, GceError> {
        let session = self.connect(ip)?;
        let mut channel = session
            .channel_session()
            .map_err(|err| GceError::Ssh(format!("session channel: {err}")))?;
        channel
            .request_pty("xterm", None, Some((80, 40, 0, 0)))
            .map_err(|err| GceError::Ssh(format!("pty: {err}")))?;
        channel
            .exec(RUN_COMMAND)
            .map_err(|err| GceError::Ssh(format!("exec: {err}")))?;

        forward(&mut channel.stream(0), output)?;
        forward(&mut channel.stderr(), output)?;

        channel
            .wait_close()
            .map_err(|err| GceError::Ssh(format!("wait close: {err}")))?;
        let status = channel
            .exit_status()
            .map_err(|err| GceError::Ssh(format!("exit status: {err}")))?;

        Ok(RunResult {
            completed: true,
            exit_code: status as u8,
        })
    }
}

fn forward(reader: &mut impl Read, output: &OutputSink) -> Result<(), GceError> {
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| GceError::Ssh(format!("read output: {err}")))?;
        if read == 0 {
            return Ok(());
        }
        let mut sink = output
            .lock()
            .map_err(|_| GceError::Ssh(String::from("output sink poisoned")))?;
        sink.write_all(&buffer[..read])
            .map_err(|err| GceError::Ssh(format!("write output: {err}")))?;
    }
}

#[async_trait]
impl ScriptChannel for Ssh2Channel {
    async fn upload(&self, ip: &str, script: &[u8]) -> Result<(), GceError> {
        let channel = self.clone();
        let ip = ip.to_owned();
        let script = script.to_vec();
        task::spawn_blocking(move || channel.upload_blocking(&ip, &script))
            .await
            .map_err(|err| GceError::Ssh(format!("upload task: {err}")))?
    }

    async fn run(&self, ip: &str, output: OutputSink) -> Result<RunResult, GceError> {
        let channel = self.clone();
        let ip = ip.to_owned();
        task::spawn_blocking(move || channel.run_blocking(&ip, &output))
            .await
            .map_err(|err| GceError::Ssh(format!("run task: {err}")))?
    }
}
