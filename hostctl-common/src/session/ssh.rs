//! SSH transport over the system OpenSSH client.
//!
//! Authentication is key or agent based through the control master; the
//! credentials' password is only ever typed into in-shell prompts (sudo and
//! the like). The remote side runs an interactive bash with stderr merged
//! into stdout so the prompt arrives on the one stream we read.

use super::transport::{Credentials, Endpoint, Transport};
use crate::errors::SessionError;
use async_trait::async_trait;
use openssh::{KnownHosts, SessionBuilder, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;
const REMOTE_SHELL: &str = "bash -i 2>&1";

pub struct SshTransport {
    session: Option<Arc<openssh::Session>>,
    child: Option<openssh::Child<Arc<openssh::Session>>>,
    stdin: Option<openssh::ChildStdin>,
    stdout: Option<openssh::ChildStdout>,
    endpoint: String,
}

impl SshTransport {
    pub async fn connect(endpoint: &Endpoint, credentials: &Credentials) -> Result<Self, SessionError> {
        let name = endpoint.to_string();
        let mut builder = SessionBuilder::default();
        builder
            .user(credentials.user.clone())
            .port(endpoint.port)
            .known_hosts_check(KnownHosts::Accept)
            .connect_timeout(CONNECT_TIMEOUT);
        if let Some(key) = &credentials.identity_file {
            builder.keyfile(key);
        }

        let session = builder
            .connect(&endpoint.host)
            .await
            .map_err(|e| classify(&name, &credentials.user, e))?;
        let session = Arc::new(session);

        let mut child = session
            .clone()
            .arc_command("exec")
            .raw_arg(REMOTE_SHELL)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .await
            .map_err(|e| SessionError::Connection {
                endpoint: name.clone(),
                attempts: 1,
                reason: format!("failed to start remote shell: {e}"),
            })?;

        let stdin = child.stdin().take();
        let stdout = child.stdout().take();
        debug!(endpoint = %name, user = %credentials.user, "ssh shell started");

        Ok(Self {
            session: Some(session),
            child: Some(child),
            stdin,
            stdout,
            endpoint: name,
        })
    }

    fn lost(&mut self, reason: impl Into<String>) -> SessionError {
        self.stdin = None;
        self.stdout = None;
        SessionError::Disconnected {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }

    fn not_connected(&self) -> SessionError {
        SessionError::NotConnected {
            endpoint: self.endpoint.clone(),
        }
    }
}

fn classify(endpoint: &str, user: &str, err: openssh::Error) -> SessionError {
    let reason = err.to_string();
    if reason.contains("Permission denied") {
        SessionError::AuthenticationDenied {
            endpoint: endpoint.to_string(),
            user: user.to_string(),
        }
    } else {
        SessionError::Connection {
            endpoint: endpoint.to_string(),
            attempts: 1,
            reason,
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(self.not_connected());
        };
        let result = async {
            stdin.write_all(data).await?;
            stdin.flush().await
        }
        .await;
        result.map_err(|e| self.lost(e.to_string()))
    }

    async fn read(&mut self) -> Result<Vec<u8>, SessionError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(self.not_connected());
        };
        let mut buf = vec![0u8; READ_CHUNK];
        match stdout.read(&mut buf).await {
            Ok(0) => Err(self.lost("remote shell exited")),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(self.lost(e.to_string())),
        }
    }

    fn is_open(&self) -> bool {
        self.stdin.is_some() && self.stdout.is_some()
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.stdin = None;
        self.stdout = None;
        if let Some(child) = self.child.take()
            && tokio::time::timeout(CLOSE_TIMEOUT, child.wait()).await.is_err()
        {
            warn!(endpoint = %self.endpoint, "remote shell did not exit after stdin closed");
        }
        if let Some(session) = self.session.take() {
            match Arc::try_unwrap(session) {
                Ok(session) => {
                    if let Err(e) = session.close().await {
                        debug!(endpoint = %self.endpoint, error = %e, "ssh master close failed");
                    }
                }
                Err(_) => debug!(endpoint = %self.endpoint, "ssh master still shared; dropping"),
            }
        }
        Ok(())
    }
}
