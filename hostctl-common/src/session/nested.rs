//! Sessions hopped through another session's shell.
//!
//! Hosts that are only reachable from the active controller are opened by
//! running `ssh` inside the controller's shell. [`NestedConnector`] starts
//! that hop over a parent [`Session`] and returns a transport that reads
//! and writes through the parent's stream, so the nested session logs in,
//! matches prompts and runs commands like any other.
//!
//! The ssh command is followed by `echo <marker>`, so the parent shell
//! prints a unique line once the hop ends for any reason. Seeing it turns
//! the nested transport into a closed one.

use super::{Connector, Credentials, Endpoint, Session, SessionOptions, Transport, compile};
use crate::errors::SessionError;
use async_trait::async_trait;
use regex::bytes::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Recent output kept to spot the end marker across chunk boundaries.
const SCAN_WINDOW: usize = 256;

/// How long a Ctrl-C gets to end a hop stuck before its shell.
const INTERRUPT_WINDOW: Duration = Duration::from_secs(2);

/// How long `exit` gets to end a logged-in hop.
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);

const MARKER_PREFIX: &str = "hostctl-hop-closed-";

/// Opens ssh hops from a shared parent session.
///
/// The parent is locked for every read and write of the hop, and is left
/// at its own prompt again when the hop closes.
pub struct NestedConnector {
    parent: Arc<Mutex<Session>>,
    ssh_options: Vec<String>,
}

impl NestedConnector {
    pub fn new(parent: Arc<Mutex<Session>>) -> Self {
        Self {
            parent,
            ssh_options: vec![
                "-o StrictHostKeyChecking=no".to_string(),
                "-o UserKnownHostsFile=/dev/null".to_string(),
            ],
        }
    }

    /// Extra options placed before the destination on the ssh line.
    #[must_use]
    pub fn with_ssh_option(mut self, option: impl Into<String>) -> Self {
        self.ssh_options.push(option.into());
        self
    }

    pub fn parent(&self) -> &Arc<Mutex<Session>> {
        &self.parent
    }

    fn ssh_line(&self, endpoint: &Endpoint, credentials: &Credentials, marker: &str) -> String {
        let mut line = String::from("ssh");
        for option in &self.ssh_options {
            line.push(' ');
            line.push_str(option);
        }
        if endpoint.port != 0 && endpoint.port != 22 {
            line.push_str(&format!(" -p {}", endpoint.port));
        }
        if let Some(identity) = &credentials.identity_file {
            line.push_str(&format!(" -i {}", identity.display()));
        }
        if credentials.user.is_empty() {
            line.push_str(&format!(" {}", endpoint.host));
        } else {
            line.push_str(&format!(" {}@{}", credentials.user, endpoint.host));
        }
        line.push_str(&format!("; echo {marker}"));
        line
    }
}

#[async_trait]
impl Connector for NestedConnector {
    async fn open(&self, endpoint: &Endpoint, credentials: &Credentials) -> Result<Box<dyn Transport>, SessionError> {
        let marker = format!("{MARKER_PREFIX}{}", fastrand::u32(..));
        let end = compile(&format!(r"(?m)^{}\r?$", regex::escape(&marker)))?;
        let line = self.ssh_line(endpoint, credentials, &marker);

        let mut parent = self.parent.lock().await;
        if !parent.is_connected() {
            return Err(SessionError::NotConnected {
                endpoint: parent.endpoint().to_string(),
            });
        }
        parent.settle();
        parent.send(&line).await?;
        let line_ending = parent.line_ending();
        info!(via = %parent.endpoint(), endpoint = %endpoint, "ssh hop started");
        drop(parent);

        Ok(Box::new(NestedTransport {
            parent: self.parent.clone(),
            endpoint: endpoint.to_string(),
            end,
            scan: Vec::new(),
            ended: false,
            closed: false,
            line_ending,
        }))
    }
}

/// Byte stream of an ssh hop, carried by the parent session.
pub struct NestedTransport {
    parent: Arc<Mutex<Session>>,
    endpoint: String,
    end: Regex,
    scan: Vec<u8>,
    ended: bool,
    closed: bool,
    line_ending: &'static str,
}

impl NestedTransport {
    fn note_output(&mut self, chunk: &[u8]) {
        self.scan.extend_from_slice(chunk);
        if self.end.is_match(&self.scan) {
            debug!(endpoint = %self.endpoint, "ssh hop ended");
            self.ended = true;
        }
        if self.scan.len() > SCAN_WINDOW {
            let cut = self.scan.len() - SCAN_WINDOW;
            self.scan.drain(..cut);
        }
    }

    fn gone(&self) -> SessionError {
        SessionError::Disconnected {
            endpoint: self.endpoint.clone(),
            reason: "ssh hop ended".to_string(),
        }
    }
}

#[async_trait]
impl Transport for NestedTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(self.gone());
        }
        self.parent.lock().await.write_raw(data).await
    }

    async fn read(&mut self) -> Result<Vec<u8>, SessionError> {
        if !self.is_open() {
            return Err(self.gone());
        }
        let chunk = self.parent.lock().await.read_chunk().await?;
        self.note_output(&chunk);
        Ok(chunk)
    }

    fn is_open(&self) -> bool {
        !self.ended && !self.closed
    }

    /// End the hop and leave the parent at its own prompt.
    ///
    /// Ctrl-C ends an ssh still waiting on its password prompt; a logged-in
    /// hop is left with `exit`.
    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut parent = self.parent.lock().await;
        if !self.ended {
            let end = [self.end.clone()];
            parent.send_control('c').await?;
            if parent.expect_compiled(&end, INTERRUPT_WINDOW).await.is_err() {
                parent.write_line("exit").await?;
                parent.expect_compiled(&end, EXIT_TIMEOUT).await?;
            }
            self.ended = true;
            let _ = parent.expect_prompt(INTERRUPT_WINDOW).await;
        }
        parent.settle();
        info!(endpoint = %self.endpoint, "ssh hop closed");
        Ok(())
    }

    fn line_ending(&self) -> &'static str {
        self.line_ending
    }
}

impl Session {
    /// Open a session to `host` by running ssh in `parent`'s shell.
    pub async fn open_nested(
        parent: Arc<Mutex<Session>>,
        host: &str,
        credentials: Credentials,
        prompt: &str,
        options: SessionOptions,
    ) -> Result<Session, SessionError> {
        let connector = Arc::new(NestedConnector::new(parent));
        Session::open(Endpoint::ssh(host), credentials, prompt, connector, options).await
    }
}
