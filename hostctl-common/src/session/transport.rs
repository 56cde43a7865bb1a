//! Transport abstraction under a [`Session`](super::Session).
//!
//! A transport is a raw bidirectional byte stream. It knows nothing about
//! prompts or commands; the session layers pattern matching on top.

use crate::errors::SessionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// How an endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Telnet, including serial consoles behind a terminal server.
    Telnet,
    #[default]
    Ssh,
    /// In-process scripted shell, for tests.
    Mock,
}

impl TransportKind {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Telnet => 23,
            Self::Ssh => 22,
            Self::Mock => 0,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Telnet => write!(f, "telnet"),
            Self::Ssh => write!(f, "ssh"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telnet" | "serial" | "console" => Ok(Self::Telnet),
            "ssh" => Ok(Self::Ssh),
            "mock" => Ok(Self::Mock),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Network address of a session endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub kind: TransportKind,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: TransportKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
        }
    }

    pub fn telnet(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, TransportKind::Telnet)
    }

    pub fn ssh(host: impl Into<String>) -> Self {
        Self::new(host, TransportKind::Ssh.default_port(), TransportKind::Ssh)
    }

    pub fn mock(name: impl Into<String>) -> Self {
        Self::new(name, 0, TransportKind::Mock)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.kind, self.host, self.port)
    }
}

/// Login credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// SSH private key. When unset the ssh agent and default keys are used.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            identity_file: None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// A raw byte stream to a remote shell.
#[async_trait]
pub trait Transport: Send {
    /// Write all of `data`.
    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Wait for the next chunk of output.
    ///
    /// Must be cancel safe: the session wraps it in a timeout. End of stream
    /// is reported as [`SessionError::Disconnected`], never as an empty chunk.
    async fn read(&mut self) -> Result<Vec<u8>, SessionError>;

    fn is_open(&self) -> bool;

    async fn close(&mut self) -> Result<(), SessionError>;

    /// Line terminator appended by [`Session::send`](super::Session::send).
    fn line_ending(&self) -> &'static str {
        "\n"
    }
}

/// Opens fresh transports. Called on every connect and reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>, SessionError>;
}

/// Connector for real labs: dispatches on [`TransportKind`].
#[derive(Debug, Clone, Default)]
pub struct NetworkConnector;

#[async_trait]
impl Connector for NetworkConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Transport>, SessionError> {
        match endpoint.kind {
            TransportKind::Telnet => {
                let transport = super::telnet::TelnetTransport::connect(endpoint).await?;
                Ok(Box::new(transport))
            }
            #[cfg(unix)]
            TransportKind::Ssh => {
                let transport = super::ssh::SshTransport::connect(endpoint, credentials).await?;
                Ok(Box::new(transport))
            }
            #[cfg(not(unix))]
            TransportKind::Ssh => {
                let _ = credentials;
                Err(SessionError::Connection {
                    endpoint: endpoint.to_string(),
                    attempts: 1,
                    reason: "ssh transport requires a unix host".to_string(),
                })
            }
            TransportKind::Mock => Err(SessionError::Connection {
                endpoint: endpoint.to_string(),
                attempts: 1,
                reason: "mock endpoints are only reachable through a MockConnector".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("SSH".parse::<TransportKind>().unwrap(), TransportKind::Ssh);
        assert_eq!("serial".parse::<TransportKind>().unwrap(), TransportKind::Telnet);
        assert!("rlogin".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials::new("sysadmin", "Li69nux*");
        let debug = format!("{creds:?}");
        assert!(debug.contains("sysadmin"));
        assert!(!debug.contains("Li69nux"));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(
            Endpoint::telnet("128.224.150.1", 2011).to_string(),
            "telnet://128.224.150.1:2011"
        );
        assert_eq!(Endpoint::ssh("lab").port, 22);
    }

    #[tokio::test]
    async fn test_network_connector_refuses_mock_endpoint() {
        let result = NetworkConnector
            .open(&Endpoint::mock("lab"), &Credentials::default())
            .await;
        assert!(matches!(result, Err(SessionError::Connection { .. })));
    }
}
