//! Telnet transport.
//!
//! Serial consoles are reached through a terminal server's telnet port, so
//! this also covers the console path. Option negotiation is answered inline
//! and stripped from the byte stream handed to the session.

use super::transport::{Endpoint, Transport};
use crate::errors::SessionError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Data,
    Iac,
    /// Saw IAC followed by WILL/WONT/DO/DONT; next byte is the option.
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Incremental IAC filter. Keeps state across reads so a command split
/// over two TCP segments is still recognised.
#[derive(Debug, Default)]
pub struct TelnetCodec {
    state: State,
}

impl TelnetCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the data bytes of `input` to `out` and any negotiation
    /// replies to `replies`.
    pub fn decode(&mut self, input: &[u8], out: &mut Vec<u8>, replies: &mut Vec<u8>) {
        let mut i = 0;
        while i < input.len() {
            if self.state == State::Data {
                let rest = &input[i..];
                match memchr::memchr(IAC, rest) {
                    Some(pos) => {
                        push_data(out, &rest[..pos]);
                        self.state = State::Iac;
                        i += pos + 1;
                    }
                    None => {
                        push_data(out, rest);
                        i = input.len();
                    }
                }
                continue;
            }

            let byte = input[i];
            i += 1;
            self.state = match self.state {
                State::Data => State::Data,
                State::Iac => match byte {
                    IAC => {
                        out.push(IAC);
                        State::Data
                    }
                    WILL | WONT | DO | DONT => State::Negotiate(byte),
                    SB => State::Sub,
                    // NOP, GA, and friends carry no data.
                    _ => State::Data,
                },
                State::Negotiate(command) => {
                    if let Some(reply) = negotiate(command, byte) {
                        trace!(command, option = byte, reply = reply[1], "telnet negotiation");
                        replies.extend_from_slice(&reply);
                    }
                    State::Data
                }
                State::Sub => match byte {
                    IAC => State::SubIac,
                    _ => State::Sub,
                },
                State::SubIac => match byte {
                    SE => State::Data,
                    _ => State::Sub,
                },
            };
        }
    }

    /// Escape literal 0xFF bytes for sending.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut rest = data;
        while let Some(pos) = memchr::memchr(IAC, rest) {
            out.extend_from_slice(&rest[..=pos]);
            out.push(IAC);
            rest = &rest[pos + 1..];
        }
        out.extend_from_slice(rest);
        out
    }
}

/// Data bytes minus the NUL that telnet pads after a bare CR.
fn push_data(out: &mut Vec<u8>, data: &[u8]) {
    out.extend(data.iter().copied().filter(|&b| b != 0));
}

fn negotiate(command: u8, option: u8) -> Option<[u8; 3]> {
    match command {
        DO if option == OPT_SGA => Some([IAC, WILL, option]),
        DO => Some([IAC, WONT, option]),
        WILL if option == OPT_ECHO || option == OPT_SGA => Some([IAC, DO, option]),
        WILL => Some([IAC, DONT, option]),
        // Acknowledging WONT/DONT can loop with some servers.
        _ => None,
    }
}

pub struct TelnetTransport {
    stream: TcpStream,
    codec: TelnetCodec,
    endpoint: String,
    open: bool,
}

impl TelnetTransport {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, SessionError> {
        let name = endpoint.to_string();
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| SessionError::Connection {
            endpoint: name.clone(),
            attempts: 1,
            reason: format!("tcp connect timed out after {CONNECT_TIMEOUT:?}"),
        })?
        .map_err(|e| SessionError::Connection {
            endpoint: name.clone(),
            attempts: 1,
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true).ok();
        debug!(endpoint = %name, "telnet connected");

        Ok(Self {
            stream,
            codec: TelnetCodec::new(),
            endpoint: name,
            open: true,
        })
    }

    fn lost(&mut self, reason: impl Into<String>) -> SessionError {
        self.open = false;
        SessionError::Disconnected {
            endpoint: self.endpoint.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.open {
            return Err(SessionError::NotConnected {
                endpoint: self.endpoint.clone(),
            });
        }
        let encoded = TelnetCodec::encode(data);
        if let Err(e) = self.stream.write_all(&encoded).await {
            return Err(self.lost(e.to_string()));
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut raw = [0u8; READ_CHUNK];
        loop {
            let n = match self.stream.read(&mut raw).await {
                Ok(0) => return Err(self.lost("connection closed by peer")),
                Ok(n) => n,
                Err(e) => return Err(self.lost(e.to_string())),
            };

            let mut data = Vec::with_capacity(n);
            let mut replies = Vec::new();
            self.codec.decode(&raw[..n], &mut data, &mut replies);

            if !replies.is_empty()
                && let Err(e) = self.stream.write_all(&replies).await
            {
                return Err(self.lost(e.to_string()));
            }
            if !data.is_empty() {
                return Ok(data);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.open {
            self.open = false;
            self.stream.shutdown().await.ok();
        }
        Ok(())
    }

    fn line_ending(&self) -> &'static str {
        "\r\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(codec: &mut TelnetCodec, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut replies = Vec::new();
        codec.decode(input, &mut out, &mut replies);
        (out, replies)
    }

    #[test]
    fn test_plain_data_passes_through() {
        let mut codec = TelnetCodec::new();
        let (out, replies) = decode(&mut codec, b"controller-0 login: ");
        assert_eq!(out, b"controller-0 login: ");
        assert!(replies.is_empty());
    }

    #[test]
    fn test_negotiation_replies() {
        let mut codec = TelnetCodec::new();
        let input = [
            IAC, DO, 24, // terminal type: refuse
            IAC, DO, OPT_SGA, // accept
            IAC, WILL, OPT_ECHO, // accept
            IAC, WILL, 31, // window size from server: refuse
            b'o', b'k',
        ];
        let (out, replies) = decode(&mut codec, &input);
        assert_eq!(out, b"ok");
        assert_eq!(
            replies,
            vec![
                IAC, WONT, 24, IAC, WILL, OPT_SGA, IAC, DO, OPT_ECHO, IAC, DONT, 31
            ]
        );
    }

    #[test]
    fn test_escaped_iac_and_subnegotiation() {
        let mut codec = TelnetCodec::new();
        let input = [b'a', IAC, IAC, IAC, SB, 24, 1, IAC, SE, b'b'];
        let (out, replies) = decode(&mut codec, &input);
        assert_eq!(out, vec![b'a', IAC, b'b']);
        assert!(replies.is_empty());
    }

    #[test]
    fn test_command_split_across_reads() {
        let mut codec = TelnetCodec::new();
        let (out1, r1) = decode(&mut codec, &[b'x', IAC]);
        let (out2, r2) = decode(&mut codec, &[DO]);
        let (out3, r3) = decode(&mut codec, &[OPT_ECHO, b'y']);
        assert_eq!(out1, b"x");
        assert!(r1.is_empty() && r2.is_empty() && out2.is_empty());
        assert_eq!(out3, b"y");
        assert_eq!(r3, vec![IAC, WONT, OPT_ECHO]);
    }

    #[test]
    fn test_nul_after_cr_is_dropped() {
        let mut codec = TelnetCodec::new();
        let (out, _) = decode(&mut codec, b"line\r\0next");
        assert_eq!(out, b"line\rnext");
    }

    #[test]
    fn test_encode_escapes_iac() {
        assert_eq!(TelnetCodec::encode(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
        assert_eq!(TelnetCodec::encode(b"ls\r\n"), b"ls\r\n");
    }

    #[tokio::test]
    async fn test_transport_over_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(&[IAC, DO, 24]).await.unwrap();
            sock.write_all(b"login: ").await.unwrap();
            let mut reply = [0u8; 3];
            sock.read_exact(&mut reply).await.unwrap();
            let mut line = [0u8; 7];
            sock.read_exact(&mut line).await.unwrap();
            (reply, line)
        });

        let mut transport = TelnetTransport::connect(&Endpoint::telnet("127.0.0.1", port))
            .await
            .unwrap();
        let data = transport.read().await.unwrap();
        assert_eq!(data, b"login: ");
        transport.write(b"admin\r\n").await.unwrap();

        let (reply, line) = server.await.unwrap();
        assert_eq!(reply, [IAC, WONT, 24]);
        assert_eq!(&line, b"admin\r\n");
        assert_eq!(transport.line_ending(), "\r\n");
    }
}
