//! Pattern-matching terminal session.
//!
//! A [`Session`] owns one character stream to a remote shell and cycles
//! strictly request/response over it: `send` writes one line, `expect`
//! suspends until one of a list of regexes matches the accumulated output.
//! Every I/O method takes `&mut self`, so one task drives a session at a
//! time and there is never more than one command in flight.
//!
//! Transport failures are fatal to the session and always propagate. The
//! caller decides whether to [`reconnect`](Session::reconnect) or abort.

mod buffer;
mod nested;
mod retry;
#[cfg(unix)]
pub mod ssh;
pub mod telnet;
mod transport;

pub use buffer::{BufferMatch, ExpectBuffer, MAX_PENDING};
pub use nested::{NestedConnector, NestedTransport};
pub use retry::RetryPolicy;
pub use transport::{Connector, Credentials, Endpoint, NetworkConnector, Transport, TransportKind};

use crate::errors::SessionError;
use crate::util::mask_sensitive_command;
use regex::bytes::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Output tail kept in timeout errors.
const TAIL_BYTES: usize = 512;

/// Window used to swallow output after an interrupted command.
const FLUSH_WINDOW: Duration = Duration::from_secs(2);

/// Password answers given to one sudo before it is interrupted.
const SUDO_ATTEMPTS: u32 = 3;

/// Tunables for a [`Session`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Connect retry policy used by [`Session::connect`].
    pub retry: RetryPolicy,
    /// Budget for one login handshake.
    pub login_timeout: Duration,
    /// Default timeout for [`Session::exec`] callers that have no better value.
    pub command_timeout: Duration,
    /// How long the echo probe waits for an answer.
    pub probe_timeout: Duration,
    pub login_pattern: String,
    pub password_pattern: String,
    pub denied_pattern: String,
    /// Password prompt printed by `sudo`.
    pub sudo_pattern: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            login_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            login_pattern: r"[Ll]ogin:\s*$".to_string(),
            password_pattern: r"[Pp]assword:\s*$".to_string(),
            denied_pattern: r"[Pp]ermission denied|Login incorrect".to_string(),
            sudo_pattern: r"\[sudo\] password for [^:\r\n]*:\s*$|[Pp]assword:\s*$".to_string(),
        }
    }
}

/// Result of a successful [`Session::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Index of the matching pattern.
    pub index: usize,
    /// Output between the previous consumed boundary and the match.
    pub before: String,
    /// The matched text.
    pub matched: String,
}

/// Output and exit status of one shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Output lines with surrounding whitespace trimmed, blanks skipped.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Polling parameters for [`Session::wait_for_output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputWait {
    pub timeout: Duration,
    pub check_interval: Duration,
    /// Wait for the pattern to disappear rather than appear.
    pub absent: bool,
    /// How long the condition must keep holding before it counts.
    pub stay_for: Duration,
}

impl OutputWait {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            check_interval: Duration::from_secs(5),
            absent: false,
            stay_for: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub fn absent(mut self, absent: bool) -> Self {
        self.absent = absent;
        self
    }

    #[must_use]
    pub fn stay_for(mut self, duration: Duration) -> Self {
        self.stay_for = duration;
        self
    }
}

pub struct Session {
    endpoint: Endpoint,
    credentials: Credentials,
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    transport: Option<Box<dyn Transport>>,
    initial_prompt: Regex,
    prompt: Regex,
    buffer: ExpectBuffer,
    last_match: Option<ExpectMatch>,
    in_flight: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoint", &self.endpoint)
            .field("credentials", &self.credentials)
            .field("prompt", &self.prompt.as_str())
            .field("connected", &self.is_connected())
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

fn compile(pattern: &str) -> Result<Regex, SessionError> {
    Regex::new(pattern).map_err(|source| SessionError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

impl Session {
    /// Create a disconnected session. Validates `initial_prompt`.
    pub fn new(
        endpoint: Endpoint,
        credentials: Credentials,
        initial_prompt: &str,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SessionError> {
        let prompt = compile(initial_prompt)?;
        Ok(Self {
            endpoint,
            credentials,
            connector,
            options: SessionOptions::default(),
            transport: None,
            initial_prompt: prompt.clone(),
            prompt,
            buffer: ExpectBuffer::new(),
            last_match: None,
            in_flight: false,
        })
    }

    #[must_use]
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Create and connect in one step.
    pub async fn open(
        endpoint: Endpoint,
        credentials: Credentials,
        initial_prompt: &str,
        connector: Arc<dyn Connector>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(endpoint, credentials, initial_prompt, connector)?.with_options(options);
        session.connect().await?;
        Ok(session)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    /// Whether a command was sent and its prompt not yet seen.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_str()
    }

    pub fn initial_prompt(&self) -> &str {
        self.initial_prompt.as_str()
    }

    /// The most recent successful `expect`, cleared by every `send`.
    pub fn last_match(&self) -> Option<&ExpectMatch> {
        self.last_match.as_ref()
    }

    // ── Connection ─────────────────────────────────────────────────────────

    /// Establish the transport and log in, retrying per `options.retry`.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let policy = self.options.retry.clone();
        self.connect_with(&policy).await
    }

    async fn connect_with(&mut self, policy: &RetryPolicy) -> Result<(), SessionError> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(endpoint = %self.endpoint, attempt, "connecting");

            let err = match self.connect_once().await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint, attempt, prompt = %self.prompt, "session established");
                    return Ok(());
                }
                Err(err @ SessionError::AuthenticationDenied { .. }) => {
                    self.drop_transport().await;
                    return Err(err);
                }
                Err(err) => err,
            };
            self.drop_transport().await;

            let delay = policy.backoff_delay(attempt);
            if !policy.should_retry(attempt, start.elapsed(), delay) {
                warn!(endpoint = %self.endpoint, attempt, error = %err, "giving up on connect");
                return Err(SessionError::Connection {
                    endpoint: self.endpoint.to_string(),
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }
            warn!(
                endpoint = %self.endpoint,
                attempt,
                error = %err,
                delay_secs = delay.as_secs_f64(),
                "connect failed; retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(&mut self) -> Result<(), SessionError> {
        let transport = self.connector.open(&self.endpoint, &self.credentials).await?;
        self.transport = Some(transport);
        self.buffer.clear();
        self.last_match = None;
        self.in_flight = false;
        self.login().await
    }

    /// Answer login and password prompts until the shell prompt shows.
    async fn login(&mut self) -> Result<(), SessionError> {
        let patterns = [
            self.prompt.clone(),
            compile(&self.options.login_pattern)?,
            compile(&self.options.password_pattern)?,
            compile(&self.options.denied_pattern)?,
        ];
        let deadline = Instant::now() + self.options.login_timeout;
        let mut nudged = false;
        let mut password_sent = false;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.expect_compiled(&patterns, remaining).await {
                Ok(0) => return Ok(()),
                Ok(1) if password_sent => return Err(self.denied()),
                Ok(1) => {
                    let user = self.credentials.user.clone();
                    self.write_line(&user).await?;
                }
                Ok(2) => {
                    debug!(endpoint = %self.endpoint, "sending password");
                    let password = self.credentials.password.clone();
                    self.write_line(&password).await?;
                    password_sent = true;
                }
                Ok(_) => return Err(self.denied()),
                // Consoles often sit silent until they see a keystroke.
                Err(e) if e.is_timeout() && !nudged => {
                    nudged = true;
                    self.write_line("").await?;
                }
                Err(e) if e.is_timeout() => {
                    return Err(SessionError::Connection {
                        endpoint: self.endpoint.to_string(),
                        attempts: 1,
                        reason: format!("login handshake did not reach a prompt: {e}"),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn denied(&self) -> SessionError {
        SessionError::AuthenticationDenied {
            endpoint: self.endpoint.to_string(),
            user: self.credentials.user.clone(),
        }
    }

    /// Check the session answers, and if not, redo the connect handshake.
    ///
    /// The prompt is reset to the initial prompt first, since whatever it was
    /// narrowed to may belong to a host that is no longer behind the endpoint.
    /// Returns `true` when a new connection was made.
    pub async fn reconnect(
        &mut self,
        retry: bool,
        retry_interval: Duration,
        retry_timeout: Duration,
    ) -> Result<bool, SessionError> {
        let probe_timeout = self.options.probe_timeout;
        if self.probe(probe_timeout).await {
            debug!(endpoint = %self.endpoint, "session healthy; reconnect skipped");
            return Ok(false);
        }

        info!(endpoint = %self.endpoint, "session unresponsive; reconnecting");
        self.drop_transport().await;
        self.prompt = self.initial_prompt.clone();

        let policy = if retry {
            RetryPolicy::fixed(retry_interval, retry_timeout)
        } else {
            RetryPolicy::once()
        };
        self.connect_with(&policy).await?;
        Ok(true)
    }

    /// [`reconnect`](Self::reconnect) with the configured retry policy.
    pub async fn ensure_connected(&mut self) -> Result<bool, SessionError> {
        let policy = self.options.retry.clone();
        self.reconnect(true, policy.base_delay, policy.retry_timeout).await
    }

    /// Echo probe: send a random token and wait for it to come back,
    /// followed by the prompt.
    pub async fn probe(&mut self, timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        let token = format!("hostctl-probe-{}", fastrand::u32(..));
        let Ok(answer) = compile(&format!(r"(?m)^{token}\r?$")) else {
            return false;
        };

        self.buffer.discard();
        if self.send(&format!("echo {token}")).await.is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        if self.expect_compiled(&[answer], timeout).await.is_err() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.expect_prompt(remaining).await.is_ok()
    }

    /// Close the transport. The session can later be reconnected.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await?;
            info!(endpoint = %self.endpoint, "session closed");
        }
        self.in_flight = false;
        Ok(())
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take()
            && let Err(e) = transport.close().await
        {
            debug!(endpoint = %self.endpoint, error = %e, "error closing transport");
        }
        self.in_flight = false;
    }

    // ── Primitives ─────────────────────────────────────────────────────────

    /// Replace the shell-prompt regex.
    pub fn set_prompt(&mut self, pattern: &str) -> Result<(), SessionError> {
        self.prompt = compile(pattern)?;
        debug!(endpoint = %self.endpoint, prompt = pattern, "prompt updated");
        Ok(())
    }

    /// Write one line and mark a command in flight.
    pub async fn send(&mut self, command: &str) -> Result<(), SessionError> {
        if self.in_flight {
            debug!(endpoint = %self.endpoint, "sending while previous command unanswered");
        }
        debug!(endpoint = %self.endpoint, command = %mask_sensitive_command(command), "send");
        self.last_match = None;
        self.write_line(command).await?;
        self.in_flight = true;
        Ok(())
    }

    /// Send a control character, e.g. `'c'` for Ctrl-C.
    pub async fn send_control(&mut self, key: char) -> Result<(), SessionError> {
        let byte = (key.to_ascii_uppercase() as u8) & 0x1f;
        debug!(endpoint = %self.endpoint, key = %key, "send control");
        self.write_raw(&[byte]).await
    }

    /// Wait for any of `patterns`; returns the index of the one that matched
    /// earliest in the stream (ties go to the lower index).
    pub async fn expect<P: AsRef<str>>(&mut self, patterns: &[P], timeout: Duration) -> Result<usize, SessionError> {
        let compiled = patterns
            .iter()
            .map(|p| compile(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.expect_compiled(&compiled, timeout).await
    }

    /// Wait for the shell prompt and clear the in-flight marker.
    pub async fn expect_prompt(&mut self, timeout: Duration) -> Result<ExpectMatch, SessionError> {
        let prompt = self.prompt.clone();
        self.expect_compiled(&[prompt], timeout).await?;
        self.in_flight = false;
        self.last_match
            .clone()
            .ok_or_else(|| SessionError::UnexpectedOutput {
                command: String::new(),
                detail: "prompt matched but no match recorded".to_string(),
            })
    }

    async fn expect_compiled(&mut self, patterns: &[Regex], timeout: Duration) -> Result<usize, SessionError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(m) = self.buffer.find(patterns) {
                let (before, matched) = self.buffer.take_match(&m);
                let found = ExpectMatch {
                    index: m.index,
                    before: String::from_utf8_lossy(&before).into_owned(),
                    matched: String::from_utf8_lossy(&matched).into_owned(),
                };
                debug!(endpoint = %self.endpoint, index = m.index, matched = %found.matched.trim(), "expect matched");
                self.last_match = Some(found);
                return Ok(m.index);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.expect_timeout(patterns, timeout));
            }

            let endpoint = self.endpoint.to_string();
            let transport = self.transport.as_mut().ok_or(SessionError::NotConnected { endpoint })?;
            match tokio::time::timeout(remaining, transport.read()).await {
                Ok(Ok(chunk)) => self.buffer.push(&chunk),
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "transport lost during expect");
                    self.transport = None;
                    self.in_flight = false;
                    return Err(e);
                }
                Err(_) => return Err(self.expect_timeout(patterns, timeout)),
            }
        }
    }

    fn expect_timeout(&self, patterns: &[Regex], timeout: Duration) -> SessionError {
        SessionError::ExpectTimeout {
            patterns: patterns.iter().map(|p| p.as_str().to_string()).collect(),
            timeout,
            tail: self.buffer.tail(TAIL_BYTES),
        }
    }

    /// Read and discard whatever arrives within `window`.
    pub async fn flush(&mut self, window: Duration) -> Result<usize, SessionError> {
        let mut dropped = self.buffer.discard();
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let endpoint = self.endpoint.to_string();
            let transport = self.transport.as_mut().ok_or(SessionError::NotConnected { endpoint })?;
            match tokio::time::timeout(remaining, transport.read()).await {
                Ok(Ok(chunk)) => dropped += chunk.len(),
                Ok(Err(e)) => {
                    self.transport = None;
                    return Err(e);
                }
                Err(_) => break,
            }
        }
        self.in_flight = false;
        if dropped > 0 {
            debug!(endpoint = %self.endpoint, bytes = dropped, "flushed output");
        }
        Ok(dropped)
    }

    // ── Command helpers ────────────────────────────────────────────────────

    /// Run `command`, wait for the prompt, and collect its output and exit code.
    ///
    /// On timeout the command is interrupted with Ctrl-C and its output
    /// flushed before the error is returned, leaving the session usable.
    pub async fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        self.buffer.discard();
        self.send(command).await?;

        let matched = match self.expect_prompt(timeout).await {
            Ok(m) => m,
            Err(e) if e.is_timeout() => {
                warn!(endpoint = %self.endpoint, command = %mask_sensitive_command(command), "command timed out; interrupting");
                self.interrupt().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let output = strip_echo(&matched.before, command);
        let code = self.exit_code(timeout).await?;
        debug!(endpoint = %self.endpoint, code, bytes = output.len(), "command finished");
        Ok(CommandOutput { code, output })
    }

    /// Run `command` under sudo, answering its password prompt with the
    /// session password.
    ///
    /// A wrong password is answered again until sudo gives up by itself,
    /// so the result is sudo's own failure output and exit code.
    pub async fn exec_sudo(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, SessionError> {
        let line = format!("sudo {command}");
        let patterns = [self.prompt.clone(), compile(&self.options.sudo_pattern)?];
        let deadline = Instant::now() + timeout;
        self.buffer.discard();
        self.send(&line).await?;

        let mut answered = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.expect_compiled(&patterns, remaining).await {
                Ok(0) => break,
                Ok(_) if answered < SUDO_ATTEMPTS => {
                    debug!(endpoint = %self.endpoint, attempt = answered + 1, "answering sudo password prompt");
                    let password = self.credentials.password.clone();
                    self.write_line(&password).await?;
                    answered += 1;
                }
                Ok(_) => {
                    warn!(endpoint = %self.endpoint, "sudo kept asking for a password; interrupting");
                    self.interrupt().await;
                    return Err(SessionError::UnexpectedOutput {
                        command: mask_sensitive_command(&line),
                        detail: format!("sudo still prompting after {SUDO_ATTEMPTS} passwords"),
                    });
                }
                Err(e) if e.is_timeout() => {
                    warn!(endpoint = %self.endpoint, command = %mask_sensitive_command(&line), "sudo command timed out; interrupting");
                    self.interrupt().await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.in_flight = false;

        let before = self.last_match.as_ref().map(|m| m.before.clone()).unwrap_or_default();
        let output = strip_echo(&before, &line);
        let code = self.exit_code(timeout).await?;
        debug!(endpoint = %self.endpoint, code, bytes = output.len(), "sudo command finished");
        Ok(CommandOutput { code, output })
    }

    /// Re-run `command` until its output matches `pattern`, or with
    /// `absent` until it stops matching, for at least `stay_for`.
    ///
    /// Runs that time out count as not matching. Returns the last output,
    /// or `ExpectTimeout` once `wait.timeout` has passed.
    pub async fn wait_for_output(
        &mut self,
        command: &str,
        pattern: &str,
        wait: &OutputWait,
    ) -> Result<CommandOutput, SessionError> {
        let expected = compile(pattern)?;
        let start = Instant::now();
        let deadline = start + wait.timeout;
        let mut holding_since: Option<Instant> = None;
        let mut last_output = String::new();

        loop {
            let budget = self
                .options
                .command_timeout
                .min(deadline.saturating_duration_since(Instant::now()));
            match self.exec(command, budget).await {
                Ok(out) => {
                    if expected.is_match(out.output.as_bytes()) != wait.absent {
                        let since = *holding_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= wait.stay_for {
                            info!(
                                endpoint = %self.endpoint,
                                command = %mask_sensitive_command(command),
                                elapsed_secs = start.elapsed().as_secs(),
                                "command output reached expected state"
                            );
                            return Ok(out);
                        }
                    } else {
                        holding_since = None;
                    }
                    last_output = out.output;
                }
                Err(e) if e.is_timeout() => {
                    holding_since = None;
                    debug!(endpoint = %self.endpoint, error = %e, "output check timed out");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(wait.check_interval.min(deadline - now)).await;
        }

        let skip = last_output.len().saturating_sub(TAIL_BYTES);
        let cut = (skip..=last_output.len())
            .find(|&i| last_output.is_char_boundary(i))
            .unwrap_or(last_output.len());
        Err(SessionError::ExpectTimeout {
            patterns: vec![pattern.to_string()],
            timeout: wait.timeout,
            tail: last_output[cut..].to_string(),
        })
    }

    async fn exit_code(&mut self, timeout: Duration) -> Result<i32, SessionError> {
        const QUERY: &str = "echo $?";
        self.send(QUERY).await?;
        let matched = self.expect_prompt(timeout).await?;
        let output = strip_echo(&matched.before, QUERY);
        output
            .lines()
            .rev()
            .find_map(|line| line.trim().parse::<i32>().ok())
            .ok_or_else(|| SessionError::UnexpectedOutput {
                command: QUERY.to_string(),
                detail: format!("no exit code in {output:?}"),
            })
    }

    async fn interrupt(&mut self) {
        if self.send_control('c').await.is_err() {
            return;
        }
        let _ = self.expect_prompt(FLUSH_WINDOW).await;
        self.buffer.discard();
        self.in_flight = false;
    }

    /// Hostname of the machine answering the session.
    pub async fn hostname(&mut self) -> Result<String, SessionError> {
        let timeout = self.options.command_timeout;
        let out = self.exec("hostname", timeout).await?;
        out.lines()
            .next()
            .map(str::to_string)
            .ok_or_else(|| SessionError::UnexpectedOutput {
                command: "hostname".to_string(),
                detail: "empty output".to_string(),
            })
    }

    /// Next chunk straight from the transport, bypassing the expect buffer.
    async fn read_chunk(&mut self) -> Result<Vec<u8>, SessionError> {
        let endpoint = self.endpoint.to_string();
        let transport = self.transport.as_mut().ok_or(SessionError::NotConnected { endpoint })?;
        match transport.read().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.transport = None;
                self.in_flight = false;
                Err(e)
            }
        }
    }

    fn line_ending(&self) -> &'static str {
        match &self.transport {
            Some(t) => t.line_ending(),
            None => "\n",
        }
    }

    /// Forget buffered output and any command in flight.
    fn settle(&mut self) {
        self.buffer.discard();
        self.last_match = None;
        self.in_flight = false;
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        let ending = self.line_ending();
        let mut data = Vec::with_capacity(line.len() + ending.len());
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(ending.as_bytes());
        self.write_raw(&data).await
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let endpoint = self.endpoint.to_string();
        let transport = self.transport.as_mut().ok_or(SessionError::NotConnected { endpoint })?;
        if let Err(e) = transport.write(data).await {
            self.transport = None;
            self.in_flight = false;
            return Err(e);
        }
        Ok(())
    }
}

/// Remove the echoed command line (when the remote echoes) and trailing
/// blank space from output captured before a prompt.
fn strip_echo(before: &str, command: &str) -> String {
    let text = before.replace('\r', "");
    let mut lines = text.lines().peekable();
    if let Some(first) = lines.peek()
        && first.trim_end().ends_with(command.trim())
    {
        lines.next();
    }
    lines.collect::<Vec<_>>().join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_echo_removes_command_line() {
        let before = "system host-list\r\n+----+\r\n| id |\r\n";
        assert_eq!(strip_echo(before, "system host-list"), "+----+\n| id |");
    }

    #[test]
    fn test_strip_echo_keeps_output_without_echo() {
        assert_eq!(strip_echo("controller-0\n", "hostname"), "controller-0");
    }

    #[test]
    fn test_command_output_lines_skip_blanks() {
        let out = CommandOutput {
            code: 0,
            output: "\n  a \n\nb\n".to_string(),
        };
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(out.success());
    }

    #[test]
    fn test_invalid_initial_prompt_rejected() {
        let err = Session::new(
            Endpoint::mock("lab"),
            Credentials::default(),
            "controller-[0",
            Arc::new(NetworkConnector),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::InvalidPattern { .. }));
    }
}
