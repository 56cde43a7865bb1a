//! In-process remote shells for tests.
//!
//! [`MockConnector`] hands out [`MockTransport`]s wired to a fresh
//! [`MockShell`] per connection. Shells answer whole lines synchronously;
//! the transport adds the stream-level behaviour real links have (chunked
//! reads, optional echo, hang-ups, refused connects).
//!
//! [`ScriptedShell`] covers session-level tests; [`MockPlatform`] simulates
//! a whole lab for controller and recovery tests.

mod platform;

pub use platform::{MockPlatform, PlatformTiming};

use crate::errors::SessionError;
use crate::session::{Connector, Credentials, Endpoint, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// What a shell does with one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReply {
    /// Write this text back.
    Output(String),
    /// Write this text, then close the connection.
    HangUp(String),
    /// Write nothing. Used to simulate a hung command.
    Silent,
}

/// Line-oriented fake remote shell.
pub trait MockShell: Send {
    /// Called when a connection opens: the banner to show, or a refusal reason.
    fn accept(&mut self) -> Result<String, String>;

    fn on_line(&mut self, line: &str) -> MockReply;

    /// Called for control characters (Ctrl-C is `0x03`).
    fn on_control(&mut self, _byte: u8) -> MockReply {
        MockReply::Silent
    }
}

type ShellFactory = dyn Fn() -> Box<dyn MockShell> + Send + Sync;

/// Shared state of one mock connection, visible to the connector.
#[derive(Debug, Default)]
struct Link {
    severed: AtomicBool,
    notify: Notify,
}

impl Link {
    fn sever(&self) {
        self.severed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_severed(&self) -> bool {
        self.severed.load(Ordering::SeqCst)
    }
}

/// Connector producing in-process transports.
pub struct MockConnector {
    factory: Arc<ShellFactory>,
    chunk_size: usize,
    echo: bool,
    refuse_next: AtomicU32,
    opens: AtomicU32,
    links: Mutex<Vec<Arc<Link>>>,
}

impl MockConnector {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn MockShell> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            chunk_size: usize::MAX,
            echo: false,
            refuse_next: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Connector whose every connection talks to a clone of `shell`.
    pub fn scripted(shell: ScriptedShell) -> Self {
        Self::new(move || Box::new(shell.clone()))
    }

    /// Split output into reads of at most `size` bytes.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Echo input lines back, the way a console does.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: u32) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Close every open connection from the remote side.
    pub fn sever_all(&self) {
        let links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        for link in links.iter() {
            link.sever();
        }
    }

    /// Number of connection attempts, including refused ones.
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        endpoint: &Endpoint,
        _credentials: &Credentials,
    ) -> Result<Box<dyn Transport>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SessionError::Connection {
                endpoint: endpoint.to_string(),
                attempts: 1,
                reason: "connection refused".to_string(),
            });
        }

        let mut shell = (self.factory)();
        let banner = shell.accept().map_err(|reason| SessionError::Connection {
            endpoint: endpoint.to_string(),
            attempts: 1,
            reason,
        })?;

        let link = Arc::new(Link::default());
        {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            links.retain(|l| !l.is_severed());
            links.push(link.clone());
        }

        let mut transport = MockTransport {
            shell,
            link,
            endpoint: endpoint.to_string(),
            outbox: VecDeque::new(),
            partial: Vec::new(),
            chunk_size: self.chunk_size,
            echo: self.echo,
            closed: false,
        };
        transport.outbox.extend(banner.as_bytes());
        debug!(endpoint = %endpoint, "mock connection opened");
        Ok(Box::new(transport))
    }
}

pub struct MockTransport {
    shell: Box<dyn MockShell>,
    link: Arc<Link>,
    endpoint: String,
    outbox: VecDeque<u8>,
    partial: Vec<u8>,
    chunk_size: usize,
    echo: bool,
    closed: bool,
}

impl MockTransport {
    fn apply(&mut self, reply: MockReply) {
        match reply {
            MockReply::Output(text) => self.outbox.extend(text.as_bytes()),
            MockReply::HangUp(text) => {
                self.outbox.extend(text.as_bytes());
                self.link.sever();
            }
            MockReply::Silent => {}
        }
    }

    fn disconnected(&self, reason: &str) -> SessionError {
        SessionError::Disconnected {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.closed || self.link.is_severed() {
            return Err(self.disconnected("connection closed by peer"));
        }
        for &byte in data {
            match byte {
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.partial)
                        .trim_end_matches('\r')
                        .to_string();
                    self.partial.clear();
                    if self.echo {
                        self.outbox.extend(line.as_bytes());
                        self.outbox.extend(b"\r\n");
                    }
                    let reply = self.shell.on_line(&line);
                    self.apply(reply);
                }
                b'\r' => self.partial.push(byte),
                0x00..=0x1f => {
                    let reply = self.shell.on_control(byte);
                    self.apply(reply);
                }
                _ => self.partial.push(byte),
            }
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, SessionError> {
        loop {
            if self.closed {
                return Err(self.disconnected("transport closed"));
            }
            if !self.outbox.is_empty() {
                let n = self.outbox.len().min(self.chunk_size);
                return Ok(self.outbox.drain(..n).collect());
            }
            if self.link.is_severed() {
                return Err(self.disconnected("connection closed by peer"));
            }

            let notified = self.link.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.link.is_severed() {
                continue;
            }
            notified.await;
        }
    }

    fn is_open(&self) -> bool {
        !self.closed && !self.link.is_severed()
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closed = true;
        self.link.sever();
        Ok(())
    }
}

// ── Login ──────────────────────────────────────────────────────────────────

/// Username/password exchange shared by the mock shells.
#[derive(Debug, Clone)]
pub(crate) struct LoginGate {
    user: String,
    password: String,
    stage: LoginStage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginStage {
    User,
    Password,
    Done,
}

pub(crate) enum LoginStep {
    /// Text to write back; login still in progress.
    Prompt(String),
    /// Login just succeeded.
    LoggedIn,
}

impl LoginGate {
    pub(crate) fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
            stage: LoginStage::User,
        }
    }

    pub(crate) fn banner() -> String {
        "\r\nlogin: ".to_string()
    }

    pub(crate) fn reset(&mut self) {
        self.stage = LoginStage::User;
    }

    pub(crate) fn is_done(&self) -> bool {
        self.stage == LoginStage::Done
    }

    /// Feed a line while not yet logged in.
    pub(crate) fn step(&mut self, line: &str, attempted_user: &mut String) -> LoginStep {
        match self.stage {
            LoginStage::User if line.is_empty() => LoginStep::Prompt(Self::banner()),
            LoginStage::User => {
                *attempted_user = line.to_string();
                self.stage = LoginStage::Password;
                LoginStep::Prompt("Password: ".to_string())
            }
            LoginStage::Password if *attempted_user == self.user && line == self.password => {
                self.stage = LoginStage::Done;
                LoginStep::LoggedIn
            }
            LoginStage::Password => {
                self.stage = LoginStage::User;
                LoginStep::Prompt(format!("\r\nLogin incorrect\r\n{}", Self::banner()))
            }
            LoginStage::Done => LoginStep::LoggedIn,
        }
    }
}

// ── ScriptedShell ──────────────────────────────────────────────────────────

/// Shell with a fixed prompt and canned command responses.
///
/// Beyond plain commands it understands `sudo <command>` (see
/// [`with_sudo`](Self::with_sudo)) and `ssh [opts] user@host; echo <marker>`
/// into shells registered with [`with_remote`](Self::with_remote).
#[derive(Debug, Clone)]
pub struct ScriptedShell {
    prompt: String,
    login: Option<LoginGate>,
    attempted_user: String,
    responses: HashMap<String, (String, i32)>,
    sequences: HashMap<String, VecDeque<(String, i32)>>,
    silent: Vec<String>,
    sudo: Option<(String, String)>,
    sudo_pending: Option<(String, u32)>,
    remotes: HashMap<String, ScriptedShell>,
    hop: Option<Box<Hop>>,
    last_code: i32,
}

/// An ssh session into a remote shell, in progress.
#[derive(Debug, Clone)]
struct Hop {
    host: String,
    user: String,
    shell: ScriptedShell,
    marker: Option<String>,
    authed: bool,
}

const SUDO_MAX_TRIES: u32 = 3;

impl ScriptedShell {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            login: None,
            attempted_user: String::new(),
            responses: HashMap::new(),
            sequences: HashMap::new(),
            silent: Vec::new(),
            sudo: None,
            sudo_pending: None,
            remotes: HashMap::new(),
            hop: None,
            last_code: 0,
        }
    }

    /// Require a login exchange before the prompt appears.
    #[must_use]
    pub fn with_login(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.login = Some(LoginGate::new(user, password));
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>, output: impl Into<String>, code: i32) -> Self {
        self.responses.insert(command.into(), (output.into(), code));
        self
    }

    /// Answer successive runs of `command` with successive outputs; the
    /// last one repeats.
    #[must_use]
    pub fn with_sequence<I, S>(mut self, command: impl Into<String>, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let outputs = outputs.into_iter().map(|o| (o.into(), 0)).collect();
        self.sequences.insert(command.into(), outputs);
        self
    }

    /// Commands starting with `prefix` never return.
    #[must_use]
    pub fn with_hang(mut self, prefix: impl Into<String>) -> Self {
        self.silent.push(prefix.into());
        self
    }

    /// Make `sudo` ask for `password` on behalf of `user`. Without this,
    /// `sudo` runs its command straight away.
    #[must_use]
    pub fn with_sudo(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.sudo = Some((user.into(), password.into()));
        self
    }

    /// Let `ssh` from this shell reach `host`, answered by `shell`.
    #[must_use]
    pub fn with_remote(mut self, host: impl Into<String>, shell: ScriptedShell) -> Self {
        self.remotes.insert(host.into(), shell);
        self
    }

    fn respond(&mut self, body: &str, code: i32) -> MockReply {
        self.last_code = code;
        let mut out = String::new();
        if !body.is_empty() {
            out.push_str(body);
            if !body.ends_with('\n') {
                out.push_str("\r\n");
            }
        }
        out.push_str(&self.prompt);
        MockReply::Output(out)
    }

    fn run(&mut self, line: &str) -> MockReply {
        if let Some(outputs) = self.sequences.get_mut(line) {
            let next = if outputs.len() > 1 { outputs.pop_front() } else { outputs.front().cloned() };
            if let Some((output, code)) = next {
                return self.respond(&output, code);
            }
        }
        match self.responses.get(line).cloned() {
            Some((output, code)) => self.respond(&output, code),
            None => {
                let name = line.split_whitespace().next().unwrap_or_default().to_string();
                self.respond(&format!("bash: {name}: command not found"), 127)
            }
        }
    }

    fn sudo_prompt(&self) -> String {
        let user = self.sudo.as_ref().map(|(u, _)| u.as_str()).unwrap_or_default();
        format!("[sudo] password for {user}: ")
    }

    fn sudo(&mut self, command: &str) -> MockReply {
        if self.sudo.is_none() {
            return self.run(command);
        }
        self.sudo_pending = Some((command.to_string(), 0));
        MockReply::Output(self.sudo_prompt())
    }

    fn sudo_password(&mut self, line: &str) -> MockReply {
        let Some((command, failures)) = self.sudo_pending.take() else {
            return MockReply::Silent;
        };
        let accepted = self.sudo.as_ref().is_some_and(|(_, password)| password == line);
        if accepted {
            return self.run(&command);
        }
        let failures = failures + 1;
        if failures >= SUDO_MAX_TRIES {
            return self.respond(&format!("sudo: {failures} incorrect password attempts"), 1);
        }
        self.sudo_pending = Some((command, failures));
        MockReply::Output(format!("Sorry, try again.\r\n{}", self.sudo_prompt()))
    }

    /// `ssh [options] [user@]host[; echo marker]`
    fn ssh(&mut self, line: &str) -> MockReply {
        let (ssh, after) = line.split_once(';').unwrap_or((line, ""));
        let marker = after.trim().strip_prefix("echo ").map(|m| m.trim().to_string());
        let target = ssh.split_whitespace().last().unwrap_or_default();
        let (user, host) = target.split_once('@').unwrap_or(("", target));

        let Some(remote) = self.remotes.get(host).cloned() else {
            let mut text = format!("ssh: Could not resolve hostname {host}: Name or service not known\r\n");
            if let Some(marker) = &marker {
                text.push_str(marker);
            }
            return self.respond(&text, 0);
        };
        let authed = remote.login.is_none();
        let greeting = if authed {
            format!("Last login: today\r\n{}", remote.prompt)
        } else {
            format!("{user}@{host}'s password: ")
        };
        self.hop = Some(Box::new(Hop {
            host: host.to_string(),
            user: user.to_string(),
            shell: remote,
            marker,
            authed,
        }));
        MockReply::Output(greeting)
    }

    fn hop_line(&mut self, line: &str) -> MockReply {
        let Some(hop) = self.hop.as_mut() else {
            return MockReply::Silent;
        };
        if !hop.authed {
            let accepted = hop
                .shell
                .login
                .as_ref()
                .is_none_or(|gate| gate.user == hop.user && gate.password == line);
            if !accepted {
                return MockReply::Output(format!(
                    "Permission denied, please try again.\r\n{}@{}'s password: ",
                    hop.user, hop.host
                ));
            }
            hop.authed = true;
            if let Some(gate) = hop.shell.login.as_mut() {
                gate.stage = LoginStage::Done;
            }
            return MockReply::Output(format!("Last login: today\r\n{}", hop.shell.prompt));
        }
        if line.trim() == "exit" {
            let text = format!("logout\r\nConnection to {} closed.\r\n", hop.host);
            return self.leave_hop(text);
        }
        match hop.shell.on_line(line) {
            MockReply::HangUp(text) => self.leave_hop(text),
            reply => reply,
        }
    }

    /// Back to this shell's prompt, printing the hop's marker on the way.
    fn leave_hop(&mut self, mut text: String) -> MockReply {
        if let Some(marker) = self.hop.take().and_then(|hop| hop.marker) {
            text.push_str(&marker);
            text.push_str("\r\n");
        }
        self.last_code = 0;
        text.push_str(&self.prompt);
        MockReply::Output(text)
    }
}

impl MockShell for ScriptedShell {
    fn accept(&mut self) -> Result<String, String> {
        match &mut self.login {
            Some(gate) => {
                gate.reset();
                Ok(LoginGate::banner())
            }
            None => Ok(self.prompt.clone()),
        }
    }

    fn on_line(&mut self, line: &str) -> MockReply {
        if let Some(gate) = self.login.as_mut()
            && !gate.is_done()
        {
            return match gate.step(line, &mut self.attempted_user) {
                LoginStep::Prompt(text) => MockReply::Output(text),
                LoginStep::LoggedIn => MockReply::Output(format!("Last login: today\r\n{}", self.prompt)),
            };
        }
        if self.hop.is_some() {
            return self.hop_line(line);
        }
        if self.sudo_pending.is_some() {
            return self.sudo_password(line.trim_end_matches(['\r', '\n']));
        }

        let line = line.trim();
        if self.silent.iter().any(|p| line.starts_with(p.as_str())) {
            return MockReply::Silent;
        }
        if line.is_empty() {
            return MockReply::Output(self.prompt.clone());
        }
        if line == "echo $?" {
            let code = self.last_code;
            return self.respond(&code.to_string(), 0);
        }
        if let Some(text) = line.strip_prefix("echo ") {
            let text = text.to_string();
            return self.respond(&text, 0);
        }
        if let Some(command) = line.strip_prefix("sudo ") {
            let command = command.trim().to_string();
            return self.sudo(&command);
        }
        if line.starts_with("ssh ") {
            return self.ssh(line);
        }
        self.run(line)
    }

    fn on_control(&mut self, byte: u8) -> MockReply {
        if let Some(hop) = self.hop.as_mut() {
            if hop.authed {
                return hop.shell.on_control(byte);
            }
            if byte == 0x03 {
                return self.leave_hop("^C\r\n".to_string());
            }
            return MockReply::Silent;
        }
        if byte == 0x03 {
            self.sudo_pending = None;
            self.last_code = 130;
            MockReply::Output(format!("^C\r\n{}", self.prompt))
        } else {
            MockReply::Silent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_answers_lines_in_chunks() {
        let connector = MockConnector::scripted(
            ScriptedShell::new("$ ").with_command("hostname", "controller-0", 0),
        )
        .with_chunk_size(3);
        let mut transport = connector
            .open(&Endpoint::mock("lab"), &Credentials::default())
            .await
            .unwrap();

        assert_eq!(transport.read().await.unwrap(), b"$ ");
        transport.write(b"hostname\n").await.unwrap();
        let mut got = Vec::new();
        while !got.ends_with(b"$ ") {
            let chunk = transport.read().await.unwrap();
            assert!(chunk.len() <= 3);
            got.extend(chunk);
        }
        assert_eq!(got, b"controller-0\r\n$ ");
    }

    #[tokio::test]
    async fn test_refused_then_accepted() {
        let connector = MockConnector::scripted(ScriptedShell::new("$ "));
        connector.refuse_next(1);
        let endpoint = Endpoint::mock("lab");
        assert!(connector.open(&endpoint, &Credentials::default()).await.is_err());
        assert!(connector.open(&endpoint, &Credentials::default()).await.is_ok());
        assert_eq!(connector.open_count(), 2);
    }

    #[tokio::test]
    async fn test_sever_wakes_pending_read() {
        let connector = Arc::new(MockConnector::scripted(ScriptedShell::new("$ ")));
        let mut transport = connector
            .open(&Endpoint::mock("lab"), &Credentials::default())
            .await
            .unwrap();
        transport.read().await.unwrap();

        let severer = connector.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            severer.sever_all();
        });
        let err = transport.read().await.unwrap_err();
        assert!(matches!(err, SessionError::Disconnected { .. }));
        assert!(!transport.is_open());
    }

    #[test]
    fn test_scripted_login_rejects_bad_password() {
        let mut shell = ScriptedShell::new("$ ").with_login("sysadmin", "right");
        assert_eq!(shell.accept().unwrap(), LoginGate::banner());
        assert_eq!(shell.on_line("sysadmin"), MockReply::Output("Password: ".into()));
        match shell.on_line("wrong") {
            MockReply::Output(text) => assert!(text.contains("Login incorrect")),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_scripted_exit_code_follows_last_command() {
        let mut shell = ScriptedShell::new("$ ").with_command("false", "", 1);
        shell.on_line("false");
        assert_eq!(shell.on_line("echo $?"), MockReply::Output("1\r\n$ ".into()));
        shell.on_line("nosuch");
        assert_eq!(shell.on_line("echo $?"), MockReply::Output("127\r\n$ ".into()));
    }

    #[test]
    fn test_scripted_sudo_retries_then_gives_up() {
        let mut shell = ScriptedShell::new("$ ")
            .with_sudo("sysadmin", "right")
            .with_command("id -u", "0", 0);
        let prompt = "[sudo] password for sysadmin: ";
        assert_eq!(shell.on_line("sudo id -u"), MockReply::Output(prompt.into()));
        assert_eq!(shell.on_line("right"), MockReply::Output("0\r\n$ ".into()));

        shell.on_line("sudo id -u");
        shell.on_line("wrong");
        shell.on_line("wrong");
        match shell.on_line("wrong") {
            MockReply::Output(text) => assert!(text.contains("3 incorrect password attempts")),
            other => panic!("unexpected reply {other:?}"),
        }
        assert_eq!(shell.on_line("echo $?"), MockReply::Output("1\r\n$ ".into()));
    }

    #[test]
    fn test_scripted_ssh_hop_prints_marker_on_exit() {
        let remote = ScriptedShell::new("compute-0$ ").with_login("sysadmin", "pw");
        let mut shell = ScriptedShell::new("$ ").with_remote("compute-0", remote);

        let reply = shell.on_line("ssh -o StrictHostKeyChecking=no sysadmin@compute-0; echo END");
        assert_eq!(reply, MockReply::Output("sysadmin@compute-0's password: ".into()));
        match shell.on_line("pw") {
            MockReply::Output(text) => assert!(text.ends_with("compute-0$ ")),
            other => panic!("unexpected reply {other:?}"),
        }
        match shell.on_line("exit") {
            MockReply::Output(text) => assert!(text.ends_with("END\r\n$ "), "{text}"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_scripted_sequence_repeats_last_output() {
        let mut shell = ScriptedShell::new("$ ").with_sequence("status", ["booting", "ready"]);
        assert_eq!(shell.on_line("status"), MockReply::Output("booting\r\n$ ".into()));
        assert_eq!(shell.on_line("status"), MockReply::Output("ready\r\n$ ".into()));
        assert_eq!(shell.on_line("status"), MockReply::Output("ready\r\n$ ".into()));
    }
}
