//! Simulated lab behind the platform CLI.
//!
//! Hosts move through timed phases after each lifecycle command, measured on
//! the tokio clock so `start_paused` tests run minutes of lab time instantly.
//! The shell answering a connection is always the active controller; a swact
//! or a reboot of the active controller hangs up and leaves the endpoint
//! unreachable for a while, as the floating address moves.

use super::{LoginGate, LoginStep, MockConnector, MockReply, MockShell};
use crate::recovery::{ResourceKind, ResourceRef};
use crate::session::Credentials;
use crate::types::{AdminState, AvailState, HostRecord, HostState, OperState, Personality};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_USER: &str = "sysadmin";
pub const DEFAULT_PASSWORD: &str = "St8rlingX*";

/// Lab-time durations of simulated transitions.
#[derive(Debug, Clone)]
pub struct PlatformTiming {
    pub lock: Duration,
    pub unlock: Duration,
    /// Time an unlocked host keeps a task after going available.
    pub task_clear: Duration,
    /// Time a rebooting host keeps reporting its old availability.
    pub reboot_grace: Duration,
    pub reboot: Duration,
    /// Time the floating address is unreachable after a swact.
    pub swact_outage: Duration,
}

impl Default for PlatformTiming {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(20),
            unlock: Duration::from_secs(180),
            task_clear: Duration::from_secs(10),
            reboot_grace: Duration::from_secs(15),
            reboot: Duration::from_secs(150),
            swact_outage: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Phase {
    at: Instant,
    state: HostState,
    task: &'static str,
}

#[derive(Debug, Clone)]
struct SimHost {
    id: u32,
    name: String,
    personality: Personality,
    state: HostState,
    task: String,
    phases: VecDeque<Phase>,
    stuck_offline: bool,
    stuck_task: bool,
    reject_lock: Option<String>,
}

impl SimHost {
    fn record(&self) -> HostRecord {
        HostRecord {
            name: self.name.clone(),
            personality: self.personality,
            state: self.state,
            task: self.task.clone(),
        }
    }

    fn schedule(&mut self, now: Instant, task: &str, phases: Vec<(Duration, HostState, &'static str)>) {
        self.task = task.to_string();
        self.phases = phases
            .into_iter()
            .map(|(after, state, task)| Phase {
                at: now + after,
                state,
                task,
            })
            .collect();
    }
}

struct Outcome {
    output: String,
    code: i32,
    hang_up: bool,
}

impl Outcome {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            code: 0,
            hang_up: false,
        }
    }

    fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            code: 1,
            hang_up: false,
        }
    }
}

struct Inner {
    hosts: Vec<SimHost>,
    active: String,
    timing: PlatformTiming,
    credentials: Credentials,
    unreachable_until: Option<Instant>,
    takeover_fails: bool,
    resources: BTreeSet<ResourceRef>,
    delete_log: Vec<ResourceRef>,
    fail_delete: HashSet<String>,
    fail_host_lists: u32,
    commands: Vec<String>,
}

/// Shared handle to a simulated lab. Clones see the same lab.
#[derive(Clone)]
pub struct MockPlatform {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Empty lab; add hosts with [`add_host`](Self::add_host).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                hosts: Vec::new(),
                active: String::new(),
                timing: PlatformTiming::default(),
                credentials: Credentials::new(DEFAULT_USER, DEFAULT_PASSWORD),
                unreachable_until: None,
                takeover_fails: false,
                resources: BTreeSet::new(),
                delete_log: Vec::new(),
                fail_delete: HashSet::new(),
                fail_host_lists: 0,
                commands: Vec::new(),
            })),
        }
    }

    /// Two controllers and two computes, all in service, controller-0 active.
    pub fn standard() -> Self {
        let platform = Self::new();
        let up = HostState::new(AdminState::Unlocked, OperState::Enabled, AvailState::Available);
        platform.add_host("controller-0", Personality::Controller, up);
        platform.add_host("controller-1", Personality::Controller, up);
        platform.add_host("compute-0", Personality::Compute, up);
        platform.add_host("compute-1", Personality::Compute, up);
        platform
    }

    /// Single controller and one compute: no standby to swact to.
    pub fn simplex() -> Self {
        let platform = Self::new();
        let up = HostState::new(AdminState::Unlocked, OperState::Enabled, AvailState::Available);
        platform.add_host("controller-0", Personality::Controller, up);
        platform.add_host("compute-0", Personality::Compute, up);
        platform
    }

    #[must_use]
    pub fn with_timing(self, timing: PlatformTiming) -> Self {
        self.lock().timing = timing;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a host. The first controller added becomes active.
    pub fn add_host(&self, name: &str, personality: Personality, state: HostState) {
        let mut inner = self.lock();
        let id = inner.hosts.len() as u32 + 1;
        if inner.active.is_empty() && personality == Personality::Controller {
            inner.active = name.to_string();
        }
        inner.hosts.push(SimHost {
            id,
            name: name.to_string(),
            personality,
            state,
            task: String::new(),
            phases: VecDeque::new(),
            stuck_offline: false,
            stuck_task: false,
            reject_lock: None,
        });
    }

    /// Force a host's state, cancelling any transition in progress.
    pub fn set_state(&self, name: &str, state: HostState) {
        let mut inner = self.lock();
        if let Some(host) = inner.host_mut(name) {
            host.state = state;
            host.task.clear();
            host.phases.clear();
        }
    }

    pub fn host(&self, name: &str) -> Option<HostRecord> {
        let mut inner = self.lock();
        inner.tick(Instant::now());
        inner.hosts.iter().find(|h| h.name == name).map(SimHost::record)
    }

    pub fn state(&self, name: &str) -> Option<HostState> {
        self.host(name).map(|h| h.state)
    }

    pub fn active_controller(&self) -> String {
        self.lock().active.clone()
    }

    pub fn credentials(&self) -> Credentials {
        self.lock().credentials.clone()
    }

    /// A host that goes offline during unlock or reboot and never returns.
    pub fn set_stuck_offline(&self, name: &str, stuck: bool) {
        if let Some(host) = self.lock().host_mut(name) {
            host.stuck_offline = stuck;
        }
    }

    /// A host whose task never clears after it goes available on unlock.
    pub fn set_stuck_task(&self, name: &str, stuck: bool) {
        if let Some(host) = self.lock().host_mut(name) {
            host.stuck_task = stuck;
        }
    }

    /// Reject every lock of `name` with `message`.
    pub fn reject_lock(&self, name: &str, message: &str) {
        if let Some(host) = self.lock().host_mut(name) {
            host.reject_lock = Some(message.to_string());
        }
    }

    /// After a swact, the new active controller never answers.
    pub fn set_swact_takeover_fails(&self, fails: bool) {
        self.lock().takeover_fails = fails;
    }

    /// Fail the next `count` `system host-list` calls.
    pub fn fail_next_host_lists(&self, count: u32) {
        self.lock().fail_host_lists = count;
    }

    pub fn add_resource(&self, resource: ResourceRef) {
        self.lock().resources.insert(resource);
    }

    pub fn has_resource(&self, resource: &ResourceRef) -> bool {
        self.lock().resources.contains(resource)
    }

    /// Deletes of `id` fail without removing it.
    pub fn fail_delete(&self, id: &str) {
        self.lock().fail_delete.insert(id.to_string());
    }

    /// Successful deletes, in order.
    pub fn delete_log(&self) -> Vec<ResourceRef> {
        self.lock().delete_log.clone()
    }

    /// Every command line received after login, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn command_count(&self, prefix: &str) -> usize {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Connector whose connections land on this lab's active controller.
    pub fn connector(&self) -> MockConnector {
        let platform = self.clone();
        MockConnector::new(move || Box::new(PlatformShell::new(platform.clone())))
    }

    fn execute(&self, line: &str) -> Outcome {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.tick(now);
        inner.commands.push(line.to_string());
        debug!(command = line, "mock platform command");

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["hostname"] => Outcome::ok(inner.active.clone()),
            ["system", "host-list"] => inner.host_list(),
            ["system", "host-show", host] => inner.host_show(host),
            ["system", "host-lock", host] => inner.host_lock(host, false, now),
            ["system", "host-lock", host, "--force"] | ["system", "host-lock", "--force", host] => {
                inner.host_lock(host, true, now)
            }
            ["system", "host-unlock", host] => inner.host_unlock(host, now),
            ["system", "host-reboot", host] => inner.host_reboot(host, now),
            ["system", "host-swact", host] => inner.host_swact(host, now),
            ["openstack", rest @ ..] => inner.openstack(rest),
            [name, ..] => Outcome {
                output: format!("bash: {name}: command not found"),
                code: 127,
                hang_up: false,
            },
            [] => Outcome::ok(""),
        }
    }

    fn accept(&self) -> Result<String, String> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.tick(now);
        if inner.unreachable_until.is_some_and(|until| now < until) {
            return Err("No route to host".to_string());
        }
        Ok(inner.active.clone())
    }
}

impl Inner {
    fn host_mut(&mut self, name: &str) -> Option<&mut SimHost> {
        self.hosts.iter_mut().find(|h| h.name == name)
    }

    fn tick(&mut self, now: Instant) {
        for host in &mut self.hosts {
            while host.phases.front().is_some_and(|p| p.at <= now) {
                if let Some(phase) = host.phases.pop_front() {
                    host.state = phase.state;
                    host.task = phase.task.to_string();
                }
            }
        }
    }

    fn standby(&self) -> Option<&SimHost> {
        self.hosts.iter().find(|h| {
            h.personality == Personality::Controller && h.name != self.active && h.state.is_in_service()
        })
    }

    fn not_found(host: &str) -> Outcome {
        Outcome::err(format!("host not found: {host}"))
    }

    fn host_list(&mut self) -> Outcome {
        if self.fail_host_lists > 0 {
            self.fail_host_lists -= 1;
            return Outcome::err("Authorization failed: service unavailable (HTTP 503)");
        }
        let rows = self
            .hosts
            .iter()
            .map(|h| {
                vec![
                    h.id.to_string(),
                    h.name.clone(),
                    h.personality.to_string(),
                    h.state.administrative.to_string(),
                    h.state.operational.to_string(),
                    h.state.availability.to_string(),
                ]
            })
            .collect::<Vec<_>>();
        Outcome::ok(render_table(
            &["id", "hostname", "personality", "administrative", "operational", "availability"],
            &rows,
        ))
    }

    fn host_show(&self, name: &str) -> Outcome {
        let Some(h) = self.hosts.iter().find(|h| h.name == name) else {
            return Self::not_found(name);
        };
        let rows = [
            ("administrative", h.state.administrative.to_string()),
            ("availability", h.state.availability.to_string()),
            ("hostname", h.name.clone()),
            ("id", h.id.to_string()),
            ("operational", h.state.operational.to_string()),
            ("personality", h.personality.to_string()),
            ("task", h.task.clone()),
        ]
        .into_iter()
        .map(|(k, v)| vec![k.to_string(), v])
        .collect::<Vec<_>>();
        Outcome::ok(render_table(&["Property", "Value"], &rows))
    }

    fn host_lock(&mut self, name: &str, force: bool, now: Instant) -> Outcome {
        let is_active = self.active == name;
        let lock_time = self.timing.lock;
        let Some(host) = self.host_mut(name) else {
            return Self::not_found(name);
        };
        if host.state.administrative == AdminState::Locked {
            return Outcome::err(format!("Avoiding lock action on locked host {name}"));
        }
        if is_active {
            return Outcome::err("Cannot lock an active controller.");
        }
        if let Some(message) = &host.reject_lock {
            return Outcome::err(message.clone());
        }

        let up = host.state.availability;
        let locking = HostState::new(AdminState::Locked, OperState::Enabled, up);
        let locked = HostState::new(AdminState::Locked, OperState::Disabled, AvailState::Online);
        let task = if force { "Force Locking" } else { "Locking" };
        host.schedule(
            now,
            task,
            vec![(lock_time / 2, locking, "Locking"), (lock_time, locked, "")],
        );
        Outcome::ok(format!("Host {name} lock request accepted"))
    }

    fn host_unlock(&mut self, name: &str, now: Instant) -> Outcome {
        let total = self.timing.unlock;
        let settle = self.timing.task_clear;
        let Some(host) = self.host_mut(name) else {
            return Self::not_found(name);
        };
        if host.state.administrative == AdminState::Unlocked {
            return Outcome::err(format!("Avoiding unlock action on unlocked host {name}"));
        }

        host.state = HostState::new(AdminState::Unlocked, OperState::Disabled, AvailState::Online);
        let mut phases = vec![(
            total / 5,
            HostState::new(AdminState::Unlocked, OperState::Disabled, AvailState::Offline),
            "Rebooting",
        )];
        if !host.stuck_offline {
            phases.push((
                total * 7 / 10,
                HostState::new(AdminState::Unlocked, OperState::Disabled, AvailState::InTest),
                "Testing",
            ));
            let available = HostState::new(AdminState::Unlocked, OperState::Enabled, AvailState::Available);
            phases.push((total, available, "Enabling"));
            if !host.stuck_task {
                phases.push((total + settle, available, ""));
            }
        }
        host.schedule(now, "Unlocking", phases);
        Outcome::ok(format!("Host {name} unlock request accepted"))
    }

    fn host_reboot(&mut self, name: &str, now: Instant) -> Outcome {
        let timing = self.timing.clone();
        let is_active = self.active == name;
        let Some(host) = self.host_mut(name) else {
            return Self::not_found(name);
        };

        let admin = host.state.administrative;
        let mut phases = vec![(
            timing.reboot_grace,
            HostState::new(admin, OperState::Disabled, AvailState::Offline),
            "Rebooting",
        )];
        if !host.stuck_offline {
            match admin {
                AdminState::Locked => phases.push((
                    timing.reboot,
                    HostState::new(AdminState::Locked, OperState::Disabled, AvailState::Online),
                    "",
                )),
                AdminState::Unlocked => {
                    phases.push((
                        timing.reboot * 7 / 10,
                        HostState::new(AdminState::Unlocked, OperState::Disabled, AvailState::InTest),
                        "Testing",
                    ));
                    phases.push((
                        timing.reboot,
                        HostState::new(AdminState::Unlocked, OperState::Enabled, AvailState::Available),
                        "",
                    ));
                }
            }
        }
        host.schedule(now, "Rebooting", phases);

        let mut outcome = Outcome::ok(format!("Host {name} reboot request accepted"));
        if is_active {
            if let Some(standby) = self.standby().map(|h| h.name.clone()) {
                self.active = standby;
            }
            self.unreachable_until = Some(now + timing.swact_outage);
            outcome.hang_up = true;
        }
        outcome
    }

    fn host_swact(&mut self, name: &str, now: Instant) -> Outcome {
        let Some(host) = self.hosts.iter().find(|h| h.name == name) else {
            return Self::not_found(name);
        };
        if host.personality != Personality::Controller {
            return Outcome::err(format!("Swact action not allowed for non controller host {name}"));
        }
        if self.active != name {
            return Outcome::err(format!("Host {name} is not the active controller"));
        }
        let Some(standby) = self.standby().map(|h| h.name.clone()) else {
            return Outcome::err("Swact action not allowed: no enabled standby controller");
        };

        self.active = standby;
        let outage = if self.takeover_fails {
            Duration::from_secs(24 * 3600)
        } else {
            self.timing.swact_outage
        };
        self.unreachable_until = Some(now + outage);
        Outcome {
            output: format!("Swact of {name} initiated"),
            code: 0,
            hang_up: true,
        }
    }

    fn openstack(&mut self, args: &[&str]) -> Outcome {
        let Some(verb_pos) = args.iter().position(|a| *a == "show" || *a == "delete") else {
            return Outcome::err("openstack: unsupported command");
        };
        let noun = args[..verb_pos].join(" ");
        let Some(kind) = ResourceKind::from_cli_noun(&noun) else {
            return Outcome::err(format!("openstack: '{noun}' is not an openstack command"));
        };
        let Some(id) = args[verb_pos + 1..].iter().find(|a| !a.starts_with('-')) else {
            return Outcome::err(format!("openstack {noun}: missing id"));
        };
        let resource = ResourceRef::new(kind, *id);

        match args[verb_pos] {
            "show" if self.resources.contains(&resource) => Outcome::ok(render_table(
                &["Field", "Value"],
                &[vec!["id".to_string(), id.to_string()]],
            )),
            "delete" if self.fail_delete.contains(*id) => {
                Outcome::err(format!("Failed to delete {noun} with name or ID '{id}'"))
            }
            "delete" if self.resources.remove(&resource) => {
                self.delete_log.push(resource);
                Outcome::ok("")
            }
            _ => Outcome::err(format!("No {noun} with a name or ID of '{id}' exists.")),
        }
    }
}

/// ASCII table in the platform CLI's layout.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.len());
            }
        }
    }

    let border = {
        let mut line = String::from("+");
        for w in &widths {
            line.push_str(&"-".repeat(w + 2));
            line.push('+');
        }
        line
    };
    let render_row = |cells: Vec<&str>| {
        let mut line = String::from("|");
        for (cell, &w) in cells.iter().zip(&widths) {
            line.push_str(&format!(" {cell:<w$} |"));
        }
        line
    };

    let mut out = Vec::with_capacity(rows.len() + 4);
    out.push(border.clone());
    out.push(render_row(headers.to_vec()));
    out.push(border.clone());
    for row in rows {
        out.push(render_row(row.iter().map(String::as_str).collect()));
    }
    out.push(border);
    out.join("\r\n")
}

/// Shell on the lab's active controller.
struct PlatformShell {
    platform: MockPlatform,
    gate: LoginGate,
    attempted_user: String,
    prompt: String,
    last_code: i32,
}

impl PlatformShell {
    fn new(platform: MockPlatform) -> Self {
        let creds = platform.credentials();
        Self {
            platform,
            gate: LoginGate::new(creds.user, creds.password),
            attempted_user: String::new(),
            prompt: String::new(),
            last_code: 0,
        }
    }

    fn reply(&mut self, output: &str, code: i32) -> MockReply {
        self.last_code = code;
        let mut text = String::new();
        if !output.is_empty() {
            text.push_str(output);
            text.push_str("\r\n");
        }
        text.push_str(&self.prompt);
        MockReply::Output(text)
    }
}

impl MockShell for PlatformShell {
    fn accept(&mut self) -> Result<String, String> {
        let host = self.platform.accept()?;
        self.prompt = format!("{host}:~$ ");
        self.gate.reset();
        Ok(LoginGate::banner())
    }

    fn on_line(&mut self, line: &str) -> MockReply {
        if !self.gate.is_done() {
            return match self.gate.step(line, &mut self.attempted_user) {
                LoginStep::Prompt(text) => MockReply::Output(text),
                LoginStep::LoggedIn => MockReply::Output(format!("\r\n{}", self.prompt)),
            };
        }

        let line = line.trim();
        if line.is_empty() {
            return MockReply::Output(self.prompt.clone());
        }
        if line == "echo $?" {
            let code = self.last_code;
            return self.reply(&code.to_string(), 0);
        }
        if let Some(text) = line.strip_prefix("echo ") {
            let text = text.to_string();
            return self.reply(&text, 0);
        }

        let outcome = self.platform.execute(line);
        if outcome.hang_up {
            self.last_code = outcome.code;
            return MockReply::HangUp(format!("{}\r\n", outcome.output));
        }
        self.reply(&outcome.output, outcome.code)
    }

    fn on_control(&mut self, byte: u8) -> MockReply {
        if byte == 0x03 {
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

    #[test]
    fn test_render_table_layout() {
        let table = render_table(&["id", "hostname"], &[vec!["1".into(), "controller-0".into()]]);
        let lines: Vec<&str> = table.split("\r\n").collect();
        assert_eq!(lines[0], "+----+--------------+");
        assert_eq!(lines[1], "| id | hostname     |");
        assert_eq!(lines[3], "| 1  | controller-0 |");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_transitions_over_time() {
        let platform = MockPlatform::standard();
        let outcome = platform.execute("system host-lock compute-0");
        assert_eq!(outcome.code, 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        let mid = platform.state("compute-0").unwrap();
        assert_eq!(mid.administrative, AdminState::Locked);
        assert!(!mid.is_resting());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            platform.state("compute-0").unwrap(),
            HostState::new(AdminState::Locked, OperState::Disabled, AvailState::Online)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_controller_lock_rejected() {
        let platform = MockPlatform::standard();
        let outcome = platform.execute("system host-lock controller-0");
        assert_eq!(outcome.code, 1);
        assert_eq!(
            platform.state("controller-0").unwrap().administrative,
            AdminState::Unlocked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_swact_moves_active_and_blocks_connects() {
        let platform = MockPlatform::standard();
        let outcome = platform.execute("system host-swact controller-0");
        assert!(outcome.hang_up);
        assert_eq!(platform.active_controller(), "controller-1");
        assert!(platform.accept().is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(platform.accept().unwrap(), "controller-1");
    }

    #[tokio::test]
    async fn test_openstack_delete_logs_and_reports_missing() {
        let platform = MockPlatform::new();
        let volume = ResourceRef::new(ResourceKind::Volume, "vol-1");
        platform.add_resource(volume.clone());

        assert_eq!(platform.execute("openstack volume show vol-1").code, 0);
        assert_eq!(platform.execute("openstack volume delete vol-1").code, 0);
        assert_eq!(platform.execute("openstack volume delete vol-1").code, 1);
        assert_eq!(platform.delete_log(), vec![volume]);
    }

    #[tokio::test]
    async fn test_multi_word_nouns() {
        let platform = MockPlatform::new();
        let qos = ResourceRef::new(ResourceKind::QosSpec, "qos-1");
        platform.add_resource(qos.clone());
        assert_eq!(platform.execute("openstack volume qos delete qos-1").code, 0);
        assert!(!platform.has_resource(&qos));
    }
}
