//! Host lifecycle state machine.
//!
//! Every operation is a platform CLI command followed by a bounded poll of
//! `system host-list` until the target state holds. Operations return an
//! [`OpResult`] rather than failing, because negative-path tests assert on
//! rejection and timeout codes; `Err` is reserved for lost sessions that
//! could not be recovered and for invalid arguments.

mod cancel;
mod outcome;
mod resources;

pub use cancel::CancelSignal;
pub use outcome::{OpCode, OpResult, WaitOutcome};

use crate::errors::HostError;
use crate::parser::{HostListParser, TableParser};
use crate::recovery::{ResourceRef, RestoreAction, Restorer};
use crate::session::{CommandOutput, Session};
use crate::types::{AdminState, AvailState, HostRecord, HostState, OperState, Personality, StateCriteria};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Named per-operation timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTimeouts {
    /// Lock command to `administrative == locked`.
    pub lock: Duration,
    /// Locked to `availability == online`.
    pub online_after_lock: Duration,
    pub controller_unlock: Duration,
    pub compute_unlock: Duration,
    pub storage_unlock: Duration,
    /// Whole reboot window, down and back up.
    pub reboot: Duration,
    /// Reboot command to the host actually going down.
    pub fail_after_reboot: Duration,
    /// Swact command to a new active controller answering.
    pub swact: Duration,
    /// Budget for each reconnect attempt while a swact is in progress.
    pub swact_start: Duration,
    /// Host in service to its `task` column clearing after an unlock.
    pub task_clear: Duration,
    pub check_interval: Duration,
    /// Prompt timeout for a single CLI command.
    pub command: Duration,
}

impl Default for HostTimeouts {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(900),
            online_after_lock: Duration::from_secs(1200),
            controller_unlock: Duration::from_secs(1360),
            compute_unlock: Duration::from_secs(840),
            storage_unlock: Duration::from_secs(1200),
            reboot: Duration::from_secs(2400),
            fail_after_reboot: Duration::from_secs(120),
            swact: Duration::from_secs(600),
            swact_start: Duration::from_secs(60),
            task_clear: Duration::from_secs(180),
            check_interval: Duration::from_secs(5),
            command: Duration::from_secs(60),
        }
    }
}

impl HostTimeouts {
    pub fn unlock_timeout(&self, personality: Personality) -> Duration {
        match personality {
            Personality::Controller => self.controller_unlock,
            Personality::Compute => self.compute_unlock,
            Personality::Storage => self.storage_unlock,
        }
    }
}

/// Polling parameters for [`HostStateController::wait_for_states`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub check_interval: Duration,
    /// Return an unsatisfied outcome instead of `StateTimeout`.
    pub fail_ok: bool,
    /// The criteria must hold continuously this long.
    pub stable_for: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            check_interval: Duration::from_secs(5),
            fail_ok: false,
            stable_for: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    #[must_use]
    pub fn fail_ok(mut self, fail_ok: bool) -> Self {
        self.fail_ok = fail_ok;
        self
    }

    #[must_use]
    pub fn stable_for(mut self, duration: Duration) -> Self {
        self.stable_for = duration;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    pub force: bool,
    /// Swact away first when the host is the active controller.
    pub swact_if_active: bool,
    /// Return `AlreadyInState` without issuing anything if already locked.
    pub check_first: bool,
    pub timeout: Option<Duration>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            force: false,
            swact_if_active: true,
            check_first: true,
            timeout: None,
        }
    }
}

impl LockOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockOptions {
    pub timeout: Option<Duration>,
    pub wait_for_available: bool,
    /// Availability values that count as unlocked and ready.
    pub accepted: Vec<AvailState>,
    /// An unlocked host returns `AlreadyInState` once it is in service,
    /// without issuing the unlock.
    pub check_first: bool,
    /// After the host is available, wait for its task column to clear.
    pub wait_for_task_clear: bool,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            wait_for_available: true,
            accepted: AvailState::IN_SERVICE.to_vec(),
            check_first: true,
            wait_for_task_clear: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootOptions {
    pub wait_for_finish: bool,
    pub timeout: Option<Duration>,
}

impl Default for RebootOptions {
    fn default() -> Self {
        Self {
            wait_for_finish: true,
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwactOptions {
    pub wait: bool,
    pub timeout: Option<Duration>,
}

impl Default for SwactOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }
}

enum Waited {
    Reached,
    TimedOut(HostError),
    Cancelled,
}

pub struct HostStateController {
    session: Session,
    timeouts: HostTimeouts,
    parser: Box<dyn HostListParser>,
    cancel: CancelSignal,
    prompt_template: Option<String>,
}

impl HostStateController {
    pub fn new(session: Session, timeouts: HostTimeouts) -> Self {
        Self {
            session,
            timeouts,
            parser: Box::new(TableParser),
            cancel: CancelSignal::new(),
            prompt_template: None,
        }
    }

    #[must_use]
    pub fn with_parser(mut self, parser: Box<dyn HostListParser>) -> Self {
        self.parser = parser;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Prompt regex for a specific controller, with `{host}` standing for
    /// its escaped name. Applied after each swact.
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Result<Self, HostError> {
        let template = template.into();
        if !template.contains("{host}") {
            return Err(HostError::InvalidArgument(format!(
                "prompt template '{template}' has no {{host}} placeholder"
            )));
        }
        self.prompt_template = Some(template);
        Ok(self)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn timeouts(&self) -> &HostTimeouts {
        &self.timeouts
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    fn wait_options(&self, timeout: Duration) -> WaitOptions {
        WaitOptions::new(timeout).check_interval(self.timeouts.check_interval)
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub(crate) async fn run(&mut self, command: &str) -> Result<CommandOutput, HostError> {
        let budget = self.timeouts.command;
        self.run_within(command, budget).await
    }

    /// Run with the command timeout capped at `budget`.
    async fn run_within(&mut self, command: &str, budget: Duration) -> Result<CommandOutput, HostError> {
        let timeout = self.timeouts.command.min(budget);
        Ok(self.session.exec(command, timeout).await?)
    }

    async fn run_checked(&mut self, command: &str, budget: Duration) -> Result<String, HostError> {
        let out = self.run_within(command, budget).await?;
        if !out.success() {
            return Err(HostError::CommandRejected {
                command: command.to_string(),
                code: out.code,
                output: out.output,
            });
        }
        Ok(out.output)
    }

    /// Every host, from `system host-list`.
    pub async fn host_records(&mut self) -> Result<Vec<HostRecord>, HostError> {
        let budget = self.timeouts.command;
        self.host_records_within(budget).await
    }

    async fn host_records_within(&mut self, budget: Duration) -> Result<Vec<HostRecord>, HostError> {
        const COMMAND: &str = "system host-list";
        let output = self.run_checked(COMMAND, budget).await?;
        self.parser
            .parse_host_list(&output)
            .map_err(|e| HostError::Parse {
                command: COMMAND.to_string(),
                detail: e.to_string(),
            })
    }

    /// One host, from `system host-show`, including its current task.
    pub async fn host_record(&mut self, host: &str) -> Result<HostRecord, HostError> {
        let budget = self.timeouts.command;
        self.host_record_within(host, budget).await
    }

    async fn host_record_within(&mut self, host: &str, budget: Duration) -> Result<HostRecord, HostError> {
        let command = format!("system host-show {host}");
        let out = self.run_within(&command, budget).await?;
        if !out.success() {
            if out.output.to_ascii_lowercase().contains("not found") {
                return Err(HostError::UnknownHost(host.to_string()));
            }
            return Err(HostError::CommandRejected {
                command,
                code: out.code,
                output: out.output,
            });
        }
        self.parser
            .parse_host_show(&out.output)
            .map_err(|e| HostError::Parse {
                command,
                detail: e.to_string(),
            })
    }

    pub async fn host_state(&mut self, host: &str) -> Result<HostState, HostError> {
        Ok(self.host_record(host).await?.state)
    }

    /// Hostname answering the session, i.e. the active controller.
    pub async fn active_controller(&mut self) -> Result<String, HostError> {
        Ok(self.session.hostname().await?)
    }

    /// An in-service controller other than `active`.
    pub async fn standby_controller(&mut self, active: &str) -> Result<Option<String>, HostError> {
        Ok(self
            .host_records()
            .await?
            .into_iter()
            .find(|h| h.is_controller() && h.name != active && h.state.is_in_service())
            .map(|h| h.name))
    }

    // ── Polling ────────────────────────────────────────────────────────────

    /// Poll until every host in `hosts` matches `criteria`.
    ///
    /// Failed polls (CLI errors, unparseable output, a dropped session) count
    /// as "not yet"; a dropped session is reconnected between polls. Each
    /// poll and reconnect is bounded by the time left before the deadline. On
    /// timeout returns `StateTimeout`, or an unsatisfied outcome when
    /// `fail_ok` is set. A host missing from the host list fails at once.
    pub async fn wait_for_states<H: AsRef<str>>(
        &mut self,
        hosts: &[H],
        criteria: &StateCriteria,
        options: &WaitOptions,
    ) -> Result<WaitOutcome, HostError> {
        let hosts: Vec<String> = hosts.iter().map(|h| h.as_ref().to_string()).collect();
        if hosts.is_empty() {
            return Err(HostError::InvalidArgument("no hosts to wait for".to_string()));
        }

        let cancel = self.cancel.clone();
        let start = Instant::now();
        let deadline = start + options.timeout;
        let mut states: BTreeMap<String, Option<HostState>> =
            hosts.iter().map(|h| (h.clone(), None)).collect();
        let mut holding_since: Option<Instant> = None;

        info!(
            hosts = ?hosts,
            expected = %criteria,
            timeout_secs = options.timeout.as_secs(),
            "waiting for host states"
        );

        loop {
            if cancel.is_cancelled() {
                warn!(hosts = ?hosts, "wait cancelled");
                return Err(HostError::Cancelled);
            }

            match self.poll(&hosts, deadline).await {
                Ok(polled) => {
                    states.extend(polled.into_iter().map(|(h, s)| (h, Some(s))));
                    let all_match = states
                        .values()
                        .all(|s| s.is_some_and(|s| criteria.matches(&s)));
                    if all_match {
                        let since = *holding_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= options.stable_for {
                            let elapsed = start.elapsed();
                            info!(hosts = ?hosts, elapsed_secs = elapsed.as_secs(), "hosts reached expected state");
                            return Ok(WaitOutcome {
                                satisfied: true,
                                states,
                                elapsed,
                            });
                        }
                    } else {
                        holding_since = None;
                    }
                }
                Err(HostError::UnknownHost(host)) => return Err(HostError::UnknownHost(host)),
                Err(HostError::Session(e)) if e.is_transport_fatal() => {
                    holding_since = None;
                    warn!(error = %e, "session lost while polling; reconnecting");
                    self.try_reconnect(deadline).await;
                }
                Err(e) => {
                    holding_since = None;
                    debug!(error = %e, "poll failed; treating as not yet satisfied");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = options.check_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => {}
            }
        }

        let elapsed = start.elapsed();
        if options.fail_ok {
            warn!(hosts = ?hosts, expected = %criteria, elapsed_secs = elapsed.as_secs(), "hosts did not reach expected state");
            return Ok(WaitOutcome {
                satisfied: false,
                states,
                elapsed,
            });
        }
        Err(HostError::StateTimeout {
            hosts,
            expected: criteria.clone(),
            observed: states.into_iter().collect(),
            elapsed,
        })
    }

    async fn poll(&mut self, hosts: &[String], deadline: Instant) -> Result<Vec<(String, HostState)>, HostError> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let records = self.host_records_within(budget).await?;
        hosts
            .iter()
            .map(|host| {
                records
                    .iter()
                    .find(|r| &r.name == host)
                    .map(|r| (host.clone(), r.state))
                    .ok_or_else(|| HostError::UnknownHost(host.clone()))
            })
            .collect()
    }

    /// Single reconnect attempt; failures are left for the next poll. An
    /// attempt still running at `deadline` is abandoned and the session
    /// closed, so the next poll starts from a fresh connection.
    async fn try_reconnect(&mut self, deadline: Instant) {
        let budget = deadline.saturating_duration_since(Instant::now());
        let interval = self.timeouts.check_interval;
        let attempt = async {
            self.session
                .reconnect(false, interval, interval)
                .await
                .map_err(HostError::from)?;
            self.narrow_prompt().await
        };
        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(error = %e, "reconnect attempt failed"),
            Err(_) => {
                debug!(budget_secs = budget.as_secs(), "reconnect attempt ran past the wait deadline");
                if let Err(e) = self.session.close().await {
                    debug!(error = %e, "closing abandoned session failed");
                }
            }
        }
    }

    /// Poll `system host-show` until the host's task column is empty.
    async fn wait_for_task_clear(&mut self, host: &str, timeout: Duration) -> Result<Waited, HostError> {
        let cancel = self.cancel.clone();
        let start = Instant::now();
        let deadline = start + timeout;
        let mut task = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(Waited::Cancelled);
            }
            let budget = deadline.saturating_duration_since(Instant::now());
            match self.host_record_within(host, budget).await {
                Ok(record) if record.task.is_empty() => return Ok(Waited::Reached),
                Ok(record) => task = record.task,
                Err(HostError::UnknownHost(host)) => return Err(HostError::UnknownHost(host)),
                Err(HostError::Session(e)) if e.is_transport_fatal() => {
                    warn!(error = %e, "session lost while waiting for task to clear; reconnecting");
                    self.try_reconnect(deadline).await;
                }
                Err(e) => debug!(error = %e, "host-show failed; treating task as not yet cleared"),
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = self.timeouts.check_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => {}
            }
        }

        warn!(host, task = %task, "task did not clear");
        Ok(Waited::TimedOut(HostError::PostCheckFailed {
            host: host.to_string(),
            detail: format!("task '{task}' not cleared within {}s of the host going available", timeout.as_secs()),
            elapsed: start.elapsed(),
        }))
    }

    /// Apply the prompt template for whichever controller now answers.
    async fn narrow_prompt(&mut self) -> Result<Option<String>, HostError> {
        let Some(template) = self.prompt_template.clone() else {
            return Ok(None);
        };
        let active = self.active_controller().await?;
        let prompt = template.replace("{host}", &regex::escape(&active));
        self.session.set_prompt(&prompt)?;
        Ok(Some(active))
    }

    /// Wait with the controller's check interval, folding the outcome into
    /// the three cases operations care about.
    async fn wait_step(&mut self, host: &str, criteria: &StateCriteria, timeout: Duration) -> Result<Waited, HostError> {
        let options = self.wait_options(timeout);
        match self.wait_for_states(&[host], criteria, &options).await {
            Ok(_) => Ok(Waited::Reached),
            Err(e @ HostError::StateTimeout { .. }) => Ok(Waited::TimedOut(e)),
            Err(HostError::Cancelled) => Ok(Waited::Cancelled),
            Err(e) => Err(e),
        }
    }

    // ── Operations ─────────────────────────────────────────────────────────

    /// Lock `host`.
    ///
    /// The active controller cannot be locked, so unless `force` is set it
    /// is swacted away first when an in-service standby exists. Without a
    /// standby the lock is issued anyway and the platform's rejection is
    /// returned as `Rejected`.
    pub async fn lock(&mut self, host: &str, options: LockOptions) -> Result<OpResult, HostError> {
        let start = Instant::now();
        let record = self.host_record(host).await?;

        if options.check_first && record.state.administrative == AdminState::Locked {
            info!(host, "host already locked");
            return Ok(OpResult::new(
                OpCode::AlreadyInState,
                Some(host),
                "host is already locked",
                start.elapsed(),
            ));
        }

        if !options.force && options.swact_if_active && record.is_controller() {
            let active = self.active_controller().await?;
            if active == host {
                if self.standby_controller(&active).await?.is_some() {
                    info!(host, "host is the active controller; swacting before lock");
                    let swact = self.swact(SwactOptions::default()).await?;
                    if !swact.is_success() {
                        let message = format!("swact before lock failed: {}", swact.message);
                        return Ok(OpResult::new(swact.code, Some(host), message, start.elapsed()));
                    }
                } else {
                    warn!(host, "active controller has no in-service standby to swact to");
                }
            }
        }

        let command = if options.force {
            format!("system host-lock {host} --force")
        } else {
            format!("system host-lock {host}")
        };
        info!(host, force = options.force, "locking host");
        let out = self.run(&command).await?;
        if !out.success() {
            return Ok(rejected(host, command, out, start));
        }

        let timeout = options.timeout.unwrap_or(self.timeouts.lock);
        let locked = StateCriteria::new().administrative(AdminState::Locked);
        match self.wait_step(host, &locked, timeout).await? {
            Waited::Reached => {}
            Waited::TimedOut(e) => return Ok(OpResult::failure(OpCode::StateTimeout, Some(host), e, start.elapsed())),
            Waited::Cancelled => return Ok(cancelled(host, start)),
        }

        if !options.force {
            let online = StateCriteria::new()
                .administrative(AdminState::Locked)
                .availability(AvailState::Online);
            let timeout = self.timeouts.online_after_lock;
            match self.wait_step(host, &online, timeout).await? {
                Waited::Reached => {}
                Waited::TimedOut(e) => {
                    let elapsed = start.elapsed();
                    let cause = HostError::PostCheckFailed {
                        host: host.to_string(),
                        detail: format!("locked but never came online: {e}"),
                        elapsed,
                    };
                    return Ok(OpResult::failure(OpCode::PostCheckFailed, Some(host), cause, elapsed));
                }
                Waited::Cancelled => return Ok(cancelled(host, start)),
            }
        }

        info!(host, elapsed_secs = start.elapsed().as_secs(), "host locked");
        Ok(OpResult::new(OpCode::Success, Some(host), "host locked", start.elapsed()))
    }

    /// Unlock `host` and, unless told not to, wait until it is enabled with
    /// an accepted availability and its task has cleared.
    ///
    /// With `check_first`, a host that is already unlocked is not unlocked
    /// again: it is `AlreadyInState` if in service, and otherwise (when
    /// waiting) is waited into service like a fresh unlock.
    pub async fn unlock(&mut self, host: &str, options: UnlockOptions) -> Result<OpResult, HostError> {
        let start = Instant::now();
        if options.accepted.is_empty() {
            return Err(HostError::InvalidArgument("accepted availability set is empty".to_string()));
        }
        let record = self.host_record(host).await?;
        let ready = StateCriteria::new()
            .administrative(AdminState::Unlocked)
            .operational(OperState::Enabled)
            .availability(options.accepted.clone());

        let already = options.check_first && record.state.administrative == AdminState::Unlocked;
        if already {
            let settled = !options.wait_for_task_clear || record.task.is_empty();
            if ready.matches(&record.state) && settled {
                info!(host, state = %record.state, "host already unlocked");
                return Ok(OpResult::new(
                    OpCode::AlreadyInState,
                    Some(host),
                    format!("host is already unlocked ({})", record.state),
                    start.elapsed(),
                ));
            }
            if !options.wait_for_available {
                return Ok(OpResult::new(
                    OpCode::AlreadyInState,
                    Some(host),
                    format!("host is already unlocked but not yet in service ({})", record.state),
                    start.elapsed(),
                ));
            }
            info!(host, state = %record.state, task = %record.task, "host already unlocked; waiting for it to come into service");
        } else {
            let command = format!("system host-unlock {host}");
            info!(host, "unlocking host");
            let out = self.run(&command).await?;
            if !out.success() {
                return Ok(rejected(host, command, out, start));
            }
            if !options.wait_for_available {
                return Ok(OpResult::new(OpCode::Dispatched, Some(host), "unlock issued", start.elapsed()));
            }
        }

        let timeout = options
            .timeout
            .unwrap_or_else(|| self.timeouts.unlock_timeout(record.personality));
        match self.wait_step(host, &ready, timeout).await? {
            Waited::Reached => {}
            Waited::TimedOut(e) => return Ok(OpResult::failure(OpCode::StateTimeout, Some(host), e, start.elapsed())),
            Waited::Cancelled => return Ok(cancelled(host, start)),
        }

        if options.wait_for_task_clear {
            let timeout = self.timeouts.task_clear;
            match self.wait_for_task_clear(host, timeout).await? {
                Waited::Reached => {}
                Waited::TimedOut(e) => {
                    return Ok(OpResult::failure(OpCode::PostCheckFailed, Some(host), e, start.elapsed()));
                }
                Waited::Cancelled => return Ok(cancelled(host, start)),
            }
        }

        info!(host, elapsed_secs = start.elapsed().as_secs(), "host unlocked");
        if already {
            return Ok(OpResult::new(
                OpCode::AlreadyInState,
                Some(host),
                "host was already unlocked and is now in service",
                start.elapsed(),
            ));
        }
        Ok(OpResult::new(OpCode::Success, Some(host), "host unlocked", start.elapsed()))
    }

    /// Reboot `host` and wait for it to go down and come back.
    ///
    /// The host may keep reporting its old availability for a while after
    /// the command, so the down phase has its own `fail_after_reboot`
    /// window. Locked hosts come back `online`; unlocked hosts come back
    /// in service. Both phases share one `reboot` timeout.
    pub async fn reboot(&mut self, host: &str, options: RebootOptions) -> Result<OpResult, HostError> {
        let start = Instant::now();
        let record = self.host_record(host).await?;

        let command = format!("system host-reboot {host}");
        info!(host, state = %record.state, "rebooting host");
        let out = self.run(&command).await?;
        if !out.success() {
            return Ok(rejected(host, command, out, start));
        }
        if !options.wait_for_finish {
            return Ok(OpResult::new(OpCode::Dispatched, Some(host), "reboot issued", start.elapsed()));
        }

        let total = options.timeout.unwrap_or(self.timeouts.reboot);
        let down = StateCriteria::new().availability(AvailState::DOWN);
        let down_window = self.timeouts.fail_after_reboot.min(total);
        match self.wait_step(host, &down, down_window).await? {
            Waited::Reached => debug!(host, "host went down"),
            Waited::TimedOut(e) => {
                let elapsed = start.elapsed();
                let cause = HostError::PostCheckFailed {
                    host: host.to_string(),
                    detail: format!("host never went down after reboot: {e}"),
                    elapsed,
                };
                return Ok(OpResult::failure(OpCode::PostCheckFailed, Some(host), cause, elapsed));
            }
            Waited::Cancelled => return Ok(cancelled(host, start)),
        }

        let up = match record.state.administrative {
            AdminState::Locked => StateCriteria::new()
                .administrative(AdminState::Locked)
                .availability(AvailState::Online),
            AdminState::Unlocked => StateCriteria::in_service(),
        };
        let remaining = total.saturating_sub(start.elapsed());
        match self.wait_step(host, &up, remaining).await? {
            Waited::Reached => {
                info!(host, elapsed_secs = start.elapsed().as_secs(), "host back after reboot");
                Ok(OpResult::new(OpCode::Success, Some(host), "host rebooted", start.elapsed()))
            }
            Waited::TimedOut(e) => Ok(OpResult::failure(OpCode::StateTimeout, Some(host), e, start.elapsed())),
            Waited::Cancelled => Ok(cancelled(host, start)),
        }
    }

    /// Swap active and standby controllers.
    ///
    /// The platform picks the standby. Success means a different controller
    /// answers the session within the swact timeout; if the CLI accepted
    /// the swact but nothing new answers in time the result is
    /// `PostCheckFailed`.
    pub async fn swact(&mut self, options: SwactOptions) -> Result<OpResult, HostError> {
        let start = Instant::now();
        let old = self.active_controller().await?;
        let command = format!("system host-swact {old}");
        info!(active = %old, "swacting controllers");

        match self.run(&command).await {
            Ok(out) if !out.success() => return Ok(rejected(&old, command, out, start)),
            Ok(_) => {}
            // The floating address moves; losing the session here is expected.
            Err(HostError::Session(e)) if e.is_transport_fatal() => {
                debug!(error = %e, "session dropped during swact");
            }
            Err(e) => return Err(e),
        }
        if !options.wait {
            return Ok(OpResult::new(OpCode::Dispatched, Some(&old), "swact issued", start.elapsed()));
        }

        let timeout = options.timeout.unwrap_or(self.timeouts.swact);
        let deadline = start + timeout;
        let cancel = self.cancel.clone();

        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                return Ok(cancelled(&old, start));
            }
            match self.new_active(&old, deadline).await {
                Ok(Some(new)) => {
                    info!(old = %old, new = %new, elapsed_secs = start.elapsed().as_secs(), "swact complete");
                    return Ok(OpResult::new(
                        OpCode::Success,
                        Some(&new),
                        format!("{new} is now active (was {old})"),
                        start.elapsed(),
                    ));
                }
                Ok(None) => debug!(active = %old, "old controller still active"),
                Err(e) => debug!(error = %e, "new active controller not reachable yet"),
            }
            let nap = self
                .timeouts
                .check_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = cancel.cancelled() => {}
            }
        }

        let elapsed = start.elapsed();
        warn!(old = %old, elapsed_secs = elapsed.as_secs(), "no new active controller after swact");
        let cause = HostError::PostCheckFailed {
            host: old.clone(),
            detail: format!("no new active controller answered within {timeout:?}"),
            elapsed,
        };
        Ok(OpResult::failure(OpCode::PostCheckFailed, Some(&old), cause, elapsed))
    }

    /// Reconnect if needed and report the active controller if it changed.
    async fn new_active(&mut self, old: &str, deadline: Instant) -> Result<Option<String>, HostError> {
        let interval = self.timeouts.check_interval;
        let budget = self
            .timeouts
            .swact_start
            .min(deadline.saturating_duration_since(Instant::now()));
        self.session.reconnect(true, interval, budget).await?;

        let active = match self.narrow_prompt().await? {
            Some(active) => active,
            None => self.active_controller().await?,
        };
        Ok((active != old).then_some(active))
    }
}

fn rejected(host: &str, command: String, out: CommandOutput, start: Instant) -> OpResult {
    let output = out.output.trim().to_string();
    warn!(host, command = %command, code = out.code, output = %output, "command rejected");
    let cause = HostError::CommandRejected {
        command,
        code: out.code,
        output: output.clone(),
    };
    let mut result = OpResult::failure(OpCode::Rejected, Some(host), cause, start.elapsed());
    result.message = output;
    result
}

fn cancelled(host: &str, start: Instant) -> OpResult {
    OpResult::failure(OpCode::Cancelled, Some(host), HostError::Cancelled, start.elapsed())
}

#[async_trait]
impl Restorer for HostStateController {
    async fn prepare(&mut self) -> Result<(), HostError> {
        self.session
            .ensure_connected()
            .await
            .map(|_| ())
            .map_err(HostError::from)
    }

    /// Unlock a locked host; wait out a host that is unlocked but still
    /// coming up.
    async fn restore_host(&mut self, host: &str) -> Result<RestoreAction, HostError> {
        let record = self.host_record(host).await?;
        if record.state.administrative == AdminState::Locked {
            self.unlock(host, UnlockOptions::default()).await?.into_result()?;
            return Ok(RestoreAction::Unlocked);
        }
        if record.state.is_in_service() {
            return Ok(RestoreAction::AlreadyHealthy);
        }

        let options = self.wait_options(self.timeouts.unlock_timeout(record.personality));
        self.wait_for_states(&[host], &StateCriteria::in_service(), &options)
            .await?;
        Ok(RestoreAction::Settled)
    }

    async fn remove_resource(&mut self, resource: &ResourceRef) -> Result<RestoreAction, HostError> {
        if !self.resource_exists(resource).await? {
            return Ok(RestoreAction::AlreadyAbsent);
        }
        let result = self.delete_resource(resource).await?;
        if result.code == OpCode::AlreadyInState {
            return Ok(RestoreAction::AlreadyAbsent);
        }
        result.into_result()?;
        Ok(RestoreAction::Deleted)
    }
}
