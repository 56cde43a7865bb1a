//! Subcommand implementations.

use anyhow::{Context, Result, bail};
use hostctl_common::config::Severity;
use hostctl_common::mock::MockPlatform;
use hostctl_common::session::{Connector, NetworkConnector};
use hostctl_common::{
    AdminState, AvailState, Cataloged, ErrorCode, HarnessConfig, HostError, HostStateController,
    LockOptions, OpResult, OperState, RebootOptions, Session, StateCriteria, SwactOptions,
    TransportKind, UnlockOptions, WaitOptions,
};
use serde_json::json;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Exit status for failures that are not an operation result.
pub const EXIT_ERROR: u8 = 10;

pub struct Output {
    pub json: bool,
}

impl Output {
    fn emit(&self, value: serde_json::Value, text: impl FnOnce() -> String) {
        if self.json {
            println!("{value}");
        } else {
            println!("{}", text());
        }
    }
}

/// Open a session to the configured lab and wrap it in a controller.
///
/// With the `mock` transport the lab is simulated in-process.
async fn connect(config: &HarnessConfig) -> Result<HostStateController> {
    let endpoint = config.endpoint()?;
    let (connector, credentials) = match endpoint.kind {
        TransportKind::Mock => {
            let platform = MockPlatform::standard();
            let connector: Arc<dyn Connector> = Arc::new(platform.connector());
            (connector, platform.credentials())
        }
        _ => {
            let connector: Arc<dyn Connector> = Arc::new(NetworkConnector);
            (connector, config.credentials())
        }
    };

    info!(endpoint = %endpoint, "connecting to lab");
    let session = Session::open(
        endpoint,
        credentials,
        &config.lab.initial_prompt,
        connector,
        config.session_options(),
    )
    .await
    .context("could not open session to the lab")?;

    let mut controller = HostStateController::new(session, config.host_timeouts());
    if let Some(template) = &config.lab.prompt_template {
        controller = controller.with_prompt_template(template.clone())?;
    }

    let cancel = controller.cancel_signal().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received; cancelling");
            cancel.cancel();
        }
    });

    Ok(controller)
}

fn secs(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_secs)
}

fn exit_status(result: &OpResult) -> u8 {
    if result.code.is_ok() {
        0
    } else {
        u8::try_from(result.code.code()).unwrap_or(EXIT_ERROR)
    }
}

fn report(result: OpResult, out: &Output) -> ExitCode {
    let code = ExitCode::from(exit_status(&result));
    let error_code = result.cause().map(|c| c.error_code().code_string());
    out.emit(
        json!({
            "code": result.code.code(),
            "status": result.code.as_str(),
            "host": result.host,
            "message": result.message,
            "elapsed_secs": result.elapsed.as_secs_f64(),
            "error_code": error_code,
        }),
        || result.to_string(),
    );
    code
}

async fn finish(mut controller: HostStateController) {
    if let Err(e) = controller.session_mut().close().await {
        debug!(error = %e, "error closing session");
    }
}

pub async fn hosts(config: &HarnessConfig, out: &Output) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let records = controller.host_records().await?;
    finish(controller).await;

    out.emit(serde_json::to_value(&records)?, || {
        let width = records.iter().map(|r| r.name.len()).max().unwrap_or(4).max(4);
        let mut lines = vec![format!(
            "{:<width$}  {:<10}  {:<14}  {:<11}  {}",
            "NAME", "PERSONALITY", "ADMINISTRATIVE", "OPERATIONAL", "AVAILABILITY"
        )];
        lines.extend(records.iter().map(|r| {
            format!(
                "{:<width$}  {:<10}  {:<14}  {:<11}  {}",
                r.name,
                r.personality.to_string(),
                r.state.administrative.to_string(),
                r.state.operational.to_string(),
                r.state.availability
            )
        }));
        lines.join("\n")
    });
    Ok(ExitCode::SUCCESS)
}

pub async fn show(config: &HarnessConfig, host: &str, out: &Output) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let record = controller.host_record(host).await;
    finish(controller).await;
    let record = record?;

    out.emit(serde_json::to_value(&record)?, || {
        let task = if record.task.is_empty() { "-" } else { record.task.as_str() };
        format!(
            "{} ({})\n  state: {}\n  task:  {}",
            record.name, record.personality, record.state, task
        )
    });
    Ok(ExitCode::SUCCESS)
}

pub async fn lock(
    config: &HarnessConfig,
    host: &str,
    force: bool,
    swact_if_active: bool,
    timeout: Option<u64>,
    out: &Output,
) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let options = LockOptions {
        force,
        swact_if_active,
        timeout: secs(timeout),
        ..LockOptions::default()
    };
    let result = controller.lock(host, options).await;
    finish(controller).await;
    Ok(report(result?, out))
}

pub async fn unlock(
    config: &HarnessConfig,
    host: &str,
    wait: bool,
    timeout: Option<u64>,
    out: &Output,
) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let options = UnlockOptions {
        wait_for_available: wait,
        timeout: secs(timeout),
        ..UnlockOptions::default()
    };
    let result = controller.unlock(host, options).await;
    finish(controller).await;
    Ok(report(result?, out))
}

pub async fn reboot(
    config: &HarnessConfig,
    host: &str,
    wait: bool,
    timeout: Option<u64>,
    out: &Output,
) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let options = RebootOptions {
        wait_for_finish: wait,
        timeout: secs(timeout),
    };
    let result = controller.reboot(host, options).await;
    finish(controller).await;
    Ok(report(result?, out))
}

pub async fn swact(config: &HarnessConfig, wait: bool, timeout: Option<u64>, out: &Output) -> Result<ExitCode> {
    let mut controller = connect(config).await?;
    let options = SwactOptions {
        wait,
        timeout: secs(timeout),
    };
    let result = controller.swact(options).await;
    finish(controller).await;
    Ok(report(result?, out))
}

pub struct WaitRequest {
    pub hosts: Vec<String>,
    pub admin: Vec<String>,
    pub oper: Vec<String>,
    pub avail: Vec<String>,
    pub timeout: u64,
    pub stable_for: u64,
    pub fail_ok: bool,
}

fn parse_states<T: FromStr>(values: &[String]) -> Result<Option<Vec<T>>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if values.is_empty() {
        return Ok(None);
    }
    let parsed = values
        .iter()
        .map(|v| v.parse::<T>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(parsed))
}

impl WaitRequest {
    fn criteria(&self) -> Result<StateCriteria> {
        let mut criteria = StateCriteria::new();
        if let Some(admin) = parse_states::<AdminState>(&self.admin)? {
            criteria = criteria.administrative(admin);
        }
        if let Some(oper) = parse_states::<OperState>(&self.oper)? {
            criteria = criteria.operational(oper);
        }
        if let Some(avail) = parse_states::<AvailState>(&self.avail)? {
            criteria = criteria.availability(avail);
        }
        if criteria.is_empty() {
            bail!("give at least one of --admin, --oper or --avail");
        }
        Ok(criteria)
    }
}

pub async fn wait(config: &HarnessConfig, request: WaitRequest, out: &Output) -> Result<ExitCode> {
    let criteria = request.criteria()?;
    let options = WaitOptions::new(Duration::from_secs(request.timeout))
        .check_interval(config.host_timeouts().check_interval)
        .stable_for(Duration::from_secs(request.stable_for))
        .fail_ok(request.fail_ok);

    let mut controller = connect(config).await?;
    let outcome = controller
        .wait_for_states(request.hosts.as_slice(), &criteria, &options)
        .await;
    finish(controller).await;

    match outcome {
        Ok(outcome) => {
            let states: serde_json::Map<_, _> = outcome
                .states
                .iter()
                .map(|(host, state)| (host.clone(), json!(state.map(|s| s.to_string()))))
                .collect();
            out.emit(
                json!({
                    "satisfied": outcome.satisfied,
                    "expected": criteria.to_string(),
                    "states": states,
                    "elapsed_secs": outcome.elapsed.as_secs_f64(),
                }),
                || {
                    let verdict = if outcome.satisfied { "reached" } else { "not reached" };
                    let mut lines = vec![format!("{criteria}: {verdict} after {:.1?}", outcome.elapsed)];
                    for (host, state) in &outcome.states {
                        let state = state.map_or_else(|| "<unknown>".to_string(), |s| s.to_string());
                        lines.push(format!("  {host}: {state}"));
                    }
                    lines.join("\n")
                },
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e @ HostError::StateTimeout { .. }) => {
            out.emit(
                json!({"satisfied": false, "error_code": e.error_code().code_string(), "message": e.to_string()}),
                || e.to_string(),
            );
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn config_show(config: &HarnessConfig, out: &Output) -> Result<ExitCode> {
    let mut shown = config.clone();
    if !shown.lab.password.is_empty() {
        shown.lab.password = "***".to_string();
    }
    if out.json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        println!("{shown:#?}");
    }
    Ok(ExitCode::SUCCESS)
}

pub fn config_validate(config: &HarnessConfig, out: &Output) -> Result<ExitCode> {
    let findings = config.validate();
    let failed = findings.iter().any(|f| f.severity == Severity::Error);
    out.emit(json!({"valid": !failed, "findings": findings}), || {
        if findings.is_empty() {
            return "configuration ok".to_string();
        }
        findings.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    });
    Ok(if failed {
        ExitCode::from(EXIT_ERROR)
    } else {
        ExitCode::SUCCESS
    })
}

fn find_code(query: &str) -> Option<ErrorCode> {
    let wanted = query.trim().to_ascii_uppercase();
    let wanted = wanted.strip_prefix("HCT-").unwrap_or(&wanted);
    ErrorCode::all()
        .iter()
        .copied()
        .find(|c| c.code_string().strip_prefix("HCT-") == Some(wanted))
}

pub fn explain(code: Option<&str>, out: &Output) -> Result<ExitCode> {
    let codes: Vec<ErrorCode> = match code {
        Some(query) => match find_code(query) {
            Some(code) => vec![code],
            None => bail!("unknown error code '{query}'"),
        },
        None => ErrorCode::all().to_vec(),
    };

    let entries: Vec<_> = codes.iter().map(|c| c.entry()).collect();
    out.emit(serde_json::to_value(&entries)?, || {
        if code.is_some() {
            entries.iter().map(|e| e.format_full()).collect::<Vec<_>>().join("\n\n")
        } else {
            entries.iter().map(|e| e.format_brief()).collect::<Vec<_>>().join("\n")
        }
    });
    Ok(ExitCode::SUCCESS)
}
