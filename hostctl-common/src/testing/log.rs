//! Structured logging for harness tests.
//!
//! [`init_test_logging`] routes `tracing` output through the test writer so
//! it shows up under `cargo test -- --nocapture`, and additionally appends
//! JSON lines to `HOSTCTL_TEST_LOG_FILE` when that variable is set.
//!
//! [`TestLogger`] records the phases of one lifecycle scenario (setup,
//! execute, verify, teardown) so a failed run can be read back afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing_subscriber::prelude::*;

static INIT: Once = Once::new();

/// Install a test subscriber once per process. Safe to call from every test.
///
/// `HOSTCTL_TEST_LOG_LEVEL` sets the filter (default `debug` for hostctl
/// crates, `warn` elsewhere).
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("HOSTCTL_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "warn,hostctl_common={level},hostctl={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let file_layer = std::env::var_os("HOSTCTL_TEST_LOG_FILE")
            .map(PathBuf::from)
            .and_then(|path| {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .ok()
            })
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_current_span(true)
            });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    /// Recovery of whatever the scenario changed.
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the logger was created.
    pub elapsed_ms: u64,
}

/// Per-scenario phase log. Every entry is also emitted as a `tracing` event.
pub struct TestLogger {
    test_name: String,
    start: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        init_test_logging();
        let logger = Self {
            test_name: test_name.to_string(),
            start: Instant::now(),
            entries: Mutex::new(Vec::new()),
        };
        logger.log(TestPhase::Setup, "test start");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.push(phase, message.into(), None);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        self.push(phase, message.into(), Some(data));
    }

    fn push(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        tracing::info!(test = %self.test_name, %phase, data = ?data, "{message}");
        let entry = TestLogEntry {
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
            test_name: self.test_name.clone(),
            phase,
            message,
            data,
            elapsed_ms: self.start.elapsed().as_millis() as u64,
        };
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn entries(&self) -> Vec<TestLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Entries of one phase, in order.
    pub fn phase(&self, phase: TestPhase) -> Vec<TestLogEntry> {
        self.entries().into_iter().filter(|e| e.phase == phase).collect()
    }

    /// All entries as JSON lines.
    pub fn to_jsonl(&self) -> String {
        self.entries()
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_records_phases_in_order() {
        let logger = TestLogger::for_test("test_logger_records_phases_in_order");
        logger.log(TestPhase::Execute, "lock compute-0");
        logger.log_with_data(
            TestPhase::Teardown,
            "recovered",
            serde_json::json!({"unlocked": ["compute-0"]}),
        );

        let entries = logger.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].phase, TestPhase::Setup);
        assert_eq!(logger.phase(TestPhase::Execute)[0].message, "lock compute-0");
        assert!(entries[2].data.is_some());
    }

    #[test]
    fn test_jsonl_one_line_per_entry() {
        let logger = TestLogger::for_test("test_jsonl_one_line_per_entry");
        logger.log(TestPhase::Verify, "state ok");
        let jsonl = logger.to_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
        for line in jsonl.lines() {
            let entry: TestLogEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.test_name, "test_jsonl_one_line_per_entry");
        }
        assert!(jsonl.contains("\"phase\":\"verify\""));
    }
}
