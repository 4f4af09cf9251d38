//! Test-side logging helpers.
//!
//! `test_guard!()` at the top of a test records START and PASS/FAIL lines
//! into `target/test-logs/<test>.jsonl` when `CHAOS_TEST_LOGGING=1` (or in
//! CI). Lifecycle tests use it to leave a trail of state transitions that
//! can be inspected after a flaky failure.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Verify,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a test-writer subscriber once per process. Later calls are no-ops.
///
/// Level comes from `CHAOS_TEST_LOG_LEVEL` (default `info`).
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let level = std::env::var("CHAOS_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "chaosd={level},chaos_common={level},chaos_telemetry={level},chaos_wkr={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .compact()
            .try_init();
    });
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub elapsed_ms: u64,
}

/// Per-test JSONL log.
pub struct TestLogger {
    test_name: String,
    started: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
    file: Option<Mutex<std::fs::File>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let logger = Self {
            test_name: test_name.to_string(),
            started: Instant::now(),
            entries: Mutex::new(Vec::new()),
            file: open_log_file(test_name).ok().map(Mutex::new),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.push(phase, message.into(), None);
    }

    #[cfg(test)]
    fn entries(&self) -> Vec<TestLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: self.test_name.clone(),
            phase,
            message,
            data,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        };

        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(f, "{json}");
        }

        tracing::info!(test = %self.test_name, phase = %entry.phase, "{}", entry.message);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

fn open_log_file(test_name: &str) -> std::io::Result<std::fs::File> {
    let log_dir = target_dir().join("test-logs");
    std::fs::create_dir_all(&log_dir)?;
    let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
    std::fs::File::create(log_dir.join(format!("{safe_name}.jsonl")))
}

fn target_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(dir);
    }
    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let candidate = cwd.join("target");
        if candidate.is_dir() {
            return candidate;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

/// Logs TEST PASS on normal drop and TEST FAIL when dropped by a panic.
/// A no-op unless test logging is enabled.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let inner = if Self::enabled() {
            init_test_logging();
            Some(TestLogger::for_test(test_name))
        } else {
            None
        };
        Self { inner }
    }

    fn enabled() -> bool {
        match std::env::var("CHAOS_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            if std::thread::panicking() {
                logger.push(
                    TestPhase::Verify,
                    "TEST FAIL".to_string(),
                    Some(serde_json::json!({ "reason": "test panicked" })),
                );
            } else {
                logger.log(TestPhase::Verify, "TEST PASS");
            }
        }
    }
}

/// `TestGuard` named after the enclosing test function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_records_start_and_messages() {
        let logger = TestLogger::for_test("logger_records_start_and_messages");
        logger.log(TestPhase::Verify, "status RUNNING");

        let entries = logger.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "TEST START");
        assert_eq!(entries[0].phase, TestPhase::Setup);
        assert!(entries[1].data.is_none());
    }

    #[test]
    fn guard_macro_names_the_test() {
        let _guard = crate::test_guard!();
        assert_eq!(TestPhase::Verify.to_string(), "verify");
    }
}
