//! Execution sandbox
//!
//! Runs exactly one code unit per call and always answers with telemetry.
//! Screening happens first; nothing flagged ever reaches a process. Every
//! run gets a fresh slot and scratch area, a hard watchdog and a capped view
//! of its output. Internal failures become `error` telemetry, never `Err`.

mod policy;
mod pool;

pub use policy::{IsolationMode, SandboxPolicy, BLACKHOLE_PROXY, JAIL_WORKDIR};
pub use pool::{SandboxSession, SlotPool};

use crate::audit::compute_fingerprint;
use crate::data::Dataset;
use crate::models::{ExecutionStatus, ExecutionTelemetry};
use crate::safety::SafetyScreener;
use crate::temporal::TemporalReport;
use chrono::Utc;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EXIT_TIMEOUT: i32 = -1;
pub const EXIT_BLOCKED: i32 = -2;
pub const EXIT_SANDBOX_FAILURE: i32 = -3;
pub const EXIT_MEMORY_EXCEEDED: i32 = -4;
pub const EXIT_SIGNALED: i32 = -5;

const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(25);
const DRAIN_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8192;
const MAX_TRACKED_PIDS: usize = 256;

/// Isolated single-shot executor
#[derive(Debug, Clone)]
pub struct ExecutionSandbox {
    policy: SandboxPolicy,
    pool: SlotPool,
    screener: SafetyScreener,
}

impl ExecutionSandbox {
    pub fn new(policy: SandboxPolicy, pool: SlotPool) -> Self {
        Self {
            policy,
            pool,
            screener: SafetyScreener::new(),
        }
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Execute one code unit against already-resolved data.
    ///
    /// `temporal` is the analyzer's report for this exact code; a blocking
    /// report is refused the same way a deny-list hit is.
    pub async fn execute(
        &self,
        code: &str,
        data: &[Dataset],
        temporal: Option<&TemporalReport>,
    ) -> ExecutionTelemetry {
        let run = RunContext::new(code);

        let verdict = self.screener.screen(code);
        if verdict.is_blocked() {
            warn!(fingerprint = %run.fingerprint, reasons = ?verdict.reasons(), "Code blocked by safety screen");
            return run.blocked(verdict.reasons());
        }

        if let Some(report) = temporal.filter(|r| r.blocking) {
            warn!(fingerprint = %run.fingerprint, reasons = ?report.reasons(), "Code blocked by temporal analysis");
            return run.blocked(report.reasons());
        }

        let session = match self.pool.acquire().await {
            Ok(session) => session,
            Err(e) => return run.failure(e.to_string()),
        };

        if let Err(e) = stage_inputs(session.scratch(), &self.policy.script_name, code, data).await
        {
            return run.failure(format!("failed to stage inputs: {}", e));
        }

        let Some(mut cmd) = self.policy.build_command(session.scratch()) else {
            return run.failure("sandbox interpreter is not configured".to_string());
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        apply_rlimits(&mut cmd, &self.policy);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return run.failure(format!("failed to spawn sandbox: {}", e)),
        };

        debug!(
            execution_id = %run.execution_id,
            pid = ?child.id(),
            isolation = ?self.policy.isolation,
            "Sandbox process started"
        );

        let outcome = watch(child, &self.policy).await;
        drop(session);

        let telemetry = run.finish(outcome, &self.policy);

        info!(
            execution_id = %telemetry.execution_id,
            status = ?telemetry.status,
            exit_code = telemetry.exit_code,
            duration_ms = telemetry.duration_ms,
            memory_kb = ?telemetry.memory_used_kb,
            "Sandbox run finished"
        );

        telemetry
    }
}

//
// ================= Telemetry construction =================
//

struct RunContext {
    execution_id: Uuid,
    fingerprint: String,
    started_at: chrono::DateTime<Utc>,
    clock: Instant,
}

impl RunContext {
    fn new(code: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            fingerprint: compute_fingerprint(code),
            started_at: Utc::now(),
            clock: Instant::now(),
        }
    }

    fn telemetry(&self, status: ExecutionStatus, exit_code: i32) -> ExecutionTelemetry {
        ExecutionTelemetry {
            execution_id: self.execution_id,
            status,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: self.clock.elapsed().as_millis() as u64,
            memory_used_kb: None,
            code_fingerprint: self.fingerprint.clone(),
            started_at: self.started_at,
            completed_at: Utc::now(),
            block_reasons: Vec::new(),
        }
    }

    fn blocked(&self, reasons: Vec<String>) -> ExecutionTelemetry {
        ExecutionTelemetry {
            block_reasons: reasons,
            ..self.telemetry(ExecutionStatus::Blocked, EXIT_BLOCKED)
        }
    }

    fn failure(&self, message: String) -> ExecutionTelemetry {
        warn!(execution_id = %self.execution_id, error = %message, "Sandbox failure");
        ExecutionTelemetry {
            stderr: message,
            ..self.telemetry(ExecutionStatus::Error, EXIT_SANDBOX_FAILURE)
        }
    }

    fn finish(&self, outcome: RunOutcome, policy: &SandboxPolicy) -> ExecutionTelemetry {
        let mut notes = Vec::new();

        let (mut status, exit_code) = match outcome.exit {
            Exit::Exited(es) => match es.code() {
                Some(0) => (ExecutionStatus::Success, 0),
                Some(code) => (ExecutionStatus::Error, code),
                None => {
                    notes.push(format!(
                        "terminated by signal {}",
                        es.signal().unwrap_or_default()
                    ));
                    (ExecutionStatus::Error, EXIT_SIGNALED)
                }
            },
            Exit::TimedOut => {
                notes.push(format!("wall-clock limit of {} ms exceeded", policy.timeout_ms));
                (ExecutionStatus::Timeout, EXIT_TIMEOUT)
            }
            Exit::MemoryExceeded(kb) => {
                notes.push(format!(
                    "memory ceiling of {} MB exceeded ({} kB)",
                    policy.memory_limit_mb, kb
                ));
                (ExecutionStatus::Error, EXIT_MEMORY_EXCEEDED)
            }
            Exit::WaitFailed(e) => {
                notes.push(format!("lost track of sandbox process: {}", e));
                (ExecutionStatus::Error, EXIT_SANDBOX_FAILURE)
            }
        };

        if outcome.stdout.truncated {
            notes.push(format!("stdout exceeded {} bytes", policy.max_output_bytes));
            if status == ExecutionStatus::Success {
                status = ExecutionStatus::Error;
            }
        }
        if outcome.stderr.truncated {
            notes.push(format!("stderr exceeded {} bytes", policy.max_output_bytes));
        }

        let mut stderr = String::from_utf8_lossy(&outcome.stderr.bytes).into_owned();
        for note in notes {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str("[sandbox] ");
            stderr.push_str(&note);
        }

        ExecutionTelemetry {
            stdout: String::from_utf8_lossy(&outcome.stdout.bytes).into_owned(),
            stderr,
            memory_used_kb: outcome.peak_kb,
            ..self.telemetry(status, exit_code)
        }
    }
}

//
// ================= Process supervision =================
//

enum Exit {
    Exited(ExitStatus),
    TimedOut,
    MemoryExceeded(u64),
    WaitFailed(String),
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

struct RunOutcome {
    exit: Exit,
    stdout: Captured,
    stderr: Captured,
    peak_kb: Option<u64>,
}

/// Kills the whole process group when dropped, unless disarmed after reaping.
struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            // SAFETY: signalling a process group we created; failure is harmless.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn watch(mut child: Child, policy: &SandboxPolicy) -> RunOutcome {
    let pid = child.id();
    let mut guard = GroupGuard {
        pgid: pid.map(|p| p as i32),
    };

    let stdout = child
        .stdout
        .take()
        .map(|r| tokio::spawn(read_capped(r, policy.max_output_bytes)));
    let stderr = child
        .stderr
        .take()
        .map(|r| tokio::spawn(read_capped(r, policy.max_output_bytes)));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(policy.timeout_ms);
    let limit_kb = policy.memory_limit_mb.saturating_mul(1024);
    let mut sampler = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
    sampler.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut peak_kb: Option<u64> = None;

    let exit = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(es) => Exit::Exited(es),
                    Err(e) => Exit::WaitFailed(e.to_string()),
                };
            }
            _ = tokio::time::sleep_until(deadline) => break Exit::TimedOut,
            _ = sampler.tick() => {
                let Some(root) = pid else { continue };
                if let Some(kb) = tree_memory_kb(root).await {
                    let peak = peak_kb.map_or(kb, |p| p.max(kb));
                    peak_kb = Some(peak);
                    if limit_kb > 0 && peak > limit_kb {
                        break Exit::MemoryExceeded(peak);
                    }
                }
            }
        }
    };

    if !matches!(exit, Exit::Exited(_)) {
        debug!(pid = ?pid, "Watchdog terminating sandbox process group");
        guard.kill();
        let _ = child.kill().await;
    } else {
        // Stragglers left in the group would hold the pipes open.
        guard.kill();
    }
    let _ = child.wait().await;
    guard.disarm();

    RunOutcome {
        exit,
        stdout: collect(stdout).await,
        stderr: collect(stderr).await,
        peak_kb,
    }
}

async fn collect(handle: Option<JoinHandle<Captured>>) -> Captured {
    let Some(mut handle) = handle else {
        return Captured::default();
    };

    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => Captured::default(),
        Err(_) => {
            handle.abort();
            Captured {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}

/// Keep at most `cap` bytes but keep reading so the writer never blocks.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Captured {
    let mut captured = Captured::default();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    captured
}

/// Peak resident memory (kB) of `root` and its descendants.
async fn tree_memory_kb(root: u32) -> Option<u64> {
    let mut pending = vec![root];
    let mut visited = 0usize;
    let mut total: Option<u64> = None;

    while let Some(pid) = pending.pop() {
        visited += 1;
        if visited > MAX_TRACKED_PIDS {
            break;
        }

        if let Ok(status) = tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await {
            if let Some(kb) = status_field_kb(&status, "VmHWM:") {
                total = Some(total.unwrap_or(0) + kb);
            }
        }

        if let Ok(children) =
            tokio::fs::read_to_string(format!("/proc/{}/task/{}/children", pid, pid)).await
        {
            pending.extend(
                children
                    .split_whitespace()
                    .filter_map(|c| c.parse::<u32>().ok()),
            );
        }
    }

    total
}

fn status_field_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line[field.len()..].split_whitespace().next())
        .and_then(|v| v.parse().ok())
}

fn apply_rlimits(cmd: &mut Command, policy: &SandboxPolicy) {
    let data_limit = policy.memory_limit_bytes();
    let cpu_secs = policy.timeout_ms.div_ceil(1000) + 1;

    // SAFETY: only async-signal-safe libc calls run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            let set = |resource, value: u64| {
                let limit = libc::rlimit {
                    rlim_cur: value as libc::rlim_t,
                    rlim_max: value as libc::rlim_t,
                };
                libc::setrlimit(resource, &limit);
            };

            if data_limit > 0 {
                set(libc::RLIMIT_DATA, data_limit);
            }
            set(libc::RLIMIT_CPU, cpu_secs);
            set(libc::RLIMIT_CORE, 0);
            Ok(())
        });
    }
}

async fn stage_inputs(
    scratch: &Path,
    script_name: &str,
    code: &str,
    data: &[Dataset],
) -> std::io::Result<()> {
    tokio::fs::write(scratch.join(script_name), code).await?;

    let data_dir = scratch.join("data");
    tokio::fs::create_dir_all(&data_dir).await?;

    for dataset in data {
        let bytes = serde_json::to_vec(&dataset.payload)?;
        let file = data_dir.join(format!("{}.json", file_stem(&dataset.requirement_id)));
        tokio::fs::write(file, bytes).await?;
    }

    Ok(())
}

fn file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.is_empty() {
        "data".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temporal::TemporalAnalyzer;
    use chrono::NaiveDate;
    use serde_json::json;

    fn sandbox(timeout_ms: u64) -> ExecutionSandbox {
        let policy = SandboxPolicy::default()
            .with_isolation(IsolationMode::Unjailed)
            .with_interpreter(["sh"])
            .with_timeout_ms(timeout_ms);
        ExecutionSandbox::new(policy, SlotPool::new(2))
    }

    #[tokio::test]
    async fn test_successful_run_produces_success_telemetry() {
        let code = r#"printf '{"metric":"x","value":1.34}\n'"#;
        let t = sandbox(5_000).execute(code, &[], None).await;

        assert_eq!(t.status, ExecutionStatus::Success);
        assert_eq!(t.exit_code, 0);
        assert_eq!(t.stdout.trim(), r#"{"metric":"x","value":1.34}"#);
        assert_eq!(t.code_fingerprint, compute_fingerprint(code));
        assert!(t.completed_at >= t.started_at);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let t = sandbox(5_000).execute("echo boom >&2\nexit 3", &[], None).await;
        assert_eq!(t.status, ExecutionStatus::Error);
        assert_eq!(t.exit_code, 3);
        assert!(t.stderr.contains("boom"));
    }

    #[tokio::test]
    async fn test_watchdog_times_out_and_releases_slot() {
        let sb = sandbox(200);
        let t = sb.execute("echo partial\nsleep 5", &[], None).await;

        assert_eq!(t.status, ExecutionStatus::Timeout);
        assert_eq!(t.exit_code, EXIT_TIMEOUT);
        assert!(t.duration_ms < 4_000);
        assert_eq!(sb.pool().available(), sb.pool().capacity());
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let started = Instant::now();
        let t = sandbox(200)
            .execute("(sleep 30; echo late) &\nsleep 30", &[], None)
            .await;

        assert_eq!(t.status, ExecutionStatus::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!t.stdout.contains("late"));
    }

    #[tokio::test]
    async fn test_safety_block_never_runs() {
        let sb = sandbox(5_000);
        let t = sb.execute("x = eval('1 + 1')", &[], None).await;

        assert_eq!(t.status, ExecutionStatus::Blocked);
        assert_eq!(t.exit_code, EXIT_BLOCKED);
        assert!(!t.block_reasons.is_empty());
        assert!(t.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_blocking_temporal_report_refused() {
        let code = "echo ok";
        let mut report = TemporalAnalyzer::new().analyze(
            "s.shift(-1)",
            NaiveDate::from_ymd_opt(2024, 1, 1),
        );
        assert!(report.blocking);

        let t = sandbox(5_000).execute(code, &[], Some(&report)).await;
        assert_eq!(t.status, ExecutionStatus::Blocked);

        report.blocking = false;
        report.violations.clear();
        let t = sandbox(5_000).execute(code, &[], Some(&report)).await;
        assert_eq!(t.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_data_is_staged_under_data_dir() {
        let data = vec![Dataset {
            requirement_id: "prices/aapl".to_string(),
            provider: "primary".to_string(),
            fetched_at: Utc::now(),
            payload: json!({"close": [1.0, 2.0]}),
        }];

        let t = sandbox(5_000)
            .execute("cat \"$SANDBOX_DATA_DIR/prices_aapl.json\"", &data, None)
            .await;

        assert_eq!(t.status, ExecutionStatus::Success);
        assert_eq!(t.stdout, r#"{"close":[1.0,2.0]}"#);
    }

    #[tokio::test]
    async fn test_environment_is_cleared() {
        std::env::set_var("SANDBOX_TEST_SECRET", "leak");
        let t = sandbox(5_000)
            .execute("echo \"secret=${SANDBOX_TEST_SECRET:-none}\"", &[], None)
            .await;
        assert_eq!(t.stdout.trim(), "secret=none");
    }

    #[tokio::test]
    async fn test_truncated_output_is_not_success() {
        let policy = SandboxPolicy {
            max_output_bytes: 64,
            ..sandbox(5_000).policy().clone()
        };
        let sb = ExecutionSandbox::new(policy, SlotPool::new(1));
        let t = sb
            .execute("i=0\nwhile [ $i -lt 100 ]; do echo 0123456789; i=$((i+1)); done", &[], None)
            .await;

        assert_eq!(t.status, ExecutionStatus::Error);
        assert!(t.stdout.len() <= 64);
        assert!(t.stderr.contains("stdout exceeded"));
    }

    #[test]
    fn test_status_field_parsing() {
        let status = "Name:\tpython3\nVmHWM:\t   20480 kB\nVmRSS:\t 10240 kB\n";
        assert_eq!(status_field_kb(status, "VmHWM:"), Some(20480));
        assert_eq!(status_field_kb(status, "VmSwap:"), None);
    }

    #[test]
    fn test_file_stem_sanitizes() {
        assert_eq!(file_stem("prices/aapl"), "prices_aapl");
        assert_eq!(file_stem("../etc"), "___etc");
        assert_eq!(file_stem(""), "data");
    }
}
