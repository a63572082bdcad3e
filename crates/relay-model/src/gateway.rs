use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use relay_core::config::ModelConfig;

use crate::error::{ModelError, Result};
use crate::session::{ModelSession, SessionStore};

/// Substrings observed in a resumed session's stderr/stdout when its tool
/// history can no longer be replayed. Matched case-insensitively.
const CORRUPTED_SESSION_MARKERS: [&str; 3] = [
    "no conversation found with session id",
    "failed to resume session",
    "tool_use.name",
];

/// Parameters for one [`ModelGateway::invoke`] call.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Resume the persisted or overridden session id, if one exists.
    pub resume_session: bool,
    /// Tools the subprocess may use. Empty means no `--allowedTools` flag.
    pub allowed_tools: Vec<String>,
    /// Overrides the gateway's configured default model for this call.
    pub model: Option<String>,
    pub timeout: Duration,
    /// Use this session id instead of the one persisted on disk.
    pub session_override: Option<String>,
}

/// Spawns the model CLI as a subprocess, one invocation at a time (the
/// caller is responsible for the single-permit gate — see
/// `relay_dispatcher::Dispatcher`), and implements the timeout/escalation/
/// corrupted-session state machine.
pub struct ModelGateway {
    claude_path: String,
    default_model: String,
    kill_grace: Duration,
    recovery_lock: Duration,
    sessions: SessionStore,
    locked_until_ms: AtomicI64,
}

impl ModelGateway {
    pub fn new(config: &ModelConfig, session_path: impl Into<PathBuf>) -> Self {
        Self {
            claude_path: config.claude_path.clone(),
            default_model: config.model.clone(),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
            recovery_lock: Duration::from_millis(config.recovery_lock_ms),
            sessions: SessionStore::new(session_path),
            locked_until_ms: AtomicI64::new(0),
        }
    }

    /// True while the out-of-band recovery lock armed by a recent timeout is
    /// in effect. Callers suppress dependent side effects (e.g. ticket state
    /// churn) while this holds, since the subprocess's true end state is
    /// unknown.
    pub fn is_recovery_locked(&self) -> bool {
        now_ms() < self.locked_until_ms.load(Ordering::SeqCst)
    }

    /// The persisted model session id, if one exists yet. Read-only —
    /// callers that need to stash it alongside a `PendingAction` (so an
    /// approved confirmation can resume the same session) use this rather
    /// than reaching into `SessionStore` directly.
    pub fn current_session_id(&self) -> Option<String> {
        self.sessions.load().id
    }

    fn arm_recovery_lock(&self) {
        self.locked_until_ms
            .store(now_ms() + self.recovery_lock.as_millis() as i64, Ordering::SeqCst);
    }

    #[instrument(
        skip(self, prompt, opts),
        fields(prompt_len = prompt.len(), tool_count = opts.allowed_tools.len(), resume = opts.resume_session)
    )]
    pub async fn invoke(&self, prompt: &str, opts: InvokeOptions) -> Result<String> {
        self.invoke_inner(prompt, opts, true).await
    }

    fn invoke_inner<'a>(
        &'a self,
        prompt: &'a str,
        opts: InvokeOptions,
        allow_corrupted_retry: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let resume_id = if opts.resume_session {
                opts.session_override
                    .clone()
                    .or_else(|| self.sessions.load().id)
            } else {
                None
            };

            let model = opts
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone());

            let mut cmd = Command::new(&self.claude_path);
            cmd.arg("-p").arg(prompt);
            if let Some(id) = &resume_id {
                cmd.arg("--resume").arg(id);
            }
            for tool in &opts.allowed_tools {
                cmd.arg("--allowedTools").arg(tool);
            }
            cmd.arg("--model")
                .arg(&model)
                .arg("--output-format")
                .arg("text")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            info!(
                model = %model,
                resumed_session_prefix = resume_id.as_deref().map(|s| prefix(s, 8)),
                tool_count = opts.allowed_tools.len(),
                timeout_ms = opts.timeout.as_millis() as u64,
                "invoking model subprocess"
            );

            let mut child = cmd.spawn().map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ModelError::BinaryNotFound {
                        path: self.claude_path.clone(),
                    }
                } else {
                    ModelError::Spawn(e.to_string())
                }
            })?;

            let pid = child.id();
            let stdout = child.stdout.take().expect("stdout piped at spawn");
            let stderr = child.stderr.take().expect("stderr piped at spawn");
            let stdout_task = tokio::spawn(read_to_end(stdout));
            let stderr_task = tokio::spawn(read_to_end(stderr));

            let status = match tokio::time::timeout(opts.timeout, child.wait()).await {
                Ok(status) => status.map_err(ModelError::Io)?,
                Err(_elapsed) => {
                    warn!("model subprocess exceeded deadline, escalating termination");
                    self.arm_recovery_lock();
                    let partial = terminate_with_escalation(pid, self.kill_grace, stdout_task).await;
                    return Err(ModelError::Timeout {
                        ms: opts.timeout.as_millis() as u64,
                        partial_output: partial,
                    });
                }
            };

            let stdout_text = stdout_task.await.unwrap_or_default();
            let stderr_text = stderr_task.await.unwrap_or_default();

            if status.success() {
                let trimmed = stdout_text.trim().to_string();
                if let Some(id) = extract_session_id(&trimmed) {
                    self.persist_session(&id)?;
                }
                return Ok(strip_session_line(&trimmed));
            }

            let combined = format!("{stdout_text}\n{stderr_text}");
            if allow_corrupted_retry && resume_id.is_some() && is_corrupted_session(&combined) {
                warn!("resumed session rejected by model subprocess, retrying once without resume");
                let mut retry_opts = opts;
                retry_opts.resume_session = false;
                retry_opts.session_override = None;
                return self.invoke_inner(prompt, retry_opts, false).await;
            }

            if is_external_kill(&status) {
                return Err(ModelError::ExternalKill {
                    partial_output: stdout_text.trim().to_string(),
                });
            }

            Err(ModelError::NonZeroExit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_text.trim().to_string(),
            })
        })
    }

    fn persist_session(&self, id: &str) -> Result<()> {
        self.sessions.save(&ModelSession {
            id: Some(id.to_string()),
            last_activity: Some(chrono::Utc::now().to_rfc3339()),
        })
    }
}

async fn read_to_end(mut pipe: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut buf = String::new();
    let _ = pipe.read_to_string(&mut buf).await;
    buf
}

/// SIGTERM, wait [`ModelGateway::kill_grace`], SIGKILL if still alive.
/// Returns whatever stdout had accumulated by the time the process died.
async fn terminate_with_escalation(
    pid: Option<u32>,
    kill_grace: Duration,
    mut stdout_task: tokio::task::JoinHandle<String>,
) -> String {
    if let Some(pid) = pid {
        let nix_pid = Pid::from_raw(pid as i32);
        let _ = signal::kill(nix_pid, Signal::SIGTERM);
        if let Ok(result) = tokio::time::timeout(kill_grace, &mut stdout_task).await {
            return result.unwrap_or_default();
        }
        if signal::kill(nix_pid, None).is_ok() {
            let _ = signal::kill(nix_pid, Signal::SIGKILL);
        }
    }
    stdout_task.await.unwrap_or_default()
}

/// `Session ID: <uuid>` on the first line, if present.
fn extract_session_id(text: &str) -> Option<String> {
    let first_line = text.lines().next()?;
    const MARKER: &str = "Session ID:";
    let idx = first_line.find(MARKER)?;
    let id: String = first_line[idx + MARKER.len()..]
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn strip_session_line(text: &str) -> String {
    match text.split_once('\n') {
        Some((first, rest)) if first.contains("Session ID:") => rest.trim().to_string(),
        _ => text.to_string(),
    }
}

fn is_corrupted_session(combined_output: &str) -> bool {
    let lower = combined_output.to_lowercase();
    CORRUPTED_SESSION_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_external_kill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(15)
}

fn prefix(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_session_id_from_first_line() {
        let text = "Session ID: 7a6f9c3e-1b2d-4e5f-8a9b-0c1d2e3f4a5b\nHello there.";
        assert_eq!(
            extract_session_id(text).as_deref(),
            Some("7a6f9c3e-1b2d-4e5f-8a9b-0c1d2e3f4a5b")
        );
        assert_eq!(strip_session_line(text), "Hello there.");
    }

    #[test]
    fn no_session_line_leaves_text_untouched() {
        assert_eq!(extract_session_id("just a reply"), None);
        assert_eq!(strip_session_line("just a reply"), "just a reply");
    }

    #[test]
    fn recognises_corrupted_session_markers_case_insensitively() {
        assert!(is_corrupted_session(
            "Error: No Conversation Found With Session ID abc"
        ));
        assert!(!is_corrupted_session("some unrelated stderr"));
    }

    #[tokio::test]
    async fn recovery_lock_expires_after_its_duration() {
        let config = ModelConfig {
            recovery_lock_ms: 20,
            ..ModelConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let gateway = ModelGateway::new(&config, dir.path().join("session.json"));
        assert!(!gateway.is_recovery_locked());
        gateway.arm_recovery_lock();
        assert!(gateway.is_recovery_locked());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!gateway.is_recovery_locked());
    }
}
