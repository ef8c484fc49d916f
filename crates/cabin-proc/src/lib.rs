//! PTY child process supervision.
//!
//! User commands run under an external PTY helper binary:
//!
//! ```text
//! <helper> --cols=80 --rows=24 --ctl <socket> <command> <args…>
//! ```
//!
//! The helper owns the pseudo-terminal; the agent only spawns it, writes
//! its stdin, reads its stdout/stderr, and sends out-of-band control
//! messages (currently just resize) as JSON lines over the per-child Unix
//! socket the helper binds at the `--ctl` path.
//!
//! Output is forwarded as lossy-UTF-8 chunks, sized by whatever the OS
//! delivers; there is no line buffering. The terminal `exit` event is
//! emitted only after both output pumps drain, so subscribers always see
//! the last output chunk before the exit notification.
//!
//! Processes deliberately outlive the client that spawned them: records
//! are dropped on exit or explicit kill, never on client disconnect.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use cabin_core::{new_token, AgentError, Result};

/// Output chunk size; chunk boundaries carry no meaning.
const READ_BUF_SIZE: usize = 8192;

/// Which stream a process event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// Terminal event; `data` carries the exit code as a string.
    Exit,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Exit => "exit",
        }
    }
}

/// One chunk of process output, or the exit notification.
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub pid: u32,
    pub stream: StreamKind,
    pub data: String,
}

/// PTY helper configuration.
#[derive(Debug, Clone)]
pub struct PtyConfig {
    /// Container-install location of the helper; tried first.
    pub helper_path: PathBuf,

    /// Fallback relative to the agent's working directory.
    pub fallback_relative: PathBuf,

    /// Value of the COEP environment variable handed to children.
    pub coep: String,

    /// Initial terminal geometry.
    pub cols: u16,
    pub rows: u16,

    /// Directory control sockets are created in.
    pub ctl_dir: PathBuf,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            helper_path: PathBuf::from("/usr/local/bin/cabin-pty"),
            fallback_relative: PathBuf::from("bin/cabin-pty"),
            coep: "credentialless".to_string(),
            cols: 80,
            rows: 24,
            ctl_dir: std::env::temp_dir(),
        }
    }
}

struct ProcessHandle {
    stdin: Arc<Mutex<ChildStdin>>,
    ctl_path: PathBuf,
}

/// Owns every live PTY child and routes its I/O.
pub struct ProcessSupervisor {
    config: PtyConfig,
    events: mpsc::UnboundedSender<ProcessEvent>,
    inner: Arc<RwLock<HashMap<u32, ProcessHandle>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor, returning the receiving end of the event
    /// stream for the server's fan-out pump.
    pub fn new(config: PtyConfig) -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                events,
                inner: Arc::new(RwLock::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Spawn `command` under the PTY helper; returns the helper's pid.
    ///
    /// `on_spawn` runs once the pid is known but before any output is
    /// routed, so callers can register subscriptions without racing the
    /// child's first chunk.
    pub async fn spawn(
        &self,
        command: &str,
        args: &[String],
        on_spawn: impl FnOnce(u32),
    ) -> Result<u32> {
        let helper = self.resolve_helper()?;
        let ctl_path = self
            .config
            .ctl_dir
            .join(format!("cabin-pty-{}.sock", new_token()));

        let mut child = Command::new(&helper)
            .arg(format!("--cols={}", self.config.cols))
            .arg(format!("--rows={}", self.config.rows))
            .arg("--ctl")
            .arg(&ctl_path)
            .arg(command)
            .args(args)
            .env("COEP", &self.config.coep)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AgentError::process(format!("failed to spawn '{}': {}", command, e))
            })?;

        let pid = child
            .id()
            .ok_or_else(|| AgentError::process("spawned child has no pid"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::process("spawn failed: missing stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::process("spawn failed: missing stdout handle"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::process("spawn failed: missing stderr handle"))?;

        debug!(pid, command, "spawned PTY child");

        {
            let mut inner = self.inner.write().expect("process table poisoned");
            inner.insert(
                pid,
                ProcessHandle {
                    stdin: Arc::new(Mutex::new(stdin)),
                    ctl_path: ctl_path.clone(),
                },
            );
        }
        on_spawn(pid);

        let stdout_pump = spawn_output_pump(pid, StreamKind::Stdout, stdout, self.events.clone());
        let stderr_pump = spawn_output_pump(pid, StreamKind::Stderr, stderr, self.events.clone());

        let events = self.events.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let status = child.wait().await;

            // Let the output pumps drain before announcing the exit.
            let _ = stdout_pump.await;
            let _ = stderr_pump.await;

            let code = match status {
                Ok(status) => status.code().unwrap_or(0),
                Err(e) => {
                    warn!(pid, error = %e, "failed to collect child status");
                    0
                }
            };

            debug!(pid, code, "PTY child exited");

            // The record goes first: a tracked pid must never have
            // already announced its exit.
            inner.write().expect("process table poisoned").remove(&pid);
            let _ = std::fs::remove_file(&ctl_path);

            let _ = events.send(ProcessEvent {
                pid,
                stream: StreamKind::Exit,
                data: code.to_string(),
            });
        });

        Ok(pid)
    }

    /// Write `data` to the child's stdin verbatim.
    pub async fn input(&self, pid: u32, data: &str) -> Result<()> {
        let stdin = {
            let inner = self.inner.read().expect("process table poisoned");
            let handle = inner
                .get(&pid)
                .ok_or_else(|| AgentError::process_not_found(pid))?;
            Arc::clone(&handle.stdin)
        };

        let mut stdin = stdin.lock().await;
        stdin
            .write_all(data.as_bytes())
            .await
            .map_err(|e| AgentError::process(format!("failed to write to process {}: {}", pid, e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| AgentError::process(format!("failed to write to process {}: {}", pid, e)))?;
        Ok(())
    }

    /// Send a resize control message to the helper.
    pub async fn resize(&self, pid: u32, cols: u16, rows: u16) -> Result<()> {
        let ctl_path = {
            let inner = self.inner.read().expect("process table poisoned");
            let handle = inner
                .get(&pid)
                .ok_or_else(|| AgentError::process_not_found(pid))?;
            handle.ctl_path.clone()
        };

        let mut stream = UnixStream::connect(&ctl_path).await.map_err(|e| {
            AgentError::process(format!(
                "failed to reach control channel of process {}: {}",
                pid, e
            ))
        })?;

        let mut message = json!({ "type": "resize", "cols": cols, "rows": rows }).to_string();
        message.push('\n');
        stream
            .write_all(message.as_bytes())
            .await
            .map_err(|e| AgentError::process(format!("failed to resize process {}: {}", pid, e)))?;
        Ok(())
    }

    /// Send the default termination signal and drop the record.
    ///
    /// The exit event is still emitted once the child actually dies.
    pub fn kill(&self, pid: u32) -> Result<()> {
        let mut inner = self.inner.write().expect("process table poisoned");
        inner
            .remove(&pid)
            .ok_or_else(|| AgentError::process_not_found(pid))?;

        terminate(pid);
        Ok(())
    }

    /// Kill every tracked child. Used on shutdown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().expect("process table poisoned");
        for pid in inner.keys().copied().collect::<Vec<_>>() {
            terminate(pid);
        }
        inner.clear();
    }

    /// Whether `pid` is currently tracked.
    pub fn is_tracked(&self, pid: u32) -> bool {
        self.inner
            .read()
            .expect("process table poisoned")
            .contains_key(&pid)
    }

    /// Number of tracked children.
    pub fn process_count(&self) -> usize {
        self.inner.read().expect("process table poisoned").len()
    }

    /// Resolve the helper binary: container install first, then the
    /// working-directory fallback.
    fn resolve_helper(&self) -> Result<PathBuf> {
        if self.config.helper_path.exists() {
            return Ok(self.config.helper_path.clone());
        }

        let fallback = std::env::current_dir()
            .map_err(|e| AgentError::process(format!("failed to resolve working directory: {}", e)))?
            .join(&self.config.fallback_relative);
        if fallback.exists() {
            return Ok(fallback);
        }

        Err(AgentError::process(format!(
            "PTY helper not found at '{}' or '{}'",
            self.config.helper_path.display(),
            fallback.display()
        )))
    }
}

/// SIGTERM, matching the platform's default termination signal.
fn terminate(pid: u32) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        warn!(pid, "failed to signal process");
    }
}

fn spawn_output_pump<R>(
    pid: u32,
    stream: StreamKind,
    mut reader: R,
    events: mpsc::UnboundedSender<ProcessEvent>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if events
                        .send(ProcessEvent {
                            pid,
                            stream,
                            data: chunk,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    warn!(pid, stream = stream.as_str(), error = %e, "output pump error");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A stand-in helper that drops the four option arguments
    /// (`--cols=.. --rows=.. --ctl <path>`) and execs the user command.
    fn fake_helper(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("fake-pty");
        fs::write(&path, "#!/bin/sh\nshift 4\nexec \"$@\"\n").expect("write helper");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn supervisor(
        dir: &tempfile::TempDir,
    ) -> (ProcessSupervisor, mpsc::UnboundedReceiver<ProcessEvent>) {
        let config = PtyConfig {
            helper_path: fake_helper(dir),
            fallback_relative: PathBuf::from("does/not/exist"),
            ctl_dir: dir.path().to_path_buf(),
            ..PtyConfig::default()
        };
        ProcessSupervisor::new(config)
    }

    #[tokio::test]
    async fn unknown_pid_operations_fail_with_pid_in_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = supervisor(&dir);

        let err = supervisor.input(999_999, "x").await.expect_err("input");
        assert_eq!(err.code(), "PROCESS_OPERATION_FAILED");
        assert!(err.to_string().contains("999999"));

        let err = supervisor.resize(999_999, 80, 24).await.expect_err("resize");
        assert!(err.to_string().contains("999999"));

        let err = supervisor.kill(999_999).expect_err("kill");
        assert!(err.to_string().contains("999999"));
    }

    #[tokio::test]
    async fn helper_resolution_prefers_install_then_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = supervisor(&dir);
        let resolved = supervisor.resolve_helper().expect("resolve");
        assert_eq!(resolved, supervisor.config.helper_path);

        let missing = PtyConfig {
            helper_path: PathBuf::from("/definitely/not/here"),
            fallback_relative: PathBuf::from("also/not/here"),
            ..PtyConfig::default()
        };
        let (supervisor, _rx) = ProcessSupervisor::new(missing);
        let err = supervisor.resolve_helper().expect_err("no helper");
        assert_eq!(err.code(), "PROCESS_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn echo_emits_stdout_then_exit_and_record_is_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = supervisor(&dir);

        let pid = supervisor
            .spawn("echo", &["hello".to_string()], |_| {})
            .await
            .expect("spawn echo");
        assert!(supervisor.is_tracked(pid));

        let mut output = String::new();
        let exit_code = loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("event within deadline")
                .expect("channel open");
            assert_eq!(event.pid, pid);
            match event.stream {
                StreamKind::Stdout => output.push_str(&event.data),
                StreamKind::Stderr => {}
                StreamKind::Exit => break event.data,
            }
        };

        assert_eq!(output, "hello\n");
        assert_eq!(exit_code, "0");
        assert!(!supervisor.is_tracked(pid));

        // Once exited, the pid is gone for every control operation.
        let err = supervisor.kill(pid).expect_err("kill after exit");
        assert_eq!(err.code(), "PROCESS_OPERATION_FAILED");
    }

    #[tokio::test]
    async fn input_reaches_child_stdin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = supervisor(&dir);

        let pid = supervisor.spawn("cat", &[], |_| {}).await.expect("spawn cat");
        supervisor.input(pid, "ping\n").await.expect("write stdin");

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("echoed output")
            .expect("channel open");
        assert_eq!(event.stream, StreamKind::Stdout);
        assert_eq!(event.data, "ping\n");

        supervisor.kill(pid).expect("kill");
        assert!(!supervisor.is_tracked(pid));

        // The exit event still arrives for the killed child.
        let exit = loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("exit event")
                .expect("channel open");
            if event.stream == StreamKind::Exit {
                break event;
            }
        };
        assert_eq!(exit.pid, pid);
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, mut rx) = supervisor(&dir);

        let pid = supervisor
            .spawn("sh", &["-c".to_string(), "exit 3".to_string()], |_| {})
            .await
            .expect("spawn");

        let exit = loop {
            let event = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("exit event")
                .expect("channel open");
            if event.stream == StreamKind::Exit {
                break event;
            }
        };
        assert_eq!(exit.pid, pid);
        assert_eq!(exit.data, "3");
    }

    #[tokio::test]
    async fn shutdown_clears_every_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (supervisor, _rx) = supervisor(&dir);

        supervisor.spawn("cat", &[], |_| {}).await.expect("spawn");
        supervisor.spawn("cat", &[], |_| {}).await.expect("spawn");
        assert_eq!(supervisor.process_count(), 2);

        supervisor.shutdown();
        assert_eq!(supervisor.process_count(), 0);
    }
}
