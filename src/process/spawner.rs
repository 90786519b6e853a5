// src/process/spawner.rs — Launch agent processes and wire up their streams
//
// Each spawn starts four tasks: a stdin writer for the single user message,
// the stdout decoder, a bounded stderr collector, and an exit watcher that
// owns the child and reports exactly one `complete` event.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use super::checkpoints::CheckpointLedger;
use super::events::{EventSink, SessionEvent};
use super::handle::{ExitInfo, ExitReporter, ProcessHandle};
use super::instance::{InstanceEvent, InstanceStateMachine};
use super::registry::ProcessRegistry;
use super::stderr::{self, StderrBuffer};
use crate::infra::config::{AgentConfig, Config};
use crate::infra::errors::DeckError;
use crate::infra::paths;
use crate::memory::StoreHandle;
use crate::stream::decoder::{IdentityHook, StreamDecoder};
use crate::stream::protocol;

/// Registry keys for processes whose session id is not known yet.
pub const PENDING_PREFIX: &str = "pending-";

/// Flags passed to every agent process.
pub const STREAM_JSON_ARGS: [&str; 7] = [
    "-p",
    "--input-format",
    "stream-json",
    "--output-format",
    "stream-json",
    "--verbose",
    "--replay-user-messages",
];

pub const SKIP_PERMISSIONS_ARG: &str = "--dangerously-skip-permissions";

pub const CONFIG_DIR_ENV: &str = "CLAUDE_CONFIG_DIR";
pub const FILE_CHECKPOINTING_ENV: &str = "CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING";

/// How long stdout and stderr may stay open after the agent exits. A
/// background child that inherited the pipes is not waited for.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

static PENDING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh placeholder key, unique within this process.
pub fn pending_key() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let n = PENDING_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{PENDING_PREFIX}{nanos}-{n}")
}

pub fn is_pending_key(key: &str) -> bool {
    key.starts_with(PENDING_PREFIX)
}

/// Continue another session's transcript under a new id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkOrigin {
    pub parent_id: String,
    /// Replay the parent only up to this user-message uuid.
    pub resume_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub session_id: Option<String>,
    pub folder_path: String,
    pub message: String,
    pub fork: Option<ForkOrigin>,
}

impl SpawnRequest {
    pub fn new(folder_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            folder_path: folder_path.into(),
            message: message.into(),
            fork: None,
        }
    }

    pub fn resume(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn fork_from(mut self, origin: ForkOrigin) -> Self {
        self.fork = Some(origin);
        self
    }
}

/// Command-line arguments for `req`, without the executable.
pub fn build_args(req: &SpawnRequest, extra_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = STREAM_JSON_ARGS.iter().map(|a| a.to_string()).collect();
    args.push(SKIP_PERMISSIONS_ARG.into());

    match (&req.fork, &req.session_id) {
        (Some(fork), session_id) => {
            args.push("--resume".into());
            args.push(fork.parent_id.clone());
            args.push("--fork-session".into());
            if let Some(id) = session_id {
                args.push("--session-id".into());
                args.push(id.clone());
            }
            if let Some(uuid) = &fork.resume_at {
                args.push("--resume-session-at".into());
                args.push(uuid.clone());
            }
        }
        (None, Some(id)) => {
            args.push("--resume".into());
            args.push(id.clone());
        }
        (None, None) => {}
    }

    args.extend(extra_args.iter().cloned());
    args
}

/// Everything the exit watcher and stream tasks need for one child.
struct Started {
    child: Child,
    reporter: ExitReporter,
}

pub struct Spawner {
    agent: AgentConfig,
    stderr_cap: usize,
    max_line_bytes: usize,
    agent_config_dir: PathBuf,
    registry: Arc<ProcessRegistry>,
    checkpoints: Arc<CheckpointLedger>,
    states: Arc<InstanceStateMachine>,
    sink: Arc<dyn EventSink>,
    store: Option<StoreHandle>,
}

impl Spawner {
    pub fn new(
        config: &Config,
        registry: Arc<ProcessRegistry>,
        checkpoints: Arc<CheckpointLedger>,
        states: Arc<InstanceStateMachine>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            agent: config.agent.clone(),
            stderr_cap: config.limits.stderr_cap_bytes,
            max_line_bytes: config.limits.max_line_bytes,
            agent_config_dir: paths::agent_config_dir(),
            registry,
            checkpoints,
            states,
            sink,
            store: None,
        }
    }

    pub fn with_store(mut self, store: StoreHandle) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_agent_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent_config_dir = dir.into();
        self
    }

    /// Spawn under the request's session id, or a fresh placeholder.
    pub fn spawn(&self, req: SpawnRequest) -> Result<ProcessHandle, DeckError> {
        let key = req.session_id.clone().unwrap_or_else(pending_key);
        self.spawn_keyed(&key, req)
    }

    /// Spawn and register under `key`. Fails with `Busy` when `key` already
    /// has a live process. The handle is returned as soon as the child
    /// starts; everything afterwards arrives as events.
    pub fn spawn_keyed(&self, key: &str, req: SpawnRequest) -> Result<ProcessHandle, DeckError> {
        let line = protocol::encode_user_message(&req.message).map_err(|e| DeckError::Spawn {
            message: format!("could not encode message: {e}"),
        })?;

        let inserted = self
            .registry
            .insert_with(key, || self.start(key, &req))
            .map_err(|e| {
                self.emit_spawn_failure(key, &e);
                e
            })?;
        let Some((handle, mut started)) = inserted else {
            return Err(DeckError::Busy {
                session_id: key.to_string(),
            });
        };

        info!(
            "Started agent for {} (pid {:?}) in {}",
            key,
            handle.pid(),
            req.folder_path
        );

        let stdout = started.child.stdout.take();
        let stderr_pipe = started.child.stderr.take();
        let stdin = started.child.stdin.take();

        let identity = Arc::new(IdentityCapture {
            handle: handle.clone(),
            registry: self.registry.clone(),
            states: self.states.clone(),
            store: self.store.clone(),
            folder_path: req.folder_path.clone(),
            enabled: req.session_id.is_none(),
        });
        let mut decoder = StreamDecoder::new(key, self.checkpoints.clone(), self.sink.clone())
            .with_identity_hook(identity)
            .with_max_line(self.max_line_bytes);
        if let Some(store) = &self.store {
            decoder = decoder.with_store(store.clone());
        }
        let drained = drain_deadline(handle.clone());
        let decode_task = tokio::spawn(async move {
            match stdout {
                Some(stdout) => {
                    decoder.run_until(stdout, drained).await;
                }
                None => {
                    decoder.finish().await;
                }
            }
        });

        let cap = self.stderr_cap;
        let drained = drain_deadline(handle.clone());
        let stderr_task = tokio::spawn(async move {
            match stderr_pipe {
                Some(pipe) => stderr::collect_until(pipe, cap, drained).await,
                None => StderrBuffer::new(cap),
            }
        });

        match stdin {
            Some(stdin) => {
                tokio::spawn(write_message(
                    stdin,
                    line,
                    handle.clone(),
                    self.registry.clone(),
                    self.sink.clone(),
                ));
            }
            None => warn!("Agent stdin unavailable for {}", key),
        }

        tokio::spawn(watch_exit(
            started,
            handle.clone(),
            decode_task,
            stderr_task,
            ExitContext {
                registry: self.registry.clone(),
                states: self.states.clone(),
                sink: self.sink.clone(),
            },
        ));

        Ok(handle)
    }

    /// Start the child. Runs under the registry lock, so it never awaits.
    fn start(&self, key: &str, req: &SpawnRequest) -> Result<(ProcessHandle, Started), DeckError> {
        let folder = Path::new(&req.folder_path);
        if !folder.is_dir() {
            return Err(DeckError::Spawn {
                message: format!("working directory `{}` does not exist", req.folder_path),
            });
        }
        if let Err(e) = std::fs::create_dir_all(&self.agent_config_dir) {
            warn!(
                "Could not create agent config dir {}: {}",
                self.agent_config_dir.display(),
                e
            );
        }

        let args = build_args(req, &self.agent.extra_args);
        debug!("Spawning {} {:?}", self.agent.executable, args);

        let mut cmd = Command::new(&self.agent.executable);
        cmd.args(&args)
            .current_dir(folder)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.agent.env {
            cmd.env(k, v);
        }
        cmd.env(CONFIG_DIR_ENV, &self.agent_config_dir)
            .env(FILE_CHECKPOINTING_ENV, "1");

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DeckError::AgentNotInstalled {
                executable: self.agent.executable.clone(),
            },
            _ => DeckError::Spawn {
                message: e.to_string(),
            },
        })?;

        let (handle, reporter) = ProcessHandle::new(child.id(), key);
        Ok((handle, Started { child, reporter }))
    }

    fn emit_spawn_failure(&self, key: &str, err: &DeckError) {
        let message = match err {
            DeckError::AgentNotInstalled { executable } => {
                format!("the agent executable `{executable}` is not installed or not on PATH")
            }
            other => other.to_string(),
        };
        warn!("Spawn failed for {}: {}", key, message);
        self.sink.emit(SessionEvent::Complete {
            session_id: key.to_string(),
            success: false,
            error: Some(message),
        });
    }
}

/// Resolves `OUTPUT_DRAIN_TIMEOUT` after the process exits.
async fn drain_deadline(handle: ProcessHandle) {
    handle.exited().await;
    tokio::time::sleep(OUTPUT_DRAIN_TIMEOUT).await;
}

/// Rekeys a placeholder entry once the agent announces its real id.
struct IdentityCapture {
    handle: ProcessHandle,
    registry: Arc<ProcessRegistry>,
    states: Arc<InstanceStateMachine>,
    store: Option<StoreHandle>,
    folder_path: String,
    enabled: bool,
}

#[async_trait]
impl IdentityHook for IdentityCapture {
    async fn session_identified(&self, session_id: &str) {
        if !self.enabled {
            return;
        }
        let current = self.handle.key();
        if current == session_id {
            return;
        }
        if !self.registry.rekey(&current, session_id) {
            warn!("Could not move {} to session id {}", current, session_id);
            return;
        }
        self.states.transfer_state(&current, session_id);
        debug!("Session {} identified (was {})", session_id, current);

        if let Some(store) = &self.store {
            let created = store
                .ensure_session(session_id.to_string(), self.folder_path.clone())
                .await;
            if let Err(e) = created {
                warn!("Failed to record session {}: {}", session_id, e);
            }
        }
    }
}

async fn write_message(
    mut stdin: ChildStdin,
    line: String,
    handle: ProcessHandle,
    registry: Arc<ProcessRegistry>,
    sink: Arc<dyn EventSink>,
) {
    let written = async {
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await
    }
    .await;
    drop(stdin);

    let Err(e) = written else {
        return;
    };
    if !handle.claim_terminal() {
        return;
    }
    let key = handle.key();
    warn!("Writing message to agent for {} failed: {}", key, e);
    registry.remove_handle(&handle);
    handle.force_kill();
    sink.emit(SessionEvent::Complete {
        session_id: key,
        success: false,
        error: Some(
            DeckError::StdinWrite {
                message: e.to_string(),
            }
            .to_string(),
        ),
    });
}

struct ExitContext {
    registry: Arc<ProcessRegistry>,
    states: Arc<InstanceStateMachine>,
    sink: Arc<dyn EventSink>,
}

async fn watch_exit(
    started: Started,
    handle: ProcessHandle,
    decode_task: tokio::task::JoinHandle<()>,
    stderr_task: tokio::task::JoinHandle<StderrBuffer>,
    ctx: ExitContext,
) {
    let Started {
        mut child,
        reporter,
    } = started;
    let ExitReporter {
        exit_tx,
        mut kill_rx,
    } = reporter;

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            if let Err(e) = child.start_kill() {
                debug!("kill failed for pid {:?}: {}", handle.pid(), e);
            }
            child.wait().await
        }
    };
    let info = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!("Waiting on agent process {:?} failed: {}", handle.pid(), e);
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    let _ = exit_tx.send(Some(info));

    if let Err(e) = decode_task.await {
        warn!("Decoder task failed: {}", e);
    }
    let stderr = match stderr_task.await {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!("stderr task failed: {}", e);
            StderrBuffer::new(0)
        }
    };

    ctx.registry.remove_handle(&handle);
    let key = handle.key();
    let stopped = handle.stopped_by_user();
    let event = if info.success() || stopped {
        InstanceEvent::ProcessExit
    } else {
        InstanceEvent::ProcessError
    };
    ctx.states.transition(&key, event);
    if is_pending_key(&key) {
        ctx.states.remove_session(&key);
    }

    if !handle.claim_terminal() {
        return;
    }
    let error = if info.success() {
        None
    } else if stopped {
        Some("Agent process was stopped".to_string())
    } else {
        Some(describe_exit(&info, &stderr))
    };
    if let Some(error) = &error {
        if !stopped {
            warn!("Agent for {} failed: {}", key, error);
        }
    }
    info!("Agent for {} exited ({:?})", key, info);
    ctx.sink.emit(SessionEvent::Complete {
        session_id: key,
        success: info.success(),
        error,
    });
}

/// Failure text naming the exit code, the signal, and what the agent wrote
/// to stderr.
pub fn describe_exit(info: &ExitInfo, stderr: &StderrBuffer) -> String {
    let mut msg = match (info.code, info.signal) {
        (Some(code), _) => format!("Agent process exited with code {code}"),
        (None, Some(signal)) => format!("Agent process was killed by signal {signal}"),
        (None, None) => "Agent process exited abnormally".to_string(),
    };
    let tail = stderr.render();
    let tail = tail.trim();
    if !tail.is_empty() {
        msg.push_str(": ");
        msg.push_str(tail);
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::events::RecordingSink;
    use pretty_assertions::assert_eq;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_session_has_no_resume() {
        let req = SpawnRequest::new("/tmp/p", "hello");
        let args = build_args(&req, &[]);
        assert_eq!(
            args,
            strings(&[
                "-p",
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
                "--replay-user-messages",
                "--dangerously-skip-permissions",
            ])
        );
    }

    #[test]
    fn test_resumed_session_passes_resume() {
        let req = SpawnRequest::new("/tmp/p", "again").resume("S1");
        let args = build_args(&req, &["--model".into(), "opus".into()]);
        let tail: Vec<_> = args[STREAM_JSON_ARGS.len() + 1..].to_vec();
        assert_eq!(tail, strings(&["--resume", "S1", "--model", "opus"]));
    }

    #[test]
    fn test_rewind_args() {
        let req = SpawnRequest::new("/tmp/p", "retry")
            .resume("B")
            .fork_from(ForkOrigin {
                parent_id: "A".into(),
                resume_at: Some("u2".into()),
            });
        let args = build_args(&req, &[]);
        let tail: Vec<_> = args[STREAM_JSON_ARGS.len() + 1..].to_vec();
        assert_eq!(
            tail,
            strings(&[
                "--resume",
                "A",
                "--fork-session",
                "--session-id",
                "B",
                "--resume-session-at",
                "u2",
            ])
        );
    }

    #[test]
    fn test_plain_fork_has_no_resume_at() {
        let req = SpawnRequest::new("/tmp/p", "go")
            .resume("B")
            .fork_from(ForkOrigin {
                parent_id: "A".into(),
                resume_at: None,
            });
        let args = build_args(&req, &[]);
        assert!(args.contains(&"--fork-session".to_string()));
        assert!(!args.contains(&"--resume-session-at".to_string()));
    }

    #[test]
    fn test_pending_keys_are_unique() {
        let a = pending_key();
        let b = pending_key();
        assert_ne!(a, b);
        assert!(is_pending_key(&a));
        assert!(!is_pending_key("S1"));
    }

    #[test]
    fn test_describe_exit_includes_stderr() {
        let mut buf = StderrBuffer::new(64);
        buf.push(b"boom\n");
        let msg = describe_exit(
            &ExitInfo {
                code: Some(2),
                signal: None,
            },
            &buf,
        );
        assert_eq!(msg, "Agent process exited with code 2: boom");

        let msg = describe_exit(
            &ExitInfo {
                code: None,
                signal: Some(9),
            },
            &StderrBuffer::new(64),
        );
        assert!(msg.contains("signal 9"));
    }

    #[tokio::test]
    async fn test_missing_executable_reports_not_installed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.agent.executable = "agentdeck-no-such-agent-binary".into();
        let sink = Arc::new(RecordingSink::new());
        let registry = Arc::new(ProcessRegistry::new());
        let spawner = Spawner::new(
            &config,
            registry.clone(),
            Arc::new(CheckpointLedger::default()),
            Arc::new(InstanceStateMachine::new()),
            sink.clone(),
        )
        .with_agent_config_dir(dir.path().join("agent-config"));

        let req = SpawnRequest::new(dir.path().to_string_lossy(), "hi");
        let err = spawner.spawn(req).unwrap_err();
        assert!(matches!(err, DeckError::AgentNotInstalled { .. }));
        assert!(registry.is_empty());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::Complete { success, error, .. } => {
                assert!(!success);
                assert!(error.as_deref().unwrap().contains("not installed or not on PATH"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unidentified_run_drops_its_state() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("fake-agent");
        std::fs::write(&agent, "#!/bin/sh\ncat > /dev/null\nexit 3\n").unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.agent.executable = agent.to_string_lossy().into_owned();
        let sink = Arc::new(RecordingSink::new());
        let states = Arc::new(InstanceStateMachine::new());
        let spawner = Spawner::new(
            &config,
            Arc::new(ProcessRegistry::new()),
            Arc::new(CheckpointLedger::default()),
            states.clone(),
            sink.clone(),
        )
        .with_agent_config_dir(dir.path().join("agent-config"));

        let key = pending_key();
        states.transition(&key, InstanceEvent::SendMessage);
        assert!(states.is_tracked(&key));
        spawner
            .spawn_keyed(&key, SpawnRequest::new(dir.path().to_string_lossy(), "hi"))
            .unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(10), async {
            while !sink.events().iter().any(|e| e.is_complete()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok(), "agent run did not complete");
        assert!(!states.is_tracked(&key));
    }

    #[tokio::test]
    async fn test_missing_folder_is_spawn_error() {
        let config = Config::default();
        let spawner = Spawner::new(
            &config,
            Arc::new(ProcessRegistry::new()),
            Arc::new(CheckpointLedger::default()),
            Arc::new(InstanceStateMachine::new()),
            Arc::new(RecordingSink::new()),
        );
        let req = SpawnRequest::new("/definitely/not/a/real/folder", "hi");
        assert!(matches!(
            spawner.spawn(req),
            Err(DeckError::Spawn { .. })
        ));
    }
}
