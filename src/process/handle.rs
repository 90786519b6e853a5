// src/process/handle.rs — Shared handle to a live agent process

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// How long to wait for the exit to be observed after a forced kill.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Exit details observed by the exit watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

struct HandleInner {
    pid: Option<u32>,
    key: Mutex<String>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped_by_user: AtomicBool,
    terminal_sent: AtomicBool,
}

/// Cheap-to-clone reference to one spawned agent process. The child itself
/// is owned by its exit watcher task; the handle signals it and observes
/// its exit.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("key", &self.key())
            .field("exit", &self.exit_info())
            .finish()
    }
}

/// The exit watcher's half of a handle.
pub(crate) struct ExitReporter {
    pub exit_tx: watch::Sender<Option<ExitInfo>>,
    pub kill_rx: oneshot::Receiver<()>,
}

impl ProcessHandle {
    pub(crate) fn new(pid: Option<u32>, key: &str) -> (Self, ExitReporter) {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                pid,
                key: Mutex::new(key.to_string()),
                exit_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
                stopped_by_user: AtomicBool::new(false),
                terminal_sent: AtomicBool::new(false),
            }),
        };
        (handle, ExitReporter { exit_tx, kill_rx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    /// The registry key this process is currently filed under.
    pub fn key(&self) -> String {
        self.inner
            .key
            .lock()
            .map(|k| k.clone())
            .unwrap_or_default()
    }

    pub(crate) fn set_key(&self, key: &str) {
        if let Ok(mut k) = self.inner.key.lock() {
            *k = key.to_string();
        }
    }

    pub fn same_process(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.inner.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Resolves once the exit watcher reports an exit. `None` if the watcher
    /// went away without reporting one.
    pub async fn exited(&self) -> Option<ExitInfo> {
        let mut rx = self.inner.exit_rx.clone();
        let info = rx.wait_for(|s| s.is_some()).await.ok().and_then(|s| *s);
        info
    }

    /// Wait up to `timeout` for the process to exit. Returns true if it did.
    pub async fn wait_for_exit(&self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.exited()).await,
            Ok(Some(_))
        )
    }

    /// Record that the process is being stopped on request, so its exit is
    /// not reported as a failure of the session.
    pub fn mark_stopped_by_user(&self) {
        self.inner.stopped_by_user.store(true, Ordering::SeqCst);
    }

    pub fn stopped_by_user(&self) -> bool {
        self.inner.stopped_by_user.load(Ordering::SeqCst)
    }

    /// First caller wins the right to emit the process's terminal event.
    pub(crate) fn claim_terminal(&self) -> bool {
        self.inner
            .terminal_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Ask the process to exit (SIGTERM). Falls back to a forced kill where
    /// signals are unavailable.
    pub fn request_terminate(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            match self.inner.pid {
                Some(pid) => send_signal(pid, libc::SIGTERM),
                None => Ok(()),
            }
        }
        #[cfg(not(unix))]
        {
            self.force_kill();
            Ok(())
        }
    }

    /// Kill the process unconditionally.
    pub fn force_kill(&self) {
        let tx = self.inner.kill_tx.lock().ok().and_then(|mut tx| tx.take());
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. Returns true once the exit
    /// has been observed.
    pub async fn stop(&self, grace: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        if let Err(e) = self.request_terminate() {
            tracing::warn!("SIGTERM to agent process {:?} failed: {}", self.pid(), e);
        }
        if self.wait_for_exit(grace).await {
            return true;
        }

        tracing::debug!(
            "Agent process {:?} still running after {:?}, killing",
            self.pid(),
            grace
        );
        self.force_kill();
        self.wait_for_exit(KILL_CONFIRM_TIMEOUT).await
    }
}

/// Deliver `signal` to `pid`. A process that is already gone counts as success.
#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
