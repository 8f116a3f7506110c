//! Transcoder process supervision
//!
//! One `StreamSupervisor` owns one transcoder subprocess for the lifetime of
//! an active session. It confirms the stream actually started (readiness
//! marker on the diagnostic output within a deadline), watches for abnormal
//! exit and for prolonged diagnostic silence, and stops the process
//! gracefully before escalating to a kill. Still capture shares the same
//! subprocess contract through `capture_frame`.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{watch, Mutex};

/// Deadline for the readiness marker after spawn
const START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a graceful stop waits before escalating to SIGKILL
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Diagnostic silence after which an active stream is considered stalled
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of the monitor loop
const MONITOR_TICK: Duration = Duration::from_millis(500);

/// Diagnostic lines kept for the failure log
const TAIL_LINES: usize = 20;

/// Markers on the diagnostic output that confirm frames are flowing
const READY_MARKERS: &[&str] = &["frame=", "size=", "Press [q] to stop"];

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch transcoder '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("capture timed out after {0:?}")]
    CaptureTimeout(Duration),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Spawned, readiness marker not yet seen
    Starting,
    /// Transcoder confirmed producing data
    Active,
    /// Terminated through `stop()` (terminal)
    Stopped,
    /// Exited, stalled, or never confirmed (terminal)
    Failed,
}

/// Tuning knobs for one supervised stream
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Mirror every diagnostic line into the log
    pub debug: bool,
    pub ready_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            debug: false,
            ready_timeout: START_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
        }
    }
}

/// Owner of one transcoder subprocess
pub struct StreamSupervisor {
    label: String,
    child: Arc<Mutex<Option<Child>>>,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    stopping: Arc<AtomicBool>,
}

impl StreamSupervisor {
    /// Launch the transcoder and begin monitoring it.
    ///
    /// The child inherits the daemon environment; its stderr is consumed by
    /// the monitor task. `kill_on_drop` guarantees no orphan survives the
    /// supervisor itself being dropped.
    pub fn start(bin: &str, args: &[String], label: &str, opts: StartOptions) -> Result<Self> {
        let mut child = Command::new(bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                bin: bin.to_string(),
                source: e,
            })?;

        let stderr = child.stderr.take();
        let (state_tx, _) = watch::channel(SupervisorState::Starting);
        let state_tx = Arc::new(state_tx);
        let child = Arc::new(Mutex::new(Some(child)));
        let stopping = Arc::new(AtomicBool::new(false));

        tokio::spawn(monitor(
            label.to_string(),
            child.clone(),
            stderr,
            state_tx.clone(),
            stopping.clone(),
            opts,
        ));

        Ok(Self {
            label: label.to_string(),
            child,
            state_tx,
            stopping,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions (used for failure teardown)
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Terminate the transcoder: SIGTERM, then SIGKILL after the grace
    /// period. Stopping an already-dead handle is a no-op.
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            *guard = None;
            transition(&self.state_tx, SupervisorState::Stopped);
            return;
        }
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
            log::warn!("[{}] transcoder ignored SIGTERM, killing", self.label);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *guard = None;
        transition(&self.state_tx, SupervisorState::Stopped);
    }
}

/// Move to `next` unless a terminal state was already reached
fn transition(tx: &watch::Sender<SupervisorState>, next: SupervisorState) {
    tx.send_if_modified(|state| {
        if matches!(*state, SupervisorState::Stopped | SupervisorState::Failed) {
            return false;
        }
        *state = next;
        true
    });
}

async fn kill_now(child: &Mutex<Option<Child>>) {
    let mut guard = child.lock().await;
    if let Some(c) = guard.as_mut() {
        let _ = c.start_kill();
        let _ = c.wait().await;
    }
    *guard = None;
}

async fn monitor(
    label: String,
    child: Arc<Mutex<Option<Child>>>,
    stderr: Option<ChildStderr>,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    stopping: Arc<AtomicBool>,
    opts: StartOptions,
) {
    let started = Instant::now();
    let mut last_output = Instant::now();
    let mut ready = false;
    let mut tail: VecDeque<String> = VecDeque::with_capacity(TAIL_LINES);

    if let Some(stderr) = stderr {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match tokio::time::timeout(MONITOR_TICK, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    last_output = Instant::now();
                    if opts.debug {
                        log::debug!("[{}] {}", label, line);
                    }
                    if tail.len() == TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                    if !ready && READY_MARKERS.iter().any(|m| line.contains(m)) {
                        ready = true;
                        transition(&state_tx, SupervisorState::Active);
                        log::info!("[{}] transcoder confirmed streaming", label);
                    }
                }
                // EOF or a broken pipe: the child is on its way out
                Ok(Ok(None)) | Ok(Err(_)) => break,
                Err(_) => {
                    if stopping.load(Ordering::SeqCst) {
                        continue;
                    }
                    if !ready && started.elapsed() > opts.ready_timeout {
                        log::warn!(
                            "[{}] no readiness signal within {:?}, killing transcoder",
                            label,
                            opts.ready_timeout
                        );
                        transition(&state_tx, SupervisorState::Failed);
                        kill_now(&child).await;
                        break;
                    }
                    if ready && last_output.elapsed() > opts.idle_timeout {
                        log::warn!(
                            "[{}] transcoder silent for {:?}, killing",
                            label,
                            opts.idle_timeout
                        );
                        transition(&state_tx, SupervisorState::Failed);
                        kill_now(&child).await;
                        break;
                    }
                }
            }
        }
    }

    let status = {
        let mut guard = child.lock().await;
        match guard.take() {
            Some(mut c) => c.wait().await.ok(),
            None => None,
        }
    };

    // None means stop() or the kill path above already reaped the child and
    // set the final state
    if let Some(status) = status {
        if stopping.load(Ordering::SeqCst) {
            transition(&state_tx, SupervisorState::Stopped);
        } else {
            if status.success() {
                log::warn!("[{}] transcoder exited while session active", label);
            } else {
                log::warn!("[{}] transcoder exited with {}", label, status);
                if !opts.debug {
                    for line in &tail {
                        log::warn!("[{}]   {}", label, line);
                    }
                }
            }
            transition(&state_tx, SupervisorState::Failed);
        }
    }
}

/// Run a one-shot capture and return its stdout bytes.
///
/// `kill_on_drop` reaps the child when the timeout cancels the wait, so an
/// unresponsive camera cannot accumulate zombie transcoders.
pub async fn capture_frame(bin: &str, args: &[String], timeout: Duration) -> Result<Vec<u8>> {
    let child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SupervisorError::Spawn {
            bin: bin.to_string(),
            source: e,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(SupervisorError::Capture(stderr.trim().to_string()));
            }
            if output.stdout.is_empty() {
                return Err(SupervisorError::Capture("empty capture output".to_string()));
            }
            Ok(output.stdout)
        }
        Ok(Err(e)) => Err(SupervisorError::Capture(e.to_string())),
        Err(_) => Err(SupervisorError::CaptureTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn wait_for_state(sup: &StreamSupervisor, want: SupervisorState) {
        for _ in 0..100 {
            if sup.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("supervisor never reached {:?}, is {:?}", want, sup.state());
    }

    #[tokio::test]
    async fn test_readiness_marker_activates_stream() {
        let sup = StreamSupervisor::start(
            "sh",
            &sh("echo 'frame=    1 fps=25' >&2; sleep 30"),
            "test",
            StartOptions::default(),
        )
        .unwrap();
        wait_for_state(&sup, SupervisorState::Active).await;
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let sup = StreamSupervisor::start(
            "sh",
            &sh("echo 'frame=1' >&2; sleep 30"),
            "test",
            StartOptions::default(),
        )
        .unwrap();
        sup.stop().await;
        sup.stop().await;
        assert_eq!(sup.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_abnormal_exit_fails_stream() {
        let sup = StreamSupervisor::start(
            "sh",
            &sh("echo 'frame=1' >&2; exit 2"),
            "test",
            StartOptions::default(),
        )
        .unwrap();
        wait_for_state(&sup, SupervisorState::Failed).await;
    }

    #[tokio::test]
    async fn test_missing_readiness_marker_fails_stream() {
        let opts = StartOptions {
            ready_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let sup = StreamSupervisor::start("sh", &sh("sleep 30"), "test", opts).unwrap();
        wait_for_state(&sup, SupervisorState::Failed).await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let result = StreamSupervisor::start(
            "/nonexistent/transcoder",
            &[],
            "test",
            StartOptions::default(),
        );
        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_capture_frame_returns_stdout() {
        let bytes = capture_frame("sh", &sh("printf imagedata"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(bytes, b"imagedata");
    }

    #[tokio::test]
    async fn test_capture_frame_surfaces_stderr_on_failure() {
        let err = capture_frame("sh", &sh("echo boom >&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            SupervisorError::Capture(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_frame_times_out() {
        let err = capture_frame("sh", &sh("sleep 10"), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::CaptureTimeout(_)));
    }
}
