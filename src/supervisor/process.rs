use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::command::LaunchCommand;
use super::SupervisorError;

/// Lines kept per process for console views
pub const OUTPUT_HISTORY: usize = 500;

/// Bound on waiting for the output readers after the process is gone
const READER_JOIN: Duration = Duration::from_secs(1);

/// Lines that are forwarded but too frequent to log
const NOISE_MARKERS: &[&str] = &["update_slots", "log_server_r"];

static N_CTX: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\bn_ctx\s*=\s*(\d+)").ok());

/// Receives `(model_id, line)` for every output line of every process
pub type OutputSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// How a process ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal or not observable
    pub code: Option<i32>,
}

/// One running `llama-server`.
///
/// The child itself is owned by a waiter task; the record talks to it
/// through channels so accessors never block on the process.
pub struct ProcessRecord {
    model_id: String,
    pid: Option<u32>,
    port: u16,
    command: String,
    started_at: DateTime<Utc>,
    running: Arc<AtomicBool>,
    ctx_size: watch::Receiver<Option<u64>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: mpsc::Sender<()>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    output: Arc<Mutex<VecDeque<String>>>,
}

/// Serializable view of a [`ProcessRecord`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub model_id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub ctx_size: Option<u64>,
    pub command: String,
    pub started_at: DateTime<Utc>,
}

impl ProcessRecord {
    /// Spawn the server and attach its output readers
    pub(crate) fn spawn(
        model_id: &str,
        launch: &LaunchCommand,
        port: u16,
        sink: Option<OutputSink>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let command = launch.display();
        tracing::info!("Launching {}: {}", model_id, command);

        let mut cmd = launch.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            program: launch.program.display().to_string(),
            source: e,
        })?;
        let pid = child.id();

        let running = Arc::new(AtomicBool::new(true));
        let output = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_HISTORY)));
        let (ctx_tx, ctx_rx) = watch::channel(None);
        let ctx_tx = Arc::new(ctx_tx);

        let mut readers = Vec::with_capacity(2);
        let reader = |stream| LineReader {
            model_id: model_id.to_string(),
            running: running.clone(),
            output: output.clone(),
            ctx_size: ctx_tx.clone(),
            sink: sink.clone(),
            stream,
        };
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(reader(StreamKind::Stdout).run(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(reader(StreamKind::Stderr).run(stderr)));
        }
        drop(ctx_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let waiter_id = model_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx.recv() => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill {}: {}", waiter_id, e);
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit { code: status.code() },
                Err(e) => {
                    tracing::warn!("Failed to wait for {}: {}", waiter_id, e);
                    ProcessExit::default()
                }
            };
            tracing::debug!("Process for {} exited with {:?}", waiter_id, exit.code);
            exit_tx.send_replace(Some(exit));
        });

        Ok(Arc::new(Self {
            model_id: model_id.to_string(),
            pid,
            port,
            command,
            started_at: Utc::now(),
            running,
            ctx_size: ctx_rx,
            exit: exit_rx,
            kill: kill_tx,
            readers: Mutex::new(readers),
            output,
        }))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Context size reported by the server, once it has started
    pub fn ctx_size(&self) -> Option<u64> {
        *self.ctx_size.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.exit.borrow().is_none()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Most recent output lines, oldest first
    pub fn recent_output(&self) -> Vec<String> {
        self.output.lock().iter().cloned().collect()
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            model_id: self.model_id.clone(),
            pid: self.pid,
            port: self.port,
            ctx_size: self.ctx_size(),
            command: self.command.clone(),
            started_at: self.started_at,
        }
    }

    /// Resolves with the context size once the server reports it, or
    /// `None` when both output streams closed first.
    pub async fn wait_ready(&self) -> Option<u64> {
        let mut rx = self.ctx_size.clone();
        let ready = match rx.wait_for(Option::is_some).await {
            Ok(ctx) => *ctx,
            Err(_) => None,
        };
        ready
    }

    /// Resolves when the process has exited
    pub async fn wait_exit(&self) -> ProcessExit {
        let mut rx = self.exit.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or_default(),
            Err(_) => ProcessExit::default(),
        };
        exit
    }

    async fn wait_exit_for(&self, limit: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(limit, self.wait_exit()).await.ok()
    }

    /// Ask the process to exit, escalating to a kill after `grace`.
    ///
    /// Returns once the process is gone and its readers are joined.
    pub async fn terminate(&self, grace: Duration) -> ProcessExit {
        if !self.has_exited() {
            self.request_graceful_exit();
        }

        let exit = match self.wait_exit_for(grace).await {
            Some(exit) => exit,
            None => {
                tracing::warn!(
                    "{} did not exit within {:?}, forcing kill",
                    self.model_id,
                    grace
                );
                let _ = self.kill.try_send(());
                self.wait_exit().await
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.join_readers().await;
        exit
    }

    #[cfg(unix)]
    fn request_graceful_exit(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    tracing::debug!("SIGTERM to {} failed: {}", pid, e);
                }
            }
            None => {
                let _ = self.kill.try_send(());
            }
        }
    }

    #[cfg(not(unix))]
    fn request_graceful_exit(&self) {
        let _ = self.kill.try_send(());
    }

    async fn join_readers(&self) {
        let handles = std::mem::take(&mut *self.readers.lock());
        for handle in handles {
            let abort = handle.abort_handle();
            if tokio::time::timeout(READER_JOIN, handle).await.is_err() {
                tracing::debug!("Output reader of {} still busy, aborting", self.model_id);
                abort.abort();
            }
        }
    }
}

impl std::fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRecord")
            .field("model_id", &self.model_id)
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("ctx_size", &self.ctx_size())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

struct LineReader {
    model_id: String,
    running: Arc<AtomicBool>,
    output: Arc<Mutex<VecDeque<String>>>,
    ctx_size: Arc<watch::Sender<Option<u64>>>,
    sink: Option<OutputSink>,
    stream: StreamKind,
}

impl LineReader {
    async fn run<R: AsyncRead + Unpin>(self, stream: R) {
        let mut lines = BufReader::new(stream).lines();
        while self.running.load(Ordering::SeqCst) {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Output stream of {} failed: {}", self.model_id, e);
                    break;
                }
            };
            self.handle(&line);
        }
    }

    fn handle(&self, line: &str) {
        if self.ctx_size.borrow().is_none() {
            if let Some(ctx) = parse_context_size(line) {
                self.ctx_size.send_replace(Some(ctx));
            }
        }

        {
            let mut output = self.output.lock();
            if output.len() == OUTPUT_HISTORY {
                output.pop_front();
            }
            output.push_back(line.to_string());
        }

        if !is_noise(line) {
            match self.stream {
                StreamKind::Stdout => tracing::info!(target: "llama_server", "[{}] {}", self.model_id, line),
                StreamKind::Stderr => tracing::info!(target: "llama_server", "[{}!] {}", self.model_id, line),
            }
        }

        if let Some(sink) = &self.sink {
            sink(&self.model_id, line);
        }
    }
}

/// Context size announced by a `llama-server` startup line
pub fn parse_context_size(line: &str) -> Option<u64> {
    let caps = N_CTX.as_ref()?.captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

fn is_noise(line: &str) -> bool {
    NOISE_MARKERS.iter().any(|marker| line.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_context_size() {
        assert_eq!(parse_context_size("llama_context: n_ctx         = 4096"), Some(4096));
        assert_eq!(parse_context_size("slot init: id 0 | n_ctx = 8192"), Some(8192));
        assert_eq!(parse_context_size("llama_context: n_ctx_per_seq = 4096"), None);
        assert_eq!(parse_context_size("print_info: n_ctx_train = 40960"), None);
        assert_eq!(parse_context_size("main: server is listening"), None);
    }

    #[test]
    fn test_noise_filter() {
        assert!(is_noise("srv  update_slots: all slots are idle"));
        assert!(is_noise("srv  log_server_r: request: GET /health 127.0.0.1 200"));
        assert!(!is_noise("llama_context: n_ctx = 4096"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::path::PathBuf;

        fn shell(script: &str) -> LaunchCommand {
            LaunchCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), script.into()],
                env: Vec::new(),
            }
        }

        #[tokio::test]
        async fn test_readiness_and_output_capture() {
            let lines = Arc::new(Mutex::new(Vec::<String>::new()));
            let captured = lines.clone();
            let sink: OutputSink = Arc::new(move |id, line| captured.lock().push(format!("{id}:{line}")));

            let record = ProcessRecord::spawn(
                "m1",
                &shell("echo 'srv update_slots: idle'; echo 'llama_context: n_ctx = 2048' >&2; exec sleep 30"),
                8081,
                Some(sink),
            )
            .unwrap();

            let ctx = tokio::time::timeout(Duration::from_secs(5), record.wait_ready()).await.unwrap();
            assert_eq!(ctx, Some(2048));
            assert_eq!(record.ctx_size(), Some(2048));
            assert!(record.is_running());
            for _ in 0..100 {
                if record.recent_output().len() == 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let exit = record.terminate(Duration::from_secs(2)).await;
            assert!(exit.code.is_none());
            assert!(record.has_exited());
            assert!(!record.is_running());

            let output = record.recent_output();
            assert_eq!(output.len(), 2);
            assert!(lines.lock().iter().any(|l| l == "m1:llama_context: n_ctx = 2048"));
        }

        #[tokio::test]
        async fn test_terminate_escalates_to_kill() {
            let record = ProcessRecord::spawn(
                "stubborn",
                &shell("trap '' TERM; echo started; while true; do sleep 1; done"),
                8082,
                None,
            )
            .unwrap();

            // Let the shell install its trap before signalling
            tokio::time::sleep(Duration::from_millis(300)).await;
            let started = std::time::Instant::now();
            record.terminate(Duration::from_millis(300)).await;

            assert!(record.has_exited());
            assert!(started.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_exit_code_is_reported() {
            let record = ProcessRecord::spawn("quits", &shell("echo bye; exit 3"), 8083, None).unwrap();
            let exit = tokio::time::timeout(Duration::from_secs(5), record.wait_exit()).await.unwrap();
            assert_eq!(exit.code, Some(3));
            assert_eq!(record.wait_ready().await, None);
        }

        #[tokio::test]
        async fn test_output_history_is_bounded() {
            let record = ProcessRecord::spawn(
                "chatty",
                &shell("i=0; while [ $i -lt 600 ]; do echo line $i; i=$((i+1)); done"),
                8084,
                None,
            )
            .unwrap();
            record.wait_exit().await;
            // Let the readers drain the pipe
            for _ in 0..100 {
                if record.recent_output().last().map(String::as_str) == Some("line 599") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }

            let output = record.recent_output();
            assert_eq!(output.len(), OUTPUT_HISTORY);
            assert_eq!(output.first().map(String::as_str), Some("line 100"));
        }

        #[tokio::test]
        async fn test_missing_binary_is_a_spawn_error() {
            let launch = LaunchCommand {
                program: PathBuf::from("/nonexistent/llama-server"),
                args: Vec::new(),
                env: Vec::new(),
            };
            let err = ProcessRecord::spawn("m1", &launch, 8081, None).unwrap_err();
            assert!(matches!(err, SupervisorError::Spawn { .. }));
        }
    }
}
