use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::state::Lifecycle;
use crate::{
    DEFAULT_MAX_MESSAGE_BYTES, Error, Inbound, InboundReceiver, StderrReceiver, TransportState,
};

/// How long a freshly spawned server must stay alive before it counts as ready.
pub const DEFAULT_READY_WINDOW: Duration = Duration::from_millis(250);

const KILL_TIMEOUT: Duration = Duration::from_secs(5);
const STDERR_CHUNK_BYTES: usize = 8 * 1024;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

#[derive(Debug, Clone)]
pub struct StdioOptions {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Applied on top of the inherited process environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub ready_window: Duration,
    pub max_message_bytes: usize,
}

impl StdioOptions {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            ready_window: DEFAULT_READY_WINDOW,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

pub struct StdioTransport {
    lifecycle: Lifecycle,
    writer: Mutex<Option<BoxedWriter>>,
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    inbound_rx: Option<InboundReceiver>,
    stderr_rx: Option<StderrReceiver>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("state", &self.lifecycle.state())
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl StdioTransport {
    /// Spawns the server and waits out the readiness window.
    ///
    /// A process that exits inside the window fails with [`Error::Start`] carrying its exit
    /// status.
    pub async fn spawn(options: StdioOptions) -> Result<Self, Error> {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(TransportState::Starting);

        let program = options.program.to_string_lossy().into_owned();
        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args);
        cmd.envs(&options.env);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                lifecycle.fail();
                return Err(Error::start(format!("spawn {program} failed: {err}")));
            }
        };
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            lifecycle.fail();
            return Err(Error::start("child stdio not captured"));
        };

        match tokio::time::timeout(options.ready_window, child.wait()).await {
            Ok(Ok(status)) => {
                lifecycle.fail();
                return Err(Error::Start {
                    message: format!("{program} exited before becoming ready ({status})"),
                    exit_status: Some(status),
                });
            }
            Ok(Err(err)) => {
                lifecycle.fail();
                return Err(Error::start(format!("wait for {program} failed: {err}")));
            }
            Err(_) => {}
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            spawn_reader_task(
                stdout,
                lifecycle.clone(),
                inbound_tx,
                options.max_message_bytes,
            ),
            spawn_stderr_task(stderr, lifecycle.clone(), stderr_tx),
        ];
        lifecycle.advance(TransportState::Ready);
        tracing::debug!(program = %program, pid = ?pid, "stdio transport ready");

        Ok(Self {
            lifecycle,
            writer: Mutex::new(Some(Box::pin(stdin))),
            child: Mutex::new(Some(child)),
            pid,
            inbound_rx: Some(inbound_rx),
            stderr_rx: Some(stderr_rx),
            tasks,
        })
    }

    /// Wraps an already-connected byte stream pair (e.g. `tokio::io::duplex`).
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(TransportState::Starting);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = spawn_reader_task(
            read,
            lifecycle.clone(),
            inbound_tx,
            DEFAULT_MAX_MESSAGE_BYTES,
        );
        lifecycle.advance(TransportState::Ready);

        Self {
            lifecycle,
            writer: Mutex::new(Some(Box::pin(write))),
            child: Mutex::new(None),
            pid: None,
            inbound_rx: Some(inbound_rx),
            stderr_rx: None,
            tasks: vec![reader],
        }
    }

    pub fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_inbound(&mut self) -> Option<InboundReceiver> {
        self.inbound_rx.take()
    }

    pub fn take_stderr(&mut self) -> Option<StderrReceiver> {
        self.stderr_rx.take()
    }

    pub async fn send(&self, message: &Value) -> Result<(), Error> {
        self.lifecycle.ensure_ready()?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(Error::Closed)?;
            let mut frame = FrameProgress {
                lifecycle: &self.lifecycle,
                written: 0,
                len: line.len(),
            };
            while frame.written < frame.len {
                let n = writer.write(&line[frame.written..]).await.map_err(|err| {
                    Error::SendFailed(format!("write to server stdin failed: {err}"))
                })?;
                if n == 0 {
                    return Err(Error::SendFailed(
                        "write to server stdin failed: stdin closed".to_string(),
                    ));
                }
                frame.written += n;
            }
            writer
                .flush()
                .await
                .map_err(|err| Error::SendFailed(format!("flush server stdin failed: {err}")))
        };

        tokio::select! {
            biased;
            _ = self.lifecycle.cancelled() => Err(Error::Closed),
            result = write => result,
        }
    }

    /// Closes stdin, kills the process and reaps it.
    pub async fn close(&self) -> Result<(), Error> {
        self.lifecycle.begin_close();
        for task in &self.tasks {
            task.abort();
        }

        // Dropping stdin lets well-behaved servers observe EOF.
        drop(self.writer.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        if let Err(err) = child.start_kill() {
            // Already exited: nothing to kill, just reap below.
            if child.try_wait()?.is_none() {
                return Err(Error::Io(err));
            }
        }
        match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(pid = ?self.pid, %status, "stdio server exited");
                Ok(())
            }
            Err(_) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("server process did not exit within {KILL_TIMEOUT:?} of kill"),
            ))),
        }
    }
}

/// Tracks how much of one line reached stdin. A line abandoned half way (timeout, dropped
/// future, write error) leaves the stream unframed, so the transport fails.
struct FrameProgress<'a> {
    lifecycle: &'a Lifecycle,
    written: usize,
    len: usize,
}

impl Drop for FrameProgress<'_> {
    fn drop(&mut self) {
        if self.written > 0 && self.written < self.len && self.lifecycle.fail() {
            tracing::warn!(
                written = self.written,
                len = self.len,
                "send interrupted mid-line; stdio transport failed"
            );
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn spawn_reader_task<R>(
    reader: R,
    lifecycle: Lifecycle,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    max_message_bytes: usize,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(reader);
        loop {
            let next = tokio::select! {
                biased;
                _ = lifecycle.cancelled() => return,
                next = crate::read_line_limited(&mut reader, max_message_bytes) => next,
            };
            match next {
                Ok(Some(line)) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<Value>(&line) {
                        Ok(value) => {
                            let _ = inbound_tx.send(Inbound::Message(value));
                        }
                        Err(err) => {
                            tracing::warn!("skipping non-JSON line from server stdout: {err}");
                            let _ = inbound_tx
                                .send(Inbound::Error(format!("invalid json from server: {err}")));
                        }
                    }
                }
                Ok(None) => {
                    if lifecycle.fail() {
                        let _ = inbound_tx.send(Inbound::Closed("server closed stdout".to_string()));
                    }
                    return;
                }
                Err(err) => {
                    if lifecycle.fail() {
                        let _ = inbound_tx
                            .send(Inbound::Closed(format!("reading server stdout failed: {err}")));
                    }
                    return;
                }
            }
        }
    })
}

fn spawn_stderr_task<R>(
    mut stderr: R,
    lifecycle: Lifecycle,
    stderr_tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; STDERR_CHUNK_BYTES];
        loop {
            let read = tokio::select! {
                biased;
                _ = lifecycle.cancelled() => return,
                read = stderr.read(&mut buf) => read,
            };
            match read {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if stderr_tx.send(chunk).is_err() {
                        // Nobody listens; keep draining so the child never blocks on a full pipe.
                        continue;
                    }
                }
            }
        }
    })
}
