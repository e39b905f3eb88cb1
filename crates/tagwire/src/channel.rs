use std::{
    fmt,
    future::{self, Future},
    io,
    panic::{self, AssertUnwindSafe},
    pin::pin,
    process::ExitStatus,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Poll,
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin},
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, warn};

use crate::{
    codec,
    process::{build_command, spawn_with_retry},
    reader::reader_task,
    table::CorrelationTable,
    ChannelConfig, ChannelError, ScopeError,
};

/// How a single [`Channel::request`] concluded.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The child replied; carries the reply's `ext` payload.
    Reply(Value),
    /// No reply arrived before the deadline. The command is not cancelled at the child.
    TimedOut,
    /// The child's output ended before a reply arrived.
    Disconnected,
    /// The request line could not be written (the child's input is gone).
    SendFailed,
}

impl Outcome {
    /// Collapses the outcome to the reply payload, if there is one.
    pub fn into_reply(self) -> Option<Value> {
        match self {
            Self::Reply(value) => Some(value),
            _ => None,
        }
    }

    pub fn reply(&self) -> Option<&Value> {
        match self {
            Self::Reply(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_))
    }
}

/// Lifecycle state of a [`Channel`]. Requests are only accepted while `Open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    Open,
    Closing,
    Closed(ExitStatus),
}

struct Lifecycle {
    child: Child,
    reader: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Write side of the child's stdin.
///
/// `unsent` holds the rest of a line whose writer was cancelled (a request deadline
/// passed mid-write); the next writer finishes it first so lines never interleave.
struct Input {
    stdin: Option<ChildStdin>,
    unsent: Vec<u8>,
}

impl Input {
    async fn send(&mut self, line: &str) -> io::Result<()> {
        let Self { stdin, unsent } = self;
        let Some(stdin) = stdin.as_mut() else {
            return Err(io::ErrorKind::BrokenPipe.into());
        };

        unsent.extend_from_slice(line.as_bytes());
        while !unsent.is_empty() {
            let written = stdin.write(unsent.as_slice()).await?;
            if written == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            unsent.drain(..written);
        }
        stdin.flush().await
    }

    fn close(&mut self) {
        self.stdin.take();
        self.unsent.clear();
    }
}

/// A spawned child process driven through tagged JSON lines on its stdin/stdout.
///
/// Any number of tasks may call [`Channel::request`] concurrently; replies are matched
/// by tag, so they may arrive in any order. A single reader task owns the child's
/// stdout for the lifetime of the channel.
///
/// ```rust,no_run
/// use tagwire::{Channel, ChannelConfig};
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = Channel::open(ChannelConfig::from_command_line("snippet")?).await?;
/// let uptime = channel
///     .request("uptime", serde_json::json!({}), None)
///     .await?
///     .into_reply();
/// println!("{uptime:?}");
/// channel.close_checked().await?;
/// # Ok(()) }
/// ```
pub struct Channel {
    table: Arc<CorrelationTable>,
    input: AsyncMutex<Input>,
    lifecycle: AsyncMutex<Lifecycle>,
    phase: Mutex<Phase>,
    pid: Option<u32>,
    command: String,
    shutdown_grace: Duration,
}

impl Channel {
    /// Spawns the child with piped stdin/stdout and starts the reader task.
    pub async fn open(config: ChannelConfig) -> Result<Self, ChannelError> {
        let mut command = build_command(&config);
        let mut child = spawn_with_retry(&mut command, &config).await?;
        let description = config.describe();

        let stdout = child
            .stdout
            .take()
            .ok_or(ChannelError::StreamUnavailable { stream: "stdout" })?;
        let stdin = child
            .stdin
            .take()
            .ok_or(ChannelError::StreamUnavailable { stream: "stdin" })?;

        let table = Arc::new(CorrelationTable::new());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = tokio::spawn(reader_task(stdout, table.clone(), shutdown_rx));

        let pid = child.id();
        debug!(command = %description, ?pid, "opened channel");

        Ok(Self {
            table,
            input: AsyncMutex::new(Input {
                stdin: Some(stdin),
                unsent: Vec::new(),
            }),
            lifecycle: AsyncMutex::new(Lifecycle {
                child,
                reader: Some(reader),
                shutdown: Some(shutdown_tx),
            }),
            phase: Mutex::new(Phase::Open),
            pid,
            command: description,
            shutdown_grace: config.shutdown_grace,
        })
    }

    /// Opens a channel, runs `body` with it, and always closes it afterwards.
    ///
    /// An error from `body` is returned as [`ScopeError::Body`] even if the child also
    /// exited badly. Otherwise a non-zero exit status becomes
    /// [`ChannelError::BadExit`].
    ///
    /// If `body` panics, the channel is still closed (child reaped, reader task joined)
    /// before the panic resumes. Cancelling the returned future instead leaves teardown
    /// to `Drop`, which kills the child and aborts the reader without joining it.
    pub async fn scoped<F, Fut, T, E>(config: ChannelConfig, body: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let channel = Arc::new(Self::open(config).await?);
        let result = {
            let mut body = pin!(body(channel.clone()));
            future::poll_fn(|cx| {
                let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx)));
                match polled {
                    Ok(Poll::Pending) => Poll::Pending,
                    Ok(Poll::Ready(result)) => Poll::Ready(Ok(result)),
                    Err(payload) => Poll::Ready(Err(payload)),
                }
            })
            .await
        };
        let closed = channel.close_checked().await;

        let result = match result {
            Ok(result) => result,
            Err(payload) => {
                if let Err(close_err) = closed {
                    debug!("scope body panicked; suppressing teardown error: {close_err}");
                }
                panic::resume_unwind(payload);
            }
        };

        match result {
            Err(err) => {
                if let Err(close_err) = closed {
                    debug!("scope body failed; suppressing teardown error: {close_err}");
                }
                Err(ScopeError::Body(err))
            }
            Ok(value) => {
                closed?;
                Ok(value)
            }
        }
    }

    /// Sends `command` with `extension` and waits for the matching reply.
    ///
    /// `timeout` of `None` waits until a reply arrives or the child's output ends.
    /// Otherwise it bounds the whole request, including writing the line: a child that
    /// stops reading its input cannot hold the caller past the deadline.
    /// Operational failures are reported through [`Outcome`]; `Err` is reserved for a
    /// channel that is no longer open and for payloads that cannot be encoded.
    pub async fn request(
        &self,
        command: &str,
        extension: Value,
        timeout: Option<Duration>,
    ) -> Result<Outcome, ChannelError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(ChannelError::NotOpen { state });
        }

        let mut registration = self.table.register();
        let tag = registration.tag();
        let line = codec::encode_request(tag, command, &extension)?;
        let deadline = timeout.and_then(|limit| Instant::now().checked_add(limit));

        let written = match deadline {
            Some(deadline) => match time::timeout_at(deadline, self.write_line(&line)).await {
                Ok(written) => written,
                Err(_) => {
                    debug!(tag, command, "deadline passed while writing request");
                    return Ok(Outcome::TimedOut);
                }
            },
            None => self.write_line(&line).await,
        };
        if let Err(err) = written {
            debug!(tag, command, "failed to write request: {err}");
            return Ok(Outcome::SendFailed);
        }

        let outcome = registration.wait(deadline).await;
        if !outcome.is_reply() {
            debug!(tag, command, ?outcome, "request concluded without a reply");
        }
        Ok(outcome)
    }

    /// Like [`Channel::request`] but reduced to the reply payload.
    pub async fn ask(
        &self,
        command: &str,
        extension: Value,
        timeout: Option<Duration>,
    ) -> Option<Value> {
        match self.request(command, extension, timeout).await {
            Ok(outcome) => outcome.into_reply(),
            Err(err) => {
                debug!(command, "request rejected: {err}");
                None
            }
        }
    }

    async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut input = self.input.lock().await;
        let written = input.send(line).await;
        if written.is_err() {
            input.close();
        }
        written
    }

    /// Closes the child's stdin unless a writer holds it. A writer blocked on a full
    /// pipe fails once the child is gone and closes the input itself.
    fn close_input(&self) {
        if let Ok(mut input) = self.input.try_lock() {
            input.close();
        }
    }

    /// Terminates the child (gracefully when possible), joins the reader task, and
    /// returns the child's exit status. Calling it again returns the recorded status.
    pub async fn close(&self) -> Result<ExitStatus, ChannelError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Phase::Closed(status) = *self.phase() {
            return Ok(status);
        }
        *self.phase() = Phase::Closing;

        // Closing stdin lets a well-behaved child exit on end-of-input.
        self.close_input();
        let reaped = reap(&mut lifecycle.child, self.shutdown_grace).await;
        self.close_input();

        self.settle(&mut lifecycle, reaped).await
    }

    /// Stops and joins the reader whatever `reaped` says, then records the exit status.
    /// A failed wait leaves the channel `Closing` so a later `close` retries the reap.
    async fn settle(
        &self,
        lifecycle: &mut Lifecycle,
        reaped: Result<ExitStatus, ChannelError>,
    ) -> Result<ExitStatus, ChannelError> {
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(());
        }
        let joined = match lifecycle.reader.take() {
            Some(reader) => reader.await,
            None => Ok(()),
        };

        let status = match reaped {
            Ok(status) => status,
            Err(err) => {
                warn!(command = %self.command, "failed to reap child: {err}");
                return Err(err);
            }
        };
        debug!(command = %self.command, %status, "child exited");
        joined?;

        *self.phase() = Phase::Closed(status);
        Ok(status)
    }

    /// [`Channel::close`], treating any unsuccessful exit as [`ChannelError::BadExit`].
    pub async fn close_checked(&self) -> Result<ExitStatus, ChannelError> {
        let status = self.close().await?;
        if status.success() {
            Ok(status)
        } else {
            Err(ChannelError::BadExit { status })
        }
    }

    pub fn state(&self) -> ChannelState {
        match *self.phase() {
            Phase::Open => ChannelState::Open,
            Phase::Closing => ChannelState::Closing,
            Phase::Closed(_) => ChannelState::Closed,
        }
    }

    /// Exit status recorded by [`Channel::close`].
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.phase() {
            Phase::Closed(status) => Some(status),
            _ => None,
        }
    }

    /// OS process id of the child, if it was still running when the channel opened.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Number of requests currently waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table.len()
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn reap(child: &mut Child, grace: Duration) -> Result<ExitStatus, ChannelError> {
    let wait_err = |source| ChannelError::Wait { source };

    if let Some(status) = child.try_wait().map_err(wait_err)? {
        return Ok(status);
    }

    if !grace.is_zero() {
        if let Ok(waited) = time::timeout(grace, child.wait()).await {
            return waited.map_err(wait_err);
        }
    }

    warn!(pid = ?child.id(), ?grace, "child still running, killing it");
    if let Err(err) = child.start_kill() {
        debug!("failed to signal child: {err}");
    }
    child.wait().await.map_err(wait_err)
}

impl Drop for Channel {
    fn drop(&mut self) {
        if matches!(*self.phase(), Phase::Closed(_)) {
            return;
        }

        warn!(command = %self.command, "channel dropped without close; killing child");
        if let Ok(mut lifecycle) = self.lifecycle.try_lock() {
            lifecycle.shutdown.take();
            if let Some(reader) = lifecycle.reader.take() {
                reader.abort();
            }
            let _ = lifecycle.child.start_kill();
        }
    }
}
