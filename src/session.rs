//! A room's sandboxed shell and the connections that drive it.
//!
//! `Session` owns the process: it is the only writer to its stdin and the
//! only reader of its output. `drive_connection` runs one WebSocket client
//! against a room: handshake, history replay, command intake, and cleanup.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nix::sys::signal::Signal;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{self, CommandMessage, ProtocolError, ServerEvent, Utf8Chunker};
use crate::registry::{BroadcastSink, Connection, RoomRegistry};
use crate::sandbox::{cleanup_workdir, signal_group, SandboxError, SandboxProcess};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("sandboxed process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("session is closed")]
    Closed,
    #[error("failed to write to the session: {0}")]
    Write(#[source] io::Error),
    #[error("room {0} ended before the connection could attach")]
    Ended(String),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Byte cap of the replay history per room.
    pub history_limit: usize,
    /// Delay between liveness checks of the room's process.
    pub idle_backoff: Duration,
    /// How long a shell gets to exit on its own before it is killed.
    pub exit_timeout: Duration,
    /// Outbound queue depth per connection.
    pub connection_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_limit: 1024 * 1024,
            idle_backoff: Duration::from_millis(50),
            exit_timeout: Duration::from_secs(2),
            connection_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub struct Session {
    id: Uuid,
    room: String,
    elevated: bool,
    pid: Option<u32>,
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Child>,
    workdir: Mutex<Option<TempDir>>,
    pump_cancel: CancellationToken,
    exit_timeout: Duration,
    created_at: Instant,
}

impl Session {
    /// Take ownership of a freshly launched shell and start pumping its
    /// output into `sink`.
    pub fn start(
        room: &str,
        process: SandboxProcess,
        elevated: bool,
        config: &SessionConfig,
        sink: Arc<dyn BroadcastSink>,
    ) -> Result<Arc<Self>, SessionError> {
        let SandboxProcess { mut child, workdir } = process;
        let stdin = child.stdin.take().ok_or(SessionError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SessionError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(SessionError::MissingPipe("stderr"))?;

        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            room: room.to_string(),
            elevated,
            pid: child.id(),
            state: Mutex::new(SessionState::Starting),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: tokio::sync::Mutex::new(child),
            workdir: Mutex::new(Some(workdir)),
            pump_cancel: CancellationToken::new(),
            exit_timeout: config.exit_timeout,
            created_at: Instant::now(),
        });

        tokio::spawn(pump_output(
            stdout,
            stderr,
            Arc::downgrade(&session),
            sink,
            session.pump_cancel.clone(),
            config.idle_backoff,
        ));
        session.set_state(SessionState::Running);
        info!(room, session = %session.id, pid = ?session.pid, elevated, "session started");
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn elevated(&self) -> bool {
        self.elevated
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Write one command line to the shell. Writes are serialized.
    pub async fn write_command(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Running {
            return Err(SessionError::Closed);
        }
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(SessionError::Closed)?;
        pipe.write_all(line.as_bytes())
            .await
            .map_err(SessionError::Write)?;
        pipe.flush().await.map_err(SessionError::Write)?;
        debug!(room = %self.room, bytes = line.len(), "command written");
        Ok(())
    }

    /// `Some(exit_code)` once the process has exited, `None` while it runs
    /// or while a termination holds the handle.
    async fn exit_status(&self) -> Option<Option<i32>> {
        let mut child = self.child.try_lock().ok()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(e) => {
                warn!(room = %self.room, error = %e, "failed to poll session process");
                Some(None)
            }
        }
    }

    /// Stop the process and release its directory. Safe to call repeatedly.
    pub async fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.pump_cancel.cancel();

        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let polite = async {
                stdin.write_all(b"exit\n").await?;
                stdin.flush().await
            };
            let _ = tokio::time::timeout(self.exit_timeout, polite).await;
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(self.exit_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(room = %self.room, session = %self.id, exit_code = ?status.code(), "session process exited")
            }
            Ok(Err(e)) => warn!(room = %self.room, error = %e, "failed to wait for session process"),
            Err(_) => {
                warn!(room = %self.room, session = %self.id, "session process ignored exit, killing");
                if let Some(pid) = self.pid {
                    signal_group(pid, Signal::SIGKILL);
                }
                let _ = child.kill().await;
            }
        }
        // background jobs the shell left behind
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::SIGKILL);
        }
        drop(child);

        let workdir = self
            .workdir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(workdir) = workdir {
            cleanup_workdir(workdir);
        }
        self.set_state(SessionState::Closed);
        info!(room = %self.room, session = %self.id, "session closed");
    }
}

struct OutputStream<R> {
    reader: R,
    buf: Vec<u8>,
    decoder: Utf8Chunker,
    open: bool,
    is_err: bool,
}

impl<R: AsyncRead + Unpin> OutputStream<R> {
    fn new(reader: R, is_err: bool) -> Self {
        Self {
            reader,
            buf: vec![0u8; READ_CHUNK],
            decoder: Utf8Chunker::default(),
            open: true,
            is_err,
        }
    }

    fn event(&self, content: String) -> Option<ServerEvent> {
        if content.is_empty() {
            return None;
        }
        Some(if self.is_err {
            ServerEvent::ShellError { content }
        } else {
            ServerEvent::ShellOutput { content }
        })
    }

    /// Read once and turn the result into an event, closing the stream on
    /// EOF. Cancel safe: nothing is consumed unless the read completes.
    async fn next_event(&mut self) -> Option<ServerEvent> {
        let read = self.reader.read(&mut self.buf).await;
        match read {
            Ok(0) => {
                self.open = false;
                let rest = self.decoder.finish();
                self.event(rest)
            }
            Ok(n) => {
                let text = self.decoder.push(&self.buf[..n]);
                self.event(text)
            }
            Err(e) => {
                warn!(error = %e, "session output read failed");
                self.open = false;
                None
            }
        }
    }
}

enum Step {
    Output(Option<ServerEvent>),
    Tick,
}

/// Single producer for a room: everything read from the process is
/// published in the order it was read.
///
/// Liveness is polled on every tick whether or not the pipes are open.
/// A background job can keep both pipes open after the shell exits, and
/// both pipes can close while the shell keeps running.
async fn pump_output<O, E>(
    stdout: O,
    stderr: E,
    session: Weak<Session>,
    sink: Arc<dyn BroadcastSink>,
    cancel: CancellationToken,
    idle_backoff: Duration,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = OutputStream::new(stdout, false);
    let mut err = OutputStream::new(stderr, true);
    let mut liveness = tokio::time::interval(idle_backoff.max(Duration::from_millis(1)));
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = liveness.tick() => Step::Tick,
            event = out.next_event(), if out.open => Step::Output(event),
            event = err.next_event(), if err.open => Step::Output(event),
        };
        match step {
            Step::Output(Some(event)) => sink.broadcast(event),
            Step::Output(None) => {}
            Step::Tick => {
                let status = match session.upgrade() {
                    Some(session) => session.exit_status().await,
                    None => return,
                };
                if let Some(exit_code) = status {
                    drain(&mut out, &mut err, sink.as_ref(), idle_backoff).await;
                    // a termination we started is not reported as an exit
                    if cancel.is_cancelled() {
                        return;
                    }
                    sink.ended(exit_code);
                    return;
                }
            }
        }
    }
}

/// Publish what the process wrote before it exited. Stops at EOF or once
/// the pipes stay quiet for `grace`, since a surviving background job may
/// hold them open.
async fn drain<O, E>(
    out: &mut OutputStream<O>,
    err: &mut OutputStream<E>,
    sink: &dyn BroadcastSink,
    grace: Duration,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    while out.open || err.open {
        let event = tokio::select! {
            event = out.next_event(), if out.open => event,
            event = err.next_event(), if err.open => event,
            _ = tokio::time::sleep(grace) => break,
        };
        if let Some(event) = event {
            sink.broadcast(event);
        }
    }
}

/// Why a connection's read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Disconnect,
    TransportClosed,
    Closed,
}

/// Serve one WebSocket client attached to `room` until it disconnects.
pub async fn drive_connection(socket: WebSocket, registry: RoomRegistry, room: String, elevated: bool) {
    let (conn, events) = Connection::new(registry.config().connection_buffer);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let joined = match registry.join(&room, &conn, elevated).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(room, error = %e, "failed to attach connection");
            let error = ServerEvent::Error {
                message: e.to_string(),
            };
            let _ = ws_tx.send(Message::Text(error.encode())).await;
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };

    let mut writer = tokio::spawn(write_events(
        ws_tx,
        room.clone(),
        joined.replay,
        events,
        conn.closed().clone(),
    ));

    let exit = read_commands(&mut ws_rx, &conn, &joined.session).await;
    info!(room, conn = %conn.id(), ?exit, "connection closing");

    // disconnect, transport loss and eviction all end up here
    registry.leave(&room, conn.id()).await;
    let exit_timeout = registry.config().exit_timeout;
    drop(conn);
    if tokio::time::timeout(exit_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn read_commands(
    ws_rx: &mut SplitStream<WebSocket>,
    conn: &Connection,
    session: &Session,
) -> Exit {
    loop {
        let frame = tokio::select! {
            _ = conn.closed().cancelled() => return Exit::Closed,
            frame = ws_rx.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                conn.send(ServerEvent::Error {
                    message: ProtocolError::Binary.to_string(),
                });
                continue;
            }
            Some(Ok(Message::Close(_))) | None => return Exit::TransportClosed,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "websocket receive failed");
                return Exit::TransportClosed;
            }
        };

        match CommandMessage::decode(&text) {
            Ok(CommandMessage::ShellCommand { command }) => {
                match session.write_command(&command).await {
                    Ok(()) => conn.send(ServerEvent::CommandComplete { command }),
                    Err(e) => conn.send(ServerEvent::Error {
                        message: e.to_string(),
                    }),
                };
            }
            Ok(CommandMessage::Ping) => {
                conn.send(ServerEvent::Pong);
            }
            Ok(CommandMessage::Disconnect) => return Exit::Disconnect,
            Err(e) => {
                conn.send(ServerEvent::Error {
                    message: e.to_string(),
                });
            }
        }
    }
}

async fn write_events(
    mut ws_tx: SplitSink<WebSocket, Message>,
    room: String,
    replay: Vec<ServerEvent>,
    mut events: mpsc::Receiver<ServerEvent>,
    closed: CancellationToken,
) {
    let handshake = Message::Text(protocol::handshake(&room));
    let mut ok = ws_tx.send(handshake).await.is_ok();
    for event in replay {
        if !ok {
            break;
        }
        ok = ws_tx.send(Message::Text(event.encode())).await.is_ok();
    }
    while ok {
        let Some(event) = events.recv().await else {
            break;
        };
        ok = ws_tx.send(Message::Text(event.encode())).await.is_ok();
    }
    if ok {
        let _ = ws_tx.send(Message::Close(None)).await;
    } else {
        // a dead socket must also stop the read side
        closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{LaunchKind, ResourceLimits, SandboxConfig, SandboxLauncher, WrapperKind};
    use std::path::PathBuf;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ServerEvent>>,
        ended: Mutex<Option<Option<i32>>>,
    }

    impl BroadcastSink for Recorder {
        fn broadcast(&self, event: ServerEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn ended(&self, exit_code: Option<i32>) {
            *self.ended.lock().unwrap() = Some(exit_code);
        }
    }

    fn launch_shell(root: &std::path::Path) -> SandboxProcess {
        let launcher = SandboxLauncher::new(SandboxConfig {
            wrapper: WrapperKind::None,
            workspace_root: root.to_path_buf(),
            shell: PathBuf::from("/bin/sh"),
            limits: ResourceLimits {
                memory_mb: 512,
                ..ResourceLimits::default()
            },
            ..SandboxConfig::default()
        });
        launcher
            .launch(LaunchKind::Shell, &launcher.config().limits)
            .unwrap()
    }

    async fn wait_for<F: Fn(&Recorder) -> bool>(recorder: &Recorder, check: F) {
        for _ in 0..100 {
            if check(recorder) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached");
    }

    fn text_of(recorder: &Recorder, stderr: bool) -> String {
        recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ShellOutput { content } if !stderr => Some(content.as_str()),
                ServerEvent::ShellError { content } if stderr => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn pumps_stdout_and_stderr_separately() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let session = Session::start(
            "r1",
            launch_shell(root.path()),
            false,
            &SessionConfig::default(),
            recorder.clone(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.write_command("echo out").await.unwrap();
        session.write_command("echo err >&2").await.unwrap();
        wait_for(&recorder, |r| text_of(r, false) == "out\n" && text_of(r, true) == "err\n").await;

        session.terminate().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.write_command("echo late").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn closed_output_is_not_termination() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            idle_backoff: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let session = Session::start("r1", launch_shell(root.path()), false, &config, recorder.clone())
            .unwrap();

        // the shell closes both output pipes but keeps running
        session.write_command("exec >/dev/null 2>&1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(recorder.ended.lock().unwrap().is_none());

        session.write_command("exit 3").await.unwrap();
        wait_for(&recorder, |r| r.ended.lock().unwrap().is_some()).await;
        assert_eq!(*recorder.ended.lock().unwrap(), Some(Some(3)));
        session.terminate().await;
    }

    #[tokio::test]
    async fn exit_is_seen_while_a_background_job_holds_the_pipes() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            idle_backoff: Duration::from_millis(20),
            ..SessionConfig::default()
        };
        let session = Session::start("r1", launch_shell(root.path()), false, &config, recorder.clone())
            .unwrap();

        session.write_command("echo before").await.unwrap();
        session.write_command("sleep 20 &").await.unwrap();
        session.write_command("exit 5").await.unwrap();
        wait_for(&recorder, |r| r.ended.lock().unwrap().is_some()).await;
        assert_eq!(*recorder.ended.lock().unwrap(), Some(Some(5)));
        assert_eq!(text_of(&recorder, false), "before\n");

        // the orphaned job goes with the process group
        session.terminate().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_removes_workdir() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let session = Session::start(
            "r1",
            launch_shell(root.path()),
            false,
            &SessionConfig::default(),
            recorder.clone(),
        )
        .unwrap();
        session.write_command("sleep 60 &").await.unwrap();

        tokio::join!(session.terminate(), session.terminate());
        session.terminate().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        // termination we asked for is not reported as a crash
        assert!(recorder.ended.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn stubborn_shell_is_killed() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            exit_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let session = Session::start("r1", launch_shell(root.path()), false, &config, recorder)
            .unwrap();
        // keeps the shell busy so it never reads `exit`
        session.write_command("trap '' TERM; sleep 30").await.unwrap();

        let started = Instant::now();
        session.terminate().await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
