//! Room registry: the only place that knows which rooms are live.
//!
//! Each room owns at most one [`Session`], the set of attached connections,
//! and the history buffer replayed to late joiners. The room map and each
//! room's membership are guarded by std mutexes that are never held across
//! an await point.
//!
//! A room that is shutting down stays registered, marked closed, until its
//! process is gone. Joins that find it wait for the teardown before they
//! launch a replacement, so a room never has two live processes.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::ServerEvent;
use crate::sandbox::{LaunchKind, SandboxLauncher};
use crate::session::{Session, SessionConfig, SessionError};

/// How many times a join retries when the room it found was torn down
/// before the connection could attach.
const JOIN_ATTEMPTS: usize = 3;

/// Where a session pushes its output.
pub trait BroadcastSink: Send + Sync + 'static {
    fn broadcast(&self, event: ServerEvent);
    /// The process is gone; `exit_code` is `None` when it was killed.
    fn ended(&self, exit_code: Option<i32>);
}

/// A live client attached to a room.
///
/// Events are queued on a bounded channel drained by the connection's own
/// writer task, so delivery to one client never waits on another.
#[derive(Clone)]
pub struct Connection {
    id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            tx,
            closed: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelled when the connection must shut down: its queue overflowed,
    /// its writer failed, or its room ended.
    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Queue an event without waiting. A full queue closes the connection.
    pub fn send(&self, event: ServerEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %self.id, "connection queue full, closing");
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Ordered output history with a byte cap; the oldest fragments go first.
#[derive(Debug)]
pub struct HistoryBuffer {
    events: VecDeque<ServerEvent>,
    bytes: usize,
    limit: usize,
}

impl HistoryBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    pub fn push(&mut self, event: ServerEvent) {
        self.bytes += event.weight();
        self.events.push_back(event);
        while self.bytes > self.limit && self.events.len() > 1 {
            if let Some(old) = self.events.pop_front() {
                self.bytes -= old.weight();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<ServerEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

struct RoomState {
    connections: HashMap<Uuid, Connection>,
    history: HistoryBuffer,
    closed: bool,
}

struct Room {
    name: String,
    session: OnceCell<Arc<Session>>,
    state: Mutex<RoomState>,
    /// Cancelled once the process is gone and the room left the map.
    retired: CancellationToken,
    created_at: Instant,
}

impl Room {
    fn new(name: &str, history_limit: usize) -> Self {
        Self {
            name: name.to_string(),
            session: OnceCell::new(),
            state: Mutex::new(RoomState {
                connections: HashMap::new(),
                history: HistoryBuffer::new(history_limit),
                closed: false,
            }),
            retired: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Append to history and fan out. Returns how many connections took it.
    fn publish(&self, event: ServerEvent) -> usize {
        let targets: Vec<Connection> = {
            let mut state = self.state();
            if state.closed {
                return 0;
            }
            state.history.push(event.clone());
            state.connections.values().cloned().collect()
        };
        targets
            .iter()
            .filter(|conn| conn.send(event.clone()))
            .count()
    }

    /// Mark closed and detach everyone. `None` when the room was already
    /// closed; whoever closed it first owns the teardown.
    fn close(&self) -> Option<Vec<Connection>> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        state.closed = true;
        Some(state.connections.drain().map(|(_, conn)| conn).collect())
    }

    /// Stop the process, then drop the room from the map and wake joiners
    /// waiting to replace it.
    async fn retire(self: &Arc<Self>, registry: &RegistryInner) {
        if let Some(session) = self.session.get() {
            session.terminate().await;
        }
        registry.unregister(self);
        self.retired.cancel();
        debug!(room = %self.name, "room retired");
    }
}

/// Result of a successful join.
pub struct Joined {
    pub session: Arc<Session>,
    /// Everything the room produced so far, oldest first.
    pub replay: Vec<ServerEvent>,
    /// Whether this join launched the room's process.
    pub created: bool,
}

/// Result of removing a connection from a room.
pub enum Departure {
    /// Other connections remain attached.
    Stayed(usize),
    /// That was the last connection; the room's process is stopped and the
    /// room is gone from the registry.
    Last,
    /// The connection was not a member (already left or the room ended).
    Absent,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomInfo {
    pub room: String,
    pub session_id: Option<String>,
    pub pid: Option<u32>,
    pub elevated: bool,
    pub connections: usize,
    pub history_bytes: usize,
    pub age_secs: u64,
}

struct RegistryInner {
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    launcher: Arc<SandboxLauncher>,
    config: SessionConfig,
}

impl RegistryInner {
    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `room` from the map if it is still the registered instance.
    fn unregister(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms();
        if rooms.get(&room.name).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(&room.name);
        }
    }
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    pub fn new(launcher: Arc<SandboxLauncher>, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: Mutex::new(HashMap::new()),
                launcher,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Attach `conn` to `room`, launching the room's shell if none is live.
    ///
    /// Concurrent joins for the same room share one launch. The replayed
    /// history and the live stream meet without gaps or duplicates because
    /// the snapshot and the membership insert happen under the same lock
    /// that output publication takes.
    pub async fn join(
        &self,
        room: &str,
        conn: &Connection,
        elevated: bool,
    ) -> Result<Joined, SessionError> {
        for _ in 0..JOIN_ATTEMPTS {
            let entry = self
                .inner
                .rooms()
                .entry(room.to_string())
                .or_insert_with(|| Arc::new(Room::new(room, self.inner.config.history_limit)))
                .clone();
            if entry.is_closed() {
                debug!(room, "room is shutting down, waiting before relaunch");
                entry.retired.cancelled().await;
                continue;
            }

            let mut launched = false;
            let started = entry
                .session
                .get_or_try_init(|| {
                    launched = true;
                    self.start_session(&entry, elevated)
                })
                .await;
            let session = match started {
                Ok(session) => session.clone(),
                Err(e) => {
                    let abandoned = entry.state().connections.is_empty();
                    if abandoned && entry.close().is_some() {
                        entry.retire(&self.inner).await;
                    }
                    return Err(e);
                }
            };

            let replay = {
                let mut state = entry.state();
                if state.closed {
                    None
                } else {
                    state.connections.insert(conn.id(), conn.clone());
                    Some(state.history.snapshot())
                }
            };
            match replay {
                Some(replay) => {
                    info!(
                        room,
                        conn = %conn.id(),
                        session = %session.id(),
                        replayed = replay.len(),
                        created = launched,
                        "connection joined"
                    );
                    return Ok(Joined {
                        session,
                        replay,
                        created: launched,
                    });
                }
                None => {
                    debug!(room, "room ended while joining, retrying");
                    if launched {
                        session.terminate().await;
                    }
                    entry.retired.cancelled().await;
                }
            }
        }
        Err(SessionError::Ended(room.to_string()))
    }

    /// Detach a connection. Idempotent. The last connection out stops the
    /// room's process before this returns.
    pub async fn leave(&self, room: &str, conn_id: Uuid) -> Departure {
        let Some(entry) = self.inner.rooms().get(room).cloned() else {
            return Departure::Absent;
        };
        {
            let mut state = entry.state();
            if state.connections.remove(&conn_id).is_none() {
                return Departure::Absent;
            }
            info!(room, conn = %conn_id, remaining = state.connections.len(), "connection left");
            if !state.connections.is_empty() {
                return Departure::Stayed(state.connections.len());
            }
            state.closed = true;
        }
        entry.retire(&self.inner).await;
        Departure::Last
    }

    /// Publish an event to every connection in `room`.
    pub fn broadcast(&self, room: &str, event: ServerEvent) -> usize {
        let entry = self.inner.rooms().get(room).cloned();
        entry.map_or(0, |entry| entry.publish(event))
    }

    /// Tear a room down: notify every connection, then stop the process.
    /// `false` when the room is unknown or already shutting down.
    pub async fn terminate(&self, room: &str) -> bool {
        let Some(entry) = self.inner.rooms().get(room).cloned() else {
            return false;
        };
        let Some(connections) = entry.close() else {
            entry.retired.cancelled().await;
            return false;
        };
        for conn in connections {
            conn.send(ServerEvent::SessionEnded { exit_code: None });
            conn.close();
        }
        entry.retire(&self.inner).await;
        info!(room, "room terminated");
        true
    }

    /// Live rooms. Rooms shutting down are left out.
    pub fn rooms(&self) -> Vec<RoomInfo> {
        let rooms: Vec<Arc<Room>> = self
            .inner
            .rooms()
            .values()
            .filter(|r| !r.is_closed())
            .cloned()
            .collect();
        let mut infos: Vec<RoomInfo> = rooms.iter().map(|r| room_info(r)).collect();
        infos.sort_by(|a, b| a.room.cmp(&b.room));
        infos
    }

    pub fn room(&self, room: &str) -> Option<RoomInfo> {
        let entry = self.inner.rooms().get(room).cloned();
        entry.filter(|r| !r.is_closed()).map(|r| room_info(&r))
    }

    pub fn connection_count(&self, room: &str) -> usize {
        let entry = self.inner.rooms().get(room).cloned();
        entry.map_or(0, |r| r.state().connections.len())
    }

    async fn start_session(
        &self,
        room: &Arc<Room>,
        elevated: bool,
    ) -> Result<Arc<Session>, SessionError> {
        let mut limits = self.inner.launcher.config().limits.clone();
        limits.network = elevated;
        let process = self.inner.launcher.launch(LaunchKind::Shell, &limits)?;
        let sink = Arc::new(RoomSink {
            registry: Arc::downgrade(&self.inner),
            room: Arc::downgrade(room),
        });
        Session::start(&room.name, process, elevated, &self.inner.config, sink)
    }
}

fn room_info(room: &Room) -> RoomInfo {
    let (connections, history_bytes) = {
        let state = room.state();
        (state.connections.len(), state.history.bytes())
    };
    let session = room.session.get();
    RoomInfo {
        room: room.name.clone(),
        session_id: session.map(|s| s.id().to_string()),
        pid: session.and_then(|s| s.pid()),
        elevated: session.is_some_and(|s| s.elevated()),
        connections,
        history_bytes,
        age_secs: room.created_at.elapsed().as_secs(),
    }
}

/// Sink handed to a room's session. Holds weak references so a running
/// pump never keeps a dead room alive.
struct RoomSink {
    registry: Weak<RegistryInner>,
    room: Weak<Room>,
}

impl BroadcastSink for RoomSink {
    fn broadcast(&self, event: ServerEvent) {
        if let Some(room) = self.room.upgrade() {
            room.publish(event);
        }
    }

    fn ended(&self, exit_code: Option<i32>) {
        let Some(room) = self.room.upgrade() else {
            return;
        };
        let Some(connections) = room.close() else {
            return;
        };
        info!(room = %room.name, ?exit_code, notified = connections.len(), "room process exited");
        for conn in connections {
            conn.send(ServerEvent::SessionEnded { exit_code });
            conn.close();
        }
        // reaps leftovers of the process group and releases the workdir
        let registry = self.registry.upgrade();
        tokio::spawn(async move {
            match registry {
                Some(registry) => room.retire(&registry).await,
                None => {
                    if let Some(session) = room.session.get() {
                        session.terminate().await;
                    }
                }
            }
        });
    }
}
