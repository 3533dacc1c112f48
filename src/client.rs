//! Client for driving a room over WebSocket.
//!
//! `SessionClient::run` sends a batch of commands to a room and collects what
//! the room prints back. A lost connection is retried with exponential
//! backoff (1, 2, 4, ... units, capped at 30 units) until it succeeds or the
//! caller cancels; on reconnect the room's history is replayed and any
//! commands the server never acknowledged are sent again.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::protocol::{parse_handshake, CommandMessage, ServerEvent};
use crate::sandbox::RunOutcome;
use crate::ticket::{Scope, TicketIssuer};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[source] tungstenite::Error),
    #[error("connection rejected with status {0}")]
    Rejected(u16),
    #[error("invalid handshake: {0}")]
    Handshake(String),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("no response from server")]
    Timeout,
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("could not obtain a ticket: {0}")]
    Ticket(String),
    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Transport failures are retried; everything else is surfaced.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::Handshake(_) | Self::ConnectionClosed | Self::Timeout
        )
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) if response.status().is_client_error() => {
                Self::Rejected(response.status().as_u16())
            }
            other => Self::WebSocket(other),
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    unit: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(unit: Duration, max: Duration) -> Self {
        Self {
            unit,
            max,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.unit.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Where the client gets a ticket for each connection attempt. Tickets are
/// short-lived, so one is fetched per attempt.
pub trait TicketSource: Send + Sync {
    fn ticket(&self, room: &str) -> impl Future<Output = Result<String, ClientError>> + Send;
}

/// Mints tickets in-process. For trusted server-side tooling.
pub struct IssuerTickets {
    issuer: Arc<TicketIssuer>,
    subject: String,
    scopes: Vec<Scope>,
}

impl IssuerTickets {
    pub fn new(issuer: Arc<TicketIssuer>, subject: impl Into<String>) -> Self {
        Self {
            issuer,
            subject: subject.into(),
            scopes: vec![Scope::Observe],
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<Scope>) -> Self {
        self.scopes = scopes;
        self
    }
}

impl TicketSource for IssuerTickets {
    fn ticket(&self, room: &str) -> impl Future<Output = Result<String, ClientError>> + Send {
        let token = self.issuer.mint(&self.subject, room, Some(&self.scopes));
        std::future::ready(Ok(token))
    }
}

/// A ticket handed over by someone else. Useless once it expires.
pub struct StaticTicket(pub String);

impl TicketSource for StaticTicket {
    fn ticket(&self, _room: &str) -> impl Future<Output = Result<String, ClientError>> + Send {
        std::future::ready(Ok(self.0.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://host:8080/ws`. The room is appended.
    pub ws_url: String,
    /// HTTP base for `/execute` and downloads.
    pub http_url: String,
    /// Per-read timeout while commands are unacknowledged.
    pub read_timeout: Duration,
    /// Quiet period after the last acknowledgement before a batch is done.
    /// An acknowledgement means the command reached the shell, not that it
    /// finished, so output from commands slower than this lands in the next
    /// `run` on the same connection.
    pub settle: Duration,
    pub backoff_unit: Duration,
    pub backoff_max: Duration,
    pub elevated: bool,
}

impl ClientConfig {
    pub fn new(ws_url: impl Into<String>, http_url: impl Into<String>) -> Self {
        let backoff_unit = Duration::from_secs(1);
        Self {
            ws_url: ws_url.into(),
            http_url: http_url.into(),
            read_timeout: Duration::from_secs(10),
            settle: Duration::from_millis(300),
            backoff_unit,
            backoff_max: backoff_unit * 30,
            elevated: false,
        }
    }
}

/// Everything a batch produced on the last connection it ran on.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub room: String,
    pub events: Vec<ServerEvent>,
    /// The room's process ended while the batch ran.
    pub ended: bool,
    pub exit_code: Option<i32>,
}

impl RunOutput {
    pub fn stdout(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ShellOutput { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn stderr(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::ShellError { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn completed(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::CommandComplete { command } => Some(command.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Default)]
struct Connection {
    room: Option<String>,
    stream: Option<WsStream>,
}

enum Finish {
    Settled,
    Ended(Option<i32>),
}

struct Batch {
    unacked: VecDeque<String>,
    events: Vec<ServerEvent>,
}

pub struct SessionClient<T> {
    config: ClientConfig,
    tickets: T,
    http: reqwest::Client,
    cancel: CancellationToken,
    // held for a whole batch so two runs never interleave
    conn: tokio::sync::Mutex<Connection>,
}

impl<T: TicketSource> SessionClient<T> {
    pub fn new(config: ClientConfig, tickets: T) -> Self {
        Self {
            config,
            tickets,
            http: reqwest::Client::new(),
            cancel: CancellationToken::new(),
            conn: tokio::sync::Mutex::new(Connection::default()),
        }
    }

    /// Cancelling this token stops any run, including its reconnect loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Room of the current or last connection.
    pub async fn room(&self) -> Option<String> {
        self.conn.lock().await.room.clone()
    }

    /// Send `commands` to `room` (or the current room) and collect events
    /// until every command is acknowledged and the room stays quiet for
    /// [`ClientConfig::settle`]. Commands still running at that point keep
    /// producing output on the connection; `run(&[], None)` picks it up.
    pub async fn run(&self, commands: &[String], room: Option<&str>) -> Result<RunOutput, ClientError> {
        self.run_with(commands, room, |_| {}).await
    }

    /// Like `run`, forwarding every event to `on_event` as it arrives.
    /// After a reconnect the replayed history is forwarded again and the
    /// returned output only holds what the final connection saw.
    pub async fn run_with<F>(
        &self,
        commands: &[String],
        room: Option<&str>,
        mut on_event: F,
    ) -> Result<RunOutput, ClientError>
    where
        F: FnMut(&ServerEvent) + Send,
    {
        let mut conn = self.conn.lock().await;
        if let Some(room) = room {
            if conn.room.as_deref() != Some(room) {
                conn.room = Some(room.to_string());
                conn.stream = None;
            }
        }
        let mut batch = Batch {
            unacked: commands.iter().cloned().collect(),
            events: Vec::new(),
        };
        let mut backoff = Backoff::new(self.config.backoff_unit, self.config.backoff_max);

        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            if conn.stream.is_none() {
                let room = conn
                    .room
                    .get_or_insert_with(|| Uuid::new_v4().to_string())
                    .clone();
                match self.connect(&room).await {
                    Ok((stream, confirmed)) => {
                        backoff.reset();
                        // the replay that follows supersedes what we collected
                        batch.events.clear();
                        conn.room = Some(confirmed);
                        conn.stream = Some(stream);
                    }
                    Err(e) if e.is_transport() => {
                        let delay = backoff.next_delay();
                        warn!(room, error = %e, ?delay, "connect failed, retrying");
                        self.wait(delay).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            let Some(stream) = conn.stream.as_mut() else {
                continue;
            };
            let result = self.exchange(stream, &mut batch, &mut on_event).await;
            let room = conn.room.clone().unwrap_or_default();
            match result {
                Ok(Finish::Settled) => {
                    return Ok(RunOutput {
                        room,
                        events: batch.events,
                        ended: false,
                        exit_code: None,
                    })
                }
                Ok(Finish::Ended(exit_code)) => {
                    info!(room, ?exit_code, "room ended");
                    conn.stream = None;
                    conn.room = None;
                    return Ok(RunOutput {
                        room,
                        events: batch.events,
                        ended: true,
                        exit_code,
                    });
                }
                Err(e) if e.is_transport() => {
                    conn.stream = None;
                    let delay = backoff.next_delay();
                    warn!(room, error = %e, ?delay, pending = batch.unacked.len(), "connection lost, reconnecting");
                    self.wait(delay).await?;
                }
                Err(e) => {
                    conn.stream = None;
                    return Err(e);
                }
            }
        }
    }

    /// Open a socket to `room` and read the handshake.
    async fn connect(&self, room: &str) -> Result<(WsStream, String), ClientError> {
        let ticket = self.tickets.ticket(room).await?;
        let mut url = Url::parse(&self.config.ws_url)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Handshake("websocket url cannot carry a room".to_string()))?
            .pop_if_empty()
            .push(room);
        url.query_pairs_mut()
            .append_pair("ticket", &ticket)
            .append_pair("elevated", if self.config.elevated { "true" } else { "false" });

        let connecting = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            res = tokio::time::timeout(self.config.read_timeout, connect_async(url.as_str())) => res,
        };
        let (mut stream, _) = connecting.map_err(|_| ClientError::Timeout)??;

        let first = tokio::time::timeout(self.config.read_timeout, stream.next())
            .await
            .map_err(|_| ClientError::Timeout)?;
        let text = match first {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(other)) => return Err(ClientError::Handshake(format!("unexpected frame {other:?}"))),
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::ConnectionClosed),
        };
        if let Ok(ServerEvent::Error { message }) = ServerEvent::decode(&text) {
            // the server could not attach us; usually a racing shutdown
            return Err(ClientError::Handshake(message));
        }
        let confirmed = parse_handshake(&text)
            .ok_or_else(|| ClientError::Handshake(text.clone()))?
            .to_string();
        if confirmed != room {
            warn!(requested = room, confirmed, "server assigned a different room");
        }
        info!(room = confirmed, "connected");
        Ok((stream, confirmed))
    }

    async fn exchange<F>(
        &self,
        stream: &mut WsStream,
        batch: &mut Batch,
        on_event: &mut F,
    ) -> Result<Finish, ClientError>
    where
        F: FnMut(&ServerEvent) + Send,
    {
        for command in &batch.unacked {
            let msg = CommandMessage::ShellCommand {
                command: command.clone(),
            };
            stream.send(Message::Text(msg.encode())).await?;
        }

        let mut ping_outstanding = false;
        loop {
            let wait = if batch.unacked.is_empty() {
                self.config.settle
            } else {
                self.config.read_timeout
            };
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                next = tokio::time::timeout(wait, stream.next()) => next,
            };
            let frame = match next {
                Err(_) if batch.unacked.is_empty() => return Ok(Finish::Settled),
                Err(_) if ping_outstanding => return Err(ClientError::Timeout),
                Err(_) => {
                    // quiet is not failure; make sure the peer is still there
                    stream.send(Message::Text(CommandMessage::Ping.encode())).await?;
                    ping_outstanding = true;
                    continue;
                }
                Ok(None) => return Err(ClientError::ConnectionClosed),
                Ok(Some(frame)) => frame?,
            };
            ping_outstanding = false;

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => return Err(ClientError::ConnectionClosed),
                _ => continue,
            };
            let event = match ServerEvent::decode(&text) {
                Ok(event) => event,
                Err(e) => {
                    debug!(error = %e, "ignoring undecodable frame");
                    continue;
                }
            };
            match &event {
                ServerEvent::Pong => continue,
                ServerEvent::CommandComplete { command } => {
                    if batch.unacked.front() == Some(command) {
                        batch.unacked.pop_front();
                    }
                }
                ServerEvent::Error { message } => {
                    // the server refused our oldest pending command
                    if let Some(command) = batch.unacked.pop_front() {
                        warn!(command, message, "command rejected");
                    }
                }
                ServerEvent::ShellOutput { .. } | ServerEvent::ShellError { .. } => {}
                ServerEvent::SessionEnded { exit_code } => {
                    let exit_code = *exit_code;
                    on_event(&event);
                    batch.events.push(event);
                    return Ok(Finish::Ended(exit_code));
                }
            }
            on_event(&event);
            batch.events.push(event);
        }
    }

    async fn wait(&self, delay: Duration) -> Result<(), ClientError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Leave the room politely. The room survives if others are attached.
    pub async fn close(&self) -> Result<(), ClientError> {
        let mut conn = self.conn.lock().await;
        if let Some(mut stream) = conn.stream.take() {
            stream
                .send(Message::Text(CommandMessage::Disconnect.encode()))
                .await?;
            let _ = stream.close(None).await;
        }
        Ok(())
    }

    /// Run code once through the server's one-shot endpoint.
    pub async fn execute(
        &self,
        code: &str,
        language: &str,
        user_id: Option<&str>,
    ) -> Result<RunOutcome, ClientError> {
        let url = Url::parse(&self.config.http_url)?.join("execute")?;
        let body = serde_json::json!({
            "code": code,
            "language": language,
            "user_id": user_id,
        });
        let response = self.http.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(server_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Fetch a signed download URL.
    pub async fn download(&self, signed_url: &str) -> Result<Vec<u8>, ClientError> {
        let response = self.http.get(signed_url).send().await?;
        if !response.status().is_success() {
            return Err(server_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }
}

async fn server_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => String::new(),
    };
    ClientError::Server { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let delays: Vec<u64> = (0..8).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(300));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_millis(300));
        }
    }

    #[test]
    fn default_cap_is_thirty_units() {
        let config = ClientConfig::new("ws://localhost/ws", "http://localhost");
        assert_eq!(config.backoff_max, config.backoff_unit * 30);
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ClientError::Timeout.is_transport());
        assert!(ClientError::ConnectionClosed.is_transport());
        assert!(!ClientError::Rejected(401).is_transport());
        assert!(!ClientError::Cancelled.is_transport());
    }

    #[tokio::test]
    async fn unreachable_server_retries_until_cancelled() {
        // grab a free port and leave it closed
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = ClientConfig::new(
            format!("ws://127.0.0.1:{port}/ws"),
            format!("http://127.0.0.1:{port}"),
        );
        config.backoff_unit = Duration::from_millis(10);
        config.backoff_max = Duration::from_millis(50);
        let client = SessionClient::new(config, StaticTicket("t".to_string()));

        let cancel = client.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });
        let result = client.run(&["echo hi".to_string()], Some("r1")).await;
        assert!(matches!(result, Err(ClientError::Cancelled)));
    }
}
