mod common;

use common::{client_for, commands, TestServer};
use futures_util::{SinkExt, StreamExt};
use roomsandbox::client::{ClientError, SessionClient, StaticTicket};
use roomsandbox::protocol::ServerEvent;
use roomsandbox::ticket::Scope;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn raw_socket(server: &TestServer, room: &str) -> Socket {
    let url = format!("{}/{room}?ticket={}", server.ws_url(), server.ticket(room));
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    let first = socket.next().await.unwrap().unwrap();
    assert_eq!(first, Message::Text(format!("SESSION_ID:{room}")));
    socket
}

async fn next_event(socket: &mut Socket) -> ServerEvent {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("no frame within 5s")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerEvent::decode(&text).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, json: &str) {
    socket.send(Message::Text(json.to_string())).await.unwrap();
}

fn rejection_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(response) => response.status().as_u16(),
        other => panic!("expected an http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_is_acknowledged_and_output_streamed() {
    let server = TestServer::start().await;
    let client = server.client();

    let mut seen = Vec::new();
    let output = client
        .run_with(&commands(&["echo hello", "pwd"]), None, |event| {
            seen.push(event.clone())
        })
        .await
        .unwrap();

    assert_eq!(output.completed(), vec!["echo hello", "pwd"]);
    let stdout = output.stdout();
    assert!(stdout.starts_with("hello\n"), "stdout: {stdout:?}");
    assert!(stdout.contains("room-"), "pwd should print the room workdir: {stdout:?}");
    assert!(!output.ended);
    assert_eq!(seen, output.events);
    assert_eq!(client.room().await.as_deref(), Some(output.room.as_str()));

    client.close().await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn shell_state_survives_between_batches() {
    let server = TestServer::start().await;
    let client = server.client();

    client
        .run(&commands(&["export GREETING=hi"]), Some("stateful"))
        .await
        .unwrap();
    let output = client
        .run(&commands(&["echo $GREETING"]), Some("stateful"))
        .await
        .unwrap();
    assert!(output.stdout().ends_with("hi\n"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn late_joiner_sees_history_then_live_output() {
    let server = TestServer::start().await;
    let first = server.client();
    first
        .run(&commands(&["echo first"]), Some("shared"))
        .await
        .unwrap();

    let second = server.client();
    let replayed = second.run(&[], Some("shared")).await.unwrap();
    assert_eq!(replayed.stdout(), "first\n");

    // one process serves both clients
    assert_eq!(server.state.rooms.connection_count("shared"), 2);
    let rooms = server.state.rooms.rooms();
    assert_eq!(rooms.len(), 1);
    assert_eq!(rooms[0].connections, 2);

    second.run(&commands(&["echo second"]), None).await.unwrap();
    let seen_by_first = first.run(&[], None).await.unwrap();
    assert!(seen_by_first.stdout().contains("second\n"));

    // leaving with one client still attached keeps the room alive
    first.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.state.rooms.connection_count("shared"), 1);
    assert_eq!(server.workspace_entries(), 1);

    second.close().await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn slow_output_arrives_after_the_batch_settles() {
    let server = TestServer::start().await;
    let client = server.client();

    let output = client
        .run(&commands(&["sleep 1; echo done"]), Some("slow"))
        .await
        .unwrap();
    assert_eq!(output.completed(), vec!["sleep 1; echo done"]);
    assert!(!output.stdout().contains("done"));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let later = client.run(&[], None).await.unwrap();
    assert!(later.stdout().contains("done\n"), "{:?}", later.stdout());

    client.close().await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn rooms_are_isolated() {
    let server = TestServer::start().await;
    let alpha = server.client();
    let beta = server.client();

    alpha.run(&commands(&["echo alpha"]), Some("a")).await.unwrap();
    beta.run(&commands(&["echo beta"]), Some("b")).await.unwrap();

    let from_alpha = alpha.run(&[], None).await.unwrap();
    let from_beta = beta.run(&[], None).await.unwrap();
    assert!(!from_alpha.stdout().contains("beta"));
    assert!(!from_beta.stdout().contains("alpha"));
    assert_eq!(server.workspace_entries(), 2);

    alpha.close().await.unwrap();
    beta.close().await.unwrap();
    server.wait_until_idle().await;
}

#[tokio::test]
async fn protocol_errors_only_reach_the_sender() {
    let server = TestServer::start().await;
    let mut noisy = raw_socket(&server, "proto").await;
    let mut quiet = raw_socket(&server, "proto").await;

    send(&mut noisy, r#"{"action":"ping"}"#).await;
    assert_eq!(next_event(&mut noisy).await, ServerEvent::Pong);

    send(&mut noisy, r#"{"action":"explode"}"#).await;
    match next_event(&mut noisy).await {
        ServerEvent::Error { message } => assert!(message.contains("unknown action"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    send(&mut noisy, "not json").await;
    assert!(matches!(next_event(&mut noisy).await, ServerEvent::Error { .. }));
    noisy.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(matches!(next_event(&mut noisy).await, ServerEvent::Error { .. }));

    // the session keeps working for everyone
    send(&mut noisy, r#"{"action":"shell_command","command":"echo ok"}"#).await;
    let mut acked = false;
    let mut printed = false;
    while !(acked && printed) {
        match next_event(&mut noisy).await {
            ServerEvent::CommandComplete { command } => {
                assert_eq!(command, "echo ok");
                acked = true;
            }
            ServerEvent::ShellOutput { content } => {
                assert_eq!(content, "ok\n");
                printed = true;
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    // the other member gets the output but none of the errors or acks
    assert_eq!(
        next_event(&mut quiet).await,
        ServerEvent::ShellOutput {
            content: "ok\n".to_string()
        }
    );

    send(&mut noisy, r#"{"action":"disconnect"}"#).await;
    send(&mut quiet, r#"{"action":"disconnect"}"#).await;
    server.wait_until_idle().await;
}

#[tokio::test]
async fn invalid_tickets_are_rejected_before_upgrade() {
    let server = TestServer::start().await;

    let url = format!("{}/r1?ticket=garbage", server.ws_url());
    let err = connect_async(url.as_str()).await.unwrap_err();
    assert_eq!(rejection_status(err), 401);

    let url = format!("{}/r1", server.ws_url());
    let err = connect_async(url.as_str()).await.unwrap_err();
    assert_eq!(rejection_status(err), 401);

    let url = format!("{}/r1?ticket={}", server.ws_url(), server.ticket("r2"));
    let err = connect_async(url.as_str()).await.unwrap_err();
    assert_eq!(rejection_status(err), 403);

    let url = format!("{}/r1?ticket={}&elevated=true", server.ws_url(), server.ticket("r1"));
    let err = connect_async(url.as_str()).await.unwrap_err();
    assert_eq!(rejection_status(err), 403);

    // capability errors are surfaced, never retried
    let mut config = roomsandbox::client::ClientConfig::new(server.ws_url(), server.http_url());
    config.backoff_unit = Duration::from_millis(10);
    let client = SessionClient::new(config, StaticTicket("garbage".to_string()));
    let result = client.run(&commands(&["echo hi"]), Some("r1")).await;
    assert!(matches!(result, Err(ClientError::Rejected(401))));

    assert!(server.state.rooms.rooms().is_empty());
    assert_eq!(server.workspace_entries(), 0);
}

#[tokio::test]
async fn room_defaults_to_the_ticket_claim() {
    let server = TestServer::start().await;
    let url = format!("{}?ticket={}", server.ws_url(), server.ticket("from-claim"));
    let (mut socket, _) = connect_async(url.as_str()).await.unwrap();
    let first = socket.next().await.unwrap().unwrap();
    assert_eq!(first, Message::Text("SESSION_ID:from-claim".to_string()));
    assert!(server.state.rooms.room("from-claim").is_some());
    send(&mut socket, r#"{"action":"disconnect"}"#).await;
    server.wait_until_idle().await;
}

#[tokio::test]
async fn elevated_scope_admits_elevated_room() {
    let server = TestServer::start().await;
    let client = client_for(server.addr, &[Scope::Observe, Scope::Elevated]);
    let output = client.run(&commands(&["echo up"]), Some("net")).await.unwrap();
    assert_eq!(output.stdout(), "up\n");
    assert!(server.state.rooms.room("net").unwrap().elevated);
    client.close().await.unwrap();
}

#[tokio::test]
async fn process_exit_ends_the_room_for_everyone() {
    let server = TestServer::start().await;
    let mut watcher = raw_socket(&server, "doomed").await;
    let client = server.client();

    let output = client.run(&commands(&["exit 7"]), Some("doomed")).await.unwrap();
    assert!(output.ended);
    assert_eq!(output.exit_code, Some(7));

    loop {
        if let ServerEvent::SessionEnded { exit_code } = next_event(&mut watcher).await {
            assert_eq!(exit_code, Some(7));
            break;
        }
    }
    server.wait_until_idle().await;
}

#[tokio::test]
async fn deleting_a_room_notifies_members() {
    let server = TestServer::start().await;
    let mut member = raw_socket(&server, "admin").await;

    let http = reqwest::Client::new();
    let listed: serde_json::Value = http
        .get(format!("{}/rooms", server.http_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["room"], "admin");
    assert_eq!(listed[0]["connections"], 1);

    let denied = http
        .delete(format!("{}/rooms/admin", server.http_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    // observers cannot end a shared room
    let observer = http
        .delete(format!(
            "{}/rooms/admin?ticket={}",
            server.http_url(),
            server.ticket("admin")
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(observer.status(), 403);
    assert!(server.state.rooms.room("admin").is_some());

    let deleted = http
        .delete(format!(
            "{}/rooms/admin?ticket={}",
            server.http_url(),
            server.elevated_ticket("admin")
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);
    assert_eq!(
        next_event(&mut member).await,
        ServerEvent::SessionEnded { exit_code: None }
    );

    let missing = http
        .get(format!("{}/rooms/admin", server.http_url()))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    server.wait_until_idle().await;
}

#[tokio::test]
async fn client_waits_for_server_with_backoff() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = client_for(addr, &[Scope::Observe]);
    let run = tokio::spawn(async move {
        let output = client.run(&commands(&["echo late"]), Some("late")).await;
        client.close().await.unwrap();
        output
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    let server = TestServer::start_on(listener).await;

    let output = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(output.stdout(), "late\n");
    server.wait_until_idle().await;
}

#[tokio::test]
async fn dropped_socket_releases_the_room() {
    let server = TestServer::start().await;
    let socket = raw_socket(&server, "dropped").await;
    assert_eq!(server.workspace_entries(), 1);
    drop(socket);
    server.wait_until_idle().await;
}
