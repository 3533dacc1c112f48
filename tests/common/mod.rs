#![allow(dead_code)]

use roomsandbox::client::{ClientConfig, IssuerTickets, SessionClient};
use roomsandbox::http_server;
use roomsandbox::sandbox::{ResourceLimits, SandboxConfig, WrapperKind};
use roomsandbox::session::SessionConfig;
use roomsandbox::signed_url::SignedUrlConfig;
use roomsandbox::state::AppState;
use roomsandbox::ticket::{Scope, DEFAULT_TICKET_TTL};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const SECRET: &str = "integration-secret";

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub workspace: PathBuf,
    pub files: PathBuf,
    _dirs: TempDir,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::start_on(listener).await
    }

    pub async fn start_on(listener: TcpListener) -> Self {
        let addr = listener.local_addr().unwrap();
        let dirs = tempfile::tempdir().unwrap();
        let workspace = dirs.path().join("workspace");
        let files = dirs.path().join("files");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(&files).unwrap();

        let sandbox = SandboxConfig {
            wrapper: WrapperKind::None,
            workspace_root: workspace.clone(),
            limits: ResourceLimits {
                memory_mb: 512,
                ..ResourceLimits::default()
            },
            exec_timeout: Duration::from_secs(2),
            language: "sh".to_string(),
            interpreter: PathBuf::from("/bin/sh"),
            source_file: "main.sh".to_string(),
            shell: PathBuf::from("/bin/sh"),
            ..SandboxConfig::default()
        };
        let urls = SignedUrlConfig {
            files_dir: files.clone(),
            base_url: format!("http://{addr}"),
            default_expiry: Duration::from_secs(60),
            max_expiry: Duration::from_secs(3600),
            rate_limit: 1000,
            rate_window: Duration::from_secs(60),
        };
        let state = AppState::new(
            SECRET,
            DEFAULT_TICKET_TTL,
            sandbox,
            SessionConfig::default(),
            urls,
        );
        tokio::spawn(http_server::serve(listener, state.clone()));

        Self {
            addr,
            state,
            workspace,
            files,
            _dirs: dirs,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ticket(&self, room: &str) -> String {
        self.state.tickets.mint("tester", room, None)
    }

    pub fn elevated_ticket(&self, room: &str) -> String {
        self.state
            .tickets
            .mint("tester", room, Some(&[Scope::Observe, Scope::Elevated]))
    }

    pub fn client(&self) -> SessionClient<IssuerTickets> {
        client_for(self.addr, &[Scope::Observe])
    }

    pub fn workspace_entries(&self) -> usize {
        std::fs::read_dir(&self.workspace).map(|d| d.count()).unwrap_or(0)
    }

    /// Poll until the registry has no rooms and the workspace is empty.
    pub async fn wait_until_idle(&self) {
        for _ in 0..100 {
            if self.state.rooms.rooms().is_empty() && self.workspace_entries() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "server never went idle: {} rooms, {} workspace entries",
            self.state.rooms.rooms().len(),
            self.workspace_entries()
        );
    }
}

pub fn client_for(addr: SocketAddr, scopes: &[Scope]) -> SessionClient<IssuerTickets> {
    let mut config = ClientConfig::new(format!("ws://{addr}/ws"), format!("http://{addr}"));
    config.read_timeout = Duration::from_secs(5);
    config.settle = Duration::from_millis(400);
    config.backoff_unit = Duration::from_millis(50);
    config.backoff_max = Duration::from_millis(500);
    config.elevated = scopes.contains(&Scope::Elevated);
    let issuer = Arc::new(roomsandbox::ticket::TicketIssuer::new(SECRET, DEFAULT_TICKET_TTL));
    SessionClient::new(config, IssuerTickets::new(issuer, "tester").with_scopes(scopes.to_vec()))
}

pub fn commands(list: &[&str]) -> Vec<String> {
    list.iter().map(|c| c.to_string()).collect()
}
