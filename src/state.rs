//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::registry::RoomRegistry;
use crate::sandbox::{SandboxConfig, SandboxLauncher};
use crate::session::SessionConfig;
use crate::signed_url::{SignedUrlConfig, SignedUrlService};
use crate::ticket::TicketIssuer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub tickets: Arc<TicketIssuer>,
    pub urls: Arc<SignedUrlService>,
    pub launcher: Arc<SandboxLauncher>,
    pub rooms: RoomRegistry,
}

impl AppState {
    pub fn new(
        secret: &str,
        ticket_ttl: Duration,
        sandbox: SandboxConfig,
        session: SessionConfig,
        urls: SignedUrlConfig,
    ) -> Self {
        let launcher = Arc::new(SandboxLauncher::new(sandbox));
        Self {
            tickets: Arc::new(TicketIssuer::new(secret, ticket_ttl)),
            urls: Arc::new(SignedUrlService::new(secret, urls)),
            rooms: RoomRegistry::new(launcher.clone(), session),
            launcher,
        }
    }
}
