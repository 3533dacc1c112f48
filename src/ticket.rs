//! Short-lived signed WebSocket tickets.
//!
//! A ticket is `base64url(claims_json) "." base64url(hmac_sha256(claims_json))`.
//! Validity is recomputed from the token and the clock on every check.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Purpose marker embedded in every ticket.
pub const TICKET_TYPE: &str = "ws_ticket";

/// Default lifetime of a ticket.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Join a room running the standard locked-down shell.
    Observe,
    /// Create a room whose shell has network access.
    Elevated,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Observe => f.write_str("observe"),
            Self::Elevated => f.write_str("elevated"),
        }
    }
}

impl FromStr for Scope {
    type Err = TicketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observe" => Ok(Self::Observe),
            "elevated" => Ok(Self::Elevated),
            other => Err(TicketError::UnknownScope(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketClaims {
    pub sub: String,
    pub room: String,
    pub scopes: Vec<Scope>,
    #[serde(rename = "type")]
    pub kind: String,
    pub iat: u64,
    pub exp: u64,
}

impl TicketClaims {
    pub fn has_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("malformed ticket")]
    Malformed,
    #[error("invalid ticket signature")]
    BadSignature,
    #[error("ticket is not a websocket ticket")]
    WrongType,
    #[error("ticket expired")]
    Expired,
    #[error("ticket was issued for another room")]
    RoomMismatch,
    #[error("ticket lacks the {0} scope")]
    MissingScope(Scope),
    #[error("unknown scope: {0}")]
    UnknownScope(String),
}

/// Mints and verifies tickets with a server-held secret.
pub struct TicketIssuer {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TicketIssuer {
    pub fn new(secret: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            ttl,
        }
    }

    /// Mint a ticket. `scopes` defaults to observe-only; elevated access must
    /// be asked for explicitly.
    pub fn mint(&self, subject: &str, room: &str, scopes: Option<&[Scope]>) -> String {
        let now = unix_now();
        let claims = TicketClaims {
            sub: subject.to_string(),
            room: room.to_string(),
            scopes: scopes
                .map(<[Scope]>::to_vec)
                .unwrap_or_else(|| vec![Scope::Observe]),
            kind: TICKET_TYPE.to_string(),
            iat: now,
            exp: now + self.ttl.as_secs(),
        };
        self.sign(&claims)
    }

    /// Sign arbitrary claims. Exposed for tooling that needs a custom expiry.
    pub fn sign(&self, claims: &TicketClaims) -> String {
        let payload = serde_json::to_vec(claims).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&payload);
        let sig = mac.finalize().into_bytes();
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(sig)
        )
    }

    /// Admission check for a connection joining `room`.
    pub fn verify(&self, token: &str, room: &str) -> Result<TicketClaims, TicketError> {
        self.verify_at(token, room, unix_now())
    }

    pub fn verify_at(&self, token: &str, room: &str, now: u64) -> Result<TicketClaims, TicketError> {
        let claims = self.decode(token)?;
        if claims.kind != TICKET_TYPE {
            return Err(TicketError::WrongType);
        }
        if claims.exp <= now {
            return Err(TicketError::Expired);
        }
        if claims.room != room {
            return Err(TicketError::RoomMismatch);
        }
        Ok(claims)
    }

    /// Check the signature and return the claims without judging them.
    pub fn decode(&self, token: &str) -> Result<TicketClaims, TicketError> {
        let (payload_b64, sig_b64) = token.split_once('.').ok_or(TicketError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TicketError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TicketError::Malformed)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&sig).map_err(|_| TicketError::BadSignature)?;

        serde_json::from_slice(&payload).map_err(|_| TicketError::Malformed)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac key length is unrestricted"),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
