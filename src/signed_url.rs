//! HMAC-signed, time-boxed download grants for session artifacts.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::ticket::unix_now;

type HmacSha256 = Hmac<Sha256>;

const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignedUrlError {
    #[error("invalid file name")]
    InvalidName,
    #[error("file not found")]
    NotFound,
    #[error("link expired")]
    Expired,
    #[error("invalid signature")]
    BadSignature,
    #[error("too many requests")]
    RateLimited,
    #[error("invalid base url: {0}")]
    BaseUrl(String),
}

#[derive(Debug, Clone)]
pub struct SignedUrlConfig {
    pub files_dir: PathBuf,
    pub base_url: String,
    pub default_expiry: Duration,
    pub max_expiry: Duration,
    pub rate_limit: u32,
    pub rate_window: Duration,
}

/// Accept only `[A-Za-z0-9._-]` names with no traversal sequences.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && !name.contains("..")
        && !name.starts_with('.')
}

/// Fixed-window request counter keyed by client.
pub struct RateLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, client: &str) -> Result<(), SignedUrlError> {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        if hits.len() > 4096 {
            hits.retain(|_, (start, _)| now.duration_since(*start) < self.window);
        }
        let entry = hits.entry(client.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max {
            return Err(SignedUrlError::RateLimited);
        }
        entry.1 += 1;
        Ok(())
    }
}

/// Issues and checks signed download URLs.
pub struct SignedUrlService {
    secret: Vec<u8>,
    config: SignedUrlConfig,
    limiter: RateLimiter,
}

impl SignedUrlService {
    pub fn new(secret: impl AsRef<[u8]>, config: SignedUrlConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        Self {
            secret: secret.as_ref().to_vec(),
            config,
            limiter,
        }
    }

    pub fn config(&self) -> &SignedUrlConfig {
        &self.config
    }

    /// Build a download URL for `name` in the artifact directory.
    ///
    /// The expiry is `now + min(requested, max_expiry)`.
    pub fn generate(
        &self,
        name: &str,
        client_ip: Option<&str>,
        custom_expiry: Option<Duration>,
    ) -> Result<String, SignedUrlError> {
        if let Some(ip) = client_ip {
            self.limiter.check(ip)?;
        }
        if !is_valid_filename(name) {
            return Err(SignedUrlError::InvalidName);
        }
        if !self.config.files_dir.join(name).is_file() {
            return Err(SignedUrlError::NotFound);
        }

        let ttl = custom_expiry
            .unwrap_or(self.config.default_expiry)
            .min(self.config.max_expiry);
        let expires = unix_now() + ttl.as_secs();
        let signature = self.signature(name, expires);

        let mut base = self.config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let mut url = Url::parse(&base)
            .and_then(|base| base.join("files/download"))
            .map_err(|e| SignedUrlError::BaseUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("file_id", name)
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        debug!(file = name, expires, "signed download url");
        Ok(url.into())
    }

    pub fn validate(&self, name: &str, signature: &str, expires: u64) -> bool {
        self.check_at(name, signature, expires, unix_now()).is_ok()
    }

    /// Signature and expiry are judged independently; both must pass.
    pub fn check_at(
        &self,
        name: &str,
        signature: &str,
        expires: u64,
        now: u64,
    ) -> Result<(), SignedUrlError> {
        if !is_valid_filename(name) {
            return Err(SignedUrlError::InvalidName);
        }
        let signature_ok = match hex::decode(signature) {
            Ok(sig) => {
                let mut mac = self.mac();
                mac.update(signed_message(name, expires).as_bytes());
                mac.verify_slice(&sig).is_ok()
            }
            Err(_) => false,
        };
        let fresh = expires > now;
        if !signature_ok {
            return Err(SignedUrlError::BadSignature);
        }
        if !fresh {
            return Err(SignedUrlError::Expired);
        }
        Ok(())
    }

    /// Full check for a download request, returning the file to stream.
    pub fn authorize_download(
        &self,
        client: &str,
        name: &str,
        signature: &str,
        expires: u64,
    ) -> Result<PathBuf, SignedUrlError> {
        self.limiter.check(client)?;
        self.check_at(name, signature, expires, unix_now())?;
        let path = self.config.files_dir.join(name);
        if !path.is_file() || !is_inside(&self.config.files_dir, &path) {
            warn!(file = name, "download for missing artifact");
            return Err(SignedUrlError::NotFound);
        }
        Ok(path)
    }

    fn signature(&self, name: &str, expires: u64) -> String {
        let mut mac = self.mac();
        mac.update(signed_message(name, expires).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn mac(&self) -> HmacSha256 {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("hmac key length is unrestricted"),
        }
    }
}

// ':' can never appear in a valid name, so the split point is unambiguous
fn signed_message(name: &str, expires: u64) -> String {
    format!("{name}:{expires}")
}

fn is_inside(root: &Path, path: &Path) -> bool {
    match (root.canonicalize(), path.canonicalize()) {
        (Ok(root), Ok(path)) => path.starts_with(root),
        _ => false,
    }
}
