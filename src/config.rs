//! Server configuration from flags and `ROOMSANDBOX_*` environment variables.

use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::sandbox::{ResourceLimits, SandboxConfig, WrapperKind};
use crate::session::SessionConfig;
use crate::signed_url::SignedUrlConfig;

#[derive(Args, Debug, Clone)]
pub struct SecretArgs {
    /// HMAC secret shared by tickets and signed URLs
    #[arg(long, env = "ROOMSANDBOX_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Lifetime of a WebSocket ticket in seconds
    #[arg(long, env = "ROOMSANDBOX_TICKET_TTL_SECS", default_value = "30")]
    pub ticket_ttl_secs: u64,
}

impl SecretArgs {
    pub fn ticket_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_ttl_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Directory that holds per-process working directories
    #[arg(long, env = "ROOMSANDBOX_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Process isolation wrapper: nsjail, bwrap or none
    #[arg(long, env = "ROOMSANDBOX_WRAPPER", default_value = "nsjail")]
    pub wrapper: WrapperKind,

    /// Wrapper binary, looked up on PATH when omitted
    #[arg(long, env = "ROOMSANDBOX_WRAPPER_PATH")]
    pub wrapper_path: Option<PathBuf>,

    /// Memory ceiling in MB
    #[arg(long, env = "ROOMSANDBOX_MEMORY_MB", default_value = "128")]
    pub memory_mb: u64,

    /// CPUs available to a sandboxed process
    #[arg(long, env = "ROOMSANDBOX_CPUS", default_value = "1")]
    pub cpus: u32,

    /// Open file limit
    #[arg(long, env = "ROOMSANDBOX_NOFILE", default_value = "64")]
    pub nofile: u64,

    /// Wall-clock limit for one-shot runs in seconds
    #[arg(long, env = "ROOMSANDBOX_EXEC_TIMEOUT_SECS", default_value = "5")]
    pub exec_timeout_secs: u64,

    /// Language name accepted by the one-shot endpoint
    #[arg(long, env = "ROOMSANDBOX_LANGUAGE", default_value = "python")]
    pub language: String,

    /// Interpreter for the one-shot language
    #[arg(long, env = "ROOMSANDBOX_INTERPRETER", default_value = "python3")]
    pub interpreter: PathBuf,

    /// File name the submitted code is written to
    #[arg(long, env = "ROOMSANDBOX_SOURCE_FILE", default_value = "main.py")]
    pub source_file: String,

    /// Shell started for interactive rooms
    #[arg(long, env = "ROOMSANDBOX_SHELL", default_value = "/bin/sh")]
    pub shell: PathBuf,
}

impl SandboxArgs {
    pub fn sandbox_config(&self) -> SandboxConfig {
        let defaults = SandboxConfig::default();
        SandboxConfig {
            wrapper: self.wrapper,
            wrapper_path: self.wrapper_path.clone(),
            workspace_root: self
                .workspace_root
                .clone()
                .unwrap_or(defaults.workspace_root),
            limits: ResourceLimits {
                memory_mb: self.memory_mb,
                cpus: self.cpus,
                nofile: self.nofile,
                network: false,
            },
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            language: self.language.clone(),
            interpreter: self.interpreter.clone(),
            source_file: self.source_file.clone(),
            shell: self.shell.clone(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(long, env = "ROOMSANDBOX_PORT", default_value = "8080")]
    pub port: u16,

    #[command(flatten)]
    pub secret: SecretArgs,

    #[command(flatten)]
    pub sandbox: SandboxArgs,

    #[command(flatten)]
    pub urls: UrlArgs,

    /// Replay history kept per room, in bytes
    #[arg(long, env = "ROOMSANDBOX_HISTORY_BYTES", default_value = "1048576")]
    pub history_bytes: usize,

    /// Poll interval while waiting for a silent process to exit, in ms
    #[arg(long, env = "ROOMSANDBOX_IDLE_BACKOFF_MS", default_value = "50")]
    pub idle_backoff_ms: u64,

    /// Grace period for a shell to exit before it is killed, in ms
    #[arg(long, env = "ROOMSANDBOX_EXIT_TIMEOUT_MS", default_value = "2000")]
    pub exit_timeout_ms: u64,

    /// Outbound events queued per connection before it is dropped
    #[arg(long, env = "ROOMSANDBOX_CONNECTION_BUFFER", default_value = "1024")]
    pub connection_buffer: usize,
}

impl ServerArgs {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            history_limit: self.history_bytes,
            idle_backoff: Duration::from_millis(self.idle_backoff_ms),
            exit_timeout: Duration::from_millis(self.exit_timeout_ms),
            connection_buffer: self.connection_buffer.max(1),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct UrlArgs {
    /// Directory served through signed download URLs
    #[arg(long, env = "ROOMSANDBOX_FILES_DIR", default_value = "./artifacts")]
    pub files_dir: PathBuf,

    /// Public base URL used when building signed links
    #[arg(long, env = "ROOMSANDBOX_BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Default lifetime of a signed URL in seconds
    #[arg(long, env = "ROOMSANDBOX_URL_EXPIRY_SECS", default_value = "3600")]
    pub url_expiry_secs: u64,

    /// Upper bound on a requested URL lifetime in seconds
    #[arg(long, env = "ROOMSANDBOX_URL_MAX_EXPIRY_SECS", default_value = "86400")]
    pub url_max_expiry_secs: u64,

    /// Requests allowed per client within one rate window
    #[arg(long, env = "ROOMSANDBOX_RATE_LIMIT", default_value = "60")]
    pub rate_limit: u32,

    /// Rate window in seconds
    #[arg(long, env = "ROOMSANDBOX_RATE_WINDOW_SECS", default_value = "60")]
    pub rate_window_secs: u64,
}

impl UrlArgs {
    pub fn signed_url_config(&self) -> SignedUrlConfig {
        SignedUrlConfig {
            files_dir: self.files_dir.clone(),
            base_url: self.base_url.clone(),
            default_expiry: Duration::from_secs(self.url_expiry_secs),
            max_expiry: Duration::from_secs(self.url_max_expiry_secs),
            rate_limit: self.rate_limit,
            rate_window: Duration::from_secs(self.rate_window_secs),
        }
    }
}
