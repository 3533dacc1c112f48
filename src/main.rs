//! roomsandbox - sandboxed shell rooms with an HTTP and WebSocket API.
//!
//! Usage:
//!   roomsandbox serve --secret <s> [--port 8080]     # Start the server
//!   roomsandbox run main.py                          # One-shot local run
//!   roomsandbox mint-ticket --secret <s> --room <r>  # Print a ticket
//!   roomsandbox sign-url --secret <s> <file>         # Print a download URL
//!   roomsandbox connect --secret <s> -- 'echo hi'    # Drive a room

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use roomsandbox::client::{ClientConfig, IssuerTickets, SessionClient, StaticTicket, TicketSource};
use roomsandbox::config::{SandboxArgs, SecretArgs, ServerArgs, UrlArgs};
use roomsandbox::http_server;
use roomsandbox::protocol::ServerEvent;
use roomsandbox::sandbox::{RunOutcome, SandboxLauncher};
use roomsandbox::signed_url::SignedUrlService;
use roomsandbox::state::AppState;
use roomsandbox::ticket::{Scope, TicketIssuer};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "roomsandbox")]
#[command(about = "Sandboxed shell rooms with an HTTP and WebSocket API")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServerArgs),

    /// Run a source file once in the sandbox and print the result
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language of the file, defaults to the configured one
        #[arg(long)]
        language: Option<String>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Print a WebSocket ticket for a room
    MintTicket {
        #[command(flatten)]
        secret: SecretArgs,

        /// Room the ticket admits to
        #[arg(long)]
        room: String,

        /// Subject the ticket is issued to
        #[arg(long, default_value = "cli")]
        subject: String,

        /// Comma separated scopes (observe, elevated)
        #[arg(long, value_delimiter = ',')]
        scopes: Vec<Scope>,
    },

    /// Print a signed download URL for an artifact
    SignUrl {
        #[arg(long, env = "ROOMSANDBOX_SECRET", hide_env_values = true)]
        secret: String,

        #[command(flatten)]
        urls: UrlArgs,

        /// Artifact file name inside the files directory
        file: String,

        /// Lifetime in seconds, capped by the configured maximum
        #[arg(long)]
        expires_in: Option<u64>,
    },

    /// Send commands to a room and print what it answers
    Connect {
        /// WebSocket endpoint
        #[arg(long, env = "ROOMSANDBOX_WS_URL", default_value = "ws://127.0.0.1:8080/ws")]
        ws_url: String,

        /// Room to join, a new one when omitted
        #[arg(long)]
        room: Option<String>,

        /// Mint tickets locally with this secret
        #[arg(long, env = "ROOMSANDBOX_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Use this ticket instead of minting one
        #[arg(long)]
        ticket: Option<String>,

        #[arg(long, default_value = "cli")]
        subject: String,

        /// Create the room with network access
        #[arg(long)]
        elevated: bool,

        /// Commands to send
        #[arg(last = true)]
        commands: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(server) => {
            let state = AppState::new(
                &server.secret.secret,
                server.secret.ticket_ttl(),
                server.sandbox.sandbox_config(),
                server.session_config(),
                server.urls.signed_url_config(),
            );
            http_server::run_server(server.port, state)
                .await
                .context("http server failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            file,
            language,
            sandbox,
        } => {
            let config = sandbox.sandbox_config();
            let language = language.unwrap_or_else(|| config.language.clone());
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let launcher = SandboxLauncher::new(config);
            match launcher.run_oneshot(&code, &language).await? {
                RunOutcome::Success { output, .. } => {
                    print!("{output}");
                    Ok(ExitCode::SUCCESS)
                }
                RunOutcome::Failure { error, .. } => {
                    eprint!("{error}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::MintTicket {
            secret,
            room,
            subject,
            scopes,
        } => {
            let issuer = TicketIssuer::new(&secret.secret, secret.ticket_ttl());
            let scopes = (!scopes.is_empty()).then_some(scopes.as_slice());
            println!("{}", issuer.mint(&subject, &room, scopes));
            Ok(ExitCode::SUCCESS)
        }
        Commands::SignUrl {
            secret,
            urls,
            file,
            expires_in,
        } => {
            let service = SignedUrlService::new(&secret, urls.signed_url_config());
            let url = service.generate(&file, None, expires_in.map(Duration::from_secs))?;
            println!("{url}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Connect {
            ws_url,
            room,
            secret,
            ticket,
            subject,
            elevated,
            commands,
        } => {
            let http_url = http_base(&ws_url)?;
            let mut config = ClientConfig::new(ws_url, http_url);
            config.elevated = elevated;
            match (secret, ticket) {
                (_, Some(ticket)) => {
                    let client = SessionClient::new(config, StaticTicket(ticket));
                    connect(client, &commands, room.as_deref()).await
                }
                (Some(secret), None) => {
                    let issuer = Arc::new(TicketIssuer::new(&secret, Duration::from_secs(30)));
                    let mut scopes = vec![Scope::Observe];
                    if elevated {
                        scopes.push(Scope::Elevated);
                    }
                    let tickets = IssuerTickets::new(issuer, subject).with_scopes(scopes);
                    connect(SessionClient::new(config, tickets), &commands, room.as_deref()).await
                }
                (None, None) => bail!("connect needs --secret or --ticket"),
            }
        }
    }
}

/// Derive the HTTP base from a WebSocket endpoint.
fn http_base(ws_url: &str) -> anyhow::Result<String> {
    let mut url = url::Url::parse(ws_url).context("invalid websocket url")?;
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    if url.set_scheme(scheme).is_err() {
        bail!("unsupported websocket url {ws_url}");
    }
    url.set_path("/");
    url.set_query(None);
    Ok(url.to_string())
}

async fn connect<T: TicketSource>(
    client: SessionClient<T>,
    commands: &[String],
    room: Option<&str>,
) -> anyhow::Result<ExitCode> {
    let cancel = client.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let output = client
        .run_with(commands, room, |event| match event {
            ServerEvent::ShellOutput { content } => {
                print!("{content}");
                let _ = std::io::stdout().flush();
            }
            ServerEvent::ShellError { content } => eprint!("{content}"),
            ServerEvent::Error { message } => eprintln!("error: {message}"),
            _ => {}
        })
        .await?;
    client.close().await?;

    info!(room = output.room, "done");
    if output.ended {
        eprintln!("session ended with exit code {:?}", output.exit_code);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
