//! Sandboxed shell rooms over WebSocket.
//!
//! A room is one sandboxed shell shared by every client attached to it.
//! Output is broadcast to all of them and kept in a bounded history that is
//! replayed to late joiners. Access is gated by short-lived signed tickets.
//! The same server runs one-shot code submissions and serves artifacts
//! through signed download URLs.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only works on Linux.");

pub mod client;
pub mod config;
pub mod http_server;
pub mod protocol;
pub mod registry;
pub mod sandbox;
pub mod session;
pub mod signed_url;
pub mod state;
pub mod ticket;
