//! Wire messages exchanged over the session WebSocket.
//!
//! Client frames are JSON objects tagged by `action`; server frames are JSON
//! objects tagged by `type`. The very first server frame on every connection
//! is the plain-text handshake `SESSION_ID:<room>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the plain-text handshake frame.
pub const HANDSHAKE_PREFIX: &str = "SESSION_ID:";

/// Inbound message from a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CommandMessage {
    ShellCommand { command: String },
    Ping,
    Disconnect,
}

/// Outbound event delivered to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ShellOutput { content: String },
    ShellError { content: String },
    CommandComplete { command: String },
    Pong,
    Error { message: String },
    SessionEnded { exit_code: Option<i32> },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("binary frames are not supported")]
    Binary,
}

impl CommandMessage {
    /// Decode a client frame. Valid JSON carrying an unrecognised `action`
    /// is reported separately from JSON that does not parse at all.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Self>(text) {
            Ok(msg) => Ok(msg),
            Err(e) => {
                let value: serde_json::Value = serde_json::from_str(text)
                    .map_err(|_| ProtocolError::Malformed(e.to_string()))?;
                match value.get("action").and_then(|a| a.as_str()) {
                    Some(action)
                        if !matches!(action, "shell_command" | "ping" | "disconnect") =>
                    {
                        Err(ProtocolError::UnknownAction(action.to_string()))
                    }
                    _ => Err(ProtocolError::Malformed(e.to_string())),
                }
            }
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServerEvent {
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Size used for history accounting.
    pub fn weight(&self) -> usize {
        match self {
            Self::ShellOutput { content } | Self::ShellError { content } => content.len(),
            Self::CommandComplete { command } => command.len(),
            Self::Error { message } => message.len(),
            Self::Pong | Self::SessionEnded { .. } => 0,
        }
    }
}

pub fn handshake(room: &str) -> String {
    format!("{HANDSHAKE_PREFIX}{room}")
}

pub fn parse_handshake(text: &str) -> Option<&str> {
    text.strip_prefix(HANDSHAKE_PREFIX).filter(|id| !id.is_empty())
}

/// Incremental UTF-8 decoder for process output.
///
/// A multi-byte character split across two reads is held back until the
/// remaining bytes arrive. Bytes that can never form valid UTF-8 are replaced.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    carry: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.carry) {
                Ok(s) => {
                    out.push_str(s);
                    self.carry.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to always lands on a char boundary
                    out.push_str(&String::from_utf8_lossy(&self.carry[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.carry.drain(..valid + bad);
                        }
                        None => {
                            self.carry.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left once the stream ends.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_client_actions() {
        assert_eq!(
            CommandMessage::decode(r#"{"action":"shell_command","command":"ls"}"#).unwrap(),
            CommandMessage::ShellCommand {
                command: "ls".into()
            }
        );
        assert_eq!(
            CommandMessage::decode(r#"{"action":"ping"}"#).unwrap(),
            CommandMessage::Ping
        );
        assert_eq!(
            CommandMessage::decode(r#"{"action":"disconnect"}"#).unwrap(),
            CommandMessage::Disconnect
        );
    }

    #[test]
    fn unknown_action_is_distinct_from_garbage() {
        assert!(matches!(
            CommandMessage::decode(r#"{"action":"reboot"}"#),
            Err(ProtocolError::UnknownAction(a)) if a == "reboot"
        ));
        assert!(matches!(
            CommandMessage::decode("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        // known action, missing field
        assert!(matches!(
            CommandMessage::decode(r#"{"action":"shell_command"}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn server_events_carry_type_tag() {
        let json = ServerEvent::ShellOutput {
            content: "hi".into(),
        }
        .encode();
        assert_eq!(json, r#"{"type":"shell_output","content":"hi"}"#);
        assert_eq!(ServerEvent::Pong.encode(), r#"{"type":"pong"}"#);
        assert_eq!(
            ServerEvent::decode(r#"{"type":"session_ended","exit_code":0}"#).unwrap(),
            ServerEvent::SessionEnded { exit_code: Some(0) }
        );
    }

    #[test]
    fn handshake_roundtrip() {
        assert_eq!(handshake("r1"), "SESSION_ID:r1");
        assert_eq!(parse_handshake("SESSION_ID:r1"), Some("r1"));
        assert_eq!(parse_handshake("SESSION_ID:"), None);
        assert_eq!(parse_handshake("{\"type\":\"pong\"}"), None);
    }

    #[test]
    fn chunker_holds_split_characters() {
        let mut chunker = Utf8Chunker::default();
        let bytes = "héllo".as_bytes();
        // split inside the two-byte 'é'
        assert_eq!(chunker.push(&bytes[..2]), "h");
        assert_eq!(chunker.push(&bytes[2..]), "éllo");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[b'a', 0xff, b'b']), "a\u{fffd}b");
    }
}
