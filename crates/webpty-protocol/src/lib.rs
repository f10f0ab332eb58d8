//! Wire protocol for webpty sessions.
//!
//! Every protocol message is a single transport message: one tag byte
//! followed by the payload. The transport (WebSocket text frames or
//! length-prefixed WebTransport frames) provides the message boundary;
//! this crate only defines what the bytes mean.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default server-advertised maximum message size in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Largest payload a WebTransport frame can carry (2-byte length prefix).
pub const WEBTRANSPORT_MAX_FRAME: usize = 65535;

/// Length of issued auth tokens.
pub const AUTH_TOKEN_LENGTH: usize = 32;

/// Lifetime of issued auth tokens.
pub const AUTH_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// WebSocket subprotocol negotiated on upgrade.
pub const SUBPROTOCOL: &str = "webtty";

/// Client-to-server message tags.
pub mod client {
    pub const UNKNOWN_INPUT: u8 = b'0';
    pub const INPUT: u8 = b'1';
    pub const PING: u8 = b'2';
    pub const RESIZE_TERMINAL: u8 = b'3';
    pub const SET_ENCODING: u8 = b'4';
    // tmux passthrough
    pub const SELECT_PANE: u8 = b'5';
    pub const SELECT_WINDOW: u8 = b'6';
    pub const SPLIT_PANE: u8 = b'7';
    pub const CLOSE_PANE: u8 = b'8';
    pub const COPY_MODE: u8 = b'9';
    pub const RAW_COMMAND: u8 = b'A';
    pub const SCROLL_UP: u8 = b'B';
    pub const SCROLL_DOWN: u8 = b'C';
    pub const NEW_WINDOW: u8 = b'D';
    pub const SWITCH_SESSION: u8 = b'E';
}

/// Server-to-client message tags.
pub mod server {
    pub const UNKNOWN_OUTPUT: u8 = b'0';
    pub const OUTPUT: u8 = b'1';
    pub const PONG: u8 = b'2';
    pub const SET_WINDOW_TITLE: u8 = b'3';
    pub const SET_PREFERENCES: u8 = b'4';
    pub const SET_RECONNECT: u8 = b'5';
    pub const SET_BUFFER_SIZE: u8 = b'6';
    // tmux extensions
    pub const TMUX_LAYOUT: u8 = b'7';
    pub const TMUX_PANE_OUTPUT: u8 = b'8';
    pub const TMUX_MODE_UPDATE: u8 = b'9';
    pub const TMUX_SESSION_INFO: u8 = b'A';
    pub const TMUX_ERROR: u8 = b'B';
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,

    #[error("invalid payload for tag '{}': {reason}", *tag as char)]
    BadPayload { tag: u8, reason: String },
}

/// The first client message after transport open.
///
/// Field names are fixed on the wire; both fields may be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitMessage {
    #[serde(default, rename = "AuthToken")]
    pub auth_token: String,

    /// Query-string shaped arguments, e.g. `?cols=120&arg=-l`.
    /// Only honored by the server when permit-arguments is enabled.
    #[serde(default, rename = "Arguments")]
    pub arguments: String,
}

/// Payload of a resize-terminal message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePayload {
    pub columns: u16,
    pub rows: u16,
}

/// Payload encoding for input/output messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Base64,
    Null,
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "base64" => Ok(Encoding::Base64),
            "null" => Ok(Encoding::Null),
            other => Err(format!("unknown encoding: {other}")),
        }
    }
}

/// A tmux command carried by the passthrough tags `5..E`.
///
/// The session core does not interpret these; they are decoded into
/// typed values and handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxCommand {
    SelectPane { target: String },
    SelectWindow { target: String },
    SplitPane { target: String, horizontal: bool },
    ClosePane { target: String },
    CopyMode { target: String },
    RawCommand { command: String },
    ScrollUp { target: String, lines: u32 },
    ScrollDown { target: String, lines: u32 },
    NewWindow,
    SwitchSession { name: String },
}

#[derive(Debug, Deserialize)]
struct SplitPayload {
    target: String,
    #[serde(default)]
    horizontal: bool,
}

#[derive(Debug, Deserialize)]
struct ScrollPayload {
    target: String,
    #[serde(default = "default_scroll_lines")]
    lines: u32,
}

fn default_scroll_lines() -> u32 {
    1
}

/// A decoded client-to-server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    /// Terminal input, payload encoded per the active session encoding.
    Input(&'a [u8]),
    Ping,
    ResizeTerminal(ResizePayload),
    SetEncoding(Encoding),
    Tmux(TmuxCommand),
    /// A tag the server does not understand; carried for logging.
    Unknown(u8),
}

impl<'a> ClientMessage<'a> {
    /// Whether this message can cause bytes to reach the backend and is
    /// therefore subject to the server's write permission.
    pub fn writes_to_backend(&self) -> bool {
        matches!(self, ClientMessage::Input(_) | ClientMessage::Tmux(_))
    }
}

/// Decode one raw client message (tag byte plus payload).
pub fn decode_client_message(raw: &[u8]) -> Result<ClientMessage<'_>, ProtocolError> {
    let (&tag, payload) = raw.split_first().ok_or(ProtocolError::Empty)?;

    let bad = |reason: String| ProtocolError::BadPayload { tag, reason };
    let text = |payload: &[u8]| -> Result<String, ProtocolError> {
        String::from_utf8(payload.to_vec()).map_err(|e| bad(e.to_string()))
    };

    match tag {
        client::INPUT => Ok(ClientMessage::Input(payload)),
        client::PING => Ok(ClientMessage::Ping),
        client::RESIZE_TERMINAL => {
            let resize: ResizePayload =
                serde_json::from_slice(payload).map_err(|e| bad(e.to_string()))?;
            Ok(ClientMessage::ResizeTerminal(resize))
        }
        client::SET_ENCODING => {
            let name = text(payload)?;
            let encoding = name.parse::<Encoding>().map_err(bad)?;
            Ok(ClientMessage::SetEncoding(encoding))
        }
        client::SELECT_PANE => Ok(ClientMessage::Tmux(TmuxCommand::SelectPane {
            target: text(payload)?,
        })),
        client::SELECT_WINDOW => Ok(ClientMessage::Tmux(TmuxCommand::SelectWindow {
            target: text(payload)?,
        })),
        client::SPLIT_PANE => {
            let split: SplitPayload =
                serde_json::from_slice(payload).map_err(|e| bad(e.to_string()))?;
            Ok(ClientMessage::Tmux(TmuxCommand::SplitPane {
                target: split.target,
                horizontal: split.horizontal,
            }))
        }
        client::CLOSE_PANE => Ok(ClientMessage::Tmux(TmuxCommand::ClosePane {
            target: text(payload)?,
        })),
        client::COPY_MODE => Ok(ClientMessage::Tmux(TmuxCommand::CopyMode {
            target: text(payload)?,
        })),
        client::RAW_COMMAND => Ok(ClientMessage::Tmux(TmuxCommand::RawCommand {
            command: text(payload)?,
        })),
        client::SCROLL_UP => {
            let scroll: ScrollPayload =
                serde_json::from_slice(payload).map_err(|e| bad(e.to_string()))?;
            Ok(ClientMessage::Tmux(TmuxCommand::ScrollUp {
                target: scroll.target,
                lines: scroll.lines,
            }))
        }
        client::SCROLL_DOWN => {
            let scroll: ScrollPayload =
                serde_json::from_slice(payload).map_err(|e| bad(e.to_string()))?;
            Ok(ClientMessage::Tmux(TmuxCommand::ScrollDown {
                target: scroll.target,
                lines: scroll.lines,
            }))
        }
        client::NEW_WINDOW => Ok(ClientMessage::Tmux(TmuxCommand::NewWindow)),
        client::SWITCH_SESSION => Ok(ClientMessage::Tmux(TmuxCommand::SwitchSession {
            name: text(payload)?,
        })),
        other => Ok(ClientMessage::Unknown(other)),
    }
}

/// Build a server message from a tag and payload.
pub fn server_message(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(1 + payload.len());
    msg.push(tag);
    msg.extend_from_slice(payload);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_message_accepts_wire_field_names() {
        let msg: InitMessage =
            serde_json::from_str(r#"{"AuthToken":"tok","Arguments":"?cols=80"}"#).unwrap();
        assert_eq!(msg.auth_token, "tok");
        assert_eq!(msg.arguments, "?cols=80");
    }

    #[test]
    fn init_message_fields_default_to_empty() {
        let msg: InitMessage = serde_json::from_str("{}").unwrap();
        assert!(msg.auth_token.is_empty());
        assert!(msg.arguments.is_empty());
    }

    #[test]
    fn init_message_rejects_non_json() {
        assert!(serde_json::from_str::<InitMessage>("not json").is_err());
    }

    #[test]
    fn decode_input_borrows_payload() {
        let raw = [&[client::INPUT][..], b"aGVsbG8="].concat();
        match decode_client_message(&raw).unwrap() {
            ClientMessage::Input(payload) => assert_eq!(payload, b"aGVsbG8="),
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn decode_ping_and_unknown() {
        assert_eq!(
            decode_client_message(&[client::PING]).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            decode_client_message(b"zjunk").unwrap(),
            ClientMessage::Unknown(b'z')
        );
    }

    #[test]
    fn decode_resize() {
        let raw = [&[client::RESIZE_TERMINAL][..], br#"{"columns":120,"rows":40}"#].concat();
        match decode_client_message(&raw).unwrap() {
            ClientMessage::ResizeTerminal(r) => {
                assert_eq!(r, ResizePayload { columns: 120, rows: 40 });
            }
            other => panic!("wrong message: {other:?}"),
        }
    }

    #[test]
    fn decode_resize_rejects_bad_json() {
        let raw = [&[client::RESIZE_TERMINAL][..], b"{oops"].concat();
        assert!(decode_client_message(&raw).is_err());
    }

    #[test]
    fn decode_set_encoding() {
        let raw = [&[client::SET_ENCODING][..], b"null"].concat();
        assert_eq!(
            decode_client_message(&raw).unwrap(),
            ClientMessage::SetEncoding(Encoding::Null)
        );

        let raw = [&[client::SET_ENCODING][..], b"rot13"].concat();
        assert!(decode_client_message(&raw).is_err());
    }

    #[test]
    fn decode_empty_message_fails() {
        assert!(matches!(
            decode_client_message(&[]),
            Err(ProtocolError::Empty)
        ));
    }

    #[test]
    fn tmux_tags_decode_to_typed_commands() {
        let raw = [&[client::SELECT_PANE][..], b"%3"].concat();
        assert_eq!(
            decode_client_message(&raw).unwrap(),
            ClientMessage::Tmux(TmuxCommand::SelectPane { target: "%3".into() })
        );

        let raw = [&[client::SPLIT_PANE][..], br#"{"target":"%1","horizontal":true}"#].concat();
        assert_eq!(
            decode_client_message(&raw).unwrap(),
            ClientMessage::Tmux(TmuxCommand::SplitPane {
                target: "%1".into(),
                horizontal: true,
            })
        );

        let raw = [&[client::SCROLL_UP][..], br#"{"target":"%1"}"#].concat();
        assert_eq!(
            decode_client_message(&raw).unwrap(),
            ClientMessage::Tmux(TmuxCommand::ScrollUp { target: "%1".into(), lines: 1 })
        );

        assert_eq!(
            decode_client_message(&[client::NEW_WINDOW]).unwrap(),
            ClientMessage::Tmux(TmuxCommand::NewWindow)
        );
    }

    #[test]
    fn write_gating_covers_input_and_tmux() {
        assert!(ClientMessage::Input(b"x").writes_to_backend());
        assert!(ClientMessage::Tmux(TmuxCommand::NewWindow).writes_to_backend());
        assert!(!ClientMessage::Ping.writes_to_backend());
        assert!(
            !ClientMessage::ResizeTerminal(ResizePayload { columns: 1, rows: 1 })
                .writes_to_backend()
        );
    }

    #[test]
    fn server_message_prepends_tag() {
        let msg = server_message(server::OUTPUT, b"abc");
        assert_eq!(msg, [&[server::OUTPUT][..], b"abc"].concat());
    }
}
