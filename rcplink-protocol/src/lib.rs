//! # rcplink-protocol
//!
//! Wire protocol implementation for rcplink, a control client for networked
//! audio I/O devices that speak a line-oriented ASCII remote-control
//! dialect over TCP.
//!
//! This crate provides:
//! - Command/value types shared by every layer
//! - The parameter catalog (typed, validated at load time)
//! - Line encoding/decoding with value scaling and string escaping
//! - LF line framing for inbound byte streams

pub mod catalog;
pub mod codec;
pub mod command;
pub mod error;

pub use catalog::{Access, Catalog, CatalogBuilder, ParamDef, ParamKind};
pub use codec::{Codec, LineDecoder};
pub use command::{Command, Direction, Status, Value};
pub use error::{CatalogError, ProtocolError};

/// Default TCP port of the device's remote-control service.
pub const DEFAULT_PORT: u16 = 49280;

/// Maximum length of a single inbound line (64 KiB).
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Line terminator appended by the transport.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Heartbeat line sent periodically while connected.
pub const HEARTBEAT: &str = "devstatus runmode";

/// Handshake line asking the device to drop the connection after
/// `idle_timeout_ms` of silence.
pub fn keepalive_handshake(idle_timeout_ms: u64) -> String {
    format!("scpmode keepalive {}", idle_timeout_ms)
}

/// Returns true for the device's replies to the handshake and heartbeat.
/// These carry no parameter state.
pub fn is_session_reply(line: &str) -> bool {
    let mut tokens = line.split_ascii_whitespace();
    let Some(mut first) = tokens.next() else {
        return false;
    };
    if Status::from_token(first).is_some() {
        match tokens.next() {
            Some(token) => first = token,
            None => return false,
        }
    }
    matches!(first, "scpmode" | "devstatus")
}
