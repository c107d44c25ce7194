//! Line codec: command encoding, response decoding and LF framing.

use crate::catalog::Catalog;
use crate::command::{Command, Direction, Status};
use crate::error::ProtocolError;
use crate::MAX_LINE_LENGTH;
use bytes::{Buf, BytesMut};
use std::sync::Arc;

/// A whitespace-delimited token, with quoting and escapes already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub quoted: bool,
}

impl Token {
    fn bare(&self) -> Option<&str> {
        (!self.quoted).then_some(self.text.as_str())
    }
}

/// Splits a line into tokens. Double-quoted tokens may contain spaces and
/// the escapes `\"` and `\\`.
pub fn tokenize(line: &str) -> Result<Vec<Token>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_whitespace() {
            chars.next();
            continue;
        }

        let mut text = String::new();
        if c == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(ProtocolError::UnterminatedString),
                    },
                    Some('"') => break,
                    Some(other) => text.push(other),
                    None => return Err(ProtocolError::UnterminatedString),
                }
            }
            tokens.push(Token { text, quoted: true });
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            tokens.push(Token {
                text,
                quoted: false,
            });
        }
    }

    Ok(tokens)
}

fn parse_index(token: Option<&Token>, what: &'static str) -> Result<u32, ProtocolError> {
    let token = token.ok_or(ProtocolError::MissingToken(what))?;
    token
        .bare()
        .and_then(|t| t.parse::<u32>().ok())
        .ok_or_else(|| ProtocolError::InvalidIndex(token.text.clone()))
}

/// Stateless translation between [`Command`]s and wire lines.
///
/// Lines produced by `encode` carry no terminator; framing belongs to the
/// transport.
#[derive(Debug, Clone)]
pub struct Codec {
    catalog: Arc<Catalog>,
}

impl Codec {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Encodes a command as a single wire line.
    pub fn encode(&self, cmd: &Command) -> Result<String, ProtocolError> {
        let def = self.catalog.require(&cmd.address)?;
        def.check_index(cmd.row, cmd.column)?;

        match cmd.direction {
            Direction::Get if !def.access.readable() => {
                return Err(ProtocolError::NotReadable {
                    address: cmd.address.clone(),
                })
            }
            Direction::Set if !def.access.writable() => {
                return Err(ProtocolError::NotWritable {
                    address: cmd.address.clone(),
                })
            }
            _ => {}
        }

        let mut line = String::with_capacity(cmd.address.len() + 24);
        line.push_str(cmd.direction.as_str());
        line.push(' ');
        line.push_str(&cmd.address);
        if def.indexed {
            line.push_str(&format!(" {} {}", cmd.row, cmd.column));
        }

        if cmd.direction == Direction::Set {
            let value = cmd
                .value
                .as_ref()
                .ok_or_else(|| ProtocolError::MissingValue(cmd.address.clone()))?;
            line.push(' ');
            line.push_str(&def.format_value(value)?);
        }

        Ok(line)
    }

    /// Decodes a line into zero or more commands.
    ///
    /// Never fails: lines that cannot be parsed are logged and yield an
    /// empty list.
    pub fn decode(&self, line: &str) -> Vec<Command> {
        match self.parse_line(line) {
            Ok(commands) => commands,
            Err(e) => {
                tracing::debug!("Dropping line {:?}: {}", line, e);
                Vec::new()
            }
        }
    }

    /// Parses a line, reporting why it was rejected.
    pub fn parse_line(&self, line: &str) -> Result<Vec<Command>, ProtocolError> {
        let tokens = tokenize(line)?;
        let mut rest = tokens.iter();
        let mut next = rest.next().ok_or(ProtocolError::EmptyLine)?;

        let status = next.bare().and_then(Status::from_token);
        if status.is_some() {
            next = rest.next().ok_or(ProtocolError::MissingToken("verb"))?;
        }

        // A line without a verb is a bare value push from the device.
        let direction = match next.bare().map(str::parse::<Direction>) {
            Some(Ok(direction)) => {
                next = rest.next().ok_or(ProtocolError::MissingToken("address"))?;
                direction
            }
            _ if status.is_some() => return Err(ProtocolError::UnknownVerb(next.text.clone())),
            _ => Direction::Set,
        };

        let address = next
            .bare()
            .ok_or_else(|| ProtocolError::UnknownAddress(next.text.clone()))?;
        let def = self.catalog.require(address)?;

        let (row, column) = if def.indexed {
            (
                parse_index(rest.next(), "row")?,
                parse_index(rest.next(), "column")?,
            )
        } else {
            (0, 0)
        };

        let template = Command {
            direction,
            address: address.to_string(),
            row,
            column,
            value: None,
            status,
        };

        let values: Vec<&Token> = rest.collect();
        if status == Some(Status::Error) {
            let reason: Vec<&str> = values.iter().map(|t| t.text.as_str()).collect();
            tracing::debug!("Device rejected {}: {}", template, reason.join(" "));
            return Ok(vec![template]);
        }
        if values.is_empty() {
            return Ok(vec![template]);
        }

        let mut commands = Vec::with_capacity(values.len());
        for (i, token) in values.into_iter().enumerate() {
            let column = u32::try_from(i)
                .ok()
                .and_then(|i| column.checked_add(i))
                .ok_or_else(|| ProtocolError::InvalidIndex(token.text.clone()))?;
            // Trailing values past the declared columns have nowhere to go.
            if let Err(e) = def.check_index(row, column) {
                tracing::debug!("Ignoring value {}: {}", token.text, e);
                continue;
            }
            commands.push(Command {
                column,
                value: Some(def.parse_value(&token.text, token.quoted)?),
                ..template.clone()
            });
        }
        Ok(commands)
    }
}

/// Accumulates inbound bytes and yields complete LF-terminated lines.
///
/// A trailing partial line is retained until its terminator arrives. A
/// partial line that outgrows the maximum is dropped through its LF.
pub struct LineDecoder {
    buffer: BytesMut,
    max_line_length: usize,
    /// Set while skipping the rest of an over-long line.
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_line_length,
            discarding: false,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to take the next complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when no complete line is buffered. A line that is
    /// not valid UTF-8 is consumed and reported as an error, so callers can
    /// keep reading after it.
    pub fn decode_line(&mut self) -> Result<Option<String>, ProtocolError> {
        if self.discarding {
            match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.buffer.advance(pos + 1);
                    self.discarding = false;
                }
                None => {
                    self.buffer.clear();
                    return Ok(None);
                }
            }
        }

        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > self.max_line_length {
                tracing::warn!(
                    "Discarding line longer than {} bytes",
                    self.max_line_length
                );
                self.buffer.clear();
                self.discarding = true;
            }
            return Ok(None);
        };

        let mut line = self.buffer.split_to(pos);
        self.buffer.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }

        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
