//! Command and value types exchanged with the device.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a command requests a value or pushes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Get,
    Set,
}

impl Direction {
    /// Wire keyword for this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Get => "get",
            Direction::Set => "set",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Direction::Get),
            "set" => Ok(Direction::Set),
            _ => Err(()),
        }
    }
}

/// Acknowledgement tag leading a device response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// `OK`: the request was accepted.
    Ok,
    /// `OKm`: accepted, several values follow on one line.
    OkMulti,
    /// `NOTIFY`: unsolicited change made on the device itself.
    Notify,
    /// `ERROR`: the request was rejected.
    Error,
}

impl Status {
    /// Wire token for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::OkMulti => "OKm",
            Status::Notify => "NOTIFY",
            Status::Error => "ERROR",
        }
    }

    /// Parses a leading response token. Returns `None` for anything else.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "OK" => Some(Status::Ok),
            "OKm" => Some(Status::OkMulti),
            "NOTIFY" => Some(Status::Notify),
            "ERROR" => Some(Status::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value.
///
/// Numeric parameters are carried as the device's raw integer (already
/// multiplied by the parameter's scale). `Float` is accepted on input as a
/// convenience and normalised to `Int` by the catalog before it is queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// A single unit of protocol traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub direction: Direction,
    pub address: String,
    pub row: u32,
    pub column: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl Command {
    /// Creates a value request.
    pub fn get(address: impl Into<String>, row: u32, column: u32) -> Self {
        Self {
            direction: Direction::Get,
            address: address.into(),
            row,
            column,
            value: None,
            status: None,
        }
    }

    /// Creates a value push.
    pub fn set(address: impl Into<String>, row: u32, column: u32, value: impl Into<Value>) -> Self {
        Self {
            direction: Direction::Set,
            address: address.into(),
            row,
            column,
            value: Some(value.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_get(&self) -> bool {
        self.direction == Direction::Get
    }

    pub fn is_set(&self) -> bool {
        self.direction == Direction::Set
    }

    /// Returns whether the device rejected this command.
    pub fn is_error(&self) -> bool {
        self.status == Some(Status::Error)
    }

    /// Returns whether this inbound command reports a concrete device value.
    pub fn carries_value(&self) -> bool {
        self.value.is_some() && !self.is_error()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "{} ", status)?;
        }
        write!(
            f,
            "{} {} [{}:{}]",
            self.direction, self.address, self.row, self.column
        )?;
        if let Some(ref value) = self.value {
            write!(f, " = {}", value)?;
        }
        Ok(())
    }
}
