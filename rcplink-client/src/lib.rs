//! # rcplink-client
//!
//! Session engine for rcplink.
//!
//! This crate provides:
//! - Async TCP connection with keepalive handshake and heartbeat
//! - Paced, deduplicating outbound command queue with deferred sets
//! - Last-known state cache with change notifications
//! - High-level API for reading and writing device parameters

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod queue;
pub mod session;

pub use cache::{CacheKey, ChangeEvent, StateCache};
pub use client::Client;
pub use config::{ConfigError, SessionConfig};
pub use connection::Connection;
pub use error::ClientError;
pub use queue::{CommandQueue, Deferred, QueueStats};
pub use session::{SessionCore, SessionState, SessionStats, SessionStatus};
