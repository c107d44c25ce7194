//! Session state machine.
//!
//! [`SessionCore`] holds everything that belongs to one device session:
//! lifecycle state, line framing, the state cache and the command queue.
//! It performs no I/O. The async driver in [`crate::connection`] feeds it
//! socket bytes and timer ticks and writes out the lines it returns.

use crate::cache::{CacheKey, ChangeEvent, StateCache};
use crate::config::SessionConfig;
use crate::error::ClientError;
use crate::queue::{CommandQueue, Deferred, QueueStats};
use rcplink_protocol::{
    keepalive_handshake, Catalog, Codec, Command, LineDecoder, Value, HEARTBEAT, MAX_LINE_LENGTH,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl SessionState {
    /// Returns whether the session may move to `to`.
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Failed)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Failed, Disconnected)
        )
    }

    /// Externally reported status. `Disconnected` is not reported.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            SessionState::Disconnected => None,
            SessionState::Connecting => Some(SessionStatus::Connecting),
            SessionState::Connected => Some(SessionStatus::Connected),
            SessionState::Failed => Some(SessionStatus::ConnectionFailure),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self == SessionState::Connected
    }
}

/// Status published to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Connected,
    ConnectionFailure,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::ConnectionFailure => "connection failure",
        };
        f.write_str(s)
    }
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub lines_sent: u64,
    pub lines_received: u64,
    pub lines_dropped: u64,
    pub encode_failures: u64,
    pub queue_len: usize,
    pub cache_entries: usize,
    pub queue: QueueStats,
}

/// Synchronous core of a device session.
pub struct SessionCore {
    state: SessionState,
    codec: Codec,
    cache: StateCache,
    queue: CommandQueue,
    lines: LineDecoder,
    keepalive_armed: bool,
    idle_timeout_ms: u64,
    state_tx: watch::Sender<SessionState>,
    inbound_tx: broadcast::Sender<Command>,
    stats: SessionStats,
}

impl SessionCore {
    pub fn new(catalog: Arc<Catalog>, config: &SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Self {
            state: SessionState::Disconnected,
            codec: Codec::new(catalog.clone()),
            cache: StateCache::new(catalog.clone(), config.event_capacity),
            queue: CommandQueue::new(catalog, config.max_deferrals),
            lines: LineDecoder::with_max_line_length(MAX_LINE_LENGTH),
            keepalive_armed: false,
            idle_timeout_ms: config.idle_timeout().as_millis() as u64,
            state_tx,
            inbound_tx,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.cache.subscribe()
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Command> {
        self.inbound_tx.subscribe()
    }

    fn transition(&mut self, to: SessionState) -> Result<(), ClientError> {
        if !self.state.can_transition_to(to) {
            return Err(ClientError::InvalidTransition {
                from: self.state,
                to,
            });
        }

        tracing::debug!("Session {:?} -> {:?}", self.state, to);
        self.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    /// Starts a connection attempt. Queued commands and partial input from
    /// the previous connection are discarded.
    pub fn begin_connect(&mut self) -> Result<(), ClientError> {
        self.transition(SessionState::Connecting)?;
        self.queue.clear();
        self.lines.clear();
        Ok(())
    }

    /// Marks the socket as open. Clears the cache, arms the heartbeat and
    /// returns the handshake lines to send.
    pub fn on_connected(&mut self) -> Result<Vec<String>, ClientError> {
        self.transition(SessionState::Connected)?;
        let dropped = self.cache.clear();
        if dropped > 0 {
            tracing::debug!("Cleared {} cached values", dropped);
        }
        self.keepalive_armed = true;
        Ok(vec![keepalive_handshake(self.idle_timeout_ms)])
    }

    /// Marks the connection as failed. The cache is kept until the next
    /// successful connect.
    pub fn on_failure(&mut self, reason: &str) -> Result<(), ClientError> {
        self.transition(SessionState::Failed)?;
        self.keepalive_armed = false;
        tracing::warn!("Connection failed: {}", reason);
        Ok(())
    }

    /// Marks the session as closed by the user.
    pub fn on_disconnected(&mut self) -> Result<(), ClientError> {
        self.transition(SessionState::Disconnected)?;
        self.keepalive_armed = false;
        Ok(())
    }

    /// Feeds received bytes. Returns the commands decoded from every
    /// completed line.
    pub fn on_data(&mut self, data: &[u8]) -> Vec<Command> {
        self.lines.extend(data);

        let mut decoded = Vec::new();
        loop {
            let line = match self.lines.decode_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Dropping inbound line: {}", e);
                    self.stats.lines_received += 1;
                    self.stats.lines_dropped += 1;
                    continue;
                }
            };

            self.stats.lines_received += 1;
            if line.trim().is_empty() {
                continue;
            }
            if rcplink_protocol::is_session_reply(&line) {
                tracing::trace!("Session reply: {}", line);
                continue;
            }

            let commands = self.codec.decode(&line);
            if commands.is_empty() {
                self.stats.lines_dropped += 1;
            }
            for cmd in commands {
                self.dispatch(&cmd);
                decoded.push(cmd);
            }
        }
        decoded
    }

    fn dispatch(&mut self, cmd: &Command) {
        if cmd.is_error() {
            tracing::warn!("Device rejected {}", cmd);
        }

        if cmd.carries_value() {
            if let Some(value) = &cmd.value {
                self.cache.put(CacheKey::from(cmd), value.clone());
            }
        }
        self.queue.reconcile(cmd);
        // No subscribers is not an error.
        let _ = self.inbound_tx.send(cmd.clone());
    }

    /// Releases at most one queued command as an encoded line.
    ///
    /// Transmitted sets are reflected into the cache immediately.
    pub fn drain_tick(&mut self) -> Option<String> {
        if !self.state.is_connected() {
            return None;
        }

        let cmd = self.queue.drain_tick(&self.cache)?;
        match self.codec.encode(&cmd) {
            Ok(line) => {
                if cmd.is_set() {
                    if let Some(value) = &cmd.value {
                        self.cache.put(CacheKey::from(&cmd), value.clone());
                    }
                }
                self.stats.lines_sent += 1;
                Some(line)
            }
            Err(e) => {
                tracing::warn!("Dropping {}: {}", cmd, e);
                self.stats.encode_failures += 1;
                None
            }
        }
    }

    /// Returns the heartbeat line when one is due.
    pub fn keepalive_tick(&mut self) -> Option<String> {
        if self.keepalive_armed && self.state.is_connected() {
            self.stats.lines_sent += 1;
            Some(HEARTBEAT.to_string())
        } else {
            None
        }
    }

    pub fn keepalive_armed(&self) -> bool {
        self.keepalive_armed
    }

    pub fn enqueue(&mut self, cmd: Command) -> bool {
        self.queue.enqueue(cmd)
    }

    pub fn enqueue_deferred(&mut self, cmd: Command, deferred: Deferred) -> bool {
        self.queue.enqueue_deferred(cmd, deferred)
    }

    /// Cached value lookup; a miss requests the value from the device.
    pub fn read(&mut self, key: &CacheKey) -> Option<Value> {
        self.cache.get(key, &mut self.queue)
    }

    pub fn peek(&self, key: &CacheKey) -> Option<Value> {
        self.cache.peek(key).cloned()
    }

    /// Drops every cached value so subsequent reads poll the device again.
    pub fn reset_poll(&mut self) -> usize {
        self.cache.clear()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            queue_len: self.queue.len(),
            cache_entries: self.cache.len(),
            queue: self.queue.stats(),
            ..self.stats
        }
    }
}
