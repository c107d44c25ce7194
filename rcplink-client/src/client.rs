//! High-level client API.

use crate::cache::{CacheKey, ChangeEvent};
use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::queue::Deferred;
use crate::session::{SessionState, SessionStats};
use rcplink_protocol::{Catalog, Command, Direction, ParamDef, ParamKind, ProtocolError, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

/// High-level client for one device.
pub struct Client {
    conn: Arc<Connection>,
    catalog: Arc<Catalog>,
}

impl Client {
    /// Creates a new client with the given configuration and catalog.
    pub fn new(config: SessionConfig, catalog: Arc<Catalog>) -> Result<Self, ClientError> {
        Ok(Self {
            conn: Arc::new(Connection::new(config, catalog.clone())?),
            catalog,
        })
    }

    /// Creates a client, loading the catalog named in the configuration.
    pub fn from_config(config: SessionConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let catalog = match &config.catalog {
            Some(path) => Catalog::from_file(path)?,
            None => {
                tracing::warn!("No parameter catalog configured");
                Catalog::new()
            }
        };
        Self::new(config, Arc::new(catalog))
    }

    /// Connects to the device.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn state(&self) -> SessionState {
        self.conn.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.conn.watch_state()
    }

    /// Subscribes to cache changes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.conn.subscribe_changes()
    }

    /// Subscribes to every decoded inbound command.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Command> {
        self.conn.subscribe_inbound()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn ensure_live(&self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Connecting | SessionState::Connected => Ok(()),
            SessionState::Disconnected | SessionState::Failed => Err(ClientError::NotConnected),
        }
    }

    fn readable(&self, address: &str, row: u32, column: u32) -> Result<&ParamDef, ClientError> {
        let def = self.catalog.require(address)?;
        if !def.access.readable() {
            return Err(ProtocolError::NotReadable {
                address: address.to_string(),
            }
            .into());
        }
        def.check_index(row, column)?;
        Ok(def)
    }

    fn writable(&self, address: &str, row: u32, column: u32) -> Result<&ParamDef, ClientError> {
        let def = self.catalog.require(address)?;
        if !def.access.writable() {
            return Err(ProtocolError::NotWritable {
                address: address.to_string(),
            }
            .into());
        }
        def.check_index(row, column)?;
        Ok(def)
    }

    fn enqueue_deferred(&self, address: &str, row: u32, column: u32, deferred: Deferred) {
        let cmd = Command {
            direction: Direction::Set,
            address: address.to_string(),
            row,
            column,
            value: None,
            status: None,
        };
        self.conn.with_core(|core| core.enqueue_deferred(cmd, deferred));
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the cached value. A miss queues a fetch and returns `None`.
    pub fn get(&self, address: &str, row: u32, column: u32) -> Result<Option<Value>, ClientError> {
        self.readable(address, row, column)?;
        let key = CacheKey::new(address, row, column);
        Ok(self.conn.with_core(|core| core.read(&key)))
    }

    /// Fetches a value from the device and waits for the answer.
    pub async fn read(
        &self,
        address: &str,
        row: u32,
        column: u32,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.ensure_live()?;
        let aggregate = self.readable(address, row, column)?.aggregate_columns;

        let mut inbound = self.conn.subscribe_inbound();
        self.conn.with_core(|core| core.enqueue(Command::get(address, row, column)));

        let answer = async {
            loop {
                let cmd = match inbound.recv().await {
                    Ok(cmd) => cmd,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("read: skipped {} inbound commands", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return Err(ClientError::ConnectionClosed),
                };

                let matches = cmd.address == address
                    && cmd.row == row
                    && (aggregate || cmd.column == column);
                if !matches {
                    continue;
                }
                if cmd.is_error() {
                    return Err(ClientError::Rejected(cmd.to_string()));
                }
                if let Some(value) = cmd.value {
                    return Ok(value);
                }
            }
        };

        tokio::time::timeout(timeout, answer)
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// Queues a fetch regardless of the cache.
    pub fn request(&self, address: &str, row: u32, column: u32) -> Result<(), ClientError> {
        self.readable(address, row, column)?;
        self.conn.with_core(|core| core.enqueue(Command::get(address, row, column)));
        Ok(())
    }

    /// Drops every cached value so later reads poll the device again.
    pub fn reset_poll(&self) -> usize {
        self.conn.with_core(|core| core.reset_poll())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queues an absolute set. Float input is scaled to the raw value.
    pub fn set(
        &self,
        address: &str,
        row: u32,
        column: u32,
        value: impl Into<Value>,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let def = self.writable(address, row, column)?;
        let value = def.normalize(&value.into())?;
        self.conn.with_core(|core| core.enqueue(Command::set(address, row, column, value)));
        Ok(())
    }

    /// Queues a set from user-entered text in engineering units.
    pub fn set_text(
        &self,
        address: &str,
        row: u32,
        column: u32,
        text: &str,
    ) -> Result<(), ClientError> {
        let def = self.catalog.require(address)?;
        let value = def.parse_input(text)?;
        self.set(address, row, column, value)
    }

    /// Queues a relative change by `delta` raw units, clamped to the domain.
    pub fn adjust(
        &self,
        address: &str,
        row: u32,
        column: u32,
        delta: i64,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let def = self.writable(address, row, column)?;
        if !def.kind.is_numeric() {
            return Err(ClientError::Unsupported {
                operation: "adjust",
                kind: def.kind.name(),
                address: address.to_string(),
            });
        }
        self.enqueue_deferred(address, row, column, Deferred::Relative(delta));
        Ok(())
    }

    /// Queues an inversion of a boolean parameter.
    pub fn toggle(&self, address: &str, row: u32, column: u32) -> Result<(), ClientError> {
        self.ensure_live()?;
        let def = self.writable(address, row, column)?;
        if def.kind != ParamKind::Boolean {
            return Err(ClientError::Unsupported {
                operation: "toggle",
                kind: def.kind.name(),
                address: address.to_string(),
            });
        }
        self.enqueue_deferred(address, row, column, Deferred::Toggle);
        Ok(())
    }

    /// Queues a set of `to` from the current value of `from`.
    pub fn copy(&self, from: &CacheKey, to: &CacheKey) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.readable(&from.address, from.row, from.column)?;
        self.writable(&to.address, to.row, to.column)?;
        self.enqueue_deferred(
            &to.address,
            to.row,
            to.column,
            Deferred::CopyFrom(from.clone()),
        );
        Ok(())
    }

    /// Sends a line as-is, bypassing the queue. Returns `false` if the
    /// socket is not open.
    pub async fn send_raw(&self, line: &str) -> bool {
        self.conn.send_line(line).await
    }

    pub fn queue_len(&self) -> usize {
        self.conn.with_core(|core| core.queue_len())
    }

    pub fn stats(&self) -> SessionStats {
        self.conn.stats()
    }
}
