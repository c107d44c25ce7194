//! Connection management.
//!
//! A [`Connection`] owns the TCP socket of one device session and drives a
//! [`SessionCore`] from three background tasks: the reader, the paced drain
//! timer and the heartbeat timer. Every task stops when the session leaves
//! the `Connected` state.

use crate::cache::ChangeEvent;
use crate::config::SessionConfig;
use crate::error::ClientError;
use crate::session::{SessionCore, SessionState, SessionStats};
use parking_lot::Mutex as SyncMutex;
use rcplink_protocol::{Catalog, Command, LINE_TERMINATOR};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Background tasks of the current connection.
#[derive(Default)]
struct SessionTasks {
    reader: Option<JoinHandle<()>>,
    drain: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn abort_all(&mut self) {
        for handle in [self.reader.take(), self.drain.take(), self.keepalive.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

/// State shared between the connection handle and its tasks.
struct Shared {
    core: SyncMutex<SessionCore>,
    /// Write half of the socket while connected.
    writer: Mutex<Option<OwnedWriteHalf>>,
    tasks: SyncMutex<SessionTasks>,
}

impl Shared {
    /// Writes one line followed by the terminator. Returns `false` if the
    /// socket is closed or the write fails.
    async fn send_line(&self, line: &str) -> bool {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            tracing::debug!("Not connected, dropping {:?}", line);
            return false;
        };

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(LINE_TERMINATOR);

        match writer.write_all(&frame).await {
            Ok(()) => {
                tracing::trace!("-> {}", line);
                true
            }
            Err(e) => {
                tracing::debug!("Write failed: {}", e);
                false
            }
        }
    }

    /// Moves the session to `Failed`, closes the socket and stops the
    /// tasks. Only the first caller for a given connection does anything.
    async fn fail(&self, reason: &str) {
        let transitioned = self.core.lock().on_failure(reason);
        if transitioned.is_err() {
            return;
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }

        // May abort the calling task; nothing awaits after this.
        self.tasks.lock().abort_all();
    }
}

/// A connection to a device.
pub struct Connection {
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a new connection (not yet connected). Fails if the
    /// configuration is unusable.
    pub fn new(config: SessionConfig, catalog: Arc<Catalog>) -> Result<Self, ClientError> {
        config.validate()?;
        let core = SessionCore::new(catalog, &config);
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                core: SyncMutex::new(core),
                writer: Mutex::new(None),
                tasks: SyncMutex::new(SessionTasks::default()),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens the socket, sends the keepalive handshake and starts the
    /// session tasks.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.shared.tasks.lock().abort_all();
        self.shared.core.lock().begin_connect()?;

        let addr = self.config.addr();
        tracing::debug!("Connecting to {}...", addr);

        let attempt =
            tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr.as_str()))
                .await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.shared.fail(&e.to_string()).await;
                return Err(ClientError::Io(e));
            }
            Err(_) => {
                self.shared.fail("connect timeout").await;
                return Err(ClientError::Timeout);
            }
        };

        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *self.shared.writer.lock().await = Some(write_half);

        let connected = self.shared.core.lock().on_connected();
        let handshake = match connected {
            Ok(lines) => lines,
            Err(e) => {
                // Closed while the socket was opening.
                self.shared.writer.lock().await.take();
                return Err(e);
            }
        };

        for line in &handshake {
            if !self.shared.send_line(line).await {
                self.shared.fail("handshake write failed").await;
                return Err(ClientError::ConnectionClosed);
            }
        }
        tracing::info!("Connected to {}", addr);

        let tasks = SessionTasks {
            reader: Some(tokio::spawn(read_loop(
                self.shared.clone(),
                read_half,
                self.config.read_buffer_size,
            ))),
            drain: Some(tokio::spawn(drain_loop(
                self.shared.clone(),
                self.config.send_interval(),
            ))),
            keepalive: Some(tokio::spawn(keepalive_loop(
                self.shared.clone(),
                self.config.keepalive_interval(),
            ))),
        };
        *self.shared.tasks.lock() = tasks;

        Ok(())
    }

    /// Closes the connection. Closing an already closed connection is a
    /// no-op.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");

        let closed = self.shared.core.lock().on_disconnected();
        if let Err(e) = closed {
            tracing::debug!("Close ignored: {}", e);
        }
        self.shared.tasks.lock().abort_all();

        let writer = self.shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            tracing::debug!("Shutting down writer");
            let _ = writer.shutdown().await;
        }

        tracing::debug!("Connection closed");
        Ok(())
    }

    /// Sends a raw line immediately, bypassing the queue.
    pub async fn send_line(&self, line: &str) -> bool {
        self.shared.send_line(line).await
    }

    pub fn state(&self) -> SessionState {
        self.shared.core.lock().state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.core.lock().watch_state()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.shared.core.lock().subscribe_changes()
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<Command> {
        self.shared.core.lock().subscribe_inbound()
    }

    /// Runs `f` with exclusive access to the session core.
    pub fn with_core<R>(&self, f: impl FnOnce(&mut SessionCore) -> R) -> R {
        let mut core = self.shared.core.lock();
        f(&mut core)
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.core.lock().stats()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shared.core.lock().on_disconnected();
        self.shared.tasks.lock().abort_all();
        // Dropping the write half shuts down the socket.
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: OwnedReadHalf, buffer_size: usize) {
    tracing::debug!("read_loop started");
    let mut buf = vec![0u8; buffer_size];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("read_loop: connection closed by device");
                shared.fail("connection closed by device").await;
                break;
            }
            Ok(n) => {
                let decoded = shared.core.lock().on_data(&buf[..n]);
                tracing::trace!("read_loop: {} bytes, {} commands", n, decoded.len());
            }
            Err(e) => {
                shared.fail(&e.to_string()).await;
                break;
            }
        }
    }
}

async fn drain_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let line = {
            let mut core = shared.core.lock();
            if !core.state().is_connected() {
                break;
            }
            core.drain_tick()
        };

        let Some(line) = line else { continue };
        if !shared.send_line(&line).await {
            shared.fail("write failed").await;
            break;
        }
    }
}

async fn keepalive_loop(shared: Arc<Shared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the handshake covers it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let line = {
            let mut core = shared.core.lock();
            if !core.state().is_connected() {
                break;
            }
            core.keepalive_tick()
        };

        let Some(line) = line else { continue };
        if !shared.send_line(&line).await {
            shared.fail("heartbeat write failed").await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use rcplink_protocol::{ParamDef, ParamKind, Value, HEARTBEAT};
    use tokio::io::{AsyncBufReadExt, BufReader, Lines};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::builder()
                .param(ParamDef::new("mixer:mute", ParamKind::Boolean))
                .param(ParamDef::new("mixer:fader", ParamKind::Scaled { scale: 100 }))
                .build()
                .unwrap(),
        )
    }

    async fn listener() -> (TcpListener, SessionConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = SessionConfig::new("127.0.0.1", port)
            .with_send_interval(Duration::from_millis(2))
            .with_connect_timeout(Duration::from_secs(1));
        (listener, config)
    }

    async fn accept(
        listener: &TcpListener,
    ) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = socket.into_split();
        (BufReader::new(read_half).lines(), write_half)
    }

    async fn next_line(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> String {
        tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn wait_for_state(conn: &Connection, target: SessionState) {
        let mut rx = conn.watch_state();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == target))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_sends_handshake() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);

        assert_eq!(conn.state(), SessionState::Connected);
        assert_eq!(next_line(&mut lines).await, "scpmode keepalive 20000");
    }

    #[tokio::test]
    async fn test_heartbeat_sent_periodically() {
        let (listener, config) = listener().await;
        let config = config.with_keepalive_interval(Duration::from_millis(30));
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);

        assert_eq!(next_line(&mut lines).await, "scpmode keepalive 60");
        assert_eq!(next_line(&mut lines).await, HEARTBEAT);
        assert_eq!(next_line(&mut lines).await, HEARTBEAT);
    }

    #[tokio::test]
    async fn test_drop_without_close_stops_heartbeat() {
        let (listener, config) = listener().await;
        let config = config.with_keepalive_interval(Duration::from_millis(30));
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        assert_eq!(next_line(&mut lines).await, "scpmode keepalive 60");
        assert_eq!(next_line(&mut lines).await, HEARTBEAT);

        drop(conn);

        // At most a heartbeat already in flight, then end of stream.
        let mut trailing = Vec::new();
        while let Some(line) = tokio::time::timeout(WAIT, lines.next_line())
            .await
            .unwrap()
            .unwrap()
        {
            trailing.push(line);
        }
        assert!(trailing.len() <= 1, "lines after drop: {:?}", trailing);
        assert!(trailing.iter().all(|line| line == HEARTBEAT));

        // Several keepalive periods later the stream is still finished.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_queued_commands_transmitted_in_order() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        next_line(&mut lines).await;

        conn.with_core(|core| {
            core.enqueue(Command::set("mixer:mute", 0, 0, true));
            core.enqueue(Command::set("mixer:fader", 2, 0, -32768));
            core.enqueue(Command::get("mixer:mute", 1, 0));
        });

        assert_eq!(next_line(&mut lines).await, "set mixer:mute 0 0 1");
        assert_eq!(next_line(&mut lines).await, "set mixer:fader 2 0 -327.68");
        assert_eq!(next_line(&mut lines).await, "get mixer:mute 1 0");
        assert_eq!(conn.stats().lines_sent, 3);
    }

    #[tokio::test]
    async fn test_inbound_updates_cache() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();
        let mut changes = conn.subscribe_changes();

        let (connected, (_lines, mut writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);

        writer.write_all(b"NOTIFY set mixer:mu").await.unwrap();
        writer.write_all(b"te 4 0 1\r\n").await.unwrap();

        let event = tokio::time::timeout(WAIT, changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, CacheKey::new("mixer:mute", 4, 0));
        assert_eq!(event.value, Value::Bool(true));
        assert_eq!(
            conn.with_core(|core| core.peek(&CacheKey::new("mixer:mute", 4, 0))),
            Some(Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_peer_close_fails_session() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (lines, writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        drop(lines);
        drop(writer);

        wait_for_state(&conn, SessionState::Failed).await;
        assert!(conn.with_core(|core| core.keepalive_tick()).is_none());
        assert!(!conn.send_line("get mixer:mute 0 0").await);
    }

    #[tokio::test]
    async fn test_reconnect_after_failure() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (_lines, mut writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        writer.write_all(b"NOTIFY set mixer:mute 0 0 1\n").await.unwrap();
        drop(writer);
        drop(_lines);
        wait_for_state(&conn, SessionState::Failed).await;
        assert_eq!(conn.with_core(|core| core.cache().len()), 1);

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        assert_eq!(next_line(&mut lines).await, "scpmode keepalive 20000");
        assert!(conn.with_core(|core| core.cache().is_empty()));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, config) = listener().await;
        drop(listener);

        let conn = Connection::new(config, catalog()).unwrap();
        let err = tokio_test::assert_err!(conn.connect().await);
        assert!(err.is_retryable());
        assert_eq!(conn.state(), SessionState::Failed);
        assert_eq!(conn.state().status(), Some(crate::SessionStatus::ConnectionFailure));
    }

    #[tokio::test]
    async fn test_close() {
        let (listener, config) = listener().await;
        let conn = Connection::new(config, catalog()).unwrap();

        let (connected, (mut lines, _writer)) = tokio::join!(conn.connect(), accept(&listener));
        tokio_test::assert_ok!(connected);
        next_line(&mut lines).await;

        conn.close().await.unwrap();
        assert_eq!(conn.state(), SessionState::Disconnected);
        assert!(!conn.send_line("get mixer:mute 0 0").await);

        let eof = tokio::time::timeout(WAIT, lines.next_line()).await.unwrap();
        assert!(matches!(eof, Ok(None)));

        // Second close is a no-op.
        conn.close().await.unwrap();
    }
}
