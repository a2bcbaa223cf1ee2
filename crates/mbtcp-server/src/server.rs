//! Modbus TCP server: listener, accept loop, and session threads.

use mbtcp_common::config::ServerConfig;
use mbtcp_common::error::{ModbusError, ModbusResult};
use mbtcp_common::identity::DeviceIdentity;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::datastore::{RegisterKind, UnitContext};
use crate::session::{Session, SessionEnd};

/// Pause between accept attempts when no connection is pending.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// A running Modbus TCP device.
///
/// Binding starts an accept thread; each accepted connection gets its own
/// session thread. All sessions share one [`UnitContext`]. The server stops
/// when [`ModbusTcpServer::stop`] is called or the value is dropped.
pub struct ModbusTcpServer {
    /// The address the server is listening on.
    local_addr: SocketAddr,
    /// Signal to stop the accept and session threads.
    stop_signal: Arc<AtomicBool>,
    /// Accept thread handle.
    thread_handle: Option<JoinHandle<()>>,
    /// Register memory shared by every session.
    context: Arc<UnitContext>,
    /// Identification metadata, never read by the protocol engine.
    identity: DeviceIdentity,
    /// Number of live sessions.
    active_sessions: Arc<AtomicUsize>,
}

impl ModbusTcpServer {
    /// Bind and start serving a fresh context built from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::Bind`] if the listening socket cannot be set up.
    pub fn bind(config: &ServerConfig) -> ModbusResult<Self> {
        Self::bind_with_context(config, Arc::new(UnitContext::from_config(config)))
    }

    /// Bind and start serving an existing context.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::Bind`] if the listening socket cannot be set up.
    pub fn bind_with_context(
        config: &ServerConfig,
        context: Arc<UnitContext>,
    ) -> ModbusResult<Self> {
        let bind_err = |e: std::io::Error| ModbusError::Bind {
            addr: config.bind_address.clone(),
            reason: e.to_string(),
        };

        let listener = TcpListener::bind(&config.bind_address).map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;

        // Non-blocking so the loop can check the stop signal
        listener.set_nonblocking(true).map_err(bind_err)?;

        info!(
            addr = %local_addr,
            bank_size = context.bank_size(),
            layout = ?context.layout(),
            identity = %config.identity,
            "Modbus TCP server listening"
        );

        let stop_signal = Arc::new(AtomicBool::new(false));
        let active_sessions = Arc::new(AtomicUsize::new(0));

        let thread_handle = {
            let stop = Arc::clone(&stop_signal);
            let context = Arc::clone(&context);
            let sessions = Arc::clone(&active_sessions);
            let poll_interval = config.poll_interval;
            thread::Builder::new()
                .name("mbtcp-accept".into())
                .spawn(move || Self::accept_loop(listener, stop, context, sessions, poll_interval))
                .map_err(bind_err)?
        };

        Ok(Self {
            local_addr,
            stop_signal,
            thread_handle: Some(thread_handle),
            context,
            identity: config.identity.clone(),
            active_sessions,
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared register memory.
    pub fn context(&self) -> &Arc<UnitContext> {
        &self.context
    }

    /// Identification metadata supplied at construction.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Number of connections currently being served.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Read one holding register.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if `address` is outside the bank.
    pub fn read_register(&self, address: u16) -> ModbusResult<u16> {
        let values = self.read_registers(address, 1)?;
        Ok(values[0])
    }

    /// Read consecutive holding registers.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    pub fn read_registers(&self, address: u16, count: u16) -> ModbusResult<Vec<u16>> {
        self.context
            .get(RegisterKind::HoldingRegisters, address, count)
    }

    /// Write one holding register.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if `address` is outside the bank.
    pub fn write_register(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write_registers(address, &[value])
    }

    /// Write consecutive holding registers, all or none.
    ///
    /// # Errors
    ///
    /// Returns [`ModbusError::IllegalDataAddress`] if the range leaves the bank.
    pub fn write_registers(&self, address: u16, values: &[u16]) -> ModbusResult<()> {
        self.context
            .set(RegisterKind::HoldingRegisters, address, values)
    }

    /// Stop the server and wait for the accept thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                warn!("Accept thread panicked");
            }
            info!(addr = %self.local_addr, "Modbus TCP server stopped");
        }
    }

    /// Server main loop.
    fn accept_loop(
        listener: TcpListener,
        stop_signal: Arc<AtomicBool>,
        context: Arc<UnitContext>,
        active_sessions: Arc<AtomicUsize>,
        poll_interval: Duration,
    ) {
        while !stop_signal.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let stop = Arc::clone(&stop_signal);
                    let context = Arc::clone(&context);
                    let sessions = Arc::clone(&active_sessions);

                    sessions.fetch_add(1, Ordering::SeqCst);
                    let spawned = thread::Builder::new()
                        .name(format!("mbtcp-session-{peer}"))
                        .spawn(move || {
                            Self::handle_connection(stream, peer, stop, context, poll_interval);
                            sessions.fetch_sub(1, Ordering::SeqCst);
                        });
                    if let Err(e) = spawned {
                        active_sessions.fetch_sub(1, Ordering::SeqCst);
                        warn!(%peer, error = %e, "Failed to spawn session thread");
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    thread::sleep(ACCEPT_BACKOFF);
                }
            }
        }
    }

    /// Handle a single client connection.
    fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        stop_signal: Arc<AtomicBool>,
        context: Arc<UnitContext>,
        poll_interval: Duration,
    ) {
        info!(%peer, "Client connected");

        // Accepted sockets may inherit the listener's non-blocking mode
        let configured = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(poll_interval)))
            .and_then(|()| stream.set_nodelay(true));
        if let Err(e) = configured {
            warn!(%peer, error = %e, "Failed to configure client socket");
            return;
        }

        let mut session = Session::new(stream, context, stop_signal);
        match session.run() {
            Ok(SessionEnd::PeerClosed) => {
                info!(%peer, requests = session.requests_served(), "Client disconnected");
            }
            Ok(SessionEnd::Stopped) => {
                debug!(%peer, "Session stopped by server shutdown");
            }
            Err(ModbusError::ConnectionClosed) => {
                info!(%peer, requests = session.requests_served(), "Client connection lost");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Session terminated");
            }
        }
    }
}

impl Drop for ModbusTcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mbtcp_common::config::RegisterLayout;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1:0".into(),
            poll_interval: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_server_starts_and_binds() {
        let server = ModbusTcpServer::bind(&local_config()).unwrap();
        let addr = server.local_addr();

        assert!(addr.port() > 0);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_eq!(server.active_sessions(), 0);

        server.stop();
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let first = ModbusTcpServer::bind(&local_config()).unwrap();
        let config = ServerConfig {
            bind_address: first.local_addr().to_string(),
            ..local_config()
        };

        let err = ModbusTcpServer::bind(&config).err().unwrap();
        assert!(matches!(err, ModbusError::Bind { .. }), "got {err}");
    }

    #[test]
    fn test_local_register_access() {
        let server = ModbusTcpServer::bind(&local_config()).unwrap();

        server.write_register(1, 1234).unwrap();
        assert_eq!(server.read_register(1).unwrap(), 1234);

        server.write_registers(10, &[1, 2, 3]).unwrap();
        assert_eq!(server.read_registers(10, 3).unwrap(), vec![1, 2, 3]);

        assert!(matches!(
            server.read_register(1024),
            Err(ModbusError::IllegalDataAddress { .. })
        ));
    }

    #[test]
    fn test_identity_and_shared_context() {
        let config = ServerConfig {
            layout: RegisterLayout::Aliased,
            bank_size: 32,
            ..local_config()
        };
        let context = Arc::new(UnitContext::from_config(&config));
        let server = ModbusTcpServer::bind_with_context(&config, Arc::clone(&context)).unwrap();

        assert_eq!(server.identity().product_name, "MockPLC 3000");
        assert_eq!(server.context().bank_size(), 32);

        context
            .set(RegisterKind::InputRegisters, 4, &[0xBEEF])
            .unwrap();
        assert_eq!(server.read_register(4).unwrap(), 0xBEEF);
    }
}
