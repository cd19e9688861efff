//! Connection Registry
//!
//! [`NetworkHandler`] owns the bound UDP socket. It demultiplexes every
//! received datagram to a connection by source address, accepts unknown
//! peers when its role allows, drives periodic connection updates and tears
//! down connections that asked to be closed.

use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tether_io::{Clock, DatagramSocket, SocketError, SystemClock};
use tether_protocol::packet::MAX_DATAGRAM_SIZE;
use tether_protocol::{
    Connection, ConnectionConfig, ConnectionError, ConnectionId, MessageHandler, Restriction, Side,
    Transport,
};
use thiserror::Error;

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Cannot resolve address: {0}")]
    Resolve(String),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Network handler is already running")]
    AlreadyRunning,

    #[error("Network handler has been shut down")]
    ShutDown,
}

/// What the local process is in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRole {
    /// Only opens connections
    Client,
    /// Accepts connections from any peer
    Server,
    /// Accepts connections and coordinates servers
    Master,
}

impl NetworkRole {
    /// Whether unknown peers get a new connection
    pub fn accepts_inbound(self) -> bool {
        matches!(self, NetworkRole::Server | NetworkRole::Master)
    }
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Local address to bind
    pub bind: SocketAddr,
    pub role: NetworkRole,
    /// Port used when a host string names none
    pub default_port: u16,
    /// Period of the update thread
    pub update_interval: Duration,
    /// Socket read timeout, bounding how long shutdown waits on the receive thread
    pub receive_timeout: Duration,
    /// Kernel receive buffer size, system default when unset
    pub recv_buffer_size: Option<usize>,
    /// Settings for every connection this registry creates
    pub connection: ConnectionConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            role: NetworkRole::Client,
            default_port: 9000,
            update_interval: Duration::from_millis(50),
            receive_timeout: Duration::from_millis(100),
            recv_buffer_size: None,
            connection: ConnectionConfig::default(),
        }
    }
}

/// Resolve `"host[:port]"`, using `default_port` when no port is given
pub fn resolve_address(address: &str, default_port: u16) -> Result<SocketAddr, NetworkError> {
    let address = address.trim();

    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let resolved = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| NetworkError::Resolve(address.to_string()))?;
            (host, port).to_socket_addrs()
        }
        None => (address, default_port).to_socket_addrs(),
    };

    resolved
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| NetworkError::Resolve(address.to_string()))
}

/// Socket writer and termination queue shared with every connection
struct SocketTransport {
    socket: Mutex<DatagramSocket>,
    terminations: Mutex<Vec<ConnectionId>>,
}

impl Transport for SocketTransport {
    fn send_datagram(&self, target: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let socket = self.socket.lock();
        match socket.send_to(datagram, target) {
            Ok(_) => Ok(()),
            Err(SocketError::Io(e)) => Err(e),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other)),
        }
    }

    fn request_close(&self, connection: ConnectionId) {
        let mut queue = self.terminations.lock();
        if !queue.contains(&connection) {
            queue.push(connection);
        }
    }
}

/// Live connection to `addr`; closed ones are only waiting for removal
fn live_connection(connections: &[Arc<Connection>], addr: SocketAddr) -> Option<Arc<Connection>> {
    connections
        .iter()
        .find(|conn| conn.remote_addr() == addr && conn.is_valid_for_send())
        .cloned()
}

/// Owner of one UDP socket and all connections over it
///
/// The worker threads only hold weak references, so dropping the last
/// handle shuts the network down like [`shutdown`](Self::shutdown).
pub struct NetworkHandler {
    config: NetworkConfig,
    local_addr: SocketAddr,
    reader: DatagramSocket,
    transport: Arc<SocketTransport>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn MessageHandler>,
    connections: RwLock<Vec<Arc<Connection>>>,
    next_id: AtomicU32,
    expect_console: AtomicBool,
    running: AtomicBool,
    shut_down: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkHandler {
    /// Bind the socket; no thread runs until [`start`](Self::start)
    pub fn bind(
        config: NetworkConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<Self>, NetworkError> {
        Self::with_clock(config, handler, Arc::new(SystemClock))
    }

    /// Bind the socket with a custom clock for every connection
    pub fn with_clock(
        config: NetworkConfig,
        handler: Arc<dyn MessageHandler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, NetworkError> {
        let reader = DatagramSocket::bind(config.bind, config.receive_timeout)?;
        if let Some(size) = config.recv_buffer_size {
            reader.set_recv_buffer_size(size)?;
        }
        let writer = reader.try_clone()?;
        let local_addr = reader.local_addr()?;

        tracing::info!("Network handler bound to {} as {:?}", local_addr, config.role);

        Ok(Arc::new(NetworkHandler {
            config,
            local_addr,
            reader,
            transport: Arc::new(SocketTransport {
                socket: Mutex::new(writer),
                terminations: Mutex::new(Vec::new()),
            }),
            clock,
            handler,
            connections: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(1),
            expect_console: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn role(&self) -> NetworkRole {
        self.config.role
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Open a connection to `"host[:port]"`
    pub fn open_connection(&self, address: &str) -> Result<Arc<Connection>, NetworkError> {
        self.ensure_open()?;
        let addr = resolve_address(address, self.config.default_port)?;
        self.open_connection_to(addr)
    }

    /// Open a connection to `addr` and send the `Connect` request
    ///
    /// Returns the existing connection if one to `addr` is already active.
    pub fn open_connection_to(&self, addr: SocketAddr) -> Result<Arc<Connection>, NetworkError> {
        self.ensure_open()?;
        let conn = match self.register_initiator(addr) {
            (conn, false) => {
                tracing::debug!("Reusing connection {} to {}", conn.id(), addr);
                return Ok(conn);
            }
            (conn, true) => conn,
        };

        if let Err(e) = conn.init() {
            self.discard(&conn);
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Open a connection to `addr` that punches through NAT before connecting
    pub fn open_punchthrough_to(&self, addr: SocketAddr) -> Result<Arc<Connection>, NetworkError> {
        self.ensure_open()?;
        let conn = match self.register_initiator(addr) {
            (conn, false) => return Ok(conn),
            (conn, true) => conn,
        };

        if let Err(e) = conn.start_punchthrough() {
            self.discard(&conn);
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Live connection to `addr`, or a new initiator registered under the
    /// same write guard; the flag tells whether it is new
    fn register_initiator(&self, addr: SocketAddr) -> (Arc<Connection>, bool) {
        let mut connections = self.connections.write();
        if let Some(existing) = live_connection(&connections, addr) {
            return (existing, false);
        }

        let conn = self.create_connection(addr, Side::Initiator);
        connections.push(Arc::clone(&conn));
        (conn, true)
    }

    fn discard(&self, conn: &Arc<Connection>) {
        self.connections
            .write()
            .retain(|other| !Arc::ptr_eq(other, conn));
        conn.release();
    }

    /// Accept the next unknown peer as a restricted remote-console connection
    pub fn expect_console_connection(&self) {
        if self.config.role.accepts_inbound() {
            tracing::warn!(
                "Role {:?} accepts every peer; the console connection will not be restricted",
                self.config.role
            );
        }
        self.expect_console.store(true, Ordering::Release);
    }

    /// Active connection whose peer is `addr`
    pub fn find_connection(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        live_connection(&self.connections.read(), addr)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|conn| conn.id() == id)
            .cloned()
    }

    /// Snapshot of the active connections
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Route one received datagram
    pub fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        // A closed connection still swallows its peer's traffic until removed
        let known = {
            let connections = self.connections.read();
            live_connection(&connections, from).or_else(|| {
                connections
                    .iter()
                    .find(|conn| conn.remote_addr() == from)
                    .cloned()
            })
        };
        if let Some(conn) = known {
            conn.handle_datagram(datagram);
            return;
        }

        if self.shut_down.load(Ordering::Acquire) {
            return;
        }

        let restriction = if self.config.role.accepts_inbound() {
            Restriction::None
        } else if self.expect_console.swap(false, Ordering::AcqRel) {
            Restriction::ReceiveRemoteConsole
        } else {
            tracing::debug!("Ignoring datagram from unknown peer {}", from);
            return;
        };

        let conn = {
            let mut connections = self.connections.write();
            match live_connection(&connections, from) {
                Some(existing) => existing,
                None => {
                    let conn = self.create_connection(from, Side::Acceptor);
                    conn.set_restriction(restriction);
                    if let Err(e) = conn.init() {
                        tracing::error!("Failed to accept connection from {}: {}", from, e);
                        return;
                    }
                    tracing::info!("Accepted connection {} from {}", conn.id(), from);
                    connections.push(Arc::clone(&conn));
                    conn
                }
            }
        };
        conn.handle_datagram(datagram);
    }

    /// Close the connection to `addr`, if any; it is removed on the next update
    pub fn safely_close_connection_to(&self, addr: SocketAddr) -> bool {
        match self.find_connection(addr) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Release and forget every connection that requested termination
    pub fn remove_closed_connections(&self) {
        let ids: Vec<ConnectionId> = std::mem::take(&mut *self.transport.terminations.lock());
        if ids.is_empty() {
            return;
        }

        let removed: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write();
            let (removed, kept): (Vec<_>, Vec<_>) = connections
                .drain(..)
                .partition(|conn| ids.contains(&conn.id()));
            *connections = kept;
            removed
        };

        for conn in removed {
            conn.release();
            tracing::info!("Removed connection {} to {}", conn.id(), conn.remote_addr());
        }
    }

    /// One update pass over every connection
    pub fn update_all(&self) {
        for conn in self.connections() {
            conn.update();
        }
        self.remove_closed_connections();
    }

    /// Spawn the receive and update threads
    pub fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        self.ensure_open()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetworkError::AlreadyRunning);
        }

        let receiver = Arc::downgrade(self);
        let updater = Arc::downgrade(self);
        let local_addr = self.local_addr;
        let interval = self.config.update_interval;
        let mut threads = self.threads.lock();
        threads.push(thread::spawn(move || Self::receive_loop(receiver, local_addr)));
        threads.push(thread::spawn(move || {
            Self::update_loop(updater, interval, local_addr)
        }));

        tracing::info!("Network handler on {} started", self.local_addr);
        Ok(())
    }

    /// Stop the threads and release every connection
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);

        let current = thread::current().id();
        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Network thread panicked");
            }
        }

        let connections: Vec<Arc<Connection>> = self.connections.write().drain(..).collect();
        for conn in connections {
            conn.release();
        }
        self.transport.terminations.lock().clear();

        tracing::info!("Network handler on {} shut down", self.local_addr);
    }

    fn ensure_open(&self) -> Result<(), NetworkError> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(NetworkError::ShutDown)
        } else {
            Ok(())
        }
    }

    fn create_connection(&self, addr: SocketAddr, side: Side) -> Arc<Connection> {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Connection::new(
            id,
            addr,
            side,
            self.config.connection.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::clone(&self.handler),
        )
    }

    fn receive_loop(network: Weak<Self>, local_addr: SocketAddr) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        while let Some(this) = network.upgrade() {
            if !this.running.load(Ordering::Acquire) {
                break;
            }
            match this.reader.recv_from(&mut buffer) {
                Ok(Some((len, from))) => this.handle_datagram(from, &buffer[..len]),
                Ok(None) => {}
                Err(e) => {
                    if !this.running.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::error!("Receive failed on {}: {}", local_addr, e);
                    drop(this);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        tracing::debug!("Receive loop on {} stopped", local_addr);
    }

    fn update_loop(network: Weak<Self>, interval: Duration, local_addr: SocketAddr) {
        loop {
            let started = Instant::now();
            match network.upgrade() {
                Some(this) if this.running.load(Ordering::Acquire) => this.update_all(),
                _ => break,
            }

            let elapsed = started.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }

        tracing::debug!("Update loop on {} stopped", local_addr);
    }
}

impl Drop for NetworkHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
