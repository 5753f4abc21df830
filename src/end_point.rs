use crate::config::NetTaskConfig;
use crate::connection::{Connection, SendQueueFull, TimeoutAction};
use crate::segment::Segment;
use crate::socket::DatagramSocket;
use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// UDP can in theory carry up to 64KiB of payload; anything bigger is an application error
///  at a layer above this one.
const MAX_DATAGRAM_LEN: usize = 1 << 16;

/// This many receive errors in a row mean the socket is broken for good, which is fatal
///  for the driver. Isolated errors are retried after a pause.
const MAX_CONSECUTIVE_SOCKET_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds a well-known port and accepts connections from peers it has never seen.
    Server,
    /// Initiates exactly one conversation; segments from unknown peers are dropped once
    ///  the connection is established.
    Client,
}

/// What a [EndPoint::receive] call resolves to.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// The next in-order message from `host`.
    Message { host: String, message: Bytes },
    /// The connection to `host` is gone - either fully closed or timed out.
    Closed { host: String },
}

enum Command {
    Connect { host: String, addr: SocketAddr, done: oneshot::Sender<anyhow::Result<()>> },
    Send { host: String, message: Bytes, done: oneshot::Sender<anyhow::Result<()>> },
    Receive { reply: oneshot::Sender<anyhow::Result<Received>> },
    Close { done: oneshot::Sender<anyhow::Result<()>> },
}

/// EndPoint is the place where all other parts of the protocol come together: a single
///  driver task owns the UDP socket and all per-peer connection state, multiplexing any
///  number of peers over the one socket, while this handle offers the blocking API
///  (`connect` / `send` / `receive` / `close`) to arbitrary caller tasks.
///
/// Callers talk to the driver over a command channel, suspending on a per-request reply
///  channel until their request is satisfiable. Since only the driver task ever touches
///  the socket or a [Connection], there is no lock anywhere. If the driver dies (a
///  client's peer timing out is the one regular cause), the command channel closes and
///  every suspended and future call fails immediately rather than hanging.
#[derive(Clone)]
pub struct EndPoint {
    command_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
}

impl EndPoint {
    /// Creates a server endpoint bound to `bind_addr`, accepting any number of peers.
    pub async fn server(own_host: impl Into<String>, bind_addr: SocketAddr, config: Arc<NetTaskConfig>) -> anyhow::Result<EndPoint> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("bound server socket to {:?}", socket.local_addr()?);
        Self::with_socket(own_host, Role::Server, Arc::new(Arc::new(socket)), config)
    }

    /// Creates a client endpoint on an ephemeral port; call [EndPoint::connect] next.
    pub async fn client(own_host: impl Into<String>, config: Arc<NetTaskConfig>) -> anyhow::Result<EndPoint> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Self::with_socket(own_host, Role::Client, Arc::new(Arc::new(socket)), config)
    }

    /// Wires an endpoint onto an arbitrary [DatagramSocket] - the seam for tests that run
    ///  several endpoints over an in-process network.
    pub fn with_socket(
        own_host: impl Into<String>,
        role: Role,
        socket: Arc<dyn DatagramSocket>,
        config: Arc<NetTaskConfig>,
    ) -> anyhow::Result<EndPoint> {
        let own_host = own_host.into();
        if own_host.contains('\0') {
            // the host field is NUL-terminated on the wire
            bail!("host identity {:?} contains a NUL byte", own_host);
        }
        config.validate()?;

        let local_addr = socket.local_addr();
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_depth);

        let driver = Driver {
            own_host,
            role,
            config,
            socket,
            epoch: Instant::now(),
            connections: FxHashMap::default(),
            peer_addrs: FxHashMap::default(),
            notified_closed: FxHashSet::default(),
            pending_connects: FxHashMap::default(),
            parked_sends: VecDeque::default(),
            pending_receives: VecDeque::default(),
            pending_closes: Vec::default(),
            deliveries: VecDeque::default(),
            closing: false,
        };
        tokio::spawn(driver.run(command_rx));

        Ok(EndPoint { command_tx, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn request<T>(&self, command: Command, rx: oneshot::Receiver<anyhow::Result<T>>) -> anyhow::Result<T> {
        self.command_tx.send(command).await
            .map_err(|_| anyhow!("endpoint driver terminated"))?;
        rx.await
            .map_err(|_| anyhow!("endpoint driver terminated"))?
    }

    /// Opens a connection to a peer, suspending until the window handshake completed.
    ///  Connecting to an already-connected peer is a programming error and fails
    ///  immediately.
    pub async fn connect(&self, host: impl Into<String>, addr: SocketAddr) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.request(Command::Connect { host: host.into(), addr, done }, rx).await
    }

    /// Hands a message to the transport for reliable in-order delivery, suspending while
    ///  the local send queue for that peer is full.
    pub async fn send(&self, host: impl Into<String>, message: Bytes) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.request(Command::Send { host: host.into(), message, done }, rx).await
    }

    /// The next in-order message from any peer, or a notification that a peer's
    ///  connection is gone. Suspends until either is available.
    pub async fn receive(&self) -> anyhow::Result<Received> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Receive { reply }, rx).await
    }

    /// Runs the close handshake with every peer, suspending until all of them completed,
    ///  then terminates the driver. All other suspended calls fail at that point.
    pub async fn close(&self) -> anyhow::Result<()> {
        let (done, rx) = oneshot::channel();
        self.request(Command::Close { done }, rx).await
    }
}

/// The socket-owning driver. Everything in here runs on the single spawned task.
struct Driver {
    own_host: String,
    role: Role,
    config: Arc<NetTaskConfig>,
    socket: Arc<dyn DatagramSocket>,
    /// Basis of the protocol clock: wire timestamps are seconds since this instant.
    epoch: Instant,

    /// Peers are keyed by their self-declared identity, not by address ...
    connections: FxHashMap<String, Connection>,
    /// ... the address is looked up separately and refreshed from every inbound datagram,
    ///  so a peer may change addresses mid-connection.
    peer_addrs: FxHashMap<String, SocketAddr>,
    /// Hosts whose closure was already handed to a receiver. Fully closed connections
    ///  linger until their liveness timer expires so that retransmitted CLOSE segments
    ///  from the peer still get acknowledged instead of spawning ghost connections.
    notified_closed: FxHashSet<String>,

    pending_connects: FxHashMap<String, Vec<oneshot::Sender<anyhow::Result<()>>>>,
    parked_sends: VecDeque<(String, Bytes, oneshot::Sender<anyhow::Result<()>>)>,
    pending_receives: VecDeque<oneshot::Sender<anyhow::Result<Received>>>,
    pending_closes: Vec<oneshot::Sender<anyhow::Result<()>>>,
    deliveries: VecDeque<Received>,
    closing: bool,
}

impl Driver {
    async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        info!("starting endpoint driver for {:?} in {:?} role", self.own_host, self.role);

        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut consecutive_socket_errors = 0;

        let result: anyhow::Result<()> = loop {
            let idle = self.time_until_next_timeout();

            tokio::select! {
                received = socket.recv_datagram(&mut buf) => match received {
                    Ok((len, from)) => {
                        consecutive_socket_errors = 0;
                        let correlation_id = Uuid::new_v4();
                        let span = span!(Level::TRACE, "segment_received", ?correlation_id);
                        self.handle_datagram(&buf[..len], from).instrument(span).await;
                    }
                    Err(e) => {
                        consecutive_socket_errors += 1;
                        if consecutive_socket_errors >= MAX_CONSECUTIVE_SOCKET_ERRORS {
                            break Err(anyhow!("receive socket keeps failing: {}", e));
                        }
                        error!("socket error: {}", e);
                        time::sleep(self.config.min_timeout).await;
                        continue;
                    }
                },
                command = command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("all endpoint handles dropped - shutting down driver");
                        break Ok(());
                    }
                },
                _ = time::sleep(idle) => {
                    if let Err(e) = self.handle_timeouts().await {
                        break Err(e);
                    }
                }
            }

            if self.settle().await {
                break Ok(());
            }
        };

        match result {
            Ok(()) => debug!("endpoint driver for {:?} terminated", self.own_host),
            Err(e) => error!("endpoint driver for {:?} died: {}", self.own_host, e),
        }
        self.fail_all_waiters("endpoint driver terminated");
    }

    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// New peers are welcome on a server at any time; a client only accepts one while its
    ///  own connection attempt is not established yet (the peer may declare an identity
    ///  different from the name `connect` was called with).
    fn accepts_new_peers(&self) -> bool {
        match self.role {
            Role::Server => true,
            Role::Client => !self.connections.values().any(Connection::is_connected),
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let segment = match Segment::deser(&mut &*data) {
            Ok(segment) => segment,
            Err(e) => {
                warn!("received malformed datagram from {:?}, dropping: {}", from, e);
                return;
            }
        };
        trace!("received segment from {:?}: {:?}", from, segment);

        let host = segment.host.clone();
        let now = self.now();

        if !self.connections.contains_key(&host) {
            if !self.accepts_new_peers() {
                debug!("segment from unknown peer {:?} - dropping", host);
                return;
            }
            debug!("first contact from peer {:?} at {:?}", host, from);
            self.connections.insert(
                host.clone(),
                Connection::new(self.own_host.clone(), false, self.config.clone(), now),
            );
        }

        // the identity is authoritative; the address is just where the peer lives right now
        self.peer_addrs.insert(host.clone(), from);

        let replies = self.connections.get_mut(&host)
            .expect("connection was just looked up or inserted")
            .handle_received(segment, now);
        self.transmit_segments(&host, replies).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, addr, done } => {
                if self.closing {
                    let _ = done.send(Err(anyhow!("endpoint is closing")));
                    return;
                }
                if let Some(connection) = self.connections.get(&host) {
                    if connection.is_connected() {
                        let _ = done.send(Err(anyhow!("already connected to {:?}", host)));
                        return;
                    }
                }

                self.peer_addrs.insert(host.clone(), addr);
                let now = self.now();
                if !self.connections.contains_key(&host) {
                    let mut connection = Connection::new(self.own_host.clone(), true, self.config.clone(), now);
                    let connect_segment = connection.prepare_connect_segment(now);
                    self.connections.insert(host.clone(), connection);
                    self.transmit_segments(&host, vec![connect_segment]).await;
                }
                self.pending_connects.entry(host).or_default().push(done);
            }
            Command::Send { host, message, done } => {
                if self.closing {
                    let _ = done.send(Err(anyhow!("endpoint is closing")));
                    return;
                }
                let now = self.now();
                match self.connections.get_mut(&host) {
                    None => {
                        let _ = done.send(Err(anyhow!("not connected to {:?}", host)));
                    }
                    Some(connection) if connection.is_closing() => {
                        let _ = done.send(Err(anyhow!("connection to {:?} is closing", host)));
                    }
                    Some(connection) => match connection.encapsulate_for_sending(message.clone(), now) {
                        Ok(segments) => {
                            self.transmit_segments(&host, segments).await;
                            let _ = done.send(Ok(()));
                        }
                        Err(SendQueueFull) => {
                            trace!("send queue for {:?} is full - parking the send", host);
                            self.parked_sends.push_back((host, message, done));
                        }
                    },
                }
            }
            Command::Receive { reply } => {
                self.pending_receives.push_back(reply);
            }
            Command::Close { done } => {
                debug!("closing all connections");
                self.closing = true;
                self.pending_closes.push(done);
            }
        }
    }

    /// Services every connection's timers. A dead peer is removed on a server; on a
    ///  client it is fatal for the whole endpoint, which is the error returned here.
    async fn handle_timeouts(&mut self) -> anyhow::Result<()> {
        let now = self.now();

        let mut to_send = Vec::new();
        let mut dead = Vec::new();
        for (host, connection) in self.connections.iter_mut() {
            match connection.act_on_timeout(now) {
                TimeoutAction::Idle => {}
                TimeoutAction::Transmit(segment) => to_send.push((host.clone(), segment)),
                TimeoutAction::PeerDead => dead.push(host.clone()),
            }
        }

        for (host, segment) in to_send {
            self.transmit_segments(&host, vec![segment]).await;
        }

        for host in dead {
            let connection = self.connections.remove(&host)
                .expect("dead host was collected from the connection map");
            self.peer_addrs.remove(&host);

            if connection.is_closed() {
                // a fully closed connection that lingered for late retransmissions - its
                //  closure was already (or will be) delivered, nothing died here
                trace!("discarding lingering closed connection to {:?}", host);
                if !self.notified_closed.remove(&host) {
                    self.deliveries.push_back(Received::Closed { host });
                }
                continue;
            }

            match self.role {
                Role::Server => {
                    warn!("peer {:?} timed out - dropping the connection", host);
                    self.notified_closed.remove(&host);
                    self.deliveries.push_back(Received::Closed { host });
                }
                Role::Client => {
                    return Err(anyhow!("peer {:?} timed out", host));
                }
            }
        }
        Ok(())
    }

    /// Runs after every event: moves deliverable messages towards waiting receivers,
    ///  retries parked work whose predicate may have become true, and drives the close
    ///  handshake. Returns true once a requested close completed and the driver is done.
    async fn settle(&mut self) -> bool {
        let now = self.now();

        // drain newly contiguous messages out of the reorder buffers
        let mut to_send = Vec::new();
        for (host, connection) in self.connections.iter_mut() {
            let (messages, window_update) = connection.get_received_messages(now);
            for message in messages {
                self.deliveries.push_back(Received::Message { host: host.clone(), message });
            }
            if let Some(segment) = window_update {
                to_send.push((host.clone(), segment));
            }

            if connection.is_closed() && self.notified_closed.insert(host.clone()) {
                debug!("connection to {:?} fully closed", host);
                self.deliveries.push_back(Received::Closed { host: host.clone() });
            }
        }
        for (host, segment) in to_send {
            self.transmit_segments(&host, vec![segment]).await;
        }

        // ACKs may have drained send queues - retry parked sends in arrival order
        let mut still_parked = VecDeque::new();
        let mut to_send = Vec::new();
        let parked = std::mem::take(&mut self.parked_sends);
        for (host, message, done) in parked {
            match self.connections.get_mut(&host) {
                None => {
                    let _ = done.send(Err(anyhow!("connection to {:?} is gone", host)));
                }
                Some(connection) if connection.is_closing() => {
                    let _ = done.send(Err(anyhow!("connection to {:?} is closing", host)));
                }
                Some(connection) => match connection.encapsulate_for_sending(message.clone(), now) {
                    Ok(segments) => {
                        to_send.push((host.clone(), segments));
                        let _ = done.send(Ok(()));
                    }
                    // the queue is FIFO, so per-host ordering survives re-parking
                    Err(SendQueueFull) => still_parked.push_back((host, message, done)),
                },
            }
        }
        self.parked_sends = still_parked;
        for (host, segments) in to_send {
            self.transmit_segments(&host, segments).await;
        }

        // resolve connects whose handshake completed (or whose connection is gone)
        let connections = &self.connections;
        self.pending_connects.retain(|host, waiters| {
            match connections.get(host) {
                Some(connection) if connection.is_connected() => {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                    false
                }
                Some(connection) if connection.is_closing() => {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(Err(anyhow!("connection to {:?} closed during the handshake", host)));
                    }
                    false
                }
                Some(_) => true,
                None => {
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(Err(anyhow!("connection to {:?} is gone", host)));
                    }
                    false
                }
            }
        });

        // hand deliveries to waiting receivers
        while !self.deliveries.is_empty() {
            match self.pending_receives.pop_front() {
                None => break,
                Some(reply) => {
                    if reply.is_closed() {
                        // the caller gave up on this receive - keep the delivery for the next one
                        continue;
                    }
                    let delivery = self.deliveries.pop_front()
                        .expect("checked non-empty above");
                    let _ = reply.send(Ok(delivery));
                }
            }
        }

        // drive the close handshake: connections with drained send buffers close now,
        //  the rest retry on the next settle
        if self.closing {
            let mut closes = Vec::new();
            for (host, connection) in self.connections.iter_mut() {
                if let Some(segment) = connection.close(now) {
                    closes.push((host.clone(), segment));
                }
            }
            for (host, segment) in closes {
                self.transmit_segments(&host, vec![segment]).await;
            }

            if self.connections.values().all(Connection::is_closed) {
                debug!("all connections closed");
                for done in self.pending_closes.drain(..) {
                    let _ = done.send(Ok(()));
                }
                return true;
            }
        }
        false
    }

    /// The socket receive timeout for this iteration of the driver loop.
    fn time_until_next_timeout(&self) -> Duration {
        let now = self.now();
        self.connections.values()
            .map(|c| c.time_until_next_timeout(now))
            .min()
            .map(|d| d.min(self.config.poll_interval))
            .unwrap_or(self.config.poll_interval)
    }

    async fn transmit_segments(&self, host: &str, segments: Vec<Segment>) {
        if segments.is_empty() {
            return;
        }
        let Some(&addr) = self.peer_addrs.get(host) else {
            warn!("no known address for peer {:?} - dropping {} segments", host, segments.len());
            return;
        };

        for segment in segments {
            trace!("sending segment to {:?}: {:?}", host, segment);
            let mut buf = BytesMut::new();
            segment.ser(&mut buf);
            self.socket.send_datagram(addr, &buf).await;
        }
    }

    fn fail_all_waiters(&mut self, reason: &str) {
        for (_, waiters) in self.pending_connects.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(anyhow!("{}", reason)));
            }
        }
        for (_, _, done) in self.parked_sends.drain(..) {
            let _ = done.send(Err(anyhow!("{}", reason)));
        }
        for reply in self.pending_receives.drain(..) {
            let _ = reply.send(Err(anyhow!("{}", reason)));
        }
        for done in self.pending_closes.drain(..) {
            let _ = done.send(Err(anyhow!("{}", reason)));
        }
    }
}
