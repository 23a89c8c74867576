/**
 * Network related functionality
 *
 * The TURN session is synchronous and never touches a socket. This module
 * owns the socket, turns `TimerService` deadlines into tokio sleeps and feeds
 * received bytes back into the session, all from a single task.
 */
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    net::SocketAddr,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use slog::{debug, error, info, o, warn, Logger};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpStream, UdpSocket},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use crate::{
    config::ConnType,
    error::Error,
    transport::{TimerHandle, TimerService, Transport},
    turn::{AllocParams, TurnInfo, TurnObserver, TurnSession, TurnState},
    Context, Result,
};

/// Largest datagram accepted from the server.
const MAX_DATAGRAM: usize = 65536;

/// Upper bound on how long the loop sleeps when no timer is pending.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/**
 * Queues datagrams for a sender task sharing the socket with the receive
 * loop. A datagram the socket refuses is logged and dropped, the
 * retransmission timers cover the loss.
 */
pub struct UdpTransport {
    queue: UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>, logger: Logger) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(Vec<u8>, SocketAddr)>();
        tokio::spawn(async move {
            while let Some((datagram, dest)) = rx.recv().await {
                if let Err(e) = socket.send_to(&datagram, dest).await {
                    warn!(logger, "UDP send to {} failed: {}", dest, e);
                }
            }
        });
        Self { queue: tx }
    }
}

impl Transport for UdpTransport {
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        self.queue
            .send((bytes.to_vec(), dest))
            .map_err(|_| Error::Transport("UDP sender stopped".into()))
    }
}

/**
 * Queues frames for a writer task owning the write half of the connection.
 * The destination is ignored, everything goes to the connected server.
 */
#[derive(Default)]
pub struct TcpTransport {
    writer: RefCell<Option<UnboundedSender<Vec<u8>>>>,
}

impl TcpTransport {
    /**
     * Start the writer task for `stream` and return the read half.
     */
    fn attach(&self, stream: TcpStream, logger: Logger) -> OwnedReadHalf {
        let (reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    error!(logger, "TCP write failed: {}", e);
                    break;
                }
            }
        });
        *self.writer.borrow_mut() = Some(tx);
        reader
    }
}

impl Transport for TcpTransport {
    fn send(&self, bytes: &[u8], _dest: SocketAddr) -> Result<()> {
        match &*self.writer.borrow() {
            Some(tx) => tx
                .send(bytes.to_vec())
                .map_err(|_| Error::Transport("TCP connection closed".into())),
            None => Err(Error::Transport("TCP connection not established".into())),
        }
    }
}

/**
 * Timer bookkeeping for the event loop. The loop sleeps until
 * `next_deadline` and then pops expired timers one at a time, so a timer
 * cancelled by an earlier handler never fires.
 */
#[derive(Default)]
pub struct TokioTimers {
    next_id: Cell<u64>,
    deadlines: RefCell<BTreeMap<TimerHandle, Instant>>,
}

impl TokioTimers {
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.borrow().values().min().copied()
    }

    /**
     * Remove and return the earliest timer due at `now`. Ties go to the
     * timer scheduled first.
     */
    pub fn pop_expired(&self, now: Instant) -> Option<TimerHandle> {
        let mut deadlines = self.deadlines.borrow_mut();
        let handle = deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(handle, at)| (**at, **handle))
            .map(|(handle, _)| *handle)?;
        deadlines.remove(&handle);
        Some(handle)
    }
}

impl TimerService for TokioTimers {
    fn schedule(&self, delay: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_id.get() + 1);
        self.next_id.set(handle.0);
        self.deadlines
            .borrow_mut()
            .insert(handle, Instant::now() + delay);
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.deadlines.borrow_mut().remove(&handle);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/**
 * Looks up the addresses of a TURN server name.
 */
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, name: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system (`getaddrinfo`) through tokio.
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, name: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((name, port))
            .await
            .map_err(|e| Error::Resolve(format!("{}: {}", name, e)))?;
        Ok(addrs.collect())
    }
}

/// Requests the application can make of a running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    SetPermission(Vec<SocketAddr>),
    BindChannel(SocketAddr),
    SendTo(SocketAddr, Vec<u8>),
    Refresh(u32),
    Shutdown,
    Destroy,
}

enum Link {
    Udp(Arc<UdpSocket>),
    Tcp(OwnedReadHalf),
    Unconnected,
}

enum Received {
    Datagram(usize, SocketAddr),
    Stream(usize),
}

impl Link {
    async fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<Received> {
        match self {
            Link::Udp(socket) => {
                let (n, src) = socket.recv_from(buf).await?;
                Ok(Received::Datagram(n, src))
            }
            Link::Tcp(reader) => Ok(Received::Stream(reader.read(buf).await?)),
            Link::Unconnected => std::future::pending().await,
        }
    }
}

/**
 * Runs one TURN allocation against the configured server until the session
 * is destroyed.
 */
pub struct TurnClient {
    context: Arc<Context>,
    resolver: Box<dyn Resolver>,
}

impl TurnClient {
    pub fn new(context: &Arc<Context>) -> Self {
        Self {
            context: Arc::clone(context),
            resolver: Box::new(DnsResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    /**
     * Allocate on the configured server and serve the session.
     *
     * Over TCP the connection goes to the first resolved address, later
     * addresses are not tried.
     *
     * @param observer Receives state changes and relayed data.
     * @param commands Application requests, see `ClientCommand`.
     * @return The final session snapshot, or an error when the socket cannot
     *         be set up or the allocation cannot be started.
     */
    pub async fn run(
        &self,
        observer: Box<dyn TurnObserver>,
        mut commands: UnboundedReceiver<ClientCommand>,
    ) -> Result<TurnInfo> {
        let cfg = &self.context.config;
        let logger = self.context.logger.new(o!("server" => cfg.server.clone()));
        let timers = Rc::new(TokioTimers::default());
        let tcp = Rc::new(TcpTransport::default());

        let mut link = match cfg.transport {
            ConnType::Udp => Link::Udp(Arc::new(UdpSocket::bind(&cfg.bind_address).await?)),
            ConnType::Tcp => Link::Unconnected,
        };
        let transport: Rc<dyn Transport> = match &link {
            Link::Udp(socket) => Rc::new(UdpTransport::new(Arc::clone(socket), logger.clone())),
            _ => tcp.clone(),
        };

        let mut session = TurnSession::new(
            &self.context,
            cfg.transport,
            transport,
            timers.clone(),
            observer,
        );
        if let Some(credential) = cfg.credential() {
            session.set_credential(credential);
        }

        session.set_server(&cfg.server, cfg.server_port)?;
        if let Some((name, port)) = session.pending_resolution() {
            let name = name.to_string();
            debug!(logger, "Resolving {}:{}", name, port);
            let resolved = self.resolver.resolve(&name, port).await;
            session.on_server_resolved(resolved)?;
        }

        if session.state() == TurnState::Resolved {
            if let (ConnType::Tcp, Some(server)) = (cfg.transport, session.info().server) {
                match TcpStream::connect(server).await {
                    Ok(stream) => link = Link::Tcp(tcp.attach(stream, logger.clone())),
                    Err(e) => {
                        error!(logger, "Cannot connect to {}: {}", server, e);
                        session.destroy();
                        return Err(e.into());
                    }
                }
            }
            session.alloc(AllocParams::from(cfg))?;
        }

        info!(logger, "TURN client started over {}", cfg.transport);
        let mut rx_buf = vec![0u8; MAX_DATAGRAM];
        let mut stream_buf: Vec<u8> = Vec::new();
        let mut commands_open = true;

        while session.state() != TurnState::Destroying {
            let deadline = timers
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + IDLE_WAIT);

            tokio::select! {
                received = link.recv(&mut rx_buf) => match received {
                    Ok(Received::Datagram(n, src)) => {
                        if session.info().server == Some(src) {
                            session.on_rx_pkt(&rx_buf[..n]);
                        } else {
                            debug!(logger, "Ignoring {} bytes from {}", n, src);
                        }
                    }
                    Ok(Received::Stream(0)) => {
                        warn!(logger, "TURN server closed the connection");
                        session.destroy();
                    }
                    Ok(Received::Stream(n)) => {
                        stream_buf.extend_from_slice(&rx_buf[..n]);
                        loop {
                            let consumed = session.on_rx_pkt(&stream_buf);
                            if consumed == 0 {
                                break;
                            }
                            stream_buf.drain(..consumed);
                        }
                    }
                    Err(e) => {
                        error!(logger, "Receive failed: {}", e);
                        session.destroy();
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    while let Some(handle) = timers.pop_expired(Instant::now()) {
                        session.on_timer(handle);
                    }
                }
                command = commands.recv(), if commands_open => match command {
                    Some(command) => Self::apply(&mut session, command, &logger),
                    None => commands_open = false,
                },
            }
        }

        let info = session.info();
        info!(logger, "TURN client finished"; "last_error" => ?info.last_error);
        Ok(info)
    }

    fn apply(session: &mut TurnSession, command: ClientCommand, logger: &Logger) {
        let result = match &command {
            ClientCommand::SetPermission(peers) => session.set_perm(peers),
            ClientCommand::BindChannel(peer) => session.bind_channel(*peer).map(|_| ()),
            ClientCommand::SendTo(peer, payload) => session.send_to(*peer, payload),
            ClientCommand::Refresh(lifetime) => session.refresh(*lifetime),
            ClientCommand::Shutdown => session.shutdown(),
            ClientCommand::Destroy => {
                session.destroy();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(logger, "{:?} failed: {}", command, e);
        }
    }
}
