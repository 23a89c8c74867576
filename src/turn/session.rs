/**
 * TURN client session: drives an allocation through its lifecycle on top of
 * a STUN session and relays application data through it.
 *
 * The session is sans-IO. The host feeds it inbound packets (`on_rx_pkt`),
 * expired timers (`on_timer`) and resolution results (`on_server_resolved`),
 * and the session reports back through a `TurnObserver`.
 */
use std::{
    cell::Cell,
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::{Duration, Instant},
};

use slog::{debug, info, o, warn, Logger};

use super::{
    encode_channel_data, frame_length, is_channel_data, parse_channel_data, ChannelNumbers,
    ConnType, TurnState, CHANNEL_LIFETIME, PERMISSION_LIFETIME, REFRESH_MARGIN, TRANSPORT_UDP,
};
use crate::{
    auth::{AuthKind, Credential},
    config::Settings,
    error::Error,
    stun::{
        attribute_type::{
            ATTR_ALTERNATE_SERVER, ATTR_XOR_MAPPED_ADDRESS, ATTR_XOR_PEER_ADDRESS,
            ATTR_XOR_RELAYED_ADDRESS,
        },
        error_code, method, Attribute, Completion, SendOptions, StunConfig, StunHandler,
        StunMessage, StunSession,
    },
    transport::{TimerHandle, TimerService, Transport},
    Context, Result,
};

/// Lifetime assumed when the server grants one without saying how long.
const DEFAULT_LIFETIME: u32 = 600;

/// How many 300 (Try Alternate) redirects an allocation follows.
const MAX_REDIRECTS: u32 = 3;

/// The operation an `on_operation_failed` report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Resolve,
    Allocate,
    Refresh,
    CreatePermission,
    ChannelBind,
}

/**
 * Application side of a TURN session. Called synchronously while the session
 * processes an event; use a `SessionHandle` to tear the session down from
 * inside a callback.
 */
pub trait TurnObserver {
    fn on_state_changed(&mut self, old: TurnState, new: TurnState);

    /// Data relayed from `peer`, via a Data indication or a bound channel.
    fn on_rx_data(&mut self, peer: SocketAddr, payload: &[u8]);

    fn on_channel_bound(&mut self, _peer: SocketAddr, _channel: u16) {}

    /// An operation failed without necessarily ending the session.
    fn on_operation_failed(&mut self, _op: Operation, _error: &Error) {}
}

#[derive(Debug, Default)]
struct TeardownFlags {
    shutdown: Cell<bool>,
    destroy: Cell<bool>,
}

/**
 * Lets observer code ask for shutdown or destruction. The request is carried
 * out from a zero-delay timer, after the current callback has returned.
 */
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    flags: Rc<TeardownFlags>,
}

impl SessionHandle {
    pub fn request_shutdown(&self) {
        self.flags.shutdown.set(true);
    }

    pub fn request_destroy(&self) {
        self.flags.destroy.set(true);
    }

    fn is_requested(&self) -> bool {
        self.flags.shutdown.get() || self.flags.destroy.get()
    }

    fn take(&self) -> (bool, bool) {
        (self.flags.shutdown.take(), self.flags.destroy.take())
    }
}

/**
 * Allocate request parameters.
 *
 * Fields:
 * - `lifetime`: Requested lifetime in seconds, `None` for the server default.
 * - `bandwidth`: Requested bandwidth (BANDWIDTH attribute), if any.
 * - `dont_fragment`: Ask the server to set DF on relayed packets.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocParams {
    pub lifetime: Option<u32>,
    pub bandwidth: Option<u32>,
    pub dont_fragment: bool,
}

impl From<&Settings> for AllocParams {
    fn from(cfg: &Settings) -> Self {
        Self {
            lifetime: Some(cfg.lifetime).filter(|l| *l > 0),
            ..Self::default()
        }
    }
}

/// Snapshot of a session returned by `TurnSession::info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnInfo {
    pub state: TurnState,
    pub conn_type: ConnType,
    pub server: Option<SocketAddr>,
    pub mapped_addr: Option<SocketAddr>,
    pub relay_addr: Option<SocketAddr>,
    pub lifetime: Option<Duration>,
    pub last_error: Option<Error>,
}

#[derive(Debug, Clone)]
pub(crate) enum Request {
    Allocate,
    Refresh { lifetime: u32 },
    CreatePermission { peers: Vec<SocketAddr> },
    ChannelBind { peer: SocketAddr, channel: u16 },
}

impl Request {
    fn method(&self) -> u16 {
        match self {
            Request::Allocate => method::ALLOCATE,
            Request::Refresh { .. } => method::REFRESH,
            Request::CreatePermission { .. } => method::CREATE_PERMISSION,
            Request::ChannelBind { .. } => method::CHANNEL_BIND,
        }
    }

    fn attributes(&self, params: &AllocParams) -> Vec<Attribute> {
        match self {
            Request::Allocate => {
                let mut attrs = vec![Attribute::RequestedTransport(TRANSPORT_UDP)];
                if let Some(lifetime) = params.lifetime {
                    attrs.push(Attribute::Lifetime(lifetime));
                }
                if let Some(bandwidth) = params.bandwidth {
                    attrs.push(Attribute::Bandwidth(bandwidth));
                }
                if params.dont_fragment {
                    attrs.push(Attribute::DontFragment);
                }
                attrs
            }
            Request::Refresh { lifetime } => vec![Attribute::Lifetime(*lifetime)],
            Request::CreatePermission { peers } => {
                peers.iter().map(|p| Attribute::XorPeerAddress(*p)).collect()
            }
            Request::ChannelBind { peer, channel } => vec![
                Attribute::ChannelNumber(*channel),
                Attribute::XorPeerAddress(*peer),
            ],
        }
    }
}

/// Tag carried by every request the TURN session sends through its STUN session.
#[derive(Debug, Clone)]
pub(crate) struct RequestTag {
    request: Request,
    challenged: bool,
}

// Collects what the STUN session reports, processed once it has returned.
#[derive(Default)]
struct Events {
    completions: Vec<Completion<RequestTag>>,
    data: Vec<(SocketAddr, Vec<u8>)>,
    ignored: usize,
}

impl StunHandler<RequestTag> for Events {
    fn on_request_complete(&mut self, completion: Completion<RequestTag>) {
        self.completions.push(completion);
    }

    fn on_rx_request(&mut self, _request: StunMessage, _src: SocketAddr) {
        self.ignored += 1;
    }

    fn on_rx_indication(&mut self, indication: StunMessage, _src: SocketAddr) {
        if indication.method != method::DATA {
            self.ignored += 1;
            return;
        }
        match (indication.address(ATTR_XOR_PEER_ADDRESS), indication.data()) {
            (Some(peer), Some(data)) => self.data.push((peer, data.to_vec())),
            _ => self.ignored += 1,
        }
    }
}

#[derive(Debug)]
struct ChannelBinding {
    number: u16,
    bound: bool,
    refreshing: bool,
    expiry: Option<Instant>,
}

#[derive(Debug)]
struct Permission {
    pending: bool,
    expiry: Option<Instant>,
}

pub struct TurnSession {
    logger: Logger,
    conn_type: ConnType,
    stun: StunSession<RequestTag>,
    transport: Rc<dyn Transport>,
    timers: Rc<dyn TimerService>,
    observer: Box<dyn TurnObserver>,
    handle: SessionHandle,
    state: TurnState,

    server_name: Option<String>,
    default_port: u16,
    servers: Vec<SocketAddr>,
    server_index: usize,
    server: Option<SocketAddr>,
    redirects: u32,

    pending_alloc: Option<AllocParams>,
    pending_destroy: bool,
    alloc_params: AllocParams,
    mapped_addr: Option<SocketAddr>,
    relay_addr: Option<SocketAddr>,
    lifetime: u32,
    expiry: Option<Instant>,
    last_error: Option<Error>,
    last_tx: Option<Instant>,
    keep_alive: Duration,

    refresh_timer: Option<TimerHandle>,
    keep_alive_timer: Option<TimerHandle>,
    teardown_timer: Option<TimerHandle>,

    channels: HashMap<SocketAddr, ChannelBinding>,
    channel_peers: HashMap<u16, SocketAddr>,
    channel_numbers: ChannelNumbers,
    permissions: HashMap<IpAddr, Permission>,
}

impl TurnSession {
    /**
     * Create a session in state `Null`.
     *
     * @param context Settings (RTO, SOFTWARE, keep-alive, ...) and the logger.
     * @param conn_type How the host talks to the TURN server.
     * @param transport Outbound packet sink towards the TURN server.
     * @param timers Timer service, expiries come back through `on_timer`.
     * @param observer Receives state changes and relayed data.
     */
    pub fn new(
        context: &Context,
        conn_type: ConnType,
        transport: Rc<dyn Transport>,
        timers: Rc<dyn TimerService>,
        observer: Box<dyn TurnObserver>,
    ) -> Self {
        let logger = context
            .logger
            .new(o!("turn" => conn_type.as_str()));
        let stun = StunSession::new(
            StunConfig::from(&context.config),
            &logger,
            transport.clone(),
            timers.clone(),
        );
        Self {
            logger,
            conn_type,
            stun,
            transport,
            timers,
            observer,
            handle: SessionHandle::default(),
            state: TurnState::Null,
            server_name: None,
            default_port: 0,
            servers: Vec::new(),
            server_index: 0,
            server: None,
            redirects: 0,
            pending_alloc: None,
            pending_destroy: false,
            alloc_params: AllocParams::default(),
            mapped_addr: None,
            relay_addr: None,
            lifetime: 0,
            expiry: None,
            last_error: None,
            last_tx: None,
            keep_alive: Duration::from_secs(context.config.keep_alive_secs.max(1)),
            refresh_timer: None,
            keep_alive_timer: None,
            teardown_timer: None,
            channels: HashMap::new(),
            channel_peers: HashMap::new(),
            channel_numbers: ChannelNumbers::default(),
            permissions: HashMap::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn conn_type(&self) -> ConnType {
        self.conn_type
    }

    /**
     * Long-term credential used for every request. Realm and nonce are taken
     * from the server challenge.
     */
    pub fn set_credential(&mut self, credential: Credential) {
        self.stun.set_credential(AuthKind::LongTerm, Some(credential));
    }

    pub fn info(&self) -> TurnInfo {
        let now = self.timers.now();
        TurnInfo {
            state: self.state,
            conn_type: self.conn_type,
            server: self.server,
            mapped_addr: self.mapped_addr,
            relay_addr: self.relay_addr,
            lifetime: self.expiry.map(|e| e.saturating_duration_since(now)),
            last_error: self.last_error.clone(),
        }
    }

    /// Channel bound to `peer`, once the server has confirmed the binding.
    pub fn channel_for(&self, peer: &SocketAddr) -> Option<u16> {
        self.channels
            .get(peer)
            .filter(|b| b.bound)
            .map(|b| b.number)
    }

    /// Whether the server has confirmed a permission for `ip`.
    pub fn has_permission(&self, ip: &IpAddr) -> bool {
        self.permissions
            .get(ip)
            .map_or(false, |p| p.expiry.is_some())
    }

    /**
     * Set the TURN server. An IP literal (with or without port) resolves at
     * once, a name leaves the session in `Resolving` until the host reports
     * the lookup through `on_server_resolved`.
     */
    pub fn set_server(&mut self, domain: &str, default_port: u16) -> Result<()> {
        if self.state != TurnState::Null {
            return Err(Error::InvalidOperation("server is already set"));
        }
        self.server_name = Some(domain.to_string());
        self.default_port = default_port;
        self.set_state(TurnState::Resolving);

        if let Ok(addr) = domain.parse::<SocketAddr>() {
            return self.on_server_resolved(Ok(vec![addr]));
        }
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return self.on_server_resolved(Ok(vec![SocketAddr::new(ip, default_port)]));
        }
        Ok(())
    }

    /// The name and default port still waiting for resolution.
    pub fn pending_resolution(&self) -> Option<(&str, u16)> {
        match (&self.server_name, self.state) {
            (Some(name), TurnState::Resolving) => Some((name.as_str(), self.default_port)),
            _ => None,
        }
    }

    /**
     * Complete resolution. Addresses are tried in order when an Allocate
     * times out. An allocation requested while resolving starts now.
     */
    pub fn on_server_resolved(&mut self, result: Result<Vec<SocketAddr>>) -> Result<()> {
        if self.state != TurnState::Resolving {
            return Err(Error::InvalidOperation("no resolution in progress"));
        }
        match result {
            Ok(addrs) if !addrs.is_empty() => {
                info!(self.logger, "TURN server resolved to {:?}", addrs);
                self.server = Some(addrs[0]);
                self.servers = addrs;
                self.server_index = 0;
                self.set_state(TurnState::Resolved);
                if let Some(params) = self.pending_alloc.take() {
                    if let Err(e) = self.start_allocation(params) {
                        debug!(self.logger, "Deferred allocation failed: {}", e);
                    }
                }
            }
            other => {
                let error = match other {
                    Err(e) => e,
                    Ok(_) => Error::Resolve("no addresses found".into()),
                };
                warn!(self.logger, "Cannot resolve TURN server: {}", error);
                self.last_error = Some(error.clone());
                self.observer.on_operation_failed(Operation::Resolve, &error);
                self.set_state(TurnState::Deallocated);
            }
        }
        self.check_handle();
        Ok(())
    }

    /**
     * Request an allocation. Valid once in `Resolved`, or in `Resolving` where
     * the request is held until the server address is known.
     */
    pub fn alloc(&mut self, params: AllocParams) -> Result<()> {
        match self.state {
            TurnState::Resolving if self.pending_alloc.is_none() => {
                self.pending_alloc = Some(params);
                Ok(())
            }
            TurnState::Resolved => self.start_allocation(params),
            _ => Err(Error::InvalidOperation(
                "alloc needs a resolved server and no allocation yet",
            )),
        }
    }

    fn start_allocation(&mut self, params: AllocParams) -> Result<()> {
        self.alloc_params = params;
        self.set_state(TurnState::Allocating);
        if let Err(e) = self.send_request(Request::Allocate, false) {
            self.fail_allocation(e.clone());
            return Err(e);
        }
        Ok(())
    }

    /**
     * Refresh the allocation with a new lifetime. A lifetime of zero
     * deallocates, the same as `shutdown`.
     */
    pub fn refresh(&mut self, lifetime: u32) -> Result<()> {
        if lifetime == 0 {
            return self.shutdown();
        }
        if self.state != TurnState::Ready {
            return Err(Error::InvalidOperation("refresh needs an allocation"));
        }
        let result = self.send_request(Request::Refresh { lifetime }, false);
        if let Err(e) = &result {
            self.on_send_error(e);
        }
        result
    }

    /**
     * Install permissions for the IP addresses of `peers` with one
     * CreatePermission request.
     */
    pub fn set_perm(&mut self, peers: &[SocketAddr]) -> Result<()> {
        if self.state != TurnState::Ready {
            return Err(Error::InvalidOperation("set_perm needs an allocation"));
        }
        if peers.is_empty() {
            return Err(Error::InvalidOperation("no peers given"));
        }
        for peer in peers {
            self.permissions
                .entry(peer.ip())
                .or_insert(Permission {
                    pending: true,
                    expiry: None,
                })
                .pending = true;
        }
        let result = self.send_request(
            Request::CreatePermission {
                peers: peers.to_vec(),
            },
            false,
        );
        if let Err(e) = &result {
            self.drop_unconfirmed_permissions(peers);
            self.on_send_error(e);
        }
        result
    }

    /**
     * Bind a channel to `peer`. While a binding for the peer exists, pending
     * or confirmed, its number is returned and nothing is sent.
     *
     * @return The channel number.
     */
    pub fn bind_channel(&mut self, peer: SocketAddr) -> Result<u16> {
        if self.state != TurnState::Ready {
            return Err(Error::InvalidOperation("bind_channel needs an allocation"));
        }
        if let Some(binding) = self.channels.get(&peer) {
            return Ok(binding.number);
        }

        let now = self.timers.now();
        let channel_peers = &self.channel_peers;
        let channel = self
            .channel_numbers
            .allocate(|ch| channel_peers.contains_key(&ch), now)
            .ok_or(Error::InvalidOperation("no free channel number"))?;

        self.channels.insert(
            peer,
            ChannelBinding {
                number: channel,
                bound: false,
                refreshing: true,
                expiry: None,
            },
        );
        self.channel_peers.insert(channel, peer);
        self.permissions.entry(peer.ip()).or_insert(Permission {
            pending: true,
            expiry: None,
        });

        if let Err(e) = self.send_request(Request::ChannelBind { peer, channel }, false) {
            self.channels.remove(&peer);
            self.channel_peers.remove(&channel);
            self.drop_unconfirmed_permissions(&[peer]);
            self.on_send_error(&e);
            return Err(e);
        }
        debug!(self.logger, "Binding channel 0x{:04X} to {}", channel, peer);
        Ok(channel)
    }

    /**
     * Relay `payload` to `peer`: as ChannelData when a channel is bound,
     * otherwise as a Send indication (after requesting a permission for a
     * peer that has none).
     */
    pub fn send_to(&mut self, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        if self.state != TurnState::Ready {
            return Err(Error::InvalidOperation("send_to needs an allocation"));
        }
        let server = self
            .server
            .ok_or(Error::InvalidOperation("no server address"))?;

        let result = match self.channel_for(&peer) {
            Some(channel) => encode_channel_data(channel, payload)
                .and_then(|frame| self.transport.send(&frame, server)),
            None => {
                let permitted = if self.permissions.contains_key(&peer.ip()) {
                    Ok(())
                } else {
                    self.set_perm(&[peer])
                };
                match permitted {
                    Ok(()) => {
                        let mut tx = self.stun.create_indication(method::SEND);
                        tx.message.add_attribute(Attribute::XorPeerAddress(peer));
                        tx.message.add_attribute(Attribute::Data(payload.to_vec()));
                        self.stun
                            .send(tx, &Self::unauthenticated(server))
                            .map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Ok(()) => {
                self.last_tx = Some(self.timers.now());
                Ok(())
            }
            Err(e) => {
                self.on_send_error(&e);
                Err(e)
            }
        }
    }

    /**
     * Process bytes received from the TURN server. Over TCP `bytes` may hold
     * a partial frame or several frames.
     *
     * @return Bytes consumed: one whole datagram over UDP, the first complete
     *         frame over TCP, or 0 when that frame is still incomplete.
     */
    pub fn on_rx_pkt(&mut self, bytes: &[u8]) -> usize {
        let stream = self.conn_type == ConnType::Tcp;
        let consumed = match frame_length(bytes) {
            Some(length) if stream && bytes.len() < length => return 0,
            Some(length) if stream => length,
            None if stream => return 0,
            _ => bytes.len(),
        };
        if self.state == TurnState::Destroying {
            return consumed;
        }

        let frame = &bytes[..consumed];
        if is_channel_data(frame) {
            self.on_rx_channel_data(frame);
        } else {
            self.on_rx_stun(frame);
        }
        self.check_handle();
        consumed
    }

    fn on_rx_channel_data(&mut self, frame: &[u8]) {
        let (channel, payload) = match parse_channel_data(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(self.logger, "Dropping ChannelData: {}", e);
                return;
            }
        };
        match self.channel_peers.get(&channel).copied() {
            Some(peer) if self.channel_for(&peer) == Some(channel) => {
                self.observer.on_rx_data(peer, payload);
            }
            _ => debug!(
                self.logger,
                "Dropping ChannelData for unbound channel 0x{:04X}", channel
            ),
        }
    }

    fn on_rx_stun(&mut self, frame: &[u8]) {
        let Some(server) = self.server else {
            debug!(self.logger, "Dropping STUN packet, no server set");
            return;
        };
        let mut events = Events::default();
        if let Err(e) = self.stun.on_rx_packet(frame, server, &mut events) {
            debug!(self.logger, "Dropped inbound STUN packet: {}", e);
        }
        self.process_events(events);
    }

    /**
     * Handle an expired timer.
     *
     * @return false when the timer does not belong to this session.
     */
    pub fn on_timer(&mut self, handle: TimerHandle) -> bool {
        let mut events = Events::default();
        let claimed = if self.stun.on_timer(handle, &mut events) {
            self.process_events(events);
            true
        } else if self.refresh_timer == Some(handle) {
            self.refresh_timer = None;
            self.on_refresh_timer();
            true
        } else if self.keep_alive_timer == Some(handle) {
            self.keep_alive_timer = None;
            self.on_keep_alive_timer();
            true
        } else if self.teardown_timer == Some(handle) {
            self.teardown_timer = None;
            self.on_teardown_timer();
            true
        } else {
            false
        };
        self.check_handle();
        claimed
    }

    /**
     * Graceful teardown. With an allocation this sends a Refresh with
     * LIFETIME=0 and destroys the session once it is answered or times out.
     * While an Allocate is in flight the teardown waits for its outcome.
     */
    pub fn shutdown(&mut self) -> Result<()> {
        match self.state {
            TurnState::Null | TurnState::Resolving | TurnState::Resolved => {
                self.pending_alloc = None;
                self.set_state(TurnState::Deallocated);
            }
            TurnState::Allocating => self.pending_destroy = true,
            TurnState::Ready => self.start_deallocation(),
            _ => {}
        }
        Ok(())
    }

    /**
     * Forceful teardown: cancels every transaction and timer without telling
     * the server. The session ends in `Destroying` and accepts no further
     * operations.
     */
    pub fn destroy(&mut self) {
        if self.state == TurnState::Destroying {
            return;
        }
        self.stun.destroy();
        self.cancel_timers();
        self.channels.clear();
        self.channel_peers.clear();
        self.permissions.clear();
        self.pending_alloc = None;
        self.set_state(TurnState::Destroying);
    }

    fn set_state(&mut self, new: TurnState) {
        let old = self.state;
        if !TurnState::is_valid_transition(old, new) {
            debug!(self.logger, "Ignoring state change {} -> {}", old, new);
            return;
        }
        self.state = new;
        info!(self.logger, "State {} -> {}", old, new);
        self.observer.on_state_changed(old, new);
        if new == TurnState::Deallocated {
            self.schedule_teardown();
        }
        self.check_handle();
    }

    fn unauthenticated(server: SocketAddr) -> SendOptions {
        SendOptions {
            dest: server,
            authenticate: false,
            retransmit: false,
        }
    }

    fn send_request(&mut self, request: Request, challenged: bool) -> Result<()> {
        let server = self
            .server
            .ok_or(Error::InvalidOperation("no server address"))?;
        let attributes = request.attributes(&self.alloc_params);
        let method = request.method();
        let mut tx = self.stun.create_request(
            method,
            RequestTag {
                request,
                challenged,
            },
        );
        tx.message.attributes.extend(attributes);

        let options = SendOptions {
            dest: server,
            authenticate: true,
            retransmit: self.conn_type == ConnType::Udp,
        };
        self.stun.send(tx, &options)?;
        self.last_tx = Some(self.timers.now());
        Ok(())
    }

    fn process_events(&mut self, events: Events) {
        if events.ignored > 0 {
            debug!(
                self.logger,
                "Ignored {} unexpected STUN requests or indications", events.ignored
            );
        }
        for (peer, data) in events.data {
            if self.state >= TurnState::Ready && self.state < TurnState::Deallocated {
                self.observer.on_rx_data(peer, &data);
            }
        }
        for completion in events.completions {
            self.on_completion(completion);
        }
    }

    fn on_completion(&mut self, completion: Completion<RequestTag>) {
        let Completion {
            tag,
            mut status,
            response,
            ..
        } = completion;
        if self.state == TurnState::Destroying {
            return;
        }

        let challenged = matches!(
            &status,
            Err(Error::ErrorResponse { code, .. })
                if *code == error_code::UNAUTHORIZED || *code == error_code::STALE_NONCE
        );
        if challenged && self.stun.auth_kind() != AuthKind::None {
            if tag.challenged {
                status = Err(Error::Auth(
                    "credentials rejected after a challenge round trip".into(),
                ));
            } else {
                debug!(
                    self.logger,
                    "Retrying {} with the new nonce",
                    method::name(tag.request.method())
                );
                match self.send_request(tag.request.clone(), true) {
                    Ok(()) => return,
                    Err(e) => status = Err(e),
                }
            }
        }

        match tag.request {
            Request::Allocate => self.on_allocate_complete(status, response),
            Request::Refresh { lifetime } => self.on_refresh_complete(lifetime, status, response),
            Request::CreatePermission { peers } => self.on_permission_complete(&peers, status),
            Request::ChannelBind { peer, channel } => {
                self.on_channel_bind_complete(peer, channel, status)
            }
        }
    }

    fn on_allocate_complete(&mut self, status: Result<()>, response: Option<StunMessage>) {
        if self.state != TurnState::Allocating {
            return;
        }
        let error = match status {
            Ok(()) => {
                let relay = response
                    .as_ref()
                    .and_then(|r| r.address(ATTR_XOR_RELAYED_ADDRESS));
                let Some(relay) = relay else {
                    self.fail_allocation(Error::malformed(
                        "Allocate response without XOR-RELAYED-ADDRESS",
                    ));
                    return;
                };
                self.relay_addr = Some(relay);
                self.mapped_addr = response
                    .as_ref()
                    .and_then(|r| r.address(ATTR_XOR_MAPPED_ADDRESS));
                let lifetime = response
                    .as_ref()
                    .and_then(|r| r.lifetime())
                    .or(self.alloc_params.lifetime)
                    .unwrap_or(DEFAULT_LIFETIME);
                info!(
                    self.logger,
                    "Allocated relay {} (mapped {:?}) for {}s", relay, self.mapped_addr, lifetime
                );
                self.apply_lifetime(lifetime);
                self.start_keep_alive();
                self.set_state(TurnState::Ready);
                if self.pending_destroy {
                    self.pending_destroy = false;
                    self.start_deallocation();
                }
                return;
            }
            Err(e) => e,
        };

        // a stream transport stays connected to the first server
        let redirectable = self.conn_type == ConnType::Udp && !self.pending_destroy;
        if let Error::ErrorResponse { code, .. } = &error {
            let alternate = response
                .as_ref()
                .and_then(|r| r.address(ATTR_ALTERNATE_SERVER));
            if *code == error_code::TRY_ALTERNATE && redirectable {
                if let Some(alternate) = alternate.filter(|a| Some(*a) != self.server) {
                    if self.redirects < MAX_REDIRECTS {
                        self.redirects += 1;
                        info!(self.logger, "Redirected to alternate server {}", alternate);
                        self.server = Some(alternate);
                        if self.send_request(Request::Allocate, false).is_ok() {
                            return;
                        }
                    }
                }
            }
        }

        if error == Error::Timeout
            && redirectable
            && self.server_index + 1 < self.servers.len()
        {
            self.server_index += 1;
            self.server = Some(self.servers[self.server_index]);
            info!(
                self.logger,
                "Allocate timed out, trying {:?}", self.server
            );
            if self.send_request(Request::Allocate, false).is_ok() {
                return;
            }
        }

        self.fail_allocation(error);
    }

    fn fail_allocation(&mut self, error: Error) {
        warn!(self.logger, "Allocation failed: {}", error);
        self.last_error = Some(error.clone());
        self.observer.on_operation_failed(Operation::Allocate, &error);
        self.set_state(TurnState::Deallocating);
        self.set_state(TurnState::Deallocated);
    }

    fn on_refresh_complete(
        &mut self,
        requested: u32,
        status: Result<()>,
        response: Option<StunMessage>,
    ) {
        match status {
            Ok(()) => {
                let granted = response
                    .as_ref()
                    .and_then(|r| r.lifetime())
                    .unwrap_or(requested);
                if requested == 0 || granted == 0 {
                    self.finish_deallocation();
                } else if self.state == TurnState::Ready {
                    debug!(self.logger, "Allocation refreshed for {}s", granted);
                    self.apply_lifetime(granted);
                }
            }
            Err(e) if requested == 0 => {
                debug!(self.logger, "Deallocation not confirmed: {}", e);
                self.finish_deallocation();
            }
            Err(e) => {
                warn!(self.logger, "Refresh failed: {}", e);
                self.last_error = Some(e.clone());
                self.observer.on_operation_failed(Operation::Refresh, &e);
                self.finish_deallocation();
            }
        }
    }

    fn on_permission_complete(&mut self, peers: &[SocketAddr], status: Result<()>) {
        match status {
            Ok(()) => {
                let expiry = self.timers.now() + PERMISSION_LIFETIME;
                for peer in peers {
                    if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
                        permission.pending = false;
                        permission.expiry = Some(expiry);
                    }
                }
            }
            Err(e) => {
                debug!(self.logger, "CreatePermission for {:?} failed: {}", peers, e);
                self.drop_unconfirmed_permissions(peers);
                self.last_error = Some(e.clone());
                self.observer
                    .on_operation_failed(Operation::CreatePermission, &e);
                self.on_send_error(&e);
            }
        }
    }

    fn on_channel_bind_complete(&mut self, peer: SocketAddr, channel: u16, status: Result<()>) {
        let now = self.timers.now();
        let Some(binding) = self.channels.get_mut(&peer).filter(|b| b.number == channel) else {
            return;
        };
        match status {
            Ok(()) => {
                let first = !binding.bound;
                binding.bound = true;
                binding.refreshing = false;
                binding.expiry = Some(now + CHANNEL_LIFETIME);
                let permission = self.permissions.entry(peer.ip()).or_insert(Permission {
                    pending: false,
                    expiry: None,
                });
                permission.pending = false;
                permission.expiry = Some(now + PERMISSION_LIFETIME);
                if first {
                    info!(self.logger, "Channel 0x{:04X} bound to {}", channel, peer);
                    self.observer.on_channel_bound(peer, channel);
                }
            }
            Err(e) => {
                debug!(
                    self.logger,
                    "ChannelBind 0x{:04X} to {} failed: {}", channel, peer, e
                );
                self.channels.remove(&peer);
                self.channel_peers.remove(&channel);
                self.channel_numbers.retire(channel, now);
                self.drop_unconfirmed_permissions(&[peer]);
                self.last_error = Some(e.clone());
                self.observer.on_operation_failed(Operation::ChannelBind, &e);
                self.on_send_error(&e);
            }
        }
    }

    fn drop_unconfirmed_permissions(&mut self, peers: &[SocketAddr]) {
        for peer in peers {
            let ip = peer.ip();
            match self.permissions.get_mut(&ip) {
                Some(p) if p.expiry.is_none() => {
                    self.permissions.remove(&ip);
                }
                Some(p) => p.pending = false,
                None => {}
            }
        }
    }

    // A transport failure ends the allocation, the server can no longer be reached.
    fn on_send_error(&mut self, error: &Error) {
        if matches!(error, Error::Transport(_)) && self.state == TurnState::Ready {
            self.last_error = Some(error.clone());
            self.finish_deallocation();
        }
    }

    fn apply_lifetime(&mut self, lifetime: u32) {
        self.lifetime = lifetime;
        self.expiry = Some(self.timers.now() + Duration::from_secs(lifetime.into()));
        if let Some(timer) = self.refresh_timer.take() {
            self.timers.cancel(timer);
        }
        self.refresh_timer = Some(
            self.timers
                .schedule(Duration::from_secs(lifetime.into()) * 9 / 10),
        );
    }

    fn on_refresh_timer(&mut self) {
        if self.state != TurnState::Ready {
            return;
        }
        let lifetime = self.alloc_params.lifetime.unwrap_or(self.lifetime);
        if let Err(e) = self.send_request(Request::Refresh { lifetime }, false) {
            warn!(self.logger, "Cannot send Refresh: {}", e);
            self.last_error = Some(e.clone());
            self.observer.on_operation_failed(Operation::Refresh, &e);
            self.finish_deallocation();
        }
    }

    fn start_keep_alive(&mut self) {
        if self.keep_alive_timer.is_none() {
            self.keep_alive_timer = Some(self.timers.schedule(self.keep_alive));
        }
    }

    /**
     * Refresh channel bindings and permissions about to expire, and keep the
     * NAT binding of an idle UDP session open.
     */
    fn on_keep_alive_timer(&mut self) {
        if self.state != TurnState::Ready {
            return;
        }
        let now = self.timers.now();
        let expiring = |expiry: Option<Instant>| {
            expiry.map_or(false, |e| e.saturating_duration_since(now) <= REFRESH_MARGIN)
        };

        let channels: Vec<(SocketAddr, u16)> = self
            .channels
            .iter_mut()
            .filter(|(_, b)| b.bound && !b.refreshing && expiring(b.expiry))
            .map(|(peer, b)| {
                b.refreshing = true;
                (*peer, b.number)
            })
            .collect();
        let refreshed_ips: Vec<IpAddr> = channels.iter().map(|(peer, _)| peer.ip()).collect();
        for (peer, channel) in channels {
            if let Err(e) = self.send_request(Request::ChannelBind { peer, channel }, false) {
                debug!(self.logger, "Cannot refresh channel 0x{:04X}: {}", channel, e);
                self.on_send_error(&e);
            }
        }

        let peers: Vec<SocketAddr> = self
            .permissions
            .iter_mut()
            .filter(|(ip, p)| !p.pending && expiring(p.expiry) && !refreshed_ips.contains(ip))
            .map(|(ip, p)| {
                p.pending = true;
                SocketAddr::new(*ip, 0)
            })
            .collect();
        if !peers.is_empty() {
            if let Err(e) = self.send_request(Request::CreatePermission { peers }, false) {
                debug!(self.logger, "Cannot refresh permissions: {}", e);
                self.on_send_error(&e);
            }
        }

        let idle = self
            .last_tx
            .map_or(true, |t| now.saturating_duration_since(t) >= self.keep_alive);
        if self.state == TurnState::Ready && self.conn_type == ConnType::Udp && idle {
            if let Some(server) = self.server {
                let tx = self.stun.create_indication(method::SEND);
                match self.stun.send(tx, &Self::unauthenticated(server)) {
                    Ok(_) => self.last_tx = Some(now),
                    Err(e) => self.on_send_error(&e),
                }
            }
        }

        if self.state == TurnState::Ready {
            self.start_keep_alive();
        }
    }

    fn start_deallocation(&mut self) {
        self.cancel_allocation_timers();
        self.set_state(TurnState::Deallocating);
        if let Err(e) = self.send_request(Request::Refresh { lifetime: 0 }, false) {
            debug!(self.logger, "Cannot send deallocation: {}", e);
            self.set_state(TurnState::Deallocated);
        }
    }

    fn finish_deallocation(&mut self) {
        if self.state >= TurnState::Deallocated {
            return;
        }
        self.cancel_allocation_timers();
        self.set_state(TurnState::Deallocating);
        self.set_state(TurnState::Deallocated);
    }

    fn schedule_teardown(&mut self) {
        if self.teardown_timer.is_none() {
            self.teardown_timer = Some(self.timers.schedule(Duration::ZERO));
        }
    }

    // Turns a request made through the handle into a teardown timer.
    fn check_handle(&mut self) {
        if self.handle.is_requested() && self.state != TurnState::Destroying {
            self.schedule_teardown();
        }
    }

    fn on_teardown_timer(&mut self) {
        let (shutdown, destroy) = self.handle.take();
        if destroy || self.state == TurnState::Deallocated {
            self.destroy();
        } else if shutdown {
            if let Err(e) = self.shutdown() {
                debug!(self.logger, "Requested shutdown failed: {}", e);
            }
        }
    }

    fn cancel_allocation_timers(&mut self) {
        for timer in [self.refresh_timer.take(), self.keep_alive_timer.take()]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(timer);
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_allocation_timers();
        if let Some(timer) = self.teardown_timer.take() {
            self.timers.cancel(timer);
        }
    }
}

impl Drop for TurnSession {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}
