use crate::config::Config;
use crate::connection::{ConnectionPool, SlotState, TransportState, CONNECTION_POOL_SIZE};
use crate::crypto;
use crate::discovery::Discovery;
use crate::document::{self, Advertisement, PeerEntry, SessionDocument};
use crate::error::{Error, Result};
use crate::event::{CoreEvent, EventQueue, TimedEvent};
use crate::identity::{self, Identity, IdentityStore};
use crate::logging;
use crate::manager::{self, DialPlan, Host, LivenessAction};
use crate::relay::{RelayAction, RelaySession, RelayState, DEFAULT_RELAY_HOST};
use crate::resolver::{Resolution, Resolver, ResolverOwner};
use crate::service::{AppEvent, AppServer};
use crate::wire::ConnectionType;
use crate::{HostId, Uid, HOST_ID_LEN};
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use net2::TcpBuilder;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::time::{Duration, Instant};

const TOKEN_SERVER: Token = Token(0);
const TOKEN_APP_SERVER: Token = Token(1);
const TOKEN_DISCOVERY: Token = Token(2);
const CONN_TOKEN_BASE: usize = 1000;
const APP_TOKEN_BASE: usize = 2000;
const RELAY_TOKEN_BASE: usize = 3000;

/// The readiness multiplex is the only blocking site of the loop.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const PERIODIC_INTERVAL: Duration = Duration::from_secs(1);
/// Discovery advertisements go out every this many periodic ticks.
const ADVERT_EVERY: u64 = 5;
/// Grace before duplicate sessions of a pair are reaped.
const PARALLEL_CLOSE_DELAY: Duration = Duration::from_secs(1);

const LISTEN_BACKLOG: i32 = 8;
const HOST_ID_FILE: &str = "wisp_host_id.bin";

const NULL_UID: Uid = [0u8; 32];

/// The single root value owning every table of the node: connection pool,
/// identity store handle, relay sessions, discovery table, resolvers, the
/// app server and the event loop itself. One `tick` is one iteration of the
/// cooperative loop.
pub struct Core {
    pub host_id: HostId,
    pub config: Config,
    pub store: IdentityStore,
    pub pool: ConnectionPool,
    pub relays: Vec<RelaySession>,
    pub resolver: Resolver,
    pub discovery: Discovery,
    pub apps: AppServer,

    listener: Option<TcpListener>,
    poll: Poll,
    events: Events,
    queue: EventQueue,
    last_periodic: Instant,
    periodic_ticks: u64,
    log: logging::Logger,
}

impl Core {
    /// Builds the node inside the given working directory. Socket setup
    /// failures here are startup errors and abort the process via the
    /// caller; everything after `new` returns typed results instead.
    pub fn new(config: Config, directory: &Path, log: &logging::Logger) -> io::Result<Core> {
        crypto::init();

        let log = log.new(logging::o!());
        let store = IdentityStore::open(directory, &log);
        let host_id = load_host_id(directory)?;
        let poll = Poll::new()?;

        let mut core = Core {
            host_id,
            store,
            pool: ConnectionPool::new(CONNECTION_POOL_SIZE, &log),
            relays: Vec::new(),
            resolver: Resolver::new(&log),
            discovery: Discovery::new(&log),
            apps: AppServer::new(&log),
            listener: None,
            poll,
            events: Events::with_capacity(1024),
            queue: EventQueue::new(),
            last_periodic: Instant::now(),
            periodic_ticks: 0,
            log,
            config,
        };

        if core.config.accept {
            let listener = TcpBuilder::new_v4()?
                .reuse_address(true)?
                .bind(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::UNSPECIFIED,
                    core.config.port,
                )))?
                .listen(LISTEN_BACKLOG)?;
            listener.set_nonblocking(true)?;

            let listener = TcpListener::from_std(listener)?;
            core.poll
                .register(&listener, TOKEN_SERVER, Ready::readable(), PollOpt::level())?;
            logging::info!(core.log, "wish server listening";
                           "port" => listener.local_addr()?.port());
            core.listener = Some(listener);
        }

        if core.config.discover {
            core.discovery.listen()?;
            core.poll.register(
                core.discovery.socket().unwrap(),
                TOKEN_DISCOVERY,
                Ready::readable(),
                PollOpt::level(),
            )?;
        }

        if core.config.app_server {
            core.apps.listen(core.config.app_port)?;
            core.poll.register(
                core.apps.listener().unwrap(),
                TOKEN_APP_SERVER,
                Ready::readable(),
                PollOpt::level(),
            )?;
        }

        if core.config.relay {
            let hosts = if core.config.relay_hosts.is_empty() {
                vec![DEFAULT_RELAY_HOST.to_string()]
            } else {
                core.config.relay_hosts.clone()
            };
            for host in &hosts {
                core.add_relay(host);
            }
        }

        Ok(core)
    }

    /// The actual TCP port accepted connections arrive on.
    pub fn listen_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Registers a relay server given as `host:port`. Duplicates are
    /// silently ignored.
    pub fn add_relay(&mut self, host: &str) {
        let (host, port) = match manager::parse_transport(host) {
            Ok((Host::Ip(ip), port)) => (ip.to_string(), port),
            Ok((Host::Name(name), port)) => (name, port),
            Err(_) => {
                logging::warn!(self.log, "cannot parse relay host"; "host" => host);
                return;
            }
        };

        if self
            .relays
            .iter()
            .any(|relay| relay.host == host && relay.port == port)
        {
            return;
        }

        self.relays.push(RelaySession::new(&host, port, &self.log));
    }

    /// Removes a relay server, closing its control session. Returns true
    /// when a session matched.
    pub fn remove_relay(&mut self, host: &str) -> bool {
        let (host, port) = match manager::parse_transport(host) {
            Ok((Host::Ip(ip), port)) => (ip.to_string(), port),
            Ok((Host::Name(name), port)) => (name, port),
            Err(_) => return false,
        };

        let index = match self
            .relays
            .iter()
            .position(|relay| relay.host == host && relay.port == port)
        {
            Some(index) => index,
            None => return false,
        };

        // Session handles and poll tokens are positional, so everything at
        // or above the removed index must be detached or rebased.
        for i in index..self.relays.len() {
            self.resolver.cancel_by_owner(ResolverOwner::Relay(i));
        }

        self.relays[index].close(Instant::now());
        self.relays.remove(index);

        for i in index..self.relays.len() {
            if self.relays[i].state == RelayState::Resolving {
                self.relays[i].state = RelayState::WaitReconnect;
            }

            if let Some(stream) = self.relays[i].stream() {
                let ready = if self.relays[i].state == RelayState::Connecting {
                    Ready::writable()
                } else {
                    Ready::readable()
                };
                let _ = self.poll.reregister(
                    stream,
                    Token(RELAY_TOKEN_BASE + i),
                    ready,
                    PollOpt::level(),
                );
            }
        }

        for id in self.pool.ids() {
            match self.pool.get(id).relay {
                Some(i) if i == index => {
                    self.pool.get_mut(id).relay = None;
                    self.close_connection(id);
                }
                Some(i) if i > index => {
                    self.pool.get_mut(id).relay = Some(i - 1);
                }
                _ => (),
            }
        }

        true
    }

    /// Lists the configured relay servers and whether their control session
    /// is up.
    pub fn relay_list(&self) -> Vec<(String, u16, bool)> {
        self.relays
            .iter()
            .map(|relay| (relay.host.clone(), relay.port, relay.state == RelayState::Wait))
            .collect()
    }

    /// Creates and persists a new local identity, with the configured relay
    /// hosts as its transports.
    pub fn create_identity(&self, alias: &str) -> Result<Identity> {
        let mut hosts = self.config.relay_hosts.clone();
        if hosts.is_empty() {
            hosts.push(DEFAULT_RELAY_HOST.to_string());
        }

        let transports: Vec<String> = hosts
            .iter()
            .map(|host| format!("wish://{}", host))
            .collect();

        self.store.create_local(alias, &transports)
    }

    /// Removes an identity and closes every connection that references it
    /// as local or remote party.
    pub fn remove_identity(&mut self, uid: &Uid) -> Result<bool> {
        let removed = self.store.remove(uid)?;

        for id in self.pool.referencing(uid) {
            self.close_connection(id);
        }

        Ok(removed)
    }

    /// Starts a friend-request connection towards a peer seen in the
    /// discovery table, importing it as an unconfirmed contact first.
    pub fn friend_request(&mut self, luid: &Uid, ruid: &Uid, rhid: &HostId) -> Result<()> {
        let (ip, port, mut contact) = {
            let entry = self.discovery.find(ruid, rhid).ok_or(Error::NotFound)?;

            let mut pubkey = [0u8; identity::PUBKEY_LEN];
            pubkey.copy_from_slice(&entry.pubkey);

            let contact = Identity {
                uid: entry.ruid,
                pubkey,
                privkey: None,
                alias: entry.alias.clone(),
                transports: vec![format!("{}:{}", entry.ip, entry.port)],
                meta: None,
                permissions: None,
            };
            (entry.ip, entry.port, contact)
        };

        if !self.store.exists(ruid) {
            // Hold off normal dials until the request is answered.
            contact.meta = Some(br#"{"connect":false}"#.to_vec());
            self.store.save(&contact)?;
        }

        let slot = self.pool.allocate()?;
        {
            let connection = self.pool.get_mut(slot);
            connection.open_outgoing(luid, ruid, ConnectionType::FriendRequest);
            connection.rhid = *rhid;
        }
        self.connect_ip(slot, ip, port);
        Ok(())
    }

    /// One iteration of the event loop: resolvers, readiness multiplex and
    /// dispatch, deferred events, timers, the 1-second periodic, and the
    /// write-side drain. Callbacks must not block.
    pub fn tick(&mut self) {
        let now = Instant::now();

        let resolutions = self.resolver.poll_all();
        for resolution in resolutions {
            self.handle_resolution(resolution);
        }

        self.poll
            .poll(&mut self.events, Some(POLL_TIMEOUT))
            .expect("Readiness poll failed");

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();
        for (token, readiness) in ready {
            self.dispatch(token, readiness);
        }

        while let Some(event) = self.queue.pop() {
            self.process_event(event);
        }

        for timed in self.queue.due(now) {
            self.process_timed(timed);
        }

        if now.duration_since(self.last_periodic) >= PERIODIC_INTERVAL {
            self.last_periodic = now;
            self.periodic(now);
        }

        self.flush_connections();
    }

    fn dispatch(&mut self, token: Token, readiness: Ready) {
        match token {
            TOKEN_SERVER => self.accept_connections(),
            TOKEN_APP_SERVER => self.accept_apps(),
            TOKEN_DISCOVERY => self.discovery.read(Instant::now()),
            Token(raw) if raw >= RELAY_TOKEN_BASE => {
                self.relay_ready(raw - RELAY_TOKEN_BASE, readiness)
            }
            Token(raw) if raw >= APP_TOKEN_BASE => self.app_ready(raw - APP_TOKEN_BASE),
            Token(raw) if raw >= CONN_TOKEN_BASE => {
                self.connection_ready(raw - CONN_TOKEN_BASE, readiness)
            }
            _ => (),
        }
    }

    // ------------------------------------------------------------------
    // Wish server accept path

    fn accept_connections(&mut self) {
        loop {
            let accepted = {
                let listener = match self.listener.as_ref() {
                    Some(listener) => listener,
                    None => return,
                };
                match listener.accept() {
                    Ok(accepted) => Some(accepted),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        logging::warn!(self.log, "accept failed"; "error" => %err);
                        None
                    }
                }
            };

            let (stream, addr) = match accepted {
                Some(accepted) => accepted,
                None => return,
            };

            let slot = match self.pool.allocate() {
                Ok(slot) => slot,
                Err(_) => {
                    // Pool exhausted: the incoming connection is refused.
                    logging::warn!(self.log, "no free slot, refusing incoming connection");
                    continue;
                }
            };

            {
                let connection = self.pool.get_mut(slot);
                connection.open_incoming(stream);
                if let SocketAddr::V4(addr) = addr {
                    connection.remote_ip = *addr.ip();
                    connection.remote_port = addr.port();
                }
            }

            self.register_connection(slot, Ready::readable());
            self.signal(CoreEvent::TcpClientConnected(slot));
        }
    }

    // ------------------------------------------------------------------
    // Connection readiness

    fn connection_ready(&mut self, id: usize, readiness: Ready) {
        if self.pool.get(id).slot_state == SlotState::Free {
            return;
        }

        if readiness.is_writable() {
            if self.pool.get(id).transport == TransportState::Connecting {
                match self.pool.get(id).connect_outcome() {
                    Ok(()) => {
                        let via_relay = {
                            let connection = self.pool.get_mut(id);
                            connection.transport = TransportState::Connected;
                            connection.via_relay
                        };
                        self.refresh_interest(id);

                        if via_relay {
                            self.signal(CoreEvent::TcpRelaySessionConnected(id));
                        } else {
                            self.signal(CoreEvent::TcpConnected(id));
                        }
                    }
                    Err(err) => {
                        logging::debug!(self.log, "connect failed"; "slot" => id, "error" => %err);
                        self.drop_connection_stream(id);
                        self.signal(CoreEvent::TcpDisconnected(id));
                        return;
                    }
                }
            } else {
                self.flush_connection(id);
            }
        }

        if readiness.is_readable()
            && self.pool.get(id).slot_state != SlotState::Free
            && self.pool.get(id).transport == TransportState::Connected
            && self.pool.get(id).stream().is_some()
        {
            match self.pool.get_mut(id).fill(Instant::now()) {
                Ok(received) => {
                    if received > 0 {
                        self.drive_connection(id);
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "connection read failed";
                                    "slot" => id,
                                    "error" => %err);
                    self.drop_connection_stream(id);
                    self.signal(CoreEvent::TcpDisconnected(id));
                }
            }
        }
    }

    /// Advances the wire conversation of one connection as far as the
    /// buffered bytes allow. Any protocol, crypto or authorization failure
    /// closes the connection.
    fn drive_connection(&mut self, id: usize) {
        if let Err(err) = self.drive_connection_inner(id) {
            logging::debug!(self.log, "connection failed"; "slot" => id, "error" => ?err);
            self.close_connection(id);
        }
    }

    fn drive_connection_inner(&mut self, id: usize) -> Result<()> {
        use crate::connection::ProtocolState;

        loop {
            match self.pool.get(id).protocol {
                ProtocolState::Initial | ProtocolState::Closing => return Ok(()),
                ProtocolState::Handshake => {
                    if !self.pool.get_mut(id).take_preamble()? {
                        return Ok(());
                    }

                    if !self.pool.get(id).handshake_sent() {
                        let local = self.pick_local_identity(id)?;
                        let host_id = self.host_id;
                        self.pool.get_mut(id).start_handshake(&local, &host_id)?;
                    }

                    let message = match self.pool.get_mut(id).read_peer_handshake()? {
                        Some(message) => message,
                        None => return Ok(()),
                    };
                    let doc = self.pool.get_mut(id).complete_handshake(&message)?;

                    // On normal sessions the peer must be a known contact
                    // with matching key material; friend requests are the
                    // mechanism for introducing unknown peers.
                    if self.pool.get(id).kind == ConnectionType::Normal {
                        match self.store.load(&doc.uid) {
                            Ok(peer) if peer.pubkey == doc.pubkey => (),
                            _ => return Err(Error::AuthFailed),
                        }
                    }

                    self.signal(CoreEvent::NewCoreConnection(id));
                }
                ProtocolState::Running => {
                    loop {
                        let doc = match self.pool.get_mut(id).next_document()? {
                            Some(doc) => doc,
                            None => break,
                        };
                        self.handle_session_document(id, &doc)?;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// The identity this end speaks as: the dialed luid when known, the
    /// first local identity otherwise (accepted and punched connections).
    fn pick_local_identity(&self, id: usize) -> Result<Identity> {
        let luid = self.pool.get(id).luid;

        let uid = if luid != NULL_UID {
            luid
        } else {
            *self.store.local_uids().first().ok_or(Error::NotFound)?
        };

        let local = self.store.load(&uid)?;
        if !local.is_local() {
            return Err(Error::NoPrivateKey);
        }
        Ok(local)
    }

    fn handle_session_document(&mut self, id: usize, doc: &[u8]) -> Result<()> {
        match document::decode::<SessionDocument>(doc)? {
            SessionDocument::Ping => {
                self.send_session_document(id, &SessionDocument::Pong)?;
            }
            SessionDocument::Pong => (),
            SessionDocument::PeersRequest => {
                let peers: Vec<PeerEntry> = self
                    .apps
                    .registry
                    .entries()
                    .iter()
                    .map(|entry| PeerEntry {
                        wsid: entry.wsid,
                        name: entry.name.clone(),
                        online: true,
                    })
                    .collect();
                self.send_session_document(id, &SessionDocument::PeersResponse(peers))?;
            }
            SessionDocument::PeersResponse(peers) => {
                logging::debug!(self.log, "peers response"; "slot" => id, "count" => peers.len());
            }
            SessionDocument::FriendRequest(cert) => {
                let contact = identity::identity_from_cert(&cert)?;
                let accepted = !contact.is_banned() && !self.store.exists(&contact.uid);

                if accepted {
                    self.store.save(&contact)?;
                    logging::info!(self.log, "friend request accepted";
                                   "alias" => &contact.alias);
                }

                self.send_session_document(id, &SessionDocument::FriendResponse(accepted))?;
                // One-shot exchange: the connection has served its purpose.
                self.signal(CoreEvent::CloseConnection(id));
            }
            SessionDocument::FriendResponse(accepted) => {
                let ruid = self.pool.get(id).ruid;
                if accepted {
                    logging::info!(self.log, "friend request accepted by peer");
                    // The contact may now be dialed normally.
                    let _ = self.store.set_meta_connect(&ruid, None);
                }
                self.signal(CoreEvent::CloseConnection(id));
            }
            SessionDocument::Payload(payload) => {
                // Opaque bytes for the RPC layer above the core.
                logging::debug!(self.log, "session payload"; "slot" => id, "len" => payload.len());
            }
        }

        Ok(())
    }

    fn send_session_document(&mut self, id: usize, doc: &SessionDocument) -> Result<()> {
        let encoded = document::encode(doc)?;
        self.pool.get_mut(id).enqueue_document(&encoded)
    }

    // ------------------------------------------------------------------
    // Relay readiness

    fn relay_ready(&mut self, index: usize, readiness: Ready) {
        if index >= self.relays.len() {
            return;
        }

        if readiness.is_writable() && self.relays[index].state == RelayState::Connecting {
            match self.relays[index].connect_outcome() {
                Ok(()) => {
                    let connected = self.relays[index].on_connected();
                    match connected {
                        Ok(()) => {
                            let token = Token(RELAY_TOKEN_BASE + index);
                            if let Some(stream) = self.relays[index].stream() {
                                let _ = self
                                    .poll
                                    .reregister(stream, token, Ready::readable(), PollOpt::level());
                            }
                        }
                        Err(err) => {
                            logging::warn!(self.log, "relay opening failed"; "error" => %err);
                            self.relays[index].close(Instant::now());
                        }
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "relay connect failed"; "error" => %err);
                    self.relays[index].close(Instant::now());
                }
            }
        }

        let readable_state = match self.relays[index].state {
            RelayState::Open | RelayState::ReadSessionId | RelayState::Wait => true,
            _ => false,
        };

        if readiness.is_readable() && readable_state {
            match self.relays[index].fill(Instant::now()) {
                Ok(_) => {
                    let actions = self.relays[index].process();
                    self.handle_relay_actions(index, actions);
                }
                Err(err) => {
                    logging::debug!(self.log, "relay read failed"; "error" => %err);
                    self.relays[index].close(Instant::now());
                }
            }
        }
    }

    fn handle_relay_actions(&mut self, index: usize, actions: Vec<RelayAction>) {
        for action in actions {
            match action {
                RelayAction::SessionEstablished => {
                    // Internet reachability is confirmed; a best-effort
                    // auto-dial pass is worthwhile right now.
                    self.connections_check();
                }
                RelayAction::Punch => self.punched_inbound(index),
                RelayAction::ProtocolError => {
                    self.relays[index].close(Instant::now());
                    return;
                }
            }
        }
    }

    /// The relay announced an inbound attempt: open a new via-relay
    /// connection towards the relay server. The identities are established
    /// during the handshake, as on an accepted connection.
    fn punched_inbound(&mut self, index: usize) {
        let (host, port) = (self.relays[index].host.clone(), self.relays[index].port);

        let slot = match self.pool.allocate() {
            Ok(slot) => slot,
            Err(_) => {
                logging::warn!(self.log, "cannot accept punched connection, pool exhausted");
                return;
            }
        };

        {
            let connection = self.pool.get_mut(slot);
            connection.open_outgoing(&NULL_UID, &NULL_UID, ConnectionType::Normal);
            connection.via_relay = true;
            connection.relay = Some(index);
        }

        match host.parse::<Ipv4Addr>() {
            Ok(ip) => self.connect_ip(slot, ip, port),
            Err(_) => {
                self.pool.get_mut(slot).begin_resolve(port);
                if self
                    .resolver
                    .start(ResolverOwner::Connection(slot), &host)
                    .is_err()
                {
                    self.signal(CoreEvent::TcpDisconnected(slot));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // App server readiness

    fn accept_apps(&mut self) {
        loop {
            match self.apps.accept() {
                Ok(Some(index)) => {
                    let token = Token(APP_TOKEN_BASE + index);
                    if let Some(stream) = self.apps.stream(index) {
                        if let Err(err) =
                            self.poll
                                .register(stream, token, Ready::readable(), PollOpt::level())
                        {
                            logging::warn!(self.log, "app registration failed"; "error" => %err);
                        }
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    logging::warn!(self.log, "app accept failed"; "error" => %err);
                    return;
                }
            }
        }
    }

    fn app_ready(&mut self, index: usize) {
        let mut events = Vec::new();
        self.apps.fill(index, &mut events);
        self.handle_app_events(events);
    }

    fn handle_app_events(&mut self, events: Vec<AppEvent>) {
        for event in events {
            match event {
                AppEvent::Login(index, wsid) => {
                    if self.apps.registry.add(&wsid, "app").is_err() {
                        logging::warn!(self.log, "service registry full");
                        self.cleanup_app(index);
                    } else {
                        logging::info!(self.log, "service logged in"; "slot" => index);
                    }
                }
                AppEvent::Document(_wsid, doc) => {
                    // RPC dispatch lives above the core; the pipe just logs.
                    logging::debug!(self.log, "app document"; "len" => doc.len());
                }
                AppEvent::Close(index) => self.cleanup_app(index),
            }
        }
    }

    fn cleanup_app(&mut self, index: usize) {
        if let Some(stream) = self.apps.stream(index) {
            let _ = self.poll.deregister(stream);
        }
        self.apps.cleanup(index);
    }

    // ------------------------------------------------------------------
    // Deferred events

    #[inline]
    fn signal(&mut self, event: CoreEvent) {
        self.queue.push(event);
    }

    fn process_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::TcpConnected(id) => {
                if self.pool.get(id).slot_state == SlotState::Free {
                    return;
                }

                let local = match self.pick_local_identity(id) {
                    Ok(local) => local,
                    Err(_) => {
                        logging::warn!(self.log, "no local identity for handshake"; "slot" => id);
                        self.close_connection(id);
                        return;
                    }
                };

                let host_id = self.host_id;
                if self
                    .pool
                    .get_mut(id)
                    .start_handshake(&local, &host_id)
                    .is_err()
                {
                    self.close_connection(id);
                }
            }
            CoreEvent::TcpRelaySessionConnected(id) => {
                if self.pool.get(id).slot_state == SlotState::Free {
                    return;
                }

                // The session id goes out first; the preamble and handshake
                // follow once the dialing peer has spoken.
                let session_id = match self.pool.get(id).relay {
                    Some(index) => self.relays[index].session_id,
                    None => {
                        self.close_connection(id);
                        return;
                    }
                };

                let result = {
                    let connection = self.pool.get_mut(id);
                    connection.protocol = crate::connection::ProtocolState::Handshake;
                    connection.queue_session_id(&session_id)
                };
                if result.is_err() {
                    self.close_connection(id);
                }
            }
            CoreEvent::TcpClientConnected(id) => {
                if self.pool.get(id).slot_state == SlotState::Free {
                    return;
                }
                logging::debug!(self.log, "incoming connection"; "slot" => id);
            }
            CoreEvent::TcpDisconnected(id) => {
                if self.pool.get(id).slot_state == SlotState::Free {
                    return;
                }

                if self.pool.get(id).transport == TransportState::Resolving {
                    self.resolver.cancel_by_owner(ResolverOwner::Connection(id));
                }

                self.drop_connection_stream(id);
                self.pool.release(id);
                logging::debug!(self.log, "connection slot freed"; "slot" => id);
            }
            CoreEvent::NewCoreConnection(id) => {
                if self.pool.get(id).slot_state == SlotState::Free {
                    return;
                }

                {
                    let connection = self.pool.get_mut(id);
                    connection.slot_state = SlotState::Connected;
                    connection.ping_sent = None;
                }

                // Parallel-session reconciliation: exactly one side runs the
                // delayed check, the one whose host id compares less.
                let rhid = self.pool.get(id).rhid;
                if self.host_id < rhid {
                    self.queue.schedule(
                        Instant::now() + PARALLEL_CLOSE_DELAY,
                        TimedEvent::CloseParallel(id),
                    );
                }

                let (friend_req, outgoing, luid) = {
                    let connection = self.pool.get(id);
                    (
                        connection.friend_req,
                        connection.direction == crate::connection::Direction::Outgoing,
                        connection.luid,
                    )
                };

                let sent = if friend_req {
                    if outgoing && !self.pool.get(id).via_relay {
                        match self.store.build_signed_cert(&luid, None) {
                            Ok(cert) => self
                                .send_session_document(id, &SessionDocument::FriendRequest(cert)),
                            Err(err) => Err(err),
                        }
                    } else {
                        Ok(())
                    }
                } else {
                    // The session pipe opens with a peers request.
                    self.send_session_document(id, &SessionDocument::PeersRequest)
                };

                if sent.is_err() {
                    self.close_connection(id);
                    return;
                }

                logging::info!(self.log, "session established";
                               "slot" => id,
                               "via_relay" => self.pool.get(id).via_relay);
            }
            CoreEvent::CloseConnection(id) => self.close_connection(id),
        }
    }

    fn process_timed(&mut self, event: TimedEvent) {
        match event {
            TimedEvent::CloseParallel(id) => {
                if self.pool.get(id).slot_state != SlotState::Connected {
                    return;
                }

                for duplicate in self.pool.duplicates_of(id) {
                    logging::info!(self.log, "closing duplicate session"; "slot" => duplicate);
                    self.close_connection(duplicate);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Open / close plumbing

    /// Dispatches one auto-dial decision.
    fn open_connection(&mut self, plan: DialPlan) {
        let slot = match self.pool.allocate() {
            Ok(slot) => slot,
            Err(_) => return,
        };

        self.pool
            .get_mut(slot)
            .open_outgoing(&plan.luid, &plan.ruid, ConnectionType::Normal);

        match plan.host {
            Host::Ip(ip) => self.connect_ip(slot, ip, plan.port),
            Host::Name(name) => {
                self.pool.get_mut(slot).begin_resolve(plan.port);
                if self
                    .resolver
                    .start(ResolverOwner::Connection(slot), &name)
                    .is_err()
                {
                    self.signal(CoreEvent::TcpDisconnected(slot));
                }
            }
        }
    }

    fn connect_ip(&mut self, slot: usize, ip: Ipv4Addr, port: u16) {
        match self.pool.get_mut(slot).connect(ip, port) {
            Ok(()) => self.register_connection(slot, Ready::writable()),
            Err(err) => {
                logging::debug!(self.log, "connect setup failed"; "error" => %err);
                self.signal(CoreEvent::TcpDisconnected(slot));
            }
        }
    }

    fn register_connection(&mut self, id: usize, ready: Ready) {
        let token = Token(CONN_TOKEN_BASE + id);
        let failed = match self.pool.get(id).stream() {
            Some(stream) => self
                .poll
                .register(stream, token, ready, PollOpt::level())
                .is_err(),
            None => true,
        };

        if failed {
            logging::warn!(self.log, "socket registration failed"; "slot" => id);
            self.close_connection(id);
        }
    }

    /// Re-registers a connection socket for the interest its state implies:
    /// writability while connecting or while the transmit ring holds data,
    /// readability otherwise.
    fn refresh_interest(&mut self, id: usize) {
        let token = Token(CONN_TOKEN_BASE + id);
        let connection = self.pool.get(id);

        if let Some(stream) = connection.stream() {
            let ready = if connection.transport == TransportState::Connecting {
                Ready::writable()
            } else if connection.has_egress() {
                Ready::readable() | Ready::writable()
            } else {
                Ready::readable()
            };

            let _ = self.poll.reregister(stream, token, ready, PollOpt::level());
        }
    }

    fn drop_connection_stream(&mut self, id: usize) {
        if let Some(stream) = self.pool.get(id).stream() {
            let _ = self.poll.deregister(stream);
        }
        self.pool.get_mut(id).drop_stream();
    }

    /// Cooperative close: cancels the resolver while resolving (no socket
    /// exists then), otherwise closes the socket, and defers the slot free
    /// to the disconnect event.
    pub fn close_connection(&mut self, id: usize) {
        use crate::connection::ProtocolState;

        if self.pool.get(id).slot_state == SlotState::Free
            || self.pool.get(id).slot_state == SlotState::Closing
        {
            return;
        }

        if self.pool.get(id).transport == TransportState::Resolving {
            self.resolver.cancel_by_owner(ResolverOwner::Connection(id));
        } else {
            self.drop_connection_stream(id);
        }

        {
            let connection = self.pool.get_mut(id);
            connection.slot_state = SlotState::Closing;
            connection.protocol = ProtocolState::Closing;
        }

        self.signal(CoreEvent::TcpDisconnected(id));
    }

    fn flush_connection(&mut self, id: usize) {
        if self.pool.get(id).stream().is_none() {
            return;
        }

        match self.pool.get_mut(id).flush() {
            Ok(_) => self.refresh_interest(id),
            Err(err) => {
                logging::debug!(self.log, "connection write failed"; "slot" => id, "error" => %err);
                self.drop_connection_stream(id);
                self.signal(CoreEvent::TcpDisconnected(id));
            }
        }
    }

    /// Drains pending output on every live connection.
    fn flush_connections(&mut self) {
        for id in self.pool.ids() {
            let flushable = {
                let connection = self.pool.get(id);
                connection.has_egress() && connection.transport == TransportState::Connected
            };
            if flushable {
                self.flush_connection(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Resolver outcomes

    fn handle_resolution(&mut self, resolution: Resolution) {
        match resolution.owner {
            ResolverOwner::Connection(slot) => {
                {
                    let connection = self.pool.get(slot);
                    if connection.slot_state == SlotState::Free
                        || connection.transport != TransportState::Resolving
                    {
                        return;
                    }
                }

                match resolution.result {
                    Ok(ip) => {
                        let port = self.pool.get(slot).remote_port;
                        self.connect_ip(slot, ip, port);
                    }
                    Err(err) => {
                        logging::debug!(self.log, "resolve failed";
                                        "hostname" => &resolution.hostname,
                                        "error" => ?err);
                        self.signal(CoreEvent::TcpDisconnected(slot));
                    }
                }
            }
            ResolverOwner::Relay(index) => {
                if index >= self.relays.len() || self.relays[index].state != RelayState::Resolving {
                    return;
                }

                match resolution.result {
                    Ok(ip) => {
                        let connected = self.relays[index].connect(ip);
                        match connected {
                            Ok(()) => {
                                let token = Token(RELAY_TOKEN_BASE + index);
                                if let Some(stream) = self.relays[index].stream() {
                                    let _ = self.poll.register(
                                        stream,
                                        token,
                                        Ready::writable(),
                                        PollOpt::level(),
                                    );
                                }
                            }
                            Err(_) => self.relays[index].close(Instant::now()),
                        }
                    }
                    Err(err) => {
                        logging::debug!(self.log, "relay resolve failed";
                                        "hostname" => &resolution.hostname,
                                        "error" => ?err);
                        self.relays[index].close(Instant::now());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Periodic work

    fn periodic(&mut self, now: Instant) {
        self.periodic_ticks += 1;

        self.relay_periodic(now);
        self.connections_check();
        self.discovery_dials();
        self.liveness_sweep(now);

        if self.config.advertise && self.periodic_ticks % ADVERT_EVERY == 1 {
            self.advertise();
        }
    }

    fn relay_periodic(&mut self, now: Instant) {
        for index in 0..self.relays.len() {
            match self.relays[index].state {
                RelayState::Initial => {
                    let locals = self.store.local_uids();
                    if let Some(uid) = locals.first() {
                        self.open_relay(index, *uid);
                    }
                }
                RelayState::Connecting => {
                    if self.relays[index].connect_expired(now) {
                        logging::debug!(self.log, "relay connect timed out");
                        self.relays[index].close(now);
                    }
                }
                RelayState::Open | RelayState::ReadSessionId | RelayState::Wait => {
                    if self.relays[index].input_expired(now) {
                        logging::warn!(self.log, "relay control connection timed out");
                        self.relays[index].close(now);
                    }
                }
                RelayState::WaitReconnect => {
                    if self.relays[index].reconnect_due(now) {
                        self.relays[index].state = RelayState::Initial;
                    }
                }
                RelayState::Resolving | RelayState::Closing => (),
            }
        }
    }

    fn open_relay(&mut self, index: usize, uid: Uid) {
        self.relays[index].uid = uid;
        let host = self.relays[index].host.clone();

        match host.parse::<Ipv4Addr>() {
            Ok(ip) => {
                let connected = self.relays[index].connect(ip);
                match connected {
                    Ok(()) => {
                        let token = Token(RELAY_TOKEN_BASE + index);
                        if let Some(stream) = self.relays[index].stream() {
                            let _ =
                                self.poll
                                    .register(stream, token, Ready::writable(), PollOpt::level());
                        }
                    }
                    Err(_) => self.relays[index].close(Instant::now()),
                }
            }
            Err(_) => {
                self.relays[index].state = RelayState::Resolving;
                if self
                    .resolver
                    .start(ResolverOwner::Relay(index), &host)
                    .is_err()
                {
                    self.relays[index].close(Instant::now());
                }
            }
        }
    }

    /// The auto-dial sweep: enumerate pairs, skip flagged or already
    /// covered ones, dispatch the rest.
    pub fn connections_check(&mut self) {
        let plans = manager::plan_dials(&self.store, &self.pool, &self.log);
        for plan in plans {
            self.open_connection(plan);
        }
    }

    /// Dials known contacts heard on the local link, at their observed
    /// source address.
    fn discovery_dials(&mut self) {
        let locals = self.store.local_uids();
        let luid = match locals.first() {
            Some(uid) => *uid,
            None => return,
        };

        let candidates: Vec<(Uid, Ipv4Addr, u16)> = self
            .discovery
            .entries()
            .iter()
            .map(|entry| (entry.ruid, entry.ip, entry.port))
            .collect();

        for (ruid, ip, port) in candidates {
            if ruid == luid || self.pool.has_pair(&luid, &ruid) {
                continue;
            }

            let contact = match self.store.load(&ruid) {
                Ok(contact) => contact,
                Err(_) => continue,
            };
            if !contact.meta_connect() || contact.is_banned() {
                continue;
            }

            self.open_connection(DialPlan {
                luid,
                ruid,
                host: Host::Ip(ip),
                port,
            });
        }
    }

    fn liveness_sweep(&mut self, now: Instant) {
        for action in manager::sweep_liveness(&self.pool, now) {
            match action {
                LivenessAction::Ping(id) => {
                    logging::debug!(self.log, "pinging connection"; "slot" => id);
                    if self.send_session_document(id, &SessionDocument::Ping).is_err() {
                        self.close_connection(id);
                    } else {
                        self.pool.get_mut(id).ping_sent = Some(now);
                    }
                }
                LivenessAction::Close(id) => {
                    logging::debug!(self.log, "closing connection for inactivity"; "slot" => id);
                    self.close_connection(id);
                }
            }
        }
    }

    fn advertise(&mut self) {
        for uid in self.store.local_uids() {
            let identity = match self.store.load(&uid) {
                Ok(identity) => identity,
                Err(_) => continue,
            };

            let advert = Advertisement {
                wuid: identity.uid,
                whid: self.host_id,
                alias: identity.alias.clone(),
                pubkey: identity.pubkey,
                transports: identity.transports.clone(),
                class: self.config.class.clone(),
                friend_req: None,
            };

            if let Err(err) = self.discovery.advertise(&advert) {
                logging::warn!(self.log, "advertisement failed"; "error" => ?err);
            }
        }
    }
}

/// Loads the persistent host id, generating and persisting a fresh one on
/// first start.
fn load_host_id(directory: &Path) -> io::Result<HostId> {
    let path = directory.join(HOST_ID_FILE);

    if let Ok(bytes) = fs::read(&path) {
        if bytes.len() == HOST_ID_LEN {
            let mut host_id = [0u8; HOST_ID_LEN];
            host_id.copy_from_slice(&bytes);
            return Ok(host_id);
        }
    }

    let mut host_id = [0u8; HOST_ID_LEN];
    crypto::random_bytes(&mut host_id);
    fs::write(&path, &host_id)?;
    Ok(host_id)
}
