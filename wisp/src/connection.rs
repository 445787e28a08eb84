use crate::buffer::Buffer;
use crate::document::Assembler;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::logging;
use crate::relay::SESSION_ID_LEN;
use crate::wire::{self, Cipher, ConnectionType, HandshakeDoc, HandshakeMsg};
use crate::{HostId, Uid};
use indexmap::IndexSet;
use mio::net::TcpStream;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Number of connection slots in the pool.
pub const CONNECTION_POOL_SIZE: usize = 1000;
pub const RX_RING_SIZE: usize = 32 * 1024;
pub const TX_RING_SIZE: usize = 64 * 1024;

/// A quiet connection is pinged after this long without input.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);
/// A connection with an outstanding ping and no input for this long is dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);
/// Resolve + connect + handshake must finish within this window.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

const NULL_ID: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SlotState {
    Free,
    InMaking,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportState {
    Resolving,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolState {
    Initial,
    Handshake,
    Running,
    Closing,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One slot of the connection pool. The slot exclusively owns its socket and
/// its receive/transmit rings; the relay back reference is a handle into the
/// core's session list, never ownership.
pub struct Connection {
    pub luid: Uid,
    pub ruid: Uid,
    pub rhid: HostId,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,

    stream: Option<TcpStream>,
    pub rx: Buffer,
    tx: Buffer,

    pub slot_state: SlotState,
    pub transport: TransportState,
    pub protocol: ProtocolState,
    pub direction: Direction,
    pub kind: ConnectionType,
    pub via_relay: bool,
    pub friend_req: bool,
    pub relay: Option<usize>,

    pub last_input: Instant,
    pub ping_sent: Option<Instant>,

    preamble_seen: bool,
    sent_handshake: bool,
    exchange_secret: [u8; wire::EXCHANGE_LEN],
    exchange_pub: [u8; wire::EXCHANGE_LEN],
    cipher: Option<Cipher>,
    assembler: Assembler,

    log: logging::Logger,
}

impl Connection {
    fn new(log: logging::Logger) -> Connection {
        Connection {
            luid: NULL_ID,
            ruid: NULL_ID,
            rhid: NULL_ID,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            stream: None,
            rx: Buffer::new(RX_RING_SIZE),
            tx: Buffer::new(TX_RING_SIZE),
            slot_state: SlotState::Free,
            transport: TransportState::Connecting,
            protocol: ProtocolState::Initial,
            direction: Direction::Outgoing,
            kind: ConnectionType::Normal,
            via_relay: false,
            friend_req: false,
            relay: None,
            last_input: Instant::now(),
            ping_sent: None,
            preamble_seen: false,
            sent_handshake: false,
            exchange_secret: [0u8; wire::EXCHANGE_LEN],
            exchange_pub: [0u8; wire::EXCHANGE_LEN],
            cipher: None,
            assembler: Assembler::new(),
            log,
        }
    }

    /// Puts the slot back into its pristine state for reuse. The rings are
    /// retained across opens; only their contents are dropped.
    fn reset(&mut self) {
        self.luid = NULL_ID;
        self.ruid = NULL_ID;
        self.rhid = NULL_ID;
        self.remote_ip = Ipv4Addr::UNSPECIFIED;
        self.remote_port = 0;
        self.stream = None;
        self.rx.clear();
        self.tx.clear();
        self.slot_state = SlotState::Free;
        self.transport = TransportState::Connecting;
        self.protocol = ProtocolState::Initial;
        self.direction = Direction::Outgoing;
        self.kind = ConnectionType::Normal;
        self.via_relay = false;
        self.friend_req = false;
        self.relay = None;
        self.ping_sent = None;
        self.preamble_seen = false;
        self.sent_handshake = false;
        self.exchange_secret = [0u8; wire::EXCHANGE_LEN];
        self.exchange_pub = [0u8; wire::EXCHANGE_LEN];
        self.cipher = None;
        self.assembler.reset();
    }

    /// Marks the slot as an outgoing connection between the uid pair.
    pub fn open_outgoing(&mut self, luid: &Uid, ruid: &Uid, kind: ConnectionType) {
        self.slot_state = SlotState::InMaking;
        self.direction = Direction::Outgoing;
        self.protocol = ProtocolState::Initial;
        self.luid = *luid;
        self.ruid = *ruid;
        self.kind = kind;
        self.friend_req = kind == ConnectionType::FriendRequest;
        self.last_input = Instant::now();
    }

    /// Marks the slot as an accepted incoming connection. The identities are
    /// established during the handshake.
    pub fn open_incoming(&mut self, stream: TcpStream) {
        self.slot_state = SlotState::InMaking;
        self.direction = Direction::Incoming;
        self.transport = TransportState::Connected;
        self.protocol = ProtocolState::Handshake;
        self.stream = Some(stream);
        self.last_input = Instant::now();
    }

    /// The host is being resolved; no socket exists in this state.
    pub fn begin_resolve(&mut self, port: u16) {
        self.transport = TransportState::Resolving;
        self.remote_port = port;
    }

    /// Starts a nonblocking connect towards the address.
    pub fn connect(&mut self, ip: Ipv4Addr, port: u16) -> io::Result<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
        let stream = TcpStream::connect(&addr)?;
        stream.set_nodelay(true)?;

        self.remote_ip = ip;
        self.remote_port = port;
        self.transport = TransportState::Connecting;
        self.stream = Some(stream);
        self.last_input = Instant::now();

        logging::debug!(self.log, "connect started";
                        "ip" => %ip,
                        "port" => port,
                        "via_relay" => self.via_relay);
        Ok(())
    }

    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Releases the send side, shutting the socket down.
    pub fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(::std::net::Shutdown::Both);
        }
    }

    /// Reads the SO_ERROR style connect outcome after writable readiness.
    pub fn connect_outcome(&self) -> io::Result<()> {
        let stream = self.stream.as_ref().expect("Connecting slot must own a socket");
        match stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queues the stored relay session id as the very first bytes on the
    /// wire of a punched connection.
    pub fn queue_session_id(&mut self, session_id: &[u8; SESSION_ID_LEN]) -> Result<()> {
        if self.tx.write(session_id) != SESSION_ID_LEN {
            return Err(Error::Backpressure);
        }
        Ok(())
    }

    /// Queues the preamble and the local handshake message.
    pub fn start_handshake(&mut self, local: &Identity, host_id: &HostId) -> Result<()> {
        let (message, secret) = wire::build_handshake(local, host_id)?;
        self.exchange_secret = secret;
        self.exchange_pub
            .copy_from_slice(&message[..wire::EXCHANGE_LEN]);

        let preamble = wire::preamble(self.kind);
        if self.tx.write(&preamble) != preamble.len() || self.tx.write(&message) != message.len() {
            return Err(Error::Backpressure);
        }

        self.luid = local.uid;
        self.sent_handshake = true;
        self.protocol = ProtocolState::Handshake;

        logging::debug!(self.log, "handshake queued"; "kind" => ?self.kind);
        Ok(())
    }

    #[inline]
    pub fn handshake_sent(&self) -> bool {
        self.sent_handshake
    }

    /// Consumes the peer preamble once three bytes are available, returning
    /// true when it has been seen. Incoming connections adopt the peer's
    /// connection type; outgoing ones require their own type echoed back.
    pub fn take_preamble(&mut self) -> Result<bool> {
        if self.preamble_seen {
            return Ok(true);
        }

        let mut bytes = [0u8; wire::PREAMBLE_LEN];
        if self.rx.peek(&mut bytes) < wire::PREAMBLE_LEN {
            return Ok(false);
        }
        self.rx.skip(wire::PREAMBLE_LEN);

        let kind = wire::parse_preamble(&bytes)?;
        match kind {
            ConnectionType::Normal | ConnectionType::FriendRequest => (),
            _ => return Err(Error::BadPreamble),
        }

        if self.sent_handshake {
            if kind != self.kind {
                return Err(Error::BadPreamble);
            }
        } else {
            self.kind = kind;
            self.friend_req = kind == ConnectionType::FriendRequest;
        }

        self.preamble_seen = true;
        Ok(true)
    }

    /// Reads the peer handshake message, or None while it is incomplete.
    pub fn read_peer_handshake(&mut self) -> Result<Option<HandshakeMsg>> {
        if !self.preamble_seen || !self.sent_handshake {
            return Ok(None);
        }

        match wire::read_handshake(&mut self.rx) {
            Ok(message) => Ok(Some(message)),
            Err(Error::Wait) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Verifies the peer handshake, fixes the remote identities and derives
    /// the session cipher. The connection is running afterwards.
    pub fn complete_handshake(&mut self, message: &HandshakeMsg) -> Result<HandshakeDoc> {
        let doc = wire::verify_handshake(message)?;

        // An outgoing dial knows who it wants to talk to.
        if self.ruid != NULL_ID && self.ruid != doc.uid {
            return Err(Error::AuthFailed);
        }

        self.ruid = doc.uid;
        self.rhid = doc.host_id;
        self.cipher = Some(Cipher::derive(
            self.kind,
            &self.exchange_secret,
            &self.exchange_pub,
            &message.exchange_pub,
        )?);
        self.protocol = ProtocolState::Running;

        logging::debug!(self.log, "handshake complete";
                        "direction" => ?self.direction,
                        "via_relay" => self.via_relay);
        Ok(doc)
    }

    /// Wraps a document into frames and queues them for transmission.
    pub fn enqueue_document(&mut self, doc: &[u8]) -> Result<()> {
        let cipher = self.cipher.as_mut().ok_or(Error::Protocol)?;
        let frames = cipher.seal_document(doc)?;

        if frames.len() > self.tx.space() {
            return Err(Error::Backpressure);
        }

        self.tx.write(&frames);
        Ok(())
    }

    /// Decrypts buffered frames and reassembles the next whole document, or
    /// None when the stream is exhausted for now.
    pub fn next_document(&mut self) -> Result<Option<Vec<u8>>> {
        let cipher = self.cipher.as_mut().ok_or(Error::Protocol)?;

        loop {
            let fragment = match cipher.open(&mut self.rx) {
                Ok(fragment) => fragment,
                Err(Error::Wait) => return Ok(None),
                Err(err) => return Err(err),
            };

            match self.assembler.push(&fragment) {
                Ok(document) => return Ok(Some(document)),
                Err(Error::Wait) => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Reads everything available off the socket into the receive ring.
    pub fn fill(&mut self, now: Instant) -> io::Result<usize> {
        let stream = self.stream.as_ref().expect("Readable slot must own a socket");
        let received = self.rx.ingress(stream)?;

        if received > 0 {
            self.last_input = now;
        }
        Ok(received)
    }

    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.tx.is_empty()
    }

    /// Drains the transmit ring to the socket. Short writes leave the tail
    /// queued for the next writable-readiness pass, preserving order.
    pub fn flush(&mut self) -> io::Result<usize> {
        let stream = match self.stream.as_ref() {
            Some(stream) => stream,
            None => return Ok(0),
        };
        self.tx.egress(stream)
    }

    /// True when the quiet period warrants a ping and none is outstanding.
    pub fn should_ping(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= PING_INTERVAL
            && self.ping_sent.map_or(true, |sent| sent <= self.last_input)
    }

    /// True when a ping is outstanding and the peer stayed silent too long.
    pub fn ping_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= PING_TIMEOUT
            && self.ping_sent.map_or(false, |sent| sent > self.last_input)
    }

    /// True when connection setup has exceeded its window.
    pub fn setup_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= SETUP_TIMEOUT
    }
}

/// The fixed-size pool of connection slots. Slots are recycled through a
/// free list; the live set tracks every slot that is not free.
pub struct ConnectionPool {
    slots: Vec<Connection>,
    free: Vec<usize>,
    live: IndexSet<usize>,
    capacity: usize,
    log: logging::Logger,
}

impl ConnectionPool {
    pub fn new(capacity: usize, log: &logging::Logger) -> ConnectionPool {
        ConnectionPool {
            slots: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            capacity,
            log: log.new(logging::o!("module" => "pool")),
        }
    }

    /// Claims a slot, reusing a freed one when available. Fails cleanly when
    /// the pool is exhausted.
    pub fn allocate(&mut self) -> Result<usize> {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                if self.slots.len() >= self.capacity {
                    logging::warn!(self.log, "connection pool exhausted"; "capacity" => self.capacity);
                    return Err(Error::PoolExhausted);
                }
                let id = self.slots.len();
                self.slots
                    .push(Connection::new(self.log.new(logging::o!("slot" => id))));
                id
            }
        };

        self.live.insert(id);
        self.slots[id].slot_state = SlotState::InMaking;
        self.slots[id].last_input = Instant::now();
        Ok(id)
    }

    /// Returns the slot to the free list.
    pub fn release(&mut self, id: usize) {
        self.slots[id].reset();
        self.live.remove(&id);
        self.free.push(id);
    }

    #[inline]
    pub fn get(&self, id: usize) -> &Connection {
        &self.slots[id]
    }

    #[inline]
    pub fn get_mut(&mut self, id: usize) -> &mut Connection {
        &mut self.slots[id]
    }

    /// Slots currently in use, in insertion order.
    pub fn ids(&self) -> Vec<usize> {
        self.live.iter().cloned().collect()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.live.len()
    }

    /// True when a connected session already exists for the uid pair.
    pub fn is_connected_pair(&self, luid: &Uid, ruid: &Uid) -> bool {
        self.live.iter().any(|&id| {
            let slot = &self.slots[id];
            slot.slot_state == SlotState::Connected && slot.luid == *luid && slot.ruid == *ruid
        })
    }

    /// True when any slot, connected or still in the making, carries the
    /// uid pair. Guards the auto-dialer against stacking parallel dials.
    pub fn has_pair(&self, luid: &Uid, ruid: &Uid) -> bool {
        self.live.iter().any(|&id| {
            let slot = &self.slots[id];
            slot.slot_state != SlotState::Free && slot.luid == *luid && slot.ruid == *ruid
        })
    }

    /// Other connected slots carrying the same (luid, ruid, rhid) triple.
    pub fn duplicates_of(&self, id: usize) -> Vec<usize> {
        let reference = &self.slots[id];

        self.live
            .iter()
            .cloned()
            .filter(|&other| {
                if other == id {
                    return false;
                }
                let slot = &self.slots[other];
                slot.slot_state == SlotState::Connected
                    && slot.luid == reference.luid
                    && slot.ruid == reference.ruid
                    && slot.rhid == reference.rhid
            })
            .collect()
    }

    /// Slots whose local or remote identity matches the uid. Used by the
    /// identity-removal cascade.
    pub fn referencing(&self, uid: &Uid) -> Vec<usize> {
        self.live
            .iter()
            .cloned()
            .filter(|&id| {
                let slot = &self.slots[id];
                slot.luid == *uid || slot.ruid == *uid
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use crate::document::{self, SessionDocument};
    use crate::identity::{self, Identity};
    use crate::logging;

    fn local_identity(alias: &str) -> Identity {
        crypto::init();

        let mut seed = [0u8; crypto::SIGN_SEED_SIZE];
        crypto::random_bytes(&mut seed);
        let (pubkey, privkey) = crypto::sign_keypair(&seed);

        Identity {
            uid: identity::pubkey_to_uid(&pubkey),
            pubkey,
            privkey: Some(privkey.to_vec()),
            alias: alias.to_string(),
            transports: Vec::new(),
            meta: None,
            permissions: None,
        }
    }

    fn drain_tx(connection: &mut Connection) -> Vec<u8> {
        let mut bytes = Vec::new();
        connection.tx.egress(&mut bytes).unwrap();
        bytes
    }

    /// Runs the wire conversation between an outgoing and an incoming slot
    /// without sockets, by shuttling ring contents directly.
    fn handshake_pair(
        a: &mut Connection,
        b: &mut Connection,
        ident_a: &Identity,
        ident_b: &Identity,
        hid_a: &HostId,
        hid_b: &HostId,
    ) {
        a.open_outgoing(&ident_a.uid, &ident_b.uid, ConnectionType::Normal);
        a.start_handshake(ident_a, hid_a).unwrap();

        b.slot_state = SlotState::InMaking;
        b.direction = Direction::Incoming;
        b.protocol = ProtocolState::Handshake;

        // a -> b: preamble + handshake message.
        let bytes = drain_tx(a);
        b.rx.write(&bytes);

        assert!(b.take_preamble().unwrap());
        assert_eq!(b.kind, ConnectionType::Normal);
        b.start_handshake(ident_b, hid_b).unwrap();
        let message = b.read_peer_handshake().unwrap().unwrap();
        let doc = b.complete_handshake(&message).unwrap();
        assert_eq!(doc.uid, ident_a.uid);

        // b -> a: the reply leg.
        let bytes = drain_tx(b);
        a.rx.write(&bytes);

        assert!(a.take_preamble().unwrap());
        let message = a.read_peer_handshake().unwrap().unwrap();
        let doc = a.complete_handshake(&message).unwrap();
        assert_eq!(doc.uid, ident_b.uid);

        assert_eq!(a.protocol, ProtocolState::Running);
        assert_eq!(b.protocol, ProtocolState::Running);
        assert_eq!(a.rhid, *hid_b);
        assert_eq!(b.rhid, *hid_a);
    }

    #[test]
    fn test_handshake_and_document_exchange() {
        let ident_a = local_identity("alice");
        let ident_b = local_identity("bob");

        let mut a = Connection::new(logging::discard());
        let mut b = Connection::new(logging::discard());
        handshake_pair(&mut a, &mut b, &ident_a, &ident_b, &[1u8; 32], &[2u8; 32]);

        // Documents flow in order and without loss.
        let ping = document::encode(&SessionDocument::Ping).unwrap();
        let payload = document::encode(&SessionDocument::Payload(vec![5u8; 100])).unwrap();
        a.enqueue_document(&ping).unwrap();
        a.enqueue_document(&payload).unwrap();

        let bytes = drain_tx(&mut a);
        b.rx.write(&bytes);

        assert_eq!(b.next_document().unwrap().unwrap(), ping);
        assert_eq!(b.next_document().unwrap().unwrap(), payload);
        assert_eq!(b.next_document().unwrap(), None);
    }

    #[test]
    fn test_outgoing_rejects_unexpected_peer() {
        let ident_a = local_identity("alice");
        let ident_b = local_identity("bob");
        let ident_mallory = local_identity("mallory");

        let mut a = Connection::new(logging::discard());
        a.open_outgoing(&ident_a.uid, &ident_b.uid, ConnectionType::Normal);
        a.start_handshake(&ident_a, &[1u8; 32]).unwrap();
        drain_tx(&mut a);

        // Mallory answers instead of bob.
        let mut mallory = Connection::new(logging::discard());
        mallory.kind = ConnectionType::Normal;
        mallory
            .start_handshake(&ident_mallory, &[9u8; 32])
            .unwrap();
        let bytes = drain_tx(&mut mallory);
        a.rx.write(&bytes);

        a.take_preamble().unwrap();
        let message = a.read_peer_handshake().unwrap().unwrap();
        assert_eq!(a.complete_handshake(&message).unwrap_err(), Error::AuthFailed);
    }

    #[test]
    fn test_session_id_precedes_preamble() {
        let ident = local_identity("alice");

        let mut punched = Connection::new(logging::discard());
        punched.via_relay = true;
        punched.queue_session_id(&[7u8; SESSION_ID_LEN]).unwrap();
        punched.start_handshake(&ident, &[1u8; 32]).unwrap();

        let bytes = drain_tx(&mut punched);
        assert_eq!(&bytes[..SESSION_ID_LEN], &[7u8; SESSION_ID_LEN]);
        assert_eq!(
            &bytes[SESSION_ID_LEN..SESSION_ID_LEN + 3],
            &wire::preamble(ConnectionType::Normal)
        );
    }

    #[test]
    fn test_ping_policy() {
        let mut connection = Connection::new(logging::discard());
        let now = Instant::now();
        connection.last_input = now;

        assert!(!connection.should_ping(now));

        let later = now + PING_INTERVAL;
        assert!(connection.should_ping(later));

        // With a ping outstanding no further ping is queued.
        connection.ping_sent = Some(later);
        assert!(!connection.should_ping(later + Duration::from_secs(1)));
        assert!(!connection.ping_expired(later + Duration::from_secs(1)));

        // Silence past the timeout kills the connection.
        assert!(connection.ping_expired(now + PING_TIMEOUT));

        // Input after the ping clears the outstanding state.
        connection.last_input = later + Duration::from_secs(2);
        assert!(!connection.ping_expired(later + Duration::from_secs(3)));
    }

    #[test]
    fn test_pool_allocate_release_reuse() {
        let mut pool = ConnectionPool::new(2, &logging::discard());

        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.allocate().unwrap_err(), Error::PoolExhausted);

        pool.release(first);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.get(first).slot_state, SlotState::Free);

        // The freed slot is recycled.
        assert_eq!(pool.allocate().unwrap(), first);
        let _ = second;
    }

    #[test]
    fn test_pool_pair_and_duplicate_lookup() {
        let mut pool = ConnectionPool::new(8, &logging::discard());
        let luid = [1u8; 32];
        let ruid = [2u8; 32];
        let rhid = [3u8; 32];

        let first = pool.allocate().unwrap();
        {
            let slot = pool.get_mut(first);
            slot.luid = luid;
            slot.ruid = ruid;
            slot.rhid = rhid;
            slot.slot_state = SlotState::Connected;
        }

        assert!(pool.is_connected_pair(&luid, &ruid));
        assert!(!pool.is_connected_pair(&ruid, &luid));

        let second = pool.allocate().unwrap();
        {
            let slot = pool.get_mut(second);
            slot.luid = luid;
            slot.ruid = ruid;
            slot.rhid = rhid;
            slot.slot_state = SlotState::Connected;
        }

        assert_eq!(pool.duplicates_of(first), vec![second]);
        assert_eq!(pool.duplicates_of(second), vec![first]);

        assert_eq!(pool.referencing(&ruid).len(), 2);
        assert!(pool.referencing(&[9u8; 32]).is_empty());
    }
}
