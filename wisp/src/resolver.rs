use crate::crypto;
use crate::error::{Error, Result};
use crate::logging;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

/// A query that has produced no answer after this long signals its owner.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

const DNS_PORT: u16 = 53;
const QUERY_TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;
const RCODE_NXDOMAIN: u8 = 3;
const ANSWER_BUF_LEN: usize = 512;

/// The single owner a resolver acts for. Exactly one variant exists per
/// resolver, which makes the connection-xor-relay invariant structural.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResolverOwner {
    Connection(usize),
    Relay(usize),
}

/// Terminal outcome of one resolver, handed back to the owner.
pub struct Resolution {
    pub owner: ResolverOwner,
    pub hostname: String,
    pub result: Result<Ipv4Addr>,
}

struct PendingQuery {
    owner: ResolverOwner,
    socket: UdpSocket,
    id: u16,
    hostname: String,
    started: Instant,
}

/// Cooperative A-record resolver. Each query owns a nonblocking UDP socket
/// towards the system nameserver; `poll_all` advances every pending query
/// without blocking and detaches the finished ones.
pub struct Resolver {
    server: SocketAddr,
    pending: Vec<PendingQuery>,
    log: logging::Logger,
}

impl Resolver {
    pub fn new(log: &logging::Logger) -> Resolver {
        let nameserver = nameserver_from_resolv_conf();

        Resolver {
            server: SocketAddr::V4(SocketAddrV4::new(nameserver, DNS_PORT)),
            pending: Vec::new(),
            log: log.new(logging::o!("module" => "resolver")),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Constructs and enqueues a query for the owner.
    pub fn start(&mut self, owner: ResolverOwner, hostname: &str) -> Result<()> {
        let mut id_bytes = [0u8; 2];
        crypto::random_bytes(&mut id_bytes);
        let id = BigEndian::read_u16(&id_bytes);

        let query = encode_query(id, hostname)?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        socket.connect(self.server)?;
        socket.send(&query)?;

        logging::debug!(self.log, "query started";
                        "hostname" => hostname,
                        "owner" => ?owner);

        self.pending.push(PendingQuery {
            owner,
            socket,
            id,
            hostname: hostname.to_string(),
            started: Instant::now(),
        });

        Ok(())
    }

    /// Drops any resolver pointing at the owner without signalling. Used
    /// when the owner itself is being closed.
    pub fn cancel_by_owner(&mut self, owner: ResolverOwner) {
        self.pending.retain(|query| query.owner != owner);
    }

    /// Advances every pending query. Completed queries are detached and
    /// their outcomes returned for the owners' address-ready callbacks.
    pub fn poll_all(&mut self) -> Vec<Resolution> {
        let now = Instant::now();
        let mut outcomes = Vec::new();
        let mut index = 0;

        while index < self.pending.len() {
            let finished = {
                let query = &self.pending[index];
                let mut answer = [0u8; ANSWER_BUF_LEN];

                match query.socket.recv(&mut answer) {
                    Ok(received) => match parse_answer(query.id, &answer[..received]) {
                        // A reply for some other id is not ours to act on.
                        Err(Error::Wait) => None,
                        result => Some(result),
                    },
                    Err(ref err) if err.kind() == ::std::io::ErrorKind::WouldBlock => None,
                    Err(err) => Some(Err(err.into())),
                }
            };

            let finished = match finished {
                Some(result) => Some(result),
                None if now.duration_since(self.pending[index].started) >= RESOLVE_TIMEOUT => {
                    Some(Err(Error::Timeout))
                }
                None => None,
            };

            match finished {
                Some(result) => {
                    let query = self.pending.swap_remove(index);
                    logging::debug!(self.log, "query finished";
                                    "hostname" => &query.hostname,
                                    "result" => ?result);
                    outcomes.push(Resolution {
                        owner: query.owner,
                        hostname: query.hostname,
                        result,
                    });
                }
                None => index += 1,
            }
        }

        outcomes
    }
}

/// First `nameserver` entry of /etc/resolv.conf, falling back to loopback.
fn nameserver_from_resolv_conf() -> Ipv4Addr {
    if let Ok(contents) = fs::read_to_string("/etc/resolv.conf") {
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some("nameserver") {
                if let Some(addr) = fields.next().and_then(|addr| addr.parse().ok()) {
                    return addr;
                }
            }
        }
    }

    Ipv4Addr::LOCALHOST
}

/// Renders a single A query with recursion desired.
fn encode_query(id: u16, hostname: &str) -> Result<Vec<u8>> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::BadTransport);
    }

    let mut query = Vec::with_capacity(17 + hostname.len());
    query.write_u16::<BigEndian>(id)?;
    query.write_u16::<BigEndian>(0x0100)?; // flags: recursion desired
    query.write_u16::<BigEndian>(1)?; // questions
    query.write_u16::<BigEndian>(0)?; // answers
    query.write_u16::<BigEndian>(0)?; // authorities
    query.write_u16::<BigEndian>(0)?; // additionals

    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(Error::BadTransport);
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);

    query.write_u16::<BigEndian>(QUERY_TYPE_A)?;
    query.write_u16::<BigEndian>(CLASS_IN)?;
    Ok(query)
}

/// Parses the first A record out of an answer. `Wait` means the datagram
/// belongs to another query and should be ignored.
fn parse_answer(id: u16, answer: &[u8]) -> Result<Ipv4Addr> {
    if answer.len() < 12 {
        return Err(Error::Resolve);
    }

    if BigEndian::read_u16(&answer[0..2]) != id {
        return Err(Error::Wait);
    }

    let flags = BigEndian::read_u16(&answer[2..4]);
    if flags & 0x8000 == 0 {
        return Err(Error::Resolve);
    }

    let rcode = (flags & 0x000f) as u8;
    if rcode == RCODE_NXDOMAIN {
        return Err(Error::Resolve);
    }
    if rcode != 0 {
        return Err(Error::Resolve);
    }

    let question_count = BigEndian::read_u16(&answer[4..6]);
    let answer_count = BigEndian::read_u16(&answer[6..8]);

    let mut cursor = 12;
    for _ in 0..question_count {
        cursor = skip_name(answer, cursor)?;
        cursor += 4; // qtype + qclass
    }

    for _ in 0..answer_count {
        cursor = skip_name(answer, cursor)?;
        if cursor + 10 > answer.len() {
            return Err(Error::Resolve);
        }

        let rr_type = BigEndian::read_u16(&answer[cursor..cursor + 2]);
        let rr_class = BigEndian::read_u16(&answer[cursor + 2..cursor + 4]);
        let rd_len = BigEndian::read_u16(&answer[cursor + 8..cursor + 10]) as usize;
        cursor += 10;

        if cursor + rd_len > answer.len() {
            return Err(Error::Resolve);
        }

        if rr_type == QUERY_TYPE_A && rr_class == CLASS_IN && rd_len == 4 {
            return Ok(Ipv4Addr::new(
                answer[cursor],
                answer[cursor + 1],
                answer[cursor + 2],
                answer[cursor + 3],
            ));
        }

        cursor += rd_len;
    }

    Err(Error::Resolve)
}

/// Advances past an encoded name, which is either a label sequence, a
/// compression pointer, or labels terminated by a pointer.
fn skip_name(answer: &[u8], mut cursor: usize) -> Result<usize> {
    loop {
        let len = *answer.get(cursor).ok_or(Error::Resolve)? as usize;

        if len & 0xc0 == 0xc0 {
            return Ok(cursor + 2);
        }

        if len == 0 {
            return Ok(cursor + 1);
        }

        cursor += len + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn resolver_against(server: SocketAddr) -> Resolver {
        crypto::init();

        Resolver {
            server,
            pending: Vec::new(),
            log: logging::discard(),
        }
    }

    /// Renders an answer with a compression pointer back at the question.
    fn encode_answer(query: &[u8], rcode: u8, address: Option<Ipv4Addr>) -> Vec<u8> {
        let mut answer = query.to_vec();
        answer[2] = 0x81; // response, recursion desired
        answer[3] = 0x80 | rcode;

        let answer_count: u16 = if address.is_some() { 1 } else { 0 };
        BigEndian::write_u16(&mut answer[6..8], answer_count);

        if let Some(address) = address {
            answer.extend_from_slice(&[0xc0, 0x0c]); // name pointer to offset 12
            answer.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // type A, class IN
            answer.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c]); // ttl
            answer.extend_from_slice(&[0x00, 0x04]);
            answer.extend_from_slice(&address.octets());
        }

        answer
    }

    #[test]
    fn test_query_encoding() {
        let query = encode_query(0x1234, "peer.example.com").unwrap();

        assert_eq!(&query[0..2], &[0x12, 0x34]);
        assert_eq!(&query[2..4], &[0x01, 0x00]);
        // 4peer7example3com0
        assert_eq!(&query[12..14], &[4, b'p']);
        assert_eq!(query[query.len() - 4..], [0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_query_encoding_rejects_bad_names() {
        assert_eq!(encode_query(1, "").unwrap_err(), Error::BadTransport);
        assert_eq!(encode_query(1, "a..b").unwrap_err(), Error::BadTransport);

        let long_label = "a".repeat(64);
        assert_eq!(encode_query(1, &long_label).unwrap_err(), Error::BadTransport);
    }

    #[test]
    fn test_resolution_against_mock_server() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = resolver_against(server.local_addr().unwrap());

        resolver
            .start(ResolverOwner::Connection(4), "peer.example.com")
            .unwrap();
        assert_eq!(resolver.len(), 1);

        // The mock nameserver echoes back an A record.
        let mut query = [0u8; 512];
        let (received, from) = server.recv_from(&mut query).unwrap();
        let answer = encode_answer(&query[..received], 0, Some(Ipv4Addr::new(10, 1, 2, 3)));
        server.send_to(&answer, from).unwrap();

        let outcomes = loop {
            let outcomes = resolver.poll_all();
            if !outcomes.is_empty() {
                break outcomes;
            }
        };

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].owner, ResolverOwner::Connection(4));
        assert_eq!(outcomes[0].result, Ok(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn test_nxdomain_signals_owner() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = resolver_against(server.local_addr().unwrap());

        resolver
            .start(ResolverOwner::Relay(0), "nonexistent.invalid")
            .unwrap();

        let mut query = [0u8; 512];
        let (received, from) = server.recv_from(&mut query).unwrap();
        let answer = encode_answer(&query[..received], RCODE_NXDOMAIN, None);
        server.send_to(&answer, from).unwrap();

        let outcomes = loop {
            let outcomes = resolver.poll_all();
            if !outcomes.is_empty() {
                break outcomes;
            }
        };

        assert_eq!(outcomes[0].result, Err(Error::Resolve));
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn test_timeout_detaches_resolver() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = resolver_against(server.local_addr().unwrap());

        resolver
            .start(ResolverOwner::Connection(9), "peer.example.com")
            .unwrap();
        assert!(resolver.poll_all().is_empty());

        // Age the query past the deadline.
        resolver.pending[0].started = Instant::now() - RESOLVE_TIMEOUT;

        let outcomes = resolver.poll_all();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result, Err(Error::Timeout));
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn test_cancel_by_owner_drops_silently() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut resolver = resolver_against(server.local_addr().unwrap());

        resolver
            .start(ResolverOwner::Connection(1), "one.example.com")
            .unwrap();
        resolver
            .start(ResolverOwner::Relay(1), "two.example.com")
            .unwrap();

        resolver.cancel_by_owner(ResolverOwner::Connection(1));

        assert_eq!(resolver.len(), 1);
        assert_eq!(resolver.pending[0].owner, ResolverOwner::Relay(1));
    }
}
