use crate::document::{self, Advertisement};
use crate::error::Result;
use crate::logging;
use crate::{HostId, Uid};
use mio::net::UdpSocket;
use net2::unix::UnixUdpBuilderExt;
use net2::UdpBuilder;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Well-known UDP port for local discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 9090;
/// Upper bound of the discovery table.
pub const TABLE_SIZE: usize = 64;

const DATAGRAM_MAX_LEN: usize = 1024;

/// One peer heard on the local link, keyed by (uid, host id).
pub struct DiscoveryEntry {
    pub ruid: Uid,
    pub rhid: HostId,
    pub alias: String,
    pub pubkey: [u8; 32],
    pub ip: Ipv4Addr,
    pub port: u16,
    pub transports: Vec<String>,
    pub class: Option<String>,
    pub friend_req: Option<Vec<u8>>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// UDP local discovery: a shared listener on the well-known port and a
/// bounded peer table fed from received advertisements.
pub struct Discovery {
    socket: Option<UdpSocket>,
    table: Vec<DiscoveryEntry>,
    log: logging::Logger,
}

impl Discovery {
    pub fn new(log: &logging::Logger) -> Discovery {
        Discovery {
            socket: None,
            table: Vec::new(),
            log: log.new(logging::o!("module" => "wld")),
        }
    }

    /// Binds the listener socket. Address and port reuse are enabled so that
    /// several nodes on the same host can co-listen on the discovery port.
    pub fn listen(&mut self) -> io::Result<&UdpSocket> {
        let socket = UdpBuilder::new_v4()?
            .reuse_address(true)?
            .reuse_port(true)?
            .bind(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DISCOVERY_PORT,
            )))?;
        socket.set_nonblocking(true)?;

        self.socket = Some(UdpSocket::from_socket(socket)?);
        logging::info!(self.log, "local discovery listening"; "port" => DISCOVERY_PORT);
        Ok(self.socket.as_ref().unwrap())
    }

    #[inline]
    pub fn socket(&self) -> Option<&UdpSocket> {
        self.socket.as_ref()
    }

    /// Drains every datagram waiting on the listener into the peer table.
    pub fn read(&mut self, now: Instant) {
        loop {
            let mut datagram = [0u8; DATAGRAM_MAX_LEN];

            let (received, from) = {
                let socket = match self.socket.as_ref() {
                    Some(socket) => socket,
                    None => return,
                };

                match socket.recv_from(&mut datagram) {
                    Ok(result) => result,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        logging::warn!(self.log, "discovery read failed"; "error" => %err);
                        return;
                    }
                }
            };

            let (ip, port) = match from {
                SocketAddr::V4(addr) => (*addr.ip(), addr.port()),
                SocketAddr::V6(_) => continue,
            };

            match document::decode::<Advertisement>(&datagram[..received]) {
                Ok(advert) => self.feed(ip, port, advert, now),
                Err(_) => {
                    logging::debug!(self.log, "malformed discovery datagram"; "from" => %ip);
                }
            }
        }
    }

    /// Inserts or refreshes a table entry. When the table is full the entry
    /// that has been silent the longest is evicted.
    pub fn feed(&mut self, ip: Ipv4Addr, port: u16, advert: Advertisement, now: Instant) {
        if let Some(entry) = self
            .table
            .iter_mut()
            .find(|entry| entry.ruid == advert.wuid && entry.rhid == advert.whid)
        {
            entry.alias = advert.alias;
            entry.pubkey = advert.pubkey;
            entry.ip = ip;
            entry.port = port;
            entry.transports = advert.transports;
            entry.class = advert.class;
            entry.friend_req = advert.friend_req;
            entry.last_seen = now;
            return;
        }

        if self.table.len() >= TABLE_SIZE {
            let oldest = self
                .table
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_seen)
                .map(|(index, _)| index)
                .expect("Full table must have an oldest entry");
            self.table.swap_remove(oldest);
        }

        logging::debug!(self.log, "discovered peer";
                        "alias" => &advert.alias,
                        "ip" => %ip,
                        "port" => port);

        self.table.push(DiscoveryEntry {
            ruid: advert.wuid,
            rhid: advert.whid,
            alias: advert.alias,
            pubkey: advert.pubkey,
            ip,
            port,
            transports: advert.transports,
            class: advert.class,
            friend_req: advert.friend_req,
            first_seen: now,
            last_seen: now,
        });
    }

    #[inline]
    pub fn entries(&self) -> &[DiscoveryEntry] {
        &self.table
    }

    pub fn find(&self, ruid: &Uid, rhid: &HostId) -> Option<&DiscoveryEntry> {
        self.table
            .iter()
            .find(|entry| entry.ruid == *ruid && entry.rhid == *rhid)
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Broadcasts one advertisement to the local link and additionally to
    /// loopback, so discovery works without an "up" interface.
    pub fn advertise(&self, advert: &Advertisement) -> Result<()> {
        let datagram = document::encode(advert)?;

        self.send(&datagram, Ipv4Addr::BROADCAST, true);
        self.send(&datagram, Ipv4Addr::LOCALHOST, false);
        Ok(())
    }

    /// One short-lived send socket per datagram. Transient network errors
    /// are logged and the broadcast retried on the next cycle; anything else
    /// aborts.
    fn send(&self, datagram: &[u8], target: Ipv4Addr, broadcast: bool) {
        let socket = ::std::net::UdpSocket::bind("0.0.0.0:0").expect("Advert socket creation failed");
        if broadcast {
            socket
                .set_broadcast(true)
                .expect("Setting SO_BROADCAST failed");
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(target, DISCOVERY_PORT));
        if let Err(err) = socket.send_to(datagram, addr) {
            match err.kind() {
                io::ErrorKind::PermissionDenied
                | io::ErrorKind::NetworkUnreachable
                | io::ErrorKind::NetworkDown => {
                    logging::warn!(self.log, "advert send failed, retrying next cycle";
                                   "target" => %target,
                                   "error" => %err);
                }
                _ => panic!("Local discovery send failed: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn advert(uid_byte: u8, hid_byte: u8, alias: &str) -> Advertisement {
        Advertisement {
            wuid: [uid_byte; 32],
            whid: [hid_byte; 32],
            alias: alias.to_string(),
            pubkey: [5u8; 32],
            transports: vec![format!("wish://10.0.0.{}:37008", uid_byte)],
            class: None,
            friend_req: None,
        }
    }

    #[test]
    fn test_feed_inserts_and_refreshes() {
        let mut discovery = Discovery::new(&logging::discard());
        let now = Instant::now();

        discovery.feed(Ipv4Addr::new(127, 0, 0, 1), 41000, advert(1, 1, "alice"), now);
        assert_eq!(discovery.entries().len(), 1);
        assert_eq!(discovery.entries()[0].port, 41000);

        // The same (uid, hostid) pair refreshes in place.
        let later = now + ::std::time::Duration::from_secs(3);
        discovery.feed(Ipv4Addr::new(127, 0, 0, 1), 42000, advert(1, 1, "alice"), later);
        assert_eq!(discovery.entries().len(), 1);
        assert_eq!(discovery.entries()[0].port, 42000);
        assert_eq!(discovery.entries()[0].first_seen, now);
        assert_eq!(discovery.entries()[0].last_seen, later);

        // A different host id is a distinct entry.
        discovery.feed(Ipv4Addr::new(127, 0, 0, 1), 42000, advert(1, 2, "alice"), later);
        assert_eq!(discovery.entries().len(), 2);
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let mut discovery = Discovery::new(&logging::discard());
        let base = Instant::now();

        for i in 0..TABLE_SIZE {
            discovery.feed(
                Ipv4Addr::new(10, 0, 0, 1),
                40000,
                advert(i as u8, i as u8, "peer"),
                base + ::std::time::Duration::from_millis(i as u64),
            );
        }
        assert_eq!(discovery.entries().len(), TABLE_SIZE);

        // Entry 0 is the stalest and must give way.
        discovery.feed(
            Ipv4Addr::new(10, 0, 0, 2),
            40000,
            advert(200, 200, "newcomer"),
            base + ::std::time::Duration::from_secs(10),
        );

        assert_eq!(discovery.entries().len(), TABLE_SIZE);
        assert!(discovery.find(&[0u8; 32], &[0u8; 32]).is_none());
        assert!(discovery.find(&[200u8; 32], &[200u8; 32]).is_some());
    }

    #[test]
    fn test_clear() {
        let mut discovery = Discovery::new(&logging::discard());
        discovery.feed(
            Ipv4Addr::new(10, 0, 0, 1),
            40000,
            advert(1, 1, "alice"),
            Instant::now(),
        );

        discovery.clear();
        assert!(discovery.entries().is_empty());
    }

    #[test]
    fn test_datagram_roundtrip_over_loopback() {
        let mut listener = Discovery::new(&logging::discard());
        // Skip when the discovery port is unavailable in the sandbox.
        if listener.listen().is_err() {
            return;
        }

        let sender = Discovery::new(&logging::discard());
        sender.advertise(&advert(7, 7, "alice")).unwrap();

        // Poll briefly for the loopback datagram.
        let deadline = Instant::now() + ::std::time::Duration::from_secs(2);
        while Instant::now() < deadline {
            listener.read(Instant::now());
            if listener.find(&[7u8; 32], &[7u8; 32]).is_some() {
                break;
            }
            ::std::thread::sleep(::std::time::Duration::from_millis(10));
        }

        let entry = listener
            .find(&[7u8; 32], &[7u8; 32])
            .expect("Loopback advert must be heard");
        assert_eq!(entry.ip, Ipv4Addr::LOCALHOST);
        assert_eq!(entry.alias, "alice");
    }
}
