use crate::buffer::Buffer;
use crate::document::{self, AppLogin, Assembler};
use crate::error::Error;
use crate::logging;
use crate::wire::{self, ConnectionType};
use crate::Wsid;
use byteorder::{BigEndian, ByteOrder};
use mio::net::{TcpListener, TcpStream};
use net2::TcpBuilder;
use std::io;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const APP_PORT_DEFAULT: u16 = 9094;
/// Number of app IPC connection slots, which also bounds the registry.
pub const MAX_APPS: usize = 10;

const APP_RX_RING: usize = 16 * 1024;
const LISTEN_BACKLOG: i32 = MAX_APPS as i32;

/// A service announced by an app over the IPC pipe.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEntry {
    pub wsid: Wsid,
    pub name: String,
}

/// Bounded registry of the services currently logged in.
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
}

impl ServiceRegistry {
    pub fn new() -> ServiceRegistry {
        ServiceRegistry {
            entries: Vec::new(),
        }
    }

    /// Registers a service; a repeated login refreshes the existing entry.
    pub fn add(&mut self, wsid: &Wsid, name: &str) -> crate::error::Result<()> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.wsid == *wsid) {
            entry.name = name.to_string();
            return Ok(());
        }

        if self.entries.len() >= MAX_APPS {
            return Err(Error::PoolExhausted);
        }

        self.entries.push(ServiceEntry {
            wsid: *wsid,
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn remove(&mut self, wsid: &Wsid) {
        self.entries.retain(|entry| entry.wsid != *wsid);
    }

    pub fn contains(&self, wsid: &Wsid) -> bool {
        self.entries.iter().any(|entry| entry.wsid == *wsid)
    }

    #[inline]
    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum AppTransportState {
    Initial,
    WaitFrameLen,
    WaitPayload,
    Closing,
}

/// Something an app connection produced for the core to act on.
#[derive(Debug, PartialEq)]
pub enum AppEvent {
    /// The app completed login with its service id.
    Login(usize, Wsid),
    /// A complete document arrived from a logged-in app.
    Document(Wsid, Vec<u8>),
    /// The connection must be torn down.
    Close(usize),
}

struct AppConnection {
    stream: Option<TcpStream>,
    rx: Buffer,
    state: AppTransportState,
    expect: usize,
    assembler: Assembler,
    logged_in: bool,
    wsid: Wsid,
}

impl AppConnection {
    fn new() -> AppConnection {
        AppConnection {
            stream: None,
            rx: Buffer::new(APP_RX_RING),
            state: AppTransportState::Initial,
            expect: 0,
            assembler: Assembler::new(),
            logged_in: false,
            wsid: [0u8; 32],
        }
    }

    fn reset(&mut self) {
        self.stream = None;
        self.rx.clear();
        self.state = AppTransportState::Initial;
        self.expect = 0;
        self.assembler.reset();
        self.logged_in = false;
        self.wsid = [0u8; 32];
    }

    #[inline]
    fn in_use(&self) -> bool {
        self.stream.is_some()
    }
}

/// The local app IPC server: a loopback TCP listener plus a fixed set of
/// app connection slots feeding the service registry.
pub struct AppServer {
    listener: Option<TcpListener>,
    connections: Vec<AppConnection>,
    pub registry: ServiceRegistry,
    log: logging::Logger,
}

impl AppServer {
    pub fn new(log: &logging::Logger) -> AppServer {
        AppServer {
            listener: None,
            connections: (0..MAX_APPS).map(|_| AppConnection::new()).collect(),
            registry: ServiceRegistry::new(),
            log: log.new(logging::o!("module" => "app_server")),
        }
    }

    /// Binds the loopback listener apps connect to.
    pub fn listen(&mut self, port: u16) -> io::Result<&TcpListener> {
        let listener = TcpBuilder::new_v4()?
            .reuse_address(true)?
            .bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)))?
            .listen(LISTEN_BACKLOG)?;
        listener.set_nonblocking(true)?;

        self.listener = Some(TcpListener::from_std(listener)?);
        logging::info!(self.log, "app server listening"; "port" => port);
        Ok(self.listener.as_ref().unwrap())
    }

    #[inline]
    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    #[inline]
    pub fn stream(&self, index: usize) -> Option<&TcpStream> {
        self.connections[index].stream.as_ref()
    }

    /// Accepts one waiting app connection into a vacant slot; a full house
    /// drops the socket.
    pub fn accept(&mut self) -> io::Result<Option<usize>> {
        let listener = self.listener.as_ref().expect("Accept without app listener");

        let (stream, _addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        };

        match self.connections.iter().position(|slot| !slot.in_use()) {
            Some(index) => {
                self.connections[index].stream = Some(stream);
                logging::debug!(self.log, "app connected"; "slot" => index);
                Ok(Some(index))
            }
            None => {
                logging::warn!(self.log, "no vacant app connection slot");
                Ok(None)
            }
        }
    }

    /// Reads everything available off one app socket and advances its
    /// transport state machine.
    pub fn fill(&mut self, index: usize, events: &mut Vec<AppEvent>) {
        let result = {
            let slot = &mut self.connections[index];
            let stream = match slot.stream.as_ref() {
                Some(stream) => stream,
                None => return,
            };
            slot.rx.ingress(stream)
        };

        match result {
            Ok(_) => self.process(index, events),
            Err(_) => events.push(AppEvent::Close(index)),
        }
    }

    /// Walks the buffered bytes: preamble, then length-prefixed frames that
    /// join into documents. Mirrors the state machine of the wire side but
    /// without encryption.
    pub fn process(&mut self, index: usize, events: &mut Vec<AppEvent>) {
        let slot = &mut self.connections[index];

        loop {
            match slot.state {
                AppTransportState::Initial => {
                    let mut preamble = [0u8; wire::PREAMBLE_LEN];
                    if slot.rx.peek(&mut preamble) < wire::PREAMBLE_LEN {
                        break;
                    }
                    slot.rx.skip(wire::PREAMBLE_LEN);

                    match wire::parse_preamble(&preamble) {
                        Ok(ConnectionType::App) => {
                            slot.state = AppTransportState::WaitFrameLen;
                        }
                        Ok(ConnectionType::AppEncrypted) => {
                            logging::warn!(self.log, "encrypted app handshake not supported");
                            slot.state = AppTransportState::Closing;
                            events.push(AppEvent::Close(index));
                            break;
                        }
                        _ => {
                            logging::warn!(self.log, "app handshake error");
                            slot.state = AppTransportState::Closing;
                            events.push(AppEvent::Close(index));
                            break;
                        }
                    }
                }
                AppTransportState::WaitFrameLen => {
                    let mut head = [0u8; 2];
                    if slot.rx.peek(&mut head) < 2 {
                        break;
                    }
                    slot.rx.skip(2);

                    let expect = BigEndian::read_u16(&head) as usize;
                    // Zero-length frames carry nothing and are skipped.
                    if expect == 0 {
                        continue;
                    }

                    if expect > slot.rx.capacity() {
                        logging::warn!(self.log, "app frame exceeds buffer"; "len" => expect);
                        slot.state = AppTransportState::Closing;
                        events.push(AppEvent::Close(index));
                        break;
                    }

                    slot.expect = expect;
                    slot.state = AppTransportState::WaitPayload;
                }
                AppTransportState::WaitPayload => {
                    if slot.rx.len() < slot.expect {
                        break;
                    }

                    let mut payload = vec![0u8; slot.expect];
                    slot.rx.read(&mut payload);
                    slot.state = AppTransportState::WaitFrameLen;

                    let complete = match slot.assembler.push(&payload) {
                        Ok(document) => document,
                        Err(Error::Wait) => continue,
                        Err(_) => {
                            logging::warn!(self.log, "app document framing error");
                            slot.state = AppTransportState::Closing;
                            events.push(AppEvent::Close(index));
                            break;
                        }
                    };

                    if !slot.logged_in {
                        match document::decode::<AppLogin>(&complete) {
                            Ok(login) => {
                                slot.wsid = login.wsid;
                                slot.logged_in = true;
                                events.push(AppEvent::Login(index, login.wsid));
                            }
                            Err(_) => {
                                logging::warn!(self.log, "bad app login message");
                            }
                        }
                        continue;
                    }

                    events.push(AppEvent::Document(slot.wsid, complete));
                }
                AppTransportState::Closing => break,
            }
        }
    }

    /// Sends a document to a logged-in service, split into frames of at
    /// most the wire frame size.
    pub fn send_to_wsid(&mut self, wsid: &Wsid, doc: &[u8]) -> io::Result<()> {
        let slot = match self
            .connections
            .iter_mut()
            .find(|slot| slot.logged_in && slot.wsid == *wsid)
        {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let mut stream = slot.stream.as_ref().expect("Logged-in app must own a socket");

        for chunk in doc.chunks(wire::FRAME_MAX_LEN) {
            let mut head = [0u8; 2];
            BigEndian::write_u16(&mut head, chunk.len() as u16);
            stream.write_all(&head)?;
            stream.write_all(chunk)?;
        }

        Ok(())
    }

    /// Drops an app connection and removes its service registration.
    pub fn cleanup(&mut self, index: usize) {
        let wsid = {
            let slot = &mut self.connections[index];
            let wsid = if slot.logged_in { Some(slot.wsid) } else { None };

            if let Some(stream) = slot.stream.take() {
                let _ = stream.shutdown(::std::net::Shutdown::Both);
            }
            slot.reset();
            wsid
        };

        if let Some(wsid) = wsid {
            self.registry.remove(&wsid);
        }

        logging::debug!(self.log, "app connection cleaned up"; "slot" => index);
    }

    /// Indices of app slots currently holding a socket.
    pub fn active(&self) -> Vec<usize> {
        (0..self.connections.len())
            .filter(|&index| self.connections[index].in_use())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; 2];
        BigEndian::write_u16(&mut bytes, payload.len() as u16);
        bytes.extend_from_slice(payload);
        bytes
    }

    fn login_doc(wsid: Wsid) -> Vec<u8> {
        document::encode(&AppLogin {
            wsid,
            name: Some("test-app".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn test_registry_bounds_and_refresh() {
        let mut registry = ServiceRegistry::new();

        for i in 0..MAX_APPS {
            registry.add(&[i as u8; 32], "svc").unwrap();
        }
        assert_eq!(
            registry.add(&[99u8; 32], "svc").unwrap_err(),
            Error::PoolExhausted
        );

        // Re-adding an existing wsid refreshes instead of growing.
        registry.add(&[0u8; 32], "renamed").unwrap();
        assert_eq!(registry.entries().len(), MAX_APPS);
        assert_eq!(registry.entries()[0].name, "renamed");

        registry.remove(&[0u8; 32]);
        assert!(!registry.contains(&[0u8; 32]));
    }

    #[test]
    fn test_login_flow() {
        let mut server = AppServer::new(&logging::discard());
        let wsid = [7u8; 32];

        let slot = &mut server.connections[0];
        slot.rx.write(&wire::preamble(ConnectionType::App));
        slot.rx.write(&frame(&login_doc(wsid)));

        let mut events = Vec::new();
        server.process(0, &mut events);

        assert_eq!(events, vec![AppEvent::Login(0, wsid)]);
        assert!(server.connections[0].logged_in);
    }

    #[test]
    fn test_encrypted_preamble_rejected() {
        let mut server = AppServer::new(&logging::discard());

        let slot = &mut server.connections[0];
        slot.rx.write(&[b'W', b'.', 0x18]);

        let mut events = Vec::new();
        server.process(0, &mut events);

        assert_eq!(events, vec![AppEvent::Close(0)]);
    }

    #[test]
    fn test_document_after_login_and_frame_join() {
        let mut server = AppServer::new(&logging::discard());
        let wsid = [7u8; 32];

        {
            let slot = &mut server.connections[0];
            slot.rx.write(&wire::preamble(ConnectionType::App));
            slot.rx.write(&frame(&login_doc(wsid)));
        }
        let mut events = Vec::new();
        server.process(0, &mut events);
        events.clear();

        // A document split across two frames is rejoined on the declared
        // total length.
        let doc = document::encode(&vec![3u8; 600]).unwrap();
        let (first, second) = doc.split_at(200);
        {
            let slot = &mut server.connections[0];
            slot.rx.write(&frame(first));
        }
        server.process(0, &mut events);
        assert!(events.is_empty());

        {
            let slot = &mut server.connections[0];
            slot.rx.write(&frame(second));
        }
        server.process(0, &mut events);

        assert_eq!(events, vec![AppEvent::Document(wsid, doc)]);
    }

    #[test]
    fn test_zero_length_frame_skipped() {
        let mut server = AppServer::new(&logging::discard());
        let wsid = [9u8; 32];

        let slot = &mut server.connections[0];
        slot.rx.write(&wire::preamble(ConnectionType::App));
        slot.rx.write(&frame(&[]));
        slot.rx.write(&frame(&login_doc(wsid)));

        let mut events = Vec::new();
        server.process(0, &mut events);

        assert_eq!(events, vec![AppEvent::Login(0, wsid)]);
    }
}
