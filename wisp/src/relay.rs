use crate::buffer::Buffer;
use crate::logging;
use crate::wire::{self, ConnectionType};
use crate::Uid;
use mio::net::TcpStream;
use std::io;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// A relay session with no input for this long is presumed dead.
pub const RELAY_SERVER_TIMEOUT: Duration = Duration::from_secs(45);
/// Give up on a pending relay connect after this long.
pub const RELAY_CLIENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait this long after a failure before reopening the session.
pub const RELAY_CLIENT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of the session id the server assigns.
pub const SESSION_ID_LEN: usize = 10;

/// Relay host used as default transport when nothing is configured.
pub const DEFAULT_RELAY_HOST: &str = "relay.wisp-network.example.com:40000";

const RELAY_RX_RING: usize = 64;

const KEEPALIVE_BYTE: u8 = b'.';
const PUNCH_BYTE: u8 = b':';

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RelayState {
    Initial,
    Resolving,
    Connecting,
    Open,
    ReadSessionId,
    Wait,
    Closing,
    WaitReconnect,
}

/// Something the steady-state byte stream asked the core to do.
#[derive(Debug, Eq, PartialEq)]
pub enum RelayAction {
    /// The session id arrived; Internet reachability is confirmed.
    SessionEstablished,
    /// The server announced a punched inbound connection attempt.
    Punch,
    /// Unexpected control byte; the session must close.
    ProtocolError,
}

/// A long-lived control channel to one rendezvous server. The session
/// reconnects forever with backoff; many punched connections may reference
/// it by handle while it lives.
pub struct RelaySession {
    pub host: String,
    pub port: u16,
    pub uid: Uid,
    pub state: RelayState,
    pub session_id: [u8; SESSION_ID_LEN],
    pub rx: Buffer,
    pub last_input: Instant,
    stream: Option<TcpStream>,
    log: logging::Logger,
}

impl RelaySession {
    pub fn new(host: &str, port: u16, log: &logging::Logger) -> RelaySession {
        RelaySession {
            host: host.to_string(),
            port,
            uid: [0u8; 32],
            state: RelayState::Initial,
            session_id: [0u8; SESSION_ID_LEN],
            rx: Buffer::new(RELAY_RX_RING),
            last_input: Instant::now(),
            stream: None,
            log: log.new(logging::o!("module" => "relay", "host" => host.to_string())),
        }
    }

    #[inline]
    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Starts the nonblocking connect towards the server address.
    pub fn connect(&mut self, ip: Ipv4Addr) -> io::Result<()> {
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, self.port));
        let stream = TcpStream::connect(&addr)?;

        self.stream = Some(stream);
        self.state = RelayState::Connecting;
        self.last_input = Instant::now();

        logging::debug!(self.log, "relay connect started"; "ip" => %ip, "port" => self.port);
        Ok(())
    }

    /// Reads the SO_ERROR style connect outcome after writable readiness.
    pub fn connect_outcome(&self) -> io::Result<()> {
        let stream = self.stream.as_ref().expect("Connecting relay must own a socket");
        match stream.take_error()? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// The TCP connect succeeded: send the control-channel opening, which is
    /// the type-6 preamble followed by the uid relaying is requested for.
    pub fn on_connected(&mut self) -> io::Result<()> {
        self.state = RelayState::Open;
        self.last_input = Instant::now();

        let mut opening = [0u8; wire::PREAMBLE_LEN + 32];
        opening[..wire::PREAMBLE_LEN].copy_from_slice(&wire::preamble(ConnectionType::RelayControl));
        opening[wire::PREAMBLE_LEN..].copy_from_slice(&self.uid);

        let mut stream = self.stream.as_ref().expect("Open relay must own a socket");
        stream.write_all(&opening)?;

        self.state = RelayState::ReadSessionId;
        logging::info!(self.log, "relay control connection established");
        Ok(())
    }

    /// Appends received bytes and refreshes the liveness timestamp.
    pub fn feed(&mut self, data: &[u8], now: Instant) {
        self.rx.write(data);
        self.last_input = now;
    }

    /// Reads everything available off the socket. Returns the byte count; a
    /// closed or failed socket surfaces as an error for the caller to close.
    pub fn fill(&mut self, now: Instant) -> io::Result<usize> {
        let received = {
            let stream = self.stream.as_ref().expect("Readable relay must own a socket");
            self.rx.ingress(stream)?
        };

        if received > 0 {
            self.last_input = now;
        }
        Ok(received)
    }

    /// Advances the session state machine over the buffered input. Punch
    /// requests may arrive back to back, hence the action list.
    pub fn process(&mut self) -> Vec<RelayAction> {
        let mut actions = Vec::new();

        loop {
            match self.state {
                RelayState::ReadSessionId => {
                    if self.rx.len() < SESSION_ID_LEN {
                        break;
                    }

                    let mut session_id = [0u8; SESSION_ID_LEN];
                    self.rx.read(&mut session_id);
                    self.session_id = session_id;
                    self.state = RelayState::Wait;

                    logging::info!(self.log, "relay session established");
                    actions.push(RelayAction::SessionEstablished);
                }
                RelayState::Wait => {
                    let mut byte = [0u8; 1];
                    if self.rx.read(&mut byte) == 0 {
                        break;
                    }

                    match byte[0] {
                        KEEPALIVE_BYTE => {
                            logging::trace!(self.log, "relay keepalive");
                        }
                        PUNCH_BYTE => {
                            logging::debug!(self.log, "relay punch request");
                            actions.push(RelayAction::Punch);
                        }
                        other => {
                            logging::warn!(self.log, "relay protocol error"; "byte" => other);
                            actions.push(RelayAction::ProtocolError);
                            break;
                        }
                    }
                }
                _ => break,
            }
        }

        actions
    }

    /// Tears the socket down and enters the reconnect backoff.
    pub fn close(&mut self, now: Instant) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(::std::net::Shutdown::Both);
        }

        self.rx.clear();
        self.state = RelayState::WaitReconnect;
        // Reused as the reconnect backoff reference point.
        self.last_input = now;

        logging::debug!(self.log, "relay session closed");
    }

    /// True when the pending connect has been outstanding too long.
    pub fn connect_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= RELAY_CLIENT_CONNECT_TIMEOUT
    }

    /// True when the steady state went silent past the server timeout.
    pub fn input_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= RELAY_SERVER_TIMEOUT
    }

    /// True when the reconnect backoff has elapsed.
    pub fn reconnect_due(&self, now: Instant) -> bool {
        now.duration_since(self.last_input) >= RELAY_CLIENT_RECONNECT_TIMEOUT
    }
}
