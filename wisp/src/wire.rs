use crate::buffer::Buffer;
use crate::crypto;
use crate::document;
use crate::error::{Error, Result};
use crate::identity::{self, Identity};
use crate::{HostId, Uid};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

/// Wire protocol version carried in the high nibble of the preamble byte.
pub const WIRE_VERSION: u8 = 1;
pub const PREAMBLE_LEN: usize = 3;

pub const FRAME_HEADER_LEN: usize = 2;
/// Maximum encrypted payload of one frame (the length field must fit below
/// 65535 together with its own two bytes).
pub const FRAME_MAX_LEN: usize = 65535 - FRAME_HEADER_LEN;
/// Maximum cleartext carried by one frame.
pub const MAX_PLAIN_LEN: usize = FRAME_MAX_LEN - crypto::MAC_SIZE;

pub const EXCHANGE_LEN: usize = 32;

const HANDSHAKE_FIXED_LEN: usize = EXCHANGE_LEN + identity::SIGNATURE_LEN + 2;
const HANDSHAKE_DOC_MAX_LEN: usize = 1024;

/// Connection type carried in the low nibble of the preamble byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionType {
    /// Authenticated peer session.
    Normal = 0,
    /// One-shot certificate exchange.
    FriendRequest = 2,
    /// Relay server control channel.
    RelayControl = 6,
    /// Reserved encrypted app IPC; currently rejected.
    AppEncrypted = 8,
    /// Unencrypted loopback app IPC.
    App = 9,
}

impl ConnectionType {
    fn from_nibble(nibble: u8) -> Option<ConnectionType> {
        match nibble {
            0 => Some(ConnectionType::Normal),
            2 => Some(ConnectionType::FriendRequest),
            6 => Some(ConnectionType::RelayControl),
            8 => Some(ConnectionType::AppEncrypted),
            9 => Some(ConnectionType::App),
            _ => None,
        }
    }
}

/// Renders the three preamble bytes both ends send first.
#[inline]
pub fn preamble(kind: ConnectionType) -> [u8; PREAMBLE_LEN] {
    [b'W', b'.', (WIRE_VERSION << 4) | kind as u8]
}

/// Parses a peer preamble. An unknown version or connection type aborts the
/// connection.
pub fn parse_preamble(bytes: &[u8; PREAMBLE_LEN]) -> Result<ConnectionType> {
    if bytes[0] != b'W' || bytes[1] != b'.' {
        return Err(Error::BadPreamble);
    }

    if bytes[2] >> 4 != WIRE_VERSION {
        return Err(Error::VersionMismatch);
    }

    ConnectionType::from_nibble(bytes[2] & 0x0f).ok_or(Error::BadPreamble)
}

/// The signed identity document exchanged inside the handshake.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HandshakeDoc {
    pub uid: Uid,
    pub host_id: HostId,
    pub pubkey: [u8; identity::PUBKEY_LEN],
}

/// One side's handshake message, sent right after the preamble:
/// a fresh X25519 ephemeral, an Ed25519 signature over it by the long-term
/// identity key, and the length-prefixed identity document.
#[derive(Debug)]
pub struct HandshakeMsg {
    pub exchange_pub: [u8; EXCHANGE_LEN],
    pub signature: Vec<u8>,
    pub doc: Vec<u8>,
}

/// Builds the local handshake message. Returns the wire bytes together with
/// the ephemeral secret needed to derive the session cipher.
pub fn build_handshake(local: &Identity, host_id: &HostId) -> Result<(Vec<u8>, [u8; EXCHANGE_LEN])> {
    let privkey = local.privkey.as_ref().ok_or(Error::NoPrivateKey)?;
    if privkey.len() != identity::PRIVKEY_LEN {
        return Err(Error::Serialization);
    }

    let mut key = [0u8; identity::PRIVKEY_LEN];
    key.copy_from_slice(privkey);

    let (exchange_secret, exchange_pub) = crypto::exchange_keypair();
    let signature = crypto::sign(&exchange_pub, &key);

    let doc = document::encode(&HandshakeDoc {
        uid: local.uid,
        host_id: *host_id,
        pubkey: local.pubkey,
    })?;

    let mut message = Vec::with_capacity(HANDSHAKE_FIXED_LEN + doc.len());
    message.extend_from_slice(&exchange_pub);
    message.extend_from_slice(&signature);
    message.write_u16::<BigEndian>(doc.len() as u16)?;
    message.extend_from_slice(&doc);

    Ok((message, exchange_secret))
}

/// Reads one handshake message off the receive ring, or `Wait` while it is
/// still incomplete.
pub fn read_handshake(rx: &mut Buffer) -> Result<HandshakeMsg> {
    let mut fixed = [0u8; HANDSHAKE_FIXED_LEN];
    if rx.peek(&mut fixed) < HANDSHAKE_FIXED_LEN {
        return Err(Error::Wait);
    }

    let doc_len = BigEndian::read_u16(&fixed[EXCHANGE_LEN + identity::SIGNATURE_LEN..]) as usize;
    if doc_len < document::HEADER_SIZE || doc_len > HANDSHAKE_DOC_MAX_LEN {
        return Err(Error::AuthFailed);
    }

    if rx.len() < HANDSHAKE_FIXED_LEN + doc_len {
        return Err(Error::Wait);
    }

    rx.skip(HANDSHAKE_FIXED_LEN);
    let mut doc = vec![0u8; doc_len];
    rx.read(&mut doc);

    let mut exchange_pub = [0u8; EXCHANGE_LEN];
    exchange_pub.copy_from_slice(&fixed[..EXCHANGE_LEN]);

    Ok(HandshakeMsg {
        exchange_pub,
        signature: fixed[EXCHANGE_LEN..EXCHANGE_LEN + identity::SIGNATURE_LEN].to_vec(),
        doc,
    })
}

/// Verifies a peer handshake message: the document's public key must digest
/// to its uid and must have signed the ephemeral.
pub fn verify_handshake(msg: &HandshakeMsg) -> Result<HandshakeDoc> {
    let doc: HandshakeDoc = document::decode(&msg.doc).map_err(|_| Error::AuthFailed)?;

    if identity::pubkey_to_uid(&doc.pubkey) != doc.uid {
        return Err(Error::AuthFailed);
    }

    if !crypto::verify(&msg.signature, &msg.exchange_pub, &doc.pubkey) {
        return Err(Error::AuthFailed);
    }

    Ok(doc)
}

/// The session cipher derived from the handshake. Each direction has its own
/// key and nonce sequence; the three preamble bytes are bound into every
/// frame as additional data.
pub struct Cipher {
    tx_key: [u8; crypto::KEY_SIZE],
    rx_key: [u8; crypto::KEY_SIZE],
    tx_seq: u64,
    rx_seq: u64,
    additional_data: [u8; PREAMBLE_LEN],
}

impl Cipher {
    pub fn derive(
        kind: ConnectionType,
        exchange_secret: &[u8; EXCHANGE_LEN],
        our_pub: &[u8; EXCHANGE_LEN],
        their_pub: &[u8; EXCHANGE_LEN],
    ) -> Result<Cipher> {
        let shared = crypto::exchange(exchange_secret, their_pub).ok_or(Error::Crypto)?;

        let mut material = [0u8; EXCHANGE_LEN * 3];
        material[..EXCHANGE_LEN].copy_from_slice(&shared);

        material[EXCHANGE_LEN..EXCHANGE_LEN * 2].copy_from_slice(our_pub);
        material[EXCHANGE_LEN * 2..].copy_from_slice(their_pub);
        let tx_key = crypto::sha256(&material);

        material[EXCHANGE_LEN..EXCHANGE_LEN * 2].copy_from_slice(their_pub);
        material[EXCHANGE_LEN * 2..].copy_from_slice(our_pub);
        let rx_key = crypto::sha256(&material);

        Ok(Cipher {
            tx_key,
            rx_key,
            tx_seq: 0,
            rx_seq: 0,
            additional_data: preamble(kind),
        })
    }

    /// Wraps one cleartext fragment into a wire frame.
    pub fn seal(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        if plain.len() > MAX_PLAIN_LEN {
            return Err(Error::FrameTooLarge);
        }

        let cipher_len = plain.len() + crypto::MAC_SIZE;
        let mut frame = vec![0u8; FRAME_HEADER_LEN + cipher_len];
        BigEndian::write_u16(&mut frame, cipher_len as u16);

        if !crypto::encrypt(
            &mut frame[FRAME_HEADER_LEN..],
            plain,
            &self.additional_data,
            self.tx_seq,
            &self.tx_key,
        ) {
            return Err(Error::Crypto);
        }

        self.tx_seq += 1;
        Ok(frame)
    }

    /// Wraps a whole document, splitting it across frames when it exceeds
    /// the per-frame cleartext bound.
    pub fn seal_document(&mut self, doc: &[u8]) -> Result<Vec<u8>> {
        let mut frames = Vec::with_capacity(doc.len() + FRAME_HEADER_LEN + crypto::MAC_SIZE);

        for fragment in doc.chunks(MAX_PLAIN_LEN) {
            frames.extend_from_slice(&self.seal(fragment)?);
        }

        Ok(frames)
    }

    /// Reads and decrypts one frame off the receive ring. `Wait` while the
    /// frame is incomplete.
    pub fn open(&mut self, rx: &mut Buffer) -> Result<Vec<u8>> {
        let mut head = [0u8; FRAME_HEADER_LEN];
        if rx.peek(&mut head) < FRAME_HEADER_LEN {
            return Err(Error::Wait);
        }

        let cipher_len = BigEndian::read_u16(&head) as usize;
        if cipher_len > FRAME_MAX_LEN {
            return Err(Error::FrameTooLarge);
        }
        if cipher_len < crypto::MAC_SIZE {
            return Err(Error::Protocol);
        }

        if rx.len() < FRAME_HEADER_LEN + cipher_len {
            return Err(Error::Wait);
        }

        rx.skip(FRAME_HEADER_LEN);
        let mut cipher = vec![0u8; cipher_len];
        rx.read(&mut cipher);

        let mut plain = vec![0u8; cipher_len - crypto::MAC_SIZE];
        if !crypto::decrypt(
            &mut plain,
            &cipher,
            &self.additional_data,
            self.rx_seq,
            &self.rx_key,
        ) {
            return Err(Error::Crypto);
        }

        self.rx_seq += 1;
        Ok(plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Assembler, SessionDocument};

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

    fn cipher_pair() -> (Cipher, Cipher) {
        crypto::init();

        let (a_secret, a_public) = crypto::exchange_keypair();
        let (b_secret, b_public) = crypto::exchange_keypair();

        let a = Cipher::derive(ConnectionType::Normal, &a_secret, &a_public, &b_public).unwrap();
        let b = Cipher::derive(ConnectionType::Normal, &b_secret, &b_public, &a_public).unwrap();
        (a, b)
    }

    #[test]
    fn test_preamble_roundtrip() {
        assert_eq!(preamble(ConnectionType::Normal), [b'W', b'.', 0x10]);
        assert_eq!(preamble(ConnectionType::FriendRequest), [b'W', b'.', 0x12]);
        assert_eq!(preamble(ConnectionType::RelayControl), [b'W', b'.', 0x16]);
        assert_eq!(preamble(ConnectionType::App), [b'W', b'.', 0x19]);

        for kind in &[
            ConnectionType::Normal,
            ConnectionType::FriendRequest,
            ConnectionType::RelayControl,
            ConnectionType::AppEncrypted,
            ConnectionType::App,
        ] {
            assert_eq!(parse_preamble(&preamble(*kind)).unwrap(), *kind);
        }
    }

    #[test]
    fn test_preamble_rejects_unknown() {
        assert_eq!(
            parse_preamble(&[b'X', b'.', 0x10]).unwrap_err(),
            Error::BadPreamble
        );
        assert_eq!(
            parse_preamble(&[b'W', b'.', 0x20]).unwrap_err(),
            Error::VersionMismatch
        );
        assert_eq!(
            parse_preamble(&[b'W', b'.', 0x13]).unwrap_err(),
            Error::BadPreamble
        );
    }

    #[test]
    fn test_handshake_roundtrip() {
        let local = local_identity("alice");
        let host_id = [3u8; 32];

        let (message, _secret) = build_handshake(&local, &host_id).unwrap();

        let mut rx = Buffer::new(4096);
        // Feed in two chunks to exercise the Wait path.
        rx.write(&message[..40]);
        assert_eq!(read_handshake(&mut rx).unwrap_err(), Error::Wait);
        rx.write(&message[40..]);

        let parsed = read_handshake(&mut rx).unwrap();
        let doc = verify_handshake(&parsed).unwrap();

        assert_eq!(doc.uid, local.uid);
        assert_eq!(doc.host_id, host_id);
        assert_eq!(doc.pubkey, local.pubkey);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_handshake_bad_signature() {
        let local = local_identity("alice");
        let (message, _secret) = build_handshake(&local, &[3u8; 32]).unwrap();

        let mut rx = Buffer::new(4096);
        rx.write(&message);

        let mut parsed = read_handshake(&mut rx).unwrap();
        parsed.signature[0] ^= 1;

        assert_eq!(verify_handshake(&parsed).unwrap_err(), Error::AuthFailed);
    }

    #[test]
    fn test_handshake_uid_pubkey_mismatch() {
        let alice = local_identity("alice");
        let mallory = local_identity("mallory");

        // Mallory claims alice's uid with her own key material.
        let mut forged = alice.clone();
        forged.pubkey = mallory.pubkey;
        forged.privkey = mallory.privkey.clone();

        let (message, _secret) = build_handshake(&forged, &[0u8; 32]).unwrap();
        let mut rx = Buffer::new(4096);
        rx.write(&message);

        let parsed = read_handshake(&mut rx).unwrap();
        assert_eq!(verify_handshake(&parsed).unwrap_err(), Error::AuthFailed);
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut a, mut b) = cipher_pair();

        let frame = a.seal(b"hello over the wire").unwrap();

        let mut rx = Buffer::new(4096);
        rx.write(&frame[..1]);
        assert_eq!(b.open(&mut rx).unwrap_err(), Error::Wait);
        rx.write(&frame[1..]);

        assert_eq!(b.open(&mut rx).unwrap(), b"hello over the wire");
        assert_eq!(b.open(&mut rx).unwrap_err(), Error::Wait);
    }

    #[test]
    fn test_frame_order_and_tamper() {
        let (mut a, mut b) = cipher_pair();

        let first = a.seal(b"one").unwrap();
        let second = a.seal(b"two").unwrap();

        let mut rx = Buffer::new(4096);
        rx.write(&first);
        rx.write(&second);

        assert_eq!(b.open(&mut rx).unwrap(), b"one");
        assert_eq!(b.open(&mut rx).unwrap(), b"two");

        // A bit flip in the ciphertext is fatal.
        let mut tampered = a.seal(b"three").unwrap();
        tampered[4] ^= 1;
        rx.write(&tampered);
        assert_eq!(b.open(&mut rx).unwrap_err(), Error::Crypto);
    }

    #[test]
    fn test_frame_length_bounds() {
        let (_a, mut b) = cipher_pair();

        let mut rx = Buffer::new(8);
        rx.write(&[0x00, 0x01]);
        assert_eq!(b.open(&mut rx).unwrap_err(), Error::Protocol);

        let mut rx = Buffer::new(8);
        rx.write(&[0xff, 0xff]);
        assert_eq!(b.open(&mut rx).unwrap_err(), Error::FrameTooLarge);
    }

    #[test]
    fn test_document_split_and_rejoin() {
        let (mut a, mut b) = cipher_pair();

        // A document larger than one frame forces the sender to split.
        let payload = vec![0xabu8; MAX_PLAIN_LEN + 1000];
        let doc = document::encode(&SessionDocument::Payload(payload.clone())).unwrap();
        let frames = a.seal_document(&doc).unwrap();

        let mut rx = Buffer::new(frames.len());
        rx.write(&frames);

        let mut assembler = Assembler::new();
        let mut complete = None;
        loop {
            match b.open(&mut rx) {
                Ok(fragment) => match assembler.push(&fragment) {
                    Ok(document) => {
                        complete = Some(document);
                        break;
                    }
                    Err(Error::Wait) => (),
                    Err(err) => panic!("Unexpected assembler error {:?}", err),
                },
                Err(Error::Wait) => break,
                Err(err) => panic!("Unexpected frame error {:?}", err),
            }
        }

        let complete = complete.expect("Document must reassemble");
        match document::decode::<SessionDocument>(&complete).unwrap() {
            SessionDocument::Payload(received) => assert_eq!(received, payload),
            other => panic!("Unexpected document {:?}", other),
        }
    }
}
