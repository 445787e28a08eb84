use crate::error::{Error, Result};
use crate::identity::SignedCert;
use crate::{Uid, Wsid};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;

/// Every document carries its own total length (prefix included) in the
/// first four bytes, making documents self-delimiting on disk, inside wire
/// frames and on the app IPC pipe.
pub const HEADER_SIZE: usize = 4;

/// Upper bound for a single document; matches the RPC response buffer bound.
pub const MAX_DOCUMENT_SIZE: usize = 512 * 1024;

/// Encodes a body into a self-delimiting document.
pub fn encode<T: Serialize>(body: &T) -> Result<Vec<u8>> {
    let encoded = bincode::serialize(body)?;
    let total = encoded.len() + HEADER_SIZE;

    if total > MAX_DOCUMENT_SIZE {
        return Err(Error::DocumentTooLarge);
    }

    let mut document = Vec::with_capacity(total);
    document.write_u32::<LittleEndian>(total as u32)?;
    document.extend_from_slice(&encoded);
    Ok(document)
}

/// Returns the total length a document head declares, or `Wait` when fewer
/// than four bytes are available.
pub fn declared_len(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Wait);
    }

    let total = LittleEndian::read_u32(bytes) as usize;
    if total < HEADER_SIZE || total > MAX_DOCUMENT_SIZE {
        return Err(Error::Serialization);
    }

    Ok(total)
}

/// Decodes a complete document.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let total = declared_len(bytes)?;

    if bytes.len() != total {
        return Err(Error::Serialization);
    }

    Ok(bincode::deserialize(&bytes[HEADER_SIZE..])?)
}

/// Reassembles a document that the sender split across several fragments.
/// The expected total is taken from the first fragment's declared length.
pub struct Assembler {
    pending: Vec<u8>,
    expected: usize,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler {
            pending: Vec::new(),
            expected: 0,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.expected = 0;
    }

    /// Feeds one fragment. Returns the complete document once the declared
    /// length has been reached; `Wait` while bytes are outstanding. A
    /// fragment overshooting the declared length is a framing error.
    pub fn push(&mut self, fragment: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(fragment);

        if self.expected == 0 {
            self.expected = match declared_len(&self.pending) {
                Ok(total) => total,
                Err(Error::Wait) => return Err(Error::Wait),
                Err(err) => {
                    self.reset();
                    return Err(err);
                }
            };
        }

        if self.pending.len() < self.expected {
            return Err(Error::Wait);
        }

        if self.pending.len() > self.expected {
            self.reset();
            return Err(Error::Serialization);
        }

        let document = ::std::mem::replace(&mut self.pending, Vec::new());
        self.expected = 0;
        Ok(document)
    }
}

/// A service visible through the peers exchange.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PeerEntry {
    pub wsid: Wsid,
    pub name: String,
    pub online: bool,
}

/// Cleartext payloads of a running session. `Payload` is the opaque byte
/// pipe consumed by the RPC layer above the core.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub enum SessionDocument {
    Ping,
    Pong,
    PeersRequest,
    PeersResponse(Vec<PeerEntry>),
    FriendRequest(SignedCert),
    FriendResponse(bool),
    Payload(Vec<u8>),
}

/// First document an app must send on the IPC pipe.
#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct AppLogin {
    pub wsid: Wsid,
    pub name: Option<String>,
}

/// Record broadcast over UDP local discovery. The source address and port
/// are taken from the datagram envelope, not from the record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Advertisement {
    pub wuid: Uid,
    pub whid: [u8; 32],
    pub alias: String,
    pub pubkey: [u8; 32],
    pub transports: Vec<String>,
    pub class: Option<String>,
    pub friend_req: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_roundtrip() {
        let document = encode(&SessionDocument::Ping).unwrap();

        assert_eq!(declared_len(&document).unwrap(), document.len());
        assert_eq!(
            decode::<SessionDocument>(&document).unwrap(),
            SessionDocument::Ping
        );
    }

    #[test]
    fn test_declared_len_wait() {
        assert_eq!(declared_len(&[1, 2]).unwrap_err(), Error::Wait);
    }

    #[test]
    fn test_declared_len_bounds() {
        let mut head = [0u8; 4];
        LittleEndian::write_u32(&mut head, 2);
        assert_eq!(declared_len(&head).unwrap_err(), Error::Serialization);

        LittleEndian::write_u32(&mut head, (MAX_DOCUMENT_SIZE + 1) as u32);
        assert_eq!(declared_len(&head).unwrap_err(), Error::Serialization);
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut document = encode(&SessionDocument::Pong).unwrap();
        document.push(0);

        assert_eq!(
            decode::<SessionDocument>(&document).unwrap_err(),
            Error::Serialization
        );
    }

    #[test]
    fn test_assembler_single_fragment() {
        let document = encode(&SessionDocument::Payload(vec![1, 2, 3])).unwrap();

        let mut assembler = Assembler::new();
        let complete = assembler.push(&document).unwrap();

        assert_eq!(complete, document);
        assert!(assembler.is_idle());
    }

    #[test]
    fn test_assembler_split_fragments() {
        let document = encode(&SessionDocument::Payload(vec![7u8; 64])).unwrap();
        let mut assembler = Assembler::new();

        let (first, second) = document.split_at(10);
        assert_eq!(assembler.push(first).unwrap_err(), Error::Wait);
        assert_eq!(assembler.push(second).unwrap(), document);
    }

    #[test]
    fn test_assembler_overshoot_is_error() {
        let document = encode(&SessionDocument::Pong).unwrap();
        let mut oversize = document.clone();
        oversize.push(9);

        let mut assembler = Assembler::new();
        assert_eq!(assembler.push(&oversize).unwrap_err(), Error::Serialization);
        assert!(assembler.is_idle());
    }
}
