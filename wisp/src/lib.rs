#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Length of an identity UID (SHA-256 of the identity public key).
pub const UID_LEN: usize = 32;
/// Length of a per-node host id, established during the wire handshake.
pub const HOST_ID_LEN: usize = 32;
/// Length of a per-service id used on the app IPC pipe.
pub const WSID_LEN: usize = 32;

pub type Uid = [u8; UID_LEN];
pub type HostId = [u8; HOST_ID_LEN];
pub type Wsid = [u8; WSID_LEN];

pub mod buffer;
pub mod config;
pub mod connection;
pub mod core;
pub mod crypto;
pub mod discovery;
pub mod document;
pub mod error;
pub mod event;
pub mod identity;
pub mod logging;
pub mod manager;
pub mod relay;
pub mod resolver;
pub mod service;
pub mod wire;
