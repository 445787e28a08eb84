use crate::connection::{ConnectionPool, SlotState};
use crate::error::{Error, Result};
use crate::identity::{IdentityStore, TRANSPORT_MAX_LEN};
use crate::logging;
use crate::Uid;
use std::net::Ipv4Addr;
use std::time::Instant;

/// A dial target: either a ready address or a hostname for the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(Ipv4Addr),
    Name(String),
}

/// One dial the auto-dial sweep decided on.
#[derive(Debug, PartialEq, Eq)]
pub struct DialPlan {
    pub luid: Uid,
    pub ruid: Uid,
    pub host: Host,
    pub port: u16,
}

/// Liveness decisions for the core to apply.
#[derive(Debug, PartialEq, Eq)]
pub enum LivenessAction {
    Ping(usize),
    Close(usize),
}

/// Parses a transport string: `wish://host:port`, `host:port`, with the
/// host part either dotted-quad or a DNS name.
pub fn parse_transport(url: &str) -> Result<(Host, u16)> {
    if url.is_empty() || url.len() > TRANSPORT_MAX_LEN {
        return Err(Error::BadTransport);
    }

    let remainder = if let Some(stripped) = url.strip_prefix("wish://") {
        stripped
    } else {
        url
    };

    let colon = remainder.rfind(':').ok_or(Error::BadTransport)?;
    let (host_part, port_part) = remainder.split_at(colon);
    let port: u16 = port_part[1..].parse().map_err(|_| Error::BadTransport)?;

    if host_part.is_empty() || port == 0 {
        return Err(Error::BadTransport);
    }

    match host_part.parse::<Ipv4Addr>() {
        Ok(ip) => Ok((Host::Ip(ip), port)),
        Err(_) => Ok((Host::Name(host_part.to_string()), port)),
    }
}

/// Enumerates (local, contact) pairs and decides which transports to dial.
/// Pairs that are already connected, banned contacts and contacts flagged
/// `connect: false` are skipped.
pub fn plan_dials(
    store: &IdentityStore,
    pool: &ConnectionPool,
    log: &logging::Logger,
) -> Vec<DialPlan> {
    let mut plans = Vec::new();

    let locals = store.local_uids();
    let contacts = store.uids();

    for luid in &locals {
        for ruid in &contacts {
            if luid == ruid {
                continue;
            }
            if pool.has_pair(luid, ruid) {
                continue;
            }

            let contact = match store.load(ruid) {
                Ok(contact) => contact,
                Err(_) => continue,
            };

            if !contact.meta_connect() {
                logging::debug!(log, "will not connect, contact flagged 'do not connect'";
                                "alias" => &contact.alias);
                continue;
            }

            if contact.is_banned() {
                logging::debug!(log, "will not connect, contact flagged 'banned'";
                                "alias" => &contact.alias);
                continue;
            }

            for transport in &contact.transports {
                match parse_transport(transport) {
                    Ok((host, port)) => plans.push(DialPlan {
                        luid: *luid,
                        ruid: *ruid,
                        host,
                        port,
                    }),
                    Err(_) => {
                        logging::debug!(log, "skipping unparseable transport";
                                        "transport" => transport.as_str());
                    }
                }
            }
        }
    }

    plans
}

/// Walks the pool once, deciding pings for quiet connections, closes for
/// expired pings and overdue setups, and reaping slots stuck in closing.
pub fn sweep_liveness(pool: &ConnectionPool, now: Instant) -> Vec<LivenessAction> {
    let mut actions = Vec::new();

    for id in pool.ids() {
        let connection = pool.get(id);

        match connection.slot_state {
            SlotState::Connected => {
                if connection.ping_expired(now) {
                    actions.push(LivenessAction::Close(id));
                } else if connection.should_ping(now) {
                    actions.push(LivenessAction::Ping(id));
                }
            }
            SlotState::InMaking => {
                if connection.setup_expired(now) {
                    actions.push(LivenessAction::Close(id));
                }
            }
            // A slot lingering in closing is forcibly reaped.
            SlotState::Closing => actions.push(LivenessAction::Close(id)),
            SlotState::Free => (),
        }
    }

    actions
}
