//! Discovery probe/reply wire format.
//!
//! Both directions are a single UDP datagram holding a postcard-encoded
//! [`DiscoveryPacket`]:
//!
//! ```text
//! ┌───────────┬────────────┬──────────────────────────────────────────┐
//! │ Magic(4)  │ Version(1) │ Body (postcard enum)                     │
//! └───────────┴────────────┴──────────────────────────────────────────┘
//!   Probe { signature, filter?, tag? }     client → group / unicast target
//!   Reply(Message)                         server → probe source (unicast)
//! ```
//!
//! A reply is an ordinary [`Message`]. The fields in [`field`] are reserved;
//! anything else is per-peer information owned by the hosted application.

use serde::{Deserialize, Serialize};

use crate::filter::QueryFilter;
use crate::message::{Message, WireError};

pub const DISCOVERY_MAGIC: u32 = 0x544c_4453;
pub const DISCOVERY_VERSION: u8 = 1;

/// Largest datagram discovery will send or accept.
pub const MAX_PACKET_SIZE: usize = 8 * 1024;

/// Reserved reply field names.
pub mod field {
    /// Application signature string the server advertises.
    pub const SIGNATURE: &str = "_sig";
    /// System the peer belongs to; peers are grouped by this name.
    pub const SYSTEM_NAME: &str = "_sys";
    /// Peer id, unique within a system.
    pub const PEER_ID: &str = "_pid";
    /// Tag echoed from the probe.
    pub const TAG: &str = "_tag";
    /// TCP port clients connect to.
    pub const TCP_PORT: &str = "_tcp";
    /// UDP port answering time-sync pings.
    pub const TIME_SYNC_PORT: &str = "_tsp";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiscoveryBody {
    Probe {
        /// Wildcard pattern; servers with a non-matching signature stay quiet.
        signature: String,
        filter: Option<QueryFilter>,
        tag: Option<String>,
    },
    Reply(Message),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    magic: u32,
    version: u8,
    pub body: DiscoveryBody,
}

impl DiscoveryPacket {
    #[must_use]
    pub const fn new(body: DiscoveryBody) -> Self {
        Self {
            magic: DISCOVERY_MAGIC,
            version: DISCOVERY_VERSION,
            body,
        }
    }

    #[must_use]
    pub fn probe(signature: &str, filter: Option<QueryFilter>, tag: Option<String>) -> Self {
        Self::new(DiscoveryBody::Probe {
            signature: signature.to_owned(),
            filter,
            tag,
        })
    }

    #[must_use]
    pub const fn reply(payload: Message) -> Self {
        Self::new(DiscoveryBody::Reply(payload))
    }

    /// # Errors
    ///
    /// Returns [`WireError`] if encoding fails or the packet is too large
    /// for one datagram.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.clear();
        let bytes = postcard::to_stdvec(self)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(WireError::FrameTooLarge {
                len: bytes.len(),
                max: MAX_PACKET_SIZE,
            });
        }
        buf.extend_from_slice(&bytes);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`WireError`] on malformed input or a foreign magic number.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let packet: Self = postcard::from_bytes(bytes).map_err(WireError::Decode)?;
        if packet.magic != DISCOVERY_MAGIC || packet.version != DISCOVERY_VERSION {
            return Err(WireError::BadMagic(packet.magic));
        }
        Ok(packet)
    }
}

/// Builds the reserved part of a server's reply.
#[must_use]
pub fn advertisement(signature: &str, system_name: &str, peer_id: u64) -> Message {
    Message::new(0)
        .with(field::SIGNATURE, signature)
        .with(field::SYSTEM_NAME, system_name)
        .with(field::PEER_ID, peer_id as i64)
}

/// Reads the peer id of a reply.
#[must_use]
pub fn peer_id(payload: &Message) -> Option<u64> {
    payload.get_int(field::PEER_ID).map(|v| v as u64)
}

#[must_use]
pub fn system_name(payload: &Message) -> Option<&str> {
    payload.get_str(field::SYSTEM_NAME)
}

/// The filter a client applies to every reply: signature pattern AND the
/// caller's filter.
#[must_use]
pub fn reply_filter(signature: &str, extra: Option<&QueryFilter>) -> QueryFilter {
    let signature = QueryFilter::Matches(field::SIGNATURE.into(), signature.into());
    match extra {
        Some(extra) => QueryFilter::And(vec![signature, extra.clone()]),
        None => signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_reserved_fields() {
        let adv = advertisement("mixer-1.0", "studio", 42).with(field::TCP_PORT, 9000i64);
        let mut buf = Vec::new();
        DiscoveryPacket::reply(adv.clone()).encode_into(&mut buf).unwrap();

        let DiscoveryBody::Reply(payload) = DiscoveryPacket::decode(&buf).unwrap().body else {
            panic!("expected reply");
        };
        assert_eq!(payload, adv);
        assert_eq!(peer_id(&payload), Some(42));
        assert_eq!(system_name(&payload), Some("studio"));
        assert_eq!(payload.get_port(field::TCP_PORT), Some(9000));
    }

    #[test]
    fn foreign_datagrams_are_rejected() {
        let mut buf = Vec::new();
        let mut packet = DiscoveryPacket::probe("*", None, None);
        packet.magic = 0xdead_beef;
        packet.encode_into(&mut buf).unwrap();
        assert!(matches!(
            DiscoveryPacket::decode(&buf),
            Err(WireError::BadMagic(0xdead_beef))
        ));
        assert!(DiscoveryPacket::decode(b"hello").is_err());
    }

    #[test]
    fn reply_filter_requires_signature_and_extra() {
        let extra = QueryFilter::Exists("gpu".into());
        let filter = reply_filter("mixer-*", Some(&extra));
        let adv = advertisement("mixer-2", "s", 1);
        assert!(!filter.matches(&adv));
        assert!(filter.matches(&adv.clone().with("gpu", true)));
        assert!(!reply_filter("other", None).matches(&adv));
    }
}
