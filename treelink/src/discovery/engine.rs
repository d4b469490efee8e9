//! Socket side of discovery, independent of any particular event loop.
//!
//! [`DiscoveryEngine`] owns one UDP socket per usable interface and the raw
//! result table. It registers its sockets in whatever `mio::Poll` the caller
//! runs: the standalone discovery reactor uses its own, the connector embeds
//! the engine in its session reactor while it searches for a server.
//!
//! The caller drives it with three calls per loop iteration:
//!
//! ```ignore
//! engine.on_timers(Instant::now(), poll.registry());
//! poll.poll(&mut events, Some(engine.next_deadline().saturating_duration_since(now)))?;
//! for event in &events {
//!     if engine.owns(event.token()) {
//!         engine.on_readable(event.token(), Instant::now());
//!     }
//! }
//! let changes = engine.take_changes();
//! ```

use std::collections::BTreeMap;
use std::io;
use std::net::Ipv4Addr;

use minstant::Instant;
use mio::{Interest, Registry, Token};

use crate::config::DiscoveryConfig;
use crate::filter::QueryFilter;
use crate::message::Message;
use crate::net::{Endpoint, InterfaceKind, LocalInterface, UdpSocket, interfaces};
use crate::trace::{debug, trace, warn};

use super::protocol::{self, DiscoveryBody, DiscoveryPacket, MAX_PACKET_SIZE};
use super::table::{DiscoveryChange, RawKey, ResultTable, SystemInfo};
use super::DiscoveryQuery;

/// Tokens `[base, base + TOKEN_SPAN)` belong to the engine.
pub const TOKEN_SPAN: usize = 256;

const RECV_BUFFER_SIZE: usize = 256 * 1024;

struct ProbeSocket {
    iface: LocalInterface,
    socket: UdpSocket,
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    filter: QueryFilter,
    probe: Vec<u8>,
    destinations: Vec<Endpoint>,
    token_base: usize,
    sockets: Vec<ProbeSocket>,
    table: ResultTable,
    next_ping: Instant,
    next_rescan: Instant,
    recv_buf: Vec<u8>,
}

impl DiscoveryEngine {
    /// Prepares an engine; no sockets exist until [`open`](Self::open).
    ///
    /// # Errors
    ///
    /// Returns an error if the probe packet cannot be encoded.
    pub fn new(
        config: DiscoveryConfig,
        query: &DiscoveryQuery,
        token_base: Token,
    ) -> io::Result<Self> {
        let tag = format!("{:08x}", rand::random::<u32>());
        let mut probe = Vec::new();
        DiscoveryPacket::probe(&query.signature, query.filter.clone(), Some(tag))
            .encode_into(&mut probe)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let now = Instant::now();
        Ok(Self {
            destinations: config.probe_destinations(),
            filter: query.reply_filter(),
            config,
            probe,
            token_base: token_base.0,
            sockets: Vec::new(),
            table: ResultTable::new(),
            next_ping: now,
            next_rescan: now,
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    /// Opens and registers one socket per current interface. Interfaces that
    /// fail to bind are skipped with a warning.
    pub fn open(&mut self, registry: &Registry) {
        let now = Instant::now();
        let ifaces = self.current_interfaces();
        for iface in ifaces.into_iter().take(TOKEN_SPAN) {
            match self.open_socket(&iface, registry) {
                Ok(socket) => {
                    debug!(iface = %iface.name, addr = %iface.addr, local = ?socket.local_addr().ok(), "discovery socket open");
                    self.sockets.push(ProbeSocket { iface, socket });
                }
                Err(_e) => {
                    warn!(iface = %iface.name, addr = %iface.addr, error = %_e, "discovery socket failed");
                }
            }
        }
        let addrs: Vec<Ipv4Addr> = self.sockets.iter().map(|s| s.iface.addr).collect();
        self.table.retain_interfaces(&addrs);
        self.next_ping = now;
        self.next_rescan = now + self.config.interface_rescan;
    }

    fn open_socket(&self, iface: &LocalInterface, registry: &Registry) -> io::Result<UdpSocket> {
        let token = Token(self.token_base + self.sockets.len());
        let mut socket = UdpSocket::bind_multicast_sender(
            Endpoint::new(iface.addr.into(), 0),
            self.config.multicast_ttl,
        )?;
        // Replies from a busy subnet arrive in bursts right after each probe.
        let _ = socket.set_recv_buffer_size(RECV_BUFFER_SIZE);
        registry.register(&mut socket, token, Interest::READABLE)?;
        Ok(socket)
    }

    /// Deregisters and closes every socket.
    pub fn close(&mut self, registry: &Registry) {
        for mut probe in self.sockets.drain(..) {
            let _ = registry.deregister(&mut probe.socket);
        }
    }

    /// Recreates all sockets, e.g. after the host reports a network change.
    pub fn rebuild(&mut self, registry: &Registry) {
        debug!(sockets = self.sockets.len(), "rebuilding discovery sockets");
        self.close(registry);
        self.open(registry);
    }

    fn current_interfaces(&self) -> Vec<LocalInterface> {
        if let Some(addrs) = &self.config.interfaces {
            return addrs
                .iter()
                .map(|&addr| {
                    interfaces::interface_for(addr.into()).unwrap_or(LocalInterface {
                        name: addr.to_string(),
                        addr,
                        kind: if addr.is_loopback() {
                            InterfaceKind::Loopback
                        } else {
                            InterfaceKind::Wired
                        },
                    })
                })
                .collect();
        }
        match interfaces::enumerate() {
            Ok(list) => list,
            Err(_e) => {
                warn!(error = %_e, "interface enumeration failed");
                Vec::new()
            }
        }
    }

    #[must_use]
    pub const fn owns(&self, token: Token) -> bool {
        token.0 >= self.token_base && token.0 < self.token_base + TOKEN_SPAN
    }

    /// Sends probes, sweeps expired results and rescans interfaces when due.
    pub fn on_timers(&mut self, now: Instant, registry: &Registry) {
        if now >= self.next_rescan {
            self.next_rescan = now + self.config.interface_rescan;
            if self.config.interfaces.is_none() {
                let mut current: Vec<Ipv4Addr> =
                    self.current_interfaces().iter().map(|i| i.addr).collect();
                let mut open: Vec<Ipv4Addr> = self.sockets.iter().map(|s| s.iface.addr).collect();
                current.sort_unstable();
                open.sort_unstable();
                if current != open {
                    debug!(?current, ?open, "interface set changed");
                    self.rebuild(registry);
                }
            }
        }

        if now >= self.next_ping {
            self.next_ping = now + self.config.ping_interval;
            self.send_probes();
            let _expired = self.table.sweep(now);
            if _expired > 0 {
                debug!(expired = _expired, "discovery results expired");
            }
        }
    }

    fn send_probes(&self) {
        for probe in &self.sockets {
            for &dest in &self.destinations {
                if let Err(_e) = probe.socket.try_send_to(&self.probe, dest) {
                    trace!(addr = %probe.iface.addr, %dest, error = %_e, "probe send failed");
                }
            }
        }
    }

    /// Drains every datagram queued on the socket behind `token`.
    pub fn on_readable(&mut self, token: Token, now: Instant) {
        let Some(index) = token.0.checked_sub(self.token_base) else {
            return;
        };
        let Some(probe) = self.sockets.get(index) else {
            return;
        };
        let interface = probe.iface.addr;
        let mut replies = Vec::new();
        loop {
            match probe.socket.try_recv_from(&mut self.recv_buf) {
                Ok(Some((n, from))) => match DiscoveryPacket::decode(&self.recv_buf[..n]) {
                    Ok(DiscoveryPacket {
                        body: DiscoveryBody::Reply(payload),
                        ..
                    }) => replies.push((from, payload)),
                    Ok(_) => {}
                    Err(_e) => {
                        trace!(%from, error = %_e, "ignoring malformed discovery datagram");
                    }
                },
                Ok(None) => break,
                Err(_e) => {
                    debug!(addr = %interface, error = %_e, "discovery recv failed");
                    break;
                }
            }
        }
        for (from, payload) in replies {
            self.accept_reply(interface, from, payload, now);
        }
    }

    fn accept_reply(&mut self, interface: Ipv4Addr, source: Endpoint, payload: Message, now: Instant) {
        if !self.filter.matches(&payload) {
            trace!(%source, "reply rejected by filter");
            return;
        }
        let Some(peer_id) = protocol::peer_id(&payload) else {
            debug!(%source, "reply without peer id");
            return;
        };
        if protocol::system_name(&payload).is_none() {
            debug!(%source, "reply without system name");
            return;
        }
        let key = RawKey {
            interface,
            source,
            peer_id,
        };
        if self
            .table
            .upsert(key, payload, now + self.config.result_lifetime())
        {
            trace!(%source, peer_id, "discovery result changed");
        }
    }

    /// Earliest instant at which [`on_timers`](Self::on_timers) has work.
    #[must_use]
    pub fn next_deadline(&self) -> Instant {
        self.next_ping.min(self.next_rescan)
    }

    /// Cooks and diffs if anything changed since the last call.
    pub fn take_changes(&mut self) -> Vec<DiscoveryChange> {
        self.table.take_changes()
    }

    /// Systems as last reported by [`take_changes`](Self::take_changes).
    #[must_use]
    pub const fn systems(&self) -> &BTreeMap<String, SystemInfo> {
        self.table.reported()
    }

    /// The interface a reply arrived on, for link-kind decisions.
    #[must_use]
    pub fn interface(&self, addr: Ipv4Addr) -> Option<&LocalInterface> {
        self.sockets
            .iter()
            .map(|s| &s.iface)
            .find(|i| i.addr == addr)
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::protocol::advertisement;
    use mio::{Events, Poll};
    use std::time::Duration;

    fn loopback_config(target: Endpoint) -> DiscoveryConfig {
        DiscoveryConfig {
            multicast: false,
            interfaces: Some(vec![Ipv4Addr::LOCALHOST]),
            unicast_targets: vec![target.into()],
            ping_interval: Duration::from_millis(20),
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn probe_reply_roundtrip_over_loopback() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = Endpoint::from(server.local_addr().unwrap());

        let mut poll = Poll::new().unwrap();
        let query = DiscoveryQuery::new("mixer*");
        let mut engine =
            DiscoveryEngine::new(loopback_config(target), &query, Token(100)).unwrap();
        engine.open(poll.registry());
        assert_eq!(engine.socket_count(), 1);
        engine.on_timers(Instant::now(), poll.registry());

        let mut buf = [0u8; 2048];
        let (n, client) = server.recv_from(&mut buf).unwrap();
        assert!(matches!(
            DiscoveryPacket::decode(&buf[..n]).unwrap().body,
            DiscoveryBody::Probe { .. }
        ));

        let mut out = Vec::new();
        DiscoveryPacket::reply(advertisement("other", "nope", 9))
            .encode_into(&mut out)
            .unwrap();
        server.send_to(&out, client).unwrap();
        DiscoveryPacket::reply(advertisement("mixer-2", "sys1", 1))
            .encode_into(&mut out)
            .unwrap();
        server.send_to(&out, client).unwrap();

        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut changes = Vec::new();
        while changes.is_empty() && Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            for event in &events {
                assert!(engine.owns(event.token()));
                engine.on_readable(event.token(), Instant::now());
            }
            changes = engine.take_changes();
        }
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].system, "sys1");
        assert!(engine.systems().contains_key("sys1"));
        assert!(!engine.systems().contains_key("nope"));
    }

    #[test]
    fn rebuild_reopens_sockets_in_the_same_token_range() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target = Endpoint::from(server.local_addr().unwrap());

        let mut poll = Poll::new().unwrap();
        let query = DiscoveryQuery::new("*");
        let mut engine =
            DiscoveryEngine::new(loopback_config(target), &query, Token(40)).unwrap();
        engine.open(poll.registry());
        assert_eq!(engine.socket_count(), 1);

        engine.rebuild(poll.registry());
        assert_eq!(engine.socket_count(), 1);
        assert!(engine.interface(Ipv4Addr::LOCALHOST).is_some());

        // The rebuilt socket probes immediately and still receives replies.
        engine.on_timers(Instant::now(), poll.registry());
        let mut buf = [0u8; 2048];
        let (_, client) = server.recv_from(&mut buf).unwrap();
        let mut out = Vec::new();
        DiscoveryPacket::reply(advertisement("any", "sys2", 4))
            .encode_into(&mut out)
            .unwrap();
        server.send_to(&out, client).unwrap();

        let mut events = Events::with_capacity(8);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut changes = Vec::new();
        while changes.is_empty() && Instant::now() < deadline {
            poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
            for event in &events {
                assert_eq!(event.token(), Token(40));
                engine.on_readable(event.token(), Instant::now());
            }
            changes = engine.take_changes();
        }
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].system, "sys2");
    }
}
