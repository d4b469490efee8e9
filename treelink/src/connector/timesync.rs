//! UDP time-sync exchange.
//!
//! # Wire Format
//!
//! ```text
//! ┌─────────┬─────────┬─────────┬───────────────────────────────────┐
//! │ Type(1) │ Flags(1)│ Len(2)  │ Sequence (4)                      │
//! ├─────────┴─────────┴─────────┴───────────────────────────────────┤
//! │ Client send time, µs since epoch (8)                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Server clock at receipt, µs since epoch (8)      PONG only      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server echoes the client's send time, so the client needs no
//! per-sequence bookkeeping to compute the round trip.

use std::io;

use minstant::Instant;
use mio::{Interest, Registry, Token};
use thiserror::Error;

use crate::net::{Endpoint, UdpSocket};
use crate::trace::trace;

use super::clock::wall_micros;

pub const PING: u8 = 0x20;
pub const PONG: u8 = 0x21;

pub const HEADER_SIZE: usize = 8;
pub const PING_SIZE: usize = HEADER_SIZE + 8;
pub const PONG_SIZE: usize = PING_SIZE + 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeSyncError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncPacket {
    Ping { seq: u32, sent_at: i64 },
    Pong { seq: u32, sent_at: i64, server_clock: i64 },
}

impl TimeSyncPacket {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = PacketWriter::new(buf);
        match *self {
            Self::Ping { seq, sent_at } => {
                w.header(PING, seq);
                w.put_i64(sent_at);
            }
            Self::Pong {
                seq,
                sent_at,
                server_clock,
            } => {
                w.header(PONG, seq);
                w.put_i64(sent_at);
                w.put_i64(server_clock);
            }
        }
        w.patch_length();
    }

    /// # Errors
    ///
    /// Returns [`TimeSyncError`] on a short or unknown packet.
    pub fn decode(bytes: &[u8]) -> Result<Self, TimeSyncError> {
        let mut r = PacketReader::new(bytes);
        let kind = r.take_u8()?;
        let _flags = r.take_u8()?;
        let _len = r.take_u16()?;
        let seq = r.take_u32()?;
        match kind {
            PING => Ok(Self::Ping {
                seq,
                sent_at: r.take_i64()?,
            }),
            PONG => Ok(Self::Pong {
                seq,
                sent_at: r.take_i64()?,
                server_clock: r.take_i64()?,
            }),
            other => Err(TimeSyncError::UnknownType(other)),
        }
    }

    /// The answer a server sends for `ping`, stamped with `server_clock`.
    #[must_use]
    pub const fn pong_for(ping: &Self, server_clock: i64) -> Option<Self> {
        match *ping {
            Self::Ping { seq, sent_at } => Some(Self::Pong {
                seq,
                sent_at,
                server_clock,
            }),
            Self::Pong { .. } => None,
        }
    }
}

struct PacketWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PacketWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    fn header(&mut self, kind: u8, seq: u32) {
        self.buf.push(kind);
        self.buf.push(0);
        self.buf.extend_from_slice(&0u16.to_le_bytes());
        self.buf.extend_from_slice(&seq.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn patch_length(&mut self) {
        let len = (self.buf.len() as u16).to_le_bytes();
        self.buf[2..4].copy_from_slice(&len);
    }
}

struct PacketReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> PacketReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], TimeSyncError> {
        let end = self.cursor + N;
        let Some(bytes) = self.buf.get(self.cursor..end) else {
            return Err(TimeSyncError::BufferTooSmall {
                need: end,
                have: self.buf.len(),
            });
        };
        self.cursor = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn take_u8(&mut self) -> Result<u8, TimeSyncError> {
        self.take::<1>().map(|b| b[0])
    }

    fn take_u16(&mut self) -> Result<u16, TimeSyncError> {
        self.take().map(u16::from_le_bytes)
    }

    fn take_u32(&mut self) -> Result<u32, TimeSyncError> {
        self.take().map(u32::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, TimeSyncError> {
        self.take().map(i64::from_le_bytes)
    }
}

/// One completed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub rtt: std::time::Duration,
    pub peer_clock: i64,
    pub local_receive: i64,
}

/// Client end of the exchange, hosted in the connector's session reactor.
pub struct TimeSyncUnit {
    socket: UdpSocket,
    peer: Endpoint,
    interval: std::time::Duration,
    fast_interval: std::time::Duration,
    /// Wireless links stay on the fast rate permanently.
    always_fast: bool,
    fast_until: Option<Instant>,
    next_ping: Instant,
    seq: u32,
    buf: Vec<u8>,
}

impl TimeSyncUnit {
    /// Binds an ephemeral socket and registers it with `token`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or registered.
    pub fn open(
        peer: Endpoint,
        interval: std::time::Duration,
        fast_interval: std::time::Duration,
        always_fast: bool,
        registry: &Registry,
        token: Token,
    ) -> io::Result<Self> {
        let mut socket = UdpSocket::bind(Endpoint::any(0))?;
        registry.register(&mut socket, token, Interest::READABLE)?;
        Ok(Self {
            socket,
            peer,
            interval,
            fast_interval,
            always_fast,
            fast_until: None,
            next_ping: Instant::now(),
            seq: 0,
            buf: vec![0u8; 64],
        })
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.socket);
    }

    /// Runs at the fast rate for the next `span`, e.g. after the TCP unit
    /// misses a keep-alive reply.
    pub fn accelerate(&mut self, now: Instant, span: std::time::Duration) {
        self.fast_until = Some(now + span);
        self.next_ping = self.next_ping.min(now + self.fast_interval);
    }

    fn current_interval(&self, now: Instant) -> std::time::Duration {
        let boosted = self.fast_until.is_some_and(|until| now < until);
        if self.always_fast || boosted {
            self.fast_interval
        } else {
            self.interval
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        if now < self.next_ping {
            return;
        }
        self.next_ping = now + self.current_interval(now);
        self.seq = self.seq.wrapping_add(1);
        TimeSyncPacket::Ping {
            seq: self.seq,
            sent_at: wall_micros(),
        }
        .encode(&mut self.buf);
        if let Err(_e) = self.socket.try_send_to(&self.buf, self.peer) {
            trace!(peer = %self.peer, error = %_e, "time-sync ping failed");
        }
    }

    #[must_use]
    pub const fn next_deadline(&self) -> Instant {
        self.next_ping
    }

    /// Drains answers and returns the completed samples.
    pub fn on_readable(&mut self) -> Vec<TimeSample> {
        let mut samples = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match self.socket.try_recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    if from != self.peer {
                        continue;
                    }
                    let local_receive = wall_micros();
                    if let Ok(TimeSyncPacket::Pong {
                        sent_at,
                        server_clock,
                        ..
                    }) = TimeSyncPacket::decode(&buf[..n])
                        && local_receive >= sent_at
                    {
                        samples.push(TimeSample {
                            rtt: std::time::Duration::from_micros((local_receive - sent_at) as u64),
                            peer_clock: server_clock,
                            local_receive,
                        });
                    }
                }
                Ok(None) => break,
                Err(_e) => {
                    trace!(error = %_e, "time-sync recv failed");
                    break;
                }
            }
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_echoes_ping() {
        let ping = TimeSyncPacket::Ping {
            seq: 9,
            sent_at: 1234,
        };
        let mut buf = Vec::new();
        ping.encode(&mut buf);
        assert_eq!(buf.len(), PING_SIZE);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]) as usize, PING_SIZE);

        let decoded = TimeSyncPacket::decode(&buf).unwrap();
        let pong = TimeSyncPacket::pong_for(&decoded, 99).unwrap();
        pong.encode(&mut buf);
        assert_eq!(buf.len(), PONG_SIZE);
        assert_eq!(
            TimeSyncPacket::decode(&buf).unwrap(),
            TimeSyncPacket::Pong {
                seq: 9,
                sent_at: 1234,
                server_clock: 99
            }
        );
        assert_eq!(TimeSyncPacket::pong_for(&pong, 1), None);
    }

    #[test]
    fn short_and_unknown_packets() {
        assert_eq!(
            TimeSyncPacket::decode(&[PING, 0]),
            Err(TimeSyncError::BufferTooSmall { need: 4, have: 2 })
        );
        assert_eq!(
            TimeSyncPacket::decode(&[0x7f, 0, 0, 0, 0, 0, 0, 0]),
            Err(TimeSyncError::UnknownType(0x7f))
        );
    }

    #[test]
    fn unit_samples_against_loopback_responder() {
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let peer = Endpoint::from(server.local_addr().unwrap());

        let mut poll = mio::Poll::new().unwrap();
        let mut unit = TimeSyncUnit::open(
            peer,
            std::time::Duration::from_secs(1),
            std::time::Duration::from_millis(10),
            false,
            poll.registry(),
            Token(3),
        )
        .unwrap();
        unit.on_timer(Instant::now());

        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).unwrap();
        let pong = TimeSyncPacket::pong_for(&TimeSyncPacket::decode(&buf[..n]).unwrap(), 42).unwrap();
        let mut out = Vec::new();
        pong.encode(&mut out);
        server.send_to(&out, from).unwrap();

        let mut events = mio::Events::with_capacity(4);
        let mut samples = Vec::new();
        for _ in 0..40 {
            poll.poll(&mut events, Some(std::time::Duration::from_millis(50)))
                .unwrap();
            samples.extend(unit.on_readable());
            if !samples.is_empty() {
                break;
            }
        }
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].peer_clock, 42);
    }

    fn sink() -> (std::net::UdpSocket, Endpoint) {
        let sink = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = Endpoint::from(sink.local_addr().unwrap());
        (sink, peer)
    }

    #[test]
    fn accelerate_runs_fast_for_the_span_only() {
        const BASE: std::time::Duration = std::time::Duration::from_secs(1);
        const FAST: std::time::Duration = std::time::Duration::from_millis(10);
        const SPAN: std::time::Duration = std::time::Duration::from_millis(100);

        let (_sink, peer) = sink();
        let poll = mio::Poll::new().unwrap();
        let mut unit = TimeSyncUnit::open(peer, BASE, FAST, false, poll.registry(), Token(3)).unwrap();

        let now = Instant::now();
        unit.on_timer(now);
        assert_eq!(unit.next_deadline(), now + BASE);
        assert_eq!(unit.current_interval(now), BASE);

        unit.accelerate(now, SPAN);
        assert_eq!(unit.next_deadline(), now + FAST);
        assert_eq!(unit.current_interval(now), FAST);

        let tick = now + FAST;
        unit.on_timer(tick);
        assert_eq!(unit.next_deadline(), tick + FAST);

        let after = now + SPAN * 2;
        assert_eq!(unit.current_interval(after), BASE);
        unit.on_timer(after);
        assert_eq!(unit.next_deadline(), after + BASE);
    }

    #[test]
    fn wireless_link_stays_fast() {
        let fast = std::time::Duration::from_millis(10);
        let (_sink, peer) = sink();
        let poll = mio::Poll::new().unwrap();
        let mut unit = TimeSyncUnit::open(
            peer,
            std::time::Duration::from_secs(1),
            fast,
            true,
            poll.registry(),
            Token(3),
        )
        .unwrap();

        let now = Instant::now();
        unit.on_timer(now);
        assert_eq!(unit.next_deadline(), now + fast);
        let later = now + std::time::Duration::from_secs(60);
        assert_eq!(unit.current_interval(later), fast);
    }
}
