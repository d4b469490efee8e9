//! TCP unit of a connector session.
//!
//! Owns the non-blocking stream, reassembles inbound frames, buffers outbound
//! bytes until the socket accepts them, and runs the keep-alive protocol:
//!
//! - idle longer than the inactivity interval with no ping outstanding:
//!   send a keep-alive ping;
//! - any inbound data (application or keep-alive) counts as liveness;
//! - [`KEEPALIVE_MISSES`] intervals with no data at all: the link is dead.

use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use minstant::Instant;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use thiserror::Error;

use crate::config::KEEPALIVE_MISSES;
use crate::message::{Message, WireError};
use crate::net::Endpoint;
use crate::trace::trace;

use super::framing::{self, FrameDecoder, Keepalive};

const READ_CHUNK: usize = 64 * 1024;

/// Why a session ended. Every variant is a transient network condition: the
/// connector reports a disconnect and retries.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("peer closed the connection")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),
    #[error("no data for {0:?}")]
    Silent(Duration),
}

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// A keep-alive ping was just queued.
    PingSent,
    /// A ping is outstanding and a further interval passed without data.
    ReplyOverdue,
}

pub struct TcpSession {
    stream: TcpStream,
    peer: Endpoint,
    established: bool,
    decoder: FrameDecoder,
    outbound: Vec<u8>,
    written: usize,
    last_read: Instant,
    ping_outstanding: bool,
    read_buf: Box<[u8]>,
}

impl TcpSession {
    /// Starts a non-blocking connect and registers the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connect cannot be initiated.
    pub fn connect(peer: Endpoint, registry: &Registry, token: Token) -> io::Result<Self> {
        let mut stream = TcpStream::connect(peer.into())?;
        registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            stream,
            peer,
            established: false,
            decoder: FrameDecoder::new(),
            outbound: Vec::new(),
            written: 0,
            last_read: Instant::now(),
            ping_outstanding: false,
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    #[must_use]
    pub const fn peer(&self) -> Endpoint {
        self.peer
    }

    #[must_use]
    pub const fn is_established(&self) -> bool {
        self.established
    }

    /// Handles a readiness event. Returns whether the connect completed during
    /// this call, plus every application message received.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the session must end.
    pub fn on_event(
        &mut self,
        event: &Event,
        now: Instant,
    ) -> Result<(bool, Vec<Message>), SessionError> {
        let mut just_established = false;
        if !self.established {
            if event.is_error() || event.is_write_closed() {
                let err = self
                    .stream
                    .take_error()?
                    .unwrap_or_else(|| io::Error::from(ErrorKind::ConnectionRefused));
                return Err(SessionError::Connect(err));
            }
            if !event.is_writable() {
                return Ok((false, Vec::new()));
            }
            match self.stream.peer_addr() {
                Ok(_) => {
                    self.established = true;
                    just_established = true;
                    self.last_read = now;
                    let _ = self.stream.set_nodelay(true);
                }
                Err(e) if e.kind() == ErrorKind::NotConnected => {
                    return Ok((false, Vec::new()));
                }
                Err(e) => return Err(SessionError::Connect(e)),
            }
        }

        let mut messages = Vec::new();
        if event.is_readable() || event.is_read_closed() {
            self.read_available(now, &mut messages)?;
        }
        self.flush()?;
        Ok((just_established, messages))
    }

    fn read_available(&mut self, now: Instant, messages: &mut Vec<Message>) -> Result<(), SessionError> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(n) => {
                    self.last_read = now;
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        while let Some(msg) = self.decoder.next_frame()? {
            match framing::classify(&msg) {
                Keepalive::None => messages.push(msg),
                Keepalive::Ping => {
                    trace!(peer = %self.peer, "answering keep-alive");
                    self.queue(&framing::keepalive_reply())?;
                }
                Keepalive::Reply => {
                    trace!(peer = %self.peer, "keep-alive answered");
                    self.ping_outstanding = false;
                }
            }
        }
        Ok(())
    }

    /// Buffers `msg` and tries to write immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if encoding or the write fails.
    pub fn send(&mut self, msg: &Message) -> Result<(), SessionError> {
        self.queue(msg)?;
        if self.established {
            self.flush()?;
        }
        Ok(())
    }

    fn queue(&mut self, msg: &Message) -> Result<(), WireError> {
        framing::encode_frame(msg, &mut self.outbound)
    }

    fn flush(&mut self) -> Result<(), SessionError> {
        while self.written < self.outbound.len() {
            match self.stream.write(&self.outbound[self.written..]) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.outbound.clear();
        self.written = 0;
        Ok(())
    }

    /// Sends a keep-alive when idle and detects a dead link.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Silent`] after [`KEEPALIVE_MISSES`] intervals
    /// without data.
    pub fn check_liveness(&mut self, now: Instant, interval: Duration) -> Result<Liveness, SessionError> {
        if !self.established {
            return Ok(Liveness::Alive);
        }
        let idle = now.saturating_duration_since(self.last_read);
        if idle >= interval * KEEPALIVE_MISSES {
            return Err(SessionError::Silent(idle));
        }
        if idle < interval {
            return Ok(Liveness::Alive);
        }
        if !self.ping_outstanding {
            self.ping_outstanding = true;
            self.send(&framing::keepalive_ping())?;
            return Ok(Liveness::PingSent);
        }
        if idle >= interval * 2 {
            return Ok(Liveness::ReplyOverdue);
        }
        Ok(Liveness::Alive)
    }

    /// When [`check_liveness`](Self::check_liveness) next has something to do.
    #[must_use]
    pub fn next_deadline(&self, interval: Duration) -> Instant {
        let idle_deadline = self.last_read + interval;
        if !self.ping_outstanding {
            return idle_deadline;
        }
        // Wake once per interval so overdue replies and the dead-link limit
        // are noticed on time.
        let elapsed = Instant::now().saturating_duration_since(self.last_read);
        let intervals = (elapsed.as_micros() / interval.as_micros().max(1)) as u32 + 1;
        self.last_read + interval * intervals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll};
    use std::net::TcpListener;

    const TOKEN: Token = Token(1);

    fn establish(poll: &mut Poll, session: &mut TcpSession) {
        let mut events = Events::with_capacity(8);
        for _ in 0..100 {
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for event in &events {
                let (done, _) = session.on_event(event, Instant::now()).unwrap();
                if done {
                    return;
                }
            }
        }
        panic!("connect never completed");
    }

    #[test]
    fn exchanges_frames_and_answers_keepalives() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = Endpoint::from(listener.local_addr().unwrap());
        let mut poll = Poll::new().unwrap();
        let mut session = TcpSession::connect(addr, poll.registry(), TOKEN).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        establish(&mut poll, &mut session);
        assert!(session.is_established());

        let mut wire = Vec::new();
        framing::encode_frame(&framing::keepalive_ping(), &mut wire).unwrap();
        framing::encode_frame(&Message::new(5).with("k", "v"), &mut wire).unwrap();
        server.write_all(&wire).unwrap();

        let mut events = Events::with_capacity(8);
        let mut received = Vec::new();
        for _ in 0..100 {
            poll.poll(&mut events, Some(Duration::from_millis(20))).unwrap();
            for event in &events {
                received.extend(session.on_event(event, Instant::now()).unwrap().1);
            }
            if !received.is_empty() {
                break;
            }
        }
        assert_eq!(received, vec![Message::new(5).with("k", "v")]);

        // The keep-alive ping was answered, not surfaced.
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        let reply = loop {
            let n = server.read(&mut buf).unwrap();
            decoder.extend(&buf[..n]);
            if let Some(msg) = decoder.next_frame().unwrap() {
                break msg;
            }
        };
        assert_eq!(framing::classify(&reply), Keepalive::Reply);
    }

    #[test]
    fn liveness_escalates_to_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = Endpoint::from(listener.local_addr().unwrap());
        let mut poll = Poll::new().unwrap();
        let mut session = TcpSession::connect(addr, poll.registry(), TOKEN).unwrap();
        let (_server, _) = listener.accept().unwrap();
        establish(&mut poll, &mut session);

        let interval = Duration::from_millis(100);
        let start = session.last_read;
        assert_eq!(session.check_liveness(start, interval).unwrap(), Liveness::Alive);
        assert_eq!(
            session.check_liveness(start + interval, interval).unwrap(),
            Liveness::PingSent
        );
        assert_eq!(
            session.check_liveness(start + interval * 2, interval).unwrap(),
            Liveness::ReplyOverdue
        );
        assert!(matches!(
            session.check_liveness(start + interval * 5, interval),
            Err(SessionError::Silent(_))
        ));
    }
}
