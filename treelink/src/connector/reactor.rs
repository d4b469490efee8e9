//! Connector background thread.
//!
//! One `mio::Poll` serves every phase. The mailbox waker is registered once;
//! discovery sockets, the TCP stream and the time-sync socket come and go
//! with their phase.
//!
//! ```text
//!            ┌──────────────┐ exactly one system  ┌────────────┐ connect ok ┌───────────┐
//!  start ──▶ │ Discovering  │ ──────────────────▶ │ Connecting │ ─────────▶ │ Connected │
//!            └──────────────┘                     └────────────┘            └───────────┘
//!                   ▲                                   │ fail/timeout           │ error, EOF,
//!                   │ delay elapsed / reconnect()       ▼                        │ silent link
//!                   └──────────────────────────── ┌──────────┐ ◀─────────────────┘
//!                                                 │ Delaying │
//!                                                 └──────────┘
//! ```
//!
//! A `Shutdown` command ends the thread from any phase.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use minstant::Instant;
use mio::{Events, Poll, Token};
use parking_lot::Mutex;

use crate::callback::CallbackRequester;
use crate::config::{ConnectorConfig, KEEPALIVE_MISSES};
use crate::discovery::protocol::field;
use crate::discovery::{DiscoveryEngine, DiscoveryQuery, PeerInfo, SystemInfo};
use crate::filter::QueryFilter;
use crate::message::Message;
use crate::net::{Endpoint, InterfaceKind};
use crate::sync::mailbox::MailboxReceiver;
use crate::trace::{debug, error, info, trace, warn};

use super::clock::ClockEstimate;
use super::session::{Liveness, SessionError, TcpSession};
use super::timesync::{TimeSample, TimeSyncUnit};
use super::{ConnectorState, PortSelector};

pub(super) const MAILBOX_CAPACITY: usize = 256;
pub(super) const MAILBOX_TOKEN: Token = Token(0);
const TCP_TOKEN: Token = Token(1);
const TIMESYNC_TOKEN: Token = Token(2);
const ENGINE_TOKEN_BASE: Token = Token(16);

pub(super) const BIT_EVENTS: u32 = 1;

/// Owner → reactor.
pub(super) enum Command {
    Send(Message),
    Reconnect,
    Shutdown,
}

/// Reactor → owner.
#[derive(Debug)]
pub(super) enum ConnectorEvent {
    Connected(PeerInfo),
    Disconnected,
    Message(Message),
    ClockOffset(Option<i64>),
}

pub(super) type Outbox = Arc<Mutex<VecDeque<ConnectorEvent>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    /// Start over without waiting out the reconnect delay.
    Restart,
    Stop,
}

#[derive(Default)]
struct CommandOutcome {
    shutdown: bool,
    reconnect: bool,
}

struct Target {
    peer: PeerInfo,
    endpoint: Endpoint,
    link: InterfaceKind,
}

pub(super) struct ConnectorReactor {
    pub(super) poll: Poll,
    pub(super) mailbox: MailboxReceiver<Command, MAILBOX_CAPACITY>,
    pub(super) requester: CallbackRequester,
    pub(super) outbox: Outbox,
    pub(super) state: Arc<AtomicU8>,
    pub(super) config: ConnectorConfig,
    pub(super) selector: Arc<dyn PortSelector>,
    pub(super) clock: ClockEstimate,
}

impl ConnectorReactor {
    pub(super) fn run(mut self) {
        loop {
            let Some(target) = self.discover() else {
                break;
            };
            match self.run_session(target) {
                Flow::Stop => break,
                Flow::Restart => continue,
                Flow::Continue => {}
            }
            if self.delay() == Flow::Stop {
                break;
            }
        }
        self.set_state(ConnectorState::Idle);
    }

    fn set_state(&self, state: ConnectorState) {
        trace!(?state, "connector state");
        self.state.store(state as u8, Ordering::Release);
    }

    fn emit(&self, event: ConnectorEvent) {
        self.outbox.lock().push_back(event);
        self.requester.request_callback(BIT_EVENTS, 0);
    }

    fn drain_commands(&mut self, mut on_send: impl FnMut(Message)) -> CommandOutcome {
        let mut outcome = CommandOutcome::default();
        while let Some(cmd) = self.mailbox.pop() {
            match cmd {
                Command::Send(msg) => on_send(msg),
                Command::Reconnect => outcome.reconnect = true,
                Command::Shutdown => {
                    outcome.shutdown = true;
                    break;
                }
            }
        }
        outcome
    }

    /// Runs discovery until exactly one system with a usable peer is known.
    /// Returns `None` on shutdown.
    fn discover(&mut self) -> Option<Target> {
        self.set_state(ConnectorState::Discovering);
        let name_filter = QueryFilter::Matches(field::SYSTEM_NAME.into(), self.config.system_name.clone());
        let query = DiscoveryQuery {
            signature: self.config.signature.clone(),
            filter: QueryFilter::and_opt(Some(name_filter), self.config.filter.clone()),
        };
        let mut engine = match DiscoveryEngine::new(self.config.discovery.clone(), &query, ENGINE_TOKEN_BASE) {
            Ok(engine) => engine,
            Err(_e) => {
                error!(error = %_e, "cannot build discovery probe");
                return None;
            }
        };
        engine.open(self.poll.registry());
        info!(system = %self.config.system_name, "discovering");

        let mut events = Events::with_capacity(64);
        let mut ambiguous_logged = false;
        let found = 'discover: loop {
            engine.on_timers(Instant::now(), self.poll.registry());
            let _ = engine.take_changes();
            if let Some(target) = self.choose(&engine, &mut ambiguous_logged) {
                break Some(target);
            }

            let timeout = engine.next_deadline().saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "connector poll failed");
                break None;
            }
            for event in &events {
                let token = event.token();
                if token == MAILBOX_TOKEN {
                    let outcome = self.drain_commands(|_msg| {
                        debug!("dropping outbound message while discovering");
                    });
                    if outcome.shutdown {
                        break 'discover None;
                    }
                } else if engine.owns(token) {
                    engine.on_readable(token, Instant::now());
                }
            }
        };
        engine.close(self.poll.registry());
        found
    }

    fn choose(&self, engine: &DiscoveryEngine, ambiguous_logged: &mut bool) -> Option<Target> {
        let systems = engine.systems();
        if systems.len() > 1 {
            if !*ambiguous_logged {
                warn!(count = systems.len(), "several systems match; waiting for exactly one");
                *ambiguous_logged = true;
            }
            return None;
        }
        let system: &SystemInfo = systems.values().next()?;
        system.peers().find_map(|peer| {
            let endpoint = self.selector.select(peer).filter(Endpoint::is_connectable)?;
            let link = engine
                .interface(peer.interface)
                .map_or(InterfaceKind::Wired, |i| i.kind);
            Some(Target {
                peer: peer.clone(),
                endpoint,
                link,
            })
        })
    }

    fn run_session(&mut self, target: Target) -> Flow {
        self.set_state(ConnectorState::Connecting);
        info!(peer = %target.endpoint, peer_id = target.peer.peer_id, "connecting");

        let mut tcp = match TcpSession::connect(target.endpoint, self.poll.registry(), TCP_TOKEN) {
            Ok(tcp) => tcp,
            Err(_e) => {
                warn!(peer = %target.endpoint, error = %_e, "connect failed");
                return Flow::Continue;
            }
        };
        let connect_deadline = Instant::now() + self.config.connect_timeout;
        let interval = self.config.inactivity_interval;
        let mut timesync: Option<TimeSyncUnit> = None;
        let mut events = Events::with_capacity(64);

        let result: Result<Flow, SessionError> = 'session: loop {
            let now = Instant::now();
            if !tcp.is_established() && now >= connect_deadline {
                break Err(SessionError::ConnectTimeout);
            }
            match tcp.check_liveness(now, interval) {
                Ok(Liveness::ReplyOverdue) => {
                    if let Some(ts) = timesync.as_mut() {
                        ts.accelerate(now, interval * KEEPALIVE_MISSES);
                    }
                }
                Ok(Liveness::Alive | Liveness::PingSent) => {}
                Err(e) => break Err(e),
            }
            if let Some(ts) = timesync.as_mut() {
                ts.on_timer(now);
            }

            let mut deadline = if tcp.is_established() {
                tcp.next_deadline(interval)
            } else {
                connect_deadline
            };
            if let Some(ts) = &timesync {
                deadline = deadline.min(ts.next_deadline());
            }
            let timeout = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                break Err(e.into());
            }

            for event in &events {
                match event.token() {
                    MAILBOX_TOKEN => {
                        let mut send_error = None;
                        let outcome = self.drain_commands(|msg| {
                            if send_error.is_none()
                                && let Err(e) = tcp.send(&msg)
                            {
                                send_error = Some(e);
                            }
                        });
                        if outcome.shutdown {
                            break 'session Ok(Flow::Stop);
                        }
                        if let Some(e) = send_error {
                            break 'session Err(e);
                        }
                        if outcome.reconnect {
                            debug!(peer = %target.endpoint, "reconnect requested");
                            break 'session Ok(Flow::Restart);
                        }
                    }
                    TCP_TOKEN => match tcp.on_event(event, Instant::now()) {
                        Ok((established, messages)) => {
                            if established {
                                timesync = self.on_connected(&target);
                            }
                            for msg in messages {
                                self.emit(ConnectorEvent::Message(msg));
                            }
                        }
                        Err(e) => break 'session Err(e),
                    },
                    TIMESYNC_TOKEN => {
                        if let Some(ts) = timesync.as_mut() {
                            for sample in ts.on_readable() {
                                self.on_time_sample(sample);
                            }
                        }
                    }
                    _ => {}
                }
            }
        };

        if let Some(ts) = timesync.as_mut() {
            ts.close(self.poll.registry());
        }
        tcp.close(self.poll.registry());
        match &result {
            Ok(_) => info!(peer = %target.endpoint, "session closed"),
            Err(_e) => warn!(peer = %target.endpoint, error = %_e, "session ended"),
        }
        if tcp.is_established() {
            self.emit(ConnectorEvent::Disconnected);
        }
        if self.clock.offset().is_some() {
            self.clock.clear();
            self.emit(ConnectorEvent::ClockOffset(None));
        }
        result.unwrap_or(Flow::Continue)
    }

    fn on_connected(&mut self, target: &Target) -> Option<TimeSyncUnit> {
        self.set_state(ConnectorState::Connected);
        info!(peer = %target.endpoint, link = ?target.link, "connected");
        self.emit(ConnectorEvent::Connected(target.peer.clone()));

        let ts_endpoint = target.peer.time_sync_endpoint()?;
        match TimeSyncUnit::open(
            ts_endpoint,
            self.config.time_sync_interval,
            self.config.time_sync_fast_interval,
            target.link == InterfaceKind::Wireless,
            self.poll.registry(),
            TIMESYNC_TOKEN,
        ) {
            Ok(unit) => Some(unit),
            Err(_e) => {
                warn!(peer = %ts_endpoint, error = %_e, "time-sync socket failed");
                None
            }
        }
    }

    fn on_time_sample(&mut self, sample: TimeSample) {
        if let Some(offset) =
            self.clock
                .add_sample(sample.rtt, Some(sample.peer_clock), sample.local_receive)
        {
            self.emit(ConnectorEvent::ClockOffset(Some(offset)));
        }
    }

    fn delay(&mut self) -> Flow {
        self.set_state(ConnectorState::Delaying);
        let deadline = self.config.reconnect.delay().map(|d| Instant::now() + d);
        debug!(policy = ?self.config.reconnect, "delaying before reconnect");

        let mut events = Events::with_capacity(8);
        loop {
            let timeout = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Flow::Continue;
                    }
                    Some(deadline.saturating_duration_since(now))
                }
                None => None,
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "connector poll failed");
                return Flow::Stop;
            }
            if events.iter().any(|e| e.token() == MAILBOX_TOKEN) {
                let outcome = self.drain_commands(|_msg| {
                    debug!("dropping outbound message while disconnected");
                });
                if outcome.shutdown {
                    return Flow::Stop;
                }
                if outcome.reconnect {
                    return Flow::Continue;
                }
            }
        }
    }
}
