//! Reconnecting client connector.
//!
//! A [`ClientConnector`] finds a server system through discovery, keeps one
//! TCP session to it alive, and estimates the server's clock over a UDP
//! side channel. All socket work happens on a `treelink-connector` thread;
//! results come back to the owner thread through the
//! [`CallbackMechanism`](crate::callback::CallbackMechanism).
//!
//! ```text
//!   owner thread                                  treelink-connector
//!  ┌───────────────────┐   Send/Reconnect/Shutdown  ┌───────────────────────┐
//!  │ ClientConnector   │ ─────── mailbox ─────────▶ │ ConnectorReactor      │
//!  │   ConnectorHandler│                            │  DiscoveryEngine      │
//!  │                   │ ◀── outbox + callback ──── │  TcpSession           │
//!  └───────────────────┘   Connected/Message/Clock  │  TimeSyncUnit         │
//!                                                   └───────────────────────┘
//! ```
//!
//! Events reach the handler in the order the reactor produced them. Calls
//! into the connector from inside a handler callback are allowed.

pub mod clock;
pub mod framing;
mod reactor;
pub mod session;
pub mod timesync;

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::Poll;
use parking_lot::Mutex;
use thiserror::Error;

use crate::callback::{CallbackMechanism, CallbackRequester, CallbackSubscriber};
use crate::config::{ConfigError, ConnectorConfig};
use crate::discovery::{PeerInfo, StartOutcome};
use crate::message::Message;
use crate::net::Endpoint;
use crate::sync::mailbox::{self, MailboxSender};
use crate::trace::{debug, info, warn};

use clock::{ClockEstimate, wall_micros};
use reactor::{Command, ConnectorEvent, ConnectorReactor, MAILBOX_CAPACITY, MAILBOX_TOKEN, Outbox};

const SHUTDOWN_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to spawn connector thread: {0}")]
    Spawn(io::Error),
    #[error("connector is not running")]
    NotRunning,
    #[error("connector mailbox is full")]
    MailboxFull,
}

/// Phase of the background session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    Idle = 0,
    Discovering = 1,
    Connecting = 2,
    Connected = 3,
    Delaying = 4,
}

impl ConnectorState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Discovering,
            2 => Self::Connecting,
            3 => Self::Connected,
            4 => Self::Delaying,
            _ => Self::Idle,
        }
    }
}

/// Receives connector events on the owner thread.
pub trait ConnectorHandler {
    /// `peer` is the server the session was (or is) connected to.
    fn connection_state_changed(&self, connected: bool, peer: Option<&PeerInfo>);

    fn message_received(&self, message: Message);

    /// `offset_micros` is `server_clock - local_clock`; `None` once the
    /// estimate is no longer valid.
    fn clock_offset_changed(&self, _offset_micros: Option<i64>) {}
}

/// Picks the TCP endpoint to connect to from a discovered peer.
pub trait PortSelector: Send + Sync {
    fn select(&self, peer: &PeerInfo) -> Option<Endpoint>;
}

/// Uses the peer's advertised TCP port on the address its reply came from.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdvertisedPort;

impl PortSelector for AdvertisedPort {
    fn select(&self, peer: &PeerInfo) -> Option<Endpoint> {
        peer.tcp_endpoint()
    }
}

struct Session {
    config: ConnectorConfig,
    mailbox: MailboxSender<Command, MAILBOX_CAPACITY>,
    handle: JoinHandle<()>,
    state: Arc<AtomicU8>,
}

pub struct ClientConnector {
    mechanism: Rc<CallbackMechanism>,
    requester: CallbackRequester,
    outbox: Outbox,
    selector: Arc<dyn PortSelector>,
    session: RefCell<Option<Session>>,
    handler: RefCell<Option<Weak<dyn ConnectorHandler>>>,
    peer: RefCell<Option<PeerInfo>>,
    clock_offset: Cell<Option<i64>>,
}

impl ClientConnector {
    #[must_use]
    pub fn new(mechanism: &Rc<CallbackMechanism>) -> Rc<Self> {
        Self::with_port_selector(mechanism, Arc::new(AdvertisedPort))
    }

    #[must_use]
    pub fn with_port_selector(
        mechanism: &Rc<CallbackMechanism>,
        selector: Arc<dyn PortSelector>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<Self>| {
            let subscriber: Weak<dyn CallbackSubscriber> = me.clone();
            Self {
                mechanism: Rc::clone(mechanism),
                requester: mechanism.register(subscriber),
                outbox: Arc::new(Mutex::new(Default::default())),
                selector,
                session: RefCell::new(None),
                handler: RefCell::new(None),
                peer: RefCell::new(None),
                clock_offset: Cell::new(None),
            }
        })
    }

    pub fn set_handler(&self, handler: Weak<dyn ConnectorHandler>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.handler.borrow_mut().take();
    }

    /// Starts the background session. Identical parameters while running are
    /// a no-op; different ones restart it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the reactor cannot be
    /// set up.
    pub fn start(&self, config: ConnectorConfig) -> Result<StartOutcome, ConnectorError> {
        config.validate()?;
        if let Some(session) = self.session.borrow().as_ref()
            && session.config == config
        {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.stop();

        info!(
            signature = %config.signature,
            system = %config.system_name,
            "connector starting"
        );
        let session = self.spawn(config)?;
        *self.session.borrow_mut() = Some(session);
        Ok(StartOutcome::Started)
    }

    fn spawn(&self, config: ConnectorConfig) -> Result<Session, ConnectorError> {
        let poll = Poll::new()?;
        let (tx, rx) = mailbox::channel::<Command, MAILBOX_CAPACITY>(poll.registry(), MAILBOX_TOKEN)?;
        let state = Arc::new(AtomicU8::new(ConnectorState::Discovering as u8));

        let reactor = ConnectorReactor {
            poll,
            mailbox: rx,
            requester: self.requester.clone(),
            outbox: Arc::clone(&self.outbox),
            state: Arc::clone(&state),
            clock: ClockEstimate::new(config.clock_window),
            config: config.clone(),
            selector: Arc::clone(&self.selector),
        };
        let handle = thread::Builder::new()
            .name("treelink-connector".into())
            .spawn(move || {
                info!("connector thread started");
                reactor.run();
                info!("connector thread exiting");
            })
            .map_err(ConnectorError::Spawn)?;

        Ok(Session {
            config,
            mailbox: tx,
            handle,
            state,
        })
    }

    /// Stops the background session. A live connection is reported as lost
    /// at the next dispatch. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(session) = self.session.borrow_mut().take() else {
            return;
        };
        debug!("connector stopping");
        if let Err(shutdown) = session
            .mailbox
            .push_timeout(Command::Shutdown, SHUTDOWN_PUSH_TIMEOUT)
        {
            warn!(timeout = ?SHUTDOWN_PUSH_TIMEOUT, "connector mailbox full; still waiting to deliver shutdown");
            if session.mailbox.push_while_received(shutdown).is_err() {
                debug!("connector thread already gone");
            }
        }
        let _ = session.handle.join();
    }

    /// Skips the reconnect delay, or drops a live connection and starts over.
    /// Returns `false` if not running.
    pub fn reconnect(&self) -> bool {
        self.session
            .borrow()
            .as_ref()
            .is_some_and(|s| s.mailbox.push(Command::Reconnect).is_ok())
    }

    /// Queues `message` for the server. Messages sent before the connection
    /// is up are written once it is; messages sent while discovering or
    /// delaying are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NotRunning`] or
    /// [`ConnectorError::MailboxFull`].
    pub fn send_message(&self, message: Message) -> Result<(), ConnectorError> {
        let session = self.session.borrow();
        let session = session.as_ref().ok_or(ConnectorError::NotRunning)?;
        session
            .mailbox
            .push(Command::Send(message))
            .map_err(|_| ConnectorError::MailboxFull)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.borrow().is_some()
    }

    /// Connection state as last delivered to the handler.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.peer.borrow().is_some()
    }

    #[must_use]
    pub fn connected_peer(&self) -> Option<PeerInfo> {
        self.peer.borrow().clone()
    }

    /// Live phase of the background thread.
    #[must_use]
    pub fn state(&self) -> ConnectorState {
        self.session
            .borrow()
            .as_ref()
            .map_or(ConnectorState::Idle, |s| {
                ConnectorState::from_u8(s.state.load(Ordering::Acquire))
            })
    }

    /// `server_clock - local_clock` in microseconds.
    #[must_use]
    pub fn server_clock_offset(&self) -> Option<i64> {
        self.clock_offset.get()
    }

    /// Server time corresponding to `local_micros`.
    #[must_use]
    pub fn local_to_server_time(&self, local_micros: i64) -> Option<i64> {
        self.clock_offset.get().map(|o| local_micros + o)
    }

    #[must_use]
    pub fn server_to_local_time(&self, server_micros: i64) -> Option<i64> {
        self.clock_offset.get().map(|o| server_micros - o)
    }

    /// Current server time, if the clock has been estimated.
    #[must_use]
    pub fn server_now(&self) -> Option<i64> {
        self.local_to_server_time(wall_micros())
    }

    fn handler(&self) -> Option<Rc<dyn ConnectorHandler>> {
        self.handler.borrow().as_ref().and_then(Weak::upgrade)
    }
}

impl CallbackSubscriber for ClientConnector {
    fn dispatch_callbacks(&self, _event_bits: u32) {
        // One event at a time: a handler may stop or restart the connector.
        loop {
            let Some(event) = self.outbox.lock().pop_front() else {
                break;
            };
            let handler = self.handler();
            match event {
                ConnectorEvent::Connected(peer) => {
                    *self.peer.borrow_mut() = Some(peer.clone());
                    if let Some(h) = handler {
                        h.connection_state_changed(true, Some(&peer));
                    }
                }
                ConnectorEvent::Disconnected => {
                    let peer = self.peer.borrow_mut().take();
                    if let Some(h) = handler {
                        h.connection_state_changed(false, peer.as_ref());
                    }
                }
                ConnectorEvent::Message(msg) => {
                    if let Some(h) = handler {
                        h.message_received(msg);
                    }
                }
                ConnectorEvent::ClockOffset(offset) => {
                    if self.clock_offset.replace(offset) != offset
                        && let Some(h) = handler
                    {
                        h.clock_offset_changed(offset);
                    }
                }
            }
        }
    }
}

impl Drop for ClientConnector {
    fn drop(&mut self) {
        self.stop();
        self.mechanism.unregister(self.requester.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryConfig;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Recorder {
        states: RefCell<Vec<bool>>,
    }

    impl ConnectorHandler for Recorder {
        fn connection_state_changed(&self, connected: bool, _peer: Option<&PeerInfo>) {
            self.states.borrow_mut().push(connected);
        }

        fn message_received(&self, _message: Message) {}
    }

    fn quiet_config() -> ConnectorConfig {
        ConnectorConfig {
            discovery: DiscoveryConfig {
                multicast: false,
                interfaces: Some(vec![Ipv4Addr::LOCALHOST]),
                // Nothing listens here; discovery never finds a system.
                unicast_targets: vec!["127.0.0.1:9".parse().unwrap()],
                ..DiscoveryConfig::default()
            },
            ..ConnectorConfig::default()
        }
    }

    #[test]
    fn start_is_idempotent_and_stop_is_repeatable() {
        let mechanism = Rc::new(CallbackMechanism::new().unwrap());
        let connector = ClientConnector::new(&mechanism);
        assert_eq!(connector.state(), ConnectorState::Idle);
        assert!(matches!(
            connector.send_message(Message::new(1)),
            Err(ConnectorError::NotRunning)
        ));

        assert_eq!(connector.start(quiet_config()).unwrap(), StartOutcome::Started);
        assert_eq!(
            connector.start(quiet_config()).unwrap(),
            StartOutcome::AlreadyRunning
        );
        assert!(connector.is_running());
        assert!(connector.send_message(Message::new(1)).is_ok());

        connector.stop();
        connector.stop();
        assert!(!connector.is_running());
        assert_eq!(connector.state(), ConnectorState::Idle);
        assert!(!connector.reconnect());
    }

    #[test]
    fn dispatch_mirrors_events_in_order() {
        let mechanism = Rc::new(CallbackMechanism::new().unwrap());
        let connector = ClientConnector::new(&mechanism);
        let recorder = Rc::new(Recorder::default());
        let weak: Weak<dyn ConnectorHandler> = Rc::downgrade(&recorder) as Weak<dyn ConnectorHandler>;
        connector.set_handler(weak);

        let peer = PeerInfo {
            peer_id: 7,
            source: Endpoint::localhost(4000),
            interface: Ipv4Addr::LOCALHOST,
            payload: Message::new(0),
        };
        {
            let mut outbox = connector.outbox.lock();
            outbox.push_back(ConnectorEvent::Connected(peer));
            outbox.push_back(ConnectorEvent::ClockOffset(Some(250)));
            outbox.push_back(ConnectorEvent::Disconnected);
        }
        connector.dispatch_callbacks(reactor::BIT_EVENTS);

        assert_eq!(*recorder.states.borrow(), vec![true, false]);
        assert!(!connector.is_connected());
        assert_eq!(connector.server_clock_offset(), Some(250));
        assert_eq!(connector.local_to_server_time(1_000), Some(1_250));
        assert_eq!(connector.server_to_local_time(1_250), Some(1_000));
    }
}
