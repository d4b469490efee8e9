//! Owner-side discovery handle and its background reactor.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use mio::{Events, Poll, Token};
use parking_lot::Mutex;

use crate::callback::{CallbackMechanism, CallbackRequester, CallbackSubscriber};
use crate::config::DiscoveryConfig;
use crate::sync::mailbox::{self, MailboxReceiver, MailboxSender};
use crate::trace::{debug, error, info, warn};

use super::engine::DiscoveryEngine;
use super::table::{DiscoveryChange, SystemInfo};
use super::{DiscoveryError, DiscoveryQuery, StartOutcome};

const BIT_RESULTS: u32 = 1 << 0;
const BIT_SLEEP: u32 = 1 << 1;
const BIT_WAKE: u32 = 1 << 2;

const MAILBOX_CAPACITY: usize = 16;
const MAILBOX_TOKEN: Token = Token(0);
const ENGINE_TOKEN_BASE: Token = Token(1);

const SHUTDOWN_PUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Receives discovery results on the owner thread.
pub trait DiscoveryTarget {
    /// `info` is `None` when the system is gone.
    fn discovery_update(&self, system: &str, info: Option<&SystemInfo>);

    fn computer_is_about_to_sleep(&self) {}

    fn computer_just_woke_up(&self) {}
}

enum Command {
    NetworkChanged,
    Shutdown,
}

type Outbox = Arc<Mutex<Vec<DiscoveryChange>>>;

struct Session {
    config: DiscoveryConfig,
    query: DiscoveryQuery,
    mailbox: MailboxSender<Command, MAILBOX_CAPACITY>,
    handle: JoinHandle<()>,
}

struct TargetSlot {
    target: Weak<dyn DiscoveryTarget>,
    needs_backfill: bool,
}

/// Runs periodic discovery on a background thread and reports per-system
/// changes to registered [`DiscoveryTarget`]s on the owner thread.
///
/// Lives on the thread that calls [`CallbackMechanism::dispatch_callbacks`].
pub struct DiscoveryClient {
    mechanism: Rc<CallbackMechanism>,
    requester: CallbackRequester,
    outbox: Outbox,
    session: RefCell<Option<Session>>,
    targets: RefCell<Vec<TargetSlot>>,
    known: RefCell<BTreeMap<String, SystemInfo>>,
}

impl DiscoveryClient {
    #[must_use]
    pub fn new(mechanism: &Rc<CallbackMechanism>) -> Rc<Self> {
        Rc::new_cyclic(|me: &Weak<Self>| {
            let subscriber: Weak<dyn CallbackSubscriber> = me.clone();
            Self {
                mechanism: Rc::clone(mechanism),
                requester: mechanism.register(subscriber),
                outbox: Arc::new(Mutex::new(Vec::new())),
                session: RefCell::new(None),
                targets: RefCell::new(Vec::new()),
                known: RefCell::new(BTreeMap::new()),
            }
        })
    }

    /// Starts probing. Identical parameters while running are a no-op;
    /// different ones restart the background session.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the reactor cannot be set
    /// up, or the thread cannot be spawned.
    pub fn start(
        &self,
        config: DiscoveryConfig,
        query: DiscoveryQuery,
    ) -> Result<StartOutcome, DiscoveryError> {
        config.validate()?;
        if let Some(session) = self.session.borrow().as_ref()
            && session.config == config
            && session.query == query
        {
            return Ok(StartOutcome::AlreadyRunning);
        }
        self.stop();
        if config.ping_interval.is_zero() {
            return Ok(StartOutcome::Inactive);
        }

        info!(
            signature = %query.signature,
            ping_interval_ms = config.ping_interval.as_millis() as u64,
            "discovery starting"
        );
        let session = spawn(
            config,
            query,
            self.requester.clone(),
            Arc::clone(&self.outbox),
        )?;
        *self.session.borrow_mut() = Some(session);
        Ok(StartOutcome::Started)
    }

    /// Stops the background session and queues a removal for every known
    /// system. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(session) = self.session.borrow_mut().take() else {
            return;
        };
        debug!("discovery stopping");
        if let Err(shutdown) = session
            .mailbox
            .push_timeout(Command::Shutdown, SHUTDOWN_PUSH_TIMEOUT)
        {
            warn!(timeout = ?SHUTDOWN_PUSH_TIMEOUT, "discovery mailbox full; still waiting to deliver shutdown");
            if session.mailbox.push_while_received(shutdown).is_err() {
                debug!("discovery thread already gone");
            }
        }
        let _ = session.handle.join();

        let mut outbox = self.outbox.lock();
        let mut names: BTreeSet<String> = self.known.borrow().keys().cloned().collect();
        for change in outbox.iter() {
            if change.info.is_some() {
                names.insert(change.system.clone());
            } else {
                names.remove(&change.system);
            }
        }
        outbox.extend(names.into_iter().map(|system| DiscoveryChange { system, info: None }));
        drop(outbox);
        self.requester.request_callback(BIT_RESULTS, 0);
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session.borrow().is_some()
    }

    /// Asks the reactor to recreate its per-interface sockets.
    pub fn notify_network_changed(&self) {
        if let Some(session) = self.session.borrow().as_ref()
            && session.mailbox.push(Command::NetworkChanged).is_err()
        {
            debug!("discovery mailbox full; network change dropped");
        }
    }

    /// A `Send` handle for the host's OS power notifications.
    #[must_use]
    pub fn sleep_wake_notifier(&self) -> SleepWakeNotifier {
        SleepWakeNotifier {
            requester: self.requester.clone(),
        }
    }

    /// Registers a target. It is first told about every system already
    /// known, at the next dispatch.
    pub fn add_target(&self, target: Weak<dyn DiscoveryTarget>) {
        self.targets.borrow_mut().push(TargetSlot {
            target,
            needs_backfill: true,
        });
        self.requester.request_callback(BIT_RESULTS, 0);
    }

    pub fn remove_target(&self, target: &Weak<dyn DiscoveryTarget>) -> bool {
        let mut targets = self.targets.borrow_mut();
        let before = targets.len();
        targets.retain(|slot| !Weak::ptr_eq(&slot.target, target));
        targets.len() != before
    }

    /// Systems as delivered to targets so far.
    #[must_use]
    pub fn known_systems(&self) -> BTreeMap<String, SystemInfo> {
        self.known.borrow().clone()
    }

    #[must_use]
    pub fn system(&self, name: &str) -> Option<SystemInfo> {
        self.known.borrow().get(name).cloned()
    }

    fn live_targets(&self) -> Vec<Rc<dyn DiscoveryTarget>> {
        let mut targets = self.targets.borrow_mut();
        targets.retain(|slot| slot.target.strong_count() > 0);
        targets.iter().filter_map(|slot| slot.target.upgrade()).collect()
    }

    fn deliver_results(&self) {
        let batch = std::mem::take(&mut *self.outbox.lock());
        {
            let mut known = self.known.borrow_mut();
            for change in &batch {
                match &change.info {
                    Some(info) => {
                        known.insert(change.system.clone(), info.clone());
                    }
                    None => {
                        known.remove(&change.system);
                    }
                }
            }
        }

        let fresh: Vec<Rc<dyn DiscoveryTarget>> = self
            .targets
            .borrow_mut()
            .iter_mut()
            .filter(|slot| slot.needs_backfill)
            .filter_map(|slot| {
                slot.needs_backfill = false;
                slot.target.upgrade()
            })
            .collect();
        if !fresh.is_empty() {
            let backfill: Vec<(String, SystemInfo)> = self
                .known
                .borrow()
                .iter()
                .filter(|(name, _)| !batch.iter().any(|c| &c.system == *name))
                .map(|(name, info)| (name.clone(), info.clone()))
                .collect();
            for target in &fresh {
                for (name, info) in &backfill {
                    target.discovery_update(name, Some(info));
                }
            }
        }

        if batch.is_empty() {
            return;
        }
        let targets = self.live_targets();
        for change in &batch {
            for target in &targets {
                target.discovery_update(&change.system, change.info.as_ref());
            }
        }
    }
}

impl CallbackSubscriber for DiscoveryClient {
    fn dispatch_callbacks(&self, event_bits: u32) {
        if event_bits & BIT_SLEEP != 0 {
            for target in self.live_targets() {
                target.computer_is_about_to_sleep();
            }
        }
        if event_bits & BIT_WAKE != 0 {
            // Addresses may have changed while suspended.
            self.notify_network_changed();
            for target in self.live_targets() {
                target.computer_just_woke_up();
            }
        }
        if event_bits & BIT_RESULTS != 0 {
            self.deliver_results();
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.stop();
        self.mechanism.unregister(self.requester.key());
    }
}

/// Forwards OS sleep/wake notifications from any thread. The two states are
/// mutually exclusive: a wake cancels an undelivered sleep and vice versa.
#[derive(Debug, Clone)]
pub struct SleepWakeNotifier {
    requester: CallbackRequester,
}

impl SleepWakeNotifier {
    pub fn about_to_sleep(&self) {
        self.requester.request_callback(BIT_SLEEP, BIT_WAKE);
    }

    pub fn just_woke_up(&self) {
        self.requester.request_callback(BIT_WAKE, BIT_SLEEP);
    }
}

fn spawn(
    config: DiscoveryConfig,
    query: DiscoveryQuery,
    requester: CallbackRequester,
    outbox: Outbox,
) -> Result<Session, DiscoveryError> {
    let poll = Poll::new()?;
    let (tx, rx) = mailbox::channel::<Command, MAILBOX_CAPACITY>(poll.registry(), MAILBOX_TOKEN)?;
    let engine = DiscoveryEngine::new(config.clone(), &query, ENGINE_TOKEN_BASE)?;

    let handle = thread::Builder::new()
        .name("treelink-discovery".into())
        .spawn(move || {
            info!("discovery thread started");
            let mut reactor = DiscoveryReactor {
                poll,
                engine,
                mailbox: rx,
                requester,
                outbox,
            };
            reactor.run();
            info!("discovery thread exiting");
        })
        .map_err(DiscoveryError::Spawn)?;

    Ok(Session {
        config,
        query,
        mailbox: tx,
        handle,
    })
}

struct DiscoveryReactor {
    poll: Poll,
    engine: DiscoveryEngine,
    mailbox: MailboxReceiver<Command, MAILBOX_CAPACITY>,
    requester: CallbackRequester,
    outbox: Outbox,
}

impl DiscoveryReactor {
    fn run(&mut self) {
        self.engine.open(self.poll.registry());
        let mut events = Events::with_capacity(64);
        loop {
            self.engine.on_timers(Instant::now(), self.poll.registry());
            self.publish();

            let timeout = self
                .engine
                .next_deadline()
                .saturating_duration_since(Instant::now());
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "discovery poll failed");
                break;
            }

            for event in &events {
                let token = event.token();
                if token == MAILBOX_TOKEN {
                    if self.process_commands() {
                        self.engine.close(self.poll.registry());
                        return;
                    }
                } else if self.engine.owns(token) {
                    self.engine.on_readable(token, Instant::now());
                }
            }
            self.publish();
        }
        self.engine.close(self.poll.registry());
    }

    /// Returns `true` on shutdown.
    fn process_commands(&mut self) -> bool {
        while let Some(cmd) = self.mailbox.pop() {
            match cmd {
                Command::NetworkChanged => self.engine.rebuild(self.poll.registry()),
                Command::Shutdown => return true,
            }
        }
        false
    }

    fn publish(&mut self) {
        let changes = self.engine.take_changes();
        if changes.is_empty() {
            return;
        }
        debug!(count = changes.len(), "discovery changes");
        self.outbox.lock().extend(changes);
        self.requester.request_callback(BIT_RESULTS, 0);
    }
}
