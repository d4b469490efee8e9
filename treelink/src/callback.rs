//! Background → consumer thread event delivery.
//!
//! A background reactor never calls into consumer-thread objects directly.
//! It holds a [`CallbackRequester`] and ORs event bits into a mutex-guarded
//! pending map; the first request that makes the map non-empty signals the
//! [`Wakeup`]. The consumer thread waits on that wakeup (or polls its read
//! fd from its own event loop) and calls
//! [`CallbackMechanism::dispatch_callbacks`], which swaps the map out and
//! calls each still-registered subscriber once with the accumulated bits.
//!
//! ```text
//! background thread                         consumer thread
//! ─────────────────                         ───────────────
//! requester.request_callback(BIT, 0) ─┐
//! requester.request_callback(BIT2, 0) ┤ (one wake)
//!                                     └──▶  mechanism.wait(None)
//!                                           mechanism.dispatch_callbacks()
//!                                             └─ subscriber.dispatch_callbacks(BIT | BIT2)
//! ```
//!
//! Event payloads never travel through this primitive. Subscribers keep their
//! own queue (usually behind a `parking_lot::Mutex`) and use the bits only to
//! learn that the queue needs draining.

mod wake;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::Weak;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::trace::trace;

pub use wake::{CondvarWakeup, SocketPairWakeup, Wakeup};

/// Identifies one registration with a [`CallbackMechanism`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackKey(u64);

impl std::fmt::Display for CallbackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Consumer-thread object that receives batched event bits.
pub trait CallbackSubscriber {
    /// Called once per drain with the OR of every bit requested since the
    /// previous call.
    fn dispatch_callbacks(&self, event_bits: u32);
}

struct Shared {
    pending: Mutex<HashMap<CallbackKey, u32>>,
    wakeup: Arc<dyn Wakeup>,
}

/// Consumer-thread half: owns the registration table and performs dispatch.
pub struct CallbackMechanism {
    shared: Arc<Shared>,
    subscribers: RefCell<HashMap<CallbackKey, Weak<dyn CallbackSubscriber>>>,
    next_key: Cell<u64>,
    scratch: RefCell<HashMap<CallbackKey, u32>>,
}

impl CallbackMechanism {
    /// Creates a mechanism woken through a socket pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket pair cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_wakeup(Arc::new(SocketPairWakeup::new()?)))
    }

    /// Creates a mechanism with a caller-supplied wake primitive.
    #[must_use]
    pub fn with_wakeup(wakeup: Arc<dyn Wakeup>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                wakeup,
            }),
            subscribers: RefCell::new(HashMap::new()),
            next_key: Cell::new(1),
            scratch: RefCell::new(HashMap::new()),
        }
    }

    /// Registers a subscriber and returns the requester background threads
    /// use to signal it.
    ///
    /// The mechanism keeps only a weak reference; a subscriber that is
    /// dropped without unregistering is skipped on the next dispatch.
    pub fn register(&self, subscriber: Weak<dyn CallbackSubscriber>) -> CallbackRequester {
        let key = CallbackKey(self.next_key.get());
        self.next_key.set(key.0 + 1);
        self.subscribers.borrow_mut().insert(key, subscriber);
        trace!(%key, "callback subscriber registered");
        CallbackRequester {
            key,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Unregisters `key`. Bits already requested for it are discarded at the
    /// next dispatch.
    pub fn unregister(&self, key: CallbackKey) -> bool {
        let removed = self.subscribers.borrow_mut().remove(&key).is_some();
        if removed {
            self.shared.pending.lock().remove(&key);
        }
        removed
    }

    #[must_use]
    pub fn is_registered(&self, key: CallbackKey) -> bool {
        self.subscribers.borrow().contains_key(&key)
    }

    /// Number of subscribers with undelivered bits.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    #[must_use]
    pub fn wakeup(&self) -> &Arc<dyn Wakeup> {
        &self.shared.wakeup
    }

    /// Blocks until a callback is requested or `timeout` expires.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.shared.wakeup.wait(timeout)
    }

    /// Delivers every pending batch. Returns the number of subscribers called.
    ///
    /// Must be called on the thread that owns the subscribers. Subscribers may
    /// register, unregister, or request further callbacks from inside their
    /// dispatch; requests made during dispatch are delivered on the next call.
    pub fn dispatch_callbacks(&self) -> usize {
        // Clear before swapping: a request racing with the swap sees an empty
        // map and signals again.
        self.shared.wakeup.clear();

        let mut batch = self.scratch.take();
        std::mem::swap(&mut *self.shared.pending.lock(), &mut batch);

        let mut delivered = 0;
        for (key, bits) in batch.drain() {
            let subscriber = self.subscribers.borrow().get(&key).and_then(Weak::upgrade);
            match subscriber {
                Some(subscriber) => {
                    subscriber.dispatch_callbacks(bits);
                    delivered += 1;
                }
                None => {
                    trace!(%key, bits, "dropping callback for unregistered subscriber");
                }
            }
        }
        self.scratch.replace(batch);
        delivered
    }
}

/// Thread-safe handle that requests callbacks for one subscriber.
///
/// Requests made after the mechanism is dropped are ignored.
#[derive(Clone)]
pub struct CallbackRequester {
    key: CallbackKey,
    shared: std::sync::Weak<Shared>,
}

impl CallbackRequester {
    #[must_use]
    pub const fn key(&self) -> CallbackKey {
        self.key
    }

    /// Clears `clear_bits` then sets `set_bits` in the pending entry. Signals
    /// the wakeup only if no subscriber had pending bits before this call.
    ///
    /// Returns `false` if the mechanism no longer exists.
    pub fn request_callback(&self, set_bits: u32, clear_bits: u32) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let was_empty = {
            let mut pending = shared.pending.lock();
            let was_empty = pending.is_empty();
            let bits = pending.entry(self.key).or_insert(0);
            *bits = (*bits & !clear_bits) | set_bits;
            was_empty
        };
        if was_empty {
            shared.wakeup.signal();
        }
        true
    }

    /// True while the mechanism is alive.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.shared.strong_count() > 0
    }
}

impl std::fmt::Debug for CallbackRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRequester")
            .field("key", &self.key)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingWakeup {
        signals: AtomicUsize,
        inner: CondvarWakeup,
    }

    impl Wakeup for CountingWakeup {
        fn signal(&self) {
            self.signals.fetch_add(1, Ordering::SeqCst);
            self.inner.signal();
        }
        fn clear(&self) {
            self.inner.clear();
        }
        fn wait(&self, timeout: Option<Duration>) -> bool {
            self.inner.wait(timeout)
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<u32>>,
    }

    impl CallbackSubscriber for Recorder {
        fn dispatch_callbacks(&self, event_bits: u32) {
            self.calls.borrow_mut().push(event_bits);
        }
    }

    fn register(mech: &CallbackMechanism, rec: &Rc<Recorder>) -> CallbackRequester {
        let weak: Weak<dyn CallbackSubscriber> = Rc::<Recorder>::downgrade(rec);
        mech.register(weak)
    }

    #[test]
    fn requests_coalesce_into_one_wake_and_one_dispatch() {
        let wake = Arc::new(CountingWakeup::default());
        let mech = CallbackMechanism::with_wakeup(wake.clone());
        let rec = Rc::new(Recorder::default());
        let req = register(&mech, &rec);

        req.request_callback(0b001, 0);
        req.request_callback(0b010, 0);
        req.request_callback(0b100, 0b001);

        assert_eq!(wake.signals.load(Ordering::SeqCst), 1);
        assert_eq!(mech.dispatch_callbacks(), 1);
        assert_eq!(*rec.calls.borrow(), vec![0b110]);

        assert_eq!(mech.dispatch_callbacks(), 0);
        req.request_callback(0b1, 0);
        assert_eq!(wake.signals.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregistered_subscriber_is_skipped() {
        let mech = CallbackMechanism::with_wakeup(Arc::new(CondvarWakeup::default()));
        let kept = Rc::new(Recorder::default());
        let gone = Rc::new(Recorder::default());
        let kept_req = register(&mech, &kept);
        let gone_req = register(&mech, &gone);

        kept_req.request_callback(1, 0);
        gone_req.request_callback(2, 0);
        assert!(mech.unregister(gone_req.key()));
        // Requests after unregistering must not resurrect the entry.
        gone_req.request_callback(4, 0);

        assert_eq!(mech.dispatch_callbacks(), 1);
        assert_eq!(*kept.calls.borrow(), vec![1]);
        assert!(gone.calls.borrow().is_empty());
    }

    #[test]
    fn dropped_subscriber_is_never_called() {
        let mech = CallbackMechanism::with_wakeup(Arc::new(CondvarWakeup::default()));
        let rec = Rc::new(Recorder::default());
        let req = register(&mech, &rec);
        drop(rec);
        req.request_callback(1, 0);
        assert_eq!(mech.dispatch_callbacks(), 0);
    }

    #[test]
    fn requester_outliving_mechanism_is_inert() {
        let mech = CallbackMechanism::with_wakeup(Arc::new(CondvarWakeup::default()));
        let rec = Rc::new(Recorder::default());
        let req = register(&mech, &rec);
        assert!(req.is_attached());
        drop(mech);
        assert!(!req.is_attached());
        assert!(!req.request_callback(1, 0));
    }

    #[test]
    fn bits_from_many_threads_are_or_combined() {
        let mech = CallbackMechanism::new().unwrap();
        let rec = Rc::new(Recorder::default());
        let req = register(&mech, &rec);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let req = req.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        req.request_callback(1 << i, 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(mech.wait(Some(Duration::from_secs(1))));
        assert_eq!(mech.dispatch_callbacks(), 1);
        assert_eq!(*rec.calls.borrow(), vec![0xff]);
    }
}
