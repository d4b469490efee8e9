//! Bounded SPSC mailbox that wakes a mio reactor on push.
//!
//! - [`MailboxSender`] lives on the owner thread (single producer).
//! - [`MailboxReceiver`] lives inside the reactor (single consumer).
//!
//! The ring is wait-free: head and tail are atomics published with
//! Release/Acquire, each side caches the other's index and only re-reads it
//! when the cached value says full/empty. A push that lands is followed by a
//! [`mio::Waker::wake`], so the reactor's `poll` returns with the mailbox
//! token and drains.
//!
//! ```ignore
//! let poll = mio::Poll::new()?;
//! let (tx, rx) = mailbox::channel::<Command, 64>(poll.registry(), MAILBOX_TOKEN)?;
//! tx.push(Command::Shutdown).ok();
//! // reactor thread:
//! while let Some(cmd) = rx.pop() { /* ... */ }
//! ```

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;
use mio::{Registry, Token, Waker};

/// Heap ring shared by the two ends.
struct Ring<T, const N: usize> {
    /// Next slot to write; written by the sender only.
    head: AtomicUsize,
    /// Next slot to read; written by the receiver only.
    tail: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    waker: Waker,
}

// SAFETY: a slot is touched by the sender only while `head - tail < N` says
// the receiver cannot be reading it, and by the receiver only after the
// Release store of `head` made the write visible. The atomics order all
// hand-offs.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    fn new(waker: Waker) -> Self {
        let slots = (0..N)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots,
            waker,
        }
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        // Both ends are gone; drop whatever was never received.
        let head = *self.head.get_mut();
        let mut tail = *self.tail.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) were written and never read.
            unsafe { self.slots[tail % N].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Owner-side end. `Send` but not `Sync`: exactly one pushing thread.
pub struct MailboxSender<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    cached_tail: Cell<usize>,
    _unsync: PhantomUnsync,
}

/// Reactor-side end. `Send` but not `Sync`: exactly one popping thread.
pub struct MailboxReceiver<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    cached_head: Cell<usize>,
    _unsync: PhantomUnsync,
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "mailbox capacity must be greater than 0");
}

/// Creates a mailbox whose pushes wake `registry`'s poll with `token`.
///
/// # Errors
///
/// Returns an error if the waker cannot be registered.
pub fn channel<T: Send, const N: usize>(
    registry: &Registry,
    token: Token,
) -> io::Result<(MailboxSender<T, N>, MailboxReceiver<T, N>)> {
    let () = CapacityCheck::<N>::OK;
    let ring = Arc::new(Ring::new(Waker::new(registry, token)?));
    Ok((
        MailboxSender {
            ring: Arc::clone(&ring),
            cached_tail: Cell::new(0),
            _unsync: PhantomData,
        },
        MailboxReceiver {
            ring,
            cached_head: Cell::new(0),
            _unsync: PhantomData,
        },
    ))
}

impl<T: Send, const N: usize> MailboxSender<T, N> {
    /// Pushes without blocking and wakes the reactor.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the mailbox is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.load(Ordering::Relaxed);
        if head.wrapping_sub(self.cached_tail.get()) >= N {
            self.cached_tail.set(ring.tail.load(Ordering::Acquire));
            if head.wrapping_sub(self.cached_tail.get()) >= N {
                return Err(item);
            }
        }
        // SAFETY: head - tail < N, so the receiver is not reading this slot,
        // and only this (non-Sync) sender writes slots.
        unsafe { (*ring.slots[head % N].get()).write(item) };
        ring.head.store(head.wrapping_add(1), Ordering::Release);
        // A failed wake leaves the item queued; the reactor still drains it
        // on its next timer-driven iteration.
        let _ = ring.waker.wake();
        Ok(())
    }

    /// Retries [`push`](Self::push) until it succeeds or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` on timeout.
    pub fn push_timeout(&self, mut item: T, timeout: Duration) -> Result<(), T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if Instant::now() > deadline {
                        return Err(item);
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Retries [`push`](Self::push) for as long as the receiver exists.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` once the receiver has been dropped.
    pub fn push_while_received(&self, mut item: T) -> Result<(), T> {
        loop {
            match self.push(item) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    item = returned;
                    if self.receiver_dropped() {
                        return Err(item);
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// True once the reactor side is gone, e.g. its thread exited.
    #[must_use]
    pub fn receiver_dropped(&self) -> bool {
        Arc::strong_count(&self.ring) == 1
    }

    /// Number of queued items as seen by the sender.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.ring.head.load(Ordering::Relaxed);
        head.wrapping_sub(self.ring.tail.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send, const N: usize> MailboxReceiver<T, N> {
    /// Pops the oldest item, if any.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.load(Ordering::Relaxed);
        if self.cached_head.get() == tail {
            self.cached_head.set(ring.head.load(Ordering::Acquire));
            if self.cached_head.get() == tail {
                return None;
            }
        }
        // SAFETY: tail != head, so the slot was written and published by the
        // Release store of head; only this (non-Sync) receiver reads slots.
        let item = unsafe { (*ring.slots[tail % N].get()).assume_init_read() };
        ring.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }

    /// Pops everything currently queued.
    pub fn drain(&self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop())
    }
}
