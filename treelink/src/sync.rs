//! Owner → reactor communication.
//!
//! The only path from an owner thread into a background reactor is a bounded
//! [`mailbox`]: a lock-free single-producer queue whose push also wakes the
//! reactor's `Poll`. The opposite direction goes through
//! [`crate::callback::CallbackMechanism`].

pub mod mailbox;
