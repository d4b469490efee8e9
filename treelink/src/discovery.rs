//! LAN peer discovery.
//!
//! # Architecture
//!
//! ```text
//! owner thread                              discovery thread ("treelink-discovery")
//! ────────────                              ───────────────────────────────────────
//! DiscoveryClient ── mailbox (Command) ───▶ mio::Poll
//!   ▲                                         ├─ DiscoveryEngine: 1 UDP socket / interface
//!   │                                         │    probe every ping_interval, sweep expired
//!   │                                         │    upsert replies, cook + diff when dirty
//!   └── CallbackMechanism ◀── changes ────────┘
//!        dispatch → DiscoveryTarget::discovery_update(system, info)
//! ```
//!
//! A raw result expires `3 × ping_interval` after its last reply. Reports are
//! per system: `Some(info)` when a system appears or any of its peers'
//! payloads change, `None` when its last peer expires.

mod client;
pub mod engine;
pub mod protocol;
pub mod table;

use thiserror::Error;

use crate::filter::QueryFilter;

pub use client::{DiscoveryClient, DiscoveryTarget, SleepWakeNotifier};
pub use engine::DiscoveryEngine;
pub use table::{DiscoveryChange, PeerInfo, SystemInfo};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to spawn discovery thread: {0}")]
    Spawn(std::io::Error),
    #[error("invalid discovery config: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// What a client is looking for.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryQuery {
    /// Wildcard pattern matched against each server's signature.
    pub signature: String,
    /// Extra filter every reply must pass.
    pub filter: Option<QueryFilter>,
}

impl DiscoveryQuery {
    #[must_use]
    pub fn new(signature: &str) -> Self {
        Self {
            signature: signature.to_owned(),
            filter: None,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Signature pattern AND the extra filter.
    #[must_use]
    pub fn reply_filter(&self) -> QueryFilter {
        protocol::reply_filter(&self.signature, self.filter.as_ref())
    }
}

/// Result of a `start` call on a background component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new background session was spawned.
    Started,
    /// Already running with identical parameters; nothing changed.
    AlreadyRunning,
    /// The ping interval is zero, so nothing runs. Any previous session was
    /// stopped.
    Inactive,
}
