//! Types shared by every tree-gateway implementation.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connector::ConnectorError;
use crate::filter::QueryFilter;
use crate::message::{Message, WireError};

/// Small reusable identity the multiplexer assigns to each local subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistrationId(pub u32);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg#{}", self.0)
    }
}

/// Modifiers for subscriptions and write operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GatewayFlags(u32);

impl GatewayFlags {
    pub const NONE: Self = Self(0);
    /// The caller does not want the server to echo the change back.
    pub const NO_REPLY: Self = Self(1 << 0);
    /// Subscribe without receiving the current state of matching nodes.
    pub const QUIET: Self = Self(1 << 1);
    /// Address children by index rather than by name.
    pub const INDEXED: Self = Self(1 << 2);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for GatewayFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for GatewayFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream is not connected")]
    NotConnected,
    #[error("gateway has shut down")]
    ShutDown,
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("not subscribed to {0:?}")]
    NotSubscribed(String),
    #[error("unknown registration {0}")]
    UnknownRegistration(RegistrationId),
    #[error("connector: {0}")]
    Connector(#[from] ConnectorError),
    #[error("wire: {0}")]
    Wire(#[from] WireError),
}

/// Rejects paths the tree cannot address.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidPath`] for an empty path or one with an
/// empty segment.
pub fn check_path(path: &str) -> Result<(), GatewayError> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    if trimmed.is_empty() || trimmed.split('/').any(str::is_empty) {
        return Err(GatewayError::InvalidPath(path.to_owned()));
    }
    Ok(())
}

/// A node addressed by path, as carried in subtree uploads and results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: String,
    pub payload: Message,
}

/// Something the upstream gateway reports.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ConnectionStateChanged(bool),
    /// `payload == None` means the node was removed.
    NodeUpdated { path: String, payload: Option<Message> },
    IndexCleared { path: String },
    IndexEntryInserted { path: String, index: u32, child: String },
    IndexEntryRemoved { path: String, index: u32 },
    SubtreeResult { tag: String, nodes: Vec<TreeNode> },
    Pong { tag: String },
    MessageForSubscriber { tag: String, message: Message },
    ShuttingDown,
}

/// The operations a tree gateway accepts.
///
/// Replies arrive separately, as [`GatewayEvent`]s fed to whoever listens to
/// this gateway.
pub trait TreeGateway {
    fn is_connected(&self) -> bool;

    fn add_subscription(
        &self,
        path: &str,
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError>;

    fn remove_subscription(&self, path: &str) -> Result<(), GatewayError>;

    /// Current values of matching nodes arrive as node updates.
    fn request_node_values(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
    ) -> Result<(), GatewayError>;

    /// Matching subtrees arrive as one [`GatewayEvent::SubtreeResult`] with
    /// the same `tag`.
    fn request_subtrees(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        tag: &str,
        max_depth: Option<u32>,
    ) -> Result<(), GatewayError>;

    fn upload_node_value(
        &self,
        path: &str,
        payload: &Message,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError>;

    /// Uploads `nodes`, whose paths are relative to `base_path`.
    fn upload_subtree(
        &self,
        base_path: &str,
        nodes: &[TreeNode],
        flags: GatewayFlags,
    ) -> Result<(), GatewayError>;

    fn delete_nodes(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError>;

    fn move_index_entry(
        &self,
        path: &str,
        from: u32,
        to: u32,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError>;

    fn ping_local_peer(&self, tag: &str) -> Result<(), GatewayError>;

    fn ping_senior_peer(&self, tag: &str) -> Result<(), GatewayError>;

    /// Replies from the senior peer come back as
    /// [`GatewayEvent::MessageForSubscriber`] tagged with `reply_tag`.
    fn message_to_senior_peer(&self, message: &Message, reply_tag: &str) -> Result<(), GatewayError>;

    /// Sends to the subscriber that issued `subscriber_tag`.
    fn message_to_subscriber(&self, message: &Message, subscriber_tag: &str) -> Result<(), GatewayError>;

    fn shutdown(&self);
}

/// Receives the traffic of one private gateway channel.
///
/// Every method has an empty default so subscribers implement only what they
/// care about. Calls back into the gateway from inside these methods are
/// allowed.
#[allow(unused_variables)]
pub trait TreeGatewaySubscriber {
    fn tree_gateway_connection_changed(&self, connected: bool) {}

    fn tree_node_updated(&self, path: &str, payload: Option<&Message>) {}

    fn tree_index_cleared(&self, path: &str) {}

    fn tree_index_entry_inserted(&self, path: &str, index: u32, child: &str) {}

    fn tree_index_entry_removed(&self, path: &str, index: u32) {}

    fn subtree_request_result(&self, tag: &str, nodes: &[TreeNode]) {}

    fn tree_pong(&self, tag: &str) {}

    fn message_from_peer(&self, tag: &str, message: &Message) {}

    fn begin_callback_batch(&self) {}

    fn end_callback_batch(&self) {}

    fn tree_gateway_shutting_down(&self) {}
}
