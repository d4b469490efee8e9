//! A subscriber's private channel through a [`TreeGatewayMux`].

use std::fmt;
use std::rc::{Rc, Weak};

use crate::filter::QueryFilter;
use crate::message::Message;

use super::mux::TreeGatewayMux;
use super::types::{GatewayError, GatewayFlags, RegistrationId, TreeGateway, TreeNode};

/// Handle returned by [`TreeGatewayMux::register`]. Every operation runs on
/// behalf of its registration; dropping it (or calling
/// [`TreeGateway::shutdown`]) detaches the subscriber.
pub struct GatewayProxy {
    mux: Weak<TreeGatewayMux>,
    id: RegistrationId,
}

impl GatewayProxy {
    pub(super) const fn new(mux: Weak<TreeGatewayMux>, id: RegistrationId) -> Self {
        Self { mux, id }
    }

    #[must_use]
    pub const fn id(&self) -> RegistrationId {
        self.id
    }

    fn mux(&self) -> Result<Rc<TreeGatewayMux>, GatewayError> {
        self.mux.upgrade().ok_or(GatewayError::ShutDown)
    }
}

impl fmt::Debug for GatewayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayProxy").field("id", &self.id).finish()
    }
}

impl TreeGateway for GatewayProxy {
    fn is_connected(&self) -> bool {
        self.mux.upgrade().is_some_and(|m| m.is_connected())
    }

    fn add_subscription(
        &self,
        path: &str,
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.mux()?.add_subscription(self.id, path, filter, flags)
    }

    fn remove_subscription(&self, path: &str) -> Result<(), GatewayError> {
        self.mux()?.remove_subscription(self.id, path)
    }

    fn request_node_values(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
    ) -> Result<(), GatewayError> {
        self.mux()?.request_node_values(self.id, paths, filter)
    }

    fn request_subtrees(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        tag: &str,
        max_depth: Option<u32>,
    ) -> Result<(), GatewayError> {
        self.mux()?
            .request_subtrees(self.id, paths, filter, tag, max_depth)
    }

    fn upload_node_value(
        &self,
        path: &str,
        payload: &Message,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.mux()?.upload_node_value(self.id, path, payload, flags)
    }

    fn upload_subtree(
        &self,
        base_path: &str,
        nodes: &[TreeNode],
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.mux()?.upload_subtree(self.id, base_path, nodes, flags)
    }

    fn delete_nodes(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.mux()?.delete_nodes(self.id, paths, filter, flags)
    }

    fn move_index_entry(
        &self,
        path: &str,
        from: u32,
        to: u32,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.mux()?.move_index_entry(self.id, path, from, to, flags)
    }

    fn ping_local_peer(&self, tag: &str) -> Result<(), GatewayError> {
        self.mux()?.ping_local_peer(self.id, tag)
    }

    fn ping_senior_peer(&self, tag: &str) -> Result<(), GatewayError> {
        self.mux()?.ping_senior_peer(self.id, tag)
    }

    fn message_to_senior_peer(&self, message: &Message, reply_tag: &str) -> Result<(), GatewayError> {
        self.mux()?.message_to_senior_peer(self.id, message, reply_tag)
    }

    fn message_to_subscriber(&self, message: &Message, subscriber_tag: &str) -> Result<(), GatewayError> {
        self.mux()?
            .message_to_subscriber(self.id, message, subscriber_tag)
    }

    fn shutdown(&self) {
        if let Some(mux) = self.mux.upgrade() {
            mux.unregister(self.id);
        }
    }
}

impl Drop for GatewayProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
