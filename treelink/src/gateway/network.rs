//! The network-facing tree gateway: commands go out through a
//! [`ClientConnector`], replies come back through a [`ConnectorBridge`].
//!
//! ```text
//!   TreeGatewayMux ──TreeGateway──▶ NetworkGateway ──send_message──▶ ClientConnector
//!         ▲                                                                │
//!         └──handle_upstream_events── ConnectorBridge ◀──ConnectorHandler──┘
//! ```

use std::rc::{Rc, Weak};

use crate::connector::{ClientConnector, ConnectorHandler};
use crate::discovery::PeerInfo;
use crate::filter::QueryFilter;
use crate::message::{Message, WireError};
use crate::trace::{debug, warn};

use super::mux::TreeGatewayMux;
use super::types::{GatewayError, GatewayEvent, GatewayFlags, TreeGateway, TreeNode};
use super::wire::{TreeCommand, TreeReply};

pub struct NetworkGateway {
    connector: Rc<ClientConnector>,
}

impl NetworkGateway {
    #[must_use]
    pub const fn new(connector: Rc<ClientConnector>) -> Self {
        Self { connector }
    }

    #[must_use]
    pub const fn connector(&self) -> &Rc<ClientConnector> {
        &self.connector
    }

    fn send(&self, command: TreeCommand) -> Result<(), GatewayError> {
        if !self.connector.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        let msg = command.to_message()?;
        self.connector.send_message(msg)?;
        Ok(())
    }
}

impl TreeGateway for NetworkGateway {
    fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    fn add_subscription(
        &self,
        path: &str,
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::Subscribe {
            path: path.to_owned(),
            filter: filter.cloned(),
            flags,
        })
    }

    fn remove_subscription(&self, path: &str) -> Result<(), GatewayError> {
        self.send(TreeCommand::Unsubscribe {
            path: path.to_owned(),
        })
    }

    fn request_node_values(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::RequestNodeValues {
            paths: paths.to_vec(),
            filter: filter.cloned(),
        })
    }

    fn request_subtrees(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        tag: &str,
        max_depth: Option<u32>,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::RequestSubtrees {
            paths: paths.to_vec(),
            filter: filter.cloned(),
            tag: tag.to_owned(),
            max_depth,
        })
    }

    fn upload_node_value(
        &self,
        path: &str,
        payload: &Message,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::UploadNodeValue {
            path: path.to_owned(),
            payload: payload.clone(),
            flags,
        })
    }

    fn upload_subtree(
        &self,
        base_path: &str,
        nodes: &[TreeNode],
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::UploadSubtree {
            base_path: base_path.to_owned(),
            nodes: nodes.to_vec(),
            flags,
        })
    }

    fn delete_nodes(
        &self,
        paths: &[String],
        filter: Option<&QueryFilter>,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::DeleteNodes {
            paths: paths.to_vec(),
            filter: filter.cloned(),
            flags,
        })
    }

    fn move_index_entry(
        &self,
        path: &str,
        from: u32,
        to: u32,
        flags: GatewayFlags,
    ) -> Result<(), GatewayError> {
        self.send(TreeCommand::MoveIndexEntry {
            path: path.to_owned(),
            from,
            to,
            flags,
        })
    }

    fn ping_local_peer(&self, tag: &str) -> Result<(), GatewayError> {
        self.send(TreeCommand::PingLocalPeer { tag: tag.to_owned() })
    }

    fn ping_senior_peer(&self, tag: &str) -> Result<(), GatewayError> {
        self.send(TreeCommand::PingSeniorPeer { tag: tag.to_owned() })
    }

    fn message_to_senior_peer(&self, message: &Message, reply_tag: &str) -> Result<(), GatewayError> {
        self.send(TreeCommand::MessageToSeniorPeer {
            message: message.clone(),
            reply_tag: reply_tag.to_owned(),
        })
    }

    fn message_to_subscriber(&self, message: &Message, subscriber_tag: &str) -> Result<(), GatewayError> {
        self.send(TreeCommand::MessageToSubscriber {
            message: message.clone(),
            subscriber_tag: subscriber_tag.to_owned(),
        })
    }

    fn shutdown(&self) {
        self.connector.stop();
    }
}

/// Feeds connector events into a mux. Messages that are not tree replies go
/// to an optional fallback handler.
pub struct ConnectorBridge {
    mux: Weak<TreeGatewayMux>,
    fallback: Option<Weak<dyn ConnectorHandler>>,
}

impl ConnectorBridge {
    #[must_use]
    pub fn new(mux: &Rc<TreeGatewayMux>) -> Self {
        Self {
            mux: Rc::downgrade(mux),
            fallback: None,
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, handler: Weak<dyn ConnectorHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Builds the full stack over `connector`: a [`NetworkGateway`], a mux on
    /// top of it, and a bridge installed as the connector's handler. The
    /// caller must keep the returned bridge alive.
    #[must_use]
    pub fn install(connector: &Rc<ClientConnector>) -> (Rc<TreeGatewayMux>, Rc<Self>) {
        let upstream: Rc<dyn TreeGateway> = Rc::new(NetworkGateway::new(Rc::clone(connector)));
        let mux = TreeGatewayMux::new(upstream);
        let bridge = Rc::new(Self::new(&mux));
        let handler: Weak<dyn ConnectorHandler> = Rc::downgrade(&bridge) as Weak<dyn ConnectorHandler>;
        connector.set_handler(handler);
        (mux, bridge)
    }

    fn fallback(&self) -> Option<Rc<dyn ConnectorHandler>> {
        self.fallback.as_ref().and_then(Weak::upgrade)
    }
}

impl ConnectorHandler for ConnectorBridge {
    fn connection_state_changed(&self, connected: bool, peer: Option<&PeerInfo>) {
        if let Some(mux) = self.mux.upgrade() {
            mux.handle_upstream_event(GatewayEvent::ConnectionStateChanged(connected));
        }
        if let Some(fallback) = self.fallback() {
            fallback.connection_state_changed(connected, peer);
        }
    }

    fn message_received(&self, message: Message) {
        match TreeReply::batch_from_message(&message) {
            Ok(replies) => {
                if let Some(mux) = self.mux.upgrade() {
                    mux.handle_upstream_events(replies.into_iter().map(GatewayEvent::from));
                }
            }
            Err(WireError::NotTreeMessage(_what)) => match self.fallback() {
                Some(fallback) => fallback.message_received(message),
                None => {
                    debug!(what = _what, "non-tree message dropped");
                }
            },
            Err(_e) => {
                warn!(error = %_e, "malformed tree reply dropped");
            }
        }
    }

    fn clock_offset_changed(&self, offset_micros: Option<i64>) {
        if let Some(fallback) = self.fallback() {
            fallback.clock_offset_changed(offset_micros);
        }
    }
}
