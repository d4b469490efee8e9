//! Subscription-multiplexing tree gateway.
//!
//! A [`TreeGateway`] is a channel to a remote, path-addressed data tree:
//! subscribe to paths, request values and subtrees, upload and delete
//! nodes, ping peers. [`TreeGatewayMux`] shares one such channel between
//! many local [`TreeGatewaySubscriber`]s, each of which talks to it through
//! its own [`GatewayProxy`] as if it had the upstream to itself.
//!
//! [`NetworkGateway`] is the usual upstream, running over a
//! [`ClientConnector`](crate::connector::ClientConnector);
//! [`ConnectorBridge`] feeds the connector's events back into the mux.

pub mod aggregate;
mod mux;
pub mod network;
mod proxy;
pub mod tag;
mod types;
pub mod wire;

pub use aggregate::{AggregateEntry, SubscriptionAggregate};
pub use mux::TreeGatewayMux;
pub use network::{ConnectorBridge, NetworkGateway};
pub use proxy::GatewayProxy;
pub use tag::{AllowPing, TaggedRequest};
pub use types::{
    GatewayError, GatewayEvent, GatewayFlags, RegistrationId, TreeGateway, TreeGatewaySubscriber,
    TreeNode, check_path,
};
