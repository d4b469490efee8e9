//! Client-side connectivity runtime for a LAN tree-database framework.
//!
//! - [`discovery`]: periodic multicast/unicast probing for peer systems.
//! - [`connector`]: one resilient TCP session to a discovered server, with
//!   keep-alives, automatic reconnection and server-clock estimation.
//! - [`gateway`]: many local subscribers sharing one upstream tree channel.
//!
//! Background work runs on reactor threads; results reach the owner thread
//! through a [`CallbackMechanism`] that the host drives with
//! [`CallbackMechanism::wait`] and [`CallbackMechanism::dispatch_callbacks`].

pub mod callback;
pub mod config;
pub mod connector;
pub mod discovery;
pub mod filter;
pub mod gateway;
pub mod message;
pub mod net;
pub mod path;
pub mod sync;
mod trace;

pub use callback::{CallbackMechanism, CallbackRequester, CallbackSubscriber};
pub use config::{ConfigError, ConnectorConfig, DiscoveryConfig, ReconnectPolicy};
pub use connector::{ClientConnector, ConnectorError, ConnectorHandler, ConnectorState, PortSelector};
pub use discovery::{DiscoveryClient, DiscoveryError, DiscoveryQuery, DiscoveryTarget, StartOutcome};
pub use filter::QueryFilter;
pub use gateway::{GatewayProxy, TreeGateway, TreeGatewayMux, TreeGatewaySubscriber};
pub use message::{Field, Message, WireError};
pub use trace::{init_tracing, init_tracing_with};

// Re-export serde traits for convenience
pub use serde::{Deserialize, Serialize};
