//! Network primitives shared by the discovery and connector reactors.
//!
//! Everything here is mio-based and non-blocking; callers register the
//! sockets with their own [`mio::Poll`].

pub mod endpoint;
pub mod interfaces;
pub mod socket;

pub use endpoint::Endpoint;
pub use interfaces::{InterfaceKind, LocalInterface};
pub use socket::UdpSocket;
