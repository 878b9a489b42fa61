//! A whitelisted capability bridge between an untrusted UI and a trusted host.
//!
//! The host registers named [`registry::Capability`] handlers. The untrusted side
//! builds a [`bridge::CapabilitySurface`] from a fixed whitelist and reaches the
//! host only through a [`transport::ChannelTransport`], one serialized frame at a
//! time.

pub mod bridge;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod transport;
pub(crate) mod util;

pub use bridge::{CapabilityBridge, CapabilityHandle, CapabilitySurface, Whitelist};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use registry::{Capability, CapabilityRegistry, HandlerError, HostContext};
pub use transport::{ChannelTransport, PendingCall};
