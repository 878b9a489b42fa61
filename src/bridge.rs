//! The untrusted side's only view of the host.
//!
//! A [`CapabilityBridge`] is built once from a fixed [`Whitelist`] and exposes a
//! [`CapabilitySurface`]: an immutable object holding one [`CapabilityHandle`] per
//! whitelisted name. Nothing else is reachable. The surface cannot be extended,
//! enumerated, or pointed at a different channel after construction, and handles
//! can only be obtained from it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::capabilities::CapabilitySpec;
use crate::error::{BridgeError, BridgeResult};
use crate::registry::validation;
use crate::transport::{ChannelTransport, PendingCall};

struct WhitelistEntry {
    spec: CapabilitySpec,
    validator: Arc<Validator>,
}

/// The fixed set of capabilities the untrusted side may call.
pub struct Whitelist {
    entries: BTreeMap<String, WhitelistEntry>,
}

impl Whitelist {
    /// Fails on a repeated name or an argument shape that is not a valid schema.
    pub fn new(specs: impl IntoIterator<Item = CapabilitySpec>) -> BridgeResult<Self> {
        let mut entries = BTreeMap::new();
        for spec in specs {
            if entries.contains_key(&spec.name) {
                return Err(BridgeError::DuplicateCapability(spec.name));
            }
            let validator = validation::compile(&spec.args).map_err(|reason| {
                BridgeError::InvalidSchema {
                    capability: spec.name.clone(),
                    reason,
                }
            })?;
            entries.insert(
                spec.name.clone(),
                WhitelistEntry {
                    spec,
                    validator: Arc::new(validator),
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whitelisted entries in name order. Host-side configuration view only.
    pub fn specs(&self) -> impl Iterator<Item = &CapabilitySpec> {
        self.entries.values().map(|entry| &entry.spec)
    }
}

pub struct CapabilityBridge {
    whitelist: Whitelist,
}

impl CapabilityBridge {
    pub fn new(whitelist: Whitelist) -> Self {
        Self { whitelist }
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    /// Bind every whitelisted name to `transport` and hand back the surface.
    pub fn expose(&self, transport: Arc<ChannelTransport>) -> CapabilitySurface {
        let members = self
            .whitelist
            .entries
            .iter()
            .map(|(name, entry)| {
                let handle = CapabilityHandle {
                    name: Arc::from(name.as_str()),
                    validator: entry.validator.clone(),
                    transport: transport.clone(),
                };
                (name.clone(), handle)
            })
            .collect();

        log::info!(
            "Exposed {} capabilities on channel {}",
            self.whitelist.len(),
            transport.id()
        );
        CapabilitySurface {
            members: Arc::new(members),
        }
    }
}

/// The capability object handed to the untrusted side.
#[derive(Clone)]
pub struct CapabilitySurface {
    members: Arc<HashMap<String, CapabilityHandle>>,
}

impl CapabilitySurface {
    /// The member for `name`, or `None` when the name was never whitelisted.
    pub fn get(&self, name: &str) -> Option<&CapabilityHandle> {
        self.members.get(name)
    }
}

impl fmt::Debug for CapabilitySurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilitySurface").finish_non_exhaustive()
    }
}

/// A callable member of the surface, bound to one whitelisted name.
#[derive(Clone)]
pub struct CapabilityHandle {
    name: Arc<str>,
    validator: Arc<Validator>,
    transport: Arc<ChannelTransport>,
}

impl CapabilityHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forward a call to the host. Arguments that fail the whitelisted shape are
    /// rejected here and never reach the channel.
    pub fn call(&self, args: Value) -> PendingCall {
        if let Err(reason) = validation::check(&self.validator, &args) {
            log::debug!("Rejected call to '{}' locally: {}", self.name, reason);
            return PendingCall::ready(Err(BridgeError::invalid_arguments(
                self.name.as_ref(),
                reason,
            )));
        }
        self.transport.send(&self.name, args)
    }

    /// Call with no arguments.
    pub fn invoke(&self) -> PendingCall {
        self.call(Value::Object(serde_json::Map::new()))
    }

    /// Call and decode the result into the capability's declared shape.
    pub async fn call_as<T: DeserializeOwned>(&self, args: Value) -> BridgeResult<T> {
        let value = self.call(args).await?;
        serde_json::from_value(value).map_err(|e| {
            BridgeError::Protocol(format!("Unexpected result shape for '{}': {}", self.name, e))
        })
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Race a call against a timer. The channel is not told; if the host answers later
/// the response is discarded.
pub async fn with_timeout<T, F>(duration: Duration, call: F) -> BridgeResult<T>
where
    F: Future<Output = BridgeResult<T>>,
{
    tokio::time::timeout(duration, call)
        .await
        .map_err(|_| BridgeError::TimedOut(duration))?
}
