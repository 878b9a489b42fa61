pub mod context;
pub mod validation;

pub use context::{
    EnvironmentSource, HostContext, HostContextBuilder, PowerSource, ProcessEnvironment,
    StaticEnvironment, StaticPower,
};

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use jsonschema::Validator;
use serde::Serialize;
use serde_json::Value;

use crate::capabilities::CapabilitySpec;
use crate::error::{BridgeError, BridgeResult};

/// Failures raised by handler bodies while querying the host.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Host resource unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// A host-side failure as reported across the boundary.
    #[error("{0}")]
    Remote(String),

    #[error("{0}")]
    Other(String),
}

pub type HandlerResult = Result<Value, HandlerError>;

/// A handler body that awaits host resources.
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn call(&self, ctx: &HostContext, args: Value) -> HandlerResult;
}

type SyncHandler = dyn Fn(&HostContext, Value) -> HandlerResult + Send + Sync;

enum Handler {
    Sync(Arc<SyncHandler>),
    Async(Arc<dyn AsyncHandler>),
}

/// A named host operation together with its argument shape and handler body.
pub struct Capability {
    spec: CapabilitySpec,
    handler: Handler,
}

impl Capability {
    /// Blocking handler. Runs on the blocking pool so the host loop keeps turning.
    pub fn sync<F>(spec: CapabilitySpec, handler: F) -> Self
    where
        F: Fn(&HostContext, Value) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            spec,
            handler: Handler::Sync(Arc::new(handler)),
        }
    }

    pub fn asynchronous(spec: CapabilitySpec, handler: impl AsyncHandler) -> Self {
        Self {
            spec,
            handler: Handler::Async(Arc::new(handler)),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    pub fn is_async(&self) -> bool {
        matches!(self.handler, Handler::Async(_))
    }
}

/// Host-side summary of a registered capability. Never sent across the boundary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub name: String,
    pub is_async: bool,
    pub args: Value,
}

struct Entry {
    capability: Capability,
    validator: Validator,
}

/// All capabilities the host answers for, built at startup.
pub struct CapabilityRegistry {
    context: Arc<HostContext>,
    capabilities: HashMap<String, Entry>,
}

impl CapabilityRegistry {
    pub fn new(context: HostContext) -> Self {
        Self {
            context: Arc::new(context),
            capabilities: HashMap::new(),
        }
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    /// Register a capability. Each name may be registered exactly once.
    pub fn register(&mut self, capability: Capability) -> BridgeResult<()> {
        let name = capability.name().to_string();
        if self.capabilities.contains_key(&name) {
            return Err(BridgeError::DuplicateCapability(name));
        }
        let validator = validation::compile(&capability.spec.args).map_err(|reason| {
            BridgeError::InvalidSchema {
                capability: name.clone(),
                reason,
            }
        })?;
        log::info!(
            "Registered capability: {} ({})",
            name,
            if capability.is_async() { "async" } else { "sync" }
        );
        self.capabilities.insert(
            name,
            Entry {
                capability,
                validator,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// List registered capabilities, sorted by name.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut result: Vec<_> = self
            .capabilities
            .values()
            .map(|entry| CapabilityDescriptor {
                name: entry.capability.name().to_string(),
                is_async: entry.capability.is_async(),
                args: entry.capability.spec.args.clone(),
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Run the handler registered under `name`. Results are never cached; every call
    /// reads live host state through the context.
    pub async fn dispatch(&self, name: &str, args: Value) -> BridgeResult<Value> {
        let entry = self
            .capabilities
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;

        validation::check(&entry.validator, &args)
            .map_err(|reason| BridgeError::invalid_arguments(name, reason))?;

        let result = match &entry.capability.handler {
            Handler::Sync(handler) => {
                let handler = handler.clone();
                let ctx = self.context.clone();
                match tokio::task::spawn_blocking(move || handler(ctx.as_ref(), args)).await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(
                        e.into_panic(),
                    ))),
                    Err(e) => Err(HandlerError::Other(e.to_string())),
                }
            }
            Handler::Async(handler) => {
                match AssertUnwindSafe(handler.call(self.context.as_ref(), args))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(payload) => Err(HandlerError::Panicked(panic_message(payload))),
                }
            }
        };

        result.map_err(|e| BridgeError::handler(name, e))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
