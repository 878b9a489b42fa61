use std::time::Duration;

use serde::Serialize;

use crate::registry::HandlerError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Capability already registered: {0}")]
    DuplicateCapability(String),

    #[error("Capability not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments for '{capability}': {reason}")]
    InvalidArguments { capability: String, reason: String },

    #[error("Capability '{capability}' failed: {source}")]
    Handler {
        capability: String,
        #[source]
        source: HandlerError,
    },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Invalid argument schema for '{capability}': {reason}")]
    InvalidSchema { capability: String, reason: String },

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn handler(capability: impl Into<String>, source: HandlerError) -> Self {
        BridgeError::Handler {
            capability: capability.into(),
            source,
        }
    }

    pub fn invalid_arguments(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        BridgeError::InvalidArguments {
            capability: capability.into(),
            reason: reason.into(),
        }
    }
}

impl Serialize for BridgeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_message() {
        let err = BridgeError::NotFound("get-nonexistent".into());
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Capability not found: get-nonexistent\"");
    }

    #[test]
    fn handler_error_keeps_source() {
        use std::error::Error;

        let err = BridgeError::handler(
            "get-power-information",
            HandlerError::Unavailable("no power supply".into()),
        );
        assert!(err.source().is_some());
        assert!(err.to_string().contains("get-power-information"));
    }
}
