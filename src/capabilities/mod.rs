//! Built-in host capabilities and the result shapes they declare.
//!
//! | name                       | args         | result             |
//! |----------------------------|--------------|--------------------|
//! | `get-power-information`    | none         | [`PowerInformation`] |
//! | `get-environment-variable` | `{name}`     | [`EnvironmentValue`] |
//! | `get-platform`             | none         | [`PlatformInfo`]     |
//! | `get-system-info`          | none         | [`SystemInfo`]       |

pub mod power;
mod system;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BridgeResult;
use crate::registry::{validation, Capability, CapabilityRegistry, HostContext};

pub const GET_POWER_INFORMATION: &str = "get-power-information";
pub const GET_ENVIRONMENT_VARIABLE: &str = "get-environment-variable";
pub const GET_PLATFORM: &str = "get-platform";
pub const GET_SYSTEM_INFO: &str = "get-system-info";

/// A capability name and the JSON Schema its arguments must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    #[serde(default = "validation::any_object")]
    pub args: Value,
}

impl CapabilitySpec {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn no_args(name: impl Into<String>) -> Self {
        Self::new(name, validation::no_args())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerInformation {
    pub current_thermal_state: ThermalState,
    pub is_on_battery_power: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentValue {
    pub name: String,
    pub value: Option<String>,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub platform: String,
    pub arch: String,
    pub family: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub os: String,
    pub os_version: String,
    pub hostname: String,
    pub uptime_secs: u64,
    pub cpu_count: usize,
    pub total_memory: u64,
    pub sampled_at: DateTime<Utc>,
}

fn builtin_capabilities() -> Vec<Capability> {
    vec![
        Capability::sync(
            CapabilitySpec::no_args(GET_POWER_INFORMATION),
            system::power_information,
        ),
        Capability::sync(
            CapabilitySpec::new(
                GET_ENVIRONMENT_VARIABLE,
                json!({
                    "type": "object",
                    "properties": {
                        "name": { "type": "string", "minLength": 1 }
                    },
                    "required": ["name"],
                    "additionalProperties": false
                }),
            ),
            system::environment_variable,
        ),
        Capability::sync(CapabilitySpec::no_args(GET_PLATFORM), system::platform),
        Capability::sync(CapabilitySpec::no_args(GET_SYSTEM_INFO), system::system_info),
    ]
}

/// Whitelist entries for every built-in capability.
pub fn builtin_specs() -> Vec<CapabilitySpec> {
    builtin_capabilities()
        .iter()
        .map(|capability| capability.spec().clone())
        .collect()
}

/// Register all built-in handlers.
pub fn register_builtin(registry: &mut CapabilityRegistry) -> BridgeResult<()> {
    for capability in builtin_capabilities() {
        registry.register(capability)?;
    }
    Ok(())
}

/// A registry answering for every built-in capability.
pub fn builtin_registry(context: HostContext) -> BridgeResult<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new(context);
    register_builtin(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{StaticEnvironment, StaticPower};

    fn context() -> HostContext {
        HostContext::builder()
            .platform("linux")
            .environment(StaticEnvironment::from_iter([("LANG", "en_US.UTF-8")]))
            .power(StaticPower(PowerInformation {
                current_thermal_state: ThermalState::Nominal,
                is_on_battery_power: false,
            }))
            .build()
    }

    #[test]
    fn power_information_wire_shape() {
        let info = PowerInformation {
            current_thermal_state: ThermalState::Serious,
            is_on_battery_power: true,
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            json!({ "currentThermalState": "serious", "isOnBatteryPower": true })
        );
    }

    #[test]
    fn builtin_registration_twice_is_rejected() {
        let mut registry = builtin_registry(context()).unwrap();
        assert!(register_builtin(&mut registry).is_err());
        assert_eq!(registry.descriptors().len(), builtin_specs().len());
    }

    #[tokio::test]
    async fn builtin_power_information() {
        let registry = builtin_registry(context()).unwrap();
        let value = registry
            .dispatch(GET_POWER_INFORMATION, json!({}))
            .await
            .unwrap();
        assert_eq!(
            value,
            json!({ "currentThermalState": "nominal", "isOnBatteryPower": false })
        );
    }

    #[tokio::test]
    async fn builtin_environment_variable() {
        let registry = builtin_registry(context()).unwrap();

        let found: EnvironmentValue = serde_json::from_value(
            registry
                .dispatch(GET_ENVIRONMENT_VARIABLE, json!({ "name": "LANG" }))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(found.value.as_deref(), Some("en_US.UTF-8"));
        assert!(found.found);

        let missing: EnvironmentValue = serde_json::from_value(
            registry
                .dispatch(GET_ENVIRONMENT_VARIABLE, json!({ "name": "SECRET_TOKEN" }))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(missing.value, None);
        assert!(!missing.found);
    }

    #[tokio::test]
    async fn builtin_platform_uses_context() {
        let registry = builtin_registry(context()).unwrap();
        let info: PlatformInfo = serde_json::from_value(
            registry.dispatch(GET_PLATFORM, json!({})).await.unwrap(),
        )
        .unwrap();
        assert_eq!(info.platform, "linux");
        assert_eq!(info.arch, std::env::consts::ARCH);
    }

    #[tokio::test]
    async fn builtin_system_info_has_cpus() {
        let registry = builtin_registry(context()).unwrap();
        let info: SystemInfo = serde_json::from_value(
            registry.dispatch(GET_SYSTEM_INFO, json!({})).await.unwrap(),
        )
        .unwrap();
        assert!(info.cpu_count > 0);
    }
}
