use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::capabilities::power::SystemPowerSource;
use crate::capabilities::PowerInformation;

use super::HandlerError;

/// Live power/thermal readings for the host.
pub trait PowerSource: Send + Sync + 'static {
    fn snapshot(&self) -> Result<PowerInformation, HandlerError>;
}

/// Read access to host environment values.
pub trait EnvironmentSource: Send + Sync + 'static {
    /// Returns `None` when the variable is unset or not visible to handlers.
    fn get(&self, name: &str) -> Option<String>;
}

/// Every host resource a handler may touch, handed to the registry at construction.
pub struct HostContext {
    platform: String,
    power: Arc<dyn PowerSource>,
    environment: Arc<dyn EnvironmentSource>,
}

impl HostContext {
    pub fn builder() -> HostContextBuilder {
        HostContextBuilder::default()
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn power(&self) -> &dyn PowerSource {
        self.power.as_ref()
    }

    pub fn environment(&self) -> &dyn EnvironmentSource {
        self.environment.as_ref()
    }
}

impl Default for HostContext {
    fn default() -> Self {
        HostContext::builder().build()
    }
}

#[derive(Default)]
pub struct HostContextBuilder {
    platform: Option<String>,
    power: Option<Arc<dyn PowerSource>>,
    environment: Option<Arc<dyn EnvironmentSource>>,
}

impl HostContextBuilder {
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn power(mut self, source: impl PowerSource) -> Self {
        self.power = Some(Arc::new(source));
        self
    }

    pub fn environment(mut self, source: impl EnvironmentSource) -> Self {
        self.environment = Some(Arc::new(source));
        self
    }

    /// Unset pieces fall back to the real host: `std::env::consts::OS`, sysinfo/sysfs
    /// power readings, and an empty environment allowlist.
    pub fn build(self) -> HostContext {
        HostContext {
            platform: self
                .platform
                .unwrap_or_else(|| std::env::consts::OS.to_string()),
            power: self
                .power
                .unwrap_or_else(|| Arc::new(SystemPowerSource::default())),
            environment: self
                .environment
                .unwrap_or_else(|| Arc::new(ProcessEnvironment::new(Vec::<String>::new()))),
        }
    }
}

/// The real process environment, filtered through an allowlist.
pub struct ProcessEnvironment {
    allowlist: HashSet<String>,
}

impl ProcessEnvironment {
    pub fn new<I, S>(allowlist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowlist: allowlist.into_iter().map(Into::into).collect(),
        }
    }
}

impl EnvironmentSource for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        if !self.allowlist.contains(name) {
            log::debug!("Environment variable '{}' is not allowlisted", name);
            return None;
        }
        std::env::var(name).ok()
    }
}

/// Fixed set of environment values.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment(HashMap<String, String>);

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticEnvironment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl EnvironmentSource for StaticEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Power source that always reports the same reading.
#[derive(Debug, Clone)]
pub struct StaticPower(pub PowerInformation);

impl PowerSource for StaticPower {
    fn snapshot(&self) -> Result<PowerInformation, HandlerError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ThermalState;

    #[test]
    fn process_environment_hides_unlisted_names() {
        let env = ProcessEnvironment::new(["PATH"]);
        assert!(env.get("PATH").is_some());
        assert_eq!(env.get("HOSTBRIDGE_DEFINITELY_NOT_LISTED"), None);
    }

    #[test]
    fn builder_overrides_defaults() {
        let ctx = HostContext::builder()
            .platform("plan9")
            .environment(StaticEnvironment::from_iter([("LANG", "C")]))
            .power(StaticPower(PowerInformation {
                current_thermal_state: ThermalState::Fair,
                is_on_battery_power: true,
            }))
            .build();

        assert_eq!(ctx.platform(), "plan9");
        assert_eq!(ctx.environment().get("LANG").as_deref(), Some("C"));
        let power = ctx.power().snapshot().unwrap();
        assert_eq!(power.current_thermal_state, ThermalState::Fair);
        assert!(power.is_on_battery_power);
    }

    #[test]
    fn default_platform_is_compile_target() {
        let ctx = HostContext::default();
        assert_eq!(ctx.platform(), std::env::consts::OS);
    }
}
