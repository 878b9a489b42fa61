use serde_json::Value;
use sysinfo::System;

use super::{EnvironmentValue, PlatformInfo, SystemInfo};
use crate::registry::{HandlerError, HandlerResult, HostContext};

pub(super) fn power_information(ctx: &HostContext, _args: Value) -> HandlerResult {
    let info = ctx.power().snapshot()?;
    Ok(serde_json::to_value(info)?)
}

pub(super) fn environment_variable(ctx: &HostContext, args: Value) -> HandlerResult {
    let name = args
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| HandlerError::InvalidInput("missing required field: name".into()))?;

    let value = ctx.environment().get(name);
    Ok(serde_json::to_value(EnvironmentValue {
        name: name.to_string(),
        found: value.is_some(),
        value,
    })?)
}

pub(super) fn platform(ctx: &HostContext, _args: Value) -> HandlerResult {
    Ok(serde_json::to_value(PlatformInfo {
        platform: ctx.platform().to_string(),
        arch: std::env::consts::ARCH.to_string(),
        family: std::env::consts::FAMILY.to_string(),
    })?)
}

pub(super) fn system_info(_ctx: &HostContext, _args: Value) -> HandlerResult {
    let sys = System::new_all();

    Ok(serde_json::to_value(SystemInfo {
        os: System::name().unwrap_or_else(|| "unknown".into()),
        os_version: System::os_version().unwrap_or_else(|| "unknown".into()),
        hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
        uptime_secs: System::uptime(),
        cpu_count: sys.cpus().len(),
        total_memory: sys.total_memory(),
        sampled_at: chrono::Utc::now(),
    })?)
}
