//! Default power/thermal readings for the host.
//!
//! Thermal state comes from sysinfo's hardware sensors: the hottest component,
//! measured against its own critical threshold, picks the bucket. Battery use is
//! read from the Linux power-supply class directory; other platforms report mains.

use std::fs;
use std::path::{Path, PathBuf};

use sysinfo::Components;

use super::{PowerInformation, ThermalState};
use crate::registry::{HandlerError, PowerSource};

const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";

/// Assumed critical temperature for sensors that do not report one.
const FALLBACK_CRITICAL_CELSIUS: f32 = 100.0;

pub struct SystemPowerSource {
    power_supply_dir: PathBuf,
}

impl SystemPowerSource {
    pub fn with_power_supply_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            power_supply_dir: dir.into(),
        }
    }
}

impl Default for SystemPowerSource {
    fn default() -> Self {
        Self::with_power_supply_dir(POWER_SUPPLY_DIR)
    }
}

impl PowerSource for SystemPowerSource {
    fn snapshot(&self) -> Result<PowerInformation, HandlerError> {
        let components = Components::new_with_refreshed_list();
        let readings = components
            .list()
            .iter()
            .filter_map(|c| c.temperature().map(|t| (t, c.critical())));

        Ok(PowerInformation {
            current_thermal_state: thermal_state(readings),
            is_on_battery_power: on_battery(&self.power_supply_dir)?,
        })
    }
}

/// Bucket the hottest sensor by how close it runs to its critical temperature.
pub fn thermal_state(readings: impl IntoIterator<Item = (f32, Option<f32>)>) -> ThermalState {
    let ratio = readings
        .into_iter()
        .filter(|(temp, _)| temp.is_finite())
        .map(|(temp, critical)| {
            let critical = critical
                .filter(|c| c.is_finite() && *c > 0.0)
                .unwrap_or(FALLBACK_CRITICAL_CELSIUS);
            temp / critical
        })
        .fold(0.0_f32, f32::max);

    match ratio {
        r if r >= 0.95 => ThermalState::Critical,
        r if r >= 0.85 => ThermalState::Serious,
        r if r >= 0.70 => ThermalState::Fair,
        _ => ThermalState::Nominal,
    }
}

#[cfg(target_os = "linux")]
fn on_battery(dir: &Path) -> Result<bool, HandlerError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        // No power-supply class at all: desktops, containers, VMs.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(HandlerError::Io(e)),
    };

    let mut has_battery = false;
    let mut has_mains = false;
    let mut mains_online = false;

    for entry in entries.flatten() {
        let path = entry.path();
        match read_attr(&path, "type").as_deref() {
            Some("Mains") | Some("USB") => {
                has_mains = true;
                if read_attr(&path, "online").as_deref() == Some("1") {
                    mains_online = true;
                }
            }
            Some("Battery") => {
                has_battery = true;
                if read_attr(&path, "status").as_deref() == Some("Discharging") {
                    return Ok(true);
                }
            }
            _ => {}
        }
    }

    Ok(has_battery && has_mains && !mains_online)
}

#[cfg(not(target_os = "linux"))]
fn on_battery(_dir: &Path) -> Result<bool, HandlerError> {
    Ok(false)
}

#[cfg(target_os = "linux")]
fn read_attr(supply: &Path, attr: &str) -> Option<String> {
    fs::read_to_string(supply.join(attr))
        .ok()
        .map(|s| s.trim().to_string())
}
