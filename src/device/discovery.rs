//! Device selection.
//!
//! Enumeration is delegated to [`DeviceSystem::find`]; this module only
//! decides which of the found devices to use and explains why a device that
//! was asked for cannot be used as found.

use tracing::{debug, info, warn};

use super::{ConnectionId, DeviceInfo, DeviceSystem, TransportKind};
use crate::error::{AcqError, Result};

/// Pick a device to connect to.
///
/// With `preferred` set, that device must be among those found and have a
/// valid configuration. Otherwise the first device with a valid
/// configuration is returned.
pub fn select_device(
    system: &dyn DeviceSystem,
    preferred: Option<&ConnectionId>,
) -> Result<DeviceInfo> {
    let found = system.find().map_err(AcqError::Query)?;
    debug!(count = found.len(), "device enumeration complete");

    if let Some(id) = preferred {
        let info = found
            .into_iter()
            .find(|info| &info.connection_id == id)
            .ok_or(AcqError::NoDevice)?;
        return usable(info);
    }

    let mut first_unusable = None;
    for info in found {
        if info.configuration_valid {
            info!(device = %info.connection_id, display = %info.display_id, "selected device");
            return Ok(info);
        }
        warn!(
            device = %info.connection_id,
            interface = %info.interface_id,
            reason = unusable_reason(&info),
            "skipping device"
        );
        first_unusable.get_or_insert(info);
    }

    match first_unusable {
        Some(info) => usable(info),
        None => Err(AcqError::NoDevice),
    }
}

fn usable(info: DeviceInfo) -> Result<DeviceInfo> {
    if info.configuration_valid {
        return Ok(info);
    }
    Err(AcqError::DeviceUnusable {
        reason: unusable_reason(&info).to_string(),
        id: info.connection_id,
    })
}

fn unusable_reason(info: &DeviceInfo) -> &'static str {
    match info.transport {
        TransportKind::U3v => "device must be connected to a USB3 port",
        TransportKind::Gev => {
            "device IP configuration does not match its network interface; reassign its address"
        }
    }
}
