//! Enumerates USB devices each scan cycle, carries device history forward
//! via [`pnpi_core::update_device_map`], and drives the AOA handshake that
//! switches a phone from its default USB mode into accessory mode.

use std::time::Duration;

use log::{debug, info, warn};
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use nusb::{list_devices, Device};
use pnpi_core::{DeviceHistory, DeviceIdentity, DeviceMap};

use crate::error::UsbError;

const ACCESSORY_GET_PROTOCOL: u8 = 51;
const ACCESSORY_SEND_STRING: u8 = 52;
const ACCESSORY_START: u8 = 53;

const MANUFACTURER: &str = "Nick Lee of Hong Kong";
const MODEL: &str = "Plug n Pi Server";
const DESCRIPTION: &str = "The Raspberry side of Plug n Pi";
const PROTOCOL_VERSION: &str = "1";
const URI: &str = "https://github.com/nickoala/pnpi";
const SERIAL_NUMBER: &str = "0123456789";

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Snapshot the bus: one `DeviceIdentity` per currently-enumerated device.
pub async fn enumerate_identities() -> Vec<DeviceIdentity> {
    match list_devices().await {
        Ok(devices) => devices
            .map(|info| DeviceIdentity {
                bus: info.busnum(),
                address: info.device_address(),
                vendor_id: info.vendor_id(),
                product_id: info.product_id(),
            })
            .collect(),
        Err(e) => {
            warn!("failed to enumerate USB devices: {e}");
            Vec::new()
        }
    }
}

/// Run one discovery cycle: enumerate the bus, merge against `previous`
/// history, and report the (at most one) accessory-mode and switch-eligible
/// targets for this cycle.
pub async fn run_discovery_cycle(
    previous: &DeviceMap,
) -> (DeviceMap, Option<DeviceIdentity>, Option<DeviceIdentity>) {
    let identities = enumerate_identities().await;
    pnpi_core::update_device_map(identities, previous)
}

async fn open_unique_device(identity: DeviceIdentity) -> Result<Device, UsbError> {
    let mut matches = list_devices()
        .await
        .map_err(|_| UsbError::DeviceNotFound)?
        .filter(|info| {
            info.busnum() == identity.bus
                && info.device_address() == identity.address
                && info.vendor_id() == identity.vendor_id
                && info.product_id() == identity.product_id
        });

    let first = matches.next().ok_or(UsbError::DeviceNotFound)?;
    if matches.next().is_some() {
        return Err(UsbError::MultipleDevicesMatched);
    }

    first.open().await.map_err(UsbError::OpenFailed)
}

async fn control_in(device: &Device, request: u8, index: u16, length: u16) -> Result<Vec<u8>, UsbError> {
    device
        .control_in(
            ControlIn {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value: 0,
                index,
                length,
            },
            CONTROL_TIMEOUT,
        )
        .await
        .map_err(UsbError::Control)
}

async fn control_out(device: &Device, request: u8, index: u16, data: &[u8]) -> Result<(), UsbError> {
    device
        .control_out(
            ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request,
                value: 0,
                index,
                data,
            },
            CONTROL_TIMEOUT,
        )
        .await
        .map_err(UsbError::Control)
}

async fn send_string(device: &Device, index: u16, value: &str) -> Result<(), UsbError> {
    let mut data = Vec::with_capacity(value.len() + 1);
    data.extend_from_slice(value.as_bytes());
    data.push(0);
    control_out(device, ACCESSORY_SEND_STRING, index, &data).await
}

/// Perform the six-request AOA handshake that switches `device` into
/// accessory mode. The device re-enumerates under a new address as a side
/// effect; the caller is responsible for rediscovering it afterwards.
async fn switch_to_accessory_mode(device: &Device) -> Result<(), UsbError> {
    let version_bytes = control_in(device, ACCESSORY_GET_PROTOCOL, 0, 2).await?;
    let version = u16::from_le_bytes([
        *version_bytes.first().unwrap_or(&0),
        *version_bytes.get(1).unwrap_or(&0),
    ]);
    if !matches!(version, 1 | 2) {
        return Err(UsbError::UnexpectedAccessoryProtocolVersion(version));
    }

    send_string(device, 0, MANUFACTURER).await?;
    send_string(device, 1, MODEL).await?;
    send_string(device, 2, DESCRIPTION).await?;
    send_string(device, 3, PROTOCOL_VERSION).await?;
    send_string(device, 4, URI).await?;
    send_string(device, 5, SERIAL_NUMBER).await?;

    control_out(device, ACCESSORY_START, 0, &[]).await
}

/// Open the single device matching `identity` and switch it into accessory
/// mode. The device is expected to drop off the bus and re-enumerate with a
/// new identity; this function does not wait for that.
pub async fn request_switch(identity: DeviceIdentity) -> Result<(), UsbError> {
    info!("requesting accessory mode switch for {identity:?}");
    let device = open_unique_device(identity).await?;
    let result = switch_to_accessory_mode(&device).await;
    if let Err(ref e) = result {
        debug!("switch handshake failed for {identity:?}: {e}");
    }
    result
}

/// Mark `identity` with `history` in `map`, used by the outer scan loop to
/// record the outcome of an attempted switch or stack open.
pub fn mark(map: &mut DeviceMap, identity: DeviceIdentity, history: DeviceHistory) {
    map.insert(identity, history);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessory_protocol_requests_match_original_numbering() {
        assert_eq!(ACCESSORY_GET_PROTOCOL, 51);
        assert_eq!(ACCESSORY_SEND_STRING, 52);
        assert_eq!(ACCESSORY_START, 53);
    }
}
