use std::fmt::Display;

use nusb::transfer::TransferError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UsbError {
    DeviceNotFound,
    MultipleDevicesMatched,
    NoConfigDescriptor,
    NoInterfaceDescriptor,
    NoBulkInEndpoint,
    NoBulkOutEndpoint,
    UnexpectedAccessoryProtocolVersion(u16),
    OpenFailed(std::io::Error),
    Claim(nusb::Error),
    Control(TransferError),
    Transfer(TransferError),
    Io(std::io::Error),
}

impl Display for UsbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbError::DeviceNotFound => write!(f, "no matching USB device found"),
            UsbError::MultipleDevicesMatched => {
                write!(f, "more than one USB device matched this identity")
            }
            UsbError::NoConfigDescriptor => write!(f, "device has no configuration descriptor"),
            UsbError::NoInterfaceDescriptor => write!(f, "config has no interface descriptor"),
            UsbError::NoBulkInEndpoint => write!(f, "interface has no bulk IN endpoint"),
            UsbError::NoBulkOutEndpoint => write!(f, "interface has no bulk OUT endpoint"),
            UsbError::UnexpectedAccessoryProtocolVersion(v) => {
                write!(f, "unexpected AOA protocol version: {v}")
            }
            UsbError::OpenFailed(e) => write!(f, "failed to open device: {e}"),
            UsbError::Claim(e) => write!(f, "failed to claim interface: {e}"),
            UsbError::Control(e) => write!(f, "control transfer failed: {e}"),
            UsbError::Transfer(e) => write!(f, "bulk transfer failed: {e}"),
            UsbError::Io(e) => write!(f, "bulk IN stream error: {e}"),
        }
    }
}

/// Several fallible close operations can each fail independently; we
/// collect them all rather than stop at the first.
#[derive(Debug, Default)]
pub struct CloseErrors(pub Vec<UsbError>);

impl Display for CloseErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let joined: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", joined.join("; "))
    }
}

impl std::error::Error for CloseErrors {}
