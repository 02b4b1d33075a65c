pub mod error;
pub mod model;
pub mod wire;

pub use error::WireError;
pub use model::{
    produce_report, propagate_history, update_device_map, Command, CommandResult, Country,
    DeviceHistory, DeviceIdentity, DeviceMap, Hotspot, NetworkInterface, OutboundMessage,
    Service, SystemReport, SystemSnapshot, KNOWN_SERVICES,
};
pub use wire::{build_frame, CommandDecoder, Frame, MAX_BODY_LEN};
