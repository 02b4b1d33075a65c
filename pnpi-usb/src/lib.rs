pub mod discovery;
pub mod error;
pub mod transport;

pub use discovery::{enumerate_identities, request_switch, run_discovery_cycle};
pub use error::{CloseErrors, UsbError};
pub use transport::{
    open_stack, AccessoryCloser, AccessoryReader, AccessoryStack, AccessoryWriter, UsbIn, UsbOut,
};
