//! Claims the AOA bulk interface on an already-switched accessory-mode
//! device and exposes the length-agnostic read/write primitives the
//! session supervisor frames messages on top of.

use std::future::Future;

use log::{debug, warn};
use nusb::descriptors::TransferType;
use nusb::io::EndpointRead;
use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{list_devices, Device, Endpoint, Interface};
use pnpi_core::DeviceIdentity;
use tokio::io::AsyncReadExt;

use crate::error::{CloseErrors, UsbError};

/// Number of concurrent bulk IN transfers the reader keeps in flight, so the
/// host controller can keep receiving while the session decodes the
/// previous one. Matches the queue depth the AOA stack is opened with.
const IN_FLIGHT_TRANSFERS: usize = 2;

/// Upper bound on how many bytes a single `AccessoryReader::read` call pulls
/// out of the buffered stream at once; not a protocol framing boundary.
const READ_CHUNK: usize = 16 * 1024;

/// The claimed interface and bulk endpoints backing one accessory-mode
/// session. Dropping this without calling [`AccessoryStack::close`] still
/// releases the underlying USB resources, but `close` surfaces transfer
/// errors encountered while tearing down.
pub struct AccessoryStack {
    device: Device,
    #[allow(dead_code)]
    interface: Interface,
    in_reader: EndpointRead<Bulk>,
    bulk_out: Endpoint<Bulk, Out>,
    out_buffer: Option<nusb::transfer::Buffer>,
}

fn lowest_config_value(device: &Device) -> Result<u8, UsbError> {
    device
        .configurations()
        .map(|c| c.configuration_value())
        .min()
        .ok_or(UsbError::NoConfigDescriptor)
}

/// Open the single device matching `identity` (already expected to be in
/// accessory mode), claim its first interface/alt-setting on the
/// lowest-numbered configuration, and locate its bulk in/out endpoints.
pub async fn open_stack(identity: DeviceIdentity) -> Result<AccessoryStack, UsbError> {
    let mut matches = list_devices()
        .await
        .map_err(|_| UsbError::DeviceNotFound)?
        .filter(|info| {
            info.busnum() == identity.bus
                && info.device_address() == identity.address
                && info.vendor_id() == identity.vendor_id
                && info.product_id() == identity.product_id
        });

    let info = matches.next().ok_or(UsbError::DeviceNotFound)?;
    if matches.next().is_some() {
        return Err(UsbError::MultipleDevicesMatched);
    }

    let device = info.open().await.map_err(UsbError::OpenFailed)?;

    let config_value = lowest_config_value(&device)?;
    device
        .set_configuration(config_value)
        .await
        .map_err(|_| UsbError::NoConfigDescriptor)?;

    let config = device
        .configurations()
        .find(|c| c.configuration_value() == config_value)
        .ok_or(UsbError::NoConfigDescriptor)?;

    let interface_desc = config
        .interfaces()
        .next()
        .ok_or(UsbError::NoInterfaceDescriptor)?
        .first_alt_setting();

    let interface_number = interface_desc.interface_number();

    let interface = device
        .claim_interface(interface_number)
        .await
        .map_err(UsbError::Claim)?;

    let mut in_addr = None;
    let mut out_addr = None;
    for endpoint in interface_desc.endpoints() {
        if endpoint.transfer_type() != TransferType::Bulk {
            continue;
        }
        match endpoint.direction() {
            Direction::In => in_addr = Some(endpoint.address()),
            Direction::Out => out_addr = Some(endpoint.address()),
        }
    }

    let in_addr = in_addr.ok_or(UsbError::NoBulkInEndpoint)?;
    let out_addr = out_addr.ok_or(UsbError::NoBulkOutEndpoint)?;

    let bulk_in = interface
        .endpoint::<Bulk, In>(in_addr)
        .map_err(|_| UsbError::NoBulkInEndpoint)?;
    let bulk_out = interface
        .endpoint::<Bulk, Out>(out_addr)
        .map_err(|_| UsbError::NoBulkOutEndpoint)?;

    let packet_size = bulk_in.max_packet_size();
    let in_reader = bulk_in
        .reader(packet_size)
        .with_num_transfers(IN_FLIGHT_TRANSFERS);

    Ok(AccessoryStack {
        device,
        interface,
        in_reader,
        bulk_out,
        out_buffer: None,
    })
}

/// The read half of a split [`AccessoryStack`], owned by the reader task.
/// Wraps the bulk IN endpoint in `nusb`'s buffered stream adapter, kept at
/// [`IN_FLIGHT_TRANSFERS`] transfers in flight so the host controller never
/// stalls waiting for the session to drain the previous completion.
pub struct AccessoryReader {
    reader: EndpointRead<Bulk>,
}

/// The write half of a split [`AccessoryStack`], owned by the writer task.
pub struct AccessoryWriter {
    bulk_out: Endpoint<Bulk, Out>,
    out_buffer: Option<nusb::transfer::Buffer>,
}

/// Retained by the outer loop across a session's lifetime so it alone can
/// close the device once both reader and writer tasks have exited.
pub struct AccessoryCloser {
    device: Device,
    #[allow(dead_code)]
    interface: Interface,
}

impl AccessoryStack {
    /// Split into independently-owned reader/writer halves plus a closer,
    /// so the session supervisor can run reader and writer concurrently on
    /// separate tasks.
    pub fn split(self) -> (AccessoryReader, AccessoryWriter, AccessoryCloser) {
        (
            AccessoryReader {
                reader: self.in_reader,
            },
            AccessoryWriter {
                bulk_out: self.bulk_out,
                out_buffer: self.out_buffer,
            },
            AccessoryCloser {
                device: self.device,
                interface: self.interface,
            },
        )
    }
}

impl AccessoryReader {
    /// Pull whatever bytes are currently available off the buffered bulk IN
    /// stream. The caller feeds the result into a `CommandDecoder`; a short
    /// read is normal and does not imply end-of-stream.
    pub async fn read(&mut self) -> Result<Vec<u8>, UsbError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let n = self.reader.read(&mut buf).await.map_err(UsbError::Io)?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// The read half of a bulk transport, abstracted so the session supervisor
/// can be driven against an in-memory stand-in in tests instead of a real
/// USB stack. The `Send` bound is needed since the supervisor drives both
/// halves from a `tokio::task::spawn`-ed task.
pub trait UsbIn {
    fn read(&mut self) -> impl Future<Output = Result<Vec<u8>, UsbError>> + Send;
}

/// The write half of a bulk transport, same reasoning as [`UsbIn`].
pub trait UsbOut {
    fn write_frame(
        &mut self,
        header: &[u8],
        body: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send;
}

impl UsbIn for AccessoryReader {
    fn read(&mut self) -> impl Future<Output = Result<Vec<u8>, UsbError>> + Send {
        AccessoryReader::read(self)
    }
}

impl UsbOut for AccessoryWriter {
    fn write_frame(
        &mut self,
        header: &[u8],
        body: &[u8],
    ) -> impl Future<Output = Result<(), UsbError>> + Send {
        AccessoryWriter::write_frame(self, header, body)
    }
}

impl AccessoryWriter {
    /// Write `header` then `body` as two separate bulk OUT transfers,
    /// mirroring how the outbound frame is laid out on the wire.
    pub async fn write_frame(&mut self, header: &[u8], body: &[u8]) -> Result<(), UsbError> {
        self.write_chunk(header).await?;
        self.write_chunk(body).await
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<(), UsbError> {
        let mut buffer = self
            .out_buffer
            .take()
            .filter(|b| b.capacity() >= data.len())
            .unwrap_or_else(|| {
                let mut buffer = self.bulk_out.allocate(data.len());
                buffer.fill(0);
                buffer
            });

        buffer.extend_fill(data.len(), 0).copy_from_slice(data);

        self.bulk_out.submit(buffer);
        let completion = self.bulk_out.next_complete().await;
        self.out_buffer = Some(completion.buffer);
        completion.status.map_err(UsbError::Transfer)
    }
}

impl AccessoryCloser {
    /// Tear down the stack, collecting (not short-circuiting on) any
    /// errors encountered while resetting the device. Interface release
    /// happens implicitly when `self.interface` drops.
    pub async fn close(self) -> Result<(), CloseErrors> {
        let mut errors = Vec::new();

        if let Err(e) = self.device.reset().await {
            warn!("error resetting device during close: {e}");
            errors.push(UsbError::Claim(e));
        }

        debug!("accessory stack closed");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CloseErrors(errors))
        }
    }
}
