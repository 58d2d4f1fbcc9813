//! Raw bulk-transfer USB transport.
//!
//! Some Tensor parts enumerate their BootROM as a plain USB device instead
//! of a CDC-ACM port: bulk OUT 0x02 / IN 0x81 (512-byte packets) plus an
//! interrupt IN 0x83 the protocol never actually needs. Writes are paced a
//! packet at a time; a stalled bulk endpoint gets one standard
//! ClearFeature(ENDPOINT_HALT) before the stall is treated as fatal.

use std::time::Duration;

use rusb::{Device, DeviceHandle, Direction, GlobalContext, TransferType};

use super::{Transport, TransportError};

const EP_OUT: u8 = 0x02;
const EP_IN: u8 = 0x81;
const EP_INT: u8 = 0x83;

const BULK_PACKET_SIZE: usize = 512;

const CONFIGURATION: u8 = 1;

const READ_TIMEOUT: Duration = Duration::from_millis(200);
const WRITE_TIMEOUT: Duration = Duration::from_secs(4);
const CONTROL_TIMEOUT: Duration = Duration::from_millis(750);

/// The BootROM loses packets when they arrive back to back.
const INTER_PACKET_PAUSE: Duration = Duration::from_millis(50);

const REQUEST_CLEAR_FEATURE: u8 = 0x01;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum UsbInitError {
    #[error("failed to fetch USB device descriptor: {0}")]
    GetDeviceDescriptor(rusb::Error),
    #[error("failed to fetch USB config descriptor: {0}")]
    GetConfigDescriptor(rusb::Error),
    #[error("failed to open USB device: {0}")]
    Open(rusb::Error),
    #[error("failed to set active configuration for USB device: {0}")]
    SetActiveConfiguration(rusb::Error),
    #[error("failed to claim interface {0}: {1}")]
    ClaimInterface(u8, rusb::Error),
    #[error("device is missing bulk endpoints 0x02/0x81")]
    MissingBulkEndpoints,
}

pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    location: String,
}

impl UsbTransport {
    /// Opens an already-matched device, claiming every interface that
    /// carries one of the expected endpoints.
    pub fn open(device: &Device<GlobalContext>) -> Result<Self, UsbInitError> {
        let descriptor = device
            .device_descriptor()
            .map_err(UsbInitError::GetDeviceDescriptor)?;

        tracing::debug!(
            "Opening device: Bus {:03} Device {:03} ID {:04x}:{:04x}",
            device.bus_number(),
            device.address(),
            descriptor.vendor_id(),
            descriptor.product_id(),
        );

        let config = device
            .active_config_descriptor()
            .map_err(UsbInitError::GetConfigDescriptor)?;

        let handle = device.open().map_err(UsbInitError::Open)?;
        handle
            .set_active_configuration(CONFIGURATION)
            .map_err(UsbInitError::SetActiveConfiguration)?;

        let mut found_out = false;
        let mut found_in = false;
        for interface in config.interfaces() {
            let mut wanted = false;
            for interface_descriptor in interface.descriptors() {
                for endpoint in interface_descriptor.endpoint_descriptors() {
                    match (endpoint.transfer_type(), endpoint.direction()) {
                        (TransferType::Bulk, Direction::Out) if endpoint.address() == EP_OUT => {
                            tracing::trace!("Found bulk out endpoint: {:#04x}", endpoint.address());
                            found_out = true;
                            wanted = true;
                        }
                        (TransferType::Bulk, Direction::In) if endpoint.address() == EP_IN => {
                            tracing::trace!("Found bulk in endpoint: {:#04x}", endpoint.address());
                            found_in = true;
                            wanted = true;
                        }
                        (TransferType::Interrupt, Direction::In)
                            if endpoint.address() == EP_INT =>
                        {
                            tracing::trace!(
                                "Found interrupt in endpoint: {:#04x}",
                                endpoint.address()
                            );
                            wanted = true;
                        }
                        _ => {}
                    }
                }
            }
            if wanted {
                handle
                    .claim_interface(interface.number())
                    .map_err(|err| UsbInitError::ClaimInterface(interface.number(), err))?;
            }
        }

        if !found_out || !found_in {
            return Err(UsbInitError::MissingBulkEndpoints);
        }

        Ok(Self {
            handle,
            location: format!("{:03}:{:03}", device.bus_number(), device.address()),
        })
    }

    /// Standard ClearFeature(ENDPOINT_HALT) control request.
    fn clear_stall(&self, endpoint: u8) -> Result<(), rusb::Error> {
        self.handle.write_control(
            rusb::request_type(
                Direction::Out,
                rusb::RequestType::Standard,
                rusb::Recipient::Endpoint,
            ),
            REQUEST_CLEAR_FEATURE,
            FEATURE_ENDPOINT_HALT,
            u16::from(endpoint),
            &[],
            CONTROL_TIMEOUT,
        )?;
        Ok(())
    }

    /// One bulk write with a single stall-recovery attempt.
    fn write_packet(&self, packet: &[u8]) -> Result<usize, TransportError> {
        match self.handle.write_bulk(EP_OUT, packet, WRITE_TIMEOUT) {
            Ok(n) => Ok(n),
            Err(rusb::Error::Pipe) => {
                tracing::debug!("Endpoint {EP_OUT:#04x} stalled, clearing");
                if self.clear_stall(EP_OUT).is_err() {
                    return Err(TransportError::SevereStall(EP_OUT));
                }
                match self.handle.write_bulk(EP_OUT, packet, WRITE_TIMEOUT) {
                    Ok(n) => Ok(n),
                    Err(rusb::Error::Pipe) => Err(TransportError::SevereStall(EP_OUT)),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Transport for UsbTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.handle.read_bulk(EP_IN, buf, READ_TIMEOUT) {
            Ok(n) => {
                if n > 0 {
                    tracing::trace!("Read {:02x?}", &buf[..n]);
                }
                Ok(n)
            }
            Err(rusb::Error::Timeout) => Ok(0),
            Err(rusb::Error::Pipe) => {
                tracing::debug!("Endpoint {EP_IN:#04x} stalled, clearing");
                if self.clear_stall(EP_IN).is_err() {
                    return Err(TransportError::SevereStall(EP_IN));
                }
                match self.handle.read_bulk(EP_IN, buf, READ_TIMEOUT) {
                    Ok(n) => Ok(n),
                    Err(rusb::Error::Timeout) => Ok(0),
                    Err(rusb::Error::Pipe) => Err(TransportError::SevereStall(EP_IN)),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        tracing::trace!("Writing {data:02x?}");
        let mut written = 0;
        for packet in data.chunks(BULK_PACKET_SIZE) {
            let n = self.write_packet(packet)?;
            if n != packet.len() {
                return Err(TransportError::ShortWrite(written + n, data.len()));
            }
            written += n;
            std::thread::sleep(INTER_PACKET_PAUSE);
        }
        Ok(written)
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        // Bulk writes hit the wire per transfer; nothing to flush.
        Ok(())
    }

    fn unit(&self) -> usize {
        BULK_PACKET_SIZE
    }

    fn describe(&self) -> String {
        format!("USB device {}", self.location)
    }
}
