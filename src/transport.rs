//! Byte transports underneath the EUB protocol.
//!
//! The BootROM shows up either as a CDC-ACM serial port or, on some
//! silicon, as a raw bulk-transfer USB device. Both speak the same protocol
//! once framing is accounted for, so everything above this layer is
//! transport-oblivious.

pub mod serial;
pub mod usb;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("USB transfer failed: {0}")]
    Usb(#[from] rusb::Error),
    #[error("device only accepted {0} out of {1} bytes")]
    ShortWrite(usize, usize),
    #[error("endpoint {0:#04x} still halted after clearing its stall")]
    SevereStall(u8),
}

/// Uniform byte-pipe contract for both transport variants.
///
/// `read` uses a short timeout and reports it as zero bytes, never as an
/// error, so callers can poll without losing their place. `write` returns
/// only once the bytes are handed to the kernel and flushed.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;
    fn drain(&mut self) -> Result<(), TransportError>;
    /// Preferred write chunk size for this pipe.
    fn unit(&self) -> usize;
    fn describe(&self) -> String;
}
