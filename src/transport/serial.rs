//! CDC-ACM serial transport: 115200 8N1, short read timeout.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::SerialPort;

use super::{Transport, TransportError};

const BAUD_RATE: u32 = 115_200;

/// Short enough that the reader task idles between device bursts, long
/// enough to never split one mid-burst.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Kernel serial stacks differ wildly in how much they take per write.
const fn write_unit() -> usize {
    if cfg!(windows) {
        10240
    } else if cfg!(target_os = "macos") {
        384
    } else {
        512
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(name: &str) -> Result<Self, serialport::Error> {
        let port = serialport::new(name, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(READ_TIMEOUT)
            .open()?;
        Ok(Self {
            port,
            name: name.to_owned(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => {
                if n > 0 {
                    tracing::trace!("Read {:02x?}", &buf[..n]);
                }
                Ok(n)
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        tracing::trace!("Writing {data:02x?}");
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(data.len())
    }

    fn drain(&mut self) -> Result<(), TransportError> {
        self.port.flush()?;
        Ok(())
    }

    fn unit(&self) -> usize {
        write_unit()
    }

    fn describe(&self) -> String {
        format!("serial port {}", self.name)
    }
}
