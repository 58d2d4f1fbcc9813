//! Device discovery and single-claim bookkeeping.
//!
//! Candidate devices are serial ports whose underlying USB identity matches
//! a configured VID:PID pair, or raw USB devices matching the same pairs.
//! A process-wide claim table guarantees at most one session per device;
//! claims release when their guard drops, which covers both orderly close
//! and a session dying on unplug.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serialport::SerialPortType;

use crate::args::TransportMode;
use crate::config::Config;
use crate::transport::serial::SerialTransport;
use crate::transport::usb::UsbTransport;
use crate::transport::Transport;

static CLAIMS: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl std::fmt::Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("no matching device found")]
    NoDevice,
    #[error("every matching device is already claimed")]
    ClaimConflict,
}

/// Releases its claim-table entry on drop.
pub struct Claim {
    key: String,
}

impl Claim {
    fn take(key: String) -> Option<Self> {
        let mut claims = CLAIMS.lock().unwrap();
        if !claims.insert(key.clone()) {
            return None;
        }
        Some(Self { key })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        CLAIMS.lock().unwrap().remove(&self.key);
    }
}

/// An opened transport together with its claim.
pub struct Claimed {
    pub transport: Box<dyn Transport>,
    _claim: Claim,
}

/// One row of the enumeration snapshot, for `--detect`.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub id: UsbId,
    pub detail: String,
}

/// The current enumeration snapshot over both transports.
pub fn scan(config: &Config) -> Vec<Discovered> {
    let mut found = Vec::new();

    for (name, id) in matching_ports(config) {
        found.push(Discovered {
            id,
            detail: format!("serial port {name}"),
        });
    }

    for (device, id) in matching_usb_devices(config) {
        found.push(Discovered {
            id,
            detail: format!(
                "USB device {:03}:{:03}",
                device.bus_number(),
                device.address()
            ),
        });
    }

    found
}

/// Opens the first unowned matching device, honoring the transport mode.
pub fn acquire(config: &Config) -> Result<Claimed, AcquireError> {
    match config.transport {
        TransportMode::Serial => acquire_serial(config),
        TransportMode::Usb => acquire_usb(config),
        TransportMode::Auto => acquire_serial(config).or_else(|serial_err| {
            acquire_usb(config).map_err(|usb_err| match (serial_err, usb_err) {
                (AcquireError::ClaimConflict, _) | (_, AcquireError::ClaimConflict) => {
                    AcquireError::ClaimConflict
                }
                _ => AcquireError::NoDevice,
            })
        }),
    }
}

fn acquire_serial(config: &Config) -> Result<Claimed, AcquireError> {
    let mut saw_claimed = false;

    for (name, id) in matching_ports(config) {
        let Some(claim) = Claim::take(name.clone()) else {
            saw_claimed = true;
            continue;
        };

        match SerialTransport::open(&name) {
            Ok(transport) => {
                tracing::debug!("Opened {name} ({id})");
                return Ok(Claimed {
                    transport: Box::new(transport),
                    _claim: claim,
                });
            }
            Err(err) => {
                tracing::debug!("Failed to open {name}: {err}");
            }
        }
    }

    Err(if saw_claimed {
        AcquireError::ClaimConflict
    } else {
        AcquireError::NoDevice
    })
}

fn acquire_usb(config: &Config) -> Result<Claimed, AcquireError> {
    let mut saw_claimed = false;

    for (device, id) in matching_usb_devices(config) {
        let key = format!("usb:{:03}:{:03}", device.bus_number(), device.address());
        let Some(claim) = Claim::take(key.clone()) else {
            saw_claimed = true;
            continue;
        };

        match UsbTransport::open(&device) {
            Ok(transport) => {
                tracing::debug!("Opened {key} ({id})");
                return Ok(Claimed {
                    transport: Box::new(transport),
                    _claim: claim,
                });
            }
            Err(err) => {
                tracing::debug!("Failed to open {key}: {err}");
            }
        }
    }

    Err(if saw_claimed {
        AcquireError::ClaimConflict
    } else {
        AcquireError::NoDevice
    })
}

fn matching_ports(config: &Config) -> Vec<(String, UsbId)> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(err) => {
            tracing::debug!("Failed to enumerate serial ports: {err}");
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .filter_map(|port| {
            let SerialPortType::UsbPort(info) = port.port_type else {
                return None;
            };
            let id = UsbId {
                vid: info.vid,
                pid: info.pid,
            };
            config
                .devices
                .contains(&id)
                .then_some((port.port_name, id))
        })
        .collect()
}

fn matching_usb_devices(config: &Config) -> Vec<(rusb::Device<rusb::GlobalContext>, UsbId)> {
    let devices = match rusb::devices() {
        Ok(devices) => devices,
        Err(err) => {
            tracing::debug!("Failed to iterate USB devices: {err}");
            return Vec::new();
        }
    };

    devices
        .iter()
        .filter_map(|device| {
            let descriptor = device.device_descriptor().ok()?;
            let id = UsbId {
                vid: descriptor.vendor_id(),
                pid: descriptor.product_id(),
            };
            config.devices.contains(&id).then_some((device, id))
        })
        .collect()
}
