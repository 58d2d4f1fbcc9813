//! Session configuration, fixed at startup.
//!
//! Everything a session needs to answer requests lives here: the per-token
//! image paths, the header split size, the download opcode and CRC override,
//! and the behavioral flags. Constructed once from the CLI and passed by
//! reference; nothing mutates it afterwards.

use std::path::PathBuf;

use crate::args::{CliArgs, TransportMode};
use crate::dnw;
use crate::images::ImageKind;
use crate::registry::UsbId;

/// The VID:PID a Tensor BootROM enumerates with.
pub const DEFAULT_ID: UsbId = UsbId {
    vid: 0x18D1,
    pid: 0x4F00,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("header size must be a positive number, got {0}")]
    HeaderNotPositive(i64),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub src: PathBuf,
    pub bl1: PathBuf,
    pub pbl: PathBuf,
    pub bl2: PathBuf,
    pub abl: PathBuf,
    pub bl31: PathBuf,
    pub gcf: PathBuf,
    pub gsa: PathBuf,
    pub gsaf: PathBuf,
    pub tzsw: PathBuf,
    pub ldfw: PathBuf,
    pub dpm: Option<PathBuf>,

    pub header: usize,
    /// Opcode written ahead of each upload; empty means raw continuation.
    pub address: Vec<u8>,
    pub crc: Option<[u8; 2]>,
    pub usb_boot: bool,
    pub fuzz_dpm: bool,
    pub stop: bool,
    pub wait_ack: bool,
    pub stop_on_error: bool,
    pub transport: TransportMode,
    pub devices: Vec<UsbId>,
}

impl Config {
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        if args.header <= 0 {
            return Err(ConfigError::HeaderNotPositive(args.header));
        }

        let mut devices = vec![DEFAULT_ID];
        for id in &args.devices {
            if !devices.contains(id) {
                devices.push(*id);
            }
        }

        Ok(Self {
            src: args.src.clone(),
            bl1: args.bl1.clone(),
            pbl: args.pbl.clone(),
            bl2: args.bl2.clone(),
            abl: args.abl.clone(),
            bl31: args.bl31.clone(),
            gcf: args.gcf.clone(),
            gsa: args.gsa.clone(),
            gsaf: args.gsaf.clone(),
            tzsw: args.tzsw.clone(),
            ldfw: args.ldfw.clone(),
            dpm: args.dpm.clone(),
            header: args.header as usize,
            address: args
                .address
                .clone()
                .map(|bytes| bytes.0)
                .unwrap_or_else(|| dnw::OP_DNW.to_vec()),
            crc: args.crc,
            usb_boot: args.usb_boot,
            fuzz_dpm: args.fuzz_dpm,
            stop: args.stop,
            wait_ack: args.wait_ack,
            stop_on_error: args.stop_on_error,
            transport: args.transport,
            devices,
        })
    }

    pub fn image_path(&self, kind: ImageKind) -> PathBuf {
        match kind {
            ImageKind::Bl1 => self.bl1.clone(),
            ImageKind::Dpm => self.dpm.clone().unwrap_or_default(),
            ImageKind::Pbl => self.pbl.clone(),
            ImageKind::Bl2 => self.bl2.clone(),
            ImageKind::Gsa => self.gsa.clone(),
            ImageKind::Abl => self.abl.clone(),
            ImageKind::Tzsw => self.tzsw.clone(),
            ImageKind::Ldfw => self.ldfw.clone(),
            ImageKind::Bl31 => self.bl31.clone(),
            ImageKind::Gcf => self.gcf.clone(),
            ImageKind::Gsaf => self.gsaf.clone(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A config pointing nowhere, for exercising sessions against scripted
    /// transports.
    pub(crate) fn bare_config() -> Config {
        Config {
            src: PathBuf::new(),
            bl1: PathBuf::new(),
            pbl: PathBuf::new(),
            bl2: PathBuf::new(),
            abl: PathBuf::new(),
            bl31: PathBuf::new(),
            gcf: PathBuf::new(),
            gsa: PathBuf::new(),
            gsaf: PathBuf::new(),
            tzsw: PathBuf::new(),
            ldfw: PathBuf::new(),
            dpm: None,
            header: 4096,
            address: crate::dnw::OP_DNW.to_vec(),
            crc: None,
            usb_boot: false,
            fuzz_dpm: false,
            stop: false,
            wait_ack: false,
            stop_on_error: false,
            transport: TransportMode::Auto,
            devices: vec![DEFAULT_ID],
        }
    }
}
