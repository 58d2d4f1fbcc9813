use std::path::PathBuf;

use crate::registry::UsbId;

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportMode {
    /// CDC-ACM serial port (the usual EUB binding)
    Serial,
    /// Raw bulk USB endpoints (some silicon enumerates this way)
    Usb,
    /// Try serial first, then bulk USB
    Auto,
}

/// Serves bootloader images to a Google Pixel held in Exynos USB Boot mode,
/// answering each staged request the BootROM emits until the device boots.
#[derive(clap::Parser)]
#[command(version)]
pub struct CliArgs {
    /// Optional log level, can also be set by the "TENSORDL_TRACE" environment variable. If both are specified, the environment variable is preferred.
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Directory with bootloader images to serve; image paths are tried here first, then as given
    #[arg(short = 'i', long, default_value = "sources")]
    pub src: PathBuf,

    /// BL1 image to serve
    #[arg(short = '1', long, default_value = "bl1.img")]
    pub bl1: PathBuf,

    /// PBL image to serve
    #[arg(short = 'p', long, default_value = "pbl.img")]
    pub pbl: PathBuf,

    /// BL2 image to serve
    #[arg(short = '2', long, default_value = "bl2.img")]
    pub bl2: PathBuf,

    /// ABL image to serve
    #[arg(short = 'a', long, default_value = "abl.img")]
    pub abl: PathBuf,

    /// BL31 image to serve
    #[arg(short = '3', long, default_value = "bl31.img")]
    pub bl31: PathBuf,

    /// GCF image to serve (not all devices ask for it)
    #[arg(short = 'F', long, default_value = "gcf.img")]
    pub gcf: PathBuf,

    /// GSA image to serve
    #[arg(short = 'g', long, default_value = "gsa.img")]
    pub gsa: PathBuf,

    /// GSAF image to serve (not all devices ask for it)
    #[arg(short = 'G', long, default_value = "gsaf.img")]
    pub gsaf: PathBuf,

    /// TZSW (TrustZone SoftWare) image to serve
    #[arg(short = 't', long, default_value = "tzsw.img")]
    pub tzsw: PathBuf,

    /// LDFW (LoaDable FirmWare) image to serve
    #[arg(short = 'l', long, default_value = "ldfw.img")]
    pub ldfw: PathBuf,

    /// DPM image to serve instead of a zeroed 12 KiB blob
    #[arg(short = 'd', long)]
    pub dpm: Option<PathBuf>,

    /// Number of bytes to interpret as header for splittable images
    #[arg(long, default_value_t = 4096)]
    pub header: i64,

    /// Target download address (or command) to write to, as hex bytes
    #[arg(long, value_parser = parse_hex_bytes)]
    pub address: Option<HexBytes>,

    /// Overrides the calculated CRC when writing DNW commands (2 hex bytes)
    #[arg(short = 'c', long, value_parser = parse_hex_crc)]
    pub crc: Option<[u8; 2]>,

    /// Sets the USB-bootable flag byte in loaded image headers if it is clear
    #[arg(long)]
    pub usb_boot: bool,

    /// (DANGEROUS!) Fuzzes an absent DPM image with fresh random data per request
    #[arg(long)]
    pub fuzz_dpm: bool,

    /// Sends the DNW STOP command to the device upon connection
    #[arg(long)]
    pub stop: bool,

    /// Waits for the device to ack each uploaded image before serving the next cue
    #[arg(long)]
    pub wait_ack: bool,

    /// Attempts a STOP command before disconnecting after a write failure
    #[arg(long)]
    pub stop_on_error: bool,

    /// Which transport binding to use when scanning for devices
    #[arg(long, value_enum, default_value = "auto")]
    pub transport: TransportMode,

    /// Additional VID:PID pair to scan for, e.g. 18d1:4f00. May be repeated.
    #[arg(long = "device", value_parser = parse_usb_id)]
    pub devices: Vec<UsbId>,

    /// Print the current device enumeration snapshot and exit
    #[arg(long)]
    pub detect: bool,
}

/// An arbitrary byte string given on the command line as hex digits.
/// (A bare `Vec<u8>` would be taken by clap as a repeated byte argument.)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

fn parse_hex_bytes(input: &str) -> Result<HexBytes, String> {
    let input = input.strip_prefix("0x").unwrap_or(input);
    if input.len() % 2 != 0 {
        return Err("hex byte string must have an even number of digits".to_owned());
    }
    (0..input.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&input[i..i + 2], 16)
                .map_err(|_| format!("invalid hex byte '{}'", &input[i..i + 2]))
        })
        .collect::<Result<Vec<u8>, String>>()
        .map(HexBytes)
}

fn parse_hex_crc(input: &str) -> Result<[u8; 2], String> {
    let HexBytes(bytes) = parse_hex_bytes(input)?;
    bytes
        .try_into()
        .map_err(|_| "CRC override must be exactly 2 bytes".to_owned())
}

fn parse_usb_id(input: &str) -> Result<UsbId, String> {
    let (vid, pid) = input
        .split_once(':')
        .ok_or_else(|| format!("expected VID:PID, got '{input}'"))?;
    let vid = u16::from_str_radix(vid.strip_prefix("0x").unwrap_or(vid), 16)
        .map_err(|_| format!("invalid vendor id '{vid}'"))?;
    let pid = u16::from_str_radix(pid.strip_prefix("0x").unwrap_or(pid), 16)
        .map_err(|_| format!("invalid product id '{pid}'"))?;
    Ok(UsbId { vid, pid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_bytes_with_and_without_prefix() {
        assert_eq!(
            parse_hex_bytes("1b444e57").unwrap(),
            HexBytes(vec![0x1B, 0x44, 0x4E, 0x57])
        );
        assert_eq!(parse_hex_bytes("0xFFFF").unwrap(), HexBytes(vec![0xFF, 0xFF]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn crc_must_be_two_bytes() {
        assert_eq!(parse_hex_crc("dead").unwrap(), [0xDE, 0xAD]);
        assert!(parse_hex_crc("deadbe").is_err());
    }

    #[test]
    fn usb_id_parses_both_radix_styles() {
        assert_eq!(parse_usb_id("18d1:4f00").unwrap(), UsbId { vid: 0x18D1, pid: 0x4F00 });
        assert_eq!(parse_usb_id("0x04e8:0x1234").unwrap(), UsbId { vid: 0x04E8, pid: 0x1234 });
        assert!(parse_usb_id("18d1").is_err());
    }
}
