//! Outbound DNW command framing.
//!
//! The BootROM accepts binary "download" commands framed as
//! `ESC "DNW" <length:u32 LE> <payload> <crc:u16 LE>`, where the length
//! field counts the opcode, itself, the payload and the CRC. A command with
//! an empty opcode is a raw continuation: the payload goes out verbatim.

/// The canonical DNW opcode, also the default download address.
pub const OP_DNW: &[u8] = &[0x1B, b'D', b'N', b'W'];

/// Terminal STOP pattern: a zeroed argument in place of the length, a
/// two-byte `01 00` payload, and no CRC.
pub const STOP: Command<'static> = Command {
    opcode: OP_DNW,
    arg: Some([0, 0, 0, 0]),
    data: &[0x01, 0x00],
    crc: None,
};

/// A single outbound command ready for encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command<'a> {
    /// Opcode bytes; empty means raw continuation.
    pub opcode: &'a [u8],
    /// When set, written verbatim in place of the computed length field.
    pub arg: Option<[u8; 4]>,
    pub data: &'a [u8],
    pub crc: Option<[u8; 2]>,
}

impl<'a> Command<'a> {
    /// A download command carrying `data` with a computed or overridden CRC.
    pub fn download(opcode: &'a [u8], data: &'a [u8], crc: Option<[u8; 2]>) -> Self {
        Self {
            opcode,
            arg: None,
            data,
            crc: Some(crc.unwrap_or_else(|| checksum(data))),
        }
    }

    /// A raw continuation: no opcode, no length field, no CRC.
    pub fn raw(data: &'a [u8]) -> Self {
        Self {
            opcode: &[],
            arg: None,
            data,
            crc: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        if self.opcode.is_empty() {
            return self.data.to_vec();
        }

        let crc_len = self.crc.map_or(0, |crc| crc.len());
        let length = (4 + 4 + self.data.len() + crc_len) as u32;

        let mut out = Vec::with_capacity(8 + self.data.len() + crc_len);
        out.extend_from_slice(self.opcode);
        match self.arg {
            Some(arg) => out.extend_from_slice(&arg),
            None => out.extend_from_slice(&length.to_le_bytes()),
        }
        out.extend_from_slice(self.data);
        if let Some(crc) = self.crc {
            out.extend_from_slice(&crc);
        }
        out
    }
}

/// 16-bit little-endian sum of the data bytes, truncated to 16 bits.
pub fn checksum(data: &[u8]) -> [u8; 2] {
    let mut sum = 0u16;
    for byte in data {
        sum = sum.wrapping_add(u16::from(*byte));
    }
    sum.to_le_bytes()
}
