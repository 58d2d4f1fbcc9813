//! Inbound record parsing.
//!
//! The BootROM speaks colon-delimited text records over the same pipe that
//! carries one-byte control tokens. This module is the single place that
//! maps raw record bytes to a typed message.
//!
//! Observed record shapes:
//!
//! ```text
//! exynos_usb_booting::09845001cddf16d00bd4
//! eub:req:09845001:DPM
//! eub:ack:09845001:DPM
//! irom_booting_failure:_:<NUL-joined 15-frame trace>
//! bl1 header fail
//! C
//! ```

/// One-byte tokens the device emits between (or instead of) text records.
/// 0x0F and 0x2B show up in historical captures and are treated as benign.
pub const CONTROL_TOKENS: &[u8] = &[b'C', 0x00, 0x06, 0x15, 0x1B, 0x0F, 0x2B];

const HEADER_FAIL_SUFFIX: &str = " header fail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A lone control byte ('C', NUL, ACK, NAK, ESC, ...).
    Control(u8),
    /// `exynos_usb_booting::<device-id>` — the device announcing itself.
    Booting { device: String },
    /// `eub:req:<id>:<TOKEN>` — the device asking for a bootloader stage.
    Request { device: String, token: String },
    /// `eub:ack:<id>:<TOKEN>` — the device accepting a delivered stage.
    Acked { device: String, token: String },
    /// `eub:nak:<id>:<TOKEN>` — the device refusing a delivered stage.
    Refused { device: String, token: String },
    /// `irom_booting_failure:_:<trace>` — a BootROM failure backtrace.
    Failure { trace: Vec<String> },
    /// `error:<kind>:<detail>`, including the rewritten legacy
    /// "`<name> header fail`" form.
    Fault { kind: String, detail: String },
    /// Anything the tokenizer does not recognize.
    Unknown { line: String },
}

impl Message {
    /// Parses one framed record. Records are at most four ':'-separated
    /// fields {command, sub, device, argument}; absent fields are empty.
    pub fn parse(record: &[u8]) -> Self {
        if record.len() == 1 && CONTROL_TOKENS.contains(&record[0]) {
            return Message::Control(record[0]);
        }

        let line = String::from_utf8_lossy(record).into_owned();
        let mut fields = line.splitn(4, ':');
        let command = fields.next().unwrap_or_default().to_owned();
        let sub = fields.next().unwrap_or_default().to_owned();
        let device = fields.next().unwrap_or_default().to_owned();
        let argument = fields.next().unwrap_or_default().to_owned();

        // Early BootROMs report a bad header as "<name> header fail" with no
        // field separators at all.
        if let Some(prefix) = command.strip_suffix(HEADER_FAIL_SUFFIX) {
            return Message::Fault {
                kind: "header fail".to_owned(),
                detail: prefix.to_owned(),
            };
        }

        match command.as_str() {
            "exynos_usb_booting" => Message::Booting { device },
            "eub" => {
                let token = argument.to_ascii_uppercase();
                match sub.as_str() {
                    "req" => Message::Request { device, token },
                    "ack" => Message::Acked { device, token },
                    "nak" => Message::Refused { device, token },
                    _ => Message::Unknown { line },
                }
            }
            "irom_booting_failure" => Message::Failure {
                trace: split_trace(&device),
            },
            "error" => Message::Fault {
                kind: sub,
                detail: argument,
            },
            _ => Message::Unknown { line },
        }
    }
}

/// Splits a NUL-joined failure trace, dropping the empty prefix and suffix
/// the BootROM wraps it in.
fn split_trace(raw: &str) -> Vec<String> {
    let mut frames: Vec<String> = raw.split('\0').map(str::to_owned).collect();
    if frames.first().is_some_and(String::is_empty) {
        frames.remove(0);
    }
    if frames.last().is_some_and(String::is_empty) {
        frames.pop();
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request() {
        let msg = Message::parse(b"eub:req:09845001:DPM");
        assert_eq!(
            msg,
            Message::Request {
                device: "09845001".to_owned(),
                token: "DPM".to_owned(),
            }
        );
    }

    #[test]
    fn request_token_is_uppercased() {
        let msg = Message::parse(b"eub:req:09845001:bl2b");
        match msg {
            Message::Request { token, .. } => assert_eq!(token, "BL2B"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_ack_and_nak() {
        assert!(matches!(
            Message::parse(b"eub:ack:09845001:BL1"),
            Message::Acked { .. }
        ));
        assert!(matches!(
            Message::parse(b"eub:nak:09845001:BL1"),
            Message::Refused { .. }
        ));
    }

    #[test]
    fn unknown_eub_sub_is_unknown() {
        assert!(matches!(
            Message::parse(b"eub:huh:x:y"),
            Message::Unknown { .. }
        ));
    }

    #[test]
    fn parses_booting_announcement() {
        let msg = Message::parse(b"exynos_usb_booting::09845001cddf16d00bd4");
        assert_eq!(
            msg,
            Message::Booting {
                device: "09845001cddf16d00bd4".to_owned(),
            }
        );
    }

    #[test]
    fn rewrites_legacy_header_fail() {
        let msg = Message::parse(b"bl1 header fail");
        assert_eq!(
            msg,
            Message::Fault {
                kind: "header fail".to_owned(),
                detail: "bl1".to_owned(),
            }
        );
    }

    #[test]
    fn parses_error_record() {
        let msg = Message::parse(b"error:timeout:BL2");
        assert_eq!(
            msg,
            Message::Fault {
                kind: "timeout".to_owned(),
                detail: "BL2".to_owned(),
            }
        );
    }

    #[test]
    fn control_bytes_are_control_messages() {
        for byte in [b'C', 0x00, 0x06, 0x15, 0x1B, 0x0F, 0x2B] {
            assert_eq!(Message::parse(&[byte]), Message::Control(byte));
        }
    }

    #[test]
    fn failure_trace_drops_empty_prefix_and_suffix() {
        let mut record = b"irom_booting_failure:_:".to_vec();
        for frame in ["", "A", "B", "C", ""] {
            record.extend_from_slice(frame.as_bytes());
            record.push(0);
        }
        record.pop();
        let msg = Message::parse(&record);
        assert_eq!(
            msg,
            Message::Failure {
                trace: vec!["A".to_owned(), "B".to_owned(), "C".to_owned()],
            }
        );
    }

    #[test]
    fn unrecognized_line_is_unknown() {
        let msg = Message::parse(b"wat:is:this");
        assert_eq!(
            msg,
            Message::Unknown {
                line: "wat:is:this".to_owned(),
            }
        );
    }
}
