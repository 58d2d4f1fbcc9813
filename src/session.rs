//! One connection to a device in EUB mode, from first record to disconnect.
//!
//! Two tasks cooperate per session: a reader thread that blocks on the
//! transport (short timeout) and feeds the byte queue, and the session loop
//! here, which drains the queue through the framer and performs every
//! write. A single mutex serializes transport access; the serial line is
//! half duplex and overlapping a read with an upload corrupts both.
//!
//! The device drives the pace. It asks for a stage (`eub:req`), then emits
//! a one-byte `C` cue when it is ready to receive; exactly one image goes
//! out per armed cue, which is what keeps a retransmitted request from
//! double-writing a stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use indicatif::{ProgressBar, ProgressState, ProgressStyle};

use crate::config::Config;
use crate::dnw::{self, Command};
use crate::framer::{ByteQueue, Frame, LineFramer};
use crate::images::Catalog;
use crate::message::Message;
use crate::transport::{Transport, TransportError};

/// Uploads past this size get a progress bar; serial at 115200 is slow.
const PROGRESS_THRESHOLD: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// How long one poll of the byte queue waits before rechecking.
const POLL_WAIT: std::time::Duration = std::time::Duration::from_millis(200);

type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

enum End {
    Disconnected,
    ReadFailed(TransportError),
    WriteFailed(TransportError),
}

/// Drives one session until the device disconnects or the transport dies.
///
/// `last_sent` outlives the session on purpose: a BootROM failure trace
/// arriving right after a reconnect should still name the stage that
/// caused it.
pub fn serve(
    transport: Box<dyn Transport>,
    config: &Config,
    catalog: &Catalog,
    last_sent: &mut Option<String>,
) -> Result<(), TransportError> {
    let transport: SharedTransport = Arc::new(Mutex::new(transport));
    let queue = ByteQueue::new();
    let stop = Arc::new(AtomicBool::new(false));
    let read_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

    // A lone LF coaxes the device into sending its first record.
    send_frame(&transport, b"\n")?;

    if config.stop {
        tracing::info!("Sending stop command unconditionally");
        send_frame(&transport, &dnw::STOP.encode())?;
    }

    let reader = spawn_reader(
        transport.clone(),
        queue.clone(),
        stop.clone(),
        read_error.clone(),
    );

    let mut session = Session {
        transport: &transport,
        config,
        catalog,
        last_sent,
        request: None,
        upload: false,
        awaiting_ack: None,
        last_trace: None,
        identity: None,
    };

    let mut framer = LineFramer::new(queue.clone());
    let mut last_message: Option<Message> = None;

    let end = loop {
        match framer.next_record(POLL_WAIT) {
            Frame::Pending => continue,
            Frame::Closed => match read_error.lock().unwrap().take() {
                Some(err) => break End::ReadFailed(err),
                None => break End::Disconnected,
            },
            Frame::Record(record) => {
                let message = Message::parse(&record);
                if let Err(err) = session.handle(&message) {
                    break End::WriteFailed(err);
                }
                last_message = Some(message);
            }
        }
    };

    stop.store(true, Ordering::Relaxed);
    queue.close();
    let _ = reader.join();

    match end {
        End::Disconnected => {
            tracing::info!("Device disconnected!");
            Ok(())
        }
        End::ReadFailed(err) => {
            if let Some(message) = &last_message {
                tracing::debug!("Last message from device: {message:?}");
            }
            Err(err)
        }
        End::WriteFailed(err) => {
            if let Some(message) = &last_message {
                tracing::debug!("Last message from device: {message:?}");
            }
            if config.stop_on_error {
                tracing::info!("Attempting stop command before disconnecting");
                if let Err(stop_err) = send_frame(&transport, &dnw::STOP.encode()) {
                    tracing::debug!("Stop command failed: {stop_err}");
                }
            }
            Err(err)
        }
    }
}

fn spawn_reader(
    transport: SharedTransport,
    queue: ByteQueue,
    stop: Arc<AtomicBool>,
    read_error: Arc<Mutex<Option<TransportError>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let result = transport.lock().unwrap().read(&mut buf);
            match result {
                Ok(0) => continue,
                Ok(n) => queue.push(&buf[..n]),
                Err(err) => {
                    *read_error.lock().unwrap() = Some(err);
                    break;
                }
            }
        }
        queue.close();
    })
}

struct Session<'a> {
    transport: &'a SharedTransport,
    config: &'a Config,
    catalog: &'a Catalog,
    last_sent: &'a mut Option<String>,
    /// Last token the device asked for.
    request: Option<String>,
    /// Armed by a request or an ack; consumed by the next `C` cue.
    upload: bool,
    /// With `--wait-ack`, the token whose ack we are still owed.
    awaiting_ack: Option<String>,
    /// Last failure trace, for deduplicating the device's retransmissions.
    last_trace: Option<Vec<String>>,
    identity: Option<String>,
}

impl Session<'_> {
    fn handle(&mut self, message: &Message) -> Result<(), TransportError> {
        match message {
            Message::Control(b'C') => return self.serve_cue(),
            Message::Control(byte) => tracing::trace!("Received control: {byte:#04x}"),
            Message::Booting { device } => {
                if self.identity.as_deref() != Some(device.as_str()) {
                    tracing::debug!("Device identified as {device}");
                    self.identity = Some(device.clone());
                }
            }
            Message::Request { token, .. } => {
                if self.request.as_deref() == Some(token.as_str()) {
                    tracing::trace!("Received duplicate bootloader request");
                } else {
                    tracing::info!("Requested {token}");
                    self.request = Some(token.clone());
                    self.upload = true;
                }
            }
            Message::Acked { token, .. } => {
                tracing::debug!("Acknowledged {token}");
                if self.awaiting_ack.as_deref() == Some(token.as_str()) {
                    self.awaiting_ack = None;
                }
                self.upload = true;
            }
            Message::Refused { token, .. } => {
                tracing::error!("Refused {token}");
                if self.awaiting_ack.as_deref() == Some(token.as_str()) {
                    self.awaiting_ack = None;
                }
            }
            Message::Failure { trace } => {
                self.report_failure(trace);
            }
            Message::Fault { kind, detail } => tracing::error!("{kind}: {detail}"),
            Message::Unknown { line } => tracing::error!("Unhandled message: {line}"),
        }
        Ok(())
    }

    /// The device's "begin upload" cue. Exactly one image per armed cue.
    fn serve_cue(&mut self) -> Result<(), TransportError> {
        if !self.upload {
            tracing::trace!("Not allowed to upload right now");
            return Ok(());
        }
        self.upload = false;

        if let Some(pending) = &self.awaiting_ack {
            tracing::debug!("Holding upload until {pending} is acknowledged");
            return Ok(());
        }

        let Some(token) = self.request.clone() else {
            tracing::trace!("Upload cue with no pending request");
            return Ok(());
        };

        let data = match self.catalog.resolve(&token) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("{err}");
                return Ok(());
            }
        };

        tracing::info!("> {token}");

        let frame = if self.config.address.is_empty() {
            Command::raw(&data).encode()
        } else {
            let crc = self.config.crc.unwrap_or_else(|| dnw::checksum(&data));
            match self.config.crc {
                Some(_) => tracing::trace!("Used checksum override: {crc:02X?}"),
                None => tracing::trace!("Calculated checksum: {crc:02X?}"),
            }
            Command::download(&self.config.address, &data, Some(crc)).encode()
        };

        send_frame(self.transport, &frame)?;

        tracing::info!("Sent {token} ({} bytes)", data.len());
        *self.last_sent = Some(token.clone());
        if self.config.wait_ack {
            self.awaiting_ack = Some(token);
        }
        Ok(())
    }

    /// Prints one framed report per distinct trace; the BootROM repeats
    /// the same backtrace until it gives up or re-requests.
    fn report_failure(&mut self, trace: &[String]) -> bool {
        if self.last_trace.as_deref() == Some(trace) {
            tracing::trace!("Received duplicate failure trace");
            return false;
        }
        self.last_trace = Some(trace.to_vec());

        let mut report = String::from("BootROM error booting");
        if let Some(sent) = self.last_sent.as_deref() {
            report.push(' ');
            report.push_str(sent);
        }
        report.push(':');
        for frame in trace {
            report.push_str("\n> ");
            report.push_str(frame);
        }
        tracing::error!("{report}");
        true
    }
}

/// Writes one protocol frame in transport-sized chunks while holding the
/// session's transport lock, so no read can interleave with the upload.
fn send_frame(transport: &SharedTransport, frame: &[u8]) -> Result<(), TransportError> {
    let mut transport = transport.lock().unwrap();
    let unit = transport.unit();

    let progress = (frame.len() > PROGRESS_THRESHOLD).then(|| progress_bar(frame.len() as u64));

    let mut sent = 0usize;
    for chunk in frame.chunks(unit) {
        let n = transport.write(chunk)?;
        if n != chunk.len() {
            return Err(TransportError::ShortWrite(sent + n, frame.len()));
        }
        sent += n;
        if let Some(bar) = progress.as_ref() {
            bar.set_position(sent as u64);
        }
    }
    transport.drain()?;

    if let Some(bar) = progress.as_ref() {
        bar.finish_and_clear();
    }
    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("[{elapsed_precise}] [{wide_bar}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| {
                write!(w, "{:.1}s", state.eta().as_secs_f64()).unwrap()
            })
            .progress_chars("#>-"),
    );
    bar
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::test_support::bare_config;
    use crate::images::ImageKind;

    /// Replays a canned inbound byte stream, capturing everything written.
    /// Once the script runs dry the next read fails, which is how a real
    /// unplug surfaces.
    struct ScriptTransport {
        reads: VecDeque<Vec<u8>>,
        writes: Arc<Mutex<Vec<u8>>>,
    }

    impl Transport for ScriptTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            match self.reads.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "script exhausted",
                ))),
            }
        }

        fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.writes.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn drain(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn unit(&self) -> usize {
            512
        }

        fn describe(&self) -> String {
            "scripted transport".to_owned()
        }
    }

    fn run(script: &[&[u8]], config: &Config, catalog: &Catalog) -> (Vec<u8>, Option<String>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptTransport {
            reads: script.iter().map(|chunk| chunk.to_vec()).collect(),
            writes: writes.clone(),
        };
        let mut last_sent = None;
        // The script always ends in a read failure; that is the expected
        // way for a session to end.
        let _ = serve(Box::new(transport), config, catalog, &mut last_sent);
        let written = writes.lock().unwrap().clone();
        (written, last_sent)
    }

    fn download_frame(data: &[u8]) -> Vec<u8> {
        Command::download(dnw::OP_DNW, data, None).encode()
    }

    #[test]
    fn zeroed_dpm_round_trip() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![]);
        let (written, last_sent) = run(&[b"eub:req:ABCD:DPM\nC\n"], &config, &catalog);

        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&download_frame(&vec![0u8; 12288]));
        assert_eq!(written, expected);
        assert_eq!(last_sent.as_deref(), Some("DPM"));
    }

    #[test]
    fn bl2_head_then_body() {
        let image: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl2, image.clone())]);

        let (written, last_sent) = run(
            &[b"eub:req:_:BL2\nC\n", b"eub:req:_:BL2B\nC\n"],
            &config,
            &catalog,
        );

        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&download_frame(&image[..4096]));
        expected.extend_from_slice(&download_frame(&image[4096..]));
        assert_eq!(written, expected);
        assert_eq!(last_sent.as_deref(), Some("BL2B"));
    }

    #[test]
    fn duplicate_request_uploads_once() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl1, vec![5u8; 64])]);

        // The device retransmits its request, then cues twice; only the
        // first armed cue may upload.
        let (written, _) = run(
            &[b"eub:req:_:BL1\neub:req:_:BL1\nC\nC\n"],
            &config,
            &catalog,
        );

        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&download_frame(&[5u8; 64]));
        assert_eq!(written, expected);
    }

    #[test]
    fn cue_without_request_uploads_nothing() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![]);
        let (written, last_sent) = run(&[b"C\nC\n"], &config, &catalog);
        assert_eq!(written, b"\n");
        assert_eq!(last_sent, None);
    }

    #[test]
    fn unknown_token_sends_no_response() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![]);
        let (written, last_sent) = run(&[b"eub:req:_:ZZZ\nC\n"], &config, &catalog);
        assert_eq!(written, b"\n");
        assert_eq!(last_sent, None);
    }

    #[test]
    fn stop_on_connect_sends_exact_stop_bytes() {
        let mut config = bare_config();
        config.stop = true;
        let catalog = Catalog::with_images(4096, vec![]);
        let (written, _) = run(&[], &config, &catalog);
        assert_eq!(
            written,
            [
                b"\n" as &[u8],
                &[0x1B, 0x44, 0x4E, 0x57, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00],
            ]
            .concat()
        );
    }

    #[test]
    fn ack_rearms_the_upload_gate() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl1, vec![9u8; 32])]);

        let (written, _) = run(
            &[b"eub:req:_:BL1\nC\neub:ack:_:BL1\nC\n"],
            &config,
            &catalog,
        );

        let frame = download_frame(&[9u8; 32]);
        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&frame);
        expected.extend_from_slice(&frame);
        assert_eq!(written, expected);
    }

    #[test]
    fn wait_ack_holds_the_next_upload() {
        let mut config = bare_config();
        config.wait_ack = true;
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl1, vec![9u8; 32])]);

        // Second request's cue arrives before BL1 is acknowledged.
        let (written, last_sent) = run(
            &[b"eub:req:_:BL1\nC\neub:req:_:DPM\nC\n"],
            &config,
            &catalog,
        );

        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&download_frame(&[9u8; 32]));
        assert_eq!(written, expected);
        assert_eq!(last_sent.as_deref(), Some("BL1"));
    }

    #[test]
    fn without_wait_ack_back_to_back_requests_both_upload() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl1, vec![9u8; 32])]);

        let (written, last_sent) = run(
            &[b"eub:req:_:BL1\nC\neub:req:_:DPM\nC\n"],
            &config,
            &catalog,
        );

        let mut expected = b"\n".to_vec();
        expected.extend_from_slice(&download_frame(&[9u8; 32]));
        expected.extend_from_slice(&download_frame(&vec![0u8; 12288]));
        assert_eq!(written, expected);
        assert_eq!(last_sent.as_deref(), Some("DPM"));
    }

    #[test]
    fn crc_override_reaches_the_wire() {
        let mut config = bare_config();
        config.crc = Some([0xFF, 0xFF]);
        let catalog = Catalog::with_images(4096, vec![(ImageKind::Bl1, vec![1u8; 16])]);

        let (written, _) = run(&[b"eub:req:_:BL1\nC\n"], &config, &catalog);
        assert_eq!(&written[written.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn failure_trace_reports_once_per_distinct_trace() {
        let config = bare_config();
        let catalog = Catalog::with_images(4096, vec![]);
        let transport: SharedTransport = Arc::new(Mutex::new(Box::new(ScriptTransport {
            reads: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
        })));
        let mut last_sent = Some("BL2".to_owned());
        let mut session = Session {
            transport: &transport,
            config: &config,
            catalog: &catalog,
            last_sent: &mut last_sent,
            request: None,
            upload: false,
            awaiting_ack: None,
            last_trace: None,
            identity: None,
        };

        let trace: Vec<String> = (0..15).map(|i| format!("frame{i}")).collect();
        assert!(session.report_failure(&trace));
        assert!(!session.report_failure(&trace));

        let other: Vec<String> = (0..15).map(|i| format!("other{i}")).collect();
        assert!(session.report_failure(&other));
        assert!(!session.report_failure(&other));
    }
}
