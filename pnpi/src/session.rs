//! The per-session coordinator: owns the worker channels, multiplexes
//! their output with a `tokio::select!` loop, and tracks writer
//! backpressure and worker liveness. Rust-ified from `pnpi.go`'s
//! `Interact`.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use pnpi_core::{build_frame, Command, CommandDecoder, CommandResult, Hotspot, OutboundMessage};
use pnpi_usb::{UsbIn, UsbOut};
use tokio::sync::mpsc;

use crate::error::DaemonError;
use crate::executor;
use crate::helper::Helper;
use crate::monitor::{self, MonitorControl};
use crate::scanner::{self, ScanControl};

const CHANNEL_BUFFER: usize = 9;
const WRITER_PENDING_MAX: u32 = 3;

const TAG_USB_WRITER: u8 = 1;
const TAG_MONITOR: u8 = 2;
const TAG_EXECUTOR: u8 = 4;
const TAG_SCANNER: u8 = 8;

/// Run `future` under an unwind guard; on panic, post `tag` to `notify_tx`
/// and log, mirroring the original's `RecoverDo`/`defer recover()` pattern.
async fn guarded(tag: u8, label: &'static str, notify_tx: mpsc::Sender<u8>, future: impl Future<Output = ()>) {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(()) => debug!("worker {label} exited normally"),
        Err(_) => {
            error!("{}", DaemonError::WorkerPanic(label));
            let _ = notify_tx.send(tag).await;
        }
    }
}

/// Drain bulk-IN bytes into a self-synchronizing command decoder and push
/// complete commands to `usb_in_tx`. Decode errors are fatal: the reader
/// exits (and its caller posts the liveness notification).
async fn reader_loop(mut reader: impl UsbIn, usb_in_tx: mpsc::Sender<Command>) {
    let mut decoder = CommandDecoder::new();
    loop {
        let bytes = match reader.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("reader: USB read failed: {e}");
                return;
            }
        };
        if bytes.is_empty() {
            continue;
        }
        decoder.push(&bytes);
        loop {
            match decoder.next_command() {
                Ok(Some(command)) => {
                    if usb_in_tx.send(command).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("reader: fatal decode error: {e}");
                    return;
                }
            }
        }
    }
}

/// Drain outbound messages and write their frames; report success/failure
/// back to the supervisor over `sent_tx` so it can track pending count.
/// A no-diff monitor tick still arrives here as `OutboundMessage::Empty`
/// and is framed as a literal `{}` body, the same as any other message -
/// there is no separate "nothing to send" channel shape.
async fn writer_loop(
    mut writer: impl UsbOut,
    mut usb_out_rx: mpsc::Receiver<OutboundMessage>,
    sent_tx: mpsc::Sender<bool>,
) {
    while let Some(message) = usb_out_rx.recv().await {
        let Ok(frame) = build_frame(&message) else {
            if sent_tx.send(false).await.is_err() {
                return;
            }
            continue;
        };

        let sent = writer.write_frame(&frame.header, &frame.body).await.is_ok();
        if sent_tx.send(sent).await.is_err() {
            return;
        }
    }
}

struct Liveness {
    usb_writer_alive: bool,
    executor_alive: bool,
}

impl Liveness {
    fn mark_dead(&mut self, tag: u8) {
        if tag & TAG_USB_WRITER != 0 {
            self.usb_writer_alive = false;
        }
        if tag & TAG_EXECUTOR != 0 {
            self.executor_alive = false;
        }
        // TAG_MONITOR / TAG_SCANNER liveness only gates whether their
        // control channels are still worth sending to; a closed channel
        // send already no-ops, so tracking those bits isn't load-bearing
        // beyond logging.
    }
}

/// Enqueue `message` if the writer is alive and the pending counter has
/// not exceeded the backpressure cap. Returns whether it was sent.
fn try_enqueue(
    usb_out_tx: &mpsc::Sender<OutboundMessage>,
    pending: &mut u32,
    writer_alive: bool,
    message: OutboundMessage,
) -> bool {
    if !writer_alive || *pending > WRITER_PENDING_MAX {
        return false;
    }
    match usb_out_tx.try_send(message) {
        Ok(()) => {
            *pending += 1;
            true
        }
        Err(_) => false,
    }
}

/// Run one full session over an already-open accessory stack. Returns
/// when the link drops or the supervisor gives up (reader died, writer
/// backpressure exceeded the limit, or an `"exit"` command arrived).
/// Generic over the transport halves so tests can drive this against an
/// in-memory stand-in instead of a real USB stack.
pub async fn run<R, W>(reader: R, writer: W, helper: Helper)
where
    R: UsbIn + Send + 'static,
    W: UsbOut + Send + 'static,
{
    let (usb_in_tx, mut usb_in_rx) = mpsc::channel::<Command>(1);
    let (usb_out_tx, usb_out_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_BUFFER);
    let (sent_tx, mut sent_rx) = mpsc::channel::<bool>(1);
    let (notify_tx, mut notify_rx) = mpsc::channel::<u8>(CHANNEL_BUFFER);

    let (monitor_control_tx, monitor_control_rx) = mpsc::channel::<MonitorControl>(CHANNEL_BUFFER);
    let (monitor_reports_tx, mut monitor_reports_rx) = mpsc::channel::<OutboundMessage>(CHANNEL_BUFFER);
    let (scanner_control_tx, scanner_control_rx) = mpsc::channel::<ScanControl>(CHANNEL_BUFFER);
    let (scan_results_tx, mut scan_results_rx) = mpsc::channel::<Vec<Hotspot>>(CHANNEL_BUFFER);
    let (commands_out_tx, commands_out_rx) = mpsc::channel::<Command>(CHANNEL_BUFFER);
    let (command_results_tx, mut command_results_rx) = mpsc::channel::<CommandResult>(CHANNEL_BUFFER);

    tokio::task::spawn(reader_loop(reader, usb_in_tx));
    tokio::task::spawn(guarded(
        TAG_USB_WRITER,
        "usb-writer",
        notify_tx.clone(),
        writer_loop(writer, usb_out_rx, sent_tx),
    ));
    tokio::task::spawn(guarded(
        TAG_MONITOR,
        "monitor",
        notify_tx.clone(),
        monitor::run(helper.clone(), monitor_control_rx, monitor_reports_tx),
    ));
    tokio::task::spawn(guarded(
        TAG_SCANNER,
        "scanner",
        notify_tx.clone(),
        scanner::run(helper.clone(), scanner_control_rx, scan_results_tx),
    ));
    tokio::task::spawn(guarded(
        TAG_EXECUTOR,
        "executor",
        notify_tx.clone(),
        executor::run(helper.clone(), commands_out_rx, command_results_tx),
    ));

    let mut liveness = Liveness {
        usb_writer_alive: true,
        executor_alive: true,
    };
    let mut pending: u32 = 0;
    let mut monitor_started_once = false;

    loop {
        tokio::select! {
            command = usb_in_rx.recv() => {
                let Some(command) = command else {
                    info!("session: reader channel closed, terminating session");
                    return;
                };

                match command.action.as_str() {
                    "monitor" => {
                        match command.args.first().map(String::as_str) {
                            Some("start") => {
                                if !monitor_started_once {
                                    monitor_started_once = true;
                                    let countries = helper.available_wifi_countries();
                                    try_enqueue(
                                        &usb_out_tx,
                                        &mut pending,
                                        liveness.usb_writer_alive,
                                        OutboundMessage::Choices { countries },
                                    );
                                }
                                let _ = monitor_control_tx.send(MonitorControl::Start).await;
                            }
                            Some("stop") => {
                                let _ = monitor_control_tx.send(MonitorControl::Stop).await;
                            }
                            other => warn!("session: ignoring monitor command with arg {other:?}"),
                        }
                    }
                    "scan" => {
                        match command.args.first().map(String::as_str) {
                            Some("start") => {
                                let _ = scanner_control_tx.send(ScanControl::Start).await;
                            }
                            Some("stop") => {
                                let _ = scanner_control_tx.send(ScanControl::Stop).await;
                            }
                            other => warn!("session: ignoring scan command with arg {other:?}"),
                        }
                    }
                    "exit" => {
                        info!("session: exit command received, terminating session");
                        return;
                    }
                    _ => {
                        let is_state_changing = command.is_state_changing();
                        if liveness.executor_alive {
                            let _ = commands_out_tx.send(command).await;
                            if is_state_changing {
                                let _ = monitor_control_tx.send(MonitorControl::Burst).await;
                            }
                        }
                    }
                }
            }

            result = command_results_rx.recv() => {
                if let Some(CommandResult { command, error }) = result {
                    match error {
                        Some(e) => warn!("executor: {:?} failed: {e}", command.action),
                        None => debug!("executor: {:?} succeeded", command.action),
                    }
                }
            }

            report = monitor_reports_rx.recv() => {
                if let Some(report) = report {
                    try_enqueue(&usb_out_tx, &mut pending, liveness.usb_writer_alive, report);
                }
            }

            scan = scan_results_rx.recv() => {
                if let Some(hotspots) = scan {
                    try_enqueue(
                        &usb_out_tx,
                        &mut pending,
                        liveness.usb_writer_alive,
                        OutboundMessage::Scan { hotspots },
                    );
                }
            }

            sent = sent_rx.recv() => {
                match sent {
                    Some(_) => pending = pending.saturating_sub(1),
                    None => liveness.usb_writer_alive = false,
                }
            }

            tag = notify_rx.recv() => {
                if let Some(tag) = tag {
                    liveness.mark_dead(tag);
                }
            }
        }

        if pending > WRITER_PENDING_MAX {
            warn!("session: {}, terminating session", DaemonError::WriterBackpressure);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use pnpi_usb::UsbError;

    use super::*;

    /// Feeds a fixed script of raw command bytes, then pends forever -
    /// the reader side of an in-memory stand-in for the USB stack.
    struct ScriptedReader {
        frames: VecDeque<Vec<u8>>,
    }

    impl ScriptedReader {
        fn new(frames: &[&[u8]]) -> Self {
            Self {
                frames: frames.iter().map(|f| f.to_vec()).collect(),
            }
        }
    }

    impl UsbIn for ScriptedReader {
        async fn read(&mut self) -> Result<Vec<u8>, UsbError> {
            match self.frames.pop_front() {
                Some(bytes) => Ok(bytes),
                None => std::future::pending().await,
            }
        }
    }

    /// Records every frame body it's asked to write instead of touching a
    /// real bulk OUT endpoint.
    #[derive(Clone, Default)]
    struct SpyWriter {
        bodies: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl UsbOut for SpyWriter {
        async fn write_frame(&mut self, _header: &[u8], body: &[u8]) -> Result<(), UsbError> {
            self.bodies.lock().unwrap().push(body.to_vec());
            Ok(())
        }
    }

    fn any_body_contains(bodies: &Arc<Mutex<Vec<Vec<u8>>>>, needle: &str) -> bool {
        bodies
            .lock()
            .unwrap()
            .iter()
            .any(|b| String::from_utf8_lossy(b).contains(needle))
    }

    /// A writer whose `write_frame` never completes, so `writer_loop` never
    /// posts a `sent` signal back to the supervisor.
    struct StuckWriter;

    impl UsbOut for StuckWriter {
        async fn write_frame(&mut self, _header: &[u8], _body: &[u8]) -> Result<(), UsbError> {
            std::future::pending().await
        }
    }

    #[test]
    fn tag_bits_are_disjoint_and_combine() {
        assert_eq!(TAG_USB_WRITER | TAG_MONITOR | TAG_EXECUTOR | TAG_SCANNER, 15);
        let mut liveness = Liveness {
            usb_writer_alive: true,
            executor_alive: true,
        };
        liveness.mark_dead(TAG_EXECUTOR);
        assert!(liveness.usb_writer_alive);
        assert!(!liveness.executor_alive);
    }

    #[test]
    fn try_enqueue_respects_pending_cap() {
        let (tx, _rx) = mpsc::channel::<OutboundMessage>(1);
        let mut pending = WRITER_PENDING_MAX + 1;
        let sent = try_enqueue(&tx, &mut pending, true, OutboundMessage::Scan { hotspots: vec![] });
        assert!(!sent);
    }

    #[test]
    fn try_enqueue_skips_when_writer_dead() {
        let (tx, _rx) = mpsc::channel::<OutboundMessage>(4);
        let mut pending = 0;
        let sent = try_enqueue(&tx, &mut pending, false, OutboundMessage::Scan { hotspots: vec![] });
        assert!(!sent);
        assert_eq!(pending, 0);
    }

    // S4: an oversized outbound body never reaches the writer and is
    // reported back as a failed send.
    #[tokio::test]
    async fn scenario_oversized_body_rejected_without_a_write() {
        let (usb_out_tx, usb_out_rx) = mpsc::channel(1);
        let (sent_tx, mut sent_rx) = mpsc::channel(1);
        let writer = SpyWriter::default();
        let bodies = writer.bodies.clone();

        tokio::task::spawn(writer_loop(writer, usb_out_rx, sent_tx));

        let countries = (0..5000)
            .map(|i| pnpi_core::Country {
                code: format!("C{i}"),
                name: "x".repeat(20),
            })
            .collect();
        usb_out_tx
            .send(OutboundMessage::Choices { countries })
            .await
            .unwrap();

        assert_eq!(sent_rx.recv().await, Some(false));
        assert!(bodies.lock().unwrap().is_empty());
    }

    // S5: after Start then a state-changing command, the supervisor sends
    // the country choices once, a full report, and forwards Burst so the
    // monitor keeps producing reports on the fast ticker.
    #[tokio::test]
    async fn scenario_monitor_burst_after_connect() {
        tokio::time::pause();

        let reader = ScriptedReader::new(&[
            br#"{"action":"monitor","args":["start"]}"#,
            br#"{"action":"connect","args":["home","secret"]}"#,
        ]);
        let writer = SpyWriter::default();
        let bodies = writer.bodies.clone();
        let session = tokio::task::spawn(run(reader, writer, Helper::new_for_test()));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(any_body_contains(&bodies, "choices"));
        assert!(any_body_contains(&bodies, "states"));
        let before_burst = bodies.lock().unwrap().len();

        // Shorter than the 3s regular tick, long enough for the 1.2s
        // burst ticker Burst should have armed.
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bodies.lock().unwrap().len() > before_burst);

        session.abort();
    }

    // S6: a writer that never completes a write never posts `sent`, so
    // the pending counter climbs past the cap and the session terminates.
    #[tokio::test]
    async fn scenario_writer_stuck_triggers_backpressure_termination() {
        tokio::time::pause();

        let reader = ScriptedReader::new(&[br#"{"action":"monitor","args":["start"]}"#]);
        let session = tokio::task::spawn(run(reader, StuckWriter, Helper::new_for_test()));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(session.is_finished());
    }
}
