//! Modem session management
//!
//! Owns the serial connection, serializes AT commands and runs the listener
//! task that turns unsolicited lines into [`ModemEvent`]s.

use crate::at::{self, classify, ErrorCause, FinalResult, Line, Urc, CTRL_Z};
use crate::call::CallTracker;
use crate::config::{is_dtmf_tone, Config};
use crate::dispatcher::ModemEvent;
use crate::error::{Error, Result};
use crate::gps::{self, GpsReport, Location};
use crate::sms::{self, SmsMessage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Operations the event handlers may perform on the modem
#[async_trait]
pub trait ModemControl: Send + Sync {
    /// Answer the ringing call
    async fn answer(&self) -> Result<()>;

    /// Hang up the current call
    async fn hangup(&self) -> Result<()>;

    /// Play a single DTMF tone on the active call
    async fn send_dtmf(&self, tone: char) -> Result<()>;

    /// Send an SMS, returning the message reference
    async fn send_sms(&self, number: &str, text: &str) -> Result<u16>;

    /// Read a stored SMS
    async fn read_sms(&self, index: u32) -> Result<SmsMessage>;

    /// Delete a stored SMS
    async fn delete_sms(&self, index: u32) -> Result<()>;

    /// Raw rssi (0-31), `None` when unknown
    async fn signal_strength(&self) -> Result<Option<u8>>;

    /// Current GNSS position, `None` without a fix
    async fn location(&self) -> Result<Option<Location>>;

    /// Whether the current call has been answered
    fn call_answered(&self) -> bool;

    /// Whether a call is ringing or in progress
    fn call_active(&self) -> bool;
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared with the listener task
struct Shared {
    calls: Mutex<CallTracker>,
    command_pending: AtomicBool,
    // In-flight command acts on the call (ATA, AT+VTS=<tone>)
    call_command: AtomicBool,
}

impl Shared {
    fn calls(&self) -> std::sync::MutexGuard<'_, CallTracker> {
        // A poisoned tracker is still consistent: every update is a single assignment
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, command: &str) {
        self.call_command.store(is_call_command(command), Ordering::SeqCst);
        self.command_pending.store(true, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.command_pending.store(false, Ordering::SeqCst);
        self.call_command.store(false, Ordering::SeqCst);
    }
}

/// Commands a remote disconnect cuts short
fn is_call_command(command: &str) -> bool {
    command == "ATA" || (command.starts_with("AT+VTS=") && command != "AT+VTS=?")
}

/// An open modem connection
pub struct ModemSession {
    config: Config,
    writer: tokio::sync::Mutex<Option<Writer>>,
    // Holding this lock is holding the right to run a command
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Line>>,
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ModemSession {
    /// Open the configured serial port
    pub fn open(config: &Config) -> Result<(Self, mpsc::UnboundedReceiver<ModemEvent>)> {
        use tokio_serial::SerialPortBuilderExt;

        info!(port = %config.port, baud_rate = config.baud_rate, "Opening serial port");
        let stream = tokio_serial::new(&config.port, config.baud_rate)
            .timeout(config.command_timeout())
            .open_native_async()?;

        Ok(Self::from_stream(stream, config))
    }

    /// Wrap any byte stream speaking the AT protocol
    ///
    /// Spawns the listener task, so this must run inside a tokio runtime.
    pub fn from_stream<S>(stream: S, config: &Config) -> (Self, mpsc::UnboundedReceiver<ModemEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            calls: Mutex::new(CallTracker::new(false)),
            command_pending: AtomicBool::new(false),
            call_command: AtomicBool::new(false),
        });

        let listener = Listener {
            shared: shared.clone(),
            events: event_tx,
            responses: response_tx,
            pending_sms: None,
            caller_id_wait: config.caller_id_wait(),
        };
        let handle = tokio::spawn(listener.run(reader));

        let session = Self {
            config: config.clone(),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            responses: tokio::sync::Mutex::new(response_rx),
            shared,
            listener: Mutex::new(Some(handle)),
            closed: AtomicBool::new(false),
        };

        (session, event_rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring the modem into a known state
    pub async fn connect(&self) -> Result<()> {
        info!("Initializing modem...");

        self.command("AT").await?;
        self.command("ATE0").await?;
        // Numeric +CME ERROR codes
        if let Err(e) = self.command("AT+CMEE=1").await {
            warn!(error = %e, "Modem does not support extended errors");
        }

        self.unlock_sim().await?;

        self.command("AT+CLIP=1").await?;
        if let Err(e) = self.command("AT+CRC=1").await {
            warn!(error = %e, "Extended ring format unavailable, using RING");
        }
        self.command("AT+CMGF=1").await?;
        self.command("AT+CNMI=2,1,0,0,0").await?;

        let dtmf_support = self.command("AT+VTS=?").await.is_ok();
        self.shared.calls().set_dtmf_support(dtmf_support);
        info!(dtmf_support, "DTMF capability probed");

        self.enable_gps().await;

        info!("Modem ready");
        Ok(())
    }

    async fn unlock_sim(&self) -> Result<()> {
        let lines = self.command("AT+CPIN?").await?;
        let status = lines
            .iter()
            .find_map(|l| l.strip_prefix("+CPIN:"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        match status.as_str() {
            "READY" => Ok(()),
            "SIM PIN" => {
                let pin = self.config.pin.as_deref().ok_or(Error::PinRequired)?;
                info!("Submitting SIM PIN");
                self.command(&format!("AT+CPIN={}", at::quote(pin))).await?;
                Ok(())
            }
            other => {
                warn!(status = other, "Unexpected SIM status");
                Ok(())
            }
        }
    }

    async fn enable_gps(&self) {
        if let Err(e) = self.command("AT+CGNSPWR=1").await {
            warn!(error = %e, "GNSS power-on failed, GPS reports disabled");
            return;
        }
        let interval = self.config.gps_report_interval;
        if let Err(e) = self.command(&format!("AT+CGNSURC={}", interval)).await {
            warn!(error = %e, "GNSS unsolicited reports unavailable");
        }
    }

    /// Run a command with the default timeout, returning its data lines
    pub async fn command(&self, command: &str) -> Result<Vec<String>> {
        self.command_with_timeout(command, self.config.command_timeout())
            .await
    }

    pub async fn command_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let mut responses = self.responses.lock().await;
        self.begin(&mut responses, command).await?;

        let result = tokio::time::timeout(timeout, collect_response(&mut responses, command)).await;
        self.shared.finish();

        match result {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                command: command.to_string(),
            }),
        }
    }

    /// Drop stale lines, mark a command in flight and transmit it
    async fn begin(
        &self,
        responses: &mut mpsc::UnboundedReceiver<Line>,
        command: &str,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }
        while let Ok(stale) = responses.try_recv() {
            debug!(line = ?stale, "Discarding stale response");
        }

        self.shared.start(command);
        debug!(command, "==> TX");
        if let Err(e) = self.write(format!("{}\r", command).as_bytes()).await {
            self.shared.finish();
            return Err(e);
        }
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Body half of `AT+CMGS`: prompt, text, Ctrl-Z, final result
    async fn sms_exchange(
        &self,
        responses: &mut mpsc::UnboundedReceiver<Line>,
        command: &str,
        text: &str,
    ) -> Result<Vec<String>> {
        wait_for_prompt(responses, command).await?;

        let mut body = text.as_bytes().to_vec();
        body.push(CTRL_Z);
        self.write(&body).await?;

        collect_response(responses, command).await
    }

    /// Release the serial port and stop the listener
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing modem session");

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Serial shutdown failed");
            }
        }

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn dtmf_support(&self) -> bool {
        self.shared.calls().dtmf_support()
    }
}

#[async_trait]
impl ModemControl for ModemSession {
    async fn answer(&self) -> Result<()> {
        self.command("ATA").await?;
        self.shared.calls().mark_answered();
        info!("Call answered");
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.command("ATH").await?;
        if let Some(call) = self.shared.calls().end() {
            info!(call_id = call.id, "Call hung up");
        }
        Ok(())
    }

    async fn send_dtmf(&self, tone: char) -> Result<()> {
        if !is_dtmf_tone(tone) {
            return Err(Error::Parse(format!("invalid DTMF tone '{}'", tone)));
        }
        self.command(&format!("AT+VTS={}", tone)).await?;
        Ok(())
    }

    async fn send_sms(&self, number: &str, text: &str) -> Result<u16> {
        let command = format!("AT+CMGS={}", at::quote(number));
        let mut responses = self.responses.lock().await;
        self.begin(&mut responses, &command).await?;

        let timeout = self.config.sms_timeout();
        let exchange = self.sms_exchange(&mut responses, &command, text);
        let result = tokio::time::timeout(timeout, exchange).await;
        self.shared.finish();

        let lines = match result {
            Ok(lines) => lines?,
            Err(_) => return Err(Error::Timeout { command }),
        };

        let reference = lines
            .iter()
            .find_map(|l| at::parse_message_reference(l))
            .ok_or_else(|| Error::Parse("missing +CMGS reference".to_string()))?;
        info!(number, reference, "SMS sent");
        Ok(reference)
    }

    async fn read_sms(&self, index: u32) -> Result<SmsMessage> {
        let lines = self.command(&format!("AT+CMGR={}", index)).await?;
        sms::parse_read_response(&lines, index)
    }

    async fn delete_sms(&self, index: u32) -> Result<()> {
        self.command(&format!("AT+CMGD={}", index)).await?;
        Ok(())
    }

    async fn signal_strength(&self) -> Result<Option<u8>> {
        let lines = self.command("AT+CSQ").await?;
        let rssi = lines
            .iter()
            .find_map(|l| at::parse_signal_quality(l))
            .ok_or_else(|| Error::Parse("missing +CSQ line".to_string()))?;

        Ok(if rssi == 99 { None } else { Some(rssi) })
    }

    async fn location(&self) -> Result<Option<Location>> {
        let lines = self.command("AT+CGNSINF").await?;
        gps::parse_location_response(&lines)
    }

    fn call_answered(&self) -> bool {
        self.shared.calls().is_answered()
    }

    fn call_active(&self) -> bool {
        self.shared.calls().is_active()
    }
}

/// Gather data lines until the final result code
async fn collect_response(
    responses: &mut mpsc::UnboundedReceiver<Line>,
    command: &str,
) -> Result<Vec<String>> {
    let mut lines = Vec::new();

    loop {
        match responses.recv().await {
            Some(Line::Final(FinalResult::Ok)) => {
                debug!(command, ?lines, "<== RX OK");
                return Ok(lines);
            }
            Some(Line::Final(FinalResult::Error(cause))) => {
                debug!(command, %cause, "<== RX error");
                return Err(Error::Modem {
                    command: command.to_string(),
                    cause,
                });
            }
            Some(Line::Data(line)) => lines.push(line),
            Some(Line::Prompt) | Some(Line::Urc(_)) => {}
            None => return Err(Error::ChannelClosed),
        }
    }
}

async fn wait_for_prompt(
    responses: &mut mpsc::UnboundedReceiver<Line>,
    command: &str,
) -> Result<()> {
    loop {
        match responses.recv().await {
            Some(Line::Prompt) => return Ok(()),
            Some(Line::Final(FinalResult::Error(cause))) => {
                return Err(Error::Modem {
                    command: command.to_string(),
                    cause,
                });
            }
            Some(Line::Final(FinalResult::Ok)) => {
                return Err(Error::Parse(format!("{} finished without a prompt", command)));
            }
            Some(_) => {}
            None => return Err(Error::ChannelClosed),
        }
    }
}

/// Background reader: routes responses to the in-flight command and
/// unsolicited lines to the event channel
struct Listener {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ModemEvent>,
    responses: mpsc::UnboundedSender<Line>,
    // +CMT header waiting for its body line
    pending_sms: Option<(String, String)>,
    caller_id_wait: Duration,
}

impl Listener {
    async fn run<R: AsyncRead>(mut self, reader: R) {
        tokio::pin!(reader);
        let mut buf = [0u8; 256];
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let holding_ring = self.shared.calls().has_pending_ring();
            let read = if holding_ring {
                match tokio::time::timeout(self.caller_id_wait, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        let flushed = self.shared.calls().flush();
                        if let Some(call) = flushed {
                            debug!(call_id = call.id, "No caller id after ring");
                            self.emit(ModemEvent::IncomingCall(call));
                        }
                        continue;
                    }
                }
            } else {
                reader.read(&mut buf).await
            };

            let n = match read {
                Ok(0) => {
                    info!("Serial stream closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Serial read failed");
                    break;
                }
            };
            pending.extend_from_slice(&buf[..n]);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if !line.is_empty() {
                    self.handle_line(&line);
                }
            }

            // The SMS prompt is not newline terminated
            if pending.iter().all(|b| matches!(b, b'>' | b' ' | b'\r'))
                && pending.contains(&b'>')
            {
                pending.clear();
                self.handle_line(">");
            }
        }

        // Flush a trailing ring so it is not lost with the stream
        if let Some(call) = self.shared.calls().flush() {
            self.emit(ModemEvent::IncomingCall(call));
        }
    }

    fn handle_line(&mut self, text: &str) {
        debug!(line = text, "<== line");

        if let Some((number, timestamp)) = self.pending_sms.take() {
            let sms = SmsMessage::new(&number, &timestamp, text.to_string(), None);
            self.emit(ModemEvent::SmsReceived(sms));
            return;
        }

        let line = classify(text);

        if !matches!(line, Line::Urc(Urc::CallerId { .. })) {
            let flushed = self.shared.calls().flush();
            if let Some(call) = flushed {
                self.emit(ModemEvent::IncomingCall(call));
            }
        }

        match line {
            Line::Urc(urc) => self.handle_urc(urc),
            other => {
                if self.shared.command_pending.load(Ordering::SeqCst) {
                    let _ = self.responses.send(other);
                } else {
                    debug!(line = text, "Ignoring line outside a command");
                }
            }
        }
    }

    fn handle_urc(&mut self, urc: Urc) {
        match urc {
            Urc::Ring => {
                let flushed = self.shared.calls().ring();
                if let Some(call) = flushed {
                    self.emit(ModemEvent::IncomingCall(call));
                }
            }
            Urc::CallerId { number } => {
                let call = self.shared.calls().caller_id(number);
                if let Some(call) = call {
                    self.emit(ModemEvent::IncomingCall(call));
                }
            }
            Urc::CallEnded(reason) => {
                let ended = self.shared.calls().end();
                let Some(call) = ended else {
                    debug!(?reason, "Call end without a tracked call");
                    return;
                };
                info!(call_id = call.id, ?reason, "Call ended remotely");
                self.emit(ModemEvent::CallEnded { call, reason });

                // ATA or AT+VTS in flight lost its call; other commands keep their result
                if self.shared.command_pending.load(Ordering::SeqCst)
                    && self.shared.call_command.load(Ordering::SeqCst)
                {
                    let _ = self
                        .responses
                        .send(Line::Final(FinalResult::Error(ErrorCause::no_carrier())));
                }
            }
            Urc::SmsStored { storage, index } => {
                self.emit(ModemEvent::SmsStored { storage, index });
            }
            Urc::SmsDelivered { number, timestamp } => {
                self.pending_sms = Some((number, timestamp));
            }
            Urc::GpsStatus { fields } => match GpsReport::parse(&fields) {
                Ok(report) => self.emit(ModemEvent::GpsStatus(report)),
                Err(e) => warn!(error = %e, "Malformed GNSS report"),
            },
        }
    }

    fn emit(&self, event: ModemEvent) {
        if self.events.send(event).is_err() {
            debug!("No dispatcher listening, event dropped");
        }
    }
}
