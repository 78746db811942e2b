//! Demo handlers
//!
//! Display caller ids, answer on the second ring and play some DTMF tones,
//! echo received SMS back to the sender and print GPS status reports.

use crate::call::{play_dtmf, DtmfOutcome, IncomingCall};
use crate::config::Config;
use crate::dispatcher::EventHandler;
use crate::error::Result;
use crate::gps::{describe_location, GpsReport};
use crate::session::ModemControl;
use crate::sms::{echo_reply, SmsMessage};
use async_trait::async_trait;
use std::fmt::Display;
use std::io::Write;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Handler set printing to `W` (stdout for the binary)
pub struct DemoHandler<W> {
    config: Config,
    out: Mutex<W>,
}

impl DemoHandler<std::io::Stdout> {
    pub fn stdout(config: &Config) -> Self {
        Self::new(config, std::io::stdout())
    }
}

impl<W: Write + Send> DemoHandler<W> {
    pub fn new(config: &Config, out: W) -> Self {
        Self {
            config: config.clone(),
            out: Mutex::new(out),
        }
    }

    pub fn into_output(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn print(&self, text: impl Display) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{}", text);
        let _ = out.flush();
    }

    async fn answer_and_play(&self, modem: &dyn ModemControl) -> Result<()> {
        self.print("Answering call and playing some DTMF tones...");
        modem.answer().await?;
        tokio::time::sleep(self.config.dtmf_settle()).await;

        let played = play_dtmf(modem, &self.config.dtmf_tones).await;
        if let Ok(DtmfOutcome::InterruptedAt { index, cause }) = &played {
            warn!(tones_sent = index, %cause, "DTMF playback interrupted");
            self.print(format!(
                "DTMF playback interrupted after {} tone(s) ({})",
                index, cause
            ));
        }

        // Hang up whatever happened during playback
        if modem.call_answered() {
            self.print("Hanging up call.");
            modem.hangup().await?;
        }

        played.map(|_| ())
    }
}

/// Signal strength text, or "unknown"
pub fn describe_signal(rssi: Option<u8>) -> String {
    match rssi {
        Some(rssi) => format!("Signal strength: {}", rssi),
        None => "Signal strength: unknown".to_string(),
    }
}

#[async_trait]
impl<W: Write + Send> EventHandler for DemoHandler<W> {
    async fn on_incoming_call(
        &self,
        modem: &dyn ModemControl,
        call: &IncomingCall,
    ) -> Result<()> {
        match call.ring_count {
            1 => self.print(format!("Incoming call from: {}", call.caller())),
            n if n >= 2 => {
                if !modem.call_active() {
                    debug!(call_id = call.id, "Ring for a call that already ended");
                    return Ok(());
                }
                if call.dtmf_support {
                    self.answer_and_play(modem).await?;
                } else {
                    self.print("Modem has no DTMF support - hanging up call.");
                    modem.hangup().await?;
                }
            }
            _ => self.print(format!(" Call from {} is still ringing...", call.caller())),
        }
        Ok(())
    }

    async fn on_sms(&self, modem: &dyn ModemControl, sms: &SmsMessage) -> Result<()> {
        info!(from = %sms.number, "SMS received");
        self.print(format!(
            "== SMS message received ==\nFrom: {}\nTime: {}\nMessage:\n{}\n",
            sms.number, sms.time, sms.text
        ));

        self.print("Replying to SMS...");
        sms.reply(modem, &echo_reply(&sms.text)).await?;
        self.print("SMS sent.\n");
        Ok(())
    }

    async fn on_gps_report(&self, modem: &dyn ModemControl, report: &GpsReport) -> Result<()> {
        debug!(running = report.running, fix = report.fix, "GPS status report");

        let location = modem.location().await?;
        self.print(describe_location(location.as_ref()));

        let rssi = modem.signal_strength().await?;
        self.print(describe_signal(rssi));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::{CauseKind, ErrorCause};
    use crate::gps::Location;
    use crate::testing::{Action, MockModem};

    fn handler() -> DemoHandler<Vec<u8>> {
        DemoHandler::new(&Config::for_test(), Vec::new())
    }

    fn output(handler: DemoHandler<Vec<u8>>) -> String {
        String::from_utf8(handler.into_output()).unwrap()
    }

    fn call(ring_count: u32, dtmf_support: bool) -> IncomingCall {
        IncomingCall {
            id: 1,
            number: Some("+31628870634".to_string()),
            ring_count,
            dtmf_support,
            answered: false,
        }
    }

    #[tokio::test]
    async fn test_first_ring_only_displays_caller() {
        let modem = MockModem::new();
        let handler = handler();

        handler.on_incoming_call(&modem, &call(1, true)).await.unwrap();

        assert!(modem.actions().is_empty());
        assert!(output(handler).contains("Incoming call from: +31628870634"));
    }

    #[tokio::test]
    async fn test_second_ring_answers_and_plays_tones() {
        let modem = MockModem::new();
        let handler = handler();

        handler.on_incoming_call(&modem, &call(2, true)).await.unwrap();

        assert_eq!(
            modem.actions(),
            vec![
                Action::Answer,
                Action::Dtmf('1'),
                Action::Dtmf('2'),
                Action::Dtmf('3'),
                Action::Hangup,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_dtmf_hangs_up_without_answering() {
        let modem = MockModem::new();
        let handler = handler();

        handler.on_incoming_call(&modem, &call(3, false)).await.unwrap();

        assert_eq!(modem.actions(), vec![Action::Hangup]);
        assert!(output(handler).contains("no DTMF support"));
    }

    #[tokio::test]
    async fn test_modem_error_interrupts_playback() {
        let cause = ErrorCause::new(CauseKind::Cme, Some(30));
        let modem = MockModem::new().fail_dtmf_at(1, cause);
        let handler = handler();

        handler.on_incoming_call(&modem, &call(2, true)).await.unwrap();

        assert_eq!(
            modem.actions(),
            vec![Action::Answer, Action::Dtmf('1'), Action::Hangup]
        );
        assert!(output(handler).contains("interrupted after 1 tone(s) (CME Error 30)"));
    }

    #[tokio::test]
    async fn test_remote_hangup_skips_local_hangup() {
        let modem = MockModem::new().drop_call_after(2);
        let handler = handler();

        handler.on_incoming_call(&modem, &call(2, true)).await.unwrap();

        assert_eq!(
            modem.actions(),
            vec![Action::Answer, Action::Dtmf('1'), Action::Dtmf('2')]
        );
        assert!(output(handler).contains("(NO CARRIER)"));
    }

    #[tokio::test]
    async fn test_stale_ring_is_ignored() {
        let modem = MockModem::new().without_call();
        let handler = handler();

        handler.on_incoming_call(&modem, &call(4, true)).await.unwrap();
        assert!(modem.actions().is_empty());
    }

    #[tokio::test]
    async fn test_zero_rings_reports_still_ringing() {
        let modem = MockModem::new();
        let handler = handler();

        handler.on_incoming_call(&modem, &call(0, true)).await.unwrap();
        assert!(modem.actions().is_empty());
        assert!(output(handler).contains("is still ringing"));
    }

    #[tokio::test]
    async fn test_sms_is_echoed_to_sender() {
        let modem = MockModem::new();
        let handler = handler();
        let sms = SmsMessage::new(
            "+31628870634",
            "24/05/01,12:30:00+08",
            "This message is longer than twenty".to_string(),
            None,
        );

        handler.on_sms(&modem, &sms).await.unwrap();

        assert_eq!(
            modem.actions(),
            vec![Action::SendSms {
                number: "+31628870634".to_string(),
                text: "SMS received: \"This message is lon...\"".to_string(),
            }]
        );
        let out = output(handler);
        assert!(out.contains("From: +31628870634"));
        assert!(out.contains("SMS sent."));
    }

    #[tokio::test]
    async fn test_sms_reply_failure_propagates() {
        let modem = MockModem::new().fail_sms();
        let handler = handler();
        let sms = SmsMessage::new("+3161", "24/05/01,12:30:00+08", "hi".to_string(), None);

        assert!(handler.on_sms(&modem, &sms).await.is_err());
        assert!(!output(handler).contains("SMS sent."));
    }

    #[tokio::test]
    async fn test_gps_prints_location_then_signal() {
        let modem = MockModem::new().with_location(Location {
            latitude: 52.37,
            longitude: 4.89,
            altitude: None,
            time: None,
        });
        let handler = handler();
        let report = GpsReport::parse("1,1").unwrap();

        handler.on_gps_report(&modem, &report).await.unwrap();

        let out = output(handler);
        let loc = out.find("52.370000, 4.890000").unwrap();
        let sig = out.find("Signal strength: 18").unwrap();
        assert!(loc < sig);
    }

    #[tokio::test]
    async fn test_gps_without_fix() {
        let modem = MockModem::new().with_signal(None);
        let handler = handler();
        let report = GpsReport::parse("1,0").unwrap();

        handler.on_gps_report(&modem, &report).await.unwrap();

        let out = output(handler);
        assert!(out.find("no fix").unwrap() < out.find("Signal strength: unknown").unwrap());
    }

    proptest::proptest! {
        #[test]
        fn prop_interrupted_playback_hangs_up_at_most_once(
            tones_before in 0usize..=3,
            remote_hangup in proptest::bool::ANY,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            // A remote hangup needs at least one tone to have been played
            let remote_hangup = remote_hangup && tones_before > 0;

            let actions = rt.block_on(async {
                let modem = if remote_hangup {
                    MockModem::new().drop_call_after(tones_before)
                } else {
                    MockModem::new().fail_dtmf_at(tones_before, ErrorCause::new(CauseKind::Cme, Some(3)))
                };
                handler().on_incoming_call(&modem, &call(2, true)).await.unwrap();
                modem.actions()
            });

            let tones: String = actions
                .iter()
                .filter_map(|a| match a {
                    Action::Dtmf(t) => Some(*t),
                    _ => None,
                })
                .collect();
            let hangups = actions.iter().filter(|a| **a == Action::Hangup).count();

            proptest::prop_assert_eq!(actions.first(), Some(&Action::Answer));
            proptest::prop_assert_eq!(tones, "123"[..tones_before].to_string());
            proptest::prop_assert_eq!(hangups, if remote_hangup { 0 } else { 1 });
        }
    }
}
