//! In-memory modem for handler and dispatcher tests

use crate::at::ErrorCause;
use crate::error::{Error, Result};
use crate::gps::Location;
use crate::session::ModemControl;
use crate::sms::SmsMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Answer,
    Hangup,
    Dtmf(char),
    SendSms { number: String, text: String },
    ReadSms(u32),
    DeleteSms(u32),
}

pub struct MockModem {
    actions: Mutex<Vec<Action>>,
    active: AtomicBool,
    answered: AtomicBool,
    tones_sent: AtomicUsize,
    fail_dtmf_at: Option<(usize, ErrorCause)>,
    drop_call_after: Option<usize>,
    fail_sms: bool,
    location: Option<Location>,
    signal: Option<u8>,
    stored: Mutex<HashMap<u32, SmsMessage>>,
}

impl MockModem {
    /// A modem with a ringing call
    pub fn new() -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            answered: AtomicBool::new(false),
            tones_sent: AtomicUsize::new(0),
            fail_dtmf_at: None,
            drop_call_after: None,
            fail_sms: false,
            location: None,
            signal: Some(18),
            stored: Mutex::new(HashMap::new()),
        }
    }

    pub fn without_call(self) -> Self {
        self.active.store(false, Ordering::SeqCst);
        self
    }

    /// The tone at `index` is rejected with `cause`
    pub fn fail_dtmf_at(mut self, index: usize, cause: ErrorCause) -> Self {
        self.fail_dtmf_at = Some((index, cause));
        self
    }

    /// The remote party hangs up once `tones` tones were played
    pub fn drop_call_after(mut self, tones: usize) -> Self {
        self.drop_call_after = Some(tones);
        self
    }

    pub fn fail_sms(mut self) -> Self {
        self.fail_sms = true;
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_signal(mut self, signal: Option<u8>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_stored(self, index: u32, sms: SmsMessage) -> Self {
        self.stored.lock().unwrap().insert(index, sms);
        self
    }

    pub fn actions(&self) -> Vec<Action> {
        self.actions.lock().unwrap().clone()
    }

    fn record(&self, action: Action) {
        self.actions.lock().unwrap().push(action);
    }

    fn rejected(command: &str, cause: ErrorCause) -> Error {
        Error::Modem {
            command: command.to_string(),
            cause,
        }
    }
}

#[async_trait]
impl ModemControl for MockModem {
    async fn answer(&self) -> Result<()> {
        self.record(Action::Answer);
        self.answered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.record(Action::Hangup);
        self.answered.store(false, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_dtmf(&self, tone: char) -> Result<()> {
        let index = self.tones_sent.load(Ordering::SeqCst);
        if let Some((fail_at, cause)) = &self.fail_dtmf_at {
            if *fail_at == index {
                return Err(Self::rejected("AT+VTS", cause.clone()));
            }
        }

        self.record(Action::Dtmf(tone));
        let sent = self.tones_sent.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drop_call_after == Some(sent) {
            self.active.store(false, Ordering::SeqCst);
            self.answered.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn send_sms(&self, number: &str, text: &str) -> Result<u16> {
        if self.fail_sms {
            return Err(Self::rejected(
                "AT+CMGS",
                ErrorCause::new(crate::at::CauseKind::Cms, Some(500)),
            ));
        }
        self.record(Action::SendSms {
            number: number.to_string(),
            text: text.to_string(),
        });
        Ok(1)
    }

    async fn read_sms(&self, index: u32) -> Result<SmsMessage> {
        self.record(Action::ReadSms(index));
        self.stored
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or_else(|| {
                Self::rejected(
                    "AT+CMGR",
                    ErrorCause::new(crate::at::CauseKind::Cms, Some(321)),
                )
            })
    }

    async fn delete_sms(&self, index: u32) -> Result<()> {
        self.record(Action::DeleteSms(index));
        self.stored.lock().unwrap().remove(&index);
        Ok(())
    }

    async fn signal_strength(&self) -> Result<Option<u8>> {
        Ok(self.signal)
    }

    async fn location(&self) -> Result<Option<Location>> {
        Ok(self.location.clone())
    }

    fn call_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    fn call_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
