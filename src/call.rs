//! Incoming call tracking and DTMF playback

use crate::at::ErrorCause;
use crate::error::{Error, Result};
use crate::session::ModemControl;
use serde::Serialize;
use tracing::debug;

/// A ringing or answered incoming call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingCall {
    /// Sequence number of the call within the session
    pub id: u32,
    pub number: Option<String>,
    pub ring_count: u32,
    pub dtmf_support: bool,
    pub answered: bool,
}

impl IncomingCall {
    /// Caller number for display
    pub fn caller(&self) -> &str {
        self.number.as_deref().unwrap_or("unknown")
    }
}

/// Turns RING / +CLIP notifications into call snapshots
///
/// A `RING` is held back until the following line arrives, so the caller id
/// sent right after it can be attached to the same ring.
#[derive(Debug, Default)]
pub struct CallTracker {
    current: Option<IncomingCall>,
    ring_pending: bool,
    dtmf_support: bool,
    next_id: u32,
}

impl CallTracker {
    pub fn new(dtmf_support: bool) -> Self {
        Self {
            dtmf_support,
            ..Self::default()
        }
    }

    pub fn set_dtmf_support(&mut self, supported: bool) {
        self.dtmf_support = supported;
        if let Some(call) = self.current.as_mut() {
            call.dtmf_support = supported;
        }
    }

    pub fn dtmf_support(&self) -> bool {
        self.dtmf_support
    }

    /// Record a RING; returns a previous ring that never got its caller id
    pub fn ring(&mut self) -> Option<IncomingCall> {
        let flushed = self.flush();
        self.ring_pending = true;
        flushed
    }

    /// Attach a caller id to the pending ring
    pub fn caller_id(&mut self, number: String) -> Option<IncomingCall> {
        let number = if number.is_empty() { None } else { Some(number) };

        if !self.ring_pending {
            // Caller id without a preceding ring only refreshes the number
            if let (Some(call), Some(number)) = (self.current.as_mut(), number) {
                call.number = Some(number);
            }
            return None;
        }

        self.ring_pending = false;
        Some(self.register_ring(number))
    }

    /// A RING is waiting for its caller id
    pub fn has_pending_ring(&self) -> bool {
        self.ring_pending
    }

    /// Emit a pending ring without caller id
    pub fn flush(&mut self) -> Option<IncomingCall> {
        if !self.ring_pending {
            return None;
        }
        self.ring_pending = false;
        Some(self.register_ring(None))
    }

    fn register_ring(&mut self, number: Option<String>) -> IncomingCall {
        let dtmf_support = self.dtmf_support;
        let next_id = &mut self.next_id;
        let call = self.current.get_or_insert_with(|| {
            *next_id += 1;
            IncomingCall {
                id: *next_id,
                number: None,
                ring_count: 0,
                dtmf_support,
                answered: false,
            }
        });

        call.ring_count += 1;
        if number.is_some() {
            call.number = number;
        }
        debug!(call_id = call.id, ring_count = call.ring_count, "Ring registered");
        call.clone()
    }

    pub fn mark_answered(&mut self) {
        if let Some(call) = self.current.as_mut() {
            call.answered = true;
        }
    }

    /// Remote disconnect or local hangup; returns the terminated call
    pub fn end(&mut self) -> Option<IncomingCall> {
        self.ring_pending = false;
        self.current.take()
    }

    pub fn current(&self) -> Option<&IncomingCall> {
        self.current.as_ref()
    }

    pub fn is_answered(&self) -> bool {
        self.current.as_ref().map(|c| c.answered).unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }
}

/// Result of playing a tone sequence
#[derive(Debug, Clone, PartialEq)]
pub enum DtmfOutcome {
    Completed,
    /// `index` tones were sent before the call dropped or the modem refused
    InterruptedAt { index: usize, cause: ErrorCause },
}

/// Send each tone in order, stopping at the first interruption
///
/// Modem error responses and a vanished call are interruptions; transport
/// failures are returned as errors.
pub async fn play_dtmf(modem: &dyn ModemControl, tones: &str) -> Result<DtmfOutcome> {
    for (index, tone) in tones.chars().enumerate() {
        if !modem.call_active() {
            return Ok(DtmfOutcome::InterruptedAt {
                index,
                cause: ErrorCause::no_carrier(),
            });
        }

        match modem.send_dtmf(tone).await {
            Ok(()) => debug!(tone = %tone, "DTMF tone sent"),
            Err(Error::Modem { cause, .. }) => {
                return Ok(DtmfOutcome::InterruptedAt { index, cause });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(DtmfOutcome::Completed)
}
