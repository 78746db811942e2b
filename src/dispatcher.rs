//! Event dispatch
//!
//! The listener pushes typed events onto a channel; a single dispatcher
//! consumes them in order and calls the handler, passing the modem along.

use crate::at::EndReason;
use crate::call::IncomingCall;
use crate::error::{Error, Result};
use crate::gps::GpsReport;
use crate::session::ModemControl;
use crate::sms::SmsMessage;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something the modem told us without being asked
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ModemEvent {
    /// A ring, with the call snapshot after it was counted
    IncomingCall(IncomingCall),
    CallEnded {
        call: IncomingCall,
        reason: EndReason,
    },
    /// Delivered directly, without touching SIM storage
    SmsReceived(SmsMessage),
    /// Stored on the modem; must be read before it can be handled
    SmsStored { storage: String, index: u32 },
    GpsStatus(GpsReport),
}

/// User handlers for modem events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_incoming_call(&self, modem: &dyn ModemControl, call: &IncomingCall)
        -> Result<()>;

    async fn on_call_ended(
        &self,
        _modem: &dyn ModemControl,
        call: &IncomingCall,
        reason: EndReason,
    ) -> Result<()> {
        debug!(call_id = call.id, ?reason, "Call ended");
        Ok(())
    }

    async fn on_sms(&self, modem: &dyn ModemControl, sms: &SmsMessage) -> Result<()>;

    async fn on_gps_report(&self, modem: &dyn ModemControl, report: &GpsReport) -> Result<()>;
}

/// Single consumer of the event channel
pub struct Dispatcher<H> {
    handler: H,
    dispatched: u64,
}

impl<H: EventHandler> Dispatcher<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            dispatched: 0,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    /// Number of events handed to the handler so far
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Handle events until the listener goes away or a handler fails
    pub async fn run(
        &mut self,
        modem: &dyn ModemControl,
        events: &mut mpsc::UnboundedReceiver<ModemEvent>,
    ) -> Result<()> {
        info!("Waiting for incoming calls or SMS messages");

        while let Some(event) = events.recv().await {
            self.dispatch(modem, event).await?;
        }

        warn!("Event channel closed, modem listener stopped");
        Err(Error::ChannelClosed)
    }

    pub async fn dispatch(&mut self, modem: &dyn ModemControl, event: ModemEvent) -> Result<()> {
        self.dispatched += 1;

        match event {
            ModemEvent::IncomingCall(call) => self.handler.on_incoming_call(modem, &call).await,
            ModemEvent::CallEnded { call, reason } => {
                self.handler.on_call_ended(modem, &call, reason).await
            }
            ModemEvent::SmsReceived(sms) => self.handler.on_sms(modem, &sms).await,
            ModemEvent::SmsStored { storage, index } => {
                debug!(storage = %storage, index, "Reading stored SMS");
                let sms = modem.read_sms(index).await?;
                if let Err(e) = modem.delete_sms(index).await {
                    warn!(index, error = %e, "Failed to delete stored SMS");
                }
                self.handler.on_sms(modem, &sms).await
            }
            ModemEvent::GpsStatus(report) => self.handler.on_gps_report(modem, &report).await,
        }
    }
}
