//! SMS messages in text mode

use crate::at::{normalize_number, split_fields};
use crate::config::SMS_ECHO_LIMIT;
use crate::error::{Error, Result};
use crate::session::ModemControl;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

// 24/05/01,12:30:00+08 (offset in quarter hours)
static SMS_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?<yy>\d{2})/(?<mo>\d{2})/(?<dd>\d{2}),(?<hh>\d{2}):(?<mi>\d{2}):(?<ss>\d{2})(?<sign>[+-])(?<tz>\d{1,2})$",
    )
    .expect("Invalid SMS timestamp regex")
});

/// A received SMS
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsMessage {
    pub number: String,
    pub time: DateTime<FixedOffset>,
    pub text: String,
    /// Storage slot, when the message was read from modem memory
    pub index: Option<u32>,
}

impl SmsMessage {
    /// Build a message from the modem's header fields; unparseable
    /// timestamps fall back to the local receipt time
    pub fn new(number: &str, timestamp: &str, text: String, index: Option<u32>) -> Self {
        let time = parse_sms_timestamp(timestamp).unwrap_or_else(|| {
            warn!(timestamp, "Unparseable SMS timestamp, using receipt time");
            Utc::now().fixed_offset()
        });

        Self {
            number: normalize_number(number),
            time,
            text,
            index,
        }
    }

    /// Send a new message back to the sender
    pub async fn reply(&self, modem: &dyn ModemControl, text: &str) -> Result<u16> {
        modem.send_sms(&self.number, text).await
    }
}

/// Reply body echoing the start of the received text
pub fn echo_reply(text: &str) -> String {
    let truncated = text.chars().count() > SMS_ECHO_LIMIT;
    let head: String = text.chars().take(SMS_ECHO_LIMIT).collect();
    format!(
        "SMS received: \"{}{}\"",
        head,
        if truncated { "..." } else { "" }
    )
}

/// Parse `yy/MM/dd,hh:mm:ss±zz`
pub fn parse_sms_timestamp(timestamp: &str) -> Option<DateTime<FixedOffset>> {
    let caps = SMS_TIMESTAMP.captures(timestamp.trim())?;
    let num = |name: &str| caps[name].parse::<u32>().ok();

    let date = NaiveDate::from_ymd_opt(2000 + num("yy")? as i32, num("mo")?, num("dd")?)?;
    let naive = date.and_hms_opt(num("hh")?, num("mi")?, num("ss")?)?;

    let offset_secs = num("tz")? as i32 * 15 * 60;
    let offset = match &caps["sign"] {
        "-" => FixedOffset::west_opt(offset_secs)?,
        _ => FixedOffset::east_opt(offset_secs)?,
    };

    offset.from_local_datetime(&naive).single()
}

/// Parse the lines of an `AT+CMGR=<index>` response
pub fn parse_read_response(lines: &[String], index: u32) -> Result<SmsMessage> {
    let header_pos = lines
        .iter()
        .position(|l| l.starts_with("+CMGR:"))
        .ok_or_else(|| Error::Parse(format!("no +CMGR header for message {}", index)))?;

    let header = &lines[header_pos]["+CMGR:".len()..];
    let fields = split_fields(header);
    // <stat>,<oa>,[<alpha>],<scts>
    if fields.len() < 4 {
        return Err(Error::Parse(format!("short +CMGR header: {}", header)));
    }

    let text = lines[header_pos + 1..].join("\n");
    Ok(SmsMessage::new(&fields[1], &fields[3], text, Some(index)))
}
