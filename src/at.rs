//! AT line classification
//!
//! Every line the modem emits is either a final result code that ends the
//! in-flight command, an unsolicited result code (URC), the SMS text prompt,
//! or an intermediate data line belonging to the current command.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Ctrl-Z terminates an SMS body
pub const CTRL_Z: u8 = 0x1a;

static CME_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CME ERROR: ?(?<code>\d+)").expect("Invalid CME regex"));
static CMS_ERROR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CMS ERROR: ?(?<code>\d+)").expect("Invalid CMS regex"));
static CRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CRING: ?(?<kind>.+)$").expect("Invalid CRING regex"));
static CMTI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\+CMTI: ?"(?<storage>[^"]*)",(?<index>\d+)"#).expect("Invalid CMTI regex")
});
static CSQ: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CSQ: ?(?<rssi>\d+),(?<ber>\d+)").expect("Invalid CSQ regex"));
static CMGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+CMGS: ?(?<mr>\d+)").expect("Invalid CMGS regex"));

/// Category of an error result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CauseKind {
    /// `+CME ERROR: <n>` (equipment)
    Cme,
    /// `+CMS ERROR: <n>` (message service)
    Cms,
    /// Plain `ERROR`
    Error,
    /// Call dropped while the command was pending
    NoCarrier,
}

/// Why the modem rejected a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCause {
    pub kind: CauseKind,
    pub code: Option<u16>,
}

impl ErrorCause {
    pub fn new(kind: CauseKind, code: Option<u16>) -> Self {
        Self { kind, code }
    }

    pub fn no_carrier() -> Self {
        Self::new(CauseKind::NoCarrier, None)
    }
}

impl fmt::Display for CauseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CauseKind::Cme => write!(f, "CME"),
            CauseKind::Cms => write!(f, "CMS"),
            CauseKind::Error => write!(f, "ERROR"),
            CauseKind::NoCarrier => write!(f, "NO CARRIER"),
        }
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} Error {}", self.kind, code),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Line that ends a command response
#[derive(Debug, Clone, PartialEq)]
pub enum FinalResult {
    Ok,
    Error(ErrorCause),
}

/// How a call was ended by the network or the remote party
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    NoCarrier,
    Busy,
    NoAnswer,
}

/// Unsolicited result code
#[derive(Debug, Clone, PartialEq)]
pub enum Urc {
    /// `RING` or `+CRING: VOICE`
    Ring,
    /// `+CLIP: "<number>",<type>,...`
    CallerId { number: String },
    CallEnded(EndReason),
    /// `+CMTI: "<storage>",<index>`
    SmsStored { storage: String, index: u32 },
    /// `+CMT: "<number>",,"<timestamp>"`; the body follows on the next line
    SmsDelivered { number: String, timestamp: String },
    /// `+UGNSINF: <fields>`
    GpsStatus { fields: String },
}

/// Classified modem line
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Final(FinalResult),
    Urc(Urc),
    /// `> ` prompt asking for the SMS body
    Prompt,
    Data(String),
}

/// Classify one line (without its trailing CR LF)
pub fn classify(line: &str) -> Line {
    let line = line.trim();

    match line {
        "OK" => return Line::Final(FinalResult::Ok),
        "ERROR" => return Line::Final(FinalResult::Error(ErrorCause::new(CauseKind::Error, None))),
        "RING" => return Line::Urc(Urc::Ring),
        "NO CARRIER" => return Line::Urc(Urc::CallEnded(EndReason::NoCarrier)),
        "BUSY" => return Line::Urc(Urc::CallEnded(EndReason::Busy)),
        "NO ANSWER" => return Line::Urc(Urc::CallEnded(EndReason::NoAnswer)),
        ">" => return Line::Prompt,
        _ => {}
    }

    if let Some(caps) = CME_ERROR.captures(line) {
        let code = caps["code"].parse().ok();
        return Line::Final(FinalResult::Error(ErrorCause::new(CauseKind::Cme, code)));
    }
    if let Some(caps) = CMS_ERROR.captures(line) {
        let code = caps["code"].parse().ok();
        return Line::Final(FinalResult::Error(ErrorCause::new(CauseKind::Cms, code)));
    }
    if let Some(caps) = CRING.captures(line) {
        // Data and fax calls are not handled
        if caps["kind"].trim().starts_with("VOICE") {
            return Line::Urc(Urc::Ring);
        }
        return Line::Data(line.to_string());
    }
    if let Some(rest) = line.strip_prefix("+CLIP:") {
        let fields = split_fields(rest);
        let number = fields.first().cloned().unwrap_or_default();
        return Line::Urc(Urc::CallerId {
            number: normalize_number(&number),
        });
    }
    if let Some(caps) = CMTI.captures(line) {
        if let Ok(index) = caps["index"].parse() {
            return Line::Urc(Urc::SmsStored {
                storage: caps["storage"].to_string(),
                index,
            });
        }
    }
    if let Some(rest) = line.strip_prefix("+CMT:") {
        let fields = split_fields(rest);
        let number = fields.first().cloned().unwrap_or_default();
        let timestamp = fields.last().cloned().unwrap_or_default();
        return Line::Urc(Urc::SmsDelivered {
            number: normalize_number(&number),
            timestamp,
        });
    }
    if let Some(rest) = line.strip_prefix("+UGNSINF:") {
        return Line::Urc(Urc::GpsStatus {
            fields: rest.trim().to_string(),
        });
    }

    Line::Data(line.to_string())
}

/// Split a comma separated parameter list, honoring double quotes
pub fn split_fields(params: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in params.trim().chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    fields.push(current.trim().to_string());

    fields
}

/// Remove formatting from a phone number, keeping a leading +
pub fn normalize_number(number: &str) -> String {
    let trimmed = number.trim();
    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();

    if has_plus && !digits.is_empty() {
        format!("+{}", digits)
    } else {
        digits
    }
}

/// Parse `+CSQ: <rssi>,<ber>` into the raw rssi value (99 means unknown)
pub fn parse_signal_quality(line: &str) -> Option<u8> {
    CSQ.captures(line.trim())
        .and_then(|caps| caps["rssi"].parse().ok())
}

/// Parse `+CMGS: <mr>` into the message reference
pub fn parse_message_reference(line: &str) -> Option<u16> {
    CMGS.captures(line.trim()).and_then(|caps| caps["mr"].parse().ok())
}

/// Quote a string parameter for an AT command
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', ""))
}
