//! Configuration and constants

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Serial port the modem is attached to
pub const DEFAULT_PORT: &str = "/dev/ttyS1";

/// Modem UART speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Number of characters echoed back in an SMS reply
pub const SMS_ECHO_LIMIT: usize = 20;

/// Run bound: huge, but finite so the wait stays interruptible
pub const RUN_TIMEOUT_SECS: u64 = 1 << 31;

/// Tones played after answering a call
pub const DEFAULT_DTMF_TONES: &str = "123";

/// All configurable settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: String,
    pub baud_rate: u32,
    /// SIM card PIN (if any)
    pub pin: Option<String>,
    pub command_timeout_ms: u64,
    pub sms_timeout_ms: u64,
    /// Older modems struggle to send DTMF right after answering
    pub dtmf_settle_ms: u64,
    pub dtmf_tones: String,
    /// How long a RING waits for its +CLIP before it is reported without one
    pub caller_id_wait_ms: u64,
    /// Seconds between unsolicited GNSS reports (0 disables them)
    pub gps_report_interval: u8,
    pub run_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            pin: None,
            command_timeout_ms: 10_000,
            sms_timeout_ms: 60_000,
            dtmf_settle_ms: 2_000,
            dtmf_tones: DEFAULT_DTMF_TONES.to_string(),
            caller_id_wait_ms: 1_000,
            gps_report_interval: 10,
            run_timeout_secs: RUN_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Create config for testing: short timeouts, no settling delay
    pub fn for_test() -> Self {
        Self {
            port: "/dev/null".to_string(),
            command_timeout_ms: 500,
            sms_timeout_ms: 500,
            dtmf_settle_ms: 0,
            ..Self::default()
        }
    }

    /// Load overrides from a JSON file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the per-user config file if present, otherwise the defaults
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(Error::Config("port must not be empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(Error::Config("baud_rate must be positive".to_string()));
        }
        if let Some(bad) = self.dtmf_tones.chars().find(|c| !is_dtmf_tone(*c)) {
            return Err(Error::Config(format!("invalid DTMF tone '{}'", bad)));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn sms_timeout(&self) -> Duration {
        Duration::from_millis(self.sms_timeout_ms)
    }

    pub fn dtmf_settle(&self) -> Duration {
        Duration::from_millis(self.dtmf_settle_ms)
    }

    pub fn caller_id_wait(&self) -> Duration {
        Duration::from_millis(self.caller_id_wait_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

/// `~/.config/gsm-modem/config.json` (platform equivalent)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gsm-modem").join("config.json"))
}

/// Characters accepted by `AT+VTS`
pub fn is_dtmf_tone(c: char) -> bool {
    matches!(c, '0'..='9' | '*' | '#' | 'A'..='D')
}
