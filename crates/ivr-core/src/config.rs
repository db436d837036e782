//! Line configuration
//!
//! [`VoiceProperties`] carries every tunable the line code reads. It can be built in code
//! with the `with_*` methods, deserialized with serde, or filled in by key name from a
//! `key=value` properties text:
//!
//! ```text
//! prompt.attempts=3
//! getDigits.timeoutInMilliseconds=4000
//! sip.proxy_ip=10.0.0.5
//! sip.alias=ivr
//! ```
//!
//! Key names are resolved through [`PROPERTY_SETTERS`], a fixed table from key to a typed
//! setter. Unknown keys and unparsable values are configuration errors.
//!
//! # Example
//!
//! ```rust
//! use ivr_core::config::{TimeoutPolicy, VoiceProperties};
//!
//! let props = VoiceProperties::from_properties_str(
//!     "prompt.attempts=3\nprompt.timeoutPolicy=attempt\n",
//! )
//! .unwrap()
//! .with_digits_timeout_ms(3000);
//!
//! assert_eq!(props.prompt_attempts, 3);
//! assert_eq!(props.timeout_policy, TimeoutPolicy::CountsAsAttempt);
//! assert_eq!(props.digits_timeout_ms, 3000);
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::driver::{AudioFormat, Registration};
use crate::error::{LineError, LineResult};
use crate::tones::CustomTone;

/// Default poll slice for every event wait
pub const POLL_SLICE: Duration = Duration::from_millis(1000);

/// How an inter-digit timeout is charged against a prompt's budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// A timed-out iteration counts like any other: it consumes an attempt, and a blank
    /// attempt too when nothing was typed
    #[default]
    CountsAsBlank,
    /// A timed-out iteration consumes an attempt but never a blank attempt
    CountsAsAttempt,
}

/// SIP line settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipSettings {
    pub channel_offset: u32,
    pub max_calls: u32,
    pub signaling_port: u16,
    pub proxy_ip: Option<String>,
    pub local_ip: String,
    pub alias: Option<String>,
    pub password: Option<String>,
    pub realm: Option<String>,
    /// Defaults to `alias@local_ip:signaling_port`
    pub contact: Option<String>,
    pub user_agent: String,
    pub from_display: String,
    pub registration_timeout_ms: u64,
}

impl Default for SipSettings {
    fn default() -> Self {
        Self {
            channel_offset: 0,
            max_calls: 1,
            signaling_port: 5060,
            proxy_ip: None,
            local_ip: "127.0.0.1".to_string(),
            alias: None,
            password: None,
            realm: None,
            contact: None,
            user_agent: format!("ivr-core/{}", env!("CARGO_PKG_VERSION")),
            from_display: String::new(),
            registration_timeout_ms: 10_000,
        }
    }
}

impl SipSettings {
    pub fn contact(&self) -> String {
        match &self.contact {
            Some(contact) => contact.clone(),
            None => format!(
                "{}@{}:{}",
                self.alias.as_deref().unwrap_or_default(),
                self.local_ip,
                self.signaling_port
            ),
        }
    }

    /// Registration data, when both a proxy and an alias are configured
    pub fn registration(&self) -> Option<Registration> {
        let proxy = self.proxy_ip.clone()?;
        let alias = self.alias.clone()?;
        Some(Registration {
            proxy,
            local_address: self.local_ip.clone(),
            contact: self.contact(),
            alias,
            password: self.password.clone().unwrap_or_default(),
            realm: self.realm.clone().unwrap_or_default(),
        })
    }
}

/// All tunables for lines opened by one [`crate::session::LineManager`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceProperties {
    /// Attempts for multi-try prompts that don't set their own
    pub prompt_attempts: u32,
    /// Consecutive blank attempts for multi-try prompts that don't set their own
    pub prompt_blank_attempts: u32,
    pub digits_timeout_ms: u32,
    /// Largest digit count the driver accepts in one request
    pub max_digits_supported: u32,
    pub poll_slice_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub record_timeout_ms: u32,
    pub play_completion_timeout_ms: u64,
    pub record_completion_timeout_ms: u64,
    /// How long stray events are drained after a hang-up interrupts playback or recording
    pub hangup_drain_ms: u64,
    pub system_recordings_dir: PathBuf,
    pub audio_format: AudioFormat,
    pub pre_test_dial_tone: bool,
    pub answering_machine_min_ms: u32,
    pub dial_tone: CustomTone,
    pub extra_tones: Vec<CustomTone>,
    pub sip: SipSettings,
}

impl Default for VoiceProperties {
    fn default() -> Self {
        Self {
            prompt_attempts: 99,
            prompt_blank_attempts: 5,
            digits_timeout_ms: 5000,
            max_digits_supported: 15,
            poll_slice_ms: POLL_SLICE.as_millis() as u64,
            timeout_policy: TimeoutPolicy::default(),
            record_timeout_ms: 5 * 60 * 1000,
            play_completion_timeout_ms: 60_000,
            record_completion_timeout_ms: 180_000,
            hangup_drain_ms: 2000,
            system_recordings_dir: PathBuf::from("System Recordings"),
            audio_format: AudioFormat::default(),
            pre_test_dial_tone: false,
            answering_machine_min_ms: 1000,
            dial_tone: CustomTone::dial_tone(),
            extra_tones: Vec::new(),
            sip: SipSettings::default(),
        }
    }
}

impl VoiceProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` lines; `#` and `!` start comment lines
    pub fn from_properties_str(text: &str) -> LineResult<Self> {
        let mut props = Self::default();
        props.apply_properties_str(text)?;
        Ok(props)
    }

    pub fn apply_properties_str(&mut self, text: &str) -> LineResult<()> {
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                LineError::config(format!("line {}: expected key=value, got '{line}'", number + 1))
            })?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> LineResult<Self> {
        serde_json::from_str(json).map_err(|e| LineError::config(format!("invalid JSON: {e}")))
    }

    /// Set one property by key name
    pub fn set(&mut self, key: &str, value: &str) -> LineResult<()> {
        let setter = PROPERTY_SETTERS
            .get(key)
            .ok_or_else(|| LineError::config(format!("unknown property '{key}'")))?;
        setter(self, value).map_err(|e| match e {
            LineError::Configuration { message } => {
                LineError::config(format!("{key}: {message}"))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> LineResult<()> {
        if self.prompt_attempts == 0 {
            return Err(LineError::config("prompt.attempts must be at least 1"));
        }
        if self.prompt_blank_attempts == 0 {
            return Err(LineError::config("prompt.blankAttempts must be at least 1"));
        }
        if self.poll_slice_ms == 0 {
            return Err(LineError::config("line.pollSliceMilliseconds must be positive"));
        }
        if self.max_digits_supported == 0 {
            return Err(LineError::config("getDigits.maxDigits must be at least 1"));
        }
        if self.sip.max_calls == 0 {
            return Err(LineError::config("sip.max_calls must be at least 1"));
        }
        if self.answering_machine_min_ms < 1000 {
            return Err(LineError::config(
                "dial.answeringMachineMinMilliseconds must be at least 1000",
            ));
        }
        Ok(())
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    /// Custom tones reinstalled on every line open, dial tone first
    pub fn tones(&self) -> Vec<CustomTone> {
        std::iter::once(self.dial_tone)
            .chain(self.extra_tones.iter().copied())
            .collect()
    }

    pub fn with_prompt_attempts(mut self, attempts: u32) -> Self {
        self.prompt_attempts = attempts;
        self
    }

    pub fn with_prompt_blank_attempts(mut self, attempts: u32) -> Self {
        self.prompt_blank_attempts = attempts;
        self
    }

    pub fn with_digits_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.digits_timeout_ms = timeout_ms;
        self
    }

    pub fn with_poll_slice(mut self, slice: Duration) -> Self {
        self.poll_slice_ms = slice.as_millis() as u64;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_system_recordings_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.system_recordings_dir = dir.into();
        self
    }

    pub fn with_pre_test_dial_tone(mut self, enabled: bool) -> Self {
        self.pre_test_dial_tone = enabled;
        self
    }

    pub fn with_tone(mut self, tone: CustomTone) -> Self {
        self.extra_tones.push(tone);
        self
    }

    pub fn with_sip(mut self, sip: SipSettings) -> Self {
        self.sip = sip;
        self
    }
}

/// Typed setter for one property key
pub type PropertySetter = fn(&mut VoiceProperties, &str) -> LineResult<()>;

fn parse<T: std::str::FromStr>(value: &str) -> LineResult<T> {
    value
        .parse::<T>()
        .map_err(|_| LineError::config(format!("invalid value '{value}'")))
}

fn parse_bool(value: &str) -> LineResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(LineError::config(format!("invalid boolean '{value}'"))),
    }
}

fn optional(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Key name to setter, checked once at first use
pub static PROPERTY_SETTERS: Lazy<HashMap<&'static str, PropertySetter>> = Lazy::new(|| {
    let entries: [(&'static str, PropertySetter); 26] = [
        ("prompt.attempts", |p, v| {
            p.prompt_attempts = parse(v)?;
            Ok(())
        }),
        ("prompt.blankAttempts", |p, v| {
            p.prompt_blank_attempts = parse(v)?;
            Ok(())
        }),
        ("prompt.timeoutPolicy", |p, v| {
            p.timeout_policy = match v {
                "blank" => TimeoutPolicy::CountsAsBlank,
                "attempt" => TimeoutPolicy::CountsAsAttempt,
                _ => return Err(LineError::config(format!("expected blank or attempt, got '{v}'"))),
            };
            Ok(())
        }),
        ("getDigits.timeoutInMilliseconds", |p, v| {
            p.digits_timeout_ms = parse(v)?;
            Ok(())
        }),
        ("getDigits.maxDigits", |p, v| {
            p.max_digits_supported = parse(v)?;
            Ok(())
        }),
        ("line.pollSliceMilliseconds", |p, v| {
            p.poll_slice_ms = parse(v)?;
            Ok(())
        }),
        ("record.timeoutInMilliseconds", |p, v| {
            p.record_timeout_ms = parse(v)?;
            Ok(())
        }),
        ("play.completionTimeoutInMilliseconds", |p, v| {
            p.play_completion_timeout_ms = parse(v)?;
            Ok(())
        }),
        ("record.completionTimeoutInMilliseconds", |p, v| {
            p.record_completion_timeout_ms = parse(v)?;
            Ok(())
        }),
        ("line.hangupDrainMilliseconds", |p, v| {
            p.hangup_drain_ms = parse(v)?;
            Ok(())
        }),
        ("phrase.systemRecordings", |p, v| {
            p.system_recordings_dir = PathBuf::from(v);
            Ok(())
        }),
        ("dial.preTestDialTone", |p, v| {
            p.pre_test_dial_tone = parse_bool(v)?;
            Ok(())
        }),
        ("dial.answeringMachineMinMilliseconds", |p, v| {
            p.answering_machine_min_ms = parse(v)?;
            Ok(())
        }),
        ("customTone.dialTone", |p, v| {
            p.dial_tone = CustomTone::parse(crate::tones::DIAL_TONE_TID, v)?;
            Ok(())
        }),
        ("customTone.extra", |p, v| {
            p.extra_tones.push(v.parse()?);
            Ok(())
        }),
        ("sip.channel_offset", |p, v| {
            p.sip.channel_offset = parse(v)?;
            Ok(())
        }),
        ("sip.max_calls", |p, v| {
            p.sip.max_calls = parse(v)?;
            Ok(())
        }),
        ("sip.sip_signaling_port", |p, v| {
            p.sip.signaling_port = parse(v)?;
            Ok(())
        }),
        ("sip.proxy_ip", |p, v| {
            p.sip.proxy_ip = optional(v);
            Ok(())
        }),
        ("sip.local_ip", |p, v| {
            p.sip.local_ip = v.to_string();
            Ok(())
        }),
        ("sip.alias", |p, v| {
            p.sip.alias = optional(v);
            Ok(())
        }),
        ("sip.password", |p, v| {
            p.sip.password = optional(v);
            Ok(())
        }),
        ("sip.realm", |p, v| {
            p.sip.realm = optional(v);
            Ok(())
        }),
        ("sip.contact", |p, v| {
            p.sip.contact = optional(v);
            Ok(())
        }),
        ("sip.user_agent", |p, v| {
            p.sip.user_agent = v.to_string();
            Ok(())
        }),
        ("sip.from", |p, v| {
            p.sip.from_display = v.to_string();
            Ok(())
        }),
    ];
    entries.into_iter().collect()
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tones::ToneShape;

    #[test]
    fn test_defaults() {
        let props = VoiceProperties::default();
        assert_eq!(props.prompt_attempts, 99);
        assert_eq!(props.prompt_blank_attempts, 5);
        assert_eq!(props.digits_timeout_ms, 5000);
        assert_eq!(props.poll_slice(), POLL_SLICE);
        assert_eq!(props.record_timeout_ms, 300_000);
        assert_eq!(props.sip.signaling_port, 5060);
        assert_eq!(props.dial_tone.tid, 306);
        assert!(props.validate().is_ok());
    }

    #[test]
    fn test_properties_text() {
        let props = VoiceProperties::from_properties_str(
            "# comment\n\
             prompt.attempts = 3\n\
             prompt.blankAttempts=2\n\
             sip.proxy_ip=10.0.0.5\n\
             sip.alias=ivr\n\
             sip.password=secret\n\
             dial.preTestDialTone=yes\n\
             customTone.extra=400:1000,50,T\n",
        )
        .unwrap();
        assert_eq!(props.prompt_attempts, 3);
        assert_eq!(props.prompt_blank_attempts, 2);
        assert!(props.pre_test_dial_tone);
        assert_eq!(props.extra_tones.len(), 1);
        assert_eq!(props.tones().len(), 2);

        let registration = props.sip.registration().unwrap();
        assert_eq!(registration.proxy, "10.0.0.5");
        assert_eq!(registration.contact, "ivr@127.0.0.1:5060");
        assert_eq!(registration.password, "secret");
    }

    #[test]
    fn test_unknown_key_and_bad_value() {
        let err = VoiceProperties::from_properties_str("nope=1").unwrap_err();
        assert!(matches!(err, LineError::Configuration { .. }));

        let err = VoiceProperties::from_properties_str("prompt.attempts=many").unwrap_err();
        assert!(err.to_string().contains("prompt.attempts"));

        let err = VoiceProperties::from_properties_str("missing-equals").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_dial_tone_override() {
        let mut props = VoiceProperties::default();
        props.set("customTone.dialTone", "350,20,T").unwrap();
        assert!(matches!(props.dial_tone.shape, ToneShape::Single { frequency: 350, .. }));
    }

    #[test]
    fn test_no_registration_without_proxy() {
        let sip = SipSettings {
            alias: Some("ivr".into()),
            ..Default::default()
        };
        assert!(sip.registration().is_none());
    }

    #[test]
    fn test_validate_rejects_zero_budgets() {
        assert!(VoiceProperties::default().with_prompt_attempts(0).validate().is_err());
        let mut props = VoiceProperties::default();
        props.poll_slice_ms = 0;
        assert!(props.validate().is_err());
    }

    #[test]
    fn test_json_round_trip_keeps_policy() {
        let props = VoiceProperties::default().with_timeout_policy(TimeoutPolicy::CountsAsAttempt);
        let json = serde_json::to_string(&props).unwrap();
        let parsed = VoiceProperties::from_json_str(&json).unwrap();
        assert_eq!(parsed.timeout_policy, TimeoutPolicy::CountsAsAttempt);
        assert_eq!(parsed, props);
    }
}
