//! Value types exchanged across the driver boundary

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for driver boundary calls
pub type DriverResult<T> = Result<T, DriverFault>;

/// Failure reported by the driver for a single call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver fault {code}: {message}")]
pub struct DriverFault {
    pub code: i32,
    pub message: String,
}

impl DriverFault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Opaque handle to a driver device (board, voice channel or call-control channel)
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle(pub i32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev-{}", self.0)
    }
}

/// Call reference assigned by the driver when a call is offered or originated
///
/// The driver uses zero for "no call"; that value never becomes a `CallRef`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallRef(u32);

impl CallRef {
    pub fn new(raw: u32) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "crn-{}", self.0)
    }
}

/// Where a line lives on the boards: line ids are spread four channels to a board
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct LineAddress {
    pub line_id: u32,
    pub device_id: u32,
    pub board: u32,
    pub channel: u32,
}

impl LineAddress {
    pub const CHANNELS_PER_BOARD: u32 = 4;

    /// Line ids start at 1; the channel offset shifts them onto later channels
    pub fn for_line(line_id: u32, channel_offset: u32) -> Self {
        let device_id = line_id + channel_offset;
        let board = (device_id - 1) / Self::CHANNELS_PER_BOARD + 1;
        let channel = device_id - (board - 1) * Self::CHANNELS_PER_BOARD;
        Self {
            line_id,
            device_id,
            board,
            channel,
        }
    }

    pub fn voice_device_name(&self) -> String {
        format!("dxxxB{}C{}", self.board, self.channel)
    }

    pub fn call_control_device_name(&self) -> String {
        format!(
            ":P_SIP:N_iptB1T{}:M_ipmB1C{}:V_{}",
            self.line_id,
            self.device_id,
            self.voice_device_name()
        )
    }
}

/// Handles acquired when a line is opened
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LineHandles {
    pub voice: DeviceHandle,
    pub call_control: DeviceHandle,
}

/// Raw event kinds reported by `wait_event`
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    Offered,
    CallProcessing,
    Accept,
    Answered,
    Alerting,
    Connected,
    Disconnected,
    DropCall,
    ReleaseCall,
    TaskFail,
    ServiceResponse,
    PlayComplete,
    RecordComplete,
    CallProgressComplete,
    ToneDetected,
    Unblocked,
    Other(u32),
}

impl EventKind {
    /// Events owned by the call state machine
    pub fn is_call_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Offered
                | Self::CallProcessing
                | Self::Accept
                | Self::Answered
                | Self::Alerting
                | Self::Connected
                | Self::Disconnected
                | Self::DropCall
                | Self::ReleaseCall
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offered => write!(f, "OFFERED"),
            Self::CallProcessing => write!(f, "CALLPROC"),
            Self::Accept => write!(f, "ACCEPT"),
            Self::Answered => write!(f, "ANSWERED"),
            Self::Alerting => write!(f, "ALERTING"),
            Self::Connected => write!(f, "CONNECTED"),
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::DropCall => write!(f, "DROPCALL"),
            Self::ReleaseCall => write!(f, "RELEASECALL"),
            Self::TaskFail => write!(f, "TASKFAIL"),
            Self::ServiceResponse => write!(f, "SERVICERESP"),
            Self::PlayComplete => write!(f, "TDX_PLAY"),
            Self::RecordComplete => write!(f, "TDX_RECORD"),
            Self::CallProgressComplete => write!(f, "TDX_CALLP"),
            Self::ToneDetected => write!(f, "TONE"),
            Self::Unblocked => write!(f, "UNBLOCKED"),
            Self::Other(code) => write!(f, "EVENT_{code:#x}"),
        }
    }
}

/// One raw event pulled from the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub handle: DeviceHandle,
    pub call: Option<CallRef>,
    /// Termination reason for I/O completion events
    pub reason: TerminationReason,
    pub detail: Option<String>,
}

impl RawEvent {
    pub fn new(kind: EventKind, handle: DeviceHandle) -> Self {
        Self {
            kind,
            handle,
            call: None,
            reason: TerminationReason::NONE,
            detail: None,
        }
    }

    pub fn with_call(mut self, call: CallRef) -> Self {
        self.call = Some(call);
        self
    }

    pub fn with_reason(mut self, reason: TerminationReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Result of one bounded `wait_event` call
///
/// `Nothing` is ambiguous at this level: the driver reports a timeout and a wait failure
/// the same way, and only `last_error` can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitPoll {
    Event(RawEvent),
    Nothing,
}

/// Secondary status query used to disambiguate `WaitPoll::Nothing`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastError {
    /// No error recorded, so the wait timed out
    None,
    /// The device reports a timeout event
    TimedOut,
    /// Some other code; it is not known whether this was a real failure
    Code(i32),
}

/// Bitmask describing why an I/O operation stopped
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct TerminationReason(pub u32);

impl TerminationReason {
    pub const NONE: Self = Self(0);
    pub const MAX_DIGITS: Self = Self(0x0001);
    pub const MAX_SILENCE: Self = Self(0x0002);
    pub const LOOP_CURRENT_OFF: Self = Self(0x0008);
    pub const INTER_DIGIT_TIMEOUT: Self = Self(0x0010);
    pub const MAX_TIME: Self = Self(0x0020);
    pub const DIGIT: Self = Self(0x0040);
    pub const USER_STOP: Self = Self(0x0100);
    pub const END_OF_DATA: Self = Self(0x0200);
    pub const TONE: Self = Self(0x2000);
    pub const IO_ERROR: Self = Self(0x80000);

    pub fn contains(&self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for TerminationReason {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for TerminationReason {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TerminationReason, &str); 10] = [
            (TerminationReason::MAX_DIGITS, "MAX_DIGITS"),
            (TerminationReason::MAX_SILENCE, "MAX_SILENCE"),
            (TerminationReason::LOOP_CURRENT_OFF, "LOOP_CURRENT_OFF"),
            (TerminationReason::INTER_DIGIT_TIMEOUT, "INTER_DIGIT_TIMEOUT"),
            (TerminationReason::MAX_TIME, "MAX_TIME"),
            (TerminationReason::DIGIT, "DIGIT"),
            (TerminationReason::USER_STOP, "USER_STOP"),
            (TerminationReason::END_OF_DATA, "END_OF_DATA"),
            (TerminationReason::TONE, "TONE"),
            (TerminationReason::IO_ERROR, "IO_ERROR"),
        ];
        if self.is_empty() {
            return write!(f, "NORMAL");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Digits returned by a synchronous collection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedDigits {
    pub digits: String,
    pub reason: TerminationReason,
}

/// Call state as reported by the driver's side-channel query
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum DriverCallState {
    Null,
    Offered,
    Accepted,
    Alerting,
    Dialing,
    Connected,
    Disconnected,
    Idle,
}

/// Default audio format applied to every opened line
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate_hz: u32,
    pub bits_per_sample: u8,
    pub encoding: AudioEncoding,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum AudioEncoding {
    Pcm,
    Mulaw,
    Alaw,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate_hz: 8000,
            bits_per_sample: 8,
            encoding: AudioEncoding::Pcm,
        }
    }
}

/// Registration data submitted to the driver for a SIP line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub proxy: String,
    pub local_address: String,
    pub alias: String,
    pub password: String,
    pub realm: String,
    pub contact: String,
}

/// Outbound call request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    /// Calling party (`alias@proxy`)
    pub ani: String,
    /// Called party (`number@proxy`)
    pub dnis: String,
    pub user_agent: String,
    pub from_display: String,
    pub contact: String,
    pub timeout: Duration,
}

/// Raw call progress analysis outcome
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ProgressResult {
    Busy,
    OperatorIntercept,
    Connected,
    Error,
    FaxTone,
    NoAnswer,
    NoDialTone,
    NoRingback,
    Stopped,
    Unknown(i32),
}

/// How call progress analysis decided that a call connected
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConnectionKind {
    CadenceBreak,
    Digital,
    LoopCurrent,
    AnsweringMachine,
    VoiceDetected,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CallProgress {
    pub result: ProgressResult,
    pub connection: Option<ConnectionKind>,
    /// Length of the greeting heard after connect
    pub salutation_ms: u32,
}

impl CallProgress {
    pub fn connected() -> Self {
        Self {
            result: ProgressResult::Connected,
            connection: Some(ConnectionKind::VoiceDetected),
            salutation_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_address_spreads_over_boards() {
        let first = LineAddress::for_line(1, 0);
        assert_eq!((first.board, first.channel), (1, 1));
        assert_eq!(first.voice_device_name(), "dxxxB1C1");

        let fifth = LineAddress::for_line(5, 0);
        assert_eq!((fifth.board, fifth.channel), (2, 1));

        let shifted = LineAddress::for_line(3, 2);
        assert_eq!(shifted.device_id, 5);
        assert_eq!(shifted.voice_device_name(), "dxxxB2C1");
        assert_eq!(
            shifted.call_control_device_name(),
            ":P_SIP:N_iptB1T3:M_ipmB1C5:V_dxxxB2C1"
        );
    }

    #[test]
    fn test_zero_is_not_a_call_ref() {
        assert!(CallRef::new(0).is_none());
        assert_eq!(CallRef::new(7).map(|c| c.raw()), Some(7));
    }

    #[test]
    fn test_termination_reason_bits() {
        let reason = TerminationReason::MAX_DIGITS | TerminationReason::LOOP_CURRENT_OFF;
        assert!(reason.contains(TerminationReason::LOOP_CURRENT_OFF));
        assert!(!reason.contains(TerminationReason::USER_STOP));
        assert!(!reason.contains(TerminationReason::NONE));
        assert_eq!(format!("{reason:?}"), "MAX_DIGITS|LOOP_CURRENT_OFF");
        assert_eq!(format!("{:?}", TerminationReason::NONE), "NORMAL");
    }
}
