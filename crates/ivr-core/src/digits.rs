//! Digit collection
//!
//! [`Line::get_digits`] is the direct entry point; the prompt engine uses the tagged
//! [`CollectOutcome`] underneath it so that timeouts and hang-ups are plain values rather
//! than errors.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

use crate::driver::{DriverFault, TerminationReason};
use crate::error::{LineError, LineResult};
use crate::line::Line;
use crate::logging::line_span;
use crate::termination::TerminationSet;

/// Appended to the digits when an inter-digit timeout ends a collection whose
/// terminators include it
pub const TIMEOUT_MARKER: char = 't';

const FLUSH_TERMINATORS: &str = "T";
const FLUSH_TIMEOUT_MS: u32 = 100;
const DRAIN_SLICE: Duration = Duration::from_millis(50);

/// Result of one collection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Raw digits, terminator and timeout marker still attached
    Digits(String),
    /// Inter-digit timeout with no timeout marker allowed; carries what was typed
    TimedOut(String),
    Hangup,
    Disposing,
}

/// How a driver I/O operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interruption {
    None,
    IoError,
    UserStop,
    Hangup,
}

impl Interruption {
    pub(crate) fn from_reason(reason: TerminationReason) -> Self {
        if reason.contains(TerminationReason::IO_ERROR) {
            Self::IoError
        } else if reason.contains(TerminationReason::USER_STOP) {
            Self::UserStop
        } else if reason.contains(TerminationReason::LOOP_CURRENT_OFF) {
            Self::Hangup
        } else {
            Self::None
        }
    }

    /// Errors for everything but a normal completion
    pub(crate) fn into_result(self, operation: &str) -> LineResult<()> {
        match self {
            Self::None => Ok(()),
            Self::IoError => Err(LineError::driver(
                operation,
                DriverFault::new(-1, "I/O error terminated the operation"),
            )),
            Self::UserStop => Err(LineError::Disposing),
            Self::Hangup => Err(LineError::Hangup),
        }
    }
}

/// Digits with a trailing terminator split off
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrippedDigits {
    pub digits: String,
    pub terminator: Option<char>,
}

/// Split a trailing terminator off `raw` when it is one of `terminators`
///
/// Terminators match case-insensitively, so `a` and `A` are the same key.
pub fn strip_terminator(raw: &str, terminators: &str) -> StrippedDigits {
    let Some(last) = raw.chars().last() else {
        return StrippedDigits {
            digits: String::new(),
            terminator: None,
        };
    };
    let matches = terminators
        .chars()
        .any(|t| t.eq_ignore_ascii_case(&last));
    if matches {
        StrippedDigits {
            digits: raw[..raw.len() - last.len_utf8()].to_string(),
            terminator: Some(last),
        }
    } else {
        StrippedDigits {
            digits: raw.to_string(),
            terminator: None,
        }
    }
}

impl Line {
    /// One collection request against the driver, interpreted
    pub(crate) async fn collect_digits(
        &mut self,
        count: u32,
        terminators: &str,
        timeout_ms: u32,
    ) -> LineResult<CollectOutcome> {
        match self.check_call_state().await {
            Err(LineError::Hangup) => return Ok(CollectOutcome::Hangup),
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let set = TerminationSet::build(count, terminators, timeout_ms, self.props.max_digits_supported);
        trace!(line = self.id, conditions = %set, "collecting digits");

        let collected = self
            .driver
            .get_digits(self.handles.voice, &set)
            .await
            .map_err(|fault| LineError::driver("get_digits", fault))?;

        match self.check_call_state().await {
            Err(LineError::Hangup) => return Ok(CollectOutcome::Hangup),
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        match Interruption::from_reason(collected.reason) {
            Interruption::None => {}
            Interruption::Hangup => {
                self.hangup_detected().await;
                return Ok(CollectOutcome::Hangup);
            }
            Interruption::UserStop => return Ok(CollectOutcome::Disposing),
            interruption @ Interruption::IoError => {
                interruption.into_result("get_digits")?;
            }
        }

        self.driver
            .clear_digit_buffer(self.handles.voice)
            .await
            .map_err(|fault| LineError::driver("clear_digit_buffer", fault))?;

        let mut digits = collected.digits;
        let timed_out = collected.reason.contains(TerminationReason::INTER_DIGIT_TIMEOUT);
        self.drain_events(DRAIN_SLICE).await;

        if timed_out {
            if !terminators.contains(TIMEOUT_MARKER) {
                debug!(line = self.id, typed = %digits, "digit collection timed out");
                return Ok(CollectOutcome::TimedOut(digits));
            }
            digits.push(TIMEOUT_MARKER);
        }
        Ok(CollectOutcome::Digits(digits))
    }

    /// Collect up to `count` digits using the configured inter-digit timeout
    ///
    /// A trailing key from `terminators` is removed from the result and kept as
    /// [`Line::last_terminator`]. Put `t` in `terminators` to have a timeout end the
    /// collection normally instead of failing with [`LineError::DigitsTimeout`].
    pub async fn get_digits(&mut self, count: u32, terminators: &str) -> LineResult<String> {
        let timeout_ms = self.props.digits_timeout_ms;
        self.get_digits_with_timeout(count, terminators, timeout_ms).await
    }

    pub async fn get_digits_with_timeout(
        &mut self,
        count: u32,
        terminators: &str,
        timeout_ms: u32,
    ) -> LineResult<String> {
        self.check_dispose()?;
        let span = line_span(self.id);
        let collected = self
            .collect_digits(count, terminators, timeout_ms)
            .instrument(span)
            .await;
        let result = match collected {
            Ok(CollectOutcome::Digits(raw)) => {
                let stripped = strip_terminator(&raw, terminators);
                self.last_terminator = stripped.terminator.map(String::from).unwrap_or_default();
                Ok(stripped.digits)
            }
            Ok(CollectOutcome::TimedOut(_)) => Err(LineError::DigitsTimeout),
            Ok(CollectOutcome::Hangup) => Err(LineError::Hangup),
            Ok(CollectOutcome::Disposing) => Err(LineError::Disposing),
            Err(e) => Err(e),
        };
        self.settle(result)
    }

    pub async fn get_digits_with_cancel(
        &mut self,
        count: u32,
        terminators: &str,
        token: &CancellationToken,
    ) -> LineResult<String> {
        self.cancel = Some(token.clone());
        let result = self.get_digits(count, terminators).await;
        self.cancel = None;
        result
    }

    /// Read and discard whatever the caller typed ahead
    ///
    /// Returns the discarded digits.
    pub async fn flush_digit_buffer(&mut self) -> LineResult<String> {
        self.check_dispose()?;
        let result = self.flush_digit_buffer_inner().await;
        self.settle(result)
    }

    pub(crate) async fn flush_digit_buffer_inner(&mut self) -> LineResult<String> {
        let count = self.props.max_digits_supported;
        match self.collect_digits(count, FLUSH_TERMINATORS, FLUSH_TIMEOUT_MS).await? {
            CollectOutcome::Digits(raw) => Ok(strip_terminator(&raw, FLUSH_TERMINATORS).digits),
            CollectOutcome::TimedOut(typed) => Ok(typed),
            CollectOutcome::Hangup => Err(LineError::Hangup),
            CollectOutcome::Disposing => Err(LineError::Disposing),
        }
    }
}
