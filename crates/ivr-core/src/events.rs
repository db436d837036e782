//! Event dispatch loop
//!
//! Every wait is a sequence of bounded `wait_event` polls, one poll slice each, so that
//! a dispose request or a cancelled token is seen between two polls. Call lifecycle
//! events are handed to the call state machine as they arrive, whatever the caller is
//! waiting for.

use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::call::CallSignal;
use crate::driver::{DeviceHandle, EventKind, LastError, RawEvent, WaitPoll};
use crate::error::{LineError, LineResult};
use crate::line::Line;

/// Slices per round of an indefinite wait
const INDEFINITE_ROUND: u32 = 5;

/// Upper bound on events discarded by one drain
const DRAIN_LIMIT: usize = 64;

/// Outcome of waiting for one event kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    Success(RawEvent),
    /// The polling budget ran out
    Expired,
    /// The driver reported a failure while waiting
    Error,
}

/// Number of poll slices that cover `max_wait`, at least one
pub fn slices_for(max_wait: Duration, slice: Duration) -> u32 {
    if slice.is_zero() {
        return 1;
    }
    let slices = max_wait.as_millis().div_ceil(slice.as_millis());
    slices.clamp(1, u32::MAX as u128) as u32
}

enum EmptyPoll {
    TimedOut,
    Failed,
}

impl Line {
    fn line_handles(&self) -> [DeviceHandle; 3] {
        [self.handles.call_control, self.board, self.handles.voice]
    }

    /// Wait up to `max_wait` for an event of kind `target` on any of the line's devices
    /// or the board
    ///
    /// Fails with `Hangup` when the call is released before the target arrives, and with
    /// `Disposing` when a dispose request is seen between polls.
    pub(crate) async fn wait_for_event(&mut self, target: EventKind, max_wait: Duration) -> LineResult<WaitResult> {
        self.poll_for_event(target, max_wait, true).await
    }

    /// Like [`Line::wait_for_event`] but ignores dispose requests; used while tearing a
    /// call down, which must finish either way
    pub(crate) async fn wait_for_event_uninterruptible(
        &mut self,
        target: EventKind,
        max_wait: Duration,
    ) -> LineResult<WaitResult> {
        self.poll_for_event(target, max_wait, false).await
    }

    /// Wait for `target`, turning expiry and wait failures into errors
    pub(crate) async fn expect_event(&mut self, target: EventKind, max_wait: Duration) -> LineResult<RawEvent> {
        match self.wait_for_event(target, max_wait).await? {
            WaitResult::Success(event) => Ok(event),
            WaitResult::Expired => Err(LineError::wait_expired(target)),
            WaitResult::Error => Err(LineError::wait_failed(target)),
        }
    }

    /// Wait for `target` with no deadline; only the event, a hang-up, a wait failure or
    /// a dispose request ends it
    pub(crate) async fn wait_indefinitely(&mut self, target: EventKind) -> LineResult<WaitResult> {
        let round = self.props.poll_slice() * INDEFINITE_ROUND;
        loop {
            match self.wait_for_event(target, round).await? {
                WaitResult::Expired => trace!(line = self.id, "still waiting for {}", target),
                other => return Ok(other),
            }
        }
    }

    async fn poll_for_event(
        &mut self,
        target: EventKind,
        max_wait: Duration,
        interruptible: bool,
    ) -> LineResult<WaitResult> {
        let slice = self.props.poll_slice();
        let budget = slices_for(max_wait, slice);
        let handles = self.line_handles();
        trace!(line = self.id, event = %target, ?max_wait, budget, "waiting for event");

        let mut polls = 0;
        loop {
            match self.driver.wait_event(&handles, slice).await {
                WaitPoll::Event(event) => {
                    let kind = event.kind;
                    let signal = self.route_event(&event).await?;
                    // A lifecycle event the call state machine ignored can't end the wait
                    if kind == target && signal != CallSignal::Ignored {
                        return Ok(WaitResult::Success(event));
                    }
                    if signal == CallSignal::Hangup {
                        debug!(line = self.id, event = %target, "call released while waiting");
                        return Err(LineError::Hangup);
                    }
                }
                WaitPoll::Nothing => {
                    if let EmptyPoll::Failed = self.classify_empty_poll().await {
                        return Ok(WaitResult::Error);
                    }
                }
            }

            if interruptible {
                self.check_disposing()?;
            }
            polls += 1;
            if polls >= budget {
                debug!(line = self.id, event = %target, "wait expired after {} polls", polls);
                return Ok(WaitResult::Expired);
            }
        }
    }

    /// Send one event to the call state machine, or log it
    async fn route_event(&mut self, event: &RawEvent) -> LineResult<CallSignal> {
        if event.kind.is_call_lifecycle() {
            return self.dispatch_call_event(event).await;
        }
        match event.kind {
            EventKind::TaskFail => {
                warn!(line = self.id, detail = ?event.detail, "driver task failed");
            }
            kind => trace!(line = self.id, event = %kind, handle = %event.handle, "background event"),
        }
        Ok(CallSignal::Continue)
    }

    /// An empty poll means a timeout or a failure; ask the driver which one
    ///
    /// An error code the driver can't explain is treated as a timeout, logged and
    /// counted in [`crate::line::LineStats::ambiguous_waits`].
    async fn classify_empty_poll(&mut self) -> EmptyPoll {
        match self.driver.last_error(self.handles.voice).await {
            Ok(LastError::None) | Ok(LastError::TimedOut) => EmptyPoll::TimedOut,
            Ok(LastError::Code(code)) => {
                warn!(line = self.id, code, "ambiguous empty wait treated as timeout");
                self.stats.ambiguous_waits += 1;
                EmptyPoll::TimedOut
            }
            Err(fault) => {
                warn!(line = self.id, "event wait failed: {}", fault);
                EmptyPoll::Failed
            }
        }
    }

    /// Discard events queued on the voice device until one poll of `slice` comes back
    /// empty
    pub(crate) async fn drain_events(&mut self, slice: Duration) {
        let voice = [self.handles.voice];
        for _ in 0..DRAIN_LIMIT {
            match self.driver.wait_event(&voice, slice).await {
                WaitPoll::Event(event) => {
                    trace!(line = self.id, event = %event.kind, "discarding stray event");
                }
                WaitPoll::Nothing => return,
            }
        }
        debug!(line = self.id, "event drain stopped after {} events", DRAIN_LIMIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_for() {
        let slice = Duration::from_millis(1000);
        assert_eq!(slices_for(Duration::from_secs(5), slice), 5);
        assert_eq!(slices_for(Duration::from_millis(5500), slice), 6);
        assert_eq!(slices_for(Duration::from_millis(100), slice), 1);
        assert_eq!(slices_for(Duration::ZERO, slice), 1);
        assert_eq!(slices_for(Duration::from_secs(1), Duration::ZERO), 1);
    }
}
