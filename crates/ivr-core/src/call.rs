//! Call state machine
//!
//! One [`CallStateMachine`] per line tracks the call reference and lifecycle state of the
//! call on that line. It is fed classified events by the event loop and answers with the
//! next driver action to issue; the line executes the action and reports back.
//!
//! ```text
//!  inbound:  Idle ──Offered──▶ Offered ──ack──▶ Acknowledged ──CallProcessing──▶ CallProcessing
//!                 ──accept──▶ ──Accept──▶ Accepted ──answer──▶ ──Answered──▶ Connected
//!  outbound: Idle ──originate──▶ Dialing ──Alerting──▶ Alerting ──progress──▶ Connected
//!  teardown: * ──Disconnected / local hangup──▶ Disconnecting ──DropCall──▶ Releasing
//!                ──ReleaseCall──▶ Idle
//! ```
//!
//! Request actions (acknowledge, accept, answer) that fail end the call attempt and the
//! error propagates. Teardown actions (drop, release) that fail are logged and the
//! machine still reaches `Idle`.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::driver::{CallRef, DriverFault, EventKind, RawEvent};
use crate::error::{LineError, LineResult};
use crate::line::{Line, LineStatus};

const HISTORY_LIMIT: usize = 32;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallState {
    Idle,
    Offered,
    Acknowledged,
    CallProcessing,
    Accepted,
    Dialing,
    Alerting,
    Connected,
    Disconnecting,
    Releasing,
}

impl CallState {
    pub fn is_tearing_down(&self) -> bool {
        matches!(self, Self::Disconnecting | Self::Releasing)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Next step the line must take for the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Acknowledge(CallRef),
    Accept(CallRef),
    /// Commit codec parameters, then answer
    Answer(CallRef),
    MarkConnected,
    Drop(CallRef),
    Release(CallRef),
    /// The call is gone; the line is back on hook
    SignalHangup,
}

/// What an event meant for an operation waiting on the line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSignal {
    Continue,
    /// The event did not belong to the held call, or arrived with no call held
    Ignored,
    Hangup,
}

/// One recorded state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTransition {
    pub from: CallState,
    pub to: CallState,
    pub event: Option<EventKind>,
    pub call: Option<CallRef>,
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    line_id: u32,
    state: CallState,
    call: Option<CallRef>,
    history: VecDeque<CallTransition>,
}

impl CallStateMachine {
    pub fn new(line_id: u32) -> Self {
        Self {
            line_id,
            state: CallState::Idle,
            call: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn current_call(&self) -> Option<CallRef> {
        self.call
    }

    pub fn history(&self) -> Vec<CallTransition> {
        self.history.iter().copied().collect()
    }

    fn transition(&mut self, to: CallState, event: Option<EventKind>) {
        let from = self.state;
        self.state = to;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(CallTransition {
            from,
            to,
            event,
            call: self.call,
        });
        trace!(line = self.line_id, "call state {} -> {}", from, to);
    }

    /// Whether `event` belongs to the call this machine tracks
    ///
    /// Events are ignored while no call is held, except `Offered`, and events carrying
    /// another call's reference are ignored too.
    pub fn correlates(&self, event: &RawEvent) -> bool {
        match (self.call, event.call) {
            (None, _) => event.kind == EventKind::Offered,
            (Some(held), Some(other)) => held == other,
            (Some(_), None) => true,
        }
    }

    /// Consume one call-lifecycle event
    pub fn on_event(&mut self, event: &RawEvent) -> Option<CallAction> {
        if !self.correlates(event) {
            match (self.call, event.call) {
                (Some(held), Some(other)) => debug!(
                    line = self.line_id,
                    "ignoring {} for {} while holding {}", event.kind, other, held
                ),
                _ => trace!(line = self.line_id, "ignoring {} with no call held", event.kind),
            }
            return None;
        }

        let kind = Some(event.kind);
        match event.kind {
            EventKind::Offered => {
                if self.call.is_some() {
                    return None;
                }
                let Some(call) = event.call else {
                    warn!(line = self.line_id, "OFFERED event without a call reference");
                    return None;
                };
                self.call = Some(call);
                self.transition(CallState::Offered, kind);
                Some(CallAction::Acknowledge(call))
            }
            EventKind::CallProcessing => {
                let call = self.call?;
                self.transition(CallState::CallProcessing, kind);
                Some(CallAction::Accept(call))
            }
            EventKind::Accept => {
                let call = self.call?;
                self.transition(CallState::Accepted, kind);
                Some(CallAction::Answer(call))
            }
            EventKind::Answered | EventKind::Connected => {
                self.transition(CallState::Connected, kind);
                Some(CallAction::MarkConnected)
            }
            EventKind::Alerting => {
                self.transition(CallState::Alerting, kind);
                None
            }
            EventKind::Disconnected => {
                if self.state.is_tearing_down() {
                    return None;
                }
                let call = self.call?;
                self.transition(CallState::Disconnecting, kind);
                Some(CallAction::Drop(call))
            }
            EventKind::DropCall => {
                let call = self.call?;
                self.transition(CallState::Releasing, kind);
                Some(CallAction::Release(call))
            }
            EventKind::ReleaseCall => {
                self.call = None;
                self.transition(CallState::Idle, kind);
                Some(CallAction::SignalHangup)
            }
            _ => None,
        }
    }

    /// Record that a request action was accepted by the driver
    pub fn confirm(&mut self, action: &CallAction) {
        if let CallAction::Acknowledge(_) = action {
            self.transition(CallState::Acknowledged, None);
        }
    }

    pub fn begin_outbound(&mut self, call: CallRef) {
        self.call = Some(call);
        self.transition(CallState::Dialing, None);
    }

    pub fn outbound_connected(&mut self) {
        if self.call.is_some() {
            self.transition(CallState::Connected, None);
        }
    }

    /// Start a locally initiated teardown; returns the call to drop
    pub fn begin_local_drop(&mut self) -> Option<CallRef> {
        let call = self.call?;
        if !self.state.is_tearing_down() {
            self.transition(CallState::Disconnecting, None);
        }
        Some(call)
    }

    /// Skip straight to releasing when no drop completion will arrive
    pub fn begin_release(&mut self) -> Option<CallRef> {
        let call = self.call?;
        self.transition(CallState::Releasing, None);
        Some(call)
    }

    /// Forget the call and return to `Idle`
    pub fn reset(&mut self) {
        if self.state != CallState::Idle || self.call.is_some() {
            self.call = None;
            self.transition(CallState::Idle, None);
        }
    }
}

impl Line {
    /// Run the call state machine for one lifecycle event and execute its action
    pub(crate) async fn dispatch_call_event(&mut self, event: &RawEvent) -> LineResult<CallSignal> {
        if !self.call.correlates(event) {
            trace!(line = self.id, event = %event.kind, "not for the held call");
            return Ok(CallSignal::Ignored);
        }
        if event.kind == EventKind::Disconnected {
            self.stats.remote_hangups += 1;
        }
        let Some(action) = self.call.on_event(event) else {
            return Ok(CallSignal::Continue);
        };
        debug!(line = self.id, event = %event.kind, ?action, "call event");

        match action {
            CallAction::Acknowledge(call) => {
                if let Err(fault) = self.driver.acknowledge(call).await {
                    return Err(self.fail_call_attempt("acknowledge", call, fault).await);
                }
                self.call.confirm(&action);
            }
            CallAction::Accept(call) => {
                if let Err(fault) = self.driver.accept(call).await {
                    return Err(self.fail_call_attempt("accept", call, fault).await);
                }
            }
            CallAction::Answer(call) => {
                if let Err(fault) = self.driver.set_codec(call).await {
                    return Err(self.fail_call_attempt("set_codec", call, fault).await);
                }
                if let Err(fault) = self.driver.answer(call).await {
                    return Err(self.fail_call_attempt("answer", call, fault).await);
                }
            }
            CallAction::MarkConnected => {
                self.status = LineStatus::Connected;
            }
            CallAction::Drop(call) => {
                if let Err(fault) = self.driver.drop_call(call).await {
                    warn!(
                        line = self.id,
                        crn = call.raw(),
                        "drop_call failed, releasing directly: {}",
                        fault
                    );
                    return Ok(self.release_without_drop_completion().await);
                }
            }
            CallAction::Release(call) => {
                if let Err(fault) = self.driver.release_call(call).await {
                    warn!(line = self.id, crn = call.raw(), "release_call failed: {}", fault);
                    return Ok(self.finish_release());
                }
            }
            CallAction::SignalHangup => {
                return Ok(self.finish_release());
            }
        }

        Ok(CallSignal::Continue)
    }

    /// Abandon a call whose request action failed and build the error to propagate
    async fn fail_call_attempt(&mut self, operation: &str, call: CallRef, fault: DriverFault) -> LineError {
        warn!(line = self.id, crn = call.raw(), "{} failed: {}", operation, fault);
        if let Err(drop_fault) = self.driver.drop_call(call).await {
            debug!(line = self.id, "drop after failed {}: {}", operation, drop_fault);
        }
        if let Err(release_fault) = self.driver.release_call(call).await {
            debug!(line = self.id, "release after failed {}: {}", operation, release_fault);
        }
        self.call.reset();
        self.status = LineStatus::OnHook;
        LineError::driver(operation, fault)
    }

    async fn release_without_drop_completion(&mut self) -> CallSignal {
        let Some(call) = self.call.begin_release() else {
            return self.finish_release();
        };
        match self.driver.release_call(call).await {
            Ok(()) => CallSignal::Continue,
            Err(fault) => {
                warn!(line = self.id, crn = call.raw(), "release_call failed: {}", fault);
                self.finish_release()
            }
        }
    }

    fn finish_release(&mut self) -> CallSignal {
        self.call.reset();
        self.status = LineStatus::OnHook;
        self.stats.calls_released += 1;
        CallSignal::Hangup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceHandle;

    fn event(kind: EventKind, call: Option<u32>) -> RawEvent {
        let mut event = RawEvent::new(kind, DeviceHandle(1));
        event.call = call.and_then(CallRef::new);
        event
    }

    fn crn(raw: u32) -> CallRef {
        CallRef::new(raw).unwrap()
    }

    #[test]
    fn test_inbound_sequence() {
        let mut machine = CallStateMachine::new(1);

        let action = machine.on_event(&event(EventKind::Offered, Some(9)));
        assert_eq!(action, Some(CallAction::Acknowledge(crn(9))));
        assert_eq!(machine.state(), CallState::Offered);
        machine.confirm(&action.unwrap());
        assert_eq!(machine.state(), CallState::Acknowledged);

        assert_eq!(
            machine.on_event(&event(EventKind::CallProcessing, Some(9))),
            Some(CallAction::Accept(crn(9)))
        );
        assert_eq!(
            machine.on_event(&event(EventKind::Accept, Some(9))),
            Some(CallAction::Answer(crn(9)))
        );
        assert_eq!(
            machine.on_event(&event(EventKind::Answered, Some(9))),
            Some(CallAction::MarkConnected)
        );
        assert_eq!(machine.state(), CallState::Connected);
        assert_eq!(machine.current_call(), Some(crn(9)));
    }

    #[test]
    fn test_teardown_sequence_returns_to_idle() {
        let mut machine = CallStateMachine::new(1);
        machine.on_event(&event(EventKind::Offered, Some(3)));

        assert_eq!(
            machine.on_event(&event(EventKind::Disconnected, Some(3))),
            Some(CallAction::Drop(crn(3)))
        );
        // a second disconnect while tearing down is a no-op
        assert_eq!(machine.on_event(&event(EventKind::Disconnected, Some(3))), None);
        assert_eq!(
            machine.on_event(&event(EventKind::DropCall, Some(3))),
            Some(CallAction::Release(crn(3)))
        );
        assert_eq!(
            machine.on_event(&event(EventKind::ReleaseCall, Some(3))),
            Some(CallAction::SignalHangup)
        );
        assert_eq!(machine.state(), CallState::Idle);
        assert_eq!(machine.current_call(), None);
    }

    #[test]
    fn test_events_without_call_are_ignored() {
        let mut machine = CallStateMachine::new(1);
        for kind in [
            EventKind::CallProcessing,
            EventKind::Accept,
            EventKind::Answered,
            EventKind::Disconnected,
            EventKind::DropCall,
            EventKind::ReleaseCall,
        ] {
            assert_eq!(machine.on_event(&event(kind, Some(4))), None);
        }
        assert_eq!(machine.state(), CallState::Idle);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn test_events_for_other_calls_are_ignored() {
        let mut machine = CallStateMachine::new(1);
        machine.on_event(&event(EventKind::Offered, Some(1)));
        assert_eq!(machine.on_event(&event(EventKind::Offered, Some(2))), None);
        assert_eq!(machine.on_event(&event(EventKind::Disconnected, Some(2))), None);
        assert_eq!(machine.current_call(), Some(crn(1)));
    }

    #[test]
    fn test_correlation() {
        let mut machine = CallStateMachine::new(1);
        assert!(!machine.correlates(&event(EventKind::Answered, None)));
        assert!(machine.correlates(&event(EventKind::Offered, Some(6))));

        machine.on_event(&event(EventKind::Offered, Some(6)));
        assert!(machine.correlates(&event(EventKind::Answered, Some(6))));
        assert!(machine.correlates(&event(EventKind::Answered, None)));
        assert!(!machine.correlates(&event(EventKind::Answered, Some(7))));
    }

    #[test]
    fn test_offered_without_reference() {
        let mut machine = CallStateMachine::new(1);
        assert_eq!(machine.on_event(&event(EventKind::Offered, None)), None);
        assert_eq!(machine.state(), CallState::Idle);
    }

    #[test]
    fn test_local_drop_and_history() {
        let mut machine = CallStateMachine::new(1);
        machine.begin_outbound(crn(5));
        machine.on_event(&event(EventKind::Alerting, Some(5)));
        machine.outbound_connected();
        assert_eq!(machine.begin_local_drop(), Some(crn(5)));
        assert_eq!(machine.state(), CallState::Disconnecting);

        let states: Vec<CallState> = machine.history().iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                CallState::Dialing,
                CallState::Alerting,
                CallState::Connected,
                CallState::Disconnecting,
            ]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = CallStateMachine::new(1);
        for raw in 1..=40 {
            machine.on_event(&event(EventKind::Offered, Some(raw)));
            machine.reset();
        }
        assert_eq!(machine.history().len(), HISTORY_LIMIT);
    }
}
