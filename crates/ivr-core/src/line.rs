//! One call-capable line
//!
//! A [`Line`] is opened through [`crate::session::LineManager::open_line`] and driven by
//! exactly one task through `&mut self`. Another task can only ask it to go away, through
//! the cloneable [`LineManagement`] handle.
//!
//! The operations are spread over several modules: call control lives here, digit
//! collection in [`crate::digits`], playback and recording in [`crate::playback`], the
//! prompt engine in [`crate::prompt`] and the event loop in [`crate::events`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::call::{CallState, CallStateMachine, CallTransition};
use crate::config::VoiceProperties;
use crate::driver::{
    CallProgress, ConnectionKind, DeviceHandle, DriverBoundary, DriverCallState, EventKind, LineAddress,
    LineHandles, OutboundCall, ProgressResult, Registration,
};
use crate::error::{LineError, LineResult};
use crate::events::WaitResult;
use crate::logging::line_span;
use crate::session::BoardSession;

const LISTEN_FOR_DIAL_TONE: Duration = Duration::from_secs(2);
const ALERTING_TIMEOUT: Duration = Duration::from_secs(40);
const CALL_PROGRESS_TIMEOUT: Duration = Duration::from_secs(60);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const OUTBOUND_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of a line as seen by the application
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum LineStatus {
    OnHook,
    OffHook,
    AcceptingCalls,
    Connected,
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of dialing out
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CallAnalysis {
    Busy,
    NoAnswer,
    NoRingback,
    Connected,
    OperatorIntercept,
    Stopped,
    NoDialTone,
    FaxTone,
    Error,
    AnsweringMachine,
    /// Reported by drivers that pool outbound channels and had none free
    NoFreeLine,
}

impl CallAnalysis {
    /// Map a driver call progress report; a greeting longer than `answering_machine_ms`
    /// is taken to be an answering machine
    pub fn from_progress(progress: &CallProgress, answering_machine_ms: u32) -> LineResult<Self> {
        let analysis = match progress.result {
            ProgressResult::Busy => Self::Busy,
            ProgressResult::OperatorIntercept => Self::OperatorIntercept,
            ProgressResult::Connected => {
                if progress.connection == Some(ConnectionKind::AnsweringMachine)
                    || progress.salutation_ms > answering_machine_ms
                {
                    Self::AnsweringMachine
                } else {
                    Self::Connected
                }
            }
            ProgressResult::Error => Self::Error,
            ProgressResult::FaxTone => Self::FaxTone,
            ProgressResult::NoAnswer => Self::NoAnswer,
            ProgressResult::NoDialTone => Self::NoDialTone,
            ProgressResult::NoRingback => Self::NoRingback,
            ProgressResult::Stopped => Self::Stopped,
            ProgressResult::Unknown(code) => {
                return Err(LineError::Driver {
                    operation: "call_progress".to_string(),
                    code,
                    message: "unknown call progress result".to_string(),
                });
            }
        };
        Ok(analysis)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::AnsweringMachine)
    }
}

/// Per-line counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineStats {
    pub calls_answered: u64,
    pub calls_dialed: u64,
    /// Disconnects initiated by the far end
    pub remote_hangups: u64,
    /// Calls that went all the way back to idle
    pub calls_released: u64,
    pub prompts: u64,
    /// Empty waits whose last error was neither "none" nor "timed out"
    pub ambiguous_waits: u64,
}

#[derive(Debug, Default)]
struct ControlFlags {
    dispose_requested: AtomicBool,
    disposed: AtomicBool,
}

/// Cross-task handle to a line
#[derive(Clone)]
pub struct LineManagement {
    line_id: u32,
    voice: DeviceHandle,
    flags: Arc<ControlFlags>,
    driver: Arc<dyn DriverBoundary>,
}

impl LineManagement {
    pub fn line_id(&self) -> u32 {
        self.line_id
    }

    /// Ask the line to unwind
    ///
    /// Any driver I/O in progress is stopped. The operation running on the line then
    /// fails with [`LineError::Disposing`] at its next poll boundary.
    pub async fn trigger_dispose(&self) {
        if self.is_disposed() {
            debug!(line = self.line_id, "dispose triggered on a disposed line");
            return;
        }
        info!(line = self.line_id, "dispose triggered");
        self.flags.dispose_requested.store(true, Ordering::SeqCst);
        if let Err(fault) = self.driver.stop_channel(self.voice).await {
            warn!(line = self.line_id, "stop_channel failed: {}", fault);
        }
    }

    pub fn is_dispose_requested(&self) -> bool {
        self.flags.dispose_requested.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for LineManagement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineManagement")
            .field("line_id", &self.line_id)
            .field("voice", &self.voice)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Open lines by id; `None` while a line is still being opened
pub(crate) type LineRegistry = Arc<DashMap<u32, Option<LineManagement>>>;

pub struct Line {
    pub(crate) id: u32,
    pub(crate) address: LineAddress,
    pub(crate) driver: Arc<dyn DriverBoundary>,
    pub(crate) session: Arc<BoardSession>,
    pub(crate) board: DeviceHandle,
    pub(crate) handles: LineHandles,
    pub(crate) props: Arc<VoiceProperties>,
    pub(crate) status: LineStatus,
    pub(crate) call: CallStateMachine,
    pub(crate) last_terminator: String,
    pub(crate) volume: i8,
    pub(crate) stats: LineStats,
    pub(crate) cancel: Option<CancellationToken>,
    flags: Arc<ControlFlags>,
    registry: LineRegistry,
    registration: Option<Registration>,
    wait_call_armed: bool,
    disposed: bool,
}

impl Line {
    pub(crate) fn new(
        address: LineAddress,
        driver: Arc<dyn DriverBoundary>,
        session: Arc<BoardSession>,
        board: DeviceHandle,
        handles: LineHandles,
        props: Arc<VoiceProperties>,
        registry: LineRegistry,
    ) -> Self {
        Self {
            id: address.line_id,
            address,
            driver,
            session,
            board,
            handles,
            props,
            status: LineStatus::OnHook,
            call: CallStateMachine::new(address.line_id),
            last_terminator: String::new(),
            volume: 0,
            stats: LineStats::default(),
            cancel: None,
            flags: Arc::new(ControlFlags::default()),
            registry,
            registration: None,
            wait_call_armed: false,
            disposed: false,
        }
    }

    pub fn line_id(&self) -> u32 {
        self.id
    }

    pub fn address(&self) -> &LineAddress {
        &self.address
    }

    pub fn status(&self) -> LineStatus {
        self.status
    }

    /// Terminator key that ended the last digit collection, empty if none did
    pub fn last_terminator(&self) -> &str {
        &self.last_terminator
    }

    pub fn volume(&self) -> i8 {
        self.volume
    }

    pub fn stats(&self) -> &LineStats {
        &self.stats
    }

    pub fn call_state(&self) -> CallState {
        self.call.state()
    }

    /// Recent call state transitions, oldest first
    pub fn call_history(&self) -> Vec<CallTransition> {
        self.call.history()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn management(&self) -> LineManagement {
        LineManagement {
            line_id: self.id,
            voice: self.handles.voice,
            flags: self.flags.clone(),
            driver: self.driver.clone(),
        }
    }

    /// Fail with `Disposed` or `Disposing` when the line must not start new work
    pub(crate) fn check_dispose(&mut self) -> LineResult<()> {
        if self.disposed {
            return Err(LineError::Disposed { line: self.id });
        }
        self.check_disposing()
    }

    /// Consume a pending dispose request
    pub(crate) fn check_disposing(&mut self) -> LineResult<()> {
        if self.flags.dispose_requested.swap(false, Ordering::SeqCst) {
            debug!(line = self.id, "unwinding for dispose");
            return Err(LineError::Disposing);
        }
        if self.cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            debug!(line = self.id, "unwinding for cancellation");
            return Err(LineError::Disposing);
        }
        Ok(())
    }

    pub(crate) fn clear_dispose_request(&self) {
        self.flags.dispose_requested.store(false, Ordering::SeqCst);
    }

    /// Side-channel hang-up check against the driver's view of the call
    pub(crate) async fn check_call_state(&mut self) -> LineResult<()> {
        let Some(call) = self.call.current_call() else {
            return Ok(());
        };
        let state = self
            .driver
            .call_state(call)
            .await
            .map_err(|fault| LineError::driver("call_state", fault))?;
        if state != DriverCallState::Connected {
            debug!(line = self.id, crn = call.raw(), ?state, "call no longer connected");
            self.hangup_detected().await;
            return Err(LineError::Hangup);
        }
        Ok(())
    }

    /// Tear the call down after a hang-up seen outside the event loop
    ///
    /// The disconnect and release events still queued for the call are consumed here,
    /// so the next operation starts from an idle call state.
    pub(crate) async fn hangup_detected(&mut self) {
        self.status = LineStatus::OnHook;
        self.release_call().await;
    }

    /// Map `Hangup` and `Disposing` coming out of an operation onto line state
    pub(crate) fn settle<T>(&mut self, result: LineResult<T>) -> LineResult<T> {
        match &result {
            Err(LineError::Hangup) => self.status = LineStatus::OnHook,
            Err(LineError::Disposing) => self.clear_dispose_request(),
            _ => {}
        }
        result
    }

    /// Reset the line's device state after open: audio format and custom tones
    pub(crate) async fn initialize(&mut self) -> LineResult<()> {
        let voice = self.handles.voice;
        self.driver
            .set_audio_format(voice, self.props.audio_format)
            .await
            .map_err(|fault| LineError::driver("set_audio_format", fault))?;
        self.driver
            .delete_tones(voice)
            .await
            .map_err(|fault| LineError::driver("delete_tones", fault))?;
        for tone in self.props.tones() {
            self.driver
                .add_tone(voice, &tone)
                .await
                .map_err(|fault| LineError::driver("add_tone", fault))?;
        }
        Ok(())
    }

    /// Register the line with the configured SIP proxy
    ///
    /// A line that is already registered may take several seconds to be confirmed; if
    /// the confirmation does not arrive within the registration timeout the line stays
    /// usable and a warning is logged.
    pub async fn register(&mut self) -> LineResult<()> {
        self.check_dispose()?;
        let registration = self
            .props
            .sip
            .registration()
            .ok_or_else(|| LineError::config("SIP registration needs sip.proxy_ip and sip.alias"))?;

        self.driver
            .register(self.board, &registration)
            .await
            .map_err(|fault| LineError::driver("register", fault))?;

        let timeout = Duration::from_millis(self.props.sip.registration_timeout_ms);
        match self.wait_for_event(EventKind::ServiceResponse, timeout).await? {
            WaitResult::Success(_) => {
                info!(line = self.id, alias = %registration.alias, proxy = %registration.proxy, "registered");
            }
            WaitResult::Expired => {
                warn!(line = self.id, "registration not confirmed within {:?}", timeout);
            }
            WaitResult::Error => {
                warn!(line = self.id, "wait for registration response failed");
            }
        }
        self.registration = Some(registration);
        Ok(())
    }

    /// Wait for an inbound call and answer it
    ///
    /// SIP lines answer on offer; `rings` is only logged.
    pub async fn wait_for_call(&mut self, rings: u32) -> LineResult<()> {
        self.check_dispose()?;
        let span = line_span(self.id);
        let result = self.wait_for_call_inner(rings).instrument(span).await;
        self.settle(result)
    }

    pub async fn wait_for_call_with_cancel(
        &mut self,
        rings: u32,
        token: &CancellationToken,
    ) -> LineResult<()> {
        self.cancel = Some(token.clone());
        let result = self.wait_for_call(rings).await;
        self.cancel = None;
        result
    }

    async fn wait_for_call_inner(&mut self, rings: u32) -> LineResult<()> {
        self.status = LineStatus::AcceptingCalls;
        if !self.wait_call_armed {
            self.driver
                .wait_call(self.handles.call_control)
                .await
                .map_err(|fault| LineError::driver("wait_call", fault))?;
            self.wait_call_armed = true;
        }
        debug!(line = self.id, rings, "waiting for a call");

        match self.wait_indefinitely(EventKind::Answered).await? {
            WaitResult::Success(_) => {}
            _ => return Err(LineError::wait_failed(EventKind::Answered)),
        }

        self.status = LineStatus::Connected;
        self.stats.calls_answered += 1;
        info!(line = self.id, crn = ?self.call.current_call(), "call answered");
        self.check_disposing()
    }

    /// Go off hook without placing a call
    pub async fn take_off_hook(&mut self) -> LineResult<()> {
        self.check_dispose()?;
        self.status = LineStatus::OffHook;
        Ok(())
    }

    /// Place an outbound call and classify how it was answered
    ///
    /// A greeting longer than `answering_machine_ms` is reported as an answering
    /// machine. Results other than a connection hang the line up again.
    pub async fn dial(&mut self, number: &str, answering_machine_ms: u32) -> LineResult<CallAnalysis> {
        let minimum = self.props.answering_machine_min_ms;
        if answering_machine_ms < minimum {
            return Err(LineError::invalid_argument(format!(
                "answering machine detection needs at least {minimum} ms"
            )));
        }
        if number.trim().is_empty() {
            return Err(LineError::invalid_argument("number to dial is empty"));
        }
        self.check_dispose()?;
        self.take_off_hook().await?;

        let span = line_span(self.id);
        let result = self
            .dial_with_analysis(number.trim(), answering_machine_ms)
            .instrument(span)
            .await;
        let analysis = self.settle(result)?;
        info!(line = self.id, number, ?analysis, "dial finished");

        match analysis {
            CallAnalysis::Stopped => {
                self.clear_dispose_request();
                Err(LineError::Disposing)
            }
            CallAnalysis::Connected | CallAnalysis::AnsweringMachine => {
                self.call.outbound_connected();
                self.status = LineStatus::Connected;
                self.stats.calls_dialed += 1;
                Ok(analysis)
            }
            _ => {
                self.status = LineStatus::OnHook;
                self.release_call().await;
                Ok(analysis)
            }
        }
    }

    async fn dial_with_analysis(&mut self, number: &str, answering_machine_ms: u32) -> LineResult<CallAnalysis> {
        let voice = self.handles.voice;

        if self.props.pre_test_dial_tone {
            let tid = self.props.dial_tone.tid;
            self.driver
                .enable_tone(voice, tid)
                .await
                .map_err(|fault| LineError::driver("enable_tone", fault))?;
            let heard = self
                .driver
                .listen_for_tone(voice, LISTEN_FOR_DIAL_TONE)
                .await
                .map_err(|fault| LineError::driver("listen_for_tone", fault))?;
            if let Err(fault) = self.driver.disable_tone(voice, tid).await {
                warn!(line = self.id, "disable_tone failed: {}", fault);
            }
            if heard != Some(tid) {
                debug!(line = self.id, ?heard, "no dial tone");
                self.status = LineStatus::OnHook;
                self.release_call().await;
                return Ok(CallAnalysis::NoDialTone);
            }
        }

        let sip = &self.props.sip;
        let proxy = sip.proxy_ip.as_deref().unwrap_or(&sip.local_ip);
        let outbound = OutboundCall {
            ani: format!("{}@{}", sip.alias.as_deref().unwrap_or_default(), proxy),
            dnis: format!("{number}@{proxy}"),
            user_agent: sip.user_agent.clone(),
            from_display: sip.from_display.clone(),
            contact: sip.contact(),
            timeout: OUTBOUND_CALL_TIMEOUT,
        };

        let call = self
            .driver
            .originate(self.handles.call_control, &outbound)
            .await
            .map_err(|fault| LineError::driver("originate", fault))?;
        self.call.begin_outbound(call);
        debug!(line = self.id, crn = call.raw(), dnis = %outbound.dnis, "dialing");

        self.expect_event(EventKind::Alerting, ALERTING_TIMEOUT).await?;

        self.driver
            .start_call_progress(voice)
            .await
            .map_err(|fault| LineError::driver("start_call_progress", fault))?;
        self.expect_event(EventKind::CallProgressComplete, CALL_PROGRESS_TIMEOUT)
            .await?;

        let progress = self
            .driver
            .call_progress(voice)
            .await
            .map_err(|fault| LineError::driver("call_progress", fault))?;
        CallAnalysis::from_progress(&progress, answering_machine_ms)
    }

    /// Hang up the current call, if any
    pub async fn hangup(&mut self) -> LineResult<()> {
        self.check_dispose()?;
        self.status = LineStatus::OnHook;
        self.release_call().await;
        Ok(())
    }

    /// Stop the channel, then drop and release the call
    ///
    /// Never fails: every driver error on the way is logged and the call state machine
    /// is forced back to idle at the end.
    pub(crate) async fn release_call(&mut self) {
        if let Err(fault) = self.driver.stop_channel(self.handles.voice).await {
            warn!(line = self.id, "stop_channel failed: {}", fault);
        }

        let Some(call) = self.call.begin_local_drop() else {
            return;
        };
        debug!(line = self.id, crn = call.raw(), "hanging up");

        match self.driver.drop_call(call).await {
            Ok(()) => self.await_teardown(EventKind::DropCall).await,
            Err(fault) => {
                warn!(line = self.id, crn = call.raw(), "drop_call failed: {}", fault);
                if self.call.begin_release().is_some() {
                    if let Err(fault) = self.driver.release_call(call).await {
                        warn!(line = self.id, crn = call.raw(), "release_call failed: {}", fault);
                    }
                }
            }
        }

        // The drop completion already issued the release
        if self.call.current_call().is_some() {
            self.await_teardown(EventKind::ReleaseCall).await;
        }

        if self.call.current_call().is_some() {
            warn!(line = self.id, crn = call.raw(), "call not released cleanly, forcing idle");
        }
        self.call.reset();
    }

    async fn await_teardown(&mut self, kind: EventKind) {
        match self.wait_for_event_uninterruptible(kind, TEARDOWN_TIMEOUT).await {
            Ok(WaitResult::Success(_)) | Err(LineError::Hangup) => {}
            Ok(WaitResult::Expired) => {
                warn!(line = self.id, "no {} within {:?}", kind, TEARDOWN_TIMEOUT);
            }
            Ok(WaitResult::Error) => warn!(line = self.id, "wait for {} failed", kind),
            Err(e) => warn!(line = self.id, "wait for {} failed: {}", kind, e),
        }
    }

    /// Set the output volume, -10 (quietest) to 10
    pub async fn set_volume(&mut self, level: i8) -> LineResult<()> {
        if !(-10..=10).contains(&level) {
            return Err(LineError::invalid_argument(format!(
                "volume {level} is outside -10..=10"
            )));
        }
        self.check_dispose()?;
        self.driver
            .set_volume(self.handles.voice, level)
            .await
            .map_err(|fault| LineError::driver("set_volume", fault))?;
        self.volume = level;
        Ok(())
    }

    /// Hang up if needed and give every resource back
    ///
    /// Idempotent. Driver failures on the way are logged; the handles and the board
    /// session reference are released regardless.
    pub async fn dispose(&mut self) {
        if self.disposed {
            debug!(line = self.id, "already disposed");
            return;
        }
        info!(line = self.id, "disposing line");

        if self.status != LineStatus::OnHook || self.call.current_call().is_some() {
            self.status = LineStatus::OnHook;
            self.release_call().await;
        }

        if let Some(registration) = self.registration.take() {
            if let Err(fault) = self.driver.unregister(self.board, &registration).await {
                warn!(line = self.id, "unregister failed: {}", fault);
            }
        }

        if let Err(fault) = self.driver.close_line(&self.handles).await {
            warn!(line = self.id, "close_line failed: {}", fault);
        }
        self.session.release().await;

        self.disposed = true;
        self.flags.dispose_requested.store(false, Ordering::SeqCst);
        self.flags.disposed.store(true, Ordering::SeqCst);
        self.registry.remove(&self.id);
    }

    /// Same as [`Line::dispose`]
    pub async fn close(&mut self) {
        self.dispose().await
    }
}

impl Drop for Line {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        warn!(line = self.id, "line dropped without dispose, closing in the background");
        self.flags.disposed.store(true, Ordering::SeqCst);
        self.registry.remove(&self.id);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let driver = self.driver.clone();
        let session = self.session.clone();
        let handles = self.handles;
        let line = self.id;
        runtime.spawn(async move {
            if let Err(fault) = driver.close_line(&handles).await {
                warn!(line, "close_line failed: {}", fault);
            }
            session.release().await;
        });
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Line")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("handles", &self.handles)
            .field("status", &self.status)
            .field("call_state", &self.call.state())
            .field("call", &self.call.current_call())
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_analysis_from_progress() {
        let mut progress = CallProgress::connected();
        assert_eq!(
            CallAnalysis::from_progress(&progress, 1000).unwrap(),
            CallAnalysis::Connected
        );

        progress.salutation_ms = 2500;
        assert_eq!(
            CallAnalysis::from_progress(&progress, 1000).unwrap(),
            CallAnalysis::AnsweringMachine
        );
        assert_eq!(
            CallAnalysis::from_progress(&progress, 3000).unwrap(),
            CallAnalysis::Connected
        );

        progress.salutation_ms = 0;
        progress.connection = Some(ConnectionKind::AnsweringMachine);
        assert_eq!(
            CallAnalysis::from_progress(&progress, 1000).unwrap(),
            CallAnalysis::AnsweringMachine
        );
    }

    #[test]
    fn test_call_analysis_unknown_result_is_fatal() {
        let progress = CallProgress {
            result: ProgressResult::Unknown(77),
            connection: None,
            salutation_ms: 0,
        };
        let err = CallAnalysis::from_progress(&progress, 1000).unwrap_err();
        assert!(matches!(err, LineError::Driver { code: 77, .. }));
    }

    #[test]
    fn test_call_analysis_connected_variants() {
        assert!(CallAnalysis::Connected.is_connected());
        assert!(CallAnalysis::AnsweringMachine.is_connected());
        assert!(!CallAnalysis::Busy.is_connected());
    }
}
