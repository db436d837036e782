//! In-memory driver for scripted calls
//!
//! [`SimulatedDriver`] implements [`DriverBoundary`] without hardware. A script says what
//! the caller does (keys pressed, silence, hang-ups), what the network does (offered
//! calls, remote disconnects) and where the driver should fail; the simulator records
//! every action the line issues so a script can assert on it afterwards.
//!
//! With auto-progress on (the default) the simulator answers asynchronous actions the
//! way a real board does: acknowledge is followed by `CallProcessing`, accept by
//! `Accept`, answer by `Answered`, drop by `DropCall` and release by `ReleaseCall`.
//!
//! Waits never sleep. An empty `wait_event` yields to the runtime and reports
//! `WaitPoll::Nothing`, so a full polling budget runs through instantly.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::types::*;
use super::DriverBoundary;
use crate::termination::{DigitKey, TerminationSet};
use crate::tones::CustomTone;

/// Digit requests with a shorter inter-digit timeout only see digits already buffered
const FLUSH_THRESHOLD_100MS: u32 = 10;

/// What the caller does during one digit collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyScript {
    /// Press these keys, then stay silent
    Keys(String),
    /// Press these keys, then hang up
    HangUp(String),
    /// The collection is stopped from the line side
    UserStop,
    /// The driver reports an I/O error
    IoError,
}

impl KeyScript {
    pub fn keys(keys: impl Into<String>) -> Self {
        Self::Keys(keys.into())
    }

    pub fn silence() -> Self {
        Self::Keys(String::new())
    }
}

/// How one playback or recording ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaScript {
    Complete(TerminationReason),
    /// The remote side disconnects mid-way; no completion event is delivered
    CallerHangsUp,
}

/// Every request the line issued, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverAction {
    StartSubsystem,
    StopSubsystem,
    OpenBoard(u32),
    CloseBoard(DeviceHandle),
    OpenLine(u32),
    CloseLine(u32),
    StopChannel(u32),
    SetAudioFormat(u32),
    SetVolume { line: u32, level: i8 },
    Register { alias: String },
    Unregister { alias: String },
    WaitCall(u32),
    Originate { line: u32, dnis: String },
    Acknowledge(CallRef),
    Accept(CallRef),
    Answer(CallRef),
    SetCodec(CallRef),
    DropCall(CallRef),
    ReleaseCall(CallRef),
    StartCallProgress(u32),
    Play { line: u32, file: String },
    Record { line: u32, file: String },
    GetDigits { line: u32, max_digits: u32 },
    ClearDigitBuffer(u32),
    DeleteTones(u32),
    AddTone { line: u32, tid: u32 },
    EnableTone { line: u32, tid: u32 },
    DisableTone { line: u32, tid: u32 },
}

#[derive(Debug)]
struct SimLine {
    handles: LineHandles,
    call: Option<CallRef>,
    call_state: DriverCallState,
    /// Keys typed ahead of the next collection
    buffer: String,
    keys: VecDeque<KeyScript>,
    media: VecDeque<MediaScript>,
    progress: VecDeque<CallProgress>,
    tones_heard: VecDeque<Option<u32>>,
    last_errors: VecDeque<DriverResult<LastError>>,
    installed_tones: Vec<u32>,
    volume: i8,
}

#[derive(Debug, Default)]
struct SimState {
    next_handle: i32,
    next_crn: u32,
    auto_progress: bool,
    subsystem_running: bool,
    lines: HashMap<u32, SimLine>,
    boards: HashMap<DeviceHandle, u32>,
    events: VecDeque<RawEvent>,
    actions: Vec<DriverAction>,
    failures: HashMap<String, VecDeque<DriverFault>>,
}

impl SimState {
    fn allocate_handle(&mut self) -> DeviceHandle {
        self.next_handle += 1;
        DeviceHandle(self.next_handle)
    }

    fn take_failure(&mut self, operation: &str) -> DriverResult<()> {
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(fault) => {
                debug!("simulated failure for {}: {}", operation, fault);
                Err(fault)
            }
            None => Ok(()),
        }
    }

    fn line_by_voice(&mut self, voice: DeviceHandle) -> DriverResult<(u32, &mut SimLine)> {
        self.lines
            .iter_mut()
            .find(|(_, line)| line.handles.voice == voice)
            .map(|(id, line)| (*id, line))
            .ok_or_else(|| DriverFault::new(-1, format!("unknown voice device {voice}")))
    }

    fn line_by_call(&mut self, call: CallRef) -> DriverResult<(u32, &mut SimLine)> {
        self.lines
            .iter_mut()
            .find(|(_, line)| line.call == Some(call))
            .map(|(id, line)| (*id, line))
            .ok_or_else(|| DriverFault::new(-2, format!("no line holds {call}")))
    }

    fn line_by_call_control(&mut self, handle: DeviceHandle) -> DriverResult<(u32, &mut SimLine)> {
        self.lines
            .iter_mut()
            .find(|(_, line)| line.handles.call_control == handle)
            .map(|(id, line)| (*id, line))
            .ok_or_else(|| DriverFault::new(-1, format!("unknown call-control device {handle}")))
    }

    fn push_call_event(&mut self, call: CallRef, kind: EventKind) {
        if let Ok((_, line)) = self.line_by_call(call) {
            let event = RawEvent::new(kind, line.handles.call_control).with_call(call);
            self.events.push_back(event);
        }
    }
}

/// Scriptable in-memory [`DriverBoundary`]
#[derive(Debug)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: 100,
                next_crn: 0,
                auto_progress: true,
                ..Default::default()
            }),
        }
    }

    /// Turn off automatic follow-up events for asynchronous call actions
    pub fn without_auto_progress(self) -> Self {
        self.state.lock().auto_progress = false;
        self
    }

    // Scripting

    /// Offer an inbound call on an open line
    pub fn offer_call(&self, line_id: u32) -> Option<CallRef> {
        let mut state = self.state.lock();
        state.next_crn += 1;
        let call = CallRef::new(state.next_crn)?;
        let line = state.lines.get_mut(&line_id)?;
        line.call = Some(call);
        line.call_state = DriverCallState::Offered;
        let handle = line.handles.call_control;
        state
            .events
            .push_back(RawEvent::new(EventKind::Offered, handle).with_call(call));
        Some(call)
    }

    /// The remote side disconnects the current call
    pub fn remote_hangup(&self, line_id: u32) -> Option<CallRef> {
        let mut state = self.state.lock();
        let line = state.lines.get_mut(&line_id)?;
        let call = line.call?;
        line.call_state = DriverCallState::Disconnected;
        let handle = line.handles.call_control;
        state
            .events
            .push_back(RawEvent::new(EventKind::Disconnected, handle).with_call(call));
        Some(call)
    }

    /// Queue a raw event on one of the line's devices
    ///
    /// Call-lifecycle kinds go to the call-control device, everything else to the voice
    /// device. Returns `false` when the line is not open.
    pub fn push_event(&self, line_id: u32, kind: EventKind, call: Option<CallRef>) -> bool {
        let mut state = self.state.lock();
        let Some(line) = state.lines.get(&line_id) else {
            return false;
        };
        let handle = if kind.is_call_lifecycle() {
            line.handles.call_control
        } else {
            line.handles.voice
        };
        let mut event = RawEvent::new(kind, handle);
        event.call = call;
        state.events.push_back(event);
        true
    }

    pub fn push_keys(&self, line_id: u32, script: KeyScript) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.keys.push_back(script);
        }
    }

    /// Keys the caller typed ahead, waiting in the digit buffer
    pub fn type_ahead(&self, line_id: u32, keys: &str) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.buffer.push_str(keys);
        }
    }

    /// Convenience for a series of key presses, one per collection
    pub fn push_answers<'a>(&self, line_id: u32, answers: impl IntoIterator<Item = &'a str>) {
        for answer in answers {
            self.push_keys(line_id, KeyScript::keys(answer));
        }
    }

    pub fn push_media(&self, line_id: u32, script: MediaScript) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.media.push_back(script);
        }
    }

    pub fn push_call_progress(&self, line_id: u32, progress: CallProgress) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.progress.push_back(progress);
        }
    }

    pub fn push_tone_heard(&self, line_id: u32, tid: Option<u32>) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.tones_heard.push_back(tid);
        }
    }

    /// Result of the next `last_error` query after an empty wait on this line
    pub fn push_last_error(&self, line_id: u32, result: DriverResult<LastError>) {
        if let Some(line) = self.state.lock().lines.get_mut(&line_id) {
            line.last_errors.push_back(result);
        }
    }

    /// Fail the next call to `operation` (the trait method name) with `fault`
    pub fn fail_next(&self, operation: &str, fault: DriverFault) {
        self.state
            .lock()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(fault);
    }

    // Inspection

    pub fn actions(&self) -> Vec<DriverAction> {
        self.state.lock().actions.clone()
    }

    pub fn count(&self, predicate: impl Fn(&DriverAction) -> bool) -> usize {
        self.state.lock().actions.iter().filter(|a| predicate(*a)).count()
    }

    pub fn subsystem_starts(&self) -> usize {
        self.count(|a| matches!(a, DriverAction::StartSubsystem))
    }

    pub fn subsystem_stops(&self) -> usize {
        self.count(|a| matches!(a, DriverAction::StopSubsystem))
    }

    pub fn subsystem_running(&self) -> bool {
        self.state.lock().subsystem_running
    }

    pub fn played_files(&self, line_id: u32) -> Vec<String> {
        self.state
            .lock()
            .actions
            .iter()
            .filter_map(|a| match a {
                DriverAction::Play { line, file } if *line == line_id => Some(file.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_line_open(&self, line_id: u32) -> bool {
        self.state.lock().lines.contains_key(&line_id)
    }

    pub fn line_handles(&self, line_id: u32) -> Option<LineHandles> {
        self.state.lock().lines.get(&line_id).map(|l| l.handles)
    }

    pub fn installed_tones(&self, line_id: u32) -> Vec<u32> {
        self.state
            .lock()
            .lines
            .get(&line_id)
            .map(|l| l.installed_tones.clone())
            .unwrap_or_default()
    }

    pub fn volume(&self, line_id: u32) -> Option<i8> {
        self.state.lock().lines.get(&line_id).map(|l| l.volume)
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().events.len()
    }

    fn log_action(&self, state: &mut SimState, action: DriverAction) {
        trace!("sim action: {:?}", action);
        state.actions.push(action);
    }
}

/// Walk the keys until one of the stop conditions matches
fn evaluate_keys(keys: &str, conditions: &TerminationSet) -> (String, String, TerminationReason) {
    let max = conditions.max_digits() as usize;
    let mask = conditions.digit_mask();
    let mut collected = String::new();
    let mut chars = keys.chars();

    while let Some(c) = chars.next() {
        collected.push(c);
        if DigitKey::from_char(c).is_some_and(|key| mask.contains_key(key)) {
            return (collected, chars.collect(), TerminationReason::DIGIT);
        }
        if max > 0 && collected.chars().count() >= max {
            return (collected, chars.collect(), TerminationReason::MAX_DIGITS);
        }
    }

    let reason = if conditions.has_timeout() {
        TerminationReason::INTER_DIGIT_TIMEOUT
    } else {
        TerminationReason::MAX_TIME
    };
    (collected, String::new(), reason)
}

#[async_trait]
impl DriverBoundary for SimulatedDriver {
    async fn start_subsystem(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("start_subsystem")?;
        state.subsystem_running = true;
        self.log_action(&mut state, DriverAction::StartSubsystem);
        Ok(())
    }

    async fn stop_subsystem(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::StopSubsystem);
        state.take_failure("stop_subsystem")?;
        state.subsystem_running = false;
        Ok(())
    }

    async fn open_board(&self, board: u32) -> DriverResult<DeviceHandle> {
        let mut state = self.state.lock();
        state.take_failure("open_board")?;
        let handle = state.allocate_handle();
        state.boards.insert(handle, board);
        self.log_action(&mut state, DriverAction::OpenBoard(board));
        Ok(handle)
    }

    async fn close_board(&self, board: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::CloseBoard(board));
        state.take_failure("close_board")?;
        state.boards.remove(&board);
        Ok(())
    }

    async fn open_line(&self, address: &LineAddress) -> DriverResult<LineHandles> {
        let mut state = self.state.lock();
        state.take_failure("open_line")?;
        if state.lines.contains_key(&address.line_id) {
            return Err(DriverFault::new(-5, format!("line {} already open", address.line_id)));
        }
        let handles = LineHandles {
            voice: state.allocate_handle(),
            call_control: state.allocate_handle(),
        };
        state.lines.insert(
            address.line_id,
            SimLine {
                handles,
                call: None,
                call_state: DriverCallState::Null,
                buffer: String::new(),
                keys: VecDeque::new(),
                media: VecDeque::new(),
                progress: VecDeque::new(),
                tones_heard: VecDeque::new(),
                last_errors: VecDeque::new(),
                installed_tones: Vec::new(),
                volume: 0,
            },
        );
        self.log_action(&mut state, DriverAction::OpenLine(address.line_id));
        Ok(handles)
    }

    async fn close_line(&self, handles: &LineHandles) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (line_id, _) = state.line_by_voice(handles.voice)?;
        self.log_action(&mut state, DriverAction::CloseLine(line_id));
        state.take_failure("close_line")?;
        state.lines.remove(&line_id);
        let voice = handles.voice;
        let call_control = handles.call_control;
        state
            .events
            .retain(|e| e.handle != voice && e.handle != call_control);
        Ok(())
    }

    async fn stop_channel(&self, voice: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(&mut state, DriverAction::StopChannel(line_id));
        state.take_failure("stop_channel")?;
        for event in state.events.iter_mut().filter(|e| e.handle == voice) {
            if matches!(event.kind, EventKind::PlayComplete | EventKind::RecordComplete) {
                event.reason = TerminationReason::USER_STOP;
            }
        }
        Ok(())
    }

    async fn set_audio_format(&self, voice: DeviceHandle, _format: AudioFormat) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("set_audio_format")?;
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(&mut state, DriverAction::SetAudioFormat(line_id));
        Ok(())
    }

    async fn set_volume(&self, voice: DeviceHandle, level: i8) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("set_volume")?;
        let (line_id, line) = state.line_by_voice(voice)?;
        line.volume = level;
        self.log_action(&mut state, DriverAction::SetVolume { line: line_id, level });
        Ok(())
    }

    async fn register(&self, board: DeviceHandle, registration: &Registration) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("register")?;
        self.log_action(
            &mut state,
            DriverAction::Register {
                alias: registration.alias.clone(),
            },
        );
        state
            .events
            .push_back(RawEvent::new(EventKind::ServiceResponse, board));
        Ok(())
    }

    async fn unregister(&self, _board: DeviceHandle, registration: &Registration) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(
            &mut state,
            DriverAction::Unregister {
                alias: registration.alias.clone(),
            },
        );
        state.take_failure("unregister")
    }

    async fn wait_call(&self, call_control: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("wait_call")?;
        let (line_id, _) = state.line_by_call_control(call_control)?;
        self.log_action(&mut state, DriverAction::WaitCall(line_id));
        Ok(())
    }

    async fn originate(&self, call_control: DeviceHandle, call: &OutboundCall) -> DriverResult<CallRef> {
        let mut state = self.state.lock();
        state.take_failure("originate")?;
        state.next_crn += 1;
        let crn = CallRef::new(state.next_crn)
            .ok_or_else(|| DriverFault::new(-1, "call reference space exhausted"))?;
        let auto = state.auto_progress;
        let (line_id, line) = state.line_by_call_control(call_control)?;
        line.call = Some(crn);
        line.call_state = DriverCallState::Dialing;
        self.log_action(
            &mut state,
            DriverAction::Originate {
                line: line_id,
                dnis: call.dnis.clone(),
            },
        );
        if auto {
            state.push_call_event(crn, EventKind::Alerting);
        }
        Ok(crn)
    }

    async fn acknowledge(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::Acknowledge(call));
        state.take_failure("acknowledge")?;
        if state.auto_progress {
            state.push_call_event(call, EventKind::CallProcessing);
        }
        Ok(())
    }

    async fn accept(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::Accept(call));
        state.take_failure("accept")?;
        let auto = state.auto_progress;
        let (_, line) = state.line_by_call(call)?;
        line.call_state = DriverCallState::Accepted;
        if auto {
            state.push_call_event(call, EventKind::Accept);
        }
        Ok(())
    }

    async fn answer(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::Answer(call));
        state.take_failure("answer")?;
        let auto = state.auto_progress;
        let (_, line) = state.line_by_call(call)?;
        line.call_state = DriverCallState::Connected;
        if auto {
            state.push_call_event(call, EventKind::Answered);
        }
        Ok(())
    }

    async fn set_codec(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::SetCodec(call));
        state.take_failure("set_codec")
    }

    async fn drop_call(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::DropCall(call));
        state.take_failure("drop_call")?;
        let auto = state.auto_progress;
        let (_, line) = state.line_by_call(call)?;
        line.call_state = DriverCallState::Disconnected;
        if auto {
            state.push_call_event(call, EventKind::DropCall);
        }
        Ok(())
    }

    async fn release_call(&self, call: CallRef) -> DriverResult<()> {
        let mut state = self.state.lock();
        self.log_action(&mut state, DriverAction::ReleaseCall(call));
        state.take_failure("release_call")?;
        let auto = state.auto_progress;
        if auto {
            state.push_call_event(call, EventKind::ReleaseCall);
        }
        let (_, line) = state.line_by_call(call)?;
        line.call = None;
        line.call_state = DriverCallState::Idle;
        Ok(())
    }

    async fn call_state(&self, call: CallRef) -> DriverResult<DriverCallState> {
        let mut state = self.state.lock();
        state.take_failure("call_state")?;
        match state.line_by_call(call) {
            Ok((_, line)) => Ok(line.call_state),
            Err(_) => Ok(DriverCallState::Idle),
        }
    }

    async fn start_call_progress(&self, voice: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("start_call_progress")?;
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(&mut state, DriverAction::StartCallProgress(line_id));
        state
            .events
            .push_back(RawEvent::new(EventKind::CallProgressComplete, voice));
        Ok(())
    }

    async fn call_progress(&self, voice: DeviceHandle) -> DriverResult<CallProgress> {
        let mut state = self.state.lock();
        state.take_failure("call_progress")?;
        let (_, line) = state.line_by_voice(voice)?;
        let progress = line.progress.pop_front().unwrap_or_else(CallProgress::connected);
        if progress.result == ProgressResult::Connected {
            line.call_state = DriverCallState::Connected;
        }
        Ok(progress)
    }

    async fn play(
        &self,
        voice: DeviceHandle,
        file: &str,
        _conditions: &TerminationSet,
        _format: AudioFormat,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (line_id, line) = state.line_by_voice(voice)?;
        let script = line
            .media
            .pop_front()
            .unwrap_or(MediaScript::Complete(TerminationReason::END_OF_DATA));
        let call = line.call;
        self.log_action(
            &mut state,
            DriverAction::Play {
                line: line_id,
                file: file.to_string(),
            },
        );
        state.take_failure("play")?;
        match script {
            MediaScript::Complete(reason) => state
                .events
                .push_back(RawEvent::new(EventKind::PlayComplete, voice).with_reason(reason)),
            MediaScript::CallerHangsUp => {
                if let Some(call) = call {
                    if let Ok((_, line)) = state.line_by_call(call) {
                        line.call_state = DriverCallState::Disconnected;
                    }
                    state.push_call_event(call, EventKind::Disconnected);
                }
            }
        }
        Ok(())
    }

    async fn record(
        &self,
        voice: DeviceHandle,
        file: &str,
        _conditions: &TerminationSet,
        _format: AudioFormat,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (line_id, line) = state.line_by_voice(voice)?;
        let script = line
            .media
            .pop_front()
            .unwrap_or(MediaScript::Complete(TerminationReason::MAX_TIME));
        let call = line.call;
        self.log_action(
            &mut state,
            DriverAction::Record {
                line: line_id,
                file: file.to_string(),
            },
        );
        state.take_failure("record")?;
        match script {
            MediaScript::Complete(reason) => state
                .events
                .push_back(RawEvent::new(EventKind::RecordComplete, voice).with_reason(reason)),
            MediaScript::CallerHangsUp => {
                if let Some(call) = call {
                    if let Ok((_, line)) = state.line_by_call(call) {
                        line.call_state = DriverCallState::Disconnected;
                    }
                    state.push_call_event(call, EventKind::Disconnected);
                }
            }
        }
        Ok(())
    }

    async fn get_digits(
        &self,
        voice: DeviceHandle,
        conditions: &TerminationSet,
    ) -> DriverResult<CollectedDigits> {
        let mut state = self.state.lock();
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(
            &mut state,
            DriverAction::GetDigits {
                line: line_id,
                max_digits: conditions.max_digits(),
            },
        );
        state.take_failure("get_digits")?;

        let flush_only = conditions
            .get(crate::termination::ConditionKind::InterDigitTimeout)
            .is_some_and(|c| c.threshold < FLUSH_THRESHOLD_100MS);

        let (_, line) = state.line_by_voice(voice)?;
        let script = if flush_only {
            KeyScript::Keys(String::new())
        } else {
            line.keys.pop_front().unwrap_or_else(KeyScript::silence)
        };

        let result = match script {
            KeyScript::Keys(keys) => {
                let typed = format!("{}{}", std::mem::take(&mut line.buffer), keys);
                let (digits, rest, reason) = evaluate_keys(&typed, conditions);
                line.buffer = rest;
                CollectedDigits { digits, reason }
            }
            KeyScript::HangUp(keys) => {
                let typed = format!("{}{}", std::mem::take(&mut line.buffer), keys);
                line.call_state = DriverCallState::Disconnected;
                let call = line.call;
                if let Some(call) = call {
                    state.push_call_event(call, EventKind::Disconnected);
                }
                CollectedDigits {
                    digits: typed,
                    reason: TerminationReason::LOOP_CURRENT_OFF,
                }
            }
            KeyScript::UserStop => CollectedDigits {
                digits: String::new(),
                reason: TerminationReason::USER_STOP,
            },
            KeyScript::IoError => CollectedDigits {
                digits: String::new(),
                reason: TerminationReason::IO_ERROR,
            },
        };
        debug!(line = line_id, "sim collected {:?} ({:?})", result.digits, result.reason);
        Ok(result)
    }

    async fn clear_digit_buffer(&self, voice: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        let (line_id, line) = state.line_by_voice(voice)?;
        line.buffer.clear();
        self.log_action(&mut state, DriverAction::ClearDigitBuffer(line_id));
        state.take_failure("clear_digit_buffer")
    }

    async fn delete_tones(&self, voice: DeviceHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("delete_tones")?;
        let (line_id, line) = state.line_by_voice(voice)?;
        line.installed_tones.clear();
        self.log_action(&mut state, DriverAction::DeleteTones(line_id));
        Ok(())
    }

    async fn add_tone(&self, voice: DeviceHandle, tone: &CustomTone) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("add_tone")?;
        let (line_id, line) = state.line_by_voice(voice)?;
        line.installed_tones.push(tone.tid);
        self.log_action(
            &mut state,
            DriverAction::AddTone {
                line: line_id,
                tid: tone.tid,
            },
        );
        Ok(())
    }

    async fn enable_tone(&self, voice: DeviceHandle, tid: u32) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("enable_tone")?;
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(&mut state, DriverAction::EnableTone { line: line_id, tid });
        Ok(())
    }

    async fn disable_tone(&self, voice: DeviceHandle, tid: u32) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.take_failure("disable_tone")?;
        let (line_id, _) = state.line_by_voice(voice)?;
        self.log_action(&mut state, DriverAction::DisableTone { line: line_id, tid });
        Ok(())
    }

    async fn listen_for_tone(&self, voice: DeviceHandle, _timeout: Duration) -> DriverResult<Option<u32>> {
        let mut state = self.state.lock();
        state.take_failure("listen_for_tone")?;
        let (_, line) = state.line_by_voice(voice)?;
        let default = line.installed_tones.first().copied();
        Ok(line.tones_heard.pop_front().unwrap_or(default))
    }

    async fn wait_event(&self, handles: &[DeviceHandle], _slice: Duration) -> WaitPoll {
        let event = {
            let mut state = self.state.lock();
            let position = state.events.iter().position(|e| handles.contains(&e.handle));
            position.and_then(|i| state.events.remove(i))
        };
        match event {
            Some(event) => {
                trace!("sim event {} on {}", event.kind, event.handle);
                WaitPoll::Event(event)
            }
            None => {
                tokio::task::yield_now().await;
                WaitPoll::Nothing
            }
        }
    }

    async fn last_error(&self, handle: DeviceHandle) -> DriverResult<LastError> {
        let mut state = self.state.lock();
        let scripted = state
            .lines
            .values_mut()
            .find(|l| l.handles.voice == handle || l.handles.call_control == handle)
            .and_then(|l| l.last_errors.pop_front());
        scripted.unwrap_or(Ok(LastError::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_stops_on_terminator() {
        let set = TerminationSet::build(10, "#", 5000, 15);
        let (digits, rest, reason) = evaluate_keys("12#45", &set);
        assert_eq!(digits, "12#");
        assert_eq!(rest, "45");
        assert_eq!(reason, TerminationReason::DIGIT);
    }

    #[test]
    fn test_evaluate_stops_on_count() {
        let set = TerminationSet::build(4, "#", 5000, 15);
        let (digits, rest, reason) = evaluate_keys("123456", &set);
        assert_eq!(digits, "1234");
        assert_eq!(rest, "56");
        assert_eq!(reason, TerminationReason::MAX_DIGITS);
    }

    #[test]
    fn test_evaluate_times_out() {
        let set = TerminationSet::build(4, "#", 5000, 15);
        let (digits, _, reason) = evaluate_keys("12", &set);
        assert_eq!(digits, "12");
        assert_eq!(reason, TerminationReason::INTER_DIGIT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_auto_progress_follows_acknowledge() {
        let sim = SimulatedDriver::new();
        let handles = sim.open_line(&LineAddress::for_line(1, 0)).await.unwrap();
        let call = sim.offer_call(1).unwrap();

        let offered = sim.wait_event(&[handles.call_control], Duration::from_millis(1)).await;
        assert!(matches!(offered, WaitPoll::Event(ref e) if e.kind == EventKind::Offered));

        sim.acknowledge(call).await.unwrap();
        match sim.wait_event(&[handles.call_control], Duration::from_millis(1)).await {
            WaitPoll::Event(event) => {
                assert_eq!(event.kind, EventKind::CallProcessing);
                assert_eq!(event.call, Some(call));
            }
            WaitPoll::Nothing => panic!("expected CallProcessing"),
        }
    }

    #[tokio::test]
    async fn test_wait_only_returns_events_for_given_handles() {
        let sim = SimulatedDriver::new();
        let one = sim.open_line(&LineAddress::for_line(1, 0)).await.unwrap();
        let two = sim.open_line(&LineAddress::for_line(2, 0)).await.unwrap();
        sim.offer_call(2).unwrap();

        let poll = sim.wait_event(&[one.voice, one.call_control], Duration::from_millis(1)).await;
        assert_eq!(poll, WaitPoll::Nothing);
        let poll = sim.wait_event(&[two.call_control], Duration::from_millis(1)).await;
        assert!(matches!(poll, WaitPoll::Event(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let sim = SimulatedDriver::new();
        sim.fail_next("start_subsystem", DriverFault::new(-9, "no board"));
        assert!(sim.start_subsystem().await.is_err());
        assert!(sim.start_subsystem().await.is_ok());
        assert_eq!(sim.subsystem_starts(), 1);
    }
}
