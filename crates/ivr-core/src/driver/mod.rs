//! The telephony driver boundary
//!
//! Everything below this trait (boards, signaling stacks, media) is external. The line
//! code only issues requests and reads events through it.
//!
//! Request methods come in two flavors:
//!
//! - **Synchronous**: `get_digits`, `call_state`, `last_error`, the open/close calls.
//!   The result is final when the future resolves.
//! - **Asynchronous actions**: `acknowledge`, `accept`, `answer`, `drop_call`,
//!   `release_call`, `play`, `record`, `originate`, `register`. An `Ok(())` only means
//!   the driver accepted the request; completion arrives later as a [`RawEvent`] from
//!   [`DriverBoundary::wait_event`] and must be waited for explicitly.

pub mod sim;
pub mod types;

pub use types::*;

use std::time::Duration;

use async_trait::async_trait;

use crate::termination::TerminationSet;
use crate::tones::CustomTone;

#[async_trait]
pub trait DriverBoundary: Send + Sync {
    // Shared subsystem

    async fn start_subsystem(&self) -> DriverResult<()>;

    async fn stop_subsystem(&self) -> DriverResult<()>;

    async fn open_board(&self, board: u32) -> DriverResult<DeviceHandle>;

    async fn close_board(&self, board: DeviceHandle) -> DriverResult<()>;

    // Line devices

    async fn open_line(&self, address: &LineAddress) -> DriverResult<LineHandles>;

    async fn close_line(&self, handles: &LineHandles) -> DriverResult<()>;

    /// Stop any I/O in progress on the channel; the operation ends with `USER_STOP`
    async fn stop_channel(&self, voice: DeviceHandle) -> DriverResult<()>;

    async fn set_audio_format(&self, voice: DeviceHandle, format: AudioFormat) -> DriverResult<()>;

    async fn set_volume(&self, voice: DeviceHandle, level: i8) -> DriverResult<()>;

    // Registration (completion is a `ServiceResponse` event on the board)

    async fn register(&self, board: DeviceHandle, registration: &Registration) -> DriverResult<()>;

    async fn unregister(&self, board: DeviceHandle, registration: &Registration)
        -> DriverResult<()>;

    // Call control

    /// Arm the call-control device to receive `Offered` events
    async fn wait_call(&self, call_control: DeviceHandle) -> DriverResult<()>;

    async fn originate(
        &self,
        call_control: DeviceHandle,
        call: &OutboundCall,
    ) -> DriverResult<CallRef>;

    async fn acknowledge(&self, call: CallRef) -> DriverResult<()>;

    async fn accept(&self, call: CallRef) -> DriverResult<()>;

    async fn answer(&self, call: CallRef) -> DriverResult<()>;

    async fn set_codec(&self, call: CallRef) -> DriverResult<()>;

    async fn drop_call(&self, call: CallRef) -> DriverResult<()>;

    async fn release_call(&self, call: CallRef) -> DriverResult<()>;

    async fn call_state(&self, call: CallRef) -> DriverResult<DriverCallState>;

    /// Start call progress analysis; completion is a `CallProgressComplete` event
    async fn start_call_progress(&self, voice: DeviceHandle) -> DriverResult<()>;

    async fn call_progress(&self, voice: DeviceHandle) -> DriverResult<CallProgress>;

    // Media

    async fn play(
        &self,
        voice: DeviceHandle,
        file: &str,
        conditions: &TerminationSet,
        format: AudioFormat,
    ) -> DriverResult<()>;

    async fn record(
        &self,
        voice: DeviceHandle,
        file: &str,
        conditions: &TerminationSet,
        format: AudioFormat,
    ) -> DriverResult<()>;

    async fn get_digits(
        &self,
        voice: DeviceHandle,
        conditions: &TerminationSet,
    ) -> DriverResult<CollectedDigits>;

    async fn clear_digit_buffer(&self, voice: DeviceHandle) -> DriverResult<()>;

    // Tones

    async fn delete_tones(&self, voice: DeviceHandle) -> DriverResult<()>;

    async fn add_tone(&self, voice: DeviceHandle, tone: &CustomTone) -> DriverResult<()>;

    async fn enable_tone(&self, voice: DeviceHandle, tid: u32) -> DriverResult<()>;

    async fn disable_tone(&self, voice: DeviceHandle, tid: u32) -> DriverResult<()>;

    /// Listen for any enabled custom tone; `None` when nothing was heard
    async fn listen_for_tone(&self, voice: DeviceHandle, timeout: Duration)
        -> DriverResult<Option<u32>>;

    // Events

    /// Wait at most `slice` for the next event on any of `handles`
    async fn wait_event(&self, handles: &[DeviceHandle], slice: Duration) -> WaitPoll;

    /// Last error recorded on a device, used to interpret `WaitPoll::Nothing`
    async fn last_error(&self, handle: DeviceHandle) -> DriverResult<LastError>;
}
