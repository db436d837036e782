//! Playback and recording

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

use crate::digits::Interruption;
use crate::driver::{EventKind, RawEvent, TerminationReason};
use crate::error::{LineError, LineResult};
use crate::line::Line;
use crate::logging::line_span;
use crate::phrase::{self, PhraseItem};
use crate::termination::TerminationSet;

/// Any key stops playback or recording
pub const MEDIA_TERMINATORS: &str = "0123456789#*abcd";

const PLAY_DIGITS: u32 = 10;
const RECORD_DIGITS: u32 = 1;
const DRAIN_SLICE: Duration = Duration::from_millis(50);

impl Line {
    /// Play one audio file; a key press stops it early and stays in the digit buffer
    pub async fn play_file(&mut self, file: &str) -> LineResult<()> {
        self.check_dispose()?;
        let span = line_span(self.id);
        let result = self.play_one(file).instrument(span).await;
        self.settle(result)
    }

    pub async fn play_file_with_cancel(&mut self, file: &str, token: &CancellationToken) -> LineResult<()> {
        self.cancel = Some(token.clone());
        let result = self.play_file(file).await;
        self.cancel = None;
        result
    }

    /// Play a phrase such as `"12|N,dollars.wav|F"`; see [`crate::phrase`]
    pub async fn play_phrase(&mut self, phrase: &str) -> LineResult<()> {
        self.check_dispose()?;
        let items = phrase::render_phrase(phrase, &self.props.system_recordings_dir)?;
        let span = line_span(self.id);
        let result = self.play_items(&items).instrument(span).await;
        self.settle(result)
    }

    /// Play `text` as a phrase when it contains `|`, as a file otherwise
    pub async fn play_file_or_phrase(&mut self, text: &str) -> LineResult<()> {
        if phrase::is_phrase(text) {
            self.play_phrase(text).await
        } else {
            self.play_file(text).await
        }
    }

    /// Record to `file` until a key is pressed or the default record timeout passes
    pub async fn record_file(&mut self, file: &str) -> LineResult<()> {
        let timeout_ms = self.props.record_timeout_ms;
        self.record_file_with_timeout(file, timeout_ms).await
    }

    pub async fn record_file_with_timeout(&mut self, file: &str, timeout_ms: u32) -> LineResult<()> {
        self.check_dispose()?;
        let span = line_span(self.id);
        let result = self
            .record_one(file, timeout_ms)
            .instrument(span)
            .await;
        self.settle(result)
    }

    async fn play_items(&mut self, items: &[PhraseItem]) -> LineResult<()> {
        for item in items {
            match item {
                PhraseItem::File(file) => self.play_one(file).await?,
                PhraseItem::Pause(pause) => {
                    tokio::time::sleep(*pause).await;
                    self.check_disposing()?;
                }
            }
        }
        Ok(())
    }

    async fn play_one(&mut self, file: &str) -> LineResult<()> {
        self.check_call_state().await?;
        let set = TerminationSet::build(PLAY_DIGITS, MEDIA_TERMINATORS, 0, self.props.max_digits_supported);
        trace!(line = self.id, file, "playing");

        self.driver
            .play(self.handles.voice, file, &set, self.props.audio_format)
            .await
            .map_err(|fault| LineError::driver("play", fault))?;

        let timeout = Duration::from_millis(self.props.play_completion_timeout_ms);
        let event = self.await_media(EventKind::PlayComplete, timeout).await?;
        debug!(line = self.id, file, reason = ?event.reason, "play finished");
        self.media_outcome(event.reason, "play").await
    }

    async fn record_one(&mut self, file: &str, timeout_ms: u32) -> LineResult<()> {
        self.check_call_state().await?;
        self.flush_digit_buffer_inner().await?;
        let set = TerminationSet::build(
            RECORD_DIGITS,
            MEDIA_TERMINATORS,
            timeout_ms,
            self.props.max_digits_supported,
        );
        trace!(line = self.id, file, timeout_ms, "recording");

        self.driver
            .record(self.handles.voice, file, &set, self.props.audio_format)
            .await
            .map_err(|fault| LineError::driver("record", fault))?;

        let timeout = Duration::from_millis(self.props.record_completion_timeout_ms);
        let event = self.await_media(EventKind::RecordComplete, timeout).await?;
        debug!(line = self.id, file, reason = ?event.reason, "record finished");
        self.media_outcome(event.reason, "record").await?;

        self.flush_digit_buffer_inner().await?;
        Ok(())
    }

    /// Map how a media operation ended; a hang-up bit tears the call down
    async fn media_outcome(&mut self, reason: TerminationReason, operation: &str) -> LineResult<()> {
        let interruption = Interruption::from_reason(reason);
        if interruption == Interruption::Hangup {
            self.hangup_detected().await;
        }
        interruption.into_result(operation)
    }

    /// Wait for a media completion event
    ///
    /// When the call goes away first, the completion that will still arrive for the
    /// stopped operation is drained so it can't satisfy a later wait.
    async fn await_media(&mut self, kind: EventKind, timeout: Duration) -> LineResult<RawEvent> {
        match self.expect_event(kind, timeout).await {
            Err(LineError::Hangup) => {
                let drain = Duration::from_millis(self.props.hangup_drain_ms);
                debug!(line = self.id, "hang-up during {}, draining for {:?}", kind, drain);
                self.drain_events(drain).await;
                Err(LineError::Hangup)
            }
            Err(LineError::Disposing) => {
                self.drain_events(DRAIN_SLICE).await;
                Err(LineError::Disposing)
            }
            other => other,
        }
    }
}
