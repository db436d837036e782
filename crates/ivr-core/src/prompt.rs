//! Prompt and retry engine
//!
//! A prompt plays a message, collects an answer and checks it, retrying within two
//! budgets: total attempts and consecutive blank attempts.
//!
//! ```text
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!   play message ──▶ collect ──▶ timeout? ──yes──────────┤ count / blank
//!                                   │                   │
//!                                   no                  │
//!                                   ▼                   │
//!                          special terminator? ──yes──▶ callback (attempt not charged)
//!                                   │                   │
//!                                   no                  │
//!                                   ▼                   │
//!                              accepted? ──no──▶ invalid message
//!                                   │
//!                                  yes ──▶ answer
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use ivr_core::prompt::{MultiTryPromptOptions, PromptOptions};
//! # async fn menu(line: &mut ivr_core::Line) -> ivr_core::LineResult<()> {
//! let options = MultiTryPromptOptions::new(
//!     PromptOptions::new()
//!         .with_max_length(4)
//!         .with_invalid_answer_message("invalid.wav"),
//! )
//! .with_max_attempts(3);
//!
//! let pin = line
//!     .multi_try_prompt("enter-pin.wav", |answer| answer.len() == 4, options)
//!     .await?;
//! # let _ = pin;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info};

use crate::config::TimeoutPolicy;
use crate::digits::{CollectOutcome, TIMEOUT_MARKER, strip_terminator};
use crate::error::{LineError, LineResult};
use crate::line::Line;
use crate::logging::line_span;

pub const DEFAULT_TERMINATORS: &str = "#";
pub const DEFAULT_MAX_LENGTH: u32 = 30;
pub const DEFAULT_ALLOWED_DIGITS: &str = "0123456789*#";

pub type PromptHook = Arc<dyn Fn() + Send + Sync>;
pub type KeysHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Settings for one prompt
#[derive(Clone)]
pub struct PromptOptions {
    pub max_length: u32,
    pub terminators: String,
    /// Keys accepted by single-key menus when no validator is given
    pub allowed_digits: String,
    pub special_terminator: Option<char>,
    pub on_special_terminator: Option<PromptHook>,
    pub invalid_answer_message: Option<String>,
    pub too_many_attempts_message: Option<String>,
    pub allow_empty: bool,
    /// Fail with `TooManyAttempts` when the budgets run out; otherwise answer `""`
    pub fail_on_too_many_attempts: bool,
    /// Overrides the inter-digit timeout from the line's properties
    pub timeout_ms: Option<u32>,
    /// Overrides the timeout policy from the line's properties
    pub timeout_policy: Option<TimeoutPolicy>,
    pub on_keys_entered: Option<KeysHook>,
    pub on_pre_play: Option<PromptHook>,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            terminators: DEFAULT_TERMINATORS.to_string(),
            allowed_digits: DEFAULT_ALLOWED_DIGITS.to_string(),
            special_terminator: None,
            on_special_terminator: None,
            invalid_answer_message: None,
            too_many_attempts_message: None,
            allow_empty: false,
            fail_on_too_many_attempts: true,
            timeout_ms: None,
            timeout_policy: None,
            on_keys_entered: None,
            on_pre_play: None,
        }
    }
}

impl PromptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(mut self, max_length: u32) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_terminators(mut self, terminators: impl Into<String>) -> Self {
        self.terminators = terminators.into();
        self
    }

    pub fn with_allowed_digits(mut self, allowed: impl Into<String>) -> Self {
        self.allowed_digits = allowed.into();
        self
    }

    /// A key that runs `handler` instead of ending the prompt
    pub fn with_special_terminator<F>(mut self, key: char, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.special_terminator = Some(key);
        self.on_special_terminator = Some(Arc::new(handler));
        self
    }

    pub fn with_invalid_answer_message(mut self, message: impl Into<String>) -> Self {
        self.invalid_answer_message = Some(message.into());
        self
    }

    pub fn with_too_many_attempts_message(mut self, message: impl Into<String>) -> Self {
        self.too_many_attempts_message = Some(message.into());
        self
    }

    pub fn with_allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn with_fail_on_too_many_attempts(mut self, fail: bool) -> Self {
        self.fail_on_too_many_attempts = fail;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = Some(policy);
        self
    }

    pub fn with_on_keys_entered<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_keys_entered = Some(Arc::new(hook));
        self
    }

    pub fn with_on_pre_play<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_pre_play = Some(Arc::new(hook));
        self
    }

    fn effective_max_length(&self) -> u32 {
        if self.max_length == 0 { DEFAULT_MAX_LENGTH } else { self.max_length }
    }

    fn effective_terminators(&self) -> &str {
        if self.terminators.is_empty() { DEFAULT_TERMINATORS } else { &self.terminators }
    }

    fn effective_allowed_digits(&self) -> &str {
        if self.allowed_digits.is_empty() {
            DEFAULT_ALLOWED_DIGITS
        } else {
            &self.allowed_digits
        }
    }
}

impl fmt::Debug for PromptOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromptOptions")
            .field("max_length", &self.max_length)
            .field("terminators", &self.terminators)
            .field("allowed_digits", &self.allowed_digits)
            .field("special_terminator", &self.special_terminator)
            .field("invalid_answer_message", &self.invalid_answer_message)
            .field("too_many_attempts_message", &self.too_many_attempts_message)
            .field("allow_empty", &self.allow_empty)
            .field("fail_on_too_many_attempts", &self.fail_on_too_many_attempts)
            .field("timeout_ms", &self.timeout_ms)
            .field("timeout_policy", &self.timeout_policy)
            .finish_non_exhaustive()
    }
}

/// Settings for a prompt that retries; zero budgets fall back to the line's properties
#[derive(Debug, Clone, Default)]
pub struct MultiTryPromptOptions {
    pub prompt: PromptOptions,
    pub max_attempts: u32,
    pub blank_max_attempts: u32,
}

impl MultiTryPromptOptions {
    pub fn new(prompt: PromptOptions) -> Self {
        Self {
            prompt,
            max_attempts: 0,
            blank_max_attempts: 0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_blank_max_attempts(mut self, attempts: u32) -> Self {
        self.blank_max_attempts = attempts;
        self
    }
}

type Validator<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Attempt counters for one prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Budget {
    max_attempts: u32,
    blank_max_attempts: u32,
    policy: TimeoutPolicy,
    count: u32,
    blank: u32,
}

impl Budget {
    pub(crate) fn new(max_attempts: u32, blank_max_attempts: u32, policy: TimeoutPolicy) -> Self {
        Self {
            max_attempts,
            blank_max_attempts,
            policy,
            count: 0,
            blank: 0,
        }
    }

    pub(crate) fn has_attempts_left(&self) -> bool {
        self.count < self.max_attempts && self.blank < self.blank_max_attempts
    }

    /// Charge one finished iteration
    pub(crate) fn charge(&mut self, answer: &str, timed_out: bool, special: bool) {
        if !(timed_out && self.policy == TimeoutPolicy::CountsAsAttempt) {
            self.blank += 1;
        }
        if !answer.is_empty() {
            self.blank = 0;
        }
        if !special {
            self.count += 1;
        }
    }
}

impl Line {
    /// Play a message and collect one answer, without retries
    pub async fn prompt(&mut self, file_or_phrase: &str, options: PromptOptions) -> LineResult<String> {
        self.check_dispose()?;
        let span = line_span(self.id);
        let result = self
            .ask(file_or_phrase, None, &options, 1, 1)
            .instrument(span)
            .await;
        self.settle(result)
    }

    pub async fn prompt_with_cancel(
        &mut self,
        file_or_phrase: &str,
        options: PromptOptions,
        token: &CancellationToken,
    ) -> LineResult<String> {
        self.cancel = Some(token.clone());
        let result = self.prompt(file_or_phrase, options).await;
        self.cancel = None;
        result
    }

    /// Ask until `validator` accepts an answer or a budget runs out
    pub async fn multi_try_prompt<F>(
        &mut self,
        file_or_phrase: &str,
        validator: F,
        options: MultiTryPromptOptions,
    ) -> LineResult<String>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        self.check_dispose()?;
        let (max, blank) = self.budgets(&options);
        let span = line_span(self.id);
        let result = self
            .ask(file_or_phrase, Some(&validator), &options.prompt, max, blank)
            .instrument(span)
            .await;
        self.settle(result)
    }

    /// Like [`Line::multi_try_prompt`] with the default acceptance rule: any non-empty
    /// answer, or a key from the allowed digits for single-key prompts
    pub async fn multi_try_prompt_any(
        &mut self,
        file_or_phrase: &str,
        options: MultiTryPromptOptions,
    ) -> LineResult<String> {
        self.check_dispose()?;
        let (max, blank) = self.budgets(&options);
        let span = line_span(self.id);
        let result = self
            .ask(file_or_phrase, None, &options.prompt, max, blank)
            .instrument(span)
            .await;
        self.settle(result)
    }

    pub async fn multi_try_prompt_with_cancel<F>(
        &mut self,
        file_or_phrase: &str,
        validator: F,
        options: MultiTryPromptOptions,
        token: &CancellationToken,
    ) -> LineResult<String>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        self.cancel = Some(token.clone());
        let result = self.multi_try_prompt(file_or_phrase, validator, options).await;
        self.cancel = None;
        result
    }

    fn budgets(&self, options: &MultiTryPromptOptions) -> (u32, u32) {
        let max = match options.max_attempts {
            0 => self.props.prompt_attempts,
            n => n,
        };
        let blank = match options.blank_max_attempts {
            0 => self.props.prompt_blank_attempts,
            n => n,
        };
        (max, blank)
    }

    async fn ask(
        &mut self,
        message: &str,
        validator: Option<Validator<'_>>,
        options: &PromptOptions,
        max_attempts: u32,
        blank_max_attempts: u32,
    ) -> LineResult<String> {
        self.stats.prompts += 1;

        let max_length = options.effective_max_length();
        let allowed = options.effective_allowed_digits();
        let special = options.special_terminator;
        let my_terminators: String = options
            .effective_terminators()
            .chars()
            .chain(special)
            .collect();
        let collect_terminators = format!("{my_terminators}{TIMEOUT_MARKER}");
        let timeout_accepted = my_terminators.contains(TIMEOUT_MARKER);
        let timeout_ms = options.timeout_ms.unwrap_or(self.props.digits_timeout_ms);
        let policy = options.timeout_policy.unwrap_or(self.props.timeout_policy);

        let single_key = |answer: &str| {
            (answer.is_empty() && options.allow_empty)
                || (answer.chars().count() == 1 && allowed.contains(answer))
        };
        let validator: Option<Validator<'_>> = match validator {
            Some(validator) => Some(validator),
            None if max_length == 1 => Some(&single_key),
            None => None,
        };

        let mut budget = Budget::new(max_attempts, blank_max_attempts, policy);
        while budget.has_attempts_left() {
            if let Some(hook) = &options.on_pre_play {
                hook();
            }
            self.play_file_or_phrase(message).await?;

            let (answer, terminator) = match self
                .collect_digits(max_length, &collect_terminators, timeout_ms)
                .await?
            {
                CollectOutcome::Digits(raw) => {
                    let stripped = strip_terminator(&raw, &collect_terminators);
                    (stripped.digits, stripped.terminator)
                }
                CollectOutcome::TimedOut(typed) => (typed, Some(TIMEOUT_MARKER)),
                CollectOutcome::Hangup => return Err(LineError::Hangup),
                CollectOutcome::Disposing => return Err(LineError::Disposing),
            };
            self.last_terminator = terminator.map(String::from).unwrap_or_default();

            if let Some(hook) = &options.on_keys_entered {
                hook(&answer);
            }
            debug!(line = self.id, answer = %answer, terminator = ?terminator, "prompt answer");

            let timed_out = terminator == Some(TIMEOUT_MARKER)
                && (!timeout_accepted || (!options.allow_empty && answer.is_empty()));
            let special_hit = !timed_out && special.is_some() && terminator == special;

            if special_hit {
                if let Some(hook) = &options.on_special_terminator {
                    hook();
                }
            } else if !timed_out {
                let accepted = match validator {
                    Some(validator) => validator(&answer),
                    None => !answer.is_empty() || options.allow_empty,
                };
                if accepted {
                    return Ok(answer);
                }
                if let Some(invalid) = &options.invalid_answer_message {
                    self.play_file_or_phrase(invalid).await?;
                }
            }

            budget.charge(&answer, timed_out, special_hit);
        }

        info!(line = self.id, message, "prompt ran out of attempts");
        if !options.fail_on_too_many_attempts {
            return Ok(String::new());
        }
        if let Some(too_many) = &options.too_many_attempts_message {
            self.play_file_or_phrase(too_many).await?;
        }
        Err(LineError::TooManyAttempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = PromptOptions::default();
        assert_eq!(options.effective_terminators(), "#");
        assert_eq!(options.effective_max_length(), 30);
        assert_eq!(options.effective_allowed_digits(), "0123456789*#");
        assert!(options.fail_on_too_many_attempts);

        let blank = PromptOptions::new().with_terminators("").with_max_length(0);
        assert_eq!(blank.effective_terminators(), "#");
        assert_eq!(blank.effective_max_length(), 30);
    }

    #[test]
    fn test_budget_counts_blank_answers() {
        let mut budget = Budget::new(10, 2, TimeoutPolicy::CountsAsBlank);
        budget.charge("", false, false);
        assert!(budget.has_attempts_left());
        budget.charge("", true, false);
        assert!(!budget.has_attempts_left());
    }

    #[test]
    fn test_budget_answer_resets_blank_count() {
        let mut budget = Budget::new(10, 2, TimeoutPolicy::CountsAsBlank);
        budget.charge("", false, false);
        budget.charge("12", false, false);
        budget.charge("", false, false);
        assert!(budget.has_attempts_left());
        assert_eq!(budget.count, 3);
    }

    #[test]
    fn test_budget_special_terminator_is_free() {
        let mut budget = Budget::new(1, 5, TimeoutPolicy::CountsAsBlank);
        budget.charge("", false, true);
        budget.charge("", false, true);
        assert!(budget.has_attempts_left());
        assert_eq!(budget.blank, 2);
    }

    #[test]
    fn test_budget_timeout_policy() {
        let mut budget = Budget::new(3, 1, TimeoutPolicy::CountsAsAttempt);
        budget.charge("", true, false);
        budget.charge("", true, false);
        assert_eq!(budget.blank, 0);
        assert!(budget.has_attempts_left());
        budget.charge("", true, false);
        assert!(!budget.has_attempts_left());
    }

    #[test]
    fn test_options_debug_skips_callbacks() {
        let options = PromptOptions::new().with_special_terminator('*', || {});
        let debug = format!("{options:?}");
        assert!(debug.contains("special_terminator: Some('*')"));
        assert!(!debug.contains("on_special_terminator"));
    }
}
