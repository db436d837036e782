//! # IVR Core - Line Call Control and Prompt Engine
//!
//! This crate drives interactive voice response lines on top of a telephony driver. The
//! driver itself (boards, SIP stack, media) sits behind the [`DriverBoundary`] trait; this
//! crate owns everything above it:
//!
//! - **Call state machine**: acknowledges, accepts and answers offered calls, and tears
//!   released calls down until the line is idle again
//! - **Event dispatch loop**: bounded polling for driver events, with dispose checks
//!   between polls
//! - **Digit collection**: termination conditions, terminator stripping, timeouts
//! - **Prompt engine**: play, collect, validate and retry within attempt budgets
//! - **Line lifecycle**: open, register, dispose, and a shared, reference-counted driver
//!   subsystem
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                 Application (one task per line)             │
//! ├────────────────────────────────────────────────────────────┤
//! │  prompt / multi_try_prompt      LineManager::open_line      │
//! │  get_digits / play / record     LineManagement (dispose)    │
//! ├──────────────────────┬─────────────────────────────────────┤
//! │ Digit collector      │ Call state machine  │ Board session  │
//! │ Termination builder  │ Event dispatch loop │ (ref counted)  │
//! ├──────────────────────┴─────────────────────────────────────┤
//! │                      DriverBoundary                         │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use ivr_core::driver::sim::{KeyScript, SimulatedDriver};
//! use ivr_core::prompt::{MultiTryPromptOptions, PromptOptions};
//! use ivr_core::{LineManager, VoiceProperties};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> ivr_core::LineResult<()> {
//! let driver = Arc::new(SimulatedDriver::new());
//! let manager = LineManager::new(driver.clone(), VoiceProperties::default())?;
//! let mut line = manager.open_line(1).await?;
//!
//! // A caller rings in and picks option 2
//! driver.offer_call(1);
//! driver.push_keys(1, KeyScript::keys("2"));
//!
//! line.wait_for_call(1).await?;
//! let choice = line
//!     .multi_try_prompt_any(
//!         "main-menu.wav",
//!         MultiTryPromptOptions::new(PromptOptions::new().with_max_length(1)),
//!     )
//!     .await?;
//! assert_eq!(choice, "2");
//!
//! line.hangup().await?;
//! line.dispose().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every operation returns [`LineResult`]. [`LineError::Hangup`] and
//! [`LineError::Disposing`] are ordinary call flow; match on them to end the call or the
//! line. [`LineError::Driver`] is always fatal for the operation that hit it.

pub mod call;
pub mod config;
pub mod digits;
pub mod driver;
pub mod error;
pub mod events;
pub mod line;
pub mod logging;
pub mod phrase;
pub mod playback;
pub mod prompt;
pub mod session;
pub mod termination;
pub mod tones;

pub use call::{CallState, CallTransition};
pub use config::{POLL_SLICE, TimeoutPolicy, VoiceProperties};
pub use driver::DriverBoundary;
pub use error::{LineError, LineResult};
pub use line::{CallAnalysis, Line, LineManagement, LineStats, LineStatus};
pub use prompt::{MultiTryPromptOptions, PromptOptions};
pub use session::{BoardSession, LineManager};
pub use termination::TerminationSet;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
