//! Shared driver subsystem and line management
//!
//! The driver subsystem and its board are shared by every line. [`BoardSession`] starts
//! them when the first line opens and stops them when the last line is released, with
//! the reference count and the start/stop calls under one lock. Nothing else on a line
//! takes that lock.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::VoiceProperties;
use crate::driver::{DeviceHandle, DriverBoundary, LineAddress};
use crate::error::{LineError, LineResult};
use crate::line::{Line, LineManagement, LineRegistry};

/// Board opened for every line of a session
pub const DEFAULT_BOARD: u32 = 1;

#[derive(Debug, Default)]
struct SharedState {
    references: usize,
    board: Option<DeviceHandle>,
}

/// Reference-counted driver subsystem and board
pub struct BoardSession {
    driver: Arc<dyn DriverBoundary>,
    state: Mutex<SharedState>,
}

impl BoardSession {
    pub fn new(driver: Arc<dyn DriverBoundary>) -> Arc<Self> {
        Arc::new(Self {
            driver,
            state: Mutex::new(SharedState::default()),
        })
    }

    /// Take a reference, starting the subsystem if this is the first one
    pub async fn acquire(&self) -> LineResult<DeviceHandle> {
        let mut state = self.state.lock().await;

        let board = match state.board {
            Some(board) if state.references > 0 => board,
            _ => {
                info!("starting driver subsystem");
                self.driver
                    .start_subsystem()
                    .await
                    .map_err(|fault| LineError::driver("start_subsystem", fault))?;
                match self.driver.open_board(DEFAULT_BOARD).await {
                    Ok(board) => {
                        state.board = Some(board);
                        board
                    }
                    Err(fault) => {
                        if let Err(stop_fault) = self.driver.stop_subsystem().await {
                            warn!("stop_subsystem after failed open_board: {}", stop_fault);
                        }
                        return Err(LineError::driver("open_board", fault));
                    }
                }
            }
        };

        state.references += 1;
        debug!(references = state.references, "board session acquired");
        Ok(board)
    }

    /// Drop a reference, stopping the subsystem when it was the last one
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.references == 0 {
            warn!("board session released more often than acquired");
            return;
        }

        state.references -= 1;
        debug!(references = state.references, "board session released");
        if state.references > 0 {
            return;
        }

        if let Some(board) = state.board.take() {
            if let Err(fault) = self.driver.close_board(board).await {
                warn!("close_board failed: {}", fault);
            }
        }
        info!("stopping driver subsystem");
        if let Err(fault) = self.driver.stop_subsystem().await {
            warn!("stop_subsystem failed: {}", fault);
        }
    }

    pub async fn references(&self) -> usize {
        self.state.lock().await.references
    }
}

impl fmt::Debug for BoardSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardSession").finish_non_exhaustive()
    }
}

/// Opens lines against one driver and keeps track of them
///
/// ```rust
/// use std::sync::Arc;
///
/// use ivr_core::config::VoiceProperties;
/// use ivr_core::driver::sim::{KeyScript, SimulatedDriver};
/// use ivr_core::session::LineManager;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> ivr_core::LineResult<()> {
/// let driver = Arc::new(SimulatedDriver::new());
/// let manager = LineManager::new(driver.clone(), VoiceProperties::default())?;
///
/// let mut line = manager.open_line(1).await?;
/// driver.push_keys(1, KeyScript::keys("42#"));
/// assert_eq!(line.get_digits(4, "#").await?, "42");
///
/// line.dispose().await;
/// assert_eq!(driver.subsystem_stops(), 1);
/// # Ok(())
/// # }
/// ```
pub struct LineManager {
    driver: Arc<dyn DriverBoundary>,
    session: Arc<BoardSession>,
    props: Arc<VoiceProperties>,
    lines: LineRegistry,
}

impl LineManager {
    pub fn new(driver: Arc<dyn DriverBoundary>, props: VoiceProperties) -> LineResult<Self> {
        props.validate()?;
        Ok(Self {
            session: BoardSession::new(driver.clone()),
            driver,
            props: Arc::new(props),
            lines: Arc::new(DashMap::new()),
        })
    }

    pub fn properties(&self) -> &VoiceProperties {
        &self.props
    }

    pub fn session(&self) -> &Arc<BoardSession> {
        &self.session
    }

    /// Open line `line_id` (numbered from 1)
    ///
    /// Registers with the SIP proxy when one is configured.
    pub async fn open_line(&self, line_id: u32) -> LineResult<Line> {
        if line_id == 0 {
            return Err(LineError::invalid_argument("line numbers start at 1"));
        }
        match self.lines.entry(line_id) {
            Entry::Occupied(_) => {
                return Err(LineError::invalid_state(format!("line {line_id} is already open")));
            }
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }

        let board = match self.session.acquire().await {
            Ok(board) => board,
            Err(e) => {
                self.lines.remove(&line_id);
                return Err(e);
            }
        };
        let address = LineAddress::for_line(line_id, self.props.sip.channel_offset);
        let handles = match self.driver.open_line(&address).await {
            Ok(handles) => handles,
            Err(fault) => {
                self.session.release().await;
                self.lines.remove(&line_id);
                return Err(LineError::driver("open_line", fault));
            }
        };
        info!(
            line = line_id,
            voice = %address.voice_device_name(),
            call_control = %address.call_control_device_name(),
            "line opened"
        );

        let mut line = Line::new(
            address,
            self.driver.clone(),
            self.session.clone(),
            board,
            handles,
            self.props.clone(),
            self.lines.clone(),
        );
        self.lines.insert(line_id, Some(line.management()));

        let setup = async {
            line.initialize().await?;
            if self.props.sip.registration().is_some() {
                line.register().await?;
            }
            Ok::<(), LineError>(())
        };
        if let Err(e) = setup.await {
            warn!(line = line_id, "line setup failed: {}", e);
            line.dispose().await;
            return Err(e);
        }
        Ok(line)
    }

    pub fn management(&self, line_id: u32) -> Option<LineManagement> {
        self.lines.get(&line_id).and_then(|entry| entry.value().clone())
    }

    /// Ask an open line to unwind; false when no such line is open
    pub async fn trigger_dispose(&self, line_id: u32) -> bool {
        match self.management(line_id) {
            Some(management) => {
                management.trigger_dispose().await;
                true
            }
            None => false,
        }
    }

    /// Ids of the lines currently open, ascending
    pub fn open_lines(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .lines
            .iter()
            .filter(|entry| entry.value().is_some())
            .map(|entry| *entry.key())
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Debug for LineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineManager")
            .field("lines", &self.open_lines())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverFault;
    use crate::driver::sim::SimulatedDriver;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_session_reference_counting() {
        let driver = Arc::new(SimulatedDriver::new());
        let session = BoardSession::new(driver.clone());

        let first = session.acquire().await.unwrap();
        let second = session.acquire().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(session.references().await, 2);

        session.release().await;
        assert!(driver.subsystem_running());
        session.release().await;
        assert!(!driver.subsystem_running());

        // An extra release is logged and ignored
        session.release().await;
        assert_eq!(driver.subsystem_stops(), 1);
    }

    #[tokio::test]
    async fn test_failed_board_open_stops_subsystem() {
        let driver = Arc::new(SimulatedDriver::new());
        driver.fail_next("open_board", DriverFault::new(-2, "board missing"));
        let session = BoardSession::new(driver.clone());

        assert!(session.acquire().await.is_err());
        assert_eq!(session.references().await, 0);
        assert!(!driver.subsystem_running());
    }

    #[tokio::test]
    async fn test_reserved_line_id_is_not_reopened() {
        let driver = Arc::new(SimulatedDriver::new());
        let manager = LineManager::new(driver.clone(), VoiceProperties::default()).unwrap();
        manager.lines.insert(3, None);

        assert!(matches!(
            manager.open_line(3).await,
            Err(LineError::InvalidState { .. })
        ));
        assert!(manager.management(3).is_none());
        assert!(manager.open_lines().is_empty());
        assert_eq!(driver.subsystem_starts(), 0);
    }

    #[tokio::test]
    async fn test_failed_open_frees_line_id() {
        let driver = Arc::new(SimulatedDriver::new());
        let manager = LineManager::new(driver.clone(), VoiceProperties::default()).unwrap();
        driver.fail_next("open_line", DriverFault::new(-3, "no such channel"));

        assert!(manager.open_line(1).await.is_err());
        assert!(!manager.lines.contains_key(&1));

        let mut line = manager.open_line(1).await.unwrap();
        assert!(manager.management(1).is_some());
        line.dispose().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_open_line_is_logged() {
        let driver = Arc::new(SimulatedDriver::new());
        let manager = LineManager::new(driver, VoiceProperties::default()).unwrap();

        let mut line = manager.open_line(2).await.unwrap();
        assert!(logs_contain("line opened"));
        assert!(logs_contain("starting driver subsystem"));

        line.dispose().await;
        assert!(logs_contain("stopping driver subsystem"));
    }
}
