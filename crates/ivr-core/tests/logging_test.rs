//! Logging setup integration test
//!
//! Kept in its own test binary since it installs the global subscriber.

use std::sync::Arc;

use ivr_core::driver::sim::{KeyScript, SimulatedDriver};
use ivr_core::logging::{LoggingConfig, parse_log_level, setup_logging};
use ivr_core::{LineError, LineManager, VoiceProperties};
use tracing::Level;

#[tokio::test]
async fn test_setup_logging_installs_once() {
    let config = LoggingConfig::new(parse_log_level("debug").unwrap())
        .with_driver_level(Level::TRACE)
        .with_spans();

    setup_logging(&config).unwrap();
    assert!(matches!(
        setup_logging(&config),
        Err(LineError::Configuration { .. })
    ));

    // Line operations run inside their span with the subscriber installed
    let driver = Arc::new(SimulatedDriver::new());
    let manager = LineManager::new(driver.clone(), VoiceProperties::default()).unwrap();
    let mut line = manager.open_line(1).await.unwrap();
    driver.push_keys(1, KeyScript::keys("9#"));
    assert_eq!(line.get_digits(2, "#").await.unwrap(), "9");
    line.dispose().await;
}
