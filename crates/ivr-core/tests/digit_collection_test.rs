//! Digit collection and media integration tests
//!
//! Termination handling for `get_digits`, type-ahead flushing, recording and phrase
//! playback against the simulated driver.

use std::path::Path;
use std::sync::Arc;

use ivr_core::driver::TerminationReason;
use ivr_core::driver::sim::{DriverAction, KeyScript, MediaScript, SimulatedDriver};
use ivr_core::{Line, LineError, LineManager, LineStatus, VoiceProperties};
use tokio_util::sync::CancellationToken;

async fn setup() -> (Arc<SimulatedDriver>, LineManager, Line) {
    let driver = Arc::new(SimulatedDriver::new());
    let props = VoiceProperties::default().with_system_recordings_dir("sys");
    let manager = LineManager::new(driver.clone(), props).expect("valid properties");
    let line = manager.open_line(1).await.expect("line opens");
    (driver, manager, line)
}

fn sys(name: &str) -> String {
    Path::new("sys").join(format!("{name}.wav")).to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_terminator_is_stripped() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("12#"));

    assert_eq!(line.get_digits(10, "#").await.unwrap(), "12");
    assert_eq!(line.last_terminator(), "#");
    line.dispose().await;
}

#[tokio::test]
async fn test_digit_count_ends_collection() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("123456"));

    assert_eq!(line.get_digits(4, "#").await.unwrap(), "1234");
    assert_eq!(line.last_terminator(), "");
    assert_eq!(
        driver.count(|a| *a == DriverAction::GetDigits { line: 1, max_digits: 4 }),
        1
    );
    line.dispose().await;
}

#[tokio::test]
async fn test_any_of_several_terminators() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("55*"));

    assert_eq!(line.get_digits(10, "#*").await.unwrap(), "55");
    assert_eq!(line.last_terminator(), "*");
    line.dispose().await;
}

#[tokio::test]
async fn test_timeout_fails_without_marker() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("12"));

    assert!(matches!(
        line.get_digits(4, "#").await,
        Err(LineError::DigitsTimeout)
    ));
    line.dispose().await;
}

#[tokio::test]
async fn test_timeout_marker_ends_collection() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("12"));

    assert_eq!(line.get_digits(4, "#t").await.unwrap(), "12");
    assert_eq!(line.last_terminator(), "t");
    line.dispose().await;
}

#[tokio::test]
async fn test_user_stop_means_disposing() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::UserStop);

    assert!(matches!(line.get_digits(4, "#").await, Err(LineError::Disposing)));

    // Nothing left pending for the next operation
    driver.push_keys(1, KeyScript::keys("3#"));
    assert_eq!(line.get_digits(4, "#").await.unwrap(), "3");
    line.dispose().await;
}

#[tokio::test]
async fn test_io_error_is_a_driver_error() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::IoError);

    let err = line.get_digits(4, "#").await.unwrap_err();
    assert!(matches!(err, LineError::Driver { ref operation, .. } if operation == "get_digits"));
    assert!(!err.is_recoverable());
    line.dispose().await;
}

#[tokio::test]
async fn test_type_ahead_counts_toward_next_collection() {
    let (driver, _manager, mut line) = setup().await;
    driver.type_ahead(1, "5");
    driver.push_keys(1, KeyScript::keys("6#"));

    assert_eq!(line.get_digits(4, "#").await.unwrap(), "56");
    line.dispose().await;
}

#[tokio::test]
async fn test_flush_returns_type_ahead() {
    let (driver, _manager, mut line) = setup().await;
    driver.type_ahead(1, "98");
    driver.push_keys(1, KeyScript::keys("1#"));

    assert_eq!(line.flush_digit_buffer().await.unwrap(), "98");
    // The scripted keys were not touched by the flush
    assert_eq!(line.get_digits(4, "#").await.unwrap(), "1");
    assert_eq!(line.flush_digit_buffer().await.unwrap(), "");
    line.dispose().await;
}

#[tokio::test]
async fn test_cancelled_collection() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_keys(1, KeyScript::keys("1#"));
    let token = CancellationToken::new();
    token.cancel();

    assert!(matches!(
        line.get_digits_with_cancel(4, "#", &token).await,
        Err(LineError::Disposing)
    ));
    // The token only applies to that call
    assert_eq!(line.get_digits(4, "#").await.unwrap(), "1");
    line.dispose().await;
}

#[tokio::test]
async fn test_record_flushes_around_recording() {
    let (driver, _manager, mut line) = setup().await;
    driver.type_ahead(1, "4");

    line.record_file_with_timeout("message.wav", 30_000).await.unwrap();

    let actions = driver.actions();
    let record = actions
        .iter()
        .position(|a| matches!(a, DriverAction::Record { line: 1, file } if file == "message.wav"))
        .expect("recorded");
    let flushes: Vec<usize> = actions
        .iter()
        .enumerate()
        .filter(|(_, a)| matches!(a, DriverAction::GetDigits { line: 1, max_digits: 15 }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(flushes.len(), 2);
    assert!(flushes[0] < record && record < flushes[1]);
    line.dispose().await;
}

#[tokio::test]
async fn test_record_stopped_by_key() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_media(1, MediaScript::Complete(TerminationReason::DIGIT));

    line.record_file("message.wav").await.unwrap();
    line.dispose().await;
}

#[tokio::test]
async fn test_record_interrupted_by_hangup() {
    let (driver, manager, mut line) = setup().await;
    driver.offer_call(1).unwrap();
    line.wait_for_call(1).await.unwrap();
    driver.push_media(1, MediaScript::CallerHangsUp);

    assert!(matches!(
        line.record_file("message.wav").await,
        Err(LineError::Hangup)
    ));
    assert_eq!(line.status(), LineStatus::OnHook);
    assert_eq!(manager.open_lines(), vec![1]);
    line.dispose().await;
}

#[tokio::test]
async fn test_play_stopped_from_line_side() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_media(1, MediaScript::Complete(TerminationReason::USER_STOP));

    assert!(matches!(line.play_file("a.wav").await, Err(LineError::Disposing)));
    line.play_file("b.wav").await.unwrap();
    assert_eq!(driver.played_files(1), vec!["a.wav", "b.wav"]);
    line.dispose().await;
}

#[tokio::test]
async fn test_play_io_error() {
    let (driver, _manager, mut line) = setup().await;
    driver.push_media(1, MediaScript::Complete(TerminationReason::IO_ERROR));

    assert!(matches!(
        line.play_file("a.wav").await,
        Err(LineError::Driver { ref operation, .. }) if operation == "play"
    ));
    line.dispose().await;
}

#[tokio::test]
async fn test_phrase_plays_system_recordings() {
    let (driver, _manager, mut line) = setup().await;

    line.play_phrase("1234|N").await.unwrap();

    assert_eq!(
        driver.played_files(1),
        vec![sys("1"), sys("Thousand"), sys("200"), sys("30"), sys("4")]
    );
    line.dispose().await;
}

#[tokio::test]
async fn test_play_file_or_phrase() {
    let (driver, _manager, mut line) = setup().await;

    line.play_file_or_phrase("hello.wav").await.unwrap();
    line.play_file_or_phrase("greeting.wav|F,7|N").await.unwrap();

    assert_eq!(
        driver.played_files(1),
        vec!["hello.wav".to_string(), "greeting.wav".to_string(), sys("7")]
    );
    line.dispose().await;
}

#[tokio::test]
async fn test_unknown_phrase_code() {
    let (driver, _manager, mut line) = setup().await;

    assert!(matches!(
        line.play_phrase("12|D").await,
        Err(LineError::InvalidArgument { .. })
    ));
    assert!(driver.played_files(1).is_empty());
    line.dispose().await;
}
