mod common;

use common::MockBoard;
use pulsebus::config::TransportConfig;
use pulsebus::transport::*;
use std::time::{Duration, Instant};

fn quick_config() -> TransportConfig {
    TransportConfig {
        arrival_timeout_ms: 20,
        settle_window_ms: 5,
        poll_tick_ms: 1,
    }
}

#[test]
fn test_checksum_is_xor_of_payload() {
    assert_eq!(checksum(""), 0);
    assert_eq!(checksum("A"), b'A');
    assert_eq!(checksum("AA"), 0);
    assert_eq!(checksum("STOP;"), b'S' ^ b'T' ^ b'O' ^ b'P' ^ b';');
}

#[test]
fn test_frame_layout() {
    let payload = "(0,100,1);";
    let framed = frame(payload).unwrap();
    assert_eq!(framed.as_str(), format!("<{}{}>", payload, checksum(payload)));
}

#[test]
fn test_frame_checksum_recoverable() {
    for payload in ["STOP;", "(0,500,1);(0,600,0);", "(12,0,0);", "(3,10,1);(3,20,0);(3,40,1);(3,50,0);"] {
        let framed = frame(payload).unwrap();
        let (body, crc) = parse_frame(&framed).unwrap();
        assert_eq!(body, payload);
        assert_eq!(crc, checksum(body));
    }
}

#[test]
fn test_reserved_characters_rejected() {
    assert!(matches!(frame("(0,1,1);<"), Err(TransportError::ReservedCharacter('<'))));
    assert!(matches!(frame(">"), Err(TransportError::ReservedCharacter('>'))));
}

#[test]
fn test_oversized_payload_rejected() {
    let payload = "(0,1,1);".repeat(MAX_FRAME_SIZE / 8 + 1);
    assert!(matches!(frame(&payload), Err(TransportError::FrameTooLarge)));
}

#[test]
fn test_decode_lines_drops_blank_and_invalid_lines() {
    let raw = b"  first \r\n\r\n\xff\xfe garbage\nsecond\n\n";
    assert_eq!(decode_lines(raw), "first\nsecond");
    assert_eq!(decode_lines(b""), "");
}

#[tokio::test]
async fn test_silent_board_yields_empty_response() {
    let board = MockBoard::new().silent();
    let mut transport = FramedTransport::new(board.channel(), quick_config());

    let started = Instant::now();
    let response = transport.exchange("STOP;").await.unwrap();

    assert_eq!(response, "");
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert_eq!(board.frames(), vec![frame("STOP;").unwrap().to_string()]);
}

#[tokio::test]
async fn test_multiline_response_joined() {
    let board = MockBoard::new();
    board.script_reply(b"Received: (0,100,1);\r\n\r\nScheduled 1 event\r\n");
    let mut transport = FramedTransport::new(board.channel(), quick_config());

    let response = transport.exchange("(0,100,1);").await.unwrap();
    assert_eq!(response, "Received: (0,100,1);\nScheduled 1 event");
}

#[tokio::test]
async fn test_bytes_waiting_before_write_are_collected() {
    let board = MockBoard::new().silent();
    board.preload(b"ready\n");
    let mut transport = FramedTransport::new(board.channel(), quick_config());

    assert_eq!(transport.read_response().await.unwrap(), "ready");
    // Drained, so the next read times out empty
    assert_eq!(transport.read_response().await.unwrap(), "");
}

#[tokio::test]
async fn test_rejected_payload_writes_nothing() {
    let board = MockBoard::new();
    let mut transport = FramedTransport::new(board.channel(), quick_config());

    assert!(transport.exchange("<bad>").await.is_err());
    assert!(board.frames().is_empty());
}

#[test]
fn test_dropping_transport_closes_channel() {
    let board = MockBoard::new();
    let transport = FramedTransport::new(board.channel(), quick_config());
    drop(transport);

    assert_eq!(board.opens(), 1);
    assert_eq!(board.closes(), 1);
}

#[tokio::test]
async fn test_settle_window_collects_late_chunk() {
    let board = MockBoard::new();
    board.script_chunks(&[(0, &b"Received: (0,100,1);\r\n"[..]), (10, &b"Scheduled 1 event\r\n"[..])]);
    let config = TransportConfig {
        arrival_timeout_ms: 50,
        settle_window_ms: 40,
        poll_tick_ms: 1,
    };
    let mut transport = FramedTransport::new(board.channel(), config);

    let response = transport.exchange("(0,100,1);").await.unwrap();
    assert_eq!(response, "Received: (0,100,1);\nScheduled 1 event");
}

#[tokio::test]
async fn test_chunk_after_settle_window_left_for_next_read() {
    let board = MockBoard::new();
    board.script_chunks(&[(0, &b"first\r\n"[..]), (60, &b"second\r\n"[..])]);
    let config = TransportConfig {
        arrival_timeout_ms: 200,
        settle_window_ms: 5,
        poll_tick_ms: 1,
    };
    let mut transport = FramedTransport::new(board.channel(), config);

    assert_eq!(transport.exchange("STOP;").await.unwrap(), "first");
    assert_eq!(transport.read_response().await.unwrap(), "second");
}
