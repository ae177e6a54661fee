mod common;

use common::{test_config, MockBoard, MockToolchain, MOCK_PORT, MOCK_SERIAL};
use pulsebus::device::*;
use pulsebus::telemetry::{OperationKind, TelemetryPublisher, TelemetryRecord};
use pulsebus::transport::frame;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

fn open_device(board: &MockBoard, toolchain: Arc<MockToolchain>) -> (DeviceController, broadcast::Receiver<TelemetryRecord>) {
    let (publisher, receiver) = TelemetryPublisher::channel();
    let device = DeviceController::open(&test_config("trigger"), board.connector(), toolchain, publisher).unwrap();
    (device, receiver)
}

async fn next_record(receiver: &mut broadcast::Receiver<TelemetryRecord>) -> TelemetryRecord {
    tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("telemetry record within a second")
        .unwrap()
}

#[tokio::test]
async fn test_stop_sends_stop_frame_and_reports() {
    let board = MockBoard::new();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    let response = device.stop().await.unwrap();
    assert_eq!(response, "ACK STOP;");
    assert_eq!(board.frames(), vec![frame(STOP_COMMAND).unwrap().to_string()]);

    let record = next_record(&mut telemetry).await;
    assert_eq!(record.actor_name, "trigger");
    assert_eq!(record.serial_number, MOCK_SERIAL);
    assert_eq!(record.message_type, "trigger");
    assert_eq!(record.metadata.message_type, OperationKind::Stop);
    assert_eq!(record.metadata.trigger_command, "STOP;");
    assert_eq!(record.metadata.response, "ACK STOP;");
}

#[tokio::test]
async fn test_rising_edge_metadata() {
    let board = MockBoard::new();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    device.send_rising_edge("(2,150,1);").await.unwrap();
    let record = next_record(&mut telemetry).await;

    assert_eq!(record.metadata.message_type, OperationKind::SendRisingEdge);
    assert_eq!(record.metadata.pin, Some(2));
    assert_eq!(record.metadata.delay_ms, Some(150));
    assert_eq!(
        record.metadata.description,
        "Sending a rising edge to pin 2 with delay of 150 ms"
    );
}

#[tokio::test]
async fn test_unparsable_edge_still_sent_without_fields() {
    let board = MockBoard::new();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    device.send_falling_edge("not-an-edge;").await.unwrap();
    let record = next_record(&mut telemetry).await;

    assert_eq!(board.payloads(), vec!["not-an-edge;".to_string()]);
    assert_eq!(record.metadata.message_type, OperationKind::SendFallingEdge);
    assert_eq!(record.metadata.pin, None);
    assert_eq!(record.metadata.delay_ms, None);

    let json = serde_json::to_value(&record).unwrap();
    assert!(json["metadata"].get("pin").is_none());
}

#[tokio::test]
async fn test_pulse_metadata() {
    let board = MockBoard::new();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    device.send_pulse("(1,500,1);(1,600,0);").await.unwrap();
    let record = next_record(&mut telemetry).await;

    assert_eq!(record.metadata.message_type, OperationKind::SendPulse);
    assert_eq!(record.metadata.pin, Some(1));
    assert_eq!(record.metadata.delay_ms, Some(500));
    assert_eq!(record.metadata.width_ms, Some(100));
}

#[tokio::test]
async fn test_pulse_sequence_metadata() {
    let board = MockBoard::new();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    device
        .send_pulse_sequence("(0,100,1);(0,150,0);(0,300,1);(0,350,0);")
        .await
        .unwrap();
    let record = next_record(&mut telemetry).await;

    assert_eq!(record.metadata.message_type, OperationKind::SendPulseSequence);
    assert_eq!(record.metadata.pin, Some(0));
    assert_eq!(record.metadata.num_pulses, Some(2));
    assert_eq!(record.metadata.delays, Some(vec![100, 300]));
    assert_eq!(record.metadata.widths, Some(vec![50, 50]));
    assert_eq!(
        record.metadata.description,
        "Sending a pulse sequence of 2 pulses to pin 0 with delays of [100, 300] ms and pulse widths of [50, 50] ms"
    );
}

#[tokio::test]
async fn test_silent_board_returns_empty_response() {
    let board = MockBoard::new().silent();
    let (mut device, mut telemetry) = open_device(&board, Arc::default());

    assert_eq!(device.send_pulse("(0,0,1);(0,10,0);").await.unwrap(), "");
    assert_eq!(next_record(&mut telemetry).await.metadata.response, "");
}

#[tokio::test]
async fn test_create_operations_do_not_touch_board() {
    let board = MockBoard::new();
    let (device, _telemetry) = open_device(&board, Arc::default());

    let edge = device.create_rising_edge(4, Some(30), None).unwrap();
    assert_eq!(edge.command(), "(4,30,1);");

    let pulse = device.create_pulse(4, 20, Some(30), None).unwrap();
    assert_eq!(pulse.command(), "(4,30,1);(4,50,0);");

    assert!(device.create_falling_edge(4, None, None).is_err());
    assert!(board.frames().is_empty());
}

#[test]
fn test_open_rejects_missing_port() {
    let board = MockBoard::new();
    let mut config = test_config("trigger");
    config.device.port.clear();
    let (publisher, _) = TelemetryPublisher::channel();

    let result = DeviceController::open(&config, board.connector(), Arc::new(MockToolchain::default()), publisher);
    assert!(matches!(result, Err(DeviceError::InvalidDeviceInfo(_))));
    assert_eq!(board.opens(), 0);
}

#[test]
fn test_open_failure_reports_port() {
    let board = MockBoard::new().failing_open();
    let (publisher, _) = TelemetryPublisher::channel();

    let result = DeviceController::open(&test_config("trigger"), board.connector(), Arc::new(MockToolchain::default()), publisher);
    match result {
        Err(DeviceError::Open { port, .. }) => assert_eq!(port, MOCK_PORT),
        other => panic!("expected open failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let board = MockBoard::new();
    let (mut device, _telemetry) = open_device(&board, Arc::default());

    assert!(device.close());
    assert!(!device.close());
    assert_eq!(board.closes(), 1);
    assert!(matches!(device.stop().await, Err(DeviceError::ChannelClosed)));
}

#[tokio::test]
async fn test_reprogram_success_reconnects_with_dtr_cycle() {
    let board = MockBoard::new();
    let toolchain = Arc::new(MockToolchain::default());
    let (mut device, _telemetry) = open_device(&board, Arc::clone(&toolchain));

    let message = device.reprogram(Path::new("/sketches/trigger/trigger.ino")).await.unwrap();

    assert_eq!(message, REPROGRAM_SUCCESS);
    assert_eq!(
        toolchain.calls(),
        vec![
            "compile arduino:avr:uno /sketches/trigger".to_string(),
            format!("upload arduino:avr:uno {} /sketches/trigger", MOCK_PORT),
        ]
    );
    assert_eq!(board.dtr_levels(), vec![false, true]);
    assert_eq!(board.opens(), 2);
    assert_eq!(board.closes(), 1);
    assert!(device.is_open());
}

#[tokio::test]
async fn test_reprogram_compile_failure_keeps_channel() {
    let board = MockBoard::new();
    let toolchain = Arc::new(MockToolchain {
        fail_compile: true,
        ..MockToolchain::default()
    });
    let (mut device, _telemetry) = open_device(&board, Arc::clone(&toolchain));

    let result = device.reprogram(Path::new("/sketches/trigger/trigger.ino")).await;

    assert!(matches!(
        result,
        Err(DeviceError::Reprogram {
            stage: ReprogramStage::Compile,
            ..
        })
    ));
    assert_eq!(toolchain.calls().len(), 1);
    assert_eq!(board.opens(), 1);
    assert!(device.is_open());
}

#[tokio::test]
async fn test_reprogram_upload_failure_still_reconnects() {
    let board = MockBoard::new();
    let toolchain = Arc::new(MockToolchain {
        fail_upload: true,
        ..MockToolchain::default()
    });
    let (mut device, _telemetry) = open_device(&board, Arc::clone(&toolchain));

    let result = device.reprogram(Path::new("/sketches/trigger/trigger.ino")).await;

    assert!(matches!(
        result,
        Err(DeviceError::Reprogram {
            stage: ReprogramStage::Upload,
            ..
        })
    ));
    assert!(device.is_open());
    assert_eq!(board.opens(), 2);
    assert_eq!(device.stop().await.unwrap(), "ACK STOP;");
}
