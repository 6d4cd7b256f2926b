use halfduplex_core::protocol::{
    EngineConfig, HalfDuplex, Line, Logger, ProtocolError, TransportEvent,
};
use halfduplex_core::virtual_port::{VirtualDevice, VirtualPort};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MS: Duration = Duration::from_millis(1);

/// Logger capturing every message
#[derive(Default)]
struct RecordingLogger {
    infos: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl Logger for RecordingLogger {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

fn engine() -> (HalfDuplex, VirtualDevice) {
    let (port, device) = VirtualPort::pair();
    (HalfDuplex::with_defaults(port).unwrap(), device)
}

/// Wait for one command, then send each `(delay, bytes)` in turn
fn answer_with(
    mut device: VirtualDevice,
    replies: Vec<(u32, &'static str)>,
) -> JoinHandle<VirtualDevice> {
    tokio::spawn(async move {
        device.next_command().await.unwrap();
        for (delay, reply) in replies {
            device.send_after(MS * delay, reply.as_bytes()).await.unwrap();
        }
        device
    })
}

fn record_lines(engine: &HalfDuplex, tag: &'static str) -> Arc<Mutex<Vec<String>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.on_message(move |line: &Line| {
        sink.lock()
            .unwrap()
            .push(format!("{}:{}", tag, line.to_string_lossy()));
    });
    seen
}

#[tokio::test]
async fn test_engine_creation() {
    let (port, _device) = VirtualPort::pair();
    let engine = HalfDuplex::new(port, EngineConfig::default());
    assert!(engine.is_ok());
}

#[tokio::test]
async fn test_send_transmits_without_waiting() {
    let (engine, mut device) = engine();
    engine.send(b"foo").await.unwrap();
    assert_eq!(&device.next_command().await.unwrap()[..], b"foo");
}

#[tokio::test(start_paused = true)]
async fn test_receive_single_line() {
    let (engine, device) = engine();
    let device = answer_with(device, vec![(10, "123\r\n")]);

    let line = engine.send_and_receive(b"foo", 50 * MS).await.unwrap();

    assert_eq!(line, "123");
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_receive_many_lines() {
    let (engine, device) = engine();
    let device = answer_with(device, vec![(10, "123\r\n"), (5, "45\r\n"), (5, "6\r\n")]);

    let start = Instant::now();
    let lines = engine.send_and_receive_many(b"foo", 50 * MS, 3).await.unwrap();

    assert_eq!(
        lines,
        vec![Line::from("123"), Line::from("45"), Line::from("6")]
    );
    // Settles on the third line, not at the deadline
    assert!(start.elapsed() < 50 * MS);
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_partial_answer_is_success() {
    let (engine, device) = engine();
    let device = answer_with(device, vec![(10, "123\r\n")]);

    let start = Instant::now();
    let lines = engine.send_and_receive_many(b"foo", 50 * MS, 3).await.unwrap();

    assert_eq!(lines, vec![Line::from("123")]);
    assert!(start.elapsed() >= 50 * MS);
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_times_out_without_answer() {
    let (engine, _device) = engine();

    let start = Instant::now();
    let err = engine.send_and_receive(b"foo", 20 * MS).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() >= 20 * MS);
    assert!(start.elapsed() < 25 * MS);
}

#[tokio::test(start_paused = true)]
async fn test_many_times_out_without_answer() {
    let (engine, _device) = engine();
    let err = engine
        .send_and_receive_many(b"foo", 20 * MS, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_answer_split_across_writes() {
    let (engine, device) = engine();
    let device = answer_with(device, vec![(2, "12"), (2, "3\r"), (2, "\n")]);

    let line = engine.send_and_receive(b"foo", 50 * MS).await.unwrap();

    assert_eq!(line, "123");
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_does_not_poison_next_request() {
    let (engine, mut device) = engine();

    assert!(engine
        .send_and_receive(b"first", 20 * MS)
        .await
        .unwrap_err()
        .is_timeout());
    assert_eq!(&device.next_command().await.unwrap()[..], b"first");

    let device = answer_with(device, vec![(5, "ok\r\n")]);
    let line = engine.send_and_receive(b"second", 20 * MS).await.unwrap();
    assert_eq!(line, "ok");
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_extra_lines_fall_through_to_observers() {
    let (engine, device) = engine();
    let seen = record_lines(&engine, "obs");
    let device = answer_with(device, vec![(5, "answer\r\nextra\r\n")]);

    let line = engine.send_and_receive(b"q", 50 * MS).await.unwrap();
    tokio::time::sleep(5 * MS).await;

    assert_eq!(line, "answer");
    assert_eq!(*seen.lock().unwrap(), vec!["obs:extra"]);
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_spontaneous_dispatch_resumes_after_settlement() {
    let (engine, mut device) = engine();
    let first = record_lines(&engine, "a");
    let second = record_lines(&engine, "b");

    device.send(b"hello\r\n").await.unwrap();
    tokio::time::sleep(MS).await;

    let device = tokio::spawn(async move {
        device.next_command().await.unwrap();
        device.send_after(5 * MS, b"answer\r\n").await.unwrap();
        device.send_after(10 * MS, b"later\r\n").await.unwrap();
        device
    });
    let line = engine.send_and_receive(b"q", 50 * MS).await.unwrap();
    tokio::time::sleep(20 * MS).await;

    assert_eq!(line, "answer");
    assert_eq!(*first.lock().unwrap(), vec!["a:hello", "a:later"]);
    assert_eq!(*second.lock().unwrap(), vec!["b:hello", "b:later"]);
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_spontaneous_dispatch_resumes_after_timeout() {
    let (engine, mut device) = engine();
    let seen = record_lines(&engine, "obs");

    assert!(engine.send_and_receive(b"q", 20 * MS).await.is_err());
    device.send(b"unsolicited\r\n").await.unwrap();
    tokio::time::sleep(MS).await;

    assert_eq!(*seen.lock().unwrap(), vec!["obs:unsolicited"]);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_observer_does_not_stop_dispatch() {
    let logger = Arc::new(RecordingLogger::default());
    let (port, mut device) = VirtualPort::pair();
    let engine =
        HalfDuplex::new(port, EngineConfig::default().with_logger(logger.clone())).unwrap();

    engine.on_message(|line: &Line| {
        if line == &"boom" {
            panic!("observer failure");
        }
    });
    let seen = record_lines(&engine, "after");

    device.send(b"boom\r\nfine\r\n").await.unwrap();
    tokio::time::sleep(MS).await;

    assert_eq!(*seen.lock().unwrap(), vec!["after:boom", "after:fine"]);
    let errors = logger.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("panicked on line boom"));

    // The reader survived and still serves requests
    drop(errors);
    let device = answer_with(device, vec![(1, "still alive\r\n")]);
    assert_eq!(engine.send_and_receive(b"q", 20 * MS).await.unwrap(), "still alive");
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_custom_delimiter() {
    let (port, device) = VirtualPort::pair();
    let engine =
        HalfDuplex::new(port, EngineConfig::default().with_delimiter(b"\n".to_vec())).unwrap();
    let device = answer_with(device, vec![(3, "a\nb\n")]);

    let lines = engine.send_and_receive_many(b"q", 20 * MS, 2).await.unwrap();

    assert_eq!(lines, vec![Line::from("a"), Line::from("b")]);
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_logger_sees_traffic_and_errors() {
    let logger = Arc::new(RecordingLogger::default());
    let (port, device) = VirtualPort::pair();
    let engine =
        HalfDuplex::new(port, EngineConfig::default().with_logger(logger.clone())).unwrap();

    let device = answer_with(device, vec![(5, "123\r\n")]);
    engine.send_and_receive(b"EN\rV100\r", 50 * MS).await.unwrap();
    let device = device.await.unwrap();

    device.emit(TransportEvent::Error(std::io::Error::other(
        "framing error",
    )));

    assert_eq!(
        *logger.infos.lock().unwrap(),
        vec!["Serial → EN\\rV100\\r", "Serial ← 123"]
    );
    assert_eq!(
        *logger.errors.lock().unwrap(),
        vec!["Unhandled serial error: framing error"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_error_does_not_stop_receiving() {
    let logger = Arc::new(RecordingLogger::default());
    let (port, device) = VirtualPort::pair();
    let engine =
        HalfDuplex::new(port, EngineConfig::default().with_logger(logger.clone())).unwrap();
    let seen = record_lines(&engine, "obs");

    device.fail_next_read();
    let device = answer_with(device, vec![(5, "123\r\n")]);

    let line = engine.send_and_receive(b"foo", 50 * MS).await.unwrap();

    assert_eq!(line, "123");
    assert_eq!(
        *logger.errors.lock().unwrap(),
        vec!["Unhandled serial error: simulated read failure"]
    );

    // Spontaneous lines keep flowing too
    let mut device = device.await.unwrap();
    device.send(b"later\r\n").await.unwrap();
    tokio::time::sleep(MS).await;
    assert_eq!(*seen.lock().unwrap(), vec!["obs:later"]);
}

#[tokio::test]
async fn test_transport_error_without_logger_is_harmless() {
    let (engine, mut device) = engine();
    device.emit(TransportEvent::Error(std::io::Error::other("noise")));
    engine.send(b"x").await.unwrap();
    assert_eq!(&device.next_command().await.unwrap()[..], b"x");
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_is_propagated_and_recovered() {
    let (engine, device) = engine();
    let seen = record_lines(&engine, "obs");

    device.fail_writes(true);
    assert!(matches!(
        engine.send(b"x").await,
        Err(ProtocolError::Write(_))
    ));
    assert!(matches!(
        engine.send_and_receive(b"x", 20 * MS).await,
        Err(ProtocolError::Write(_))
    ));

    // The failed request must not keep the handler slot
    let mut device = device;
    device.send(b"spontaneous\r\n").await.unwrap();
    tokio::time::sleep(MS).await;
    assert_eq!(*seen.lock().unwrap(), vec!["obs:spontaneous"]);

    device.fail_writes(false);
    let device = answer_with(device, vec![(1, "ok\r\n")]);
    assert_eq!(engine.send_and_receive(b"y", 20 * MS).await.unwrap(), "ok");
    device.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_clears_observers_and_closes_transport() {
    let (engine, mut device) = engine();
    let seen = record_lines(&engine, "obs");
    assert_eq!(engine.observer_count(), 1);

    engine.close().await.unwrap();

    assert!(engine.is_closed());
    assert!(device.is_closed());
    assert_eq!(engine.observer_count(), 0);

    // The reader is gone; the write may or may not be accepted by the pipe
    let _ = device.send(b"late\r\n").await;
    tokio::time::sleep(MS).await;
    assert!(seen.lock().unwrap().is_empty());

    assert!(matches!(engine.send(b"x").await, Err(ProtocolError::Closed)));
    assert!(matches!(
        engine.send_and_receive(b"x", 20 * MS).await,
        Err(ProtocolError::Closed)
    ));

    // Closing again is a no-op
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_close_failure_is_forwarded() {
    let (engine, device) = engine();
    device.fail_close(true);

    let err = engine.close().await.unwrap_err();

    match err {
        ProtocolError::Close(source) => assert_eq!(source.to_string(), "simulated close failure"),
        other => panic!("Expected close error, got {:?}", other),
    }
    assert_eq!(engine.observer_count(), 0);
}

#[tokio::test]
async fn test_close_retries_transport_after_failure() {
    let (engine, device) = engine();
    device.fail_close(true);

    assert!(matches!(engine.close().await, Err(ProtocolError::Close(_))));
    assert!(engine.is_closed());
    assert!(!device.is_closed());
    assert!(matches!(engine.send(b"x").await, Err(ProtocolError::Closed)));

    device.fail_close(false);
    engine.close().await.unwrap();
    assert!(device.is_closed());

    // Only a successful close makes further calls no-ops
    device.fail_close(true);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_close_calls_report_real_outcome() {
    let (engine, device) = engine();
    let _seen = record_lines(&engine, "obs");
    device.fail_close(true);

    let (first, second) = tokio::join!(engine.close(), engine.close());
    assert!(matches!(first, Err(ProtocolError::Close(_))));
    assert!(matches!(second, Err(ProtocolError::Close(_))));
    assert!(!device.is_closed());

    device.fail_close(false);
    let (first, second) = tokio::join!(engine.close(), engine.close());
    first.unwrap();
    second.unwrap();
    assert!(device.is_closed());
    assert_eq!(engine.observer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_in_flight_request() {
    let (engine, device) = engine();
    let engine = Arc::new(engine);
    let device = answer_with(device, vec![(10, "done\r\n")]);

    let request = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_and_receive(b"q", 50 * MS).await })
    };
    tokio::time::sleep(MS).await;

    engine.close().await.unwrap();

    assert_eq!(request.await.unwrap().unwrap(), "done");
    let device = device.await.unwrap();
    assert!(device.is_closed());
}
