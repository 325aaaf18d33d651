use bytes::Bytes;
use hooktail::ebpf::events::comm_from_str;
use hooktail::ebpf::{
    consume, encode_event, ChannelSource, ConsumerError, EventConsumer, Next, OutputFormat,
};
use hooktail::error::HooktailError;
use hooktail_common::FcntlEvent;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

fn record(name: &str, pid: u32, tgid: u32) -> std::io::Result<Bytes> {
    let event = FcntlEvent {
        comm: comm_from_str(name),
        pid,
        tgid,
    };
    Ok(Bytes::copy_from_slice(&encode_event(&event)))
}

#[tokio::test]
async fn test_two_rows_and_one_decode_error_in_order() {
    let (tx, rx) = mpsc::channel(8);
    let (mut consumer, close) = EventConsumer::new(ChannelSource::new(rx));

    tx.send(record("bash", 100, 100)).await.unwrap();
    tx.send(record("cat", 101, 100)).await.unwrap();
    tx.send(Ok(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])))
        .await
        .unwrap();

    let mut out = Vec::new();
    let stop = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        close.close();
    };
    let (summary, _) = tokio::join!(consume(&mut consumer, OutputFormat::Table, &mut out), stop);
    let summary = summary.unwrap();

    assert_eq!(summary.printed, 2);
    assert_eq!(summary.decode_errors, 1);
    assert_eq!(summary.read_errors, 0);

    let output = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].split_whitespace().collect::<Vec<_>>(), ["Comm", "PID", "TGID"]);
    assert_eq!(lines[1].split_whitespace().collect::<Vec<_>>(), ["bash", "100", "100"]);
    assert_eq!(lines[2].split_whitespace().collect::<Vec<_>>(), ["cat", "101", "100"]);
}

#[tokio::test]
async fn test_malformed_record_does_not_stop_consumer() {
    let (tx, rx) = mpsc::channel(8);
    let (mut consumer, close) = EventConsumer::new(ChannelSource::new(rx));

    tx.send(Ok(Bytes::from_static(b"short"))).await.unwrap();
    tx.send(record("bash", 100, 100)).await.unwrap();

    assert!(matches!(
        consumer.next_event().await,
        Err(ConsumerError::Decode(_))
    ));
    assert!(matches!(consumer.next_event().await, Ok(Next::Event(e)) if e.pid == 100));

    close.close();
    assert_eq!(consumer.next_event().await.unwrap(), Next::EndOfStream);
    assert!(matches!(
        consumer.next_event().await,
        Err(ConsumerError::Closed)
    ));
}

#[test]
fn test_error_types() {
    let err = HooktailError::PinConflict {
        path: PathBuf::from("/sys/fs/bpf/hooktail_state"),
    };
    assert!(err.to_string().contains("/sys/fs/bpf/hooktail_state"));

    let err = HooktailError::KernelVersionTooOld {
        version: "5.4.0".to_string(),
        min_version: "5.8".to_string(),
    };
    assert!(err.to_string().contains("5.4.0"));
    assert!(err.to_string().contains("5.8"));
}

#[test]
fn test_version_const() {
    assert!(!hooktail::VERSION.is_empty());
}
