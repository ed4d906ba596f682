use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use kproxy_core::engine::relay::{StreamPhase, relay_stream};
use kproxy_core::upstream::StreamFault;

type UpstreamTx = mpsc::Sender<Result<Bytes, StreamFault>>;

fn channels() -> (UpstreamTx, mpsc::Receiver<Result<Bytes, StreamFault>>) {
    mpsc::channel(32)
}

fn sse(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

#[tokio::test]
async fn clean_stream_forwards_untouched_and_extracts_usage() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(32);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, false));

    let frames = [
        sse(r#"{"choices":[{"delta":{"content":"po"}}]}"#),
        sse(r#"{"choices":[{"delta":{"content":"ng"}}]}"#),
        sse(r#"{"choices":[],"usage":{"prompt_tokens":4,"completion_tokens":2}}"#),
        sse("[DONE]"),
    ];
    for frame in &frames {
        up_tx.send(Ok(frame.clone())).await.unwrap();
    }
    drop(up_tx);

    for expected in &frames {
        let got = timeout(Duration::from_secs(1), down_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, expected, "bytes must pass through unchanged");
    }
    assert!(down_rx.recv().await.is_none());

    let report = relay.await.unwrap();
    assert_eq!(report.phase, StreamPhase::Closed);
    assert_eq!(report.usage.prompt_tokens, Some(4));
    assert_eq!(report.usage.completion_tokens, Some(2));
    assert_eq!(report.output_text, "pong");
    assert!(report.bytes_forwarded);
}

#[tokio::test]
async fn mid_stream_read_error_closes_downstream_with_no_extra_bytes() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(32);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, false));

    up_tx
        .send(Ok(sse(r#"{"choices":[{"delta":{"content":"po"}}]}"#)))
        .await
        .unwrap();
    up_tx.send(Err(StreamFault::ReadError)).await.unwrap();
    drop(up_tx);

    let first = down_rx.recv().await.unwrap();
    assert!(first.starts_with(b"data: "));
    // EOF right after: the fault produces no downstream bytes.
    assert!(down_rx.recv().await.is_none());

    let report = relay.await.unwrap();
    assert_eq!(report.phase, StreamPhase::PartialAborted);
    assert_eq!(report.fault, Some(StreamFault::ReadError));
    assert_eq!(report.output_text, "po");
    assert!(report.usage.prompt_tokens.is_none());
}

#[tokio::test]
async fn idle_timeout_after_headers_is_partial_abort_not_retry_fodder() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(32);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, false));

    up_tx.send(Err(StreamFault::IdleTimeout)).await.unwrap();
    drop(up_tx);

    assert!(down_rx.recv().await.is_none());
    let report = relay.await.unwrap();
    assert_eq!(report.phase, StreamPhase::PartialAborted);
    assert_eq!(report.fault, Some(StreamFault::IdleTimeout));
    assert!(!report.bytes_forwarded);
}

#[tokio::test]
async fn client_disconnect_cancels_upstream_within_one_chunk() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(1);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, false));

    up_tx.send(Ok(sse(r#"{"choices":[]}"#))).await.unwrap();
    let _ = down_rx.recv().await.unwrap();
    drop(down_rx);

    // The next chunk hits the closed downstream; the relay stops and drops
    // the upstream receiver.
    up_tx.send(Ok(sse(r#"{"choices":[]}"#))).await.unwrap();
    let report = timeout(Duration::from_secs(1), relay).await.unwrap().unwrap();
    assert_eq!(report.phase, StreamPhase::Aborted);

    let mut closed = false;
    for _ in 0..8 {
        if up_tx.send(Ok(Bytes::from_static(b"x"))).await.is_err() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed, "upstream channel must close after client abort");
}

#[tokio::test]
async fn gemini_payloads_are_normalized_to_sse() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(32);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, true));

    up_tx
        .send(Ok(Bytes::from_static(
            b"{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"hi\"}]}}]}\n",
        )))
        .await
        .unwrap();
    up_tx
        .send(Ok(Bytes::from_static(
            b"{\"candidates\":[],\"usageMetadata\":{\"promptTokenCount\":7,\"candidatesTokenCount\":3}}\n",
        )))
        .await
        .unwrap();
    drop(up_tx);

    let first = down_rx.recv().await.unwrap();
    assert!(first.starts_with(b"data: {"));
    assert!(first.ends_with(b"\n\n"));

    let _second = down_rx.recv().await.unwrap();
    assert!(down_rx.recv().await.is_none());

    let report = relay.await.unwrap();
    assert_eq!(report.phase, StreamPhase::Closed);
    assert_eq!(report.output_text, "hi");
    assert_eq!(report.usage.prompt_tokens, Some(7));
    assert_eq!(report.usage.completion_tokens, Some(3));
}

#[tokio::test]
async fn split_sse_frames_across_chunks_still_parse() {
    let (up_tx, up_rx) = channels();
    let (down_tx, mut down_rx) = mpsc::channel::<Bytes>(32);

    let relay = tokio::spawn(relay_stream(up_rx, down_tx, false));

    up_tx
        .send(Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"con")))
        .await
        .unwrap();
    up_tx
        .send(Ok(Bytes::from_static(b"tent\":\"pong\"}}]}\n\n")))
        .await
        .unwrap();
    drop(up_tx);

    // Both raw fragments are forwarded as-is.
    assert!(down_rx.recv().await.is_some());
    assert!(down_rx.recv().await.is_some());

    let report = relay.await.unwrap();
    assert_eq!(report.output_text, "pong");
}
