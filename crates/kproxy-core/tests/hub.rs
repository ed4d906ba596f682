use tokio::sync::broadcast::error::RecvError;

use kproxy_core::hub::{Notice, ObserverHub};

fn metric(metric_id: i64) -> Notice {
    Notice::Metric {
        session_id: 1,
        metric_id,
        prompt_tokens: Some(metric_id),
        completion_tokens: Some(1),
        estimated_input_tokens: metric_id,
        is_estimated: false,
        finish_reason: None,
    }
}

fn metric_id(notice: &Notice) -> i64 {
    match notice {
        Notice::Metric { metric_id, .. } => *metric_id,
        other => panic!("unexpected notice {other:?}"),
    }
}

#[tokio::test]
async fn notices_arrive_in_publish_order() {
    let hub = ObserverHub::new(64);
    let mut rx = hub.subscribe();
    for id in 0..10 {
        hub.publish(metric(id));
    }
    for expected in 0..10 {
        let notice = rx.recv().await.unwrap();
        assert_eq!(metric_id(&notice), expected);
    }
}

#[tokio::test]
async fn slow_observer_drops_oldest_with_exact_count() {
    let hub = ObserverHub::new(64);
    let mut rx = hub.subscribe();

    // 80 notices into a 64-deep ring: the 16 oldest are gone.
    for id in 0..80 {
        hub.publish(metric(id));
    }

    let mut dropped: u64 = 0;
    let first = loop {
        match rx.recv().await {
            Ok(notice) => break notice,
            Err(RecvError::Lagged(n)) => dropped += n,
            Err(RecvError::Closed) => panic!("hub closed"),
        }
    };
    assert_eq!(dropped, 16);
    assert_eq!(metric_id(&first), 16);

    let mut last = metric_id(&first);
    while let Ok(notice) = rx.try_recv() {
        last = metric_id(&notice);
    }
    assert_eq!(last, 79);
}

#[tokio::test]
async fn one_slow_observer_does_not_harm_a_fast_one() {
    let hub = ObserverHub::new(64);
    let mut slow = hub.subscribe();
    let mut fast = hub.subscribe();

    for id in 0..200 {
        hub.publish(metric(id));
        // The fast observer keeps up; publishing never blocks on `slow`.
        let notice = fast.recv().await.unwrap();
        assert_eq!(metric_id(&notice), id);
    }

    match slow.recv().await {
        Err(RecvError::Lagged(n)) => assert_eq!(n, 200 - 64),
        other => panic!("expected lag, got {other:?}"),
    }
}
