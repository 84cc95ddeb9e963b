use std::collections::HashMap;
use std::time::Duration;

use hitl_protocol::{HITL_REQUEST_TOPIC, HitlResponse, ReviewOutcome};
use hitlgate::broker::{Checkpoint, DeliveryStatus, ReviewBroker};
use hitlgate::transport::LocalTransport;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reviews_resolve_to_their_own_callers() {
    const N: usize = 16;
    let broker = ReviewBroker::new(Duration::from_secs(10));
    let transport = LocalTransport::new(64);
    let mut rx = transport.subscribe();
    broker.set_transport(transport.clone()).await;

    let mut waiters = Vec::new();
    for i in 0..N {
        let b = broker.clone();
        waiters.push(tokio::spawn(async move {
            b.review(
                Checkpoint::new(format!("cp-{}", i), format!("review item {}", i))
                    .with_data(json!({ "index": i })),
            )
            .await
        }));
    }

    let mut ids: HashMap<String, String> = HashMap::new();
    for _ in 0..N {
        let (topic, payload) = rx.recv().await.unwrap();
        assert_eq!(topic, HITL_REQUEST_TOPIC);
        ids.insert(
            payload["checkpoint_name"].as_str().unwrap().to_string(),
            payload["request_id"].as_str().unwrap().to_string(),
        );
    }
    assert_eq!(ids.len(), N);
    assert_eq!(broker.pending_count(), N);

    // answer in a scrambled order; each caller is told its own index
    for k in 0..N {
        let i = (k * 7 + 3) % N;
        let name = format!("cp-{}", i);
        let status = broker.deliver_response(
            HitlResponse::new(ids[&name].as_str(), "modify").with_instructions(format!("fix {}", i)),
        );
        assert_eq!(status, DeliveryStatus::Resolved);
    }

    for (i, waiter) in waiters.into_iter().enumerate() {
        match waiter.await.unwrap() {
            ReviewOutcome::RequestModification {
                message,
                modification_instructions,
            } => {
                assert_eq!(modification_instructions, Some(format!("fix {}", i)));
                assert_eq!(
                    message,
                    format!("User requested modification for 'cp-{}'", i)
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(broker.pending_count(), 0);
}

#[tokio::test]
async fn second_delivery_for_same_request_is_ignored() {
    let broker = ReviewBroker::new(Duration::from_secs(5));
    let transport = LocalTransport::new(4);
    let mut rx = transport.subscribe();
    broker.set_transport(transport.clone()).await;

    let b = broker.clone();
    let waiter =
        tokio::spawn(async move { b.review(Checkpoint::new("deploy", "ship it?")).await });
    let (_, payload) = rx.recv().await.unwrap();
    let id = payload["request_id"].as_str().unwrap().to_string();

    assert_eq!(
        broker.deliver_response(HitlResponse::new(id.as_str(), "abort")),
        DeliveryStatus::Resolved
    );
    assert_eq!(
        broker.deliver_response(HitlResponse::new(id.as_str(), "approve")),
        DeliveryStatus::Unknown
    );
    assert!(matches!(
        waiter.await.unwrap(),
        ReviewOutcome::Aborted { .. }
    ));
}

#[tokio::test]
async fn stray_response_does_not_disturb_waiting_review() {
    let broker = ReviewBroker::new(Duration::from_secs(5));
    let transport = LocalTransport::new(4);
    let mut rx = transport.subscribe();
    broker.set_transport(transport.clone()).await;

    let b = broker.clone();
    let waiter =
        tokio::spawn(async move { b.review(Checkpoint::new("deploy", "ship it?")).await });
    let (_, payload) = rx.recv().await.unwrap();
    let id = payload["request_id"].as_str().unwrap().to_string();

    assert_eq!(
        broker.deliver_raw(json!({ "request_id": "someone-else", "action": "approve" })),
        DeliveryStatus::Unknown
    );
    assert_eq!(
        broker.deliver_raw(json!({ "action": "approve" })),
        DeliveryStatus::MissingRequestId
    );
    assert!(broker.is_pending(&id));

    broker.deliver_response(HitlResponse::new(id.as_str(), "approve"));
    assert!(waiter.await.unwrap().is_approval());
}
