//! Integration tests for the driver protocol: client, dispatcher and an in-memory bucket

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use serde_json::json;
use std::sync::Arc;
use switchyard_core::completion::FailureKind;
use switchyard_core::driver::{DriverReply, Operation, OperationOutcome};
use switchyard_runtime::{DispatcherConfig, DriverClient, HealthReport, OperationDispatcher};
use switchyard_testing::{MemoryKvFactory, QueuedRequests, init_tracing};

/// Hand every queued request to the dispatcher and feed the responses back to the client
async fn pump(sink: &QueuedRequests, dispatcher: &OperationDispatcher, client: &DriverClient) {
    for request in sink.take() {
        let response = dispatcher.handle(request).await.unwrap();
        client.handle_response(response).unwrap();
    }
}

fn setup() -> (Arc<MemoryKvFactory>, OperationDispatcher, Arc<QueuedRequests>, DriverClient) {
    init_tracing();
    let factory = Arc::new(MemoryKvFactory::new());
    let dispatcher =
        OperationDispatcher::new(factory.clone(), DispatcherConfig::new("kv")).unwrap();
    dispatcher.register_client("component-1", "sessions").unwrap();
    let sink = Arc::new(QueuedRequests::new());
    let client = DriverClient::new("component-1", sink.clone());
    (factory, dispatcher, sink, client)
}

#[tokio::test]
async fn test_key_value_round_trip() {
    let (factory, dispatcher, sink, client) = setup();

    let set = client.request(Operation::new("set", json!({"key": "user:1", "value": {"name": "ada"}})));
    let get = client.request(Operation::new("get", json!({"key": "user:1"})));
    let missing = client.request(Operation::new("delete", json!({"key": "user:2"})));
    assert_eq!(client.pending(), 3);

    pump(&sink, &dispatcher, &client).await;

    assert_eq!(set.await.unwrap(), OperationOutcome::Done);
    assert_eq!(
        get.await.unwrap(),
        OperationOutcome::Value(json!({"name": "ada"}))
    );
    assert_eq!(missing.await.unwrap(), OperationOutcome::Rejected);
    assert_eq!(client.pending(), 0);
    assert_eq!(factory.backend("sessions").unwrap().len(), 1);
}

#[tokio::test]
async fn test_backend_error_reaches_requester() {
    let (_, dispatcher, sink, client) = setup();

    let outcome = client.request(Operation::new("increment", json!({"key": "n"})));
    pump(&sink, &dispatcher, &client).await;

    let cause = outcome.await.unwrap_err();
    assert_eq!(cause.kind(), FailureKind::Remote);
    assert!(cause.message().contains("increment"));
}

#[tokio::test]
async fn test_responses_out_of_order_resolve_their_own_requests() {
    let (_, dispatcher, sink, client) = setup();
    let outcomes: Vec<_> = (0..5)
        .map(|n| client.request(Operation::new("set", json!({"key": format!("k{n}"), "value": n}))))
        .collect();

    let mut requests = sink.take();
    requests.reverse();
    for request in requests {
        let response = dispatcher.dispatch(request).unwrap().await.unwrap();
        client.handle_response(response).unwrap();
    }
    for outcome in outcomes {
        assert_eq!(outcome.await.unwrap(), OperationOutcome::Done);
    }

    let reads: Vec<_> = (0..5)
        .map(|n| client.request(Operation::new("get", json!({"key": format!("k{n}")}))))
        .collect();
    pump(&sink, &dispatcher, &client).await;
    for (n, read) in reads.into_iter().enumerate() {
        assert_eq!(read.await.unwrap(), OperationOutcome::Value(json!(n)));
    }
}

#[tokio::test]
async fn test_unknown_client_gets_error_reply() {
    let (_, dispatcher, sink, _) = setup();
    let stranger = DriverClient::new("component-2", sink.clone());

    let outcome = stranger.request(Operation::new("get", json!({"key": "a"})));
    pump(&sink, &dispatcher, &stranger).await;

    let cause = outcome.await.unwrap_err();
    assert_eq!(cause.kind(), FailureKind::Remote);
    assert!(cause.message().contains("component-2"));
}

#[tokio::test]
async fn test_last_client_closes_backend() {
    let (factory, dispatcher, _, _) = setup();
    dispatcher.register_client("component-2", "sessions").unwrap();
    assert_eq!(factory.created(), 1);

    dispatcher.unregister_client("component-1").unwrap();
    assert_eq!(factory.closed(), 0);
    dispatcher.unregister_client("component-2").unwrap();
    assert_eq!(factory.closed(), 1);
    assert_eq!(dispatcher.backends(), 0);
}

#[tokio::test]
async fn test_unavailable_bucket_is_refused() {
    init_tracing();
    let factory = Arc::new(MemoryKvFactory::new());
    factory.unavailable("archive");
    let dispatcher = OperationDispatcher::new(factory, DispatcherConfig::default()).unwrap();

    assert!(dispatcher.register_client("component-1", "archive").is_err());
    assert_eq!(dispatcher.clients(), 0);
}

#[tokio::test]
async fn test_destroyed_dispatcher_closes_backends() {
    let (factory, dispatcher, sink, client) = setup();
    dispatcher.destroy();
    assert_eq!(factory.closed(), 1);

    let outcome = client.request(Operation::new("get", json!({"key": "a"})));
    let request = sink.take().remove(0);
    let response = dispatcher.handle(request).await.unwrap();
    assert!(matches!(response.reply, DriverReply::Error { .. }));
    client.handle_response(response).unwrap();
    assert!(outcome.await.is_err());
}

#[tokio::test]
async fn test_closed_client_fails_outstanding_requests() {
    let (_, _, sink, client) = setup();
    let first = client.request(Operation::new("get", json!({"key": "a"})));
    let second = client.request(Operation::new("get", json!({"key": "b"})));

    assert_eq!(client.close(), 2);
    assert_eq!(first.await.unwrap_err().kind(), FailureKind::ChannelClosed);
    assert_eq!(second.await.unwrap_err().kind(), FailureKind::ChannelClosed);

    // Late responses no longer match anything
    let late = sink.take().remove(0);
    let stray = switchyard_core::driver::DriverResponse {
        token: late.token,
        reply: DriverReply::Ok,
    };
    assert!(client.handle_response(stray).is_err());
    assert_eq!(client.violations().len(), 1);
}

#[tokio::test]
async fn test_health_report_follows_dispatcher_state() {
    let (_, dispatcher, _, _) = setup();
    assert!(HealthReport::new(vec![dispatcher.health()]).is_healthy());

    dispatcher.destroy();
    let report = HealthReport::new(vec![dispatcher.health()]);
    assert!(report.is_unhealthy());
    assert_eq!(report.checks.len(), 1);
}
