//! Capability HTTP behavior against a mocked server: the seed exchange,
//! event-queue status mapping, and the chat-session call contracts.

// Test support helpers run outside #[test] functions, where the clippy
// test allowances do not reach.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use metaverse_client::{
    Capability, CapabilityError, CapabilityRegistry, QueuePoll, SeedCapability,
};
use metaverse_llsd::Value;
use uuid::Uuid;
use wiremock::{
    matchers::{body_string_contains, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn llsd_response(value: &Value) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_raw(metaverse_llsd::to_xml(value), "application/llsd+xml")
}

#[tokio::test]
async fn seed_exchange_installs_registered_capabilities_only() {
    let server = MockServer::start().await;
    let granted: Value = [
        ("EventQueueGet", Value::from(format!("{}/eq", server.uri()).as_str())),
        ("ChatSessionRequest", Value::from(format!("{}/chat", server.uri()).as_str())),
        ("FetchInventory2", Value::from(format!("{}/inv", server.uri()).as_str())),
    ]
    .into_iter()
    .collect();

    // The request is the LLSD array of names the client understands.
    Mock::given(method("POST"))
        .and(path("/seed"))
        .and(header("content-type", "application/llsd+xml"))
        .and(body_string_contains("EventQueueGet"))
        .and(body_string_contains("ChatSessionRequest"))
        .respond_with(llsd_response(&granted))
        .expect(1)
        .mount(&server)
        .await;

    let registry = CapabilityRegistry::standard();
    let seed = SeedCapability::new(format!("{}/seed", server.uri()), reqwest::Client::new());
    let capabilities = seed.fetch(&registry).await.unwrap();

    assert!(capabilities.contains_key("EventQueueGet"));
    assert!(capabilities.contains_key("ChatSessionRequest"));
    // Unregistered names from the grant are ignored.
    assert!(!capabilities.contains_key("FetchInventory2"));
}

#[tokio::test]
async fn seed_exchange_surfaces_http_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/seed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let registry = CapabilityRegistry::standard();
    let seed = SeedCapability::new(format!("{}/seed", server.uri()), reqwest::Client::new());
    assert!(matches!(seed.fetch(&registry).await, Err(CapabilityError::Status(500))));
}

fn event_queue_client(server: &MockServer) -> metaverse_client::EventQueueGet {
    let registry = CapabilityRegistry::standard();
    let capability = registry
        .instantiate("EventQueueGet", &format!("{}/eq", server.uri()), &reqwest::Client::new())
        .unwrap();
    match capability {
        Capability::EventQueue(client) => client,
        Capability::ChatSession(_) => panic!("wrong capability"),
    }
}

#[tokio::test]
async fn event_queue_poll_returns_events_and_next_ack() {
    let server = MockServer::start().await;
    let reply: Value = [
        ("id", Value::Integer(12)),
        (
            "events",
            Value::Array(vec![
                [
                    ("message", Value::from("ChatterBoxInvitation")),
                    ("body", [("session-id", Value::Uuid(Uuid::from_u128(5)))].into_iter().collect()),
                ]
                .into_iter()
                .collect(),
            ]),
        ),
    ]
    .into_iter()
    .collect();
    Mock::given(method("POST"))
        .and(path("/eq"))
        .and(body_string_contains("ack"))
        .respond_with(llsd_response(&reply))
        .mount(&server)
        .await;

    let client = event_queue_client(&server);
    match client.poll(0, false).await {
        QueuePoll::Events { ack, events } => {
            assert_eq!(ack, 12);
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].name, "ChatterBoxInvitation");
            assert_eq!(
                events[0].body.get("session-id").and_then(Value::as_uuid),
                Some(Uuid::from_u128(5))
            );
        }
        other => panic!("expected events, got {other:?}"),
    }
}

#[tokio::test]
async fn event_queue_poll_maps_404_to_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eq"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = event_queue_client(&server);
    assert!(matches!(client.poll(3, false).await, QueuePoll::Terminal));
}

#[tokio::test]
async fn event_queue_poll_maps_other_statuses_to_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/eq"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = event_queue_client(&server);
    assert!(matches!(client.poll(3, false).await, QueuePoll::Retry));
}

fn chat_client(server: &MockServer) -> metaverse_client::ChatSessionRequest {
    let registry = CapabilityRegistry::standard();
    let capability = registry
        .instantiate("ChatSessionRequest", &format!("{}/chat", server.uri()), &reqwest::Client::new())
        .unwrap();
    match capability {
        Capability::ChatSession(client) => client,
        Capability::EventQueue(_) => panic!("wrong capability"),
    }
}

#[tokio::test]
async fn chat_session_accept_invitation_reports_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_string_contains("accept invitation"))
        .respond_with(llsd_response(&Value::Boolean(true)))
        .mount(&server)
        .await;

    let client = chat_client(&server);
    assert!(client.accept_invitation(Uuid::from_u128(9)).await.unwrap());
}

#[tokio::test]
async fn chat_session_accept_invitation_false_on_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let client = chat_client(&server);
    assert!(!client.accept_invitation(Uuid::from_u128(9)).await.unwrap());
}

#[tokio::test]
async fn chat_session_history_parses_array_and_tolerates_errors() {
    let server = MockServer::start().await;
    let history = Value::Array(vec![
        [
            ("from", Value::from("Test Bot")),
            ("message", Value::from("hello")),
            ("num", Value::Integer(1)),
        ]
        .into_iter()
        .collect(),
    ]);
    Mock::given(method("POST"))
        .and(path("/chat"))
        .and(body_string_contains("fetch history"))
        .respond_with(llsd_response(&history))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = chat_client(&server);
    let entries = client.fetch_history(Uuid::from_u128(9)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].get("message").and_then(Value::as_str), Some("hello"));

    // Non-200 yields the empty history, not an error.
    let empty = client.fetch_history(Uuid::from_u128(9)).await.unwrap();
    assert!(empty.is_empty());
}
