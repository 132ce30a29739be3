use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use skywings_core::auth::{Credential, CredentialStore};
use skywings_core::storage::{KeyValueStore, MemoryStore};
use skywings_core::{ApiClient, ApiError, ClientConfig, RequestDescriptor};
use wiremock::matchers::{body_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer, store: Arc<dyn KeyValueStore>) -> ApiClient {
    let config = ClientConfig {
        base_url: format!("{}/api", server.uri()),
        ..ClientConfig::default()
    };
    ApiClient::new(config, store).expect("build client")
}

fn signed_in_store(expires_in_secs: i64) -> Arc<dyn KeyValueStore> {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    CredentialStore::new(store.clone())
        .save(&Credential {
            access_token: "tok-1".to_string(),
            refresh_token: Some("ref-1".to_string()),
            expires_at: Some(chrono::Utc::now() + chrono::Duration::seconds(expires_in_secs)),
            user: None,
        })
        .expect("seed session");
    store
}

#[tokio::test]
async fn sends_bearer_and_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/bookings"))
        .and(header("authorization", "Bearer tok-1"))
        .and(header("content-type", "application/json"))
        .and(header_exists("x-request-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "BK-1" }])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, signed_in_store(3600));
    let bookings: Vec<Value> = client.get("/bookings").await.expect("bookings");
    assert_eq!(bookings.len(), 1);
}

#[tokio::test]
async fn refreshes_expiring_token_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(body_json(json!({ "refreshToken": "ref-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "tok-2",
            "refreshToken": "ref-2",
            "expiresIn": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/flights"))
        .and(header("authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "flights": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, signed_in_store(60));
    let flights: Value = client.get("/flights").await.expect("flights");
    assert_eq!(flights["flights"], json!([]));
    assert!(client.is_authenticated());
}

#[tokio::test]
async fn classifies_error_statuses() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/bookings/BK-9"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "already cancelled" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, signed_in_store(3600));
    let err = client.delete::<Value>("/bookings/BK-9").await.expect_err("must fail");
    assert_eq!(
        err,
        ApiError::Conflict {
            message: "already cancelled".to_string()
        }
    );
}

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/flights/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let client = client_for(&server, Arc::new(MemoryStore::new()));
    let err = client
        .request::<Value>(RequestDescriptor::get("/flights/slow").timeout(Duration::from_millis(200)))
        .await
        .expect_err("must time out");
    assert_eq!(err, ApiError::Timeout(Duration::from_millis(200)));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    let config = ClientConfig {
        // Nothing listens on the discard port
        base_url: "http://127.0.0.1:9".to_string(),
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        jitter_ms: 0,
        ..ClientConfig::default()
    };
    let client = ApiClient::new(config, Arc::new(MemoryStore::new())).expect("build client");

    let err = client.get::<Value>("/flights").await.expect_err("must fail");
    assert!(matches!(err, ApiError::NetworkError(_)), "got {:?}", err);
}
