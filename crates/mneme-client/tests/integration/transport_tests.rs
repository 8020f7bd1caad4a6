use std::time::Duration;

use mneme_client::HttpTransport;
use mneme_core::models::TeachEntry;
use mneme_core::{
    AppError, CircuitState, IntelligenceLevel, KnowledgeClient, KnowledgeConfig,
    KnowledgeTransport, TeachStatus,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{TEST_API_KEY, setup_service};

#[tokio::test]
async fn query_sends_urls_and_parses_answer() {
    let (server, transport) = setup_service().await;

    Mock::given(method("POST"))
        .and(path("/query"))
        .and(header("authorization", format!("Bearer {TEST_API_KEY}").as_str()))
        .and(body_json(json!({
            "urls": ["https://a.test", "https://b.test"],
            "intelligence": "high"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "known": [{"url": "https://a.test", "data": {"title": "A"}, "confidence": 0.9}],
            "unknown": ["https://b.test"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let urls = vec!["https://a.test".to_string(), "https://b.test".to_string()];
    let response = transport.query(&urls, IntelligenceLevel::High).await.unwrap();

    assert_eq!(response.known.len(), 1);
    assert_eq!(response.known[0].data, json!({"title": "A"}));
    assert_eq!(response.unknown, vec!["https://b.test".to_string()]);
}

#[tokio::test]
async fn teach_sends_entries() {
    let (server, transport) = setup_service().await;

    Mock::given(method("POST"))
        .and(path("/teach"))
        .and(body_json(json!({
            "entries": [{"url": "https://a.test", "data": {"title": "X"}}]
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "accepted", "learned": 1})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = transport
        .teach(&[TeachEntry {
            url: "https://a.test".into(),
            data: json!({"title": "X"}),
        }])
        .await
        .unwrap();

    assert_eq!(response.status, TeachStatus::Accepted);
    assert_eq!(response.learned, 1);
}

#[tokio::test]
async fn stats_parses_camel_case_body() {
    let (server, transport) = setup_service().await;

    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "queries": 40,
            "recognized": 10,
            "recognitionRate": 0.25,
            "learned": 7,
            "period": "24h"
        })))
        .mount(&server)
        .await;

    let stats = transport.stats().await.unwrap();
    assert_eq!(stats.queries, 40);
    assert_eq!(stats.recognition_rate, 0.25);
    assert_eq!(stats.period, "24h");
}

#[tokio::test]
async fn too_many_requests_maps_to_rate_limit() {
    let (server, transport) = setup_service().await;

    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let err = transport.stats().await.unwrap_err();
    assert_eq!(err, AppError::RateLimitExceeded);
    assert!(err.is_rate_limit());
}

#[tokio::test]
async fn server_error_is_retryable_with_service_message() {
    let (server, transport) = setup_service().await;

    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "warming up"})))
        .mount(&server)
        .await;

    let err = transport.stats().await.unwrap_err();
    assert_eq!(
        err,
        AppError::ServiceError {
            message: "warming up".into(),
            status_code: 503,
            retryable: true,
        }
    );
}

#[tokio::test]
async fn client_error_is_not_retryable() {
    let (server, transport) = setup_service().await;

    Mock::given(method("POST"))
        .and(path("/teach"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let err = transport.teach(&[]).await.unwrap_err();
    match err {
        AppError::ServiceError {
            message,
            status_code,
            retryable,
        } => {
            assert_eq!(status_code, 401);
            assert!(!retryable);
            assert_eq!(message, "HTTP 401: unauthorized");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn malformed_body_is_an_http_error() {
    let (server, transport) = setup_service().await;

    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = transport.stats().await.unwrap_err();
    assert!(matches!(err, AppError::HttpError(_)));
    assert!(err.should_trip_circuit());
}

#[tokio::test]
async fn slow_service_times_out() {
    let (server, transport) = setup_service().await;
    let transport = transport.with_timeout(Duration::from_millis(100)).unwrap();

    Mock::given(method("GET"))
        .and(path("/stats"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = transport.stats().await.unwrap_err();
    assert_eq!(err, AppError::Timeout(100));
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    // Reserve a free port, then release it so nothing is listening there.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let transport = HttpTransport::new(&format!("http://127.0.0.1:{port}")).unwrap();

    let err = transport.stats().await.unwrap_err();
    assert!(
        matches!(err, AppError::NetworkError(_) | AppError::HttpError(_)),
        "unexpected error: {err:?}"
    );
    assert!(err.should_trip_circuit());
}

#[tokio::test]
async fn client_stops_calling_a_failing_service() {
    let (server, _) = setup_service().await;

    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = KnowledgeConfig {
        base_url: server.uri(),
        batch_max_wait_ms: 1,
        ..Default::default()
    };
    let client = KnowledgeClient::new(HttpTransport::from_config(&config).unwrap(), config);

    for i in 0..6 {
        let result = client.query(&format!("https://a.test/{i}")).await;
        assert!(result.fallback);
        assert!(!result.known);
    }

    assert_eq!(client.circuit_stats().state, CircuitState::Open);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn query_teach_query_round_trip() {
    let (server, _) = setup_service().await;

    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"known": [], "unknown": ["https://x.test"]})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/teach"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": "accepted", "learned": 1})),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "known": [{"url": "https://x.test", "data": {"title": "X"}, "confidence": 0.95}]
        })))
        .mount(&server)
        .await;

    let config = KnowledgeConfig {
        base_url: server.uri(),
        batch_max_wait_ms: 1,
        ..Default::default()
    };
    let client = KnowledgeClient::new(HttpTransport::from_config(&config).unwrap(), config);

    let before = client.query("https://x.test").await;
    assert!(!before.known && !before.fallback);

    let taught = client.teach("https://x.test", json!({"title": "X"})).await;
    assert!(taught.is_accepted());
    assert_eq!(taught.learned, 1);

    let after = client.query("https://x.test").await;
    assert!(after.known);
    assert_eq!(after.data, Some(json!({"title": "X"})));
    assert!(after.confidence.unwrap() > 0.0);
}
