//! Wire-level tests for the vision client against a mock service.

use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pairwise_core::{
    Artifact, Error, MatchQuery, RequestContext, SimilarityMatcher, WireVersion,
};
use pairwise_vision::{VisionClient, VisionConfig};

fn query(mode: &str) -> MatchQuery {
    MatchQuery {
        filename: "drawing.png".to_string(),
        bytes: b"\x89PNG fake".to_vec(),
        mode: mode.to_string(),
        phash_threshold: 10,
        feature_threshold: 0.85,
        max_results: 5,
        exclude_self: true,
    }
}

fn client(server: &MockServer) -> VisionClient {
    VisionClient::new(VisionConfig::new(server.uri()).with_timeout(5)).expect("build client")
}

#[tokio::test]
async fn test_v2_success_does_not_call_v1() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let response = client(&server)
        .search(&RequestContext::system(), &query("balanced"))
        .await
        .unwrap();
    assert_eq!(response.version, WireVersion::V2);
}

#[tokio::test]
async fn test_v2_bad_request_falls_back_with_legacy_mode() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .and(body_string_contains("precise"))
        .respond_with(ResponseTemplate::new(400).set_body_string("unsupported"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .and(body_string_contains("accurate"))
        .and(body_string_contains("diff_top_k"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"results": [{"file_id": "b", "similarity": 0.9}]})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .search(&RequestContext::system(), &query("accurate"))
        .await
        .unwrap();
    assert_eq!(response.version, WireVersion::V1);
    assert_eq!(response.body["results"][0]["file_id"], "b");
}

#[tokio::test]
async fn test_v2_unavailable_falls_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"duplicates": []})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .search(&RequestContext::system(), &query("fast"))
        .await
        .unwrap();
    assert_eq!(response.version, WireVersion::V1);
}

#[tokio::test]
async fn test_v2_unauthorized_does_not_fall_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .search(&RequestContext::system(), &query("fast"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Request(_)), "{err:?}");
}

#[tokio::test]
async fn test_v1_rejection_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(422).set_body_string("not an image"))
        .mount(&server)
        .await;

    let err = client(&server)
        .search(&RequestContext::system(), &query("balanced"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Fatal(_)), "{err:?}");
    assert!(err.to_string().contains("not an image"));
}

#[tokio::test]
async fn test_v1_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/search"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = client(&server)
        .search(&RequestContext::system(), &query("balanced"))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn test_unreachable_service_is_retryable() {
    let config = VisionConfig::new("http://127.0.0.1:9").with_timeout(2);
    let client = VisionClient::new(config).unwrap();

    let err = client
        .search(&RequestContext::system(), &query("balanced"))
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
}

#[tokio::test]
async fn test_context_headers_forwarded() {
    let server = MockServer::start().await;
    let ctx = RequestContext::for_user("alice")
        .with_tenant("tenant-1")
        .with_org("org-9")
        .with_authorization("  user-token ");
    Mock::given(method("POST"))
        .and(path("/api/v2/search"))
        .and(header("Authorization", "Bearer user-token"))
        .and(header("X-Tenant-ID", "tenant-1"))
        .and(header("X-Org-ID", "org-9"))
        .and(header("X-Request-ID", ctx.request_id.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server).search(&ctx, &query("fast")).await.unwrap();
}

#[tokio::test]
async fn test_service_token_used_without_user_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .and(header("Authorization", "Bearer svc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let client =
        VisionClient::new(VisionConfig::new(server.uri()).with_service_token("Bearer svc")).unwrap();
    let health = client.health(&RequestContext::system()).await.unwrap();
    assert_eq!(health["status"], "ok");
}

#[tokio::test]
async fn test_index_add_query_params() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/index/add"))
        .and(query_param("user_name", "bob"))
        .and(query_param("upload_to_s3", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"indexed": true})))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = Artifact {
        file_id: "f-1".to_string(),
        filename: "f-1.png".to_string(),
        bytes: vec![1, 2, 3],
        document_type: None,
    };
    let body = client(&server)
        .index_add(&RequestContext::system(), &artifact, Some("bob"))
        .await
        .unwrap();
    assert_eq!(body["indexed"], true);
}

#[tokio::test]
async fn test_index_add_defaults_to_actor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/index/add"))
        .and(query_param("user_name", "carol"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let artifact = Artifact {
        file_id: "f-2".to_string(),
        filename: "f-2.png".to_string(),
        bytes: vec![0],
        document_type: None,
    };
    client(&server)
        .index_add(&RequestContext::for_user("carol"), &artifact, None)
        .await
        .unwrap();
}
