//! E2E tests for .well-known endpoints (WebFinger, host-meta)

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_for_directory_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger"))
        .query(&[("resource", format!("acct:alice@{}", server.domain))])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/jrd+json"
    );

    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], format!("acct:alice@{}", server.domain));
    assert_eq!(json["links"][0]["rel"], "self");
    assert_eq!(json["links"][0]["type"], "application/activity+json");
    assert_eq!(json["links"][0]["href"], server.url("/authors/alice"));
}

#[tokio::test]
async fn test_webfinger_for_instance_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger"))
        .query(&[("resource", format!("acct:instance@{}", server.domain))])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["links"][0]["href"], server.url("/actor"));
}

#[tokio::test]
async fn test_webfinger_unknown_user_or_domain() {
    let server = TestServer::new().await;

    for resource in [
        format!("acct:nobody@{}", server.domain),
        "acct:alice@elsewhere.example".to_string(),
    ] {
        let response = server
            .client
            .get(&server.url("/.well-known/webfinger"))
            .query(&[("resource", resource.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404, "{}", resource);
    }
}

#[tokio::test]
async fn test_webfinger_malformed_resource() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=not-a-handle"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_host_meta_endpoint() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("/.well-known/webfinger?resource={uri}"));
}
