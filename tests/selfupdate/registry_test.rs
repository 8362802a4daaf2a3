//! Registry digest lookup against a mock registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use guildsync::selfupdate::registry::{DIGEST_HEADER, MANIFEST_MEDIA_TYPES};
use guildsync::selfupdate::{DigestSource, RegistryClient, RegistryError};
use guildsync::transport::{RateLimitedClient, TransportError};

use crate::fakes::image;

fn client(server: &MockServer) -> RegistryClient {
    let transport = RateLimitedClient::new(100, Duration::from_secs(10), Duration::from_secs(5))
        .expect("transport");
    RegistryClient::new(Arc::new(transport)).with_base_url(server.uri())
}

async fn mount_token(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("scope", "repository:guildsync/guildsync:pull"))
        .and(query_param("service", "ghcr.io"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "anon-token" })))
        .expect(1)
        .mount(server)
        .await;
}

fn accepts_all_manifest_types(request: &Request) -> bool {
    request
        .headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| MANIFEST_MEDIA_TYPES.iter().all(|t| accept.contains(t)))
}

#[tokio::test]
async fn resolves_digest_from_manifest_head() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("HEAD"))
        .and(path("/v2/guildsync/guildsync/manifests/latest"))
        .and(header("authorization", "Bearer anon-token"))
        .and(accepts_all_manifest_types)
        .respond_with(ResponseTemplate::new(200).insert_header(DIGEST_HEADER, "sha256:AAA"))
        .expect(1)
        .mount(&server)
        .await;

    let digest = client(&server)
        .remote_digest(&image(), &CancellationToken::new())
        .await
        .expect("digest");

    assert_eq!(digest.as_str(), "sha256:AAA");
}

#[tokio::test]
async fn missing_digest_header_is_an_error() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("HEAD"))
        .and(path("/v2/guildsync/guildsync/manifests/latest"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let err = client(&server)
        .remote_digest(&image(), &CancellationToken::new())
        .await
        .expect_err("no digest");

    assert!(matches!(err, RegistryError::MissingDigest));
}

#[tokio::test]
async fn manifest_not_found_is_a_status_error() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("HEAD"))
        .and(path("/v2/guildsync/guildsync/manifests/latest"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client(&server)
        .remote_digest(&image(), &CancellationToken::new())
        .await
        .expect_err("not found");

    assert!(matches!(
        err,
        RegistryError::Transport(TransportError::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn non_200_success_is_rejected() {
    let server = MockServer::start().await;
    mount_token(&server).await;

    Mock::given(method("HEAD"))
        .and(path("/v2/guildsync/guildsync/manifests/latest"))
        .respond_with(ResponseTemplate::new(202).insert_header(DIGEST_HEADER, "sha256:AAA"))
        .mount(&server)
        .await;

    let err = client(&server)
        .remote_digest(&image(), &CancellationToken::new())
        .await
        .expect_err("202 is not a manifest");

    assert!(matches!(err, RegistryError::UnexpectedStatus(202)));
}

#[tokio::test]
async fn token_failure_skips_manifest_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("denied"))
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = client(&server)
        .remote_digest(&image(), &CancellationToken::new())
        .await
        .expect_err("token rejected");

    assert!(matches!(
        err,
        RegistryError::Transport(TransportError::Status { status: 401, .. })
    ));
}
