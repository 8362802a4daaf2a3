//! OCI registry digest lookup.
//!
//! Resolves a tag to its manifest digest with an anonymous pull token and a
//! `HEAD` on the manifest; no manifest body is downloaded.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::transport::{check_http_response, require_success, RateLimitedClient, TransportError};

use super::{Digest, DigestSource, ImageReference};

/// Manifest media types accepted from the registry.
pub const MANIFEST_MEDIA_TYPES: [&str; 4] = [
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// Response header carrying the manifest digest.
pub const DIGEST_HEADER: &str = "docker-content-digest";

/// Registry lookup failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Request failed or returned an error status.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Manifest request returned a status other than 200.
    #[error("manifest request returned status {0}")]
    UnexpectedStatus(u16),
    /// Token response could not be decoded.
    #[error("invalid token response: {0}")]
    Token(String),
    /// Manifest response had no digest header.
    #[error("no Docker-Content-Digest header in registry response")]
    MissingDigest,
    /// Registry URL could not be built.
    #[error("invalid registry URL: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Registry v2 API client.
#[derive(Debug)]
pub struct RegistryClient {
    transport: Arc<RateLimitedClient>,
    base_url: Option<String>,
}

impl RegistryClient {
    /// Create a client that derives the registry URL from each image.
    pub fn new(transport: Arc<RateLimitedClient>) -> Self {
        Self {
            transport,
            base_url: None,
        }
    }

    /// Use a fixed registry base URL instead of `https://{host}`.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn base_for(&self, image: &ImageReference) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| image.registry_base_url())
            .trim_end_matches('/')
            .to_owned()
    }

    /// Anonymous pull-scoped bearer token for the image's repository.
    async fn pull_token(
        &self,
        base: &str,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<String, RegistryError> {
        let mut url = Url::parse(&format!("{base}/token"))
            .map_err(|e| RegistryError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("scope", &format!("repository:{}:pull", image.repository))
            .append_pair("service", &image.registry);

        let request = self.transport.http().get(url);
        let response = self.transport.send(request, cancel).await?;
        let body = check_http_response(response).await?;
        let token: TokenResponse =
            serde_json::from_str(&body).map_err(|e| RegistryError::Token(e.to_string()))?;
        Ok(token.token)
    }
}

#[async_trait]
impl DigestSource for RegistryClient {
    async fn remote_digest(
        &self,
        image: &ImageReference,
        cancel: &CancellationToken,
    ) -> Result<Digest, RegistryError> {
        let base = self.base_for(image);
        let token = self.pull_token(&base, image, cancel).await?;

        let url = Url::parse(&format!(
            "{base}/v2/{}/manifests/{}",
            image.repository, image.tag
        ))
        .map_err(|e| RegistryError::InvalidUrl(e.to_string()))?;

        let request = self
            .transport
            .http()
            .head(url)
            .bearer_auth(token)
            .header(ACCEPT, MANIFEST_MEDIA_TYPES.join(", "));

        let response = require_success(self.transport.send(request, cancel).await?).await?;
        if response.status() != StatusCode::OK {
            return Err(RegistryError::UnexpectedStatus(response.status().as_u16()));
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(RegistryError::MissingDigest)?;

        debug!(image = %image, digest, "resolved remote digest");
        Ok(Digest::new(digest))
    }
}
