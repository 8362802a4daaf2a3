//! Battle.net World of Warcraft profile API client.
//!
//! Authenticates with the OAuth client-credentials flow, caches the access
//! token until shortly before expiry, and routes every call through the
//! shared [`RateLimitedClient`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::GuildConfig;
use crate::transport::{check_http_response, RateLimitedClient};

use super::{CharacterProfile, FetchError, MemberRef, RosterClient};

/// Refresh the token this long before the server-reported expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Battle.net roster client.
pub struct BattleNetClient {
    transport: Arc<RateLimitedClient>,
    api_base: Url,
    oauth_base: Url,
    namespace: String,
    locale: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BattleNetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BattleNetClient")
            .field("api_base", &self.api_base.as_str())
            .field("namespace", &self.namespace)
            .field("locale", &self.locale)
            .field("client_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

impl BattleNetClient {
    /// Create a client for the configured region and locale.
    ///
    /// `cancel` aborts any rate-limiter wait (used at shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the configured base URLs are invalid.
    pub fn new(
        transport: Arc<RateLimitedClient>,
        guild: &GuildConfig,
        client_id: String,
        client_secret: String,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let api_base = Url::parse(&guild.api_base_url())
            .map_err(|e| anyhow::anyhow!("invalid api base URL: {e}"))?;
        let oauth_base = Url::parse(&guild.oauth_base_url())
            .map_err(|e| anyhow::anyhow!("invalid oauth base URL: {e}"))?;

        Ok(Self {
            transport,
            api_base,
            oauth_base,
            namespace: format!("profile-{}", guild.region.as_str()),
            locale: guild.locale.clone(),
            client_id,
            client_secret,
            token: Mutex::new(None),
            cancel,
        })
    }

    /// Return a cached access token or request a new one.
    async fn access_token(&self) -> Result<String, FetchError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = join_segments(&self.oauth_base, &["token"])?;
        let request = self
            .transport
            .http()
            .post(url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")]);

        let response = self.transport.send(request, &self.cancel).await?;
        let body = check_http_response(response).await?;
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| FetchError::Auth(format!("invalid token response: {e}")))?;

        if token.access_token.is_empty() {
            return Err(FetchError::Auth("empty access token".to_owned()));
        }

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        debug!(expires_in = token.expires_in, "obtained access token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now()
                .checked_add(lifetime)
                .unwrap_or_else(Instant::now),
        });
        Ok(token.access_token)
    }

    /// GET a profile-namespace resource and decode it.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        segments: &[&str],
    ) -> Result<T, FetchError> {
        let token = self.access_token().await?;
        let mut url = join_segments(&self.api_base, segments)?;
        url.query_pairs_mut()
            .append_pair("namespace", &self.namespace)
            .append_pair("locale", &self.locale);

        let request = self.transport.http().get(url).bearer_auth(token);
        let response = self.transport.send(request, &self.cancel).await?;
        let body = check_http_response(response).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse(e.to_string()))
    }
}

#[async_trait]
impl RosterClient for BattleNetClient {
    async fn fetch_roster(
        &self,
        guild_slug: &str,
        realm_slug: &str,
    ) -> Result<Vec<MemberRef>, FetchError> {
        let roster: RosterResponse = self
            .get_json(&["data", "wow", "guild", realm_slug, guild_slug, "roster"])
            .await?;

        Ok(roster
            .members
            .into_iter()
            .map(|m| MemberRef {
                id: m.character.id,
                name: m.character.name,
                realm_slug: m.character.realm.slug,
            })
            .collect())
    }

    async fn fetch_profile(
        &self,
        realm_slug: &str,
        name: &str,
    ) -> Result<CharacterProfile, FetchError> {
        let lowered = name.to_lowercase();
        self.get_json(&["profile", "wow", "character", realm_slug, &lowered])
            .await
    }
}

/// Append path segments to a base URL, percent-encoding each one.
fn join_segments(base: &Url, segments: &[&str]) -> Result<Url, FetchError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| FetchError::Parse(format!("base URL cannot have a path: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// -- Battle.net response types (private) --

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[serde(default)]
    members: Vec<RosterMember>,
}

#[derive(Debug, Deserialize)]
struct RosterMember {
    character: RosterCharacter,
}

#[derive(Debug, Deserialize)]
struct RosterCharacter {
    id: i64,
    name: String,
    realm: RosterRealm,
}

#[derive(Debug, Deserialize)]
struct RosterRealm {
    slug: String,
}
