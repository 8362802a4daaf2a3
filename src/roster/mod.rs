//! Remote roster client abstraction.
//!
//! Defines the [`RosterClient`] trait consumed by the roster reconciler, the
//! shared response types, and [`FetchError`], which separates "no response
//! at all" (transient, retryable) from an explicit remote failure.
//!
//! The production implementation is [`battlenet::BattleNetClient`].

use async_trait::async_trait;
use serde::Deserialize;

use crate::retry::Transient;
use crate::transport::TransportError;

pub mod battlenet;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A guild member as listed in the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// Remote numeric character id.
    pub id: i64,
    /// Character name as shown in the roster.
    pub name: String,
    /// Slug of the character's realm.
    pub realm_slug: String,
}

impl MemberRef {
    /// Record key for this member.
    pub fn record_id(&self) -> String {
        self.id.to_string()
    }
}

/// A `{ id, name }` reference (race, class, spec).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct NamedRef {
    /// Numeric id.
    pub id: i64,
    /// Localized name.
    pub name: String,
}

/// A `{ type, name }` enumeration (gender, faction).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TypedName {
    /// Stable enum value (e.g. "FEMALE", "HORDE").
    #[serde(rename = "type")]
    pub kind: String,
    /// Localized name.
    pub name: String,
}

/// A realm reference.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RealmRef {
    /// Numeric realm id.
    pub id: i64,
    /// Localized realm name.
    pub name: String,
    /// Realm slug.
    pub slug: String,
}

/// The character's guild affiliation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GuildRef {
    /// Numeric guild id.
    pub id: i64,
    /// Guild name.
    pub name: String,
    /// Guild's home realm.
    pub realm: RealmRef,
}

/// The character's active title.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TitleRef {
    /// Numeric title id.
    pub id: i64,
    /// Localized title name.
    pub name: String,
    /// Display template, e.g. "{name} the Patient".
    pub display_string: String,
}

/// Character profile summary.
///
/// Optional sections (spec, guild, title) are absent for some characters
/// and default to empty values.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CharacterProfile {
    /// Remote numeric character id.
    pub id: i64,
    /// Character name.
    pub name: String,
    /// Gender.
    #[serde(default)]
    pub gender: TypedName,
    /// Faction.
    #[serde(default)]
    pub faction: TypedName,
    /// Race.
    #[serde(default)]
    pub race: NamedRef,
    /// Class.
    #[serde(default)]
    pub character_class: NamedRef,
    /// Active specialization.
    #[serde(default)]
    pub active_spec: Option<NamedRef>,
    /// Home realm.
    #[serde(default)]
    pub realm: RealmRef,
    /// Guild affiliation.
    #[serde(default)]
    pub guild: Option<GuildRef>,
    /// Character level.
    #[serde(default)]
    pub level: i64,
    /// Experience towards the next level.
    #[serde(default)]
    pub experience: i64,
    /// Achievement points.
    #[serde(default)]
    pub achievement_points: i64,
    /// Last login, milliseconds since the epoch.
    #[serde(default)]
    pub last_login_timestamp: i64,
    /// Average item level.
    #[serde(default)]
    pub average_item_level: f64,
    /// Equipped item level.
    #[serde(default)]
    pub equipped_item_level: f64,
    /// Active title.
    #[serde(default)]
    pub active_title: Option<TitleRef>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by roster clients.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport failure: cancelled wait, no response, or error status.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Response did not match the expected schema.
    #[error("roster response parse error: {0}")]
    Parse(String),
    /// Access token could not be obtained.
    #[error("roster authentication failed: {0}")]
    Auth(String),
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_transient(),
            Self::Parse(_) | Self::Auth(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Source of guild roster and character profile data.
#[async_trait]
pub trait RosterClient: Send + Sync {
    /// Fetch the member list of a guild.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on transport, status, or parse failure.
    async fn fetch_roster(
        &self,
        guild_slug: &str,
        realm_slug: &str,
    ) -> Result<Vec<MemberRef>, FetchError>;

    /// Fetch one character's profile summary.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`]; [`Transient::is_transient`] tells whether the
    /// failure produced no response and may be retried.
    async fn fetch_profile(
        &self,
        realm_slug: &str,
        name: &str,
    ) -> Result<CharacterProfile, FetchError>;
}
