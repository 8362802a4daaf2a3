//! Character record store.
//!
//! [`CharacterRecord`] is the persisted form of a guild member's profile.
//! Records are compared field by field through [`FieldValue::normalized`],
//! so a number stored as `5.0` and a fresh value of `5` are the same value
//! and never trigger a write.
//!
//! The [`RecordStore`] trait is the seam the reconciler writes through; the
//! production backend is [`sqlite::SqliteRecordStore`].

use async_trait::async_trait;

use crate::roster::CharacterProfile;

pub mod sqlite;

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// A single stored field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// Whole number.
    Integer(i64),
    /// Floating-point number.
    Float(f64),
}

impl FieldValue {
    /// Canonical string form used for change detection.
    pub fn normalized(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Integer(n) => n.to_string(),
            Self::Float(n) => normalize_float(*n),
        }
    }

    /// True when both values normalize to the same string.
    pub fn same_as(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// Render a float as an integer when it has no fractional part, otherwise
/// as its shortest exact decimal form (`5.0` -> `"5"`, `5.5` -> `"5.5"`).
pub fn normalize_float(n: f64) -> String {
    // i64 bounds as f64; values outside them keep the decimal rendering.
    const LOWER: f64 = -9_223_372_036_854_775_808.0;
    const UPPER: f64 = 9_223_372_036_854_775_808.0;

    if n.is_finite() && n.fract() == 0.0 && (LOWER..UPPER).contains(&n) {
        #[allow(clippy::cast_possible_truncation)]
        let whole = n as i64;
        return whole.to_string();
    }
    format!("{n}")
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One guild member as persisted in the store.
///
/// `id` is the remote character id in decimal form and never changes.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct CharacterRecord {
    pub id: String,
    pub name: String,
    pub realm: String,
    pub realm_name: String,
    pub realm_id: i64,
    pub gender_type: String,
    pub gender_name: String,
    pub faction_type: String,
    pub faction_name: String,
    pub race_id: i64,
    pub race_name: String,
    pub character_class_id: i64,
    pub character_class_name: String,
    pub active_spec_id: i64,
    pub active_spec_name: String,
    pub guild_name: String,
    pub guild_id: i64,
    pub guild_realm_name: String,
    pub guild_realm_id: i64,
    pub guild_realm_slug: String,
    pub level: i64,
    pub experience: i64,
    pub achievement_points: i64,
    pub last_login_timestamp: i64,
    pub average_item_level: f64,
    pub equipped_item_level: f64,
    pub active_title_id: i64,
    pub active_title_name: String,
    pub active_title_display_string: String,
}

/// The first field found to differ between a stored and a fresh record.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Column name.
    pub field: &'static str,
    /// Stored value, normalized.
    pub old: String,
    /// Fresh value, normalized.
    pub new: String,
}

impl CharacterRecord {
    /// Build a record from a freshly fetched profile.
    ///
    /// Absent spec, guild, and title sections map to empty strings and zero.
    pub fn from_profile(profile: &CharacterProfile) -> Self {
        let spec = profile.active_spec.clone().unwrap_or_default();
        let guild = profile.guild.clone().unwrap_or_default();
        let title = profile.active_title.clone().unwrap_or_default();

        Self {
            id: profile.id.to_string(),
            name: profile.name.clone(),
            realm: profile.realm.slug.clone(),
            realm_name: profile.realm.name.clone(),
            realm_id: profile.realm.id,
            gender_type: profile.gender.kind.clone(),
            gender_name: profile.gender.name.clone(),
            faction_type: profile.faction.kind.clone(),
            faction_name: profile.faction.name.clone(),
            race_id: profile.race.id,
            race_name: profile.race.name.clone(),
            character_class_id: profile.character_class.id,
            character_class_name: profile.character_class.name.clone(),
            active_spec_id: spec.id,
            active_spec_name: spec.name,
            guild_name: guild.name,
            guild_id: guild.id,
            guild_realm_name: guild.realm.name,
            guild_realm_id: guild.realm.id,
            guild_realm_slug: guild.realm.slug,
            level: profile.level,
            experience: profile.experience,
            achievement_points: profile.achievement_points,
            last_login_timestamp: profile.last_login_timestamp,
            average_item_level: profile.average_item_level,
            equipped_item_level: profile.equipped_item_level,
            active_title_id: title.id,
            active_title_name: title.name,
            active_title_display_string: title.display_string,
        }
    }

    /// Every stored field except `id`, in column order.
    pub fn field_values(&self) -> Vec<(&'static str, FieldValue)> {
        use FieldValue::{Float, Integer, Text};

        vec![
            ("name", Text(self.name.clone())),
            ("realm", Text(self.realm.clone())),
            ("realm_name", Text(self.realm_name.clone())),
            ("realm_id", Integer(self.realm_id)),
            ("gender_type", Text(self.gender_type.clone())),
            ("gender_name", Text(self.gender_name.clone())),
            ("faction_type", Text(self.faction_type.clone())),
            ("faction_name", Text(self.faction_name.clone())),
            ("race_id", Integer(self.race_id)),
            ("race_name", Text(self.race_name.clone())),
            ("character_class_id", Integer(self.character_class_id)),
            ("character_class_name", Text(self.character_class_name.clone())),
            ("active_spec_id", Integer(self.active_spec_id)),
            ("active_spec_name", Text(self.active_spec_name.clone())),
            ("guild_name", Text(self.guild_name.clone())),
            ("guild_id", Integer(self.guild_id)),
            ("guild_realm_name", Text(self.guild_realm_name.clone())),
            ("guild_realm_id", Integer(self.guild_realm_id)),
            ("guild_realm_slug", Text(self.guild_realm_slug.clone())),
            ("level", Integer(self.level)),
            ("experience", Integer(self.experience)),
            ("achievement_points", Integer(self.achievement_points)),
            ("last_login_timestamp", Integer(self.last_login_timestamp)),
            ("average_item_level", Float(self.average_item_level)),
            ("equipped_item_level", Float(self.equipped_item_level)),
            ("active_title_id", Integer(self.active_title_id)),
            ("active_title_name", Text(self.active_title_name.clone())),
            (
                "active_title_display_string",
                Text(self.active_title_display_string.clone()),
            ),
        ]
    }

    /// Compare against the stored version of this record.
    ///
    /// Returns the first field whose normalized value differs, or `None`
    /// when a write would change nothing.
    pub fn first_difference(&self, stored: &Self) -> Option<FieldChange> {
        self.field_values()
            .into_iter()
            .zip(stored.field_values())
            .find(|((_, fresh), (_, old))| !fresh.same_as(old))
            .map(|((field, fresh), (_, old))| FieldChange {
                field,
                old: old.normalized(),
                new: fresh.normalized(),
            })
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Errors from a record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Insert collided with an existing id.
    #[error("record {id} already exists")]
    Conflict {
        /// Record id.
        id: String,
    },
    /// Update or delete targeted a missing id.
    #[error("record {id} not found")]
    NotFound {
        /// Record id.
        id: String,
    },
    /// Backend-specific failure without a database error.
    #[error("store error: {0}")]
    Other(String),
}

/// Persistent collection of character records keyed by id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every record currently stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn list_all(&self) -> Result<Vec<CharacterRecord>, StoreError>;

    /// Create a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if the id already exists.
    async fn insert(&self, record: &CharacterRecord) -> Result<(), StoreError>;

    /// Overwrite every field of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is absent.
    async fn update(&self, record: &CharacterRecord) -> Result<(), StoreError>;

    /// Remove a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the id is absent.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Number of stored records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    async fn count(&self) -> Result<u64, StoreError>;
}
