//! Configuration loading and validation.
//!
//! Loads `guildsync.toml` (or `$GUILDSYNC_CONFIG`) with per-section defaults.
//! All sections use `#[serde(default)]` so a minimal or empty config file is
//! valid, and a missing file yields the defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::selfupdate::ImageReference;

/// Env var naming an explicit config file path.
pub const CONFIG_PATH_ENV: &str = "GUILDSYNC_CONFIG";

/// Config file used when `$GUILDSYNC_CONFIG` is unset.
const DEFAULT_CONFIG_FILE: &str = "guildsync.toml";

// ── Top-level config ────────────────────────────────────────────

/// Top-level guildsync configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which guild to mirror and where the game-data API lives.
    pub guild: GuildConfig,
    /// Shared outbound request quota.
    pub rate_limit: RateLimitConfig,
    /// Roster reconciliation cadence and retry behaviour.
    pub roster: RosterConfig,
    /// Container self-update settings.
    pub self_update: SelfUpdateConfig,
    /// Local record store location.
    pub store: StoreConfig,
    /// Log file location for the daemon.
    pub logging: LoggingConfig,
    /// Scheduler tick settings.
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// the merged configuration fails validation.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from_path(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// A missing file is not an error: defaults are returned instead.
    /// Nothing is logged here since the subscriber is installed from the
    /// loaded config; see [`config_path_with`] for reporting the source.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str).context("failed to parse config TOML")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests do not need to mutate the process
    /// environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("GUILD_SLUG") {
            self.guild.guild_slug = v;
        }
        if let Some(v) = env("REALM_SLUG") {
            self.guild.realm_slug = v;
        }
        if let Some(v) = env("GUILDSYNC_REGION") {
            match v.parse() {
                Ok(region) => self.guild.region = region,
                Err(_) => tracing::warn!(
                    var = "GUILDSYNC_REGION",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("GUILDSYNC_LOCALE") {
            self.guild.locale = v;
        }
        if let Some(v) = env("GUILDSYNC_IMAGE") {
            self.self_update.image = v;
        }
        if let Some(v) = env("GUILDSYNC_DB_PATH") {
            self.store.path = PathBuf::from(v);
        }
        if let Some(v) = env("GUILDSYNC_SELF_UPDATE") {
            match v.parse() {
                Ok(enabled) => self.self_update.enabled = enabled,
                Err(_) => tracing::warn!(
                    var = "GUILDSYNC_SELF_UPDATE",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Validate that configuration values are within sane bounds.
    ///
    /// Guild identity is checked separately by [`Config::require_guild`] so
    /// that `update` can run without a guild configured.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.rate_limit.requests >= 1, "rate_limit.requests must be >= 1");
        anyhow::ensure!(
            self.rate_limit.period_secs >= 1,
            "rate_limit.period_secs must be >= 1"
        );
        anyhow::ensure!(
            self.rate_limit.request_timeout_secs >= 1,
            "rate_limit.request_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            (1..=10).contains(&self.roster.max_attempts),
            "roster.max_attempts must be in [1, 10]"
        );
        anyhow::ensure!(
            (1..=32).contains(&self.roster.concurrency),
            "roster.concurrency must be in [1, 32]"
        );
        anyhow::ensure!(
            self.self_update.deadline_secs >= 10,
            "self_update.deadline_secs must be >= 10"
        );
        anyhow::ensure!(self.scheduler.tick_secs >= 1, "scheduler.tick_secs must be >= 1");

        cron::Schedule::from_str(&self.roster.cron)
            .with_context(|| format!("invalid roster.cron: {}", self.roster.cron))?;
        cron::Schedule::from_str(&self.self_update.cron)
            .with_context(|| format!("invalid self_update.cron: {}", self.self_update.cron))?;
        self.self_update.image_reference()?;
        Ok(())
    }

    /// Ensure the guild and realm slugs needed by the roster job are set.
    ///
    /// # Errors
    ///
    /// Returns an error if either slug is empty or not slug-shaped. Slugs
    /// may contain lowercase letters of any script, digits, and `-`.
    pub fn require_guild(&self) -> anyhow::Result<()> {
        for (key, value) in [
            ("guild.guild_slug", &self.guild.guild_slug),
            ("guild.realm_slug", &self.guild.realm_slug),
        ] {
            anyhow::ensure!(!value.trim().is_empty(), "{key} must be set");
            anyhow::ensure!(
                value
                    .chars()
                    .all(|c| (c.is_alphanumeric() && !c.is_uppercase()) || c == '-'),
                "{key} must be a slug (lowercase letters, digits, '-'): {value}"
            );
        }
        Ok(())
    }
}

/// Resolve the config file path using a custom env resolver.
pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
    env(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

// ── Guild ───────────────────────────────────────────────────────

/// Battle.net API region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    /// Europe.
    #[default]
    Eu,
    /// North America.
    Us,
    /// Korea.
    Kr,
    /// Taiwan.
    Tw,
}

impl Region {
    /// Lowercase region code used in hosts and namespaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eu => "eu",
            Self::Us => "us",
            Self::Kr => "kr",
            Self::Tw => "tw",
        }
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eu" => Ok(Self::Eu),
            "us" => Ok(Self::Us),
            "kr" => Ok(Self::Kr),
            "tw" => Ok(Self::Tw),
            other => anyhow::bail!("unknown region: {other}"),
        }
    }
}

/// Guild identity and game-data API endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuildConfig {
    /// API region.
    pub region: Region,
    /// Locale for localized names (e.g. "de_DE").
    pub locale: String,
    /// Realm slug of the guild's home realm.
    pub realm_slug: String,
    /// Guild name slug.
    pub guild_slug: String,
    /// Override for the game-data API base URL.
    pub api_base_url: Option<String>,
    /// Override for the OAuth base URL.
    pub oauth_base_url: Option<String>,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            region: Region::default(),
            locale: "de_DE".to_owned(),
            realm_slug: String::new(),
            guild_slug: String::new(),
            api_base_url: None,
            oauth_base_url: None,
        }
    }
}

impl GuildConfig {
    /// Game-data API base URL, defaulting to the regional host.
    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.api.blizzard.com", self.region.as_str()))
    }

    /// OAuth base URL (token endpoint lives at `{base}/token`).
    pub fn oauth_base_url(&self) -> String {
        self.oauth_base_url
            .clone()
            .unwrap_or_else(|| "https://oauth.battle.net".to_owned())
    }
}

// ── Rate limit ──────────────────────────────────────────────────

/// Token-bucket quota shared by every outbound HTTP call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Permits per period (also the burst size).
    pub requests: u32,
    /// Period length in seconds.
    pub period_secs: u64,
    /// Network-level timeout applied to every request.
    pub request_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            period_secs: 10,
            request_timeout_secs: 30,
        }
    }
}

impl RateLimitConfig {
    /// Quota period as a [`Duration`].
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Roster ──────────────────────────────────────────────────────

/// Roster reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    /// Cron expression (with seconds field) for the roster pass.
    pub cron: String,
    /// Total profile fetch attempts for transient faults.
    pub max_attempts: u32,
    /// Backoff unit in milliseconds; the wait before attempt `n + 1` is `n` units.
    pub backoff_unit_ms: u64,
    /// Maximum concurrent profile fetches.
    pub concurrency: usize,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            cron: "0 */7 * * * *".to_owned(),
            max_attempts: 3,
            backoff_unit_ms: 100,
            concurrency: 4,
        }
    }
}

impl RosterConfig {
    /// Retry policy for profile fetches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.backoff_unit_ms))
    }
}

// ── Self-update ─────────────────────────────────────────────────

/// Container self-update settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfUpdateConfig {
    /// Master switch for the self-update job.
    pub enabled: bool,
    /// Cron expression (with seconds field) for the update check.
    pub cron: String,
    /// Fully-qualified image reference (`host/repo:tag`).
    pub image: String,
    /// Override for the registry base URL (defaults to `https://{host}`).
    pub registry_url: Option<String>,
    /// Container engine control socket.
    pub socket_path: String,
    /// Overall deadline for one check-and-apply pass.
    pub deadline_secs: u64,
    /// Grace period passed to the container restart.
    pub restart_grace_secs: u32,
}

impl Default for SelfUpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: "0 */20 * * * *".to_owned(),
            image: "ghcr.io/guildsync/guildsync:latest".to_owned(),
            registry_url: None,
            socket_path: "/var/run/docker.sock".to_owned(),
            deadline_secs: 300,
            restart_grace_secs: 10,
        }
    }
}

impl SelfUpdateConfig {
    /// Parse the configured image reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the image string is not `host/repo[:tag]`.
    pub fn image_reference(&self) -> anyhow::Result<ImageReference> {
        self.image
            .parse()
            .with_context(|| format!("invalid self_update.image: {}", self.image))
    }

    /// Overall pass deadline.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

// ── Store, logging, scheduler ───────────────────────────────────

/// Local record store location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/guildsync.db"),
        }
    }
}

/// Daemon log location.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for rolling JSON logs.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/logs"),
        }
    }
}

/// Scheduler tick settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between due-job evaluations.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 1 }
    }
}
