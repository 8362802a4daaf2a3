//! Coverage for config parsing, overrides, and validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use guildsync::config::{Config, Region};

fn resolver(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn with_guild() -> Config {
    let mut config = Config::default();
    config.guild.guild_slug = "die-ewige-wacht".to_owned();
    config.guild.realm_slug = "blackrock".to_owned();
    config
}

#[test]
fn defaults_match_documented_values() {
    let config = Config::default();
    assert_eq!(config.guild.region, Region::Eu);
    assert_eq!(config.guild.locale, "de_DE");
    assert_eq!(config.rate_limit.requests, 100);
    assert_eq!(config.rate_limit.period(), Duration::from_secs(10));
    assert_eq!(config.roster.cron, "0 */7 * * * *");
    assert_eq!(config.roster.max_attempts, 3);
    assert_eq!(config.self_update.cron, "0 */20 * * * *");
    assert_eq!(config.self_update.deadline(), Duration::from_secs(300));
    assert_eq!(config.self_update.restart_grace_secs, 10);
    assert!(config.self_update.enabled);
    assert_eq!(config.store.path, PathBuf::from("data/guildsync.db"));
}

#[test]
fn defaults_pass_validation() {
    assert!(Config::default().validate().is_ok());
}

#[test]
fn default_endpoints_follow_region() {
    let mut config = Config::default();
    config.guild.region = Region::Us;
    assert_eq!(config.guild.api_base_url(), "https://us.api.blizzard.com");
    assert_eq!(config.guild.oauth_base_url(), "https://oauth.battle.net");

    config.guild.api_base_url = Some("http://127.0.0.1:9000".to_owned());
    assert_eq!(config.guild.api_base_url(), "http://127.0.0.1:9000");
}

#[test]
fn parse_partial_config_keeps_other_defaults() {
    let toml_str = r#"
[guild]
region = "kr"
guild_slug = "hanbit"
realm_slug = "azshara"

[roster]
concurrency = 8

[self_update]
image = "registry.example.com:5000/ops/guildsync:stable"
"#;
    let config = Config::from_toml(toml_str).expect("config should parse");

    assert_eq!(config.guild.region, Region::Kr);
    assert_eq!(config.guild.guild_slug, "hanbit");
    assert_eq!(config.guild.locale, "de_DE");
    assert_eq!(config.roster.concurrency, 8);
    assert_eq!(config.roster.max_attempts, 3);

    let image = config.self_update.image_reference().expect("image parses");
    assert_eq!(image.registry, "registry.example.com:5000");
    assert_eq!(image.repository, "ops/guildsync");
    assert_eq!(image.tag, "stable");
}

#[test]
fn empty_config_is_valid() {
    let config = Config::from_toml("").expect("empty config should parse");
    assert!(config.validate().is_ok());
}

#[test]
fn malformed_toml_is_rejected() {
    assert!(Config::from_toml("[guild\nregion = ").is_err());
    assert!(Config::from_toml("[guild]\nregion = \"mars\"").is_err());
}

#[test]
fn missing_file_yields_defaults() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let config = Config::load_from_path(&tmp.path().join("absent.toml")).expect("defaults");
    assert_eq!(config.rate_limit.requests, 100);
}

#[test]
fn file_is_loaded_from_path() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let path = tmp.path().join("guildsync.toml");
    std::fs::write(&path, "[rate_limit]\nrequests = 20\nperiod_secs = 1\n").expect("write");

    let config = Config::load_from_path(&path).expect("config loads");
    assert_eq!(config.rate_limit.requests, 20);
    assert_eq!(config.rate_limit.period(), Duration::from_secs(1));
}

#[test]
fn env_overrides_take_precedence() {
    let mut config = Config::from_toml("[guild]\nguild_slug = \"from-file\"\n").expect("parse");
    config.apply_overrides(resolver(&[
        ("GUILD_SLUG", "from-env"),
        ("REALM_SLUG", "blackrock"),
        ("GUILDSYNC_REGION", "TW"),
        ("GUILDSYNC_LOCALE", "zh_TW"),
        ("GUILDSYNC_DB_PATH", "/var/lib/guildsync/roster.db"),
        ("GUILDSYNC_SELF_UPDATE", "false"),
    ]));

    assert_eq!(config.guild.guild_slug, "from-env");
    assert_eq!(config.guild.realm_slug, "blackrock");
    assert_eq!(config.guild.region, Region::Tw);
    assert_eq!(config.guild.locale, "zh_TW");
    assert_eq!(config.store.path, PathBuf::from("/var/lib/guildsync/roster.db"));
    assert!(!config.self_update.enabled);
}

#[test]
fn invalid_region_override_is_ignored() {
    let mut config = Config::default();
    config.apply_overrides(resolver(&[("GUILDSYNC_REGION", "mars")]));
    assert_eq!(config.guild.region, Region::Eu);
}

#[test]
fn validation_rejects_out_of_range_values() {
    let mut config = Config::default();
    config.rate_limit.requests = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.roster.max_attempts = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.roster.concurrency = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.self_update.deadline_secs = 1;
    assert!(config.validate().is_err());
}

#[test]
fn validation_rejects_bad_cron_and_image() {
    let mut config = Config::default();
    config.roster.cron = "every seven minutes".to_owned();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.self_update.image = "guildsync:latest".to_owned();
    assert!(config.validate().is_err());
}

#[test]
fn guild_identity_is_required_for_roster() {
    assert!(Config::default().require_guild().is_err());
    assert!(with_guild().require_guild().is_ok());

    let mut config = with_guild();
    config.guild.realm_slug = "Black Rock".to_owned();
    assert!(config.require_guild().is_err());
}

#[test]
fn unicode_slugs_are_accepted() {
    let mut config = with_guild();
    config.guild.guild_slug = "käsekuchen".to_owned();
    config.guild.realm_slug = "die-aldor".to_owned();
    assert!(config.require_guild().is_ok());

    config.guild.guild_slug = "Käsekuchen".to_owned();
    assert!(config.require_guild().is_err());
}

#[test]
fn retry_policy_comes_from_roster_section() {
    let mut config = Config::default();
    config.roster.max_attempts = 5;
    config.roster.backoff_unit_ms = 250;

    let policy = config.roster.retry_policy();
    assert_eq!(policy.max_attempts(), 5);
    assert_eq!(policy.backoff(2), Duration::from_millis(500));
}

#[test]
fn region_parses_case_insensitively() {
    assert_eq!("EU".parse::<Region>().expect("eu"), Region::Eu);
    assert_eq!(" us ".parse::<Region>().expect("us"), Region::Us);
    assert!("cn".parse::<Region>().is_err());
    assert_eq!(Region::Kr.as_str(), "kr");
}
