//! guildsync CLI entry point.
//!
//! Provides `start`, `sync`, and `update` subcommands for running the
//! scheduler daemon, performing a single roster pass, or checking for and
//! applying a new container image.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use guildsync::config::{config_path_with, Config};
use guildsync::credentials::{load_credentials, DEFAULT_ENV_FILE};
use guildsync::reconcile::RosterReconciler;
use guildsync::roster::battlenet::BattleNetClient;
use guildsync::scheduler::{ScheduledJob, Scheduler};
use guildsync::selfupdate::{DockerEngine, RegistryClient, SelfUpdater, UpdateOutcome};
use guildsync::store::sqlite::SqliteRecordStore;
use guildsync::store::RecordStore;
use guildsync::transport::RateLimitedClient;

/// guildsync: mirrors a guild roster into a local store and keeps its own
/// container image current.
#[derive(Parser)]
#[command(name = "guildsync", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon.
    Start,
    /// Run a single roster reconciliation pass and exit.
    Sync,
    /// Check the registry for a newer image and apply it.
    Update {
        /// Only compare digests without pulling or restarting.
        #[arg(long)]
        check: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => handle_start().await,
        Command::Sync => handle_sync().await,
        Command::Update { check } => handle_update(check).await,
    }
}

/// Run the scheduler until shutdown or a terminal self-update failure.
async fn handle_start() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    let logging_guard = guildsync::logging::init_production(&config.logging.dir)?;
    log_config_source();
    config.require_guild()?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    let transport = build_transport(&config)?;
    let store = Arc::new(SqliteRecordStore::open(&config.store.path).await?);
    let reconciler = build_reconciler(
        &config,
        Arc::clone(&transport),
        Arc::clone(&store),
        &shutdown,
    )?;

    let initial_sync = match store.count().await {
        Ok(0) => {
            info!("no records found, running initial roster sync");
            true
        }
        Ok(_) => false,
        Err(e) => {
            warn!(error = %e, "failed to count records, skipping initial sync");
            false
        }
    };

    let mut jobs = vec![ScheduledJob::new(Arc::new(reconciler), &config.roster.cron)?
        .run_on_start(initial_sync)];

    if config.self_update.enabled {
        let updater = build_updater(&config, Arc::clone(&transport), &shutdown)?;
        jobs.push(ScheduledJob::new(Arc::new(updater), &config.self_update.cron)?);
    } else {
        info!("self-update disabled");
    }

    info!(
        guild = %config.guild.guild_slug,
        realm = %config.guild.realm_slug,
        store = %config.store.path.display(),
        "guildsync started"
    );

    let scheduler = Scheduler::new(jobs, Duration::from_secs(config.scheduler.tick_secs));
    let result = scheduler.run(shutdown).await;
    store.close().await;

    match result {
        Ok(()) => {
            info!("guildsync stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "terminal failure, exiting");
            drop(logging_guard);
            std::process::exit(1);
        }
    }
}

/// Run one roster pass and print its report.
async fn handle_sync() -> anyhow::Result<()> {
    guildsync::logging::init_cli();
    let config = Config::load().context("failed to load configuration")?;
    log_config_source();
    config.require_guild()?;

    let shutdown = CancellationToken::new();
    let transport = build_transport(&config)?;
    let store = Arc::new(SqliteRecordStore::open(&config.store.path).await?);
    let reconciler = build_reconciler(&config, transport, Arc::clone(&store), &shutdown)?;

    let report = reconciler
        .reconcile()
        .await
        .context("roster reconciliation failed")?;
    store.close().await;

    println!("{report}");
    Ok(())
}

/// Run one self-update pass, or only compare digests with `--check`.
async fn handle_update(check_only: bool) -> anyhow::Result<()> {
    guildsync::logging::init_cli();
    let config = Config::load().context("failed to load configuration")?;
    log_config_source();

    let shutdown = CancellationToken::new();
    let transport = build_transport(&config)?;
    let updater = build_updater(&config, transport, &shutdown)?;

    if check_only {
        let check = updater.check().await.context("update check failed")?;
        let local = check
            .local
            .as_ref()
            .map_or_else(|| "<absent>".to_owned(), ToString::to_string);
        println!("image:  {}", updater.image());
        println!("remote: {}", check.remote);
        println!("local:  {local}");
        if check.is_current() {
            println!("Image is up to date.");
        } else {
            println!("Update available.");
        }
        return Ok(());
    }

    match updater.check_and_apply().await {
        Ok(UpdateOutcome::UpToDate) => println!("Image is up to date."),
        Ok(UpdateOutcome::Restarted { container_id }) => {
            println!("Pulled new image and restarted container {container_id}.");
        }
        Err(e) if e.is_terminal() => {
            error!(error = %e, "terminal self-update failure");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::Error::new(e).context("self-update failed")),
    }
    Ok(())
}

/// Report which config file was used, once a subscriber is installed.
fn log_config_source() {
    let path = config_path_with(|key| std::env::var(key).ok());
    if path.exists() {
        info!(path = %path.display(), "loaded config from file");
    } else {
        info!(path = %path.display(), "no config file found, using defaults");
    }
}

fn build_transport(config: &Config) -> anyhow::Result<Arc<RateLimitedClient>> {
    let client = RateLimitedClient::new(
        config.rate_limit.requests,
        config.rate_limit.period(),
        config.rate_limit.request_timeout(),
    )?;
    Ok(Arc::new(client))
}

fn build_reconciler(
    config: &Config,
    transport: Arc<RateLimitedClient>,
    store: Arc<SqliteRecordStore>,
    shutdown: &CancellationToken,
) -> anyhow::Result<RosterReconciler> {
    let credentials = load_credentials(Path::new(DEFAULT_ENV_FILE))?;
    let (client_id, client_secret) = credentials
        .oauth_client()
        .context("Battle.net OAuth credentials are required")?;

    let client = BattleNetClient::new(
        transport,
        &config.guild,
        client_id,
        client_secret,
        shutdown.clone(),
    )?;

    let store: Arc<dyn RecordStore> = store;
    Ok(RosterReconciler::new(
        Arc::new(client),
        store,
        config.guild.guild_slug.clone(),
        config.guild.realm_slug.clone(),
    )
    .with_retry_policy(config.roster.retry_policy())
    .with_concurrency(config.roster.concurrency))
}

fn build_updater(
    config: &Config,
    transport: Arc<RateLimitedClient>,
    shutdown: &CancellationToken,
) -> anyhow::Result<SelfUpdater> {
    let image = config.self_update.image_reference()?;
    let engine = DockerEngine::connect(&config.self_update.socket_path).with_context(|| {
        format!(
            "failed to connect to container engine at {}",
            config.self_update.socket_path
        )
    })?;

    let mut registry = RegistryClient::new(transport);
    if let Some(url) = &config.self_update.registry_url {
        registry = registry.with_base_url(url.clone());
    }

    Ok(SelfUpdater::new(Arc::new(registry), Arc::new(engine), image)
        .with_deadline(config.self_update.deadline())
        .with_restart_grace(config.self_update.restart_grace_secs)
        .with_cancellation(shutdown.clone()))
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(error = %e, "failed to install SIGTERM handler");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        shutdown.cancel();
                    }
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("received shutdown signal, initiating graceful shutdown");
    shutdown.cancel();
}
