use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use courier_channels::{ChannelBus, TelegramChannel};
use courier_core::{ChatId, Identity, IdentityStore, MessagingClient, StoreError, TaskStore};
use courier_engine::{CorrelationReaper, Dispatcher, Forwarder, IdentitySelector, StateRefresher};
use courier_store::SqliteTaskStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod admin;
mod config;

use admin::EditArgs;
use config::CourierConfig;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Courier: relay messages between chats")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay daemon
    Start,

    /// Initialize config directory and default config
    Init,

    /// Show current configuration (tokens masked)
    Config,

    /// Prune expired correlations once and exit
    Reap,

    /// Show task counts and the forward mode
    Status,

    /// Show or change which identity relays messages
    Mode {
        #[command(subcommand)]
        action: Option<ModeAction>,
    },

    /// Manage forwarding tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    /// Print the active identity
    Show,
    /// Switch the active identity (a running daemon follows on its next refresh)
    Set {
        #[arg(value_parser = parse_identity)]
        identity: Identity,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List all tasks
    List,
    /// Show one task in detail
    Show { name: String },
    /// Create a task
    Create {
        name: String,
        /// Source chat ids (comma separated)
        #[arg(long = "source", required = true, value_delimiter = ',', allow_hyphen_values = true)]
        sources: Vec<ChatId>,
        /// Destination chat ids (comma separated, in order)
        #[arg(long = "target", required = true, value_delimiter = ',', allow_hyphen_values = true)]
        targets: Vec<ChatId>,
    },
    /// Change task settings
    Edit {
        name: String,
        #[command(flatten)]
        args: EditArgs,
    },
    /// Rename a task
    Rename { old_name: String, new_name: String },
    /// Delete a task
    Delete { name: String },
    /// Import tasks from a JSON file
    Import { file: PathBuf },
}

fn parse_identity(s: &str) -> Result<Identity, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Start => cmd_start(&cli.config).await,
        Commands::Reap => cmd_reap(&cli.config).await,
        Commands::Status => cmd_status(&cli.config).await,
        Commands::Mode { action } => cmd_mode(&cli.config, action.unwrap_or(ModeAction::Show)).await,
        Commands::Task { action } => cmd_task(&cli.config, action).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    println!("Courier initialized at {}", config_dir.display());
    println!(
        "Set COURIER_PRIMARY_TOKEN (and optionally COURIER_SECONDARY_TOKEN) or edit {}.",
        config_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg.redacted())?);
    Ok(())
}

fn open_store(cfg: &CourierConfig) -> Result<Arc<SqliteTaskStore>> {
    let db_path = cfg.db_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteTaskStore::open(&db_path)
        .with_context(|| format!("Failed to open task store at {}", db_path.display()))?;
    Ok(Arc::new(store))
}

/// Register one Telegram channel per configured identity
fn build_bus(cfg: &CourierConfig) -> Result<ChannelBus> {
    let mut bus = ChannelBus::new(cfg.relay.event_buffer);
    let poll_timeout = Duration::from_secs(cfg.telegram.poll_timeout_secs);

    for identity in cfg.identities.configured() {
        if let Some(token) = cfg.identities.token(identity) {
            let channel = TelegramChannel::new(
                identity,
                token.to_string(),
                &cfg.telegram.api_base_url,
                poll_timeout,
            )?;
            bus.register(Box::new(channel));
        }
    }

    if !bus.has_identity(Identity::Primary) {
        bail!("The primary identity has no token. Set COURIER_PRIMARY_TOKEN or edit the config.");
    }
    Ok(bus)
}

async fn cmd_start(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    info!("Starting courier daemon...");

    let cancel = CancellationToken::new();

    let store = open_store(&cfg)?;
    info!("Loaded {} task(s)", store.len());

    let mut bus = build_bus(&cfg)?;
    bus.start_all(&cancel).await?;
    let (events, sender) = bus.split();
    let client: Arc<dyn MessagingClient> = Arc::new(sender);
    info!(
        "Connected identities: {}",
        client
            .available_identities()
            .iter()
            .map(|i| i.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let task_store: Arc<dyn TaskStore> = store.clone();
    let identity_store: Arc<dyn IdentityStore> = store;
    let selector = Arc::new(IdentitySelector::load(client.clone(), identity_store).await);
    info!("Forwarding as {}", selector.active());

    let forwarder = Arc::new(Forwarder::new(
        client,
        task_store.clone(),
        selector.clone(),
    ));
    let dispatcher = Dispatcher::new(task_store.clone(), selector.clone(), forwarder);

    let reaper =
        CorrelationReaper::new(task_store.clone(), cfg.relay.reaper_config()).spawn(cancel.clone());

    // Pick up task and mode changes made with the CLI
    let wake = StateRefresher::create_wake_handle();
    let refresher = StateRefresher::new(task_store, selector, cfg.relay.refresh_interval())
        .spawn(cancel.clone(), wake.clone());

    #[cfg(unix)]
    {
        let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
            .context("Failed to install SIGHUP handler")?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("Received SIGHUP, reloading tasks and forward mode");
                        wake.notify_one();
                    }
                }
            }
        });
    }

    let loop_cancel = cancel.clone();
    let main_loop = tokio::spawn(async move {
        dispatcher.run(events, loop_cancel).await;
    });

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    cancel.cancel();

    if let Err(e) = main_loop.await {
        warn!("Dispatcher task failed: {}", e);
    }
    if let Err(e) = reaper.await {
        warn!("Correlation reaper task failed: {}", e);
    }
    if let Err(e) = refresher.await {
        warn!("State refresher task failed: {}", e);
    }

    println!("Courier stopped.");
    Ok(())
}

async fn cmd_reap(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    let store = open_store(&cfg)?;
    let report = CorrelationReaper::new(store, cfg.relay.reaper_config())
        .sweep()
        .await;
    println!("{}", report);
    Ok(())
}

async fn cmd_status(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    let store = open_store(&cfg)?;
    let mode = store.identity()?.unwrap_or(Identity::Primary);
    let status = admin::Status::new(
        &store.list(),
        mode,
        cfg.identities.token(Identity::Secondary).is_some(),
    );
    println!("{}", status);
    Ok(())
}

async fn cmd_mode(config_path: &Option<PathBuf>, action: ModeAction) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    let store = open_store(&cfg)?;

    // Availability is whatever is configured; the channels are not started
    let (_events, sender) = build_bus(&cfg)?.split();
    let client: Arc<dyn MessagingClient> = Arc::new(sender);
    let selector = IdentitySelector::load(client, store).await;

    match action {
        ModeAction::Show => println!("{}", selector.active()),
        ModeAction::Set { identity } => {
            selector.set_active(identity).await?;
            println!("Forward mode set to {}", identity);
            println!(
                "A running daemon switches within {}s, or at once on SIGHUP.",
                cfg.relay.refresh_interval().as_secs()
            );
        }
    }
    Ok(())
}

async fn cmd_task(config_path: &Option<PathBuf>, action: TaskAction) -> Result<()> {
    let cfg = CourierConfig::load(config_path)?;
    let store = open_store(&cfg)?;

    match action {
        TaskAction::List => {
            let tasks = store.list();
            if tasks.is_empty() {
                println!("No tasks. Create one with `courier task create`.");
            }
            for task in tasks {
                println!("{}", task.summary());
            }
        }
        TaskAction::Show { name } => {
            let task = store.get(&name).ok_or(StoreError::NotFound(name))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskAction::Create {
            name,
            sources,
            targets,
        } => {
            let task = store.create(&name, sources, targets)?;
            println!("Created {}", task.summary());
        }
        TaskAction::Edit { name, args } => {
            let current = store.get(&name).ok_or_else(|| StoreError::NotFound(name.clone()))?;
            let update = admin::build_update(&args, &current)?;
            let task = store.apply(&name, update)?;
            println!("Updated {}", task.summary());
        }
        TaskAction::Rename { old_name, new_name } => {
            let task = store.rename(&old_name, &new_name)?;
            println!("Renamed '{}' to '{}'", old_name, task.name);
        }
        TaskAction::Delete { name } => {
            let task = store.delete(&name)?;
            println!("Deleted '{}'", task.name);
        }
        TaskAction::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let tasks = admin::parse_import(&content)?;
            let total = tasks.len();
            let mut imported = 0;
            for task in tasks {
                let name = task.name.clone();
                match store.insert(task) {
                    Ok(()) => imported += 1,
                    Err(StoreError::AlreadyExists(_)) => {
                        warn!("Task '{}' already exists, skipping", name)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            println!("Imported {} of {} task(s)", imported, total);
        }
    }
    Ok(())
}
