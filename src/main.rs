use std::{path::PathBuf, time::Duration};

use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::{broadcast, mpsc};

use playlist_arranger::{
    config::{Config, StoreBackend},
    config_persistence::{default_config_path, load_config_file, persist_config_file},
    db_manager::DbManager,
    document::DocumentTree,
    extract,
    notify::LogNotifier,
    order::{OrderController, TransformKind},
    persistence::{MemoryStore, SettingsStore},
    protocol::{EngineCommand, EngineEvent, HostEvent, Message},
    tree::{lock_tree, shared, SharedTree},
    SyncController,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "playlist-arranger", version, about = "Reorders playlist items in a host document tree")]
struct Cli {
    /// Engine config file. Defaults to the per-user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep settings in memory for this run only.
    #[arg(long, global = true)]
    ephemeral: bool,
    /// Repeat for debug and trace output.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Activates on a JSON tree fixture and applies a transform.
    Arrange {
        /// JSON element tree (`tag`, `id`, `class`, `attrs`, `text`, `children`).
        #[arg(long)]
        tree: PathBuf,
        /// Location the tree was captured at.
        #[arg(long)]
        url: String,
        /// reverse, shuffle, alphabetical, duration or upload-date.
        #[arg(long)]
        transform: Option<TransformKind>,
        /// Restore the original order afterwards.
        #[arg(long)]
        reset: bool,
        /// Seed for reproducible shuffles.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Lists the transforms that can be invoked.
    Kinds,
    /// Lists remembered transforms, newest first.
    Records,
    /// Writes the effective config, keeping existing comments.
    WriteConfig,
}

struct ArrangeRequest {
    tree: PathBuf,
    url: String,
    transform: Option<TransformKind>,
    reset: bool,
    seed: Option<u64>,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let mut clog = colog::default_builder();
    clog.filter(
        None,
        match cli.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        },
    );
    clog.init();

    let config_path = cli.config.clone().or_else(default_config_path);
    let config = config_path
        .as_deref()
        .map(load_config_file)
        .unwrap_or_default();

    match cli.command {
        Command::Kinds => {
            for kind in SyncController::<DocumentTree>::list_transform_kinds() {
                println!("{:<14} {}", kind.tag(), kind.label());
            }
        }
        Command::Records => {
            let store = open_store(&config, cli.ephemeral);
            for row in store.summary(Utc::now()) {
                println!(
                    "{}\t{}\t{}\t{}",
                    row.playlist_id,
                    row.transform.tag(),
                    row.captured_at.to_rfc3339(),
                    if row.fresh { "fresh" } else { "expired" }
                );
            }
        }
        Command::WriteConfig => {
            let Some(path) = config_path else {
                return Err("no config directory available; pass --config".into());
            };
            persist_config_file(&config, &path);
            info!("Config written to {}", path.display());
        }
        Command::Arrange {
            tree,
            url,
            transform,
            reset,
            seed,
        } => {
            let store = open_store(&config, cli.ephemeral);
            arrange(
                &config,
                store,
                ArrangeRequest {
                    tree,
                    url,
                    transform,
                    reset,
                    seed,
                },
            )?;
        }
    }
    Ok(())
}

fn open_store(config: &Config, ephemeral: bool) -> SettingsStore {
    let retention = config.retention();
    if ephemeral || config.persistence.backend == StoreBackend::Memory {
        return SettingsStore::open(Box::new(MemoryStore::new()), retention);
    }
    let db_manager = match &config.persistence.database_path {
        Some(path) => DbManager::open(path),
        None => DbManager::new(),
    };
    match db_manager {
        Ok(db_manager) => SettingsStore::open(Box::new(db_manager), retention),
        Err(err) => {
            warn!("Settings database unavailable, using memory only: {}", err);
            SettingsStore::open(Box::new(MemoryStore::new()), retention)
        }
    }
}

fn arrange(config: &Config, store: SettingsStore, request: ArrangeRequest) -> CliResult<()> {
    let json = std::fs::read_to_string(&request.tree)?;
    let tree = shared(DocumentTree::from_json(&json)?);
    let mut controller =
        SyncController::new(tree.clone(), config, store, Box::new(LogNotifier));
    if let Some(seed) = request.seed {
        controller = controller.with_order_controller(OrderController::with_seed(seed));
    }
    let events = controller.subscribe();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(drive(config, controller, events, tree, request))
}

async fn drive(
    config: &Config,
    controller: SyncController<DocumentTree>,
    mut events: broadcast::Receiver<EngineEvent>,
    tree: SharedTree<DocumentTree>,
    request: ArrangeRequest,
) -> CliResult<()> {
    let timing = &config.timing;
    let activation_limit = Duration::from_millis(
        timing.watch_activation_settle_ms
            + (u64::from(config.discovery.max_retries) + 1) * timing.discovery_retry_ms,
    );
    let replay_limit = Duration::from_millis(timing.replay_settle_ms + 250);
    let command_limit = Duration::from_secs(5);

    let (inbox, receiver) = mpsc::unbounded_channel();
    let engine = tokio::spawn(controller.run(receiver));
    inbox.send(Message::Host(HostEvent::LocationChanged(request.url.clone())))?;

    let activated = wait_for(&mut events, activation_limit, |event| {
        matches!(
            event,
            EngineEvent::Activated { .. } | EngineEvent::DiscoveryGaveUp
        )
    })
    .await;
    match activated {
        Some(EngineEvent::Activated {
            playlist_id,
            item_count,
        }) => info!(
            "Found {} items (playlist {})",
            item_count,
            playlist_id.as_deref().unwrap_or("-")
        ),
        _ => {
            let _ = inbox.send(Message::Shutdown);
            let _ = engine.await;
            return Err(format!("no playlist items found for {}", request.url).into());
        }
    }

    match request.transform {
        Some(kind) => {
            inbox.send(Message::Command(EngineCommand::Invoke(kind)))?;
            let applied = wait_for(&mut events, command_limit, |event| {
                matches!(event, EngineEvent::TransformApplied { silent: false, .. })
            })
            .await;
            if applied.is_none() {
                warn!("{} was not applied", kind.label());
            }
        }
        None => {
            let replayed = wait_for(&mut events, replay_limit, |event| {
                matches!(event, EngineEvent::TransformApplied { .. })
            })
            .await;
            if let Some(EngineEvent::TransformApplied { kind, .. }) = replayed {
                info!("Replayed remembered transform: {}", kind.label());
            }
        }
    }

    if request.reset {
        inbox.send(Message::Command(EngineCommand::Reset))?;
        wait_for(&mut events, command_limit, |event| {
            *event == EngineEvent::ResetApplied
        })
        .await;
    }

    print_items(config, &tree);
    inbox.send(Message::Shutdown)?;
    engine.await?;
    Ok(())
}

async fn wait_for(
    events: &mut broadcast::Receiver<EngineEvent>,
    limit: Duration,
    wanted: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let next = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} engine events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(limit, next).await.ok().flatten()
}

fn print_items(config: &Config, tree: &SharedTree<DocumentTree>) {
    let tree = lock_tree(tree);
    let now = Utc::now();
    let items = config.item_discovery().locate(&*tree);
    for (index, item) in items.into_iter().enumerate() {
        let fields = extract::extract_fields(&*tree, item, now);
        println!(
            "{:>3}. {} [{}s, {}]",
            index + 1,
            fields.title,
            fields.duration_seconds,
            fields.recency.format("%Y-%m-%d")
        );
    }
}
