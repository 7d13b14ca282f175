use asset_batcher::catalogue::types::Selection;
use asset_batcher::config::Settings;
use asset_batcher::coordinator::benchmark::COSTS_FILE;
use asset_batcher::coordinator::handler::BatchCoordinator;
use asset_batcher::coordinator::state::{BatchReport, Role};
use asset_batcher::discovery::service::DiscoveryService;
use asset_batcher::scheduler::strategy::Strategy;
use asset_batcher::transfer::receiver::TransferReceiver;
use asset_batcher::transfer::tracker::DispatchTracker;
use asset_batcher::worker::types::ExportFormat;
use clap::{Args, Parser, Subcommand};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Batch exporter for catalogue assets, locally or across the LAN
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: $BATCHER_CONFIG or batcher.json)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the source files a selection resolves to
    List {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Export the selection on this machine
    Local {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        overrides: OverrideArgs,
    },
    /// Discover nodes and distribute the selection over them
    Master {
        #[command(flatten)]
        selection: SelectionArgs,
        #[command(flatten)]
        overrides: OverrideArgs,
        /// Seconds to listen for node announcements before dispatching
        #[arg(long = "discovery-wait", value_name = "SECS", default_value_t = 5)]
        discovery_wait: u64,
        /// Also announce this machine and process its own share
        #[arg(long = "share-cpus")]
        share_cpus: bool,
    },
    /// Announce this machine and process batches pushed by a master
    Worker {
        /// Cores offered to masters (default: all)
        #[arg(long = "shared-cores", value_name = "N")]
        shared_cores: Option<usize>,
    },
    /// Time a full catalogue export and write per-file costs
    Bench,
}

#[derive(Args, Debug)]
struct SelectionArgs {
    /// Every object in the catalogue
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Objects of a catalogue category (repeatable)
    #[arg(long = "category", value_name = "NAME")]
    categories: Vec<String>,

    /// Objects of assets carrying a tag (repeatable)
    #[arg(short = 't', long = "tag", value_name = "TAG")]
    tags: Vec<String>,

    /// Objects of assets whose path contains the fragment (repeatable)
    #[arg(long = "filename", value_name = "SUBSTR")]
    filenames: Vec<String>,

    /// Explicit object name (repeatable)
    #[arg(short = 'o', long = "object", value_name = "NAME")]
    objects: Vec<String>,

    /// Only assets whose revision moved since the last export
    #[arg(long = "changed-only")]
    changed_only: bool,
}

impl SelectionArgs {
    fn selections(&self) -> Vec<Selection> {
        let mut selections = Vec::new();
        if self.all {
            selections.push(Selection::All);
        }
        selections.extend(self.categories.iter().cloned().map(Selection::Category));
        selections.extend(self.tags.iter().cloned().map(Selection::Tag));
        selections.extend(self.filenames.iter().cloned().map(Selection::Filename));
        if !self.objects.is_empty() {
            selections.push(Selection::Objects(self.objects.clone()));
        }
        selections
    }

    fn apply(&self, settings: &mut Settings) {
        if self.changed_only {
            settings.revision_export = true;
        }
    }
}

#[derive(Args, Debug)]
struct OverrideArgs {
    #[arg(long = "subdivision", value_name = "N")]
    subdivision: Option<u32>,

    #[arg(long = "palette", value_name = "NAME")]
    palette: Option<String>,

    #[arg(long = "static-vertex-colors")]
    static_vertex_colors: bool,

    #[arg(long = "collider-offset", value_name = "F")]
    collider_offset: Option<f32>,

    /// fbx or gltf
    #[arg(long = "format", value_name = "FMT")]
    format: Option<ExportFormat>,

    /// Run the tool's script in debug mode and log all of its output
    #[arg(long = "debug")]
    debug: bool,

    /// simple, cost or performance
    #[arg(long = "strategy", value_name = "NAME")]
    strategy: Option<Strategy>,
}

impl OverrideArgs {
    fn apply(&self, settings: &mut Settings) {
        let overrides = &mut settings.overrides;
        if let Some(subdivision) = self.subdivision {
            overrides.subdivision = Some(subdivision);
        }
        if let Some(palette) = &self.palette {
            overrides.palette = Some(palette.clone());
        }
        if let Some(offset) = self.collider_offset {
            overrides.collider_offset = Some(offset);
        }
        if let Some(format) = self.format {
            overrides.format = Some(format);
        }
        overrides.static_vertex_colors |= self.static_vertex_colors;
        overrides.debug |= self.debug;

        if let Some(strategy) = self.strategy {
            settings.strategy = strategy;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config_path = Settings::locate(cli.config.clone());
    let mut settings = Settings::load(&config_path);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            shutdown.cancel();
        }
    });

    let report = match cli.command {
        Command::List { selection } => {
            selection.apply(&mut settings);
            let coordinator = BatchCoordinator::new(settings, Role::Local);
            let files = coordinator.list(&selection.selections())?;
            for file in &files {
                println!("{}", file.display());
            }
            println!("Source files: {}", files.len());
            return Ok(());
        }
        Command::Local { selection, overrides } => {
            selection.apply(&mut settings);
            overrides.apply(&mut settings);
            settings.validate(Role::Local)?;

            let mut coordinator = BatchCoordinator::new(settings, Role::Local);
            coordinator.run_local(&selection.selections()).await?
        }
        Command::Master {
            selection,
            overrides,
            discovery_wait,
            share_cpus,
        } => {
            selection.apply(&mut settings);
            overrides.apply(&mut settings);
            settings.share_cpus |= share_cpus;
            settings.use_nodes = true;
            run_master(settings, &selection.selections(), discovery_wait, cancel.clone()).await?
        }
        Command::Worker { shared_cores } => {
            if let Some(cores) = shared_cores {
                settings.shared_cores = cores;
            }
            settings.share_cpus = true;
            run_worker(settings, cancel.clone()).await?;
            return Ok(());
        }
        Command::Bench => {
            settings.validate(Role::Benchmark)?;
            let costs_path = config_path
                .parent()
                .map(|dir| dir.join(COSTS_FILE))
                .unwrap_or_else(|| PathBuf::from(COSTS_FILE));

            let mut coordinator = BatchCoordinator::new(settings, Role::Benchmark);
            let result = coordinator.run_benchmark(&costs_path).await?;
            println!("Performance index: {}", result.performance_index);
            println!("Per-file costs written to {}", costs_path.display());
            result.report
        }
    };

    cancel.cancel();
    println!("{report}");
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
}

async fn run_master(
    settings: Settings,
    selections: &[Selection],
    discovery_wait: u64,
    cancel: CancellationToken,
) -> anyhow::Result<BatchReport> {
    settings.validate(Role::Master)?;
    if settings.share_cpus {
        settings.validate(Role::Worker)?;
    }

    // 1. Discovery (multicast listener + expiry sweep):
    let discovery = Arc::new(DiscoveryService::new(
        &settings.network,
        settings.effective_shared_cores(),
        settings.performance_index,
    ));
    discovery.clone().start_listener(cancel.clone()).await?;
    discovery.clone().start_expiry(cancel.clone());

    // 2. Transfer listener for returning results:
    let (tracker, batches) = DispatchTracker::new();
    TransferReceiver::bind(any_addr(settings.network.transfer_port), &settings, tracker.clone())
        .await?
        .start(cancel.clone());

    // 3. Own share, when this machine works too:
    if settings.share_cpus {
        discovery.clone().start_broadcaster(cancel.clone());

        let mut worker = BatchCoordinator::new(settings.clone(), Role::Worker);
        let node = discovery.clone();
        let stop = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.run_worker(batches, Some(node), stop).await {
                tracing::error!("Local worker stopped: {}", e);
            }
        });
    }

    tracing::info!("Discovering nodes for {} seconds", discovery_wait);
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(Duration::from_secs(discovery_wait)) => {}
    }
    for node in discovery.roster.snapshot() {
        tracing::info!(
            "  - {} {} ({}) cores={} index={:?} {:?}",
            node.address,
            node.host,
            node.system,
            node.cores,
            node.performance_index,
            node.status
        );
    }

    // 4. Dispatch and wait:
    let mut coordinator = BatchCoordinator::new(settings, Role::Master);
    coordinator
        .run_master(selections, &discovery.roster, &tracker, cancel)
        .await
}

async fn run_worker(settings: Settings, cancel: CancellationToken) -> anyhow::Result<()> {
    settings.validate(Role::Worker)?;

    let discovery = Arc::new(DiscoveryService::new(
        &settings.network,
        settings.effective_shared_cores(),
        settings.performance_index,
    ));
    tracing::info!(
        "Node {} ({}) sharing {} cores",
        discovery.local_node.address,
        discovery.local_node.host,
        discovery.local_node.cores
    );
    discovery.clone().start_broadcaster(cancel.clone());

    let (tracker, batches) = DispatchTracker::new();
    TransferReceiver::bind(any_addr(settings.network.transfer_port), &settings, tracker)
        .await?
        .with_accept_tasks(true)
        .start(cancel.clone());

    tracing::info!("Press Ctrl+C to shutdown");
    let mut coordinator = BatchCoordinator::new(settings, Role::Worker);
    coordinator.run_worker(batches, Some(discovery), cancel).await
}
