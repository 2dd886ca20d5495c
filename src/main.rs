use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use vtc_indexer::block_scanner::BlockFileScanner;
use vtc_indexer::config::{self, Config};
use vtc_indexer::error::AppError;
use vtc_indexer::indexer::ChainIndexer;
use vtc_indexer::mempool::MempoolMonitor;
use vtc_indexer::network_type::NetworkType;
use vtc_indexer::reader::BlockReader;
use vtc_indexer::rpc::JsonRpcClient;
use vtc_indexer::shutdown::ShutdownManager;
use vtc_indexer::solver::{ScriptSolver, StandardSolver};
use vtc_indexer::storage::{KeyValueStore, MemoryStore, SledStore};

#[derive(Parser, Debug)]
#[command(name = "vtc-indexer")]
#[command(about = "Vertcoin block and mempool indexer", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(long)]
    testnet: bool,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    /// Directory holding the node's blkNNNNN.dat files
    #[arg(long)]
    blocks_dir: Option<String>,

    /// Node RPC endpoint, host or URL
    #[arg(long, env = "VERTCOIND_HOST")]
    rpc_url: Option<String>,

    /// Do not track unconfirmed transactions
    #[arg(long)]
    no_mempool: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let network_type = if args.testnet {
        NetworkType::Testnet
    } else if let Ok(cfg) = Config::load_from_file(&args.config) {
        cfg.node.network_type()
    } else {
        NetworkType::Mainnet
    };

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config, &network_type) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if args.testnet {
        config.node.network = "testnet".to_string();
    }
    if let Some(blocks_dir) = args.blocks_dir {
        config.blocks.blocks_dir = blocks_dir;
    }
    if let Some(rpc_url) = args.rpc_url {
        config.rpc.url = rpc_url;
    }
    if args.no_mempool {
        config.mempool.enabled = false;
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    if let Err(e) = run(config).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let network_type = config.node.network_type();
    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");

    tracing::info!("🚀 Vertcoin indexer v{} ({}, built {})", version, git_hash, build_date);
    tracing::info!("📡 Network: {}", network_type);
    tracing::info!("📂 Blocks: {}", config.blocks.blocks_dir);

    let store: Arc<dyn KeyValueStore> = match config.storage.backend.as_str() {
        "memory" => {
            tracing::warn!("⚠️  Using the in-memory store, the index is lost on exit");
            Arc::new(MemoryStore::new())
        }
        "sled" => {
            let path = Path::new(&config.storage.data_dir).join("index");
            tracing::info!("💾 Index database: {}", path.display());
            Arc::new(SledStore::open(path)?)
        }
        other => {
            return Err(AppError::Config(format!(
                "unknown storage backend {:?}",
                other
            )))
        }
    };
    let solver: Arc<dyn ScriptSolver> = Arc::new(StandardSolver::new(network_type));

    let mut shutdown_manager = ShutdownManager::new();

    let mempool = if config.mempool.enabled {
        let (user, password) = config.rpc.credentials();
        let rpc_url = config.rpc.full_url(&network_type);
        let rpc = JsonRpcClient::new(
            rpc_url.clone(),
            user,
            password,
            Duration::from_secs(config.rpc.timeout_secs),
        )
        .map_err(|e| AppError::Initialization(format!("RPC client for {}: {}", rpc_url, e)))?;
        tracing::info!("🔌 Node RPC: {}", rpc.url());

        let monitor = Arc::new(MempoolMonitor::new(
            store.clone(),
            solver.clone(),
            network_type,
            config.mempool.evict_after_missed_polls,
        ));
        let handle = tokio::spawn(monitor.clone().run(
            Arc::new(rpc),
            config.mempool.poll_interval(),
            shutdown_manager.token(),
        ));
        shutdown_manager.register_task(handle);
        Some(monitor)
    } else {
        tracing::info!("Mempool monitor disabled");
        None
    };

    let indexer = Arc::new(ChainIndexer::new(store.clone(), solver, mempool));
    let scanner = Arc::new(BlockFileScanner::new(
        BlockReader::new(&config.blocks.blocks_dir),
        indexer,
        network_type,
    ));

    let token = shutdown_manager.token();
    let rescan_interval = Duration::from_secs(config.blocks.rescan_interval_secs.max(1));
    shutdown_manager.register_task(tokio::spawn(async move {
        let mut interval = tokio::time::interval(rescan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("🛑 Block scanner shutting down gracefully");
                    break;
                }
                _ = interval.tick() => {
                    let pass = scanner.clone();
                    match tokio::task::spawn_blocking(move || pass.scan()).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::error!("❌ Block scan failed: {}", e),
                        Err(e) => tracing::error!("❌ Block scan task failed: {}", e),
                    }
                }
            }
        }
    }));

    shutdown_manager.wait_for_shutdown().await;

    store.flush()?;
    tracing::info!("✓ Index flushed, exiting");
    Ok(())
}

fn setup_logging(config: &config::LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let to_file = config.output == "file";
    let (writer, guard) = if to_file {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "indexer.log".to_string());
        let (non_blocking, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, prefix));
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stdout), None)
    };

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd && !to_file {
                // journald adds its own time stamps
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(!to_file)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    guard
}

/// UTC time stamp followed by the short host name.
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        // "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
