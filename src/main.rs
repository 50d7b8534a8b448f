// ============================================================================
// PERFSTORE BINARY
// ============================================================================

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use perfstore::engine::{ChainFilters, Engine, EngineStats};
use perfstore::logging::init_logging;
use perfstore::storage::{IndexQuery, StorageReader};
use perfstore::stream::{StreamContext, StreamSettings};
use perfstore::{BufferPool, Record, StoreConfig, STORE_FULL_NAME, STORE_VERSION};

// ----------------------------------------------------------------------------
// CLI Definition
// ----------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "perfstore", version, about = "APM record ingestion and storage engine")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "perfstore.toml", env = "PERFSTORE_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "PERFSTORE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "PERFSTORE_DEBUG")]
    pub debug: bool,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the engine and the agent listener
    Run,

    /// Import records from a JSON-lines file into a new storage
    Ingest {
        /// File with one JSON record per line
        file: PathBuf,

        /// Keep records of these agents only
        #[arg(short, long)]
        platform: Vec<i64>,

        /// Drop records older than this timestamp (ms)
        #[arg(long, requires = "to")]
        from: Option<i64>,

        /// Drop records newer than this timestamp (ms)
        #[arg(long, requires = "from")]
        to: Option<i64>,
    },

    /// Print the records of a closed storage as JSON lines
    Dump {
        /// Storage folder
        storage: PathBuf,

        /// Only records of this agent
        #[arg(short, long)]
        platform: Option<i64>,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Subcommand Handlers
// ----------------------------------------------------------------------------

fn handle_validate(path: &Path, verbose: bool) -> AnyhowResult<()> {
    let config = StoreConfig::load(path).with_context(|| format!("Invalid configuration in {}", path.display()))?;
    println!("✅ Configuration is valid: {}", path.display());
    if verbose {
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config_str = StoreConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

fn handle_version() {
    println!("{} v{}", STORE_FULL_NAME, STORE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
}

async fn handle_run(config: StoreConfig) -> AnyhowResult<()> {
    let engine = Arc::new(Engine::new(config).context("Failed to create engine")?);
    let address = engine.start_listener().context("Failed to start agent listener")?;
    info!(target: "perfstore::main", address = %address, "Accepting agent connections");

    let index = Arc::clone(&engine).run().await?;
    if let Some(index) = index {
        info!(
            target: "perfstore::main",
            records = index.len(),
            storage = ?engine.storage_folder(),
            "Storage closed"
        );
    }
    print_stats(&engine.stats());
    Ok(())
}

fn handle_ingest(config: StoreConfig, file: &Path, filters: ChainFilters) -> AnyhowResult<()> {
    let input = File::open(file).with_context(|| format!("Failed to open {}", file.display()))?;
    let engine = Engine::with_filters(config, filters).context("Failed to create engine")?;
    engine.start()?;

    let mut malformed = 0u64;
    for (line_no, line) in BufReader::new(input).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(&line) {
            Ok(record) => {
                engine.submit(record);
            }
            Err(e) => {
                malformed += 1;
                warn!(target: "perfstore::main", line = line_no + 1, error = %e, "Skipping malformed record");
            }
        }
    }

    let index = engine.shutdown()?;
    let stats = engine.stats();
    print_stats(&stats);
    if malformed > 0 {
        println!("  • Malformed lines: {}", malformed);
    }
    if let (Some(index), Some(folder)) = (index, engine.storage_folder()) {
        println!("✅ {} records indexed in {}", index.len(), folder.display());
    }
    Ok(())
}

fn handle_dump(config: &StoreConfig, storage: &Path, platform: Option<i64>, output: Option<&Path>) -> AnyhowResult<()> {
    let io_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.storage.io_threads)
        .thread_name(|i| format!("perfstore-read-{i}"))
        .build()?;
    let ctx = StreamContext::new(
        Arc::new(BufferPool::from_config(&config.buffers)),
        Arc::new(io_pool),
        StreamSettings::from_config(&config.streams),
    );

    let reader = StorageReader::open(ctx, storage, config.ingest.max_record_size)
        .with_context(|| format!("Failed to open storage {}", storage.display()))?;
    let records = match platform {
        Some(platform) => reader.read_matching(&IndexQuery {
            platform_ident: Some(platform),
            ..Default::default()
        })?,
        None => reader.read_all()?,
    };

    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    for record in &records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;

    info!(
        target: "perfstore::main",
        storage = %reader.storage().name,
        records = records.len(),
        "Storage dumped"
    );
    Ok(())
}

fn print_stats(stats: &EngineStats) {
    println!("Engine statistics:");
    println!("  • Uptime: {:.1}s", stats.uptime.as_secs_f64());
    println!(
        "  • Records: {} accepted, {} rejected",
        stats.ingest.accepted, stats.ingest.rejected
    );
    println!(
        "  • Writes: {} committed, {} failed, {} bytes",
        stats.writer.committed, stats.writer.failed, stats.writer.bytes_written
    );
    println!(
        "  • Buffers: {} allocated, {} in use, {:.0}% reused",
        stats.pool.allocated,
        stats.pool.in_use,
        stats.pool.reuse_ratio() * 100.0
    );
    if let Some(live) = &stats.live {
        println!(
            "  • Live aggregates: {} persisted, {} dropped",
            live.persisted, live.dropped
        );
    }
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.as_deref());
        }
        Some(Commands::Validate { verbose }) => {
            return handle_validate(&cli.config, *verbose);
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        StoreConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        StoreConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    let _log_guard = init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!(target: "perfstore::main", path = %cli.config.display(), "Config file not found, using defaults");
    }
    info!(target: "perfstore::main", "{} v{}", STORE_FULL_NAME, STORE_VERSION);

    match cli.command {
        Some(Commands::Ingest {
            file,
            platform,
            from,
            to,
        }) => {
            let filters = ChainFilters {
                platforms: (!platform.is_empty()).then_some(platform),
                time_frame: from.zip(to),
            };
            tokio::task::spawn_blocking(move || handle_ingest(config, &file, filters)).await??;
        }
        Some(Commands::Dump {
            storage,
            platform,
            output,
        }) => {
            tokio::task::spawn_blocking(move || handle_dump(&config, &storage, platform, output.as_deref()))
                .await??;
        }
        Some(Commands::Run) | None => handle_run(config).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}
