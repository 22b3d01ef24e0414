use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repobackup::config::LoggingConfig;
use repobackup::download::StageStatus;
use repobackup::upload::manifest;
use repobackup::{BackupEngine, BackupOptions, Config, DownloadSummary};

#[derive(Parser)]
#[command(name = "repobackup")]
#[command(about = "Incremental GitHub repository backup")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Never prompt; decline every confirmation
    #[arg(short = 'y', long = "yes", global = true)]
    non_interactive: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download changed repositories and push them to every destination
    Backup {
        /// Re-fetch every repository even if the local copy is current
        #[arg(long)]
        force_redownload: bool,

        /// Maximum concurrent downloads
        #[arg(long)]
        download_concurrency: Option<usize>,

        /// Maximum concurrent destinations and uploads per destination
        #[arg(long)]
        upload_concurrency: Option<usize>,

        /// Stop after the download phase
        #[arg(long)]
        skip_upload: bool,

        /// Remove staged data after a successful upload
        #[arg(long)]
        delete_data: bool,
    },

    /// Only bring the local staging area up to date
    Download {
        /// Re-fetch every repository even if the local copy is current
        #[arg(long)]
        force_redownload: bool,
    },

    /// List repositories that would be backed up
    List,

    /// Show configured destinations
    Destinations,

    /// Connect one destination, authenticating if needed
    Auth {
        /// Destination name from the config file
        name: String,
    },

    /// Remove staged data, keeping metadata markers
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting repobackup v{}", env!("CARGO_PKG_VERSION"));

    if cli.non_interactive {
        config.non_interactive = true;
    }

    match cli.command {
        Commands::Backup {
            force_redownload,
            download_concurrency,
            upload_concurrency,
            skip_upload,
            delete_data,
        } => {
            config.download.force_redownload |= force_redownload;
            config.cleanup.delete_data_after_upload |= delete_data;
            if let Some(n) = download_concurrency {
                config.download.concurrency = n;
            }
            if let Some(n) = upload_concurrency {
                config.upload.concurrency = n;
            }
            cmd_backup(config, skip_upload).await
        }
        Commands::Download { force_redownload } => {
            config.download.force_redownload |= force_redownload;
            cmd_download(config).await
        }
        Commands::List => cmd_list(config).await,
        Commands::Destinations => cmd_destinations(config),
        Commands::Auth { name } => cmd_auth(config, &name).await,
        Commands::Clean => cmd_clean(config).await,
    }
}

/// Initialize logging from the verbosity flag and configured level/format
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let default_level = if verbose { "debug" } else { logging.level.as_str() };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        "full" => registry.with(fmt::layer()).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&std::path::Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

async fn cmd_backup(config: Config, skip_upload: bool) -> Result<()> {
    let engine = BackupEngine::new(config);

    println!("🔄 Backing up repositories to {}", engine.config().storage_root().display());
    let summary = engine.run_backup(&BackupOptions { skip_upload }).await?;

    print_download(&summary.download);

    if let Some(upload) = &summary.upload {
        println!("\n☁️  Upload Complete!");
        for outcome in &upload.outcomes {
            println!(
                "   ✅ {}: {} repositories pushed ({} attempt(s))",
                outcome.name, outcome.pushed, outcome.attempts
            );
        }
    }

    if let Some(cleanup) = &summary.cleanup {
        println!("\n🧹 Cleaned {} staged directories", cleanup.directories);
    }

    println!("\n⏱️  Total duration: {:.2}s", summary.duration.as_secs_f64());
    Ok(())
}

async fn cmd_download(config: Config) -> Result<()> {
    let engine = BackupEngine::new(config);
    let summary = engine.download().await?;
    print_download(&summary);
    Ok(())
}

fn print_download(summary: &DownloadSummary) {
    println!("\n📥 Download Complete!");
    println!("   📊 Total repositories: {}", summary.repositories.len());
    println!("   📥 Fetched: {}", summary.fetched());
    println!("   ✅ Already current: {}", summary.current());
    println!("   ❌ Failed: {}", summary.failed());
    println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

    if summary.failed() > 0 {
        println!("\n🔍 Failed Downloads:");
        for repo in &summary.repositories {
            if let StageStatus::Failed(error) = &repo.status {
                println!("   ❌ {}: {}", repo.descriptor.full_name, error);
            }
        }
    }
}

async fn cmd_list(config: Config) -> Result<()> {
    let engine = BackupEngine::new(config);
    let repositories = engine.select_repositories().await?;

    println!("Repositories ({}):", repositories.len());
    for repo in repositories {
        let mut flags = Vec::new();
        if repo.is_private {
            flags.push("private");
        }
        if repo.archived {
            flags.push("archived");
        }

        println!(
            "  📁 {} 🕒 {}{}",
            repo.full_name,
            repo.updated_at.format("%Y-%m-%d"),
            if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            }
        );
    }
    Ok(())
}

fn cmd_destinations(config: Config) -> Result<()> {
    let engine = BackupEngine::new(config);
    let destinations = engine.destinations();

    if destinations.is_empty() {
        println!("No destinations configured.");
        return Ok(());
    }

    println!("📦 Destinations ({}):", destinations.len());
    for line in manifest(&destinations) {
        println!("   {}", line);
    }
    Ok(())
}

async fn cmd_auth(config: Config, name: &str) -> Result<()> {
    let engine = BackupEngine::new(config);
    engine.connect_destination(name).await?;
    println!("✅ Destination '{}' connected", name);
    Ok(())
}

async fn cmd_clean(config: Config) -> Result<()> {
    let engine = BackupEngine::new(config);
    let summary = engine.cleanup().await?;
    println!(
        "🧹 Cleaned {} staged directories ({} entries removed)",
        summary.directories, summary.removed
    );
    Ok(())
}
