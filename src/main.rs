use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use branchline::{config, db, server};

#[derive(Parser)]
#[command(
    name = "branchline",
    version,
    about = "Drift routing engine — topic-coherent conversation branches with provenance-tracked facts"
)]
struct Cli {
    /// Path to the config file (defaults to ~/.branchline/config.toml)
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP routing server
    Serve,
    /// Create the database and run pending migrations, then exit
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::BranchlineConfig::load_from(path)?,
        None => config::BranchlineConfig::load()?,
    };

    let filter =
        EnvFilter::try_new(&config.server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            server::serve(config).await?;
        }
        Command::InitDb => {
            let path = config.resolved_db_path();
            db::open_database(&path)?;
            tracing::info!(db = %path.display(), "database initialized");
        }
    }

    Ok(())
}
