use anyhow::Result;
use clap::{Parser, Subcommand};
use inboxmeta_storage::MetadataStore;
use inboxmeta_sync::{InboxSync, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "inboxmeta")]
#[command(about = "Ingest inbox sender metadata and act on it")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one bounded ingestion against the configured mailbox.
    Sync,
    /// Print the senders with the most stored messages.
    TopSenders {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Move every stored message from SENDER to trash and forget it locally.
    DeleteSender { sender: String },
    /// Create the metadata table if it is missing.
    Migrate,
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        EnvFilter::new(level.to_lowercase())
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = inboxmeta_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} processed={} fetched={} inserted={} elapsed_s={:.2}",
                summary.run_id, summary.processed, summary.fetched, summary.inserted, summary.elapsed_s
            );
        }
        Commands::TopSenders { limit } => {
            let config = SyncConfig::from_env()?;
            let limit = limit.unwrap_or(config.top_senders_limit);
            let store = MetadataStore::open_initialized(config.database_path).await?;
            for row in store.top_senders(limit).await? {
                println!("{:>8}  {}", row.count, row.sender);
            }
        }
        Commands::DeleteSender { sender } => {
            let sync = InboxSync::from_config(SyncConfig::from_env()?).await?;
            let credential = sync.load_credential()?;
            let summary = sync.delete_sender(&credential, &sender).await?;
            println!(
                "deleted {} of {} stored messages from {} in {} chunk(s)",
                summary.deleted, summary.matched, summary.sender, summary.chunks
            );
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = MetadataStore::open_initialized(&config.database_path).await?;
            info!(db = %store.path().display(), rows = store.count().await?, "store ready");
            store.close().await;
        }
        Commands::Serve => {
            inboxmeta_web::serve_from_env().await?;
        }
    }

    Ok(())
}
