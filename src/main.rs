//! LedgerSync - Accounting Synchronization and Resilience Layer
//!
//! Main entry point for the ledgersync daemon and its operator commands.

use clap::{Parser, Subcommand};
use ledgersync::clock::system_clock;
use ledgersync::config::SyncConfig;
use ledgersync::model::{InvoiceId, Provider};
use ledgersync::orchestrator::{SyncDaemon, SyncService};
use ledgersync::provider::ProviderRegistry;
use ledgersync::store::{SharedStore, SqliteStore};
use ledgersync::webhook::{SharedSecretVerifier, SyncServer};
use std::process;
use std::sync::Arc;

/// LedgerSync - push invoices to accounting platforms, reliably
#[derive(Parser, Debug)]
#[command(name = "ledgersync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/ledgersync/config.yaml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync daemon and HTTP server
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        addr: Option<String>,
    },

    /// Enqueue a sync against a running instance
    Enqueue {
        /// Invoice ID
        invoice: String,

        /// Provider code (quickbooks, xero)
        provider: String,

        /// Enqueue at high priority (manual retry)
        #[arg(long)]
        high: bool,

        /// Base URL of the running instance
        #[arg(long, default_value = "http://127.0.0.1:8086")]
        url: String,
    },

    /// Query sync status from a running instance
    Status {
        /// Invoice ID
        invoice: String,

        /// Base URL of the running instance
        #[arg(long, default_value = "http://127.0.0.1:8086")]
        url: String,
    },

    /// Validate the configuration file and exit
    CheckConfig,
}

fn load_config(cli: &Cli) -> ledgersync::Result<SyncConfig> {
    match &cli.config {
        Some(path) => SyncConfig::load(path),
        None => {
            let path = SyncConfig::default_path();
            if path.exists() {
                SyncConfig::load(path)
            } else {
                Ok(SyncConfig::default())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = ledgersync::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> ledgersync::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Serve { addr } => serve(config, addr).await,
        Commands::Enqueue {
            invoice,
            provider,
            high,
            url,
        } => enqueue(invoice, provider, high, url).await,
        Commands::Status { invoice, url } => status(invoice, url).await,
        Commands::CheckConfig => {
            config.validate()?;
            println!(
                "Configuration OK: {} provider(s), {} sync worker(s)",
                config.providers.len(),
                config.workers.sync_workers
            );
            Ok(())
        }
    }
}

async fn serve(config: SyncConfig, addr_override: Option<String>) -> ledgersync::Result<()> {
    let addr = addr_override.unwrap_or_else(|| config.server.addr.clone());

    let store: SharedStore = Arc::new(SqliteStore::open(&config.database)?);
    let providers = ProviderRegistry::from_config(&config)?;
    let verifier = Arc::new(SharedSecretVerifier::from_config(&config));

    let service = Arc::new(SyncService::new(
        config,
        store,
        providers,
        system_clock(),
    ));

    let server = SyncServer::new(service.clone(), verifier);
    let server_handle = tokio::spawn(async move { server.run(&addr).await });

    let mut daemon = SyncDaemon::new(service);
    daemon.run().await?;

    server_handle.abort();
    Ok(())
}

async fn enqueue(
    invoice: String,
    provider: String,
    high: bool,
    url: String,
) -> ledgersync::Result<()> {
    // Validate locally before the round trip
    let provider: Provider = provider.parse()?;
    let invoice_id = InvoiceId::new(invoice);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/sync", url.trim_end_matches('/')))
        .json(&serde_json::json!({
            "invoice_id": invoice_id.as_str(),
            "provider": provider.code(),
            "priority": if high { "high" } else { "normal" },
        }))
        .send()
        .await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if status.is_success() {
        println!("Enqueued: job {}", body["job_id"].as_str().unwrap_or("?"));
        Ok(())
    } else {
        Err(ledgersync::SyncError::Other(format!(
            "HTTP {}: {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        )))
    }
}

async fn status(invoice: String, url: String) -> ledgersync::Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/sync/{}", url.trim_end_matches('/'), invoice))
        .send()
        .await?;

    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if status.is_success() {
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    } else {
        Err(ledgersync::SyncError::Other(format!(
            "HTTP {}: {}",
            status,
            body["error"].as_str().unwrap_or("unknown error")
        )))
    }
}
