//! content-anchor - binds content-addressed metadata to ledger records

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use content_anchor::anchor::{self, AnchorOrchestrator, RecordId, RetryPolicy};
use content_anchor::config::{LedgerArgs, LogFormat, LoggingArgs, ServeArgs};
use content_anchor::crypto::hash;
use content_anchor::server::{self, AppState};

#[derive(Parser)]
#[command(name = "content-anchor")]
#[command(about = "Anchor IPFS metadata references to evolvable ledger records")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve(ServeArgs),
    /// Print the commitment hash for a content reference
    Hash {
        /// Reference string, e.g. ipfs://bafy...
        reference: String,
    },
    /// Check a record's stored commitment against its reference
    Verify(VerifyArgs),
}

#[derive(Args)]
struct VerifyArgs {
    /// Decimal token id
    token_id: String,

    #[command(flatten)]
    ledger: LedgerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.logging);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Hash { reference } => {
            println!("{}", hash::bind(&reference));
            Ok(())
        }
        Commands::Verify(args) => verify(args).await,
    }
}

fn init_tracing(logging: &LoggingArgs) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("content_anchor={},tower_http=info", logging.log_level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    match logging.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let store = args.storage.build()?;
    let ledger = args.ledger.build()?;
    let config = args.anchor.orchestrator_config();

    info!("======================================");
    info!("  content-anchor");
    info!("======================================");
    info!("Listen: {}", args.server.listen);
    info!("Content store: {}", store.name());
    info!("Ledger: {}", ledger.name());
    info!("Confirmations: {}", config.confirmations);
    info!(
        "Confirmation timeout: {}s",
        config.confirmation_timeout.as_secs()
    );
    info!("Retry attempts: {}", config.retry.max_attempts);
    info!("======================================");

    let retention = config.retention;
    let orchestrator = Arc::new(AnchorOrchestrator::new(store, ledger, config));

    // Settled operations outlive their requests only for the retention window.
    let sweeper = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(retention.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            let evicted = sweeper.registry().evict_expired();
            if evicted > 0 {
                info!(evicted, "Evicted settled operations");
            }
        }
    });

    let state = AppState { orchestrator };
    server::serve(state, &args.server.listen, args.server.max_upload_bytes)
        .await
        .with_context(|| format!("server on {} failed", args.server.listen))
}

async fn verify(args: VerifyArgs) -> anyhow::Result<()> {
    args.ledger.validate()?;
    let record_id: RecordId = args.token_id.parse()?;
    let ledger = args.ledger.build()?;

    let verification = anchor::verify_record(ledger.as_ref(), &RetryPolicy::default(), record_id)
        .await
        .with_context(|| format!("reading token {record_id}"))?;

    println!("token:    {}", verification.record_id);
    println!("uri:      {}", verification.reference);
    println!("expected: {}", verification.expected);
    println!("on-chain: {}", verification.actual);

    if !verification.is_valid() {
        warn!(token_id = %record_id, "Commitment mismatch");
        anyhow::bail!("token {record_id} does not match its commitment");
    }
    println!("ok");
    Ok(())
}
