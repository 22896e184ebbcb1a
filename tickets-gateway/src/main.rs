use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use tickets::{
    CatalogStore, EngineConfig, FileCatalogPersistence, GatewayConfig, LoopbackConnectorConfig,
    LoopbackWebhookConnector, TicketGateway,
};

#[derive(Parser)]
#[command(name = "tickets-gateway")]
#[command(version)]
#[command(about = "Ticket fulfillment gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Serve(ServeArgs),
    /// Print the catalog and exit.
    Catalog(CatalogArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Keepalive + admin HTTP bind address.
    #[arg(long, env = "TICKETS_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    #[arg(long, env = "TICKETS_CONNECTOR_BIND_ADDR", default_value = "127.0.0.1:8090")]
    connector_bind_addr: String,

    #[arg(long, env = "TICKETS_CONNECTOR_SECRET")]
    connector_secret: String,

    /// Where outbound platform traffic is POSTed.
    #[arg(long, env = "TICKETS_OUTBOUND_URL")]
    outbound_url: Option<String>,

    #[arg(long, env = "TICKETS_ADMIN_TOKEN")]
    admin_token: String,

    #[arg(long, env = "TICKETS_CATALOG_FILE", default_value = "catalog.json")]
    catalog_file: PathBuf,

    /// Cooldown between ticket openings per requester, in hours.
    #[arg(long, env = "TICKETS_COOLDOWN_HOURS", default_value = "48")]
    cooldown_hours: u64,

    /// Idle minutes after which a ticket is reclaimed.
    #[arg(long, env = "TICKETS_INACTIVITY_MINUTES", default_value = "15")]
    inactivity_minutes: u64,

    /// Sweep period in seconds.
    #[arg(long, env = "TICKETS_SWEEP_INTERVAL_SECONDS", default_value = "60")]
    sweep_interval_seconds: u64,

    /// Bounded wait for a proof upload, in seconds.
    #[arg(long, env = "TICKETS_VERIFICATION_SECONDS", default_value = "120")]
    verification_seconds: u64,

    /// Minimum continuous membership before requesting, in hours.
    #[arg(long, env = "TICKETS_MIN_MEMBERSHIP_HOURS", default_value = "24")]
    min_membership_hours: u64,

    /// Maximum transcript lines retained per ticket.
    #[arg(long, env = "TICKETS_TRANSCRIPT_CAP", default_value = "500")]
    transcript_cap: usize,

    /// Channel transcripts are archived to.
    #[arg(long, env = "TICKETS_LOG_CHANNEL", default_value = "ticket-log")]
    log_channel: String,

    /// Link to the action requesters must complete before uploading proof.
    #[arg(long, env = "TICKETS_SUBSCRIPTION_URL")]
    subscription_url: String,

    /// Message text that opens a ticket from a shared channel.
    #[arg(long, env = "TICKETS_OPEN_TRIGGER", default_value = "ticket")]
    open_trigger: String,

    #[arg(long, env = "TICKETS_MIN_SEND_INTERVAL_MS", default_value = "250")]
    min_send_interval_ms: u64,
}

#[derive(Parser)]
struct CatalogArgs {
    #[arg(long, env = "TICKETS_CATALOG_FILE", default_value = "catalog.json")]
    catalog_file: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve(args) => serve_gateway(args).await,
        Commands::Catalog(args) => print_catalog(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn serve_gateway(args: ServeArgs) -> anyhow::Result<()> {
    let engine = EngineConfig {
        cooldown: Duration::from_secs(args.cooldown_hours * 3600),
        inactivity_threshold: Duration::from_secs(args.inactivity_minutes * 60),
        sweep_interval: Duration::from_secs(args.sweep_interval_seconds),
        verification_window: Duration::from_secs(args.verification_seconds),
        min_membership_age: Duration::from_secs(args.min_membership_hours * 3600),
        transcript_cap: args.transcript_cap,
        log_channel_id: args.log_channel,
        subscription_url: args.subscription_url,
        open_trigger: args.open_trigger,
    };
    engine.validate()?;

    let catalog = Arc::new(CatalogStore::open(Box::new(FileCatalogPersistence::new(
        &args.catalog_file,
    )))?);

    let connector = Arc::new(LoopbackWebhookConnector::new(LoopbackConnectorConfig {
        bind_addr: args.connector_bind_addr,
        shared_secret: args.connector_secret,
        outbound_url: args.outbound_url,
        min_send_interval_ms: args.min_send_interval_ms,
    }));

    let config = GatewayConfig {
        bind_addr: args.bind_addr,
        admin_token: args.admin_token,
        engine,
    };

    TicketGateway::start(config, catalog, connector)
        .await
        .map_err(anyhow::Error::from)
}

fn print_catalog(args: CatalogArgs) -> anyhow::Result<()> {
    let catalog = CatalogStore::open(Box::new(FileCatalogPersistence::new(&args.catalog_file)))?;
    for entry in catalog.list() {
        let configured = if entry.is_configured() { "" } else { " (link not configured)" };
        println!("{} -> {}{}", entry.key, entry.link, configured);
    }
    Ok(())
}
