mod crawl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mneme_client::HttpTransport;
use mneme_core::{
    AlwaysRun, IntelligenceLevel, KnowledgeClient, KnowledgeConfig, KnowledgeTransport,
    MemoryTransport,
};

use crate::crawl::{CrawlOptions, JsonLinesSink, PageFetcher};

#[derive(Parser)]
#[command(name = "mneme", version, about = "Crawl smarter: skip what the knowledge service already knows")]
struct Cli {
    /// JSON config file (camelCase keys)
    #[arg(short, long, global = true, env = "MNEME_CONFIG")]
    config: Option<PathBuf>,

    /// Knowledge service base URL (overrides config and MNEME_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Recognition effort requested from the service
    #[arg(long, global = true)]
    intelligence: Option<IntelligenceLevel>,

    /// Use an in-process store instead of the knowledge service
    #[arg(long, global = true, default_value_t = false)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask whether the service knows one or more URLs
    Query {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Submit data for a URL
    Teach {
        url: String,

        /// JSON payload, e.g. '{"title": "Example"}'
        data: String,
    },

    /// Show service-side statistics
    Stats,

    /// Fetch pages, skipping the ones the service already knows
    Crawl {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Pages processed at once
        #[arg(short = 'j', long, default_value_t = 4)]
        concurrency: usize,

        /// Label attached to every request
        #[arg(short, long)]
        label: Option<String>,

        /// Run the handler for known pages too: true, false, or comma-separated labels
        #[arg(long)]
        always_run: Option<AlwaysRun>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("mneme=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if cli.offline {
        tracing::info!("Offline mode: using an in-process knowledge store");
        let client = KnowledgeClient::new(MemoryTransport::new(), config);
        run(cli.command, Arc::new(client)).await
    } else {
        let transport =
            HttpTransport::from_config(&config).context("Failed to create knowledge service client")?;
        tracing::debug!(base_url = transport.base_url(), "Using knowledge service");
        run(cli.command, Arc::new(KnowledgeClient::new(transport, config))).await
    }
}

/// Defaults, then the config file, then `MNEME_*` variables, then flags.
fn load_config(cli: &Cli) -> Result<KnowledgeConfig> {
    let config = match &cli.config {
        Some(path) => KnowledgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => KnowledgeConfig::default(),
    };
    let mut config = config
        .merge_env()
        .context("Invalid MNEME_* environment variable")?;

    if let Some(base_url) = &cli.base_url {
        config.base_url = base_url.clone();
    }
    if let Some(level) = cli.intelligence {
        config.intelligence_level = level;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run<T: KnowledgeTransport>(command: Commands, client: Arc<KnowledgeClient<T>>) -> Result<()> {
    match command {
        Commands::Query { urls } => cmd_query(&client, &urls).await,
        Commands::Teach { url, data } => cmd_teach(&client, &url, &data).await,
        Commands::Stats => cmd_stats(&client).await,
        Commands::Crawl {
            urls,
            concurrency,
            label,
            always_run,
        } => {
            let options = CrawlOptions {
                concurrency,
                label,
                always_run,
            };
            cmd_crawl(client, urls, options).await
        }
    }
}

async fn cmd_query<T: KnowledgeTransport>(client: &KnowledgeClient<T>, urls: &[String]) -> Result<()> {
    let results = client.query_bulk(urls).await;
    for url in urls {
        let result = &results[url];
        if result.fallback {
            tracing::warn!(%url, "Knowledge service unavailable, answer is a fallback");
        }
        println!("{}", serde_json::json!({ "url": url, "result": result }));
    }
    Ok(())
}

async fn cmd_teach<T: KnowledgeTransport>(
    client: &KnowledgeClient<T>,
    url: &str,
    data: &str,
) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("Teach data is not valid JSON")?;
    let response = client.teach(url, data).await;

    if !response.is_accepted() {
        tracing::warn!(%url, status = ?response.status, "Teach not accepted");
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn cmd_stats<T: KnowledgeTransport>(client: &KnowledgeClient<T>) -> Result<()> {
    let stats = client
        .stats()
        .await
        .context("Knowledge service unavailable")?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn cmd_crawl<T: KnowledgeTransport>(
    client: Arc<KnowledgeClient<T>>,
    urls: Vec<String>,
    options: CrawlOptions,
) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, stopping crawl");
                cancel.cancel();
            }
        }
    });

    let fetcher = PageFetcher::new().context("Failed to create HTTP client")?;
    let sink = Arc::new(JsonLinesSink::stdout());

    tracing::info!(pages = urls.len(), concurrency = options.concurrency, "Starting crawl");
    let report = crawl::run_crawl(Arc::clone(&client), fetcher, sink, urls, options, cancel).await;

    let usage = client.usage();
    let circuit = client.circuit_stats();
    tracing::info!(
        pages = report.total(),
        executed = report.executed,
        skipped = report.skipped,
        failed = report.failed,
        cancelled = report.cancelled,
        recognized = usage.recognized,
        learned = usage.learned,
        circuit = %circuit.state,
        "Crawl finished"
    );
    Ok(())
}
