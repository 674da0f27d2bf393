//! Audit Marketplace Worker Node Main Program
//!
//! Implements the complete node lifecycle:
//! 1. Load and validate configuration
//! 2. Open the local event pool database
//! 3. Verify and prefetch all configured analyzers
//! 4. Start the polling, processing, submission, price and sweep loops
//! 5. Shut down gracefully on Ctrl+C

use anyhow::{Context, Result};
use audit_node::analyzer::ReportAggregator;
use audit_node::config::{self, NodeConfig};
use audit_node::ledger::HttpLedgerClient;
use audit_node::node::AuditNode;
use audit_node::pool::EventPool;
use audit_node::store::SerializedStore;
use audit_node::upload::{HttpUploadProvider, NullUploadProvider, UploadProvider};
use audit_node::wrapper::AnalyzerWrapper;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Decentralized Audit Marketplace Worker Node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Ledger gateway URL (overrides config file)
    #[arg(long)]
    gateway: Option<String>,

    /// Node account address (overrides config file)
    #[arg(long)]
    account: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Initialize logging
    init_logging(&args.log_level)?;

    info!("Starting audit node v{}", env!("CARGO_PKG_VERSION"));

    // 2. Load configuration
    let mut config = load_configuration(&args.config)?;

    // Command line arguments override config file
    if let Some(gateway) = args.gateway {
        config.ledger_gateway_url = gateway;
    }
    if let Some(account) = args.account {
        config.account = account;
    }
    config::validate_config(&config).context("Invalid configuration")?;

    info!("   - Gateway: {}", config.ledger_gateway_url);
    info!("   - Account: {}", config.account);
    info!("   - Analyzers: {}", config.analyzers.len());
    info!("   - Police checks: {}", config.enable_police_checks);

    // 3. Assemble the node
    let node = build_node(&config).await?;

    // 4. Setup graceful shutdown handling
    setup_shutdown_handler(&node);

    // 5. Run until shutdown
    node.run().await.context("Node terminated with error")?;

    info!("Audit node shut down gracefully");
    Ok(())
}

/// Initialize logging system
fn init_logging(log_level: &str) -> Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => {
            eprintln!("Unknown log level: {}, using INFO", log_level);
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

/// Load configuration file
fn load_configuration(config_path: &Path) -> Result<NodeConfig> {
    info!("Loading configuration: {}", config_path.display());

    if !config_path.exists() {
        warn!("Configuration file does not exist, trying environment");
        return config::load_config_from_env().context("Failed to load configuration from env");
    }

    config::load_config(config_path).context("Failed to load configuration")
}

/// Wire all subsystems together and prefetch analyzers
async fn build_node(config: &NodeConfig) -> Result<AuditNode> {
    let store = Arc::new(
        SerializedStore::open(&config.db_path).context("Failed to open event pool database")?,
    );
    let pool = Arc::new(EventPool::new(store).context("Failed to initialize event pool")?);

    let ledger = Arc::new(
        HttpLedgerClient::new(
            &config.ledger_gateway_url,
            &config.account,
            Some(config.http_timeout_secs),
        )
        .context("Failed to build ledger client")?,
    );

    let storage_dir = PathBuf::from(&config.storage_dir);
    std::fs::create_dir_all(&storage_dir).context("Failed to create storage directory")?;

    let mut wrappers = Vec::with_capacity(config.analyzers.len());
    for analyzer in &config.analyzers {
        // Analyzers may override the shared storage directory
        let analyzer_storage = match &analyzer.storage_dir {
            Some(dir) => {
                let dir = PathBuf::from(dir);
                std::fs::create_dir_all(&dir).with_context(|| {
                    format!("Failed to create storage directory for {}", analyzer.name)
                })?;
                dir
            }
            None => storage_dir.clone(),
        };
        let wrapper = AnalyzerWrapper::new(
            &analyzer.name,
            Path::new(&analyzer.wrapper_home),
            &analyzer_storage,
            &analyzer.args,
            Duration::from_secs(analyzer.timeout_sec),
        )
        .with_context(|| format!("Analyzer {} failed validation", analyzer.name))?;
        if analyzer.prefetch {
            info!("Prefetching analyzer {}", analyzer.name);
            wrapper
                .prefetch()
                .await
                .with_context(|| format!("Analyzer {} prefetch failed", analyzer.name))?;
        }
        info!("   - analyzer {} ready", analyzer.name);
        wrappers.push(wrapper);
    }

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;
    let aggregator = Arc::new(ReportAggregator::new(
        wrappers,
        &storage_dir,
        http_client,
        &config.account,
    ));

    let upload: Arc<dyn UploadProvider> = if config.enable_report_upload {
        let url = config
            .report_upload_url
            .as_deref()
            .context("report_upload_url missing")?;
        Arc::new(
            HttpUploadProvider::new(url, &config.account, config.http_timeout_secs)
                .context("Failed to build upload provider")?,
        )
    } else {
        Arc::new(NullUploadProvider)
    };

    Ok(AuditNode::new(config.clone(), ledger, pool, aggregator, upload))
}

/// Setup graceful shutdown handler
fn setup_shutdown_handler(node: &AuditNode) {
    let node = node.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal, preparing to shutdown...");
                node.stop();
            }
            Err(err) => {
                error!("Cannot listen to shutdown signal: {}", err);
            }
        }
    });
}
