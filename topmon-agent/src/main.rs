mod config_file;

use anyhow::Result;
use clap::Parser;
use config_file::JsonFileConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use topmon_core::{MetricCatalog, MonitorService, SysinfoProvider};
use tracing::info;

/// Self-hosted telemetry agent: runs the configured monitors and prints
/// every observer event as a JSON line on stdout. Stdin lines are fed
/// through the protocol stream tap; a leading `>` marks a line as
/// outbound traffic, everything else counts as received.
#[derive(Parser)]
#[command(name = "topmon-agent", version)]
struct Cli {
    /// Monitor configuration file (JSON map of id to spec)
    #[arg(short, long, default_value = "topmon.json")]
    config: PathBuf,

    /// Shell command execution timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let catalog = Arc::new(MetricCatalog::new(Box::new(SysinfoProvider::new())));
    let service = Arc::new(MonitorService::with_timeout(
        catalog,
        Box::new(JsonFileConfig::new(cli.config)),
        cli.timeout_secs,
    ));
    service.start().await?;

    let mut events = service.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                }
                // A burst we missed is fine; stdout is an observer, not a log.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let feeder = {
        let service = service.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match line.strip_prefix('>') {
                    Some(outbound) => service.on_line_about_to_send(outbound.trim()),
                    None => {
                        service.on_line_received(&line);
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    feeder.abort();
    service.shutdown();
    printer.abort();
    Ok(())
}
