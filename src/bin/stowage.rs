use clap::Parser;
use stowage::commands::{exit_code_for, load_config};
use stowage::{execute, Cli};
use stowage_metrics::{MetricsService, TracingService};
use tracing::{debug, error};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.config.as_deref(), cli.store.as_deref(), cli.log_format)?;
    TracingService::init(config.logging.format, &config.logging.level, cli.verbose)?;
    debug!("Configuration loaded: {:?}", config);

    let metrics = MetricsService::new()?;
    let result = execute(cli.command, config, &metrics).await;

    if let Some(path) = &cli.metrics_file {
        if let Err(e) = metrics.write_to(path) {
            error!("Failed to write metrics to {}: {}", path.display(), e);
        }
    }
    result
}
