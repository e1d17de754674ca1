use crate::cli::Commands;
use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use stowage_invoker::{Invoker, RunOptions};
use stowage_metrics::MetricsService;
use stowage_models::{Config, ImageName, LogFormat, StowageError};
use stowage_packaging::{templates_for, write_templates, BuildOptions, PackagingService};
use tracing::{info, warn};

/// Exit code of a build stopped by Ctrl-C.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Run one subcommand and return the process exit code.
pub async fn execute(command: Commands, config: Config, metrics: &MetricsService) -> Result<i32> {
    match command {
        Commands::Build {
            file,
            tag,
            no_cache,
            context,
        } => build(&config, metrics, &context, file.as_deref(), tag, no_cache).await,
        Commands::Run {
            entrypoint,
            env,
            keep,
            image,
            args,
        } => {
            let options = RunOptions {
                entrypoint,
                args,
                env: parse_env(&env)?,
                keep,
                capture_output: false,
            };
            run(&config, metrics, &image, &options).await
        }
        Commands::Images => images(&config),
        Commands::Inspect { image } => {
            let service = PackagingService::new(config)?;
            let record = service.store().resolve_image(&image)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(0)
        }
        Commands::Rmi { image } => {
            let service = PackagingService::new(config)?;
            for line in service.store().remove_image(&image)? {
                println!("{}", line);
            }
            Ok(0)
        }
        Commands::Import { name, path } => import(&config, &name, &path),
        Commands::Prune { older_than } => {
            let service = PackagingService::new(config)?;
            let report = service.prune(older_than)?;
            println!(
                "Removed {} cache entries, {} layers, {} container directories",
                report.cache_entries, report.blobs, report.scratch_dirs
            );
            Ok(0)
        }
        Commands::Init {
            runtime,
            entry,
            dir,
        } => {
            let templates = templates_for(&runtime, &entry)?;
            let written = write_templates(&dir, &templates)?;
            for path in &written {
                println!("Created {}", path.display());
            }
            if written.is_empty() {
                println!("Nothing to do, all files already exist in {}", dir.display());
            }
            Ok(0)
        }
    }
}

async fn build(
    config: &Config,
    metrics: &MetricsService,
    context: &Path,
    recipe: Option<&Path>,
    tag: Option<ImageName>,
    no_cache: bool,
) -> Result<i32> {
    let service = PackagingService::new(config.clone())?;
    let options = BuildOptions { no_cache, tag };

    // Dropping the build future discards the working rootfs, so an
    // interrupted build leaves no image behind.
    let result = tokio::select! {
        result = service.build(context, recipe, &options) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Build interrupted");
            eprintln!("build interrupted");
            return Ok(INTERRUPTED_EXIT_CODE);
        }
    };

    match result {
        Ok(report) => {
            metrics.record_build(
                report.layers_built(),
                report.cache_hits(),
                report.duration.as_secs_f64(),
            );
            println!("Successfully built {}", report.image.short_id());
            if let Some(tag) = &report.tag {
                println!("Successfully tagged {}", tag);
            }
            Ok(0)
        }
        Err(e) => {
            if let Some(stage) = e.stage() {
                metrics.record_build_failure(stage.as_str());
            }
            Err(e.into())
        }
    }
}

async fn run(
    config: &Config,
    metrics: &MetricsService,
    image: &str,
    options: &RunOptions,
) -> Result<i32> {
    let service = PackagingService::new(config.clone())?;
    let invoker = Invoker::new(service.store().clone(), &config.launcher);
    match invoker.run(image, options).await {
        Ok(outcome) => {
            metrics.record_container_exit(outcome.code);
            Ok(outcome.code)
        }
        Err(e) => {
            metrics.record_container_exit(e.exit_code());
            Err(e.into())
        }
    }
}

fn images(config: &Config) -> Result<i32> {
    let service = PackagingService::new(config.clone())?;
    let now = Utc::now();
    println!("{:<32} {:<14} {:<16} {:>10}", "NAME", "IMAGE ID", "CREATED", "SIZE");
    for summary in service.store().list_images()? {
        let record = &summary.record;
        let age = now.signed_duration_since(record.created_at);
        let created = if age.num_days() > 0 {
            format!("{} days ago", age.num_days())
        } else if age.num_hours() > 0 {
            format!("{} hours ago", age.num_hours())
        } else {
            format!("{} minutes ago", age.num_minutes())
        };
        let size = format_size(record.config.total_size());
        let names = if summary.tags.is_empty() {
            vec!["<none>".to_string()]
        } else {
            summary.tags.clone()
        };
        for name in names {
            println!(
                "{:<32} {:<14} {:<16} {:>10}",
                name,
                record.short_id(),
                created,
                size
            );
        }
    }
    Ok(0)
}

fn import(config: &Config, name: &ImageName, path: &Path) -> Result<i32> {
    let service = PackagingService::new(config.clone())?;
    let base = service.import_base(name, path)?;
    info!("Imported {} from {}", name, base.source);
    println!("{} {}", name, base.layer.digest);
    Ok(0)
}

/// `K=V` pairs; a bare `K` takes the launcher's own value and is skipped
/// when unset.
fn parse_env(values: &[String]) -> Result<Vec<(String, String)>> {
    let mut env = Vec::new();
    for value in values {
        match value.split_once('=') {
            Some(("", _)) => {
                return Err(StowageError::ConfigError {
                    reason: format!("invalid environment variable {:?}", value),
                }
                .into())
            }
            Some((key, val)) => env.push((key.to_string(), val.to_string())),
            None => {
                if let Ok(val) = std::env::var(value) {
                    env.push((value.clone(), val));
                }
            }
        }
    }
    Ok(env)
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "kB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1000.0 && unit < UNITS.len() - 1 {
        size /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", size, UNITS[unit])
    }
}

/// Process exit code for an error that ended a command.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error
        .downcast_ref::<StowageError>()
        .map(StowageError::exit_code)
        .unwrap_or(1)
}

/// Apply command-line overrides on top of the loaded configuration.
pub fn load_config(
    path: Option<&Path>,
    store: Option<&Path>,
    log_format: Option<LogFormat>,
) -> Result<Config> {
    let mut config = Config::load(path)?;
    if let Some(store) = store {
        config = config.with_store_dir(store);
    }
    if let Some(format) = log_format {
        config.logging.format = format;
    }
    if config.store.dir.as_os_str().is_empty() {
        return Err(StowageError::ConfigError {
            reason: "store directory must not be empty".to_string(),
        }
        .into());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(
            env,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string())
            ]
        );
        assert!(parse_env(&["=oops".to_string()]).is_err());
        assert!(parse_env(&["STOWAGE_SURELY_UNSET_VARIABLE".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1_500), "1.5kB");
        assert_eq!(format_size(42_000_000), "42.0MB");
    }

    #[test]
    fn test_exit_code_for_errors() {
        let err: anyhow::Error = StowageError::EntrypointNotFound {
            program: "python".to_string(),
        }
        .into();
        assert_eq!(exit_code_for(&err), 127);
        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }
}
