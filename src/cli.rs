use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stowage_models::{ImageName, LogFormat};

#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Build layered images from a Dockerfile and run them without a daemon")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (default: ./stowage.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Image store directory
    #[arg(long, global = true)]
    pub store: Option<PathBuf>,

    #[arg(long, global = true, value_parser = parse_log_format)]
    pub log_format: Option<LogFormat>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Write Prometheus metrics for this invocation to FILE
    #[arg(long, global = true, value_name = "FILE")]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build an image from a recipe
    Build {
        /// Recipe path (default: <CONTEXT>/Dockerfile)
        #[arg(short = 'f', long = "file")]
        file: Option<PathBuf>,

        /// Name and optionally tag the image (name:tag)
        #[arg(short, long)]
        tag: Option<ImageName>,

        /// Rebuild every layer
        #[arg(long)]
        no_cache: bool,

        /// Build context directory
        #[arg(default_value = ".")]
        context: PathBuf,
    },

    /// Run an image's command in a fresh container
    Run {
        /// Replace the image entrypoint
        #[arg(long)]
        entrypoint: Option<String>,

        /// Set an environment variable (K=V, or K to pass the host value)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Keep the container filesystem after exit
        #[arg(long)]
        keep: bool,

        image: String,

        /// Arguments replacing the image CMD
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List images
    Images,

    /// Show an image record as JSON
    Inspect { image: String },

    /// Remove an image or tag
    Rmi { image: String },

    /// Register a base image from a directory or tar archive
    Import { name: ImageName, path: PathBuf },

    /// Drop stale cache entries, unreferenced layers and leftover containers
    Prune {
        /// Cache entries unused for this many days are dropped
        #[arg(long, default_value = "7")]
        older_than: u64,
    },

    /// Write a starter recipe, manifest and entry script
    Init {
        #[arg(long, default_value = "python")]
        runtime: String,

        #[arg(long, default_value = "bot.py")]
        entry: String,

        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    match value {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        other => Err(format!("unknown log format {:?} (expected pretty or json)", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_collects_trailing_args() {
        let cli = Cli::parse_from([
            "stowage", "--store", "/tmp/s", "run", "-e", "A=1", "bot:dev", "--", "--flag", "x",
        ]);
        match cli.command {
            Commands::Run {
                env, image, args, ..
            } => {
                assert_eq!(env, vec!["A=1"]);
                assert_eq!(image, "bot:dev");
                assert_eq!(args, vec!["--flag", "x"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn test_build_flags() {
        let cli = Cli::parse_from(["stowage", "build", "-t", "bot:dev", "--no-cache", "app", "-vv"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Build {
                tag,
                no_cache,
                context,
                file,
            } => {
                assert_eq!(tag.map(|t| t.to_string()), Some("bot:dev".to_string()));
                assert!(no_cache);
                assert_eq!(context, PathBuf::from("app"));
                assert_eq!(file, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_invalid_tag_and_log_format_are_usage_errors() {
        assert!(Cli::try_parse_from(["stowage", "build", "-t", "Bad Name"]).is_err());
        assert!(Cli::try_parse_from(["stowage", "--log-format", "xml", "images"]).is_err());
    }
}
