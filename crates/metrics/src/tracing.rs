use stowage_models::{LogFormat, StowageError};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub struct TracingService;

impl TracingService {
    /// Install the global subscriber. Logs go to stderr; stdout belongs to
    /// the container process.
    ///
    /// `RUST_LOG` wins over `level`. Each `verbose` step lowers the level
    /// once (debug, then trace).
    pub fn init(format: LogFormat, level: &str, verbose: u8) -> Result<(), StowageError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(Self::effective_level(level, verbose)))
            .map_err(|e| StowageError::ConfigError {
                reason: format!("invalid log level {:?}: {}", level, e),
            })?;

        let result = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_timer(UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_timer(UtcTime::rfc_3339())
                        .with_writer(std::io::stderr),
                )
                .try_init(),
        };

        result.map_err(|e| StowageError::InternalError {
            reason: format!("failed to initialise logging: {}", e),
        })
    }

    fn effective_level(level: &str, verbose: u8) -> String {
        match verbose {
            0 => level.to_string(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_lowers_level() {
        assert_eq!(TracingService::effective_level("warn", 0), "warn");
        assert_eq!(TracingService::effective_level("warn", 1), "debug");
        assert_eq!(TracingService::effective_level("warn", 3), "trace");
    }
}
