use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::fs;
use std::path::Path;
use stowage_models::StowageError;
use tracing::{debug, instrument};

fn internal(e: impl std::fmt::Display) -> StowageError {
    StowageError::InternalError {
        reason: e.to_string(),
    }
}

/// Counters for one CLI invocation, exported in the Prometheus text format.
pub struct MetricsService {
    registry: Registry,
    builds_total: IntCounter,
    layers_built_total: IntCounter,
    cache_hits_total: IntCounter,
    build_failures_total: IntCounterVec,
    container_exits_total: IntCounterVec,
    build_duration_seconds: Histogram,
}

impl MetricsService {
    pub fn new() -> Result<Self, StowageError> {
        let registry = Registry::new();

        let builds_total =
            IntCounter::new("stowage_builds_total", "Completed image builds").map_err(internal)?;
        let layers_built_total =
            IntCounter::new("stowage_layers_built_total", "Layers packed and stored")
                .map_err(internal)?;
        let cache_hits_total =
            IntCounter::new("stowage_cache_hits_total", "Build steps served from the layer cache")
                .map_err(internal)?;
        let build_failures_total = IntCounterVec::new(
            Opts::new("stowage_build_failures_total", "Failed builds by stage"),
            &["stage"],
        )
        .map_err(internal)?;
        let container_exits_total = IntCounterVec::new(
            Opts::new("stowage_container_exits_total", "Container exits by exit code"),
            &["code"],
        )
        .map_err(internal)?;
        let build_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("stowage_build_duration_seconds", "Wall time of successful builds")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )
        .map_err(internal)?;

        registry
            .register(Box::new(builds_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(layers_built_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(cache_hits_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(build_failures_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(container_exits_total.clone()))
            .map_err(internal)?;
        registry
            .register(Box::new(build_duration_seconds.clone()))
            .map_err(internal)?;

        Ok(Self {
            registry,
            builds_total,
            layers_built_total,
            cache_hits_total,
            build_failures_total,
            container_exits_total,
            build_duration_seconds,
        })
    }

    /// A successful build.
    pub fn record_build(&self, layers_built: usize, cache_hits: usize, duration_secs: f64) {
        self.builds_total.inc();
        self.layers_built_total.inc_by(layers_built as u64);
        self.cache_hits_total.inc_by(cache_hits as u64);
        self.build_duration_seconds.observe(duration_secs);
        debug!(layers_built, cache_hits, duration_secs, "Recorded build");
    }

    pub fn record_build_failure(&self, stage: &str) {
        self.build_failures_total.with_label_values(&[stage]).inc();
    }

    pub fn record_container_exit(&self, code: i32) {
        let code = code.to_string();
        self.container_exits_total
            .with_label_values(&[code.as_str()])
            .inc();
    }

    pub fn render(&self) -> Result<String, StowageError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(internal)?;
        String::from_utf8(buffer).map_err(internal)
    }

    /// Write the text exposition format to `path`, replacing it.
    #[instrument(skip(self))]
    pub fn write_to(&self, path: &Path) -> Result<(), StowageError> {
        fs::write(path, self.render()?).map_err(StowageError::storage)
    }
}
