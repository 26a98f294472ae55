//! Tracing subscriber setup from the `logging` config section.

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use voxbus_core::config::LoggingConfig;

/// Build the filter. `RUST_LOG` wins over config; `-v` raises the base level to debug.
fn build_filter(config: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    let directives = std::iter::once(level.to_string())
        .chain(config.filters.iter().cloned())
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Invalid log filter {directives:?}: {e}; falling back to info");
        EnvFilter::new("info")
    })
}

pub fn init(config: &LoggingConfig, verbose: bool) {
    let to_stdout = config.output == "stdout";
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match (config.format.as_str(), to_stdout) {
        ("json", true) => fmt::layer().json().with_writer(std::io::stdout).boxed(),
        ("json", false) => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        (_, true) => fmt::layer().with_writer(std::io::stdout).boxed(),
        (_, false) => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(build_filter(config, verbose))
        .try_init();
}
