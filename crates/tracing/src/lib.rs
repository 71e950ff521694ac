//!  The `tracing` module provides functionalities for setting up and configuring logging.
//!
//!  The primary entry point is [`FbcTracer`], which installs a stdout layer in terminal or JSON
//!  format, filtered by a default directive plus optional extra directives (`RUST_LOG` syntax).
//!
//!  # Examples
//!
//!  ```
//!  use fbc_tracing::{FbcTracer, LayerInfo, LogFormat, Tracer};
//!
//!  fn main() -> eyre::Result<()> {
//!      let tracer = FbcTracer::new().with_stdout(LayerInfo::new(
//!          LogFormat::Json,
//!          "info".to_string(),
//!          "sync::controller=debug".to_string(),
//!          false,
//!      ));
//!
//!      tracer.init()?;
//!
//!      Ok(())
//!  }
//!  ```

// Re-export tracing crates
pub use tracing;
pub use tracing_subscriber;

pub use formatter::LogFormat;
pub use test_tracer::TestTracer;

mod formatter;
mod test_tracer;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

///  Tracer for application logging.
#[derive(Debug, Clone, Default)]
pub struct FbcTracer {
    stdout: LayerInfo,
}

impl FbcTracer {
    ///  Constructs a new `Tracer` with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    ///  Sets a custom configuration for the stdout layer.
    pub fn with_stdout(mut self, config: LayerInfo) -> Self {
        self.stdout = config;
        self
    }
}

///  Configuration for a logging layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    format: LogFormat,
    default_directive: String,
    filters: String,
    ansi: bool,
}

impl LayerInfo {
    ///  Constructs a new `LayerInfo`.
    ///
    ///  * `format` - Specifies the format for log messages.
    ///  * `default_directive` - Directive applied when `RUST_LOG` is not set.
    ///  * `filters` - Additional comma separated directives.
    ///  * `ansi` - Whether to emit ANSI colors.
    pub const fn new(
        format: LogFormat,
        default_directive: String,
        filters: String,
        ansi: bool,
    ) -> Self {
        Self { format, default_directive, filters, ansi }
    }
}

impl Default for LayerInfo {
    fn default() -> Self {
        Self {
            format: LogFormat::Terminal,
            default_directive: LevelFilter::INFO.to_string(),
            filters: String::new(),
            ansi: true,
        }
    }
}

/// Builds an [`EnvFilter`] from the default directive and the extra directives.
fn build_env_filter(default_directive: &str, directives: &str) -> eyre::Result<EnvFilter> {
    let default_directive: Directive = default_directive.parse()?;
    let mut filter =
        EnvFilter::builder().with_default_directive(default_directive).from_env_lossy();
    for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Trait defining a general interface for logging configuration.
pub trait Tracer {
    /// Initialize the logging configuration.
    fn init(self) -> eyre::Result<()>;
}

impl Tracer for FbcTracer {
    fn init(self) -> eyre::Result<()> {
        let filter = build_env_filter(&self.stdout.default_directive, &self.stdout.filters)?;
        let layer = self.stdout.format.apply(filter, self.stdout.ansi);

        // The error is returned if the global default subscriber is already set,
        // so it's safe to ignore it
        if let Err(err) = tracing_subscriber::registry().with(layer).try_init() {
            tracing::warn!(%err, "Tracing subscriber could not be initialized");
        }
        Ok(())
    }
}

/// Initializes a tracing subscriber for tests, filtered by `RUST_LOG`.
///
/// Fails silently if a subscriber is already installed.
pub fn init_test_tracing() {
    let _ = TestTracer::default().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_directives() {
        assert!(build_env_filter("info", "sync::controller=trace, net::peers=debug").is_ok());
        assert!(build_env_filter("info", "sync=notalevel").is_err());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("logfmt".parse::<LogFormat>().is_err());
    }
}
