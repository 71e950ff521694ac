use crate::{build_env_filter, Tracer};
use tracing::level_filters::LevelFilter;

/// Tracer for tests, writing through the libtest capture.
///
/// Nothing is logged unless `RUST_LOG` or [`TestTracer::with_directives`] enables it.
#[derive(Debug, Clone, Default)]
pub struct TestTracer {
    directives: String,
}

impl TestTracer {
    /// Adds comma separated directives on top of `RUST_LOG`.
    pub fn with_directives(mut self, directives: impl Into<String>) -> Self {
        self.directives = directives.into();
        self
    }
}

impl Tracer for TestTracer {
    fn init(self) -> eyre::Result<()> {
        let filter = build_env_filter(&LevelFilter::OFF.to_string(), &self.directives)?;
        // another test of the same binary may have installed it already
        let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
        Ok(())
    }
}
