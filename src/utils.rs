use indicatif::ProgressStyle;

/// Progress bar shown on the span of a whole pass.
pub(crate) fn get_style_run() -> Option<ProgressStyle> {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .ok()
        .map(|style| style.progress_chars("=>-"))
}

/// Spinner shown on the span of a single task.
pub(crate) fn get_style_task() -> Option<ProgressStyle> {
    ProgressStyle::with_template("  {spinner:.dim} {msg}").ok()
}

/// Installs a `tracing` subscriber printing to stderr above the progress bars.
///
/// The filter comes from `RUST_LOG` and defaults to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
