use std::fmt::Display;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const ANSI_BLUE: Style = Style::new().blue();

/// Progress style for the run-level task bar.
pub(crate) fn get_style_run() -> Result<ProgressStyle, indicatif::style::TemplateError> {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map(|style| style.progress_chars("#>-"))
}

/// Installs a tracing subscriber with progress-bar aware output.
///
/// Optional; call it once from your binary if you want the engine's spans
/// and progress rendered on stderr. `RUST_LOG` overrides the default
/// `INFO` filter.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    let indicatif_layer = IndicatifLayer::new();

    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif_layer.get_stderr_writer())
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .with_target(false)
                .compact(),
        )
        .with(indicatif_layer)
        .with(filter)
        .try_init()
}

/// Formats the time elapsed since `s` as a dim annotation.
pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}
