//! Logging initialization.
//!
//! The default layer goes to stderr and is filtered to skip the `access`
//! target (those lines exist purely for the optional access log file).
//! `access`/`error`-targeted events are additionally duplicated, verbatim
//! and without ANSI styling, to the files named in the loaded `Config`.

use anyhow::{Context, Result};
use fragproxy_core::Config;
use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::{Args, LogFormat};

/// Initialize the global tracing subscriber from CLI flags and the loaded config.
pub fn init(args: &Args, config: &Config) -> Result<()> {
    let level = if args.quiet {
        Level::ERROR
    } else {
        match args.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let console_layer = match args.log_format {
        LogFormat::Text => fmt::layer()
            .with_target(args.verbose >= 2)
            .with_thread_ids(args.verbose >= 3)
            .with_file(args.verbose >= 3)
            .with_line_number(args.verbose >= 3)
            .boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    }
    .with_filter(filter_fn(|metadata| metadata.target() != "access"));

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let access_layer = config
        .log_access_file
        .as_ref()
        .map(|path| build_file_layer(path, "access"))
        .transpose()?;
    let error_layer = config
        .log_error_file
        .as_ref()
        .map(|path| build_file_layer(path, "error"))
        .transpose()?;

    registry.with(access_layer).with(error_layer).init();

    Ok(())
}

fn build_file_layer<S>(
    path: &std::path::Path,
    target: &'static str,
) -> Result<Box<dyn tracing_subscriber::Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file: {}", path.display()))?;

    let layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_level(false)
        .without_time()
        .with_writer(file)
        .with_filter(filter_fn(move |metadata| metadata.target() == target));

    Ok(layer.boxed())
}
