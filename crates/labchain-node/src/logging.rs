use crate::config::LoggingConfig;
use std::fs::File;
use std::path::Path;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Level after applying `-v` flags on top of the configured one.
pub fn effective_level(config: &LoggingConfig, cli_verbose: u8) -> &str {
    match cli_verbose {
        0 => &config.level,
        1 => "debug",
        _ => "trace",
    }
}

/// Filter from `RUST_LOG`, or `labchain=<level>` plus module directives.
pub fn build_filter(config: &LoggingConfig, cli_verbose: u8) -> anyhow::Result<EnvFilter> {
    let level = effective_level(config, cli_verbose);
    let mut filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| format!("labchain={}", level)),
    );
    for (module, level) in &config.module_filters {
        filter = filter.add_directive(format!("{}={}", module, level).parse()?);
    }
    Ok(filter)
}

/// Initialize the global subscriber based on configuration
pub fn init_logging(config: &LoggingConfig, cli_verbose: u8) -> anyhow::Result<()> {
    let log_level = effective_level(config, cli_verbose);
    let filter = build_filter(config, cli_verbose)?;
    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => {
            let json_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true);

            if let Some(file_path) = &config.file_output {
                let file_layer = fmt::layer()
                    .json()
                    .with_writer(open_log_file(file_path)?)
                    .with_ansi(false);
                subscriber.with(json_layer).with(file_layer).try_init()?;
            } else {
                subscriber.with(json_layer).try_init()?;
            }
        }
        "compact" => {
            let compact_layer = fmt::layer()
                .compact()
                .with_target(false)
                .with_line_number(false)
                .with_file(false);

            if let Some(file_path) = &config.file_output {
                let file_layer = fmt::layer()
                    .compact()
                    .with_writer(open_log_file(file_path)?)
                    .with_ansi(false);
                subscriber.with(compact_layer).with(file_layer).try_init()?;
            } else {
                subscriber.with(compact_layer).try_init()?;
            }
        }
        _ => {
            // Source locations only at debug and below
            let show_location = matches!(log_level, "debug" | "trace");

            let pretty_layer = fmt::layer()
                .with_target(show_location)
                .with_line_number(show_location)
                .with_file(show_location);

            if let Some(file_path) = &config.file_output {
                let file_layer = fmt::layer()
                    .with_writer(open_log_file(file_path)?)
                    .with_ansi(false);
                subscriber.with(pretty_layer).with(file_layer).try_init()?;
            } else {
                subscriber.with(pretty_layer).try_init()?;
            }
        }
    }

    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?)
}
