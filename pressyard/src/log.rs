use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

const LOG_FILE_PREFIX: &str = "pressyard";

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

pub fn init(path: &Utf8Path, filtering_directives: Option<&str>) -> anyhow::Result<LoggerGuard> {
    let (folder, prefix) = if path.is_dir() {
        (path, LOG_FILE_PREFIX)
    } else {
        (
            path.parent().context("invalid log path (parent)")?,
            path.file_name().context("invalid log path (file_name)")?,
        )
    };

    let file_appender = rolling::daily(folder, prefix);
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter =
        EnvFilter::try_new(filtering_directives.unwrap_or("info")).context("invalid log filtering directives")?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .init();

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}
