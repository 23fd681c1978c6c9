use std::{env, path::PathBuf, process::ExitCode, time::Instant};

use tracing::{error, info, Level};
use tracing_appender::rolling;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Registry,
};
use wirebit::{
    config::{Config, CONFIG_PATH},
    torrent::session,
};

const USAGE: &str = "usage: wirebit <torrent file> [destination file] [config.toml]";

#[tokio::main]
async fn main() -> ExitCode {
    // Rolling daily log file under "logs/".
    let file_appender = rolling::daily("logs", "wirebit.log");

    let terminal_layer = fmt::layer()
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(true);

    // No ANSI escapes in the file.
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_thread_names(true)
        .with_target(true)
        .with_span_events(FmtSpan::NONE)
        .with_ansi(false);

    let subscriber = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(terminal_layer)
        .with(file_layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install log subscriber: {}", e);
    }

    let mut args = env::args().skip(1);
    let Some(torrent_path) = args.next().map(PathBuf::from) else {
        eprintln!("{}", USAGE);
        return ExitCode::from(2);
    };
    let destination = args.next().map(PathBuf::from);
    let config_path = args.next().unwrap_or_else(|| CONFIG_PATH.to_string());

    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %config_path, error = %e, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    info!(torrent = %torrent_path.display(), "Starting wirebit");
    let start = Instant::now();

    match session::run(&config, &torrent_path, destination).await {
        Ok(summary) => {
            info!(
                completed = summary.completed,
                downloaded = summary.downloaded,
                uploaded = summary.uploaded,
                elapsed = ?start.elapsed(),
                "Session finished"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Session failed");
            ExitCode::FAILURE
        }
    }
}
