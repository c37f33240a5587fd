use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the global subscriber. `RUST_LOG` takes precedence; otherwise
/// `debug` selects between `debug` and `info`.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    install_console(filter);
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn install_console(filter: EnvFilter) {
    let fmt_layer = fmt::layer();
    if std::env::var("PEERKIT_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("PEERKIT_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("PEERKIT_LOG_PREFIX").unwrap_or_else(|_| "peerkit".into());
        let rotation = std::env::var("PEERKIT_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            eprintln!("warning: failed to create log directory {dir}");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
            "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
            _ => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let file_filter = filter.to_string();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(EnvFilter::new(file_filter));
        let _ = tracing_subscriber::registry()
            .with(fmt_layer.with_filter(filter))
            .with(file_layer)
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(fmt_layer.with_filter(filter))
            .try_init();
    }
}
