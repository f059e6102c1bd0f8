//! Structured logging setup, driven by [`crate::config::LoggingConfig`].

use crate::config::LoggingConfig;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Once, OnceLock};
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Initializes the global tracing subscriber. Safe to call more than once
/// (from tests and `main` alike); only the first call takes effect.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

        let console_layer: Option<BoxedLayer<_>> = config.console.then(|| {
            if config.json {
                fmt::layer().json().boxed()
            } else {
                fmt::layer().boxed()
            }
        });

        let file_layer: Option<BoxedLayer<_>> =
            config.file_path.as_deref().and_then(build_file_layer);

        let registry = tracing_subscriber::registry().with(filter).with(console_layer).with(file_layer);
        let _ = registry.try_init();
    });
}

/// Builds the file-appender layer for `path`, creating its parent directory
/// if needed. Returns `None` (logging the failure) if the directory can't be
/// created; console logging still proceeds either way.
fn build_file_layer<S>(path: &str) -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let path = Path::new(path);
    let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    if let Err(err) = std::fs::create_dir_all(directory) {
        tracing::error!(
            directory = %directory.display(),
            "failed to create log directory, file logging disabled: {}",
            err
        );
        return None;
    }

    let file_name = path.file_name().unwrap_or_else(|| OsStr::new("presence.log"));
    let appender = tracing_appender::rolling::never(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // Keeping the guard alive for the process lifetime is what keeps the
    // background flush thread running; dropping it stops delivery silently.
    let _ = FILE_GUARD.set(guard);
    Some(fmt::layer().with_ansi(false).with_writer(writer).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_file_layer_creates_parent_directory() {
        let dir = std::env::temp_dir().join(format!("presence-logging-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let log_path = dir.join("nested").join("presence.log");

        let layer = build_file_layer::<tracing_subscriber::Registry>(log_path.to_str().unwrap());
        assert!(layer.is_some());
        assert!(log_path.parent().unwrap().is_dir());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
