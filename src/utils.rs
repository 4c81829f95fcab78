// Third Party
use kube::error::ErrorResponse;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// Local
use crate::sink::RecordFormat;

/// Install the diagnostics subscriber on stderr. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: LevelFilter, format: RecordFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A subscriber may already be installed (tests, embedding); keep it.
    let _ = match format {
        RecordFormat::Json => builder.json().try_init(),
        RecordFormat::Text => builder.try_init(),
    };
}

/// Convenience function for generating a `kube::Error::Api` carrying an API status.
pub fn status_error(code: u16, reason: &str, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    })
}
