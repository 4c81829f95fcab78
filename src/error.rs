//! Error types shared across the logbook components.

// System
use std::path::PathBuf;

// Third Party
use kube::error::ErrorResponse;

/// Errors raised while assembling the configuration snapshot.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised while obtaining an authenticated API client. Never retried.
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("auth.mode \"{0}\" not supported")]
    UnsupportedMode(String),

    #[error("in-cluster environment unavailable: {0}")]
    InCluster(#[source] kube::config::InClusterError),

    #[error("failed to load kubeconfig {path}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: kube::config::KubeconfigError,
    },

    #[error("no kubeconfig path given and no home directory to default to")]
    NoKubeconfig,

    #[error("failed to construct API client: {0}")]
    Client(#[source] kube::Error),
}

/// Errors raised by a record sink.
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    #[error("failed to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write record: {0}")]
    Write(#[from] std::io::Error),

    #[error("sink is closed")]
    Closed,
}

/// Errors that end a watch session. Transient failures never surface as a
/// `WatchError`; the session absorbs them and reconnects.
#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    #[error("failed to open event watch: {0}")]
    Connect(#[source] kube::Error),

    #[error("event stream failed: {0}")]
    Stream(#[source] kube::Error),

    #[error("event stream rejected by the API server ({}): {}", .0.code, .0.message)]
    Rejected(ErrorResponse),
}

/// Fatal errors of the bootstrap path. The entry point logs these and exits.
#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("error occurred while creating client: {0}")]
    Auth(#[from] AuthError),

    #[error("error occurred while opening log sink: {0}")]
    Sink(#[from] SinkError),

    #[error("error occurred while registering signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("error occurred while initializing event watcher: {0}")]
    Watch(#[from] WatchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_mode_display() {
        let err = AuthError::UnsupportedMode("bogus".to_string());
        assert_eq!(err.to_string(), "auth.mode \"bogus\" not supported");
    }

    #[test]
    fn test_rejected_display_carries_status() {
        let err = WatchError::Rejected(ErrorResponse {
            status: "Failure".to_string(),
            message: "events is forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        });
        assert_eq!(
            err.to_string(),
            "event stream rejected by the API server (403): events is forbidden"
        );
    }

    #[test]
    fn test_bootstrap_wraps_auth_error() {
        let err: BootstrapError = AuthError::UnsupportedMode("bogus".to_string()).into();
        assert!(matches!(err, BootstrapError::Auth(AuthError::UnsupportedMode(_))));
        assert!(err.to_string().contains("creating client"));
    }

    #[test]
    fn test_sink_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: SinkError = io_err.into();
        assert!(matches!(err, SinkError::Write(_)));
    }
}
