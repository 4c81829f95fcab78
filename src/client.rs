// System
use std::path::PathBuf;
use std::str::FromStr;

// Third Party
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::info;

// Local
use crate::config::AuthSettings;
use crate::error::AuthError;

/// How the process authenticates to the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// ServiceAccount credentials mounted into the pod.
    InCluster,
    /// A kubeconfig file on disk.
    OutOfCluster,
}

impl FromStr for AuthMode {
    type Err = AuthError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "in-cluster" => Ok(AuthMode::InCluster),
            "out-of-cluster" => Ok(AuthMode::OutOfCluster),
            other => Err(AuthError::UnsupportedMode(other.to_string())),
        }
    }
}

/// `$HOME/.kube/config`, used when no kubeconfig path is configured.
pub fn default_kubeconfig_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Resolve the client configuration for `auth`, without connecting.
pub async fn client_config(auth: &AuthSettings) -> Result<Config, AuthError> {
    match auth.mode.parse::<AuthMode>()? {
        AuthMode::InCluster => {
            info!("Logbook will start in in-cluster mode");
            Config::incluster().map_err(AuthError::InCluster)
        }
        AuthMode::OutOfCluster => {
            info!("Logbook will start in out-of-cluster mode");
            let path = match &auth.kubeconfig {
                Some(path) => path.clone(),
                None => {
                    info!("kubeconfig not provided, using kubeconfig file in default path");
                    default_kubeconfig_path().ok_or(AuthError::NoKubeconfig)?
                }
            };
            let kubeconfig =
                Kubeconfig::read_from(&path).map_err(|source| AuthError::Kubeconfig {
                    path: path.clone(),
                    source,
                })?;
            // Current context of the kubeconfig.
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|source| AuthError::Kubeconfig { path, source })
        }
    }
}

/// Obtain an authenticated API client handle.
pub async fn obtain_client(auth: &AuthSettings) -> Result<Client, AuthError> {
    let config = client_config(auth).await?;
    Client::try_from(config).map_err(AuthError::Client)
}

#[cfg(test)]
mod tests {
    // System
    use std::io::Write;

    // Local
    use super::*;

    fn auth(mode: &str, kubeconfig: Option<PathBuf>) -> AuthSettings {
        AuthSettings {
            mode: mode.to_string(),
            kubeconfig,
        }
    }

    const KUBECONFIG: &str = "
apiVersion: v1
kind: Config
current-context: test
clusters:
- name: test
  cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: test
  context:
    cluster: test
    user: test
    namespace: logging
users:
- name: test
  user:
    token: not-a-real-token
";

    #[test]
    fn test_parse_auth_modes() {
        assert_eq!("in-cluster".parse::<AuthMode>().unwrap(), AuthMode::InCluster);
        assert_eq!(
            "out-of-cluster".parse::<AuthMode>().unwrap(),
            AuthMode::OutOfCluster
        );
        assert!(matches!(
            "In-Cluster".parse::<AuthMode>(),
            Err(AuthError::UnsupportedMode(_))
        ));
    }

    #[tokio::test]
    async fn test_bogus_mode_fails_before_any_connection() {
        let result = obtain_client(&auth("bogus", None)).await;
        assert!(matches!(result, Err(AuthError::UnsupportedMode(mode)) if mode == "bogus"));
    }

    #[tokio::test]
    async fn test_missing_kubeconfig_fails_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let result = client_config(&auth("out-of-cluster", Some(path.clone()))).await;
        assert!(matches!(result, Err(AuthError::Kubeconfig { path: p, .. }) if p == path));
    }

    #[tokio::test]
    async fn test_kubeconfig_current_context_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(KUBECONFIG.as_bytes())
            .unwrap();
        let config = client_config(&auth("out-of-cluster", Some(path)))
            .await
            .unwrap();
        assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(6443));
        assert_eq!(config.default_namespace, "logging");
    }
}
