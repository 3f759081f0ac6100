//! Kubeconfig resolution and client construction.

use std::path::{Path, PathBuf};

use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::error::{Error, Result};

/// Picks the kubeconfig file to load.
///
/// An explicit, non-empty path wins; otherwise `$HOME/.kube/config`.
///
/// # Errors
///
/// [`Error::NoHomeDir`] if no path is given and the home directory is unknown.
pub fn kubeconfig_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) if !path.as_os_str().is_empty() => Ok(path.to_path_buf()),
        _ => dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .ok_or(Error::NoHomeDir),
    }
}

/// Loads the kubeconfig and builds a client for its current context.
///
/// # Errors
///
/// [`Error::NoHomeDir`], [`Error::KubeconfigMissing`] or [`Error::Config`].
pub async fn connect(explicit: Option<&Path>) -> Result<Client> {
    let path = kubeconfig_path(explicit)?;

    if !path.exists() {
        return Err(Error::KubeconfigMissing(path));
    }

    tracing::debug!("loading kubeconfig {}", path.display());

    let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| Error::Config {
        path: path.clone(),
        source: e.into(),
    })?;

    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::Config {
            path: path.clone(),
            source: e.into(),
        })?;

    tracing::debug!("connecting to cluster at {}", config.cluster_url);
    Client::try_from(config).map_err(|e| Error::Config {
        path,
        source: e.into(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn explicit_path_wins() {
        let path = kubeconfig_path(Some(Path::new("/etc/kube/admin.conf"))).unwrap();
        assert_eq!(path, PathBuf::from("/etc/kube/admin.conf"));
    }

    #[test]
    fn empty_path_falls_back_to_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };

        let expected = home.join(".kube").join("config");
        assert_eq!(kubeconfig_path(Some(Path::new(""))).unwrap(), expected);
        assert_eq!(kubeconfig_path(None).unwrap(), expected);
    }

    #[tokio::test]
    async fn connect_missing_file() {
        let err = connect(Some(Path::new("/definitely/not/here/config")))
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            Error::KubeconfigMissing(p) if p == Path::new("/definitely/not/here/config")
        ));
    }

    #[tokio::test]
    async fn connect_unparseable_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "clusters: [not valid").unwrap();

        let err = connect(Some(file.path())).await.err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }
}
