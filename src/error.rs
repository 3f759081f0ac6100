//! Error taxonomy for service resolution and tunnel lifecycle failures.

use std::path::PathBuf;
use std::time::Duration;

use crate::resolve::PodPhase;

/// Boxed error used for failures reported by external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for port-forward operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while resolving a service or running its tunnel.
///
/// Every stage fails fast and returns the first error it meets; nothing here is
/// retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No kubeconfig path was given and no home directory is available.
    #[error("no kubeconfig file specified and home directory could not be determined")]
    NoHomeDir,

    /// The kubeconfig file does not exist.
    #[error("kubeconfig file {} does not exist", .0.display())]
    KubeconfigMissing(PathBuf),

    /// The kubeconfig could not be read or turned into a client.
    #[error("can't load kubeconfig {}: {source}", .path.display())]
    Config {
        /// Path of the kubeconfig being loaded.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// A required request field was empty.
    #[error("{0} must not be empty")]
    MissingField(&'static str),

    /// Transport or authorization failure talking to the cluster API.
    #[error("cluster API error: {0}")]
    Api(#[source] BoxError),

    /// The service does not exist.
    #[error("service {namespace}/{name} not found")]
    NotFound {
        /// Namespace that was searched.
        namespace: String,
        /// Requested service name.
        name: String,
    },

    /// The service has an empty selector, so it has no backing pods.
    #[error("service {namespace}/{name} has no selector")]
    NoSelector {
        /// Service namespace.
        namespace: String,
        /// Service name.
        name: String,
    },

    /// Listing pods for the selector failed.
    #[error("no pods found for {selector}: {source}")]
    NoPodsFound {
        /// Label selector used for the listing.
        selector: String,
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// The selector matched no pods.
    #[error("no pods returned for service {namespace}/{name}")]
    NoBackingPods {
        /// Service namespace.
        namespace: String,
        /// Service name.
        name: String,
    },

    /// No running pod exposes the requested port.
    #[error("no ready pod found for port {remote_port}{}", phase_suffix(.last_phase))]
    NoReadyPod {
        /// Requested remote port.
        remote_port: u16,
        /// Last non-running phase observed, if any.
        last_phase: Option<PodPhase>,
    },

    /// The pod's `portforward` subresource could not be dialed.
    #[error("can't create dialer: {0}")]
    Dialer(#[source] BoxError),

    /// The forwarding session could not be initialized.
    #[error("can't init port forward: {0}")]
    SessionInit(#[source] std::io::Error),

    /// The forwarding session did not report readiness in time.
    #[error("port forward not ready after {0:?}")]
    ReadyTimeout(Duration),

    /// The forwarding loop failed after it started.
    #[error("port forwarding failed: {0}")]
    Forward(#[source] BoxError),

    /// The request was already forwarded.
    #[error("port already forwarded")]
    AlreadyForwarded,
}

#[allow(clippy::ref_option)]
fn phase_suffix(phase: &Option<PodPhase>) -> String {
    phase.map(|p| format!(" (last pod phase: {p})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_ready_pod_message_includes_phase() {
        let err = Error::NoReadyPod {
            remote_port: 8080,
            last_phase: Some(PodPhase::Pending),
        };

        assert_eq!(
            err.to_string(),
            "no ready pod found for port 8080 (last pod phase: Pending)"
        );
    }

    #[test]
    fn no_ready_pod_message_without_phase() {
        let err = Error::NoReadyPod {
            remote_port: 8080,
            last_phase: None,
        };

        assert_eq!(err.to_string(), "no ready pod found for port 8080");
    }

    #[test]
    fn dialer_keeps_source() {
        use std::error::Error as _;

        let err = Error::Dialer(Box::new(std::io::Error::other("forbidden")));

        assert_eq!(err.to_string(), "can't create dialer: forbidden");
        assert_eq!(err.source().unwrap().to_string(), "forbidden");
    }

    #[test]
    fn kubeconfig_missing_names_path() {
        let err = Error::KubeconfigMissing(PathBuf::from("/nope/config"));
        assert_eq!(err.to_string(), "kubeconfig file /nope/config does not exist");
    }
}
