//! Top-level read operation: resolve the service, start the tunnel, and arm the
//! interrupt watcher.

use std::path::PathBuf;

use crate::cluster::{Cluster, KubeCluster};
use crate::config;
use crate::error::{Error, Result};
use crate::resolve;
use crate::signal::SignalWatcher;
use crate::tunnel::{Dialer, KubeDialer, PortPair, TunnelManager, TunnelOptions, TunnelSession};

/// Inputs and output flag of a port-forward read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortForwardRequest {
    /// Kubeconfig path. Defaults to `$HOME/.kube/config`.
    pub kube_config: Option<PathBuf>,

    /// Namespace of the service.
    pub namespace: String,

    /// Name of the service.
    pub service: String,

    /// Local port. `None` binds an ephemeral port.
    pub local_port: Option<u16>,

    /// Port on the pod.
    pub remote_port: u16,

    /// Set once the tunnel is forwarding. A request with this already set is
    /// refused.
    pub port_forwarded: bool,
}

impl PortForwardRequest {
    /// Creates a request with an ephemeral local port and the default kubeconfig.
    #[must_use]
    pub fn new(namespace: impl Into<String>, service: impl Into<String>, remote_port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            remote_port,
            ..Default::default()
        }
    }

    /// Sets the local port.
    #[must_use]
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    /// Sets the kubeconfig path.
    #[must_use]
    pub fn kube_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.kube_config = Some(path.into());
        self
    }

    fn ports(&self) -> PortPair {
        PortPair::new(self.local_port, self.remote_port)
    }
}

/// A forwarding tunnel together with its interrupt watcher.
///
/// Dropping this disarms the watcher but leaves the tunnel running until it is
/// closed.
#[derive(Debug)]
pub struct ActiveForward {
    /// The forwarding session.
    pub session: TunnelSession,

    /// Watcher that closes the session on interrupt.
    pub watcher: SignalWatcher,
}

/// Resolves services and starts tunnels against one cluster.
pub struct PortForward<C, D> {
    cluster: C,
    tunnels: TunnelManager<D>,
}

impl<C: Cluster, D: Dialer> PortForward<C, D> {
    /// Creates a port forwarder from a cluster and a tunnel manager.
    #[must_use]
    pub fn new(cluster: C, tunnels: TunnelManager<D>) -> Self {
        Self { cluster, tunnels }
    }

    /// Resolves the request's service and starts forwarding to it.
    ///
    /// On success `request.port_forwarded` is set. On failure nothing is
    /// changed and no session is left running.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyForwarded`] without any cluster call if the request was
    /// already forwarded, otherwise the first resolution or tunnel error.
    pub async fn read(&self, request: &mut PortForwardRequest) -> Result<ActiveForward> {
        if request.port_forwarded {
            return Err(Error::AlreadyForwarded);
        }

        tracing::debug!(
            "port forward request: namespace={} service={} local_port={:?} remote_port={}",
            request.namespace,
            request.service,
            request.local_port,
            request.remote_port
        );

        let target = resolve::resolve(
            &self.cluster,
            &request.namespace,
            &request.service,
            request.remote_port,
        )
        .await?;

        let session = self.tunnels.start(target, request.ports()).await?;
        let watcher = SignalWatcher::arm(session.handle());

        request.port_forwarded = true;
        tracing::info!("Kube port forwarded on {}", session.local_addr());

        Ok(ActiveForward { session, watcher })
    }
}

/// Runs a read against the cluster named by the request's kubeconfig.
///
/// # Errors
///
/// [`Error::AlreadyForwarded`] before the kubeconfig is even loaded, kubeconfig
/// errors, then anything [`PortForward::read`] returns.
pub async fn read(request: &mut PortForwardRequest) -> Result<ActiveForward> {
    read_with_options(request, TunnelOptions::default()).await
}

/// [`read`] with explicit tunnel options.
///
/// # Errors
///
/// See [`read`].
pub async fn read_with_options(
    request: &mut PortForwardRequest,
    options: TunnelOptions,
) -> Result<ActiveForward> {
    if request.port_forwarded {
        return Err(Error::AlreadyForwarded);
    }

    let client = config::connect(request.kube_config.as_deref()).await?;
    let forwarder = PortForward::new(
        KubeCluster::new(client.clone()),
        TunnelManager::with_options(KubeDialer::new(client), options),
    );

    forwarder.read(request).await
}
